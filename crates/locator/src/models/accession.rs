//! Name-resolution models.

use serde::{Deserialize, Serialize};

/// Body of a name-resolution request.
#[derive(Debug, Clone, Serialize)]
pub struct ResolveRequest<'a> {
    /// Accession identifiers to resolve.
    pub accessions: &'a [String],
    /// Cloud location the links should be valid for (e.g. `s3.us-east-1`).
    pub location: &'a str,
    /// Optional access token for controlled-access data.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<&'a str>,
}

/// One resolved accession and its files.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Accession {
    /// The accession identifier.
    #[serde(rename = "accession")]
    pub id: String,
    /// Files belonging to this accession, in service order.
    #[serde(default)]
    pub files: Vec<FileRecord>,
    /// Per-accession status code. Absent or `200` means resolved.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    /// Human-readable explanation accompanying a non-200 status.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl Accession {
    /// Whether the service resolved this accession successfully.
    #[must_use]
    pub fn is_resolved(&self) -> bool {
        self.status.is_none_or(|s| s == 200)
    }
}

/// A file within an [`Accession`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
    /// File name, unique within the accession.
    pub name: String,
    /// Decimal size in bytes. Kept as a string because that is what the service sends.
    pub size: String,
    /// Remote link the bytes are served from.
    pub link: String,
    /// Content checksum, surfaced as the file's entity tag.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub md5: Option<String>,
    /// Storage service or tier backing the link.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accession_decodes_service_payload() {
        let body = r#"[{
            "accession": "SRR000001",
            "status": 200,
            "files": [
                {"name": "SRR000001", "size": "1024", "link": "https://example.org/a", "md5": "abc"},
                {"name": "SRR000001.bam", "size": "2048", "link": "https://example.org/b", "service": "s3"}
            ]
        }]"#;
        let parsed: Vec<Accession> = serde_json::from_str(body).unwrap();
        assert_eq!(parsed.len(), 1);
        assert!(parsed[0].is_resolved());
        assert_eq!(parsed[0].files[0].md5.as_deref(), Some("abc"));
        assert_eq!(parsed[0].files[1].service.as_deref(), Some("s3"));
    }

    #[test]
    fn unresolved_status_is_reported() {
        let body = r#"{"accession": "SRR9", "status": 404, "message": "not found"}"#;
        let parsed: Accession = serde_json::from_str(body).unwrap();
        assert!(!parsed.is_resolved());
        assert!(parsed.files.is_empty());
    }
}
