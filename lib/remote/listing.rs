//! Directory listings served from the resolved accession payload.

use std::collections::HashMap;
use std::ffi::OsString;
use std::sync::Arc;
use std::time::SystemTime;

use accession_locator::models::{Accession, FileRecord};

use super::{DirectoryLister, FetchError, ListPage, ListedEntry};
use crate::fs::InodeKind;
use crate::fs::error::BuildError;

/// Parse the decimal size the resolver reports for `file`.
pub fn declared_size(accession: &Accession, file: &FileRecord) -> Result<u64, BuildError> {
    file.size
        .parse::<u64>()
        .map_err(|source| BuildError::InvalidMetadata {
            accession: accession.id.clone(),
            file: file.name.clone(),
            size: file.size.clone(),
            source,
        })
}

/// A [`DirectoryLister`] backed by the payload returned at startup.
///
/// The root lists one directory per accession and each accession directory lists its files.
/// Any other path lists as empty. Pages hold at most `page_size` entries; the continuation token
/// is the index of the next entry.
#[derive(Debug, Clone)]
pub struct PayloadLister {
    dirs: Arc<HashMap<String, Vec<ListedEntry>>>,
    page_size: usize,
}

impl PayloadLister {
    /// Default number of entries per page.
    pub const DEFAULT_PAGE_SIZE: usize = 1000;

    /// Build a lister for `payload`, stamping every entry with `listed_at`.
    pub fn new(
        payload: &[Accession],
        page_size: usize,
        listed_at: SystemTime,
    ) -> Result<Self, BuildError> {
        let mut dirs: HashMap<String, Vec<ListedEntry>> = HashMap::new();
        let mut root = Vec::with_capacity(payload.len());

        for accession in payload {
            root.push(ListedEntry {
                name: OsString::from(&accession.id),
                kind: InodeKind::Directory,
                size: 0,
                mtime: listed_at,
                etag: None,
                storage_class: None,
                link: None,
            });

            let files = accession
                .files
                .iter()
                .map(|file| {
                    Ok(ListedEntry {
                        name: OsString::from(&file.name),
                        kind: InodeKind::File,
                        size: declared_size(accession, file)?,
                        mtime: listed_at,
                        etag: file.md5.clone(),
                        storage_class: file.service.clone(),
                        link: Some(file.link.clone()),
                    })
                })
                .collect::<Result<Vec<_>, BuildError>>()?;
            dirs.entry(accession.id.clone()).or_default().extend(files);
        }
        dirs.insert(String::new(), root);

        Ok(Self {
            dirs: Arc::new(dirs),
            page_size: page_size.max(1),
        })
    }
}

impl DirectoryLister for PayloadLister {
    async fn list(&self, path: &str, continuation: Option<&str>) -> Result<ListPage, FetchError> {
        let start = match continuation {
            Some(token) => token
                .parse::<usize>()
                .map_err(|_| FetchError::Other(format!("bad continuation token {token:?}")))?,
            None => 0,
        };

        let Some(entries) = self.dirs.get(path) else {
            return Ok(ListPage::default());
        };
        if start >= entries.len() {
            return Ok(ListPage::default());
        }

        let end = start.saturating_add(self.page_size).min(entries.len());
        Ok(ListPage {
            entries: entries[start..end].to_vec(),
            continuation: Some(end.to_string()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload() -> Vec<Accession> {
        vec![Accession {
            id: "SRR1".to_owned(),
            files: (0..5)
                .map(|i| FileRecord {
                    name: format!("f{i}"),
                    size: (i * 10).to_string(),
                    link: format!("https://example.org/{i}"),
                    md5: None,
                    service: None,
                })
                .collect(),
            status: None,
            message: None,
        }]
    }

    #[tokio::test]
    async fn pages_until_sentinel() {
        let lister = PayloadLister::new(&payload(), 2, SystemTime::UNIX_EPOCH).unwrap();

        let mut names = Vec::new();
        let mut token = None;
        loop {
            let page = lister.list("SRR1", token.as_deref()).await.unwrap();
            if page.is_end() {
                break;
            }
            assert!(page.entries.len() <= 2);
            names.extend(page.entries.into_iter().map(|e| e.name));
            token = page.continuation;
        }
        assert_eq!(names, ["f0", "f1", "f2", "f3", "f4"]);
    }

    #[tokio::test]
    async fn root_lists_accessions_as_directories() {
        let lister = PayloadLister::new(&payload(), 10, SystemTime::UNIX_EPOCH).unwrap();
        let page = lister.list("", None).await.unwrap();
        assert_eq!(page.entries.len(), 1);
        assert_eq!(page.entries[0].kind, InodeKind::Directory);
    }

    #[tokio::test]
    async fn unknown_path_is_immediately_exhausted() {
        let lister = PayloadLister::new(&payload(), 10, SystemTime::UNIX_EPOCH).unwrap();
        assert!(lister.list("nope", None).await.unwrap().is_end());
    }

    #[test]
    fn bad_size_is_rejected() {
        let mut p = payload();
        p[0].files[3].size = "12x".to_owned();
        let err = PayloadLister::new(&p, 10, SystemTime::UNIX_EPOCH).unwrap_err();
        assert!(matches!(err, BuildError::InvalidMetadata { ref file, .. } if file == "f3"));
    }
}
