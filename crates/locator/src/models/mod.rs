//! Request and response models.

mod accession;

pub use accession::{Accession, FileRecord, ResolveRequest};
