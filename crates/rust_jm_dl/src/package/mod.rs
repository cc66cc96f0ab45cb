//! Turns decoded chapters into deliverable files.

pub mod archive;
pub mod pdf;
pub mod pdf_security;

pub use archive::{ZipSource, archive_file, build_zip};
pub use pdf::build_pdf;
