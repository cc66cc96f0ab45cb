//! Contains file locations and other file-related utilities.

use crate::errors::TargetKind;

use std::path::{Path, PathBuf};
use std::sync::LazyLock;

static PROJECT_ROOT: LazyLock<PathBuf> =
    LazyLock::new(|| Path::new(env!("CARGO_MANIFEST_DIR")).to_path_buf());

static DOWNLOAD_SAVE: LazyLock<PathBuf> = LazyLock::new(|| PROJECT_ROOT.join("jmcomic"));
static LOG_SAVE: LazyLock<PathBuf> = LazyLock::new(|| PROJECT_ROOT.join("log"));
static CONFIG: LazyLock<PathBuf> = LazyLock::new(|| PROJECT_ROOT.join("config.toml"));

/// NOTE: This currently uses the `"CARGO_MANIFEST_DIR"` environment variable.
///
/// This environment variable doesn't exist in release binaries.

pub fn download_save_dir() -> &'static Path {
    &DOWNLOAD_SAVE
}
pub fn log_save_dir() -> &'static Path {
    &LOG_SAVE
}
pub fn config_toml() -> &'static Path {
    &CONFIG
}

/// The working directory of one job target:
///
/// `{root}/{kind}/{id}/{origin|decoded}[/{chapter_id}]`
///
/// Multi-chapter albums keep each chapter in its own subdirectory;
/// single chapters (and single-chapter albums) don't.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkDir {
    base: PathBuf,
}

impl WorkDir {
    pub fn new(root: &Path, kind: TargetKind, id: &str) -> Self {
        Self {
            base: root.join(kind.dir_name()).join(id),
        }
    }

    /// `{root}/{kind}/{id}`, where packaged files end up.
    pub fn base(&self) -> &Path {
        &self.base
    }

    /// Where raw (still scrambled) images are stored.
    pub fn origin(&self, sub_chapter: Option<u64>) -> PathBuf {
        Self::with_sub(self.base.join("origin"), sub_chapter)
    }

    /// Where descrambled images are stored.
    pub fn decoded(&self, sub_chapter: Option<u64>) -> PathBuf {
        Self::with_sub(self.base.join("decoded"), sub_chapter)
    }

    fn with_sub(dir: PathBuf, sub_chapter: Option<u64>) -> PathBuf {
        match sub_chapter {
            Some(id) => dir.join(id.to_string()),
            None => dir,
        }
    }
}

/// A file counts as done if it exists and isn't empty; there are no checksums.
pub async fn is_complete(path: &Path) -> bool {
    tokio::fs::metadata(path)
        .await
        .is_ok_and(|m| m.is_file() && m.len() > 0)
}
