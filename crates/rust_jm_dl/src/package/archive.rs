//! Zip archives of decoded chapters, optionally AES-256 encrypted.

use crate::errors::{JmError, Result};

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use log::{debug, info, warn};
use zip::write::SimpleFileOptions;
use zip::{AesMode, CompressionMethod, ZipWriter};

/// A directory to archive, and where its contents go inside the archive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ZipSource {
    pub dir: PathBuf,
    /// e.g. `Some("chapter_2")`; `None` puts files at the archive root
    pub prefix: Option<String>,
}

impl ZipSource {
    pub fn new(dir: impl Into<PathBuf>, prefix: Option<String>) -> Self {
        Self {
            dir: dir.into(),
            prefix,
        }
    }
}

/// Files under `dir`, recursively, sorted by path. Leftover `.part` files are skipped.
fn walk(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    let mut stack = vec![dir.to_path_buf()];

    while let Some(current) = stack.pop() {
        for entry in fs::read_dir(&current)? {
            let path = entry?.path();

            if path.is_dir() {
                stack.push(path);
            } else if path.extension().is_none_or(|e| e != "part") {
                files.push(path);
            }
        }
    }

    files.sort();
    Ok(files)
}

fn entry_name(prefix: Option<&str>, relative: &Path) -> String {
    let relative = relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/");

    match prefix {
        Some(p) => format!("{}/{relative}", p.trim_end_matches('/')),
        None => relative,
    }
}

fn options(level: u8) -> SimpleFileOptions {
    if level == 0 {
        SimpleFileOptions::default().compression_method(CompressionMethod::Stored)
    } else {
        SimpleFileOptions::default()
            .compression_method(CompressionMethod::Deflated)
            .compression_level(Some(i64::from(level.min(9))))
    }
}

/// Writes `files` as `(path on disk, name in archive)` into a new archive at `out`.
fn write_zip(files: &[(PathBuf, String)], out: &Path, password: Option<&str>, level: u8) -> Result<()> {
    let mut zip = ZipWriter::new(File::create(out)?);

    for (path, name) in files {
        debug!("Adding {} as {name:?}", path.display());

        let bytes = fs::read(path)?;
        match password {
            Some(pw) => zip.start_file(
                name.as_str(),
                options(level).with_aes_encryption(AesMode::Aes256, pw),
            )?,
            None => zip.start_file(name.as_str(), options(level))?,
        }
        zip.write_all(&bytes)?;
    }

    zip.finish()?;
    Ok(())
}

/// Runs `write` on a blocking thread, removing a half-written `out` on failure.
async fn finish_blocking<F>(out: PathBuf, write: F) -> Result<PathBuf>
where
    F: FnOnce(&Path) -> Result<()> + Send + 'static,
{
    let target = out.clone();
    let result = tokio::task::spawn_blocking(move || write(&target)).await;

    match result {
        Ok(Ok(())) => Ok(out),
        Ok(Err(e)) => {
            warn!("Removing partial archive {}: {e}", out.display());
            let _ = tokio::fs::remove_file(&out).await;
            Err(e)
        }
        Err(e) => {
            let _ = tokio::fs::remove_file(&out).await;
            Err(JmError::Join(e))
        }
    }
}

/// Archives every source directory into `out`, in the given order.
///
/// `level` is 0 (stored) to 9 (smallest).
pub async fn build_zip(
    sources: Vec<ZipSource>,
    out: PathBuf,
    password: Option<String>,
    level: u8,
) -> Result<PathBuf> {
    info!("Building {} from {} source(s)", out.display(), sources.len());

    finish_blocking(out, move |out| {
        let mut files = Vec::new();
        for source in &sources {
            for path in walk(&source.dir)? {
                let relative = path.strip_prefix(&source.dir).unwrap_or(&path);
                let name = entry_name(source.prefix.as_deref(), relative);
                files.push((path, name));
            }
        }

        write_zip(&files, out, password.as_deref(), level)
    })
    .await
}

/// Archives a single file into `out`, at the archive root.
pub async fn archive_file(
    file: PathBuf,
    out: PathBuf,
    password: Option<String>,
    level: u8,
) -> Result<PathBuf> {
    info!("Archiving {} into {}", file.display(), out.display());

    finish_blocking(out, move |out| {
        let name = file
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| JmError::Io(std::io::Error::other("file has no name")))?;

        write_zip(&[(file, name)], out, password.as_deref(), level)
    })
    .await
}
