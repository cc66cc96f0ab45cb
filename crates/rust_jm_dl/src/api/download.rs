//! Contains downloading and decoding of chapters, mainly through [`DownloadClient`]
//!
//! Both stages skip files that already exist with a nonzero size, so a
//! stage can be re-run after a partial failure and only does what's left.

use crate::api::{client::ApiClient, models::ChapterRecord};
use crate::config::Concurrency;
use crate::errors::{JmError, Result};
use crate::paths::is_complete;
use crate::scramble::descramble;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use indicatif::{ProgressBar, ProgressStyle};
use log::{debug, info, trace};
use tokio::{sync::Semaphore, task::JoinSet, time::Instant};

/// What a stage did for one chapter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StageReport {
    pub total: usize,
    /// Already complete on disk, left untouched.
    pub skipped: usize,
    pub processed: usize,
}

/// Constructs and returns a styled [`ProgressBar`]
///
/// Bars draw to stderr and stay hidden when it isn't a terminal.
fn progress_bar(length: usize, stage: &str) -> ProgressBar {
    let pb = ProgressBar::new(length as u64);
    let style = ProgressStyle::with_template(
        "{prefix:>9} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta})",
    )
    .map(|s| s.progress_chars("=>-"))
    .unwrap_or_else(|_| ProgressStyle::default_bar());

    pb.set_style(style);
    pb.set_prefix(stage.to_string());
    pb
}

/// Writes through a `.part` file so an interrupted write never looks complete.
async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let mut part = path.as_os_str().to_owned();
    part.push(".part");
    let part = PathBuf::from(part);

    tokio::fs::write(&part, bytes).await?;
    tokio::fs::rename(&part, path).await?;

    Ok(())
}

/// Waits for every task of a stage, stopping at the first failure.
///
/// Tasks still running when the set is dropped are aborted, so nothing keeps
/// writing into the work directory once the caller gives up on a stage.
async fn join_stage(mut set: JoinSet<Result<()>>, pb: &ProgressBar) -> Result<()> {
    let outcome = async {
        while let Some(res) = set.join_next().await {
            res??;
        }
        Ok::<(), JmError>(())
    }
    .await;

    pb.finish_and_clear();
    outcome
}

/// Handles downloading and decoding of chapters with bounded concurrency.
///
/// Downloads and decodes draw from separate semaphores, so one can't starve
/// the other when several chapters are in flight.
#[derive(Debug, Clone)]
pub struct DownloadClient {
    api: ApiClient,
    download_semaphore: Arc<Semaphore>,
    decode_semaphore: Arc<Semaphore>,
}

impl DownloadClient {
    pub fn new(api: ApiClient, concurrency: &Concurrency) -> Self {
        Self {
            api,
            download_semaphore: Arc::new(Semaphore::new(concurrency.download_permits)),
            decode_semaphore: Arc::new(Semaphore::new(concurrency.decode_permits)),
        }
    }

    pub fn api(&self) -> &ApiClient {
        &self.api
    }

    /// Indices of images whose file under `dir` is missing or empty.
    async fn pending(chapter: &ChapterRecord, dir: &Path) -> Vec<usize> {
        let mut pending = Vec::new();

        for (i, image) in chapter.images().iter().enumerate() {
            if !is_complete(&dir.join(&image.file)).await {
                pending.push(i);
            }
        }

        pending
    }

    /// Downloads every image of `chapter` that isn't in `origin_dir` yet.
    pub async fn download(&self, chapter: &ChapterRecord, origin_dir: &Path) -> Result<StageReport> {
        tokio::fs::create_dir_all(origin_dir).await?;

        let pending = Self::pending(chapter, origin_dir).await;
        let total = chapter.images().len();
        let report = StageReport {
            total,
            skipped: total - pending.len(),
            processed: pending.len(),
        };

        if pending.is_empty() {
            info!("Chapter {}: all {total} images already downloaded", chapter.id);
            return Ok(report);
        }

        info!(
            "Chapter {}: downloading {} images ({} cached) into {}",
            chapter.id,
            pending.len(),
            report.skipped,
            origin_dir.display()
        );

        let pb = Arc::new(progress_bar(pending.len(), "download"));
        let chapter_bytes = Arc::new(AtomicU64::new(0));
        let start = Instant::now();
        let mut set = JoinSet::new();

        for i in pending {
            // clone for async **move**
            let semaphore = Arc::clone(&self.download_semaphore);
            let api = self.api.clone();
            let pb = Arc::clone(&pb);
            let chapter_bytes = Arc::clone(&chapter_bytes);
            let file = chapter.images()[i].file.clone();
            let save = origin_dir.join(&file);
            let chapter_id = chapter.id;

            set.spawn(async move {
                let _permit = semaphore.acquire().await.map_err(|_| JmError::Cancelled)?;
                let data = api.fetch_image(chapter_id, &file).await?;

                trace!(
                    "chapter={chapter_id} file={file} dl_time_ms={} size={}",
                    start.elapsed().as_millis(),
                    data.len()
                );

                chapter_bytes.fetch_add(data.len() as u64, Ordering::Relaxed);
                write_atomic(&save, &data).await?;

                pb.inc(1);
                Ok::<(), JmError>(())
            });
        }

        join_stage(set, &pb).await?;

        info!(
            "Chapter {}: downloads completed in {}ms, total size is {:.3} MiB",
            chapter.id,
            start.elapsed().as_millis(),
            chapter_bytes.load(Ordering::Relaxed) as f64 / 1_048_576.0,
        );

        Ok(report)
    }

    /// Descrambles every image of `chapter` that isn't in `decoded_dir` yet.
    ///
    /// The scramble threshold is fetched fresh, but only when there's
    /// something left to decode.
    pub async fn decode(
        &self,
        chapter: &mut ChapterRecord,
        origin_dir: &Path,
        decoded_dir: &Path,
    ) -> Result<StageReport> {
        tokio::fs::create_dir_all(decoded_dir).await?;

        let pending = Self::pending(chapter, decoded_dir).await;
        let total = chapter.images().len();
        let report = StageReport {
            total,
            skipped: total - pending.len(),
            processed: pending.len(),
        };

        if pending.is_empty() {
            info!("Chapter {}: all {total} images already decoded", chapter.id);
            return Ok(report);
        }

        let threshold = self.api.request_scramble_threshold(chapter.id).await?;
        let split_counts = chapter.apply_threshold(threshold).to_vec();

        info!(
            "Chapter {}: decoding {} images ({} cached), threshold {threshold}",
            chapter.id,
            pending.len(),
            report.skipped
        );
        debug!("Chapter {} split counts: {split_counts:?}", chapter.id);

        let pb = Arc::new(progress_bar(pending.len(), "decode"));
        let start = Instant::now();
        let mut set = JoinSet::new();

        for i in pending {
            let semaphore = Arc::clone(&self.decode_semaphore);
            let pb = Arc::clone(&pb);
            let file = &chapter.images()[i].file;
            let source = origin_dir.join(file);
            let target = decoded_dir.join(file);
            // indexed by position in the full image list, never by position in `pending`
            let strip_count = split_counts[i];

            set.spawn(async move {
                let _permit = semaphore.acquire().await.map_err(|_| JmError::Cancelled)?;
                let raw = tokio::fs::read(&source).await?;

                let decoded = tokio::task::spawn_blocking(move || descramble(&raw, strip_count)).await??;
                write_atomic(&target, &decoded).await?;

                trace!("decoded {} with {strip_count} strips", target.display());
                pb.inc(1);
                Ok::<(), JmError>(())
            });
        }

        join_stage(set, &pb).await?;

        info!(
            "Chapter {}: decoding completed in {}ms",
            chapter.id,
            start.elapsed().as_millis()
        );

        Ok(report)
    }

    /// Downloads a chapter, then decodes it.
    pub async fn download_and_decode(
        &self,
        chapter: &mut ChapterRecord,
        origin_dir: &Path,
        decoded_dir: &Path,
    ) -> Result<(StageReport, StageReport)> {
        let downloaded = self.download(chapter, origin_dir).await?;
        let decoded = self.decode(chapter, origin_dir, decoded_dir).await?;

        Ok((downloaded, decoded))
    }
}
