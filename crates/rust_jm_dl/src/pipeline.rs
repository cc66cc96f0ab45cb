//! Contains [`Pipeline`], which turns a queued job into delivered files.
//!
//! A job goes `fetched → downloading → decoding → packaged`. Every stage
//! skips work that's already on disk, so a failed job can be re-submitted
//! and picks up where it stopped.

use crate::api::client::ApiClient;
use crate::api::download::DownloadClient;
use crate::api::models::{AlbumRecord, AlbumSummary, ChapterRecord};
use crate::config::{Config, OutputFormat};
use crate::errors::{JmError, Result, TargetKind};
use crate::package::{ZipSource, archive_file, build_pdf, build_zip};
use crate::paths::WorkDir;
use crate::queue::{JobPayload, Processor};

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use futures::FutureExt;
use futures::future::BoxFuture;
use log::{info, warn};
use sanitise_file_name::sanitise;
use tokio::sync::OwnedMutexGuard;

/// Files produced for one job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub kind: TargetKind,
    pub target_id: u64,
    /// In chapter order when a multi-chapter album yields several files.
    pub files: Vec<PathBuf>,
    /// `{root}/{kind}/{id}`, removed by [`Pipeline::cleanup`].
    pub work_dir: PathBuf,
}

/// Hands finished files to whoever asked for them.
pub type Deliver = Arc<dyn Fn(JobPayload, Delivery) -> BoxFuture<'static, Result<()>> + Send + Sync>;

type TargetLocks = Mutex<HashMap<(TargetKind, u64), Arc<tokio::sync::Mutex<()>>>>;

/// Exclusive hold on one target. Dropping it forgets the target's lock
/// unless another job is already waiting on it.
struct TargetGuard<'a> {
    locks: &'a TargetLocks,
    key: (TargetKind, u64),
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for TargetGuard<'_> {
    fn drop(&mut self) {
        drop(self.guard.take());

        // waiters clone the lock under the map lock, so the count is stable here
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        if locks.get(&self.key).is_some_and(|l| Arc::strong_count(l) == 1) {
            locks.remove(&self.key);
        }
    }
}

#[derive(Debug)]
pub struct Pipeline {
    downloader: DownloadClient,
    cfg: Config,
    in_flight: TargetLocks,
}

fn parse_id(kind: TargetKind, raw: &str) -> Result<u64> {
    raw.trim().parse().map_err(|_| JmError::NotExist {
        kind,
        id: raw.to_string(),
    })
}

/// Decoded image paths of a chapter, in page order.
fn decoded_images(chapter: &ChapterRecord, dir: &Path) -> Vec<PathBuf> {
    chapter.images().iter().map(|i| dir.join(&i.file)).collect()
}

impl Pipeline {
    pub fn new(cfg: Config) -> Result<Self> {
        let api = ApiClient::new(&cfg.client)?;
        Ok(Self::with_api(api, cfg))
    }

    /// Builds a pipeline around an existing client, e.g. one with a fixed clock.
    pub fn with_api(api: ApiClient, cfg: Config) -> Self {
        Self {
            downloader: DownloadClient::new(api, &cfg.concurrency),
            cfg,
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    pub fn api(&self) -> &ApiClient {
        self.downloader.api()
    }

    /// Serialises work on the same target; different targets don't wait on each other.
    async fn lock_target(&self, kind: TargetKind, id: u64) -> TargetGuard<'_> {
        let key = (kind, id);
        let lock = {
            let mut locks = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
            Arc::clone(locks.entry(key).or_default())
        };

        TargetGuard {
            locks: &self.in_flight,
            key,
            guard: Some(lock.lock_owned().await),
        }
    }

    /// Album metadata for a quick look, without fetching chapters.
    pub async fn album_summary(&self, id: u64) -> Result<AlbumSummary> {
        let album = self.api().get_album_meta(id).await?;
        Ok(AlbumSummary::from(&album))
    }

    /// Runs one job to completion and returns what it produced.
    pub async fn run(&self, payload: &JobPayload) -> Result<Delivery> {
        let id = parse_id(payload.kind, &payload.target_id)?;
        let _guard = self.lock_target(payload.kind, id).await;

        let work = WorkDir::new(&self.cfg.output.root, payload.kind, &id.to_string());
        let files = match payload.kind {
            TargetKind::Album => self.run_album(id, &work).await?,
            TargetKind::Chapter => self.run_chapter(id, &work).await?,
            TargetKind::Blog => self.run_blog(id, &work).await?,
        };

        info!("{} {id}: packaged into {} file(s)", payload.kind, files.len());

        Ok(Delivery {
            kind: payload.kind,
            target_id: id,
            files,
            work_dir: work.base().to_path_buf(),
        })
    }

    async fn run_album(&self, id: u64, work: &WorkDir) -> Result<Vec<PathBuf>> {
        let mut album = self.api().get_album(id).await?;
        info!(
            "Album {id}: fetched {:?} with {} chapter(s), {} pages",
            album.name,
            album.chapters().len(),
            album.page_count()
        );

        let multi = album.chapters().len() > 1;

        // one chapter at a time, in declared order
        for chapter in album.chapters_mut() {
            let sub = multi.then_some(chapter.id);
            self.downloader
                .download_and_decode(chapter, &work.origin(sub), &work.decoded(sub))
                .await?;
        }

        info!("Album {id}: decoded, packaging as {:?}", self.cfg.output.format);

        match self.cfg.output.format {
            OutputFormat::Pdf => self.album_to_pdf(&album, work).await,
            OutputFormat::Zip => self.album_to_zip(&album, work).await.map(|p| vec![p]),
        }
    }

    /// One pdf per chapter; several chapters get `_1`, `_2`, ... suffixes.
    async fn album_to_pdf(&self, album: &AlbumRecord, work: &WorkDir) -> Result<Vec<PathBuf>> {
        let chapters = album.chapters();

        if let [chapter] = chapters {
            let out = work.base().join(format!("{}.pdf", sanitise(&chapter.name)));
            let pdf = build_pdf(
                decoded_images(chapter, &work.decoded(None)),
                self.cfg.output.password.clone(),
                out,
            )
            .await?;
            return Ok(vec![pdf]);
        }

        let mut paths = Vec::with_capacity(chapters.len());
        for (i, chapter) in chapters.iter().enumerate() {
            let name = sanitise(&format!("{}_{}", chapter.name, i + 1));
            let pdf = build_pdf(
                decoded_images(chapter, &work.decoded(Some(chapter.id))),
                self.cfg.output.password.clone(),
                work.base().join(format!("{name}.pdf")),
            )
            .await?;
            paths.push(pdf);
        }

        Ok(paths)
    }

    /// One archive; several chapters each get a `chapter_<sort>` directory.
    async fn album_to_zip(&self, album: &AlbumRecord, work: &WorkDir) -> Result<PathBuf> {
        let sources = if album.chapters().len() > 1 {
            album
                .chapters()
                .iter()
                .enumerate()
                .map(|(i, chapter)| {
                    let sort = album
                        .chapter_refs
                        .iter()
                        .find(|r| r.id == chapter.id)
                        .map_or(i + 1, |r| r.sort as usize);

                    ZipSource::new(work.decoded(Some(chapter.id)), Some(format!("chapter_{sort}")))
                })
                .collect()
        } else {
            vec![ZipSource::new(work.decoded(None), None)]
        };

        let out = work.base().join(format!("{}.zip", sanitise(&album.name)));
        build_zip(
            sources,
            out,
            self.cfg.output.password.clone(),
            self.cfg.output.level,
        )
        .await
    }

    async fn run_chapter(&self, id: u64, work: &WorkDir) -> Result<Vec<PathBuf>> {
        let mut chapter = self.api().get_chapter(id).await?;
        info!("Chapter {id}: fetched {:?}, {} pages", chapter.name, chapter.images().len());

        let decoded = work.decoded(None);
        self.downloader
            .download_and_decode(&mut chapter, &work.origin(None), &decoded)
            .await?;

        let name = sanitise(&chapter.name);
        let out = match self.cfg.output.format {
            OutputFormat::Pdf => {
                build_pdf(
                    decoded_images(&chapter, &decoded),
                    self.cfg.output.password.clone(),
                    work.base().join(format!("{name}.pdf")),
                )
                .await?
            }
            OutputFormat::Zip => {
                build_zip(
                    vec![ZipSource::new(decoded, None)],
                    work.base().join(format!("{name}.zip")),
                    self.cfg.output.password.clone(),
                    self.cfg.output.level,
                )
                .await?
            }
        };

        Ok(vec![out])
    }

    /// Blogs are plain text, archived on their own when the output format is zip.
    async fn run_blog(&self, id: u64, work: &WorkDir) -> Result<Vec<PathBuf>> {
        let blog = self.api().get_blog(id).await?;
        info!("Blog {id}: fetched {:?}", blog.title);

        tokio::fs::create_dir_all(work.base()).await?;

        let name = sanitise(&blog.title);
        let text = work.base().join(format!("{name}.txt"));
        tokio::fs::write(&text, blog.to_text()).await?;

        let out = match self.cfg.output.format {
            OutputFormat::Pdf => text,
            OutputFormat::Zip => {
                archive_file(
                    text,
                    work.base().join(format!("{name}.zip")),
                    self.cfg.output.password.clone(),
                    self.cfg.output.level,
                )
                .await?
            }
        };

        Ok(vec![out])
    }

    /// Removes a job's working directory unless `keep_cache` is set.
    pub async fn cleanup(&self, delivery: &Delivery) -> Result<()> {
        if self.cfg.output.keep_cache {
            return Ok(());
        }

        match tokio::fs::remove_dir_all(&delivery.work_dir).await {
            Ok(()) => {
                info!("Removed {}", delivery.work_dir.display());
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Adapts the pipeline into a queue processor: run, deliver, then clean up.
    pub fn into_processor(self: Arc<Self>, deliver: Deliver) -> Processor {
        Arc::new(move |payload: JobPayload| {
            let pipeline = Arc::clone(&self);
            let deliver = Arc::clone(&deliver);

            async move {
                let delivery = pipeline.run(&payload).await?;
                deliver(payload, delivery.clone()).await?;

                if let Err(e) = pipeline.cleanup(&delivery).await {
                    warn!("Couldn't clean up {}: {e}", delivery.work_dir.display());
                }
                Ok(())
            }
            .boxed()
        })
    }
}
