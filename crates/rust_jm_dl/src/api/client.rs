//! Contains [`ApiClient`] struct for interacting with JM's app api.

use crate::api::crypto::{AuthHeaders, decrypt_payload};
use crate::api::endpoints::Endpoint;
use crate::api::models::{
    AlbumRecord, AlbumWire, BlogRecord, BlogWire, ChapterRecord, ChapterWire, Envelope, UserInfo,
};
use crate::api::request::{RequestOptions, Requester};
use crate::config;
use crate::errors::{JmError, Result, TargetKind};

use std::fmt;
use std::sync::{Arc, LazyLock};

use bytes::Bytes;
use chrono::Utc;
use log::{debug, info, trace};
use regex::Regex;
use serde::de::DeserializeOwned;

static SCRAMBLE_THRESHOLD: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"var scramble_id = (\d+);").expect("pattern is valid"));

/// Returns the timestamp (milliseconds) a request is signed with.
pub type Clock = Arc<dyn Fn() -> i64 + Send + Sync>;

#[derive(Clone)]
/// Signs requests, decrypts responses, and maps them into records.
///
/// Cloning is cheap; clones share the underlying [`Requester`] and its host lists.
pub struct ApiClient {
    requester: Arc<Requester>,
    cfg: Arc<config::Client>,
    clock: Clock,
}

impl fmt::Debug for ApiClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApiClient")
            .field("requester", &self.requester)
            .finish_non_exhaustive()
    }
}

impl ApiClient {
    pub fn new(client_cfg: &config::Client) -> Result<Self> {
        Ok(Self {
            requester: Arc::new(Requester::new(client_cfg)?),
            cfg: Arc::new(client_cfg.clone()),
            clock: Arc::new(|| Utc::now().timestamp_millis()),
        })
    }

    /// Replaces the clock requests are signed with.
    pub fn with_clock(mut self, clock: impl Fn() -> i64 + Send + Sync + 'static) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    pub fn requester(&self) -> &Requester {
        &self.requester
    }

    fn signed(&self, endpoint: &Endpoint, secret: &str) -> (i64, RequestOptions) {
        let timestamp = (self.clock)();
        let auth = AuthHeaders::new(timestamp, secret, &self.cfg.app_version);

        let opts = RequestOptions {
            query: endpoint.query(),
            ..Default::default()
        }
        .header("token", auth.token)
        .header("tokenparam", auth.tokenparam);

        (timestamp, opts)
    }

    /// Calls an api endpoint and decrypts the `data` of its envelope.
    ///
    /// `extend` can add to the signed options, e.g. a form body.
    pub(crate) async fn call_encrypted<T, F>(&self, endpoint: Endpoint, extend: F) -> Result<T>
    where
        T: DeserializeOwned,
        F: FnOnce(RequestOptions) -> RequestOptions,
    {
        let (timestamp, opts) = self.signed(&endpoint, &self.cfg.token_secret);
        let opts = extend(opts);

        debug!("calling {}", endpoint.as_string());

        let body = self
            .requester
            .request_with_failover(endpoint.host_kind(), &endpoint.path(), endpoint.method(), &opts)
            .await?;

        trace!("raw body of {}: {:?}", endpoint.as_string(), String::from_utf8_lossy(&body));

        let envelope: Envelope =
            serde_json::from_slice(&body).map_err(|_| JmError::PayloadNotFound)?;

        if envelope.code != 200 {
            return Err(JmError::Api {
                code: envelope.code,
                message: envelope.error_msg,
            });
        }

        let data = envelope.data.as_str().ok_or(JmError::PayloadNotFound)?;
        decrypt_payload(data, timestamp, &self.cfg.data_secret)
    }

    /// Fetches an album's metadata without fetching its chapters.
    pub async fn get_album_meta(&self, id: u64) -> Result<AlbumRecord> {
        info!("Fetching album {id}");

        let wire: AlbumWire = self
            .call_encrypted(Endpoint::Album(id), |o| o)
            .await
            .map_err(|e| not_found_as(e, TargetKind::Album, id))?;

        AlbumRecord::from_wire(wire, id)
    }

    /// Fetches an album and every one of its chapters, in declared order.
    ///
    /// Chapters are fetched one after another so the order is deterministic.
    pub async fn get_album(&self, id: u64) -> Result<AlbumRecord> {
        let mut album = self.get_album_meta(id).await?;
        let chapter_ids = album.chapter_ids();

        info!(
            "Album {id} ({:?}) has {} chapter(s)",
            album.name,
            chapter_ids.len()
        );

        for chapter_id in chapter_ids {
            let chapter = self.get_chapter(chapter_id).await?;
            album.push_chapter(chapter);
        }

        Ok(album)
    }

    pub async fn get_chapter(&self, id: u64) -> Result<ChapterRecord> {
        debug!("Fetching chapter {id}");

        let wire: ChapterWire = self
            .call_encrypted(Endpoint::Chapter(id), |o| o)
            .await
            .map_err(|e| not_found_as(e, TargetKind::Chapter, id))?;

        let chapter = ChapterRecord::from_wire(wire, id)?;
        debug!("Chapter {id} has {} images", chapter.images().len());

        Ok(chapter)
    }

    pub async fn get_blog(&self, id: u64) -> Result<BlogRecord> {
        info!("Fetching blog {id}");

        let wire: BlogWire = self
            .call_encrypted(Endpoint::Blog(id), |o| o)
            .await
            .map_err(|e| not_found_as(e, TargetKind::Blog, id))?;

        BlogRecord::from_wire(wire, id)
    }

    pub async fn login(&self, username: &str, password: &str) -> Result<UserInfo> {
        info!("Logging in as {username:?}");

        self.call_encrypted(Endpoint::Login, |o| {
            o.form("username", username).form("password", password)
        })
        .await
    }

    /// Fetches the scramble threshold from the chapter's reader page.
    ///
    /// This isn't cached; call it right before decoding each chapter.
    pub async fn request_scramble_threshold(&self, chapter_id: u64) -> Result<u64> {
        let endpoint = Endpoint::ChapterViewTemplate(chapter_id);
        let (_, opts) = self.signed(&endpoint, &self.cfg.content_token_secret);

        let body = self
            .requester
            .request_with_failover(endpoint.host_kind(), &endpoint.path(), endpoint.method(), &opts)
            .await?;
        let html = String::from_utf8_lossy(&body);

        let threshold = SCRAMBLE_THRESHOLD
            .captures(&html)
            .and_then(|c| c.get(1))
            .and_then(|m| m.as_str().parse::<u64>().ok())
            .ok_or(JmError::ThresholdMissing { chapter_id })?;

        debug!("scramble threshold for chapter {chapter_id} is {threshold}");
        Ok(threshold)
    }

    /// Fetches the raw (still scrambled) bytes of one image.
    pub async fn fetch_image(&self, chapter_id: u64, file: &str) -> Result<Bytes> {
        let endpoint = Endpoint::Image {
            chapter_id,
            file: file.to_string(),
        };
        let opts = RequestOptions::default().require_body();

        self.requester
            .request_with_failover(endpoint.host_kind(), &endpoint.path(), endpoint.method(), &opts)
            .await
    }
}

/// Undecryptable payloads are how the api says an id doesn't exist.
fn not_found_as(e: JmError, kind: TargetKind, id: u64) -> JmError {
    match e {
        JmError::PayloadNotFound => JmError::NotExist {
            kind,
            id: id.to_string(),
        },
        other => other,
    }
}
