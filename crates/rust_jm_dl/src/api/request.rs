//! Contains [`Requester`], which sends requests with bounded retry and
//! fails over across hosts.
//!
//! There are two layers:
//!
//! * [`Requester::request_with_retry`] talks to one url, retrying transient
//!   failures up to `max_retries` times.
//! * [`Requester::request_with_failover`] walks the host list, moving on
//!   whenever a host fails in a way that [`JmError::is_failover`] accepts.
//!   When every api host fails, the host list is refreshed from the
//!   directory once, and the walk restarts at the first new host.

use crate::api::crypto::decode_host_directory;
use crate::api::hosts::{HostList, Refresh};
use crate::config;
use crate::errors::{JmError, Result};

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use bytes::Bytes;
use log::{debug, error, info, trace, warn};
use reqwest::header::CONTENT_TYPE;
use reqwest::{Client, Method};
use url::Url;

/// Which host list a relative path is resolved against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostKind {
    Api,
    Image,
}

/// Everything about a request other than its url and method.
#[derive(Debug, Clone, Default)]
pub struct RequestOptions {
    pub query: Vec<(String, String)>,
    pub headers: Vec<(&'static str, String)>,
    /// Sent as an urlencoded body when non-empty.
    pub form: Vec<(String, String)>,
    /// Treat a successful but empty body as a host failure.
    pub require_body: bool,
}

impl RequestOptions {
    pub fn query(mut self, key: &str, value: impl ToString) -> Self {
        self.query.push((key.to_string(), value.to_string()));
        self
    }

    pub fn header(mut self, key: &'static str, value: impl Into<String>) -> Self {
        self.headers.push((key, value.into()));
        self
    }

    pub fn form(mut self, key: &str, value: impl Into<String>) -> Self {
        self.form.push((key.to_string(), value.into()));
        self
    }

    pub fn require_body(mut self) -> Self {
        self.require_body = true;
        self
    }
}

#[derive(Debug)]
/// A wrapper over [`reqwest::Client`] that owns the api and image host lists.
pub struct Requester {
    client: Client,
    api_hosts: HostList,
    image_hosts: HostList,
    directory_urls: Vec<Url>,
    directory_secret: String,
    max_retries: u32,
    unavailable_marker: String,
    retries: AtomicU64,
}

impl Requester {
    /// Creates a new [`Requester`] with [`reqwest::Client::builder()`]
    pub fn new(client_cfg: &config::Client) -> Result<Self> {
        let client = Client::builder()
            .user_agent(client_cfg.user_agent.clone())
            .timeout(Duration::from_secs(client_cfg.request_timeout_secs))
            .build()?;

        Ok(Self {
            client,
            api_hosts: HostList::new(&client_cfg.api_hosts),
            image_hosts: HostList::new(&client_cfg.image_hosts),
            directory_urls: client_cfg.directory_urls.clone(),
            directory_secret: client_cfg.directory_secret.clone(),
            max_retries: client_cfg.max_retries,
            unavailable_marker: client_cfg.backend_unavailable_marker.clone(),
            retries: AtomicU64::new(0),
        })
    }

    pub fn api_hosts(&self) -> &HostList {
        &self.api_hosts
    }

    pub fn image_hosts(&self) -> &HostList {
        &self.image_hosts
    }

    /// Retries logged so far, across every url.
    pub fn retries(&self) -> u64 {
        self.retries.load(Ordering::Relaxed)
    }

    fn hosts(&self, kind: HostKind) -> &HostList {
        match kind {
            HostKind::Api => &self.api_hosts,
            HostKind::Image => &self.image_hosts,
        }
    }

    /// Sends a request to one url, retrying up to `max_retries` times.
    ///
    /// The backend-unavailable marker ends the attempt loop immediately with
    /// [`JmError::BackendUnavailable`]; retrying the same host won't help.
    /// Every other failure is retried, and running out of attempts gives
    /// [`JmError::RetryExhausted`].
    pub async fn request_with_retry(
        &self,
        url: &Url,
        method: &Method,
        opts: &RequestOptions,
    ) -> Result<Bytes> {
        let form = if opts.form.is_empty() {
            None
        } else {
            Some(
                serde_urlencoded::to_string(&opts.form)
                    .map_err(|e| JmError::InvalidUrl(format!("{url}: {e}")))?,
            )
        };

        let mut attempt: u32 = 0;

        loop {
            match self.send_once(url, method, opts, form.as_deref()).await {
                Ok(body) => return Ok(body),
                Err(e @ JmError::BackendUnavailable { .. }) => {
                    warn!("{e}");
                    return Err(e);
                }
                Err(e) => {
                    if attempt >= self.max_retries {
                        error!("{method} {url} failed after {} attempts: {e}", attempt + 1);
                        return Err(JmError::RetryExhausted {
                            url: url.to_string(),
                            attempts: attempt + 1,
                        });
                    }

                    attempt += 1;
                    self.retries.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        "{method} {url} failed ({e}), retry {attempt}/{}",
                        self.max_retries
                    );
                }
            }
        }
    }

    async fn send_once(
        &self,
        url: &Url,
        method: &Method,
        opts: &RequestOptions,
        form: Option<&str>,
    ) -> Result<Bytes> {
        trace!("Sending {method} request, url={url}");

        let mut request = self.client.request(method.clone(), url.clone());
        for (key, value) in &opts.headers {
            request = request.header(*key, value);
        }
        if let Some(form) = form {
            request = request
                .header(CONTENT_TYPE, "application/x-www-form-urlencoded")
                .body(form.to_string());
        }

        let response = request.send().await?;
        let status = response.status();
        let body = response.bytes().await?;

        if self.is_backend_unavailable(&body) {
            return Err(JmError::BackendUnavailable {
                url: url.to_string(),
            });
        }

        if !status.is_success() {
            return Err(JmError::HttpStatus {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }

        Ok(body)
    }

    fn is_backend_unavailable(&self, body: &[u8]) -> bool {
        let marker = self.unavailable_marker.as_bytes();

        !marker.is_empty() && body.windows(marker.len()).any(|w| w == marker)
    }

    /// Sends a request to `path_or_url`, failing over across hosts.
    ///
    /// Absolute urls are sent as they are, with no failover. Relative paths
    /// are tried against each host of `kind` in order. If every api host
    /// fails, the host list is refreshed once and the walk restarts at
    /// index 0 of the new list; image hosts are never refreshed.
    pub async fn request_with_failover(
        &self,
        kind: HostKind,
        path_or_url: &str,
        method: Method,
        opts: &RequestOptions,
    ) -> Result<Bytes> {
        if path_or_url.starts_with("http://") || path_or_url.starts_with("https://") {
            let url = build_url(path_or_url, &opts.query)?;
            let body = self.request_with_retry(&url, &method, opts).await?;
            return check_body(&url, body, opts);
        }

        let list = self.hosts(kind);
        let mut refreshed = false;

        loop {
            let (generation, hosts) = list.snapshot();

            for (i, host) in hosts.iter().enumerate() {
                let url = build_url(&format!("{host}{path_or_url}"), &opts.query)?;

                let result = self
                    .request_with_retry(&url, &method, opts)
                    .await
                    .and_then(|body| check_body(&url, body, opts));

                match result {
                    Ok(body) => {
                        debug!("{path_or_url} served by host {}/{} ({host})", i + 1, hosts.len());
                        return Ok(body);
                    }
                    Err(e) if e.is_failover() => {
                        warn!(
                            "host {}/{} ({host}) failed for {path_or_url}: {e}",
                            i + 1,
                            hosts.len()
                        );
                    }
                    Err(e) => return Err(e),
                }
            }

            let all_failed = JmError::AllHostsFailed {
                path: path_or_url.to_string(),
            };

            if refreshed || kind == HostKind::Image || self.directory_urls.is_empty() {
                error!("{all_failed}");
                return Err(all_failed);
            }

            refreshed = true;
            warn!("all {} hosts failed for {path_or_url}, refreshing host list", hosts.len());

            match self.refresh_api_hosts(generation).await {
                Ok(_) => info!("restarting failover for {path_or_url} on the new host list"),
                Err(e) => {
                    error!("host list refresh failed: {e}");
                    return Err(all_failed);
                }
            }
        }
    }

    /// Replaces the api host list with the one published in the directory,
    /// unless someone else already did since `seen_generation`.
    pub async fn refresh_api_hosts(&self, seen_generation: u64) -> Result<Refresh> {
        self.api_hosts
            .refresh_with(seen_generation, || self.fetch_directory())
            .await
    }

    /// Asks each directory url in turn, returning the first list that decodes.
    async fn fetch_directory(&self) -> Result<Vec<String>> {
        let mut last_error = JmError::HostDirectory("no directory urls configured".into());

        for url in &self.directory_urls {
            debug!("fetching host directory from {url}");

            let fetched: Result<Vec<String>> = async {
                let response = self.client.get(url.clone()).send().await?;
                if !response.status().is_success() {
                    return Err(JmError::HttpStatus {
                        url: url.to_string(),
                        status: response.status().as_u16(),
                    });
                }
                let body = response.text().await?;
                decode_host_directory(&body, &self.directory_secret)
            }
            .await;

            match fetched {
                Ok(hosts) => return Ok(hosts),
                Err(e) => {
                    warn!("host directory {url} unusable: {e}");
                    last_error = e;
                }
            }
        }

        Err(last_error)
    }
}

fn build_url(raw: &str, query: &[(String, String)]) -> Result<Url> {
    let mut url = Url::parse(raw).map_err(|e| JmError::InvalidUrl(format!("{raw}: {e}")))?;

    if !query.is_empty() {
        url.query_pairs_mut().extend_pairs(query);
    }

    Ok(url)
}

fn check_body(url: &Url, body: Bytes, opts: &RequestOptions) -> Result<Bytes> {
    if opts.require_body && body.is_empty() {
        return Err(JmError::EmptyResponseBody {
            url: url.to_string(),
        });
    }

    Ok(body)
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::api::crypto::encrypt_text;

    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize;

    use httpmock::prelude::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    const MARKER: &str = "Could not connect to mysql";

    fn requester(api_hosts: Vec<String>, directory_urls: Vec<Url>, max_retries: u32) -> Requester {
        let cfg = config::Client {
            api_hosts,
            image_hosts: vec!["http://127.0.0.1:1".into()],
            directory_urls,
            max_retries,
            request_timeout_secs: 5,
            ..Default::default()
        };

        Requester::new(&cfg).unwrap()
    }

    /// Answers the first `failures` connections with a 500, then "ok".
    async fn flaky_server(failures: usize) -> (String, Arc<AtomicUsize>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);

        tokio::spawn(async move {
            loop {
                let Ok((mut socket, _)) = listener.accept().await else {
                    return;
                };
                let n = counter.fetch_add(1, Ordering::SeqCst);

                let mut buf = [0u8; 4096];
                let _ = socket.read(&mut buf).await;

                let response = if n < failures {
                    "HTTP/1.1 500 Internal Server Error\r\ncontent-length: 0\r\nconnection: close\r\n\r\n"
                } else {
                    "HTTP/1.1 200 OK\r\ncontent-length: 2\r\nconnection: close\r\n\r\nok"
                };
                let _ = socket.write_all(response.as_bytes()).await;
                let _ = socket.shutdown().await;
            }
        });

        (format!("http://{addr}"), hits)
    }

    #[tokio::test]
    async fn one_transient_failure_is_retried_once() {
        let (host, hits) = flaky_server(1).await;
        let r = requester(vec![host.clone()], vec![], 5);
        let url = Url::parse(&format!("{host}/album")).unwrap();

        let body = r
            .request_with_retry(&url, &Method::GET, &RequestOptions::default())
            .await
            .unwrap();

        assert_eq!(&body[..], b"ok");
        assert_eq!(hits.load(Ordering::SeqCst), 2);
        assert_eq!(r.retries(), 1);
    }

    #[tokio::test]
    async fn retries_stop_at_ceiling() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST).path("/album");
                then.status(500);
            })
            .await;

        let r = requester(vec![server.base_url()], vec![], 3);
        let url = Url::parse(&server.url("/album")).unwrap();
        let err = r
            .request_with_retry(&url, &Method::POST, &RequestOptions::default())
            .await
            .unwrap_err();

        assert!(matches!(err, JmError::RetryExhausted { attempts: 4, .. }));
        assert_eq!(mock.hits_async().await, 4);
        assert_eq!(r.retries(), 3);
    }

    #[tokio::test]
    async fn backend_unavailable_fails_over_without_retrying() {
        let a = MockServer::start_async().await;
        let b = MockServer::start_async().await;

        let a_mock = a
            .mock_async(|when, then| {
                when.path("/chapter").query_param("id", "7");
                then.status(200).body(format!("<b>{MARKER}</b>"));
            })
            .await;
        let b_mock = b
            .mock_async(|when, then| {
                when.path("/chapter").query_param("id", "7");
                then.status(200).body("payload");
            })
            .await;

        let r = requester(vec![a.base_url(), b.base_url()], vec![], 5);
        let before = r.api_hosts().snapshot();

        let body = r
            .request_with_failover(
                HostKind::Api,
                "/chapter",
                Method::POST,
                &RequestOptions::default().query("id", 7),
            )
            .await
            .unwrap();

        assert_eq!(&body[..], b"payload");
        assert_eq!(a_mock.hits_async().await, 1);
        assert_eq!(b_mock.hits_async().await, 1);
        assert_eq!(r.api_hosts().snapshot(), before);
        assert_eq!(r.retries(), 0);
    }

    #[tokio::test]
    async fn empty_body_fails_over_when_required() {
        let a = MockServer::start_async().await;
        let b = MockServer::start_async().await;

        a.mock_async(|when, then| {
            when.path("/media/photos/1/00001.webp");
            then.status(200);
        })
        .await;
        b.mock_async(|when, then| {
            when.path("/media/photos/1/00001.webp");
            then.status(200).body("img");
        })
        .await;

        let cfg = config::Client {
            image_hosts: vec![a.base_url(), b.base_url()],
            max_retries: 0,
            ..Default::default()
        };
        let r = Requester::new(&cfg).unwrap();

        let body = r
            .request_with_failover(
                HostKind::Image,
                "/media/photos/1/00001.webp",
                Method::GET,
                &RequestOptions::default().require_body(),
            )
            .await
            .unwrap();

        assert_eq!(&body[..], b"img");
    }

    #[tokio::test]
    async fn refresh_restarts_at_first_new_host() {
        let old = MockServer::start_async().await;
        let new_first = MockServer::start_async().await;
        let new_second = MockServer::start_async().await;
        let directory = MockServer::start_async().await;

        old.mock_async(|when, then| {
            when.path("/album");
            then.status(502);
        })
        .await;
        let first_mock = new_first
            .mock_async(|when, then| {
                when.path("/album");
                then.status(200).body("fresh");
            })
            .await;
        let second_mock = new_second
            .mock_async(|when, then| {
                when.path("/album");
                then.status(200).body("wrong host");
            })
            .await;

        let secret = config::Client::default().directory_secret;
        let listing = format!(
            r#"{{"Server":["{}","{}"]}}"#,
            new_first.base_url(),
            new_second.base_url()
        );
        let directory_body = encrypt_text(&listing, "", &secret);
        directory
            .mock_async(|when, then| {
                when.method(GET).path("/newsvr.txt");
                then.status(200).body(directory_body);
            })
            .await;

        let r = requester(
            vec![old.base_url()],
            vec![Url::parse(&directory.url("/newsvr.txt")).unwrap()],
            1,
        );

        let body = r
            .request_with_failover(HostKind::Api, "/album", Method::POST, &RequestOptions::default())
            .await
            .unwrap();

        assert_eq!(&body[..], b"fresh");
        assert_eq!(first_mock.hits_async().await, 1);
        assert_eq!(second_mock.hits_async().await, 0);
        assert_eq!(
            r.api_hosts().snapshot(),
            (1, vec![new_first.base_url(), new_second.base_url()])
        );
    }

    #[tokio::test]
    async fn failed_refresh_reports_all_hosts_failed() {
        let old = MockServer::start_async().await;
        let directory = MockServer::start_async().await;

        old.mock_async(|when, then| {
            when.path("/album");
            then.status(200).body(MARKER);
        })
        .await;
        let directory_mock = directory
            .mock_async(|when, then| {
                when.path("/newsvr.txt");
                then.status(200).body("not encrypted");
            })
            .await;

        let r = requester(
            vec![old.base_url()],
            vec![Url::parse(&directory.url("/newsvr.txt")).unwrap()],
            5,
        );

        let err = r
            .request_with_failover(HostKind::Api, "/album", Method::POST, &RequestOptions::default())
            .await
            .unwrap_err();

        assert!(matches!(err, JmError::AllHostsFailed { .. }));
        assert_eq!(directory_mock.hits_async().await, 1);
        assert_eq!(r.api_hosts().generation(), 0);
    }

    #[tokio::test]
    async fn error_status_exhausts_retries_then_hosts() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.path("/x");
                then.status(404);
            })
            .await;

        let r = requester(vec![server.base_url()], vec![], 0);
        let err = r
            .request_with_failover(HostKind::Api, "/x", Method::GET, &RequestOptions::default())
            .await
            .unwrap_err();

        assert!(matches!(err, JmError::AllHostsFailed { .. }));
    }

    #[tokio::test]
    async fn form_body_is_urlencoded() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/login")
                    .header("content-type", "application/x-www-form-urlencoded")
                    .body("username=a+b&password=p%26w");
                then.status(200).body("ok");
            })
            .await;

        let r = requester(vec![server.base_url()], vec![], 0);
        r.request_with_failover(
            HostKind::Api,
            "/login",
            Method::POST,
            &RequestOptions::default().form("username", "a b").form("password", "p&w"),
        )
        .await
        .unwrap();

        assert_eq!(mock.hits_async().await, 1);
    }
}
