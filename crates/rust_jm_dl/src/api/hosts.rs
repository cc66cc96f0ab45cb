//! Contains [`HostList`], the shared list of candidate hosts.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{PoisonError, RwLock};

use log::{debug, info};
use tokio::sync::Mutex;
use url::Url;

use crate::errors::Result;

/// Turns `"www.a.vip"`, `"https://www.a.vip/"` etc. into `"https://www.a.vip"`.
///
/// Returns `None` for blanks and anything that doesn't parse as a url.
pub fn normalize_host(raw: &str) -> Option<String> {
    let raw = raw.trim().trim_end_matches('/');
    if raw.is_empty() {
        return None;
    }

    let with_scheme = if raw.contains("://") {
        raw.to_string()
    } else {
        format!("https://{raw}")
    };

    let url = Url::parse(&with_scheme).ok()?;
    url.host_str()?;

    Some(with_scheme)
}

/// What a call to [`HostList::refresh_with`] ended up doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Refresh {
    /// This caller fetched and installed a new list.
    Installed,
    /// Someone else replaced the list while this caller waited; nothing was fetched.
    AlreadyReplaced,
}

/// An ordered list of hosts that can be swapped out as a whole.
///
/// Readers always get a consistent snapshot together with its generation.
/// Refreshes are single-flight: of several callers that saw the same
/// generation fail, only the first one fetches, the rest reuse its result.
#[derive(Debug)]
pub struct HostList {
    hosts: RwLock<Vec<String>>,
    generation: AtomicU64,
    refresh_lock: Mutex<()>,
}

impl HostList {
    /// Builds a list from raw entries, dropping ones that don't normalise.
    pub fn new<I, S>(hosts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let hosts = hosts
            .into_iter()
            .filter_map(|h| normalize_host(h.as_ref()))
            .collect();

        Self {
            hosts: RwLock::new(hosts),
            generation: AtomicU64::new(0),
            refresh_lock: Mutex::new(()),
        }
    }

    /// The current hosts and the generation they belong to.
    pub fn snapshot(&self) -> (u64, Vec<String>) {
        let hosts = self.hosts.read().unwrap_or_else(PoisonError::into_inner);
        // read under the lock so the pair is consistent with `replace`
        (self.generation.load(Ordering::Acquire), hosts.clone())
    }

    pub fn current(&self) -> Vec<String> {
        self.snapshot().1
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Installs `hosts` and returns the new generation.
    pub fn replace(&self, hosts: Vec<String>) -> u64 {
        let mut guard = self.hosts.write().unwrap_or_else(PoisonError::into_inner);
        *guard = hosts;
        self.generation.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Fetches a new list with `fetch` unless the list already moved past
    /// `seen_generation`.
    ///
    /// An `Err` from `fetch` leaves the list untouched and is returned.
    pub async fn refresh_with<F, Fut>(&self, seen_generation: u64, fetch: F) -> Result<Refresh>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Vec<String>>>,
    {
        let _guard = self.refresh_lock.lock().await;

        if self.generation() != seen_generation {
            debug!("host list already refreshed past generation {seen_generation}");
            return Ok(Refresh::AlreadyReplaced);
        }

        let hosts = fetch().await?;
        let generation = self.replace(hosts.clone());
        info!("installed {} hosts (generation {generation}): {hosts:?}", hosts.len());

        Ok(Refresh::Installed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    use crate::errors::JmError;

    #[test]
    fn normalises_entries() {
        assert_eq!(normalize_host("www.a.vip").as_deref(), Some("https://www.a.vip"));
        assert_eq!(normalize_host(" http://b.cc/ ").as_deref(), Some("http://b.cc"));
        assert_eq!(normalize_host("http://127.0.0.1:8080").as_deref(), Some("http://127.0.0.1:8080"));
        assert_eq!(normalize_host("  "), None);
        assert_eq!(normalize_host("https://"), None);
    }

    #[test]
    fn replace_bumps_generation() {
        let list = HostList::new(["a.com", "", "b.com"]);
        assert_eq!(list.snapshot(), (0, vec!["https://a.com".into(), "https://b.com".into()]));

        assert_eq!(list.replace(vec!["https://c.com".into()]), 1);
        assert_eq!(list.snapshot(), (1, vec!["https://c.com".into()]));
    }

    #[tokio::test]
    async fn concurrent_refreshes_fetch_once() {
        let list = Arc::new(HostList::new(["a.com"]));
        let fetches = Arc::new(AtomicUsize::new(0));

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let list = Arc::clone(&list);
                let fetches = Arc::clone(&fetches);
                tokio::spawn(async move {
                    list.refresh_with(0, || async move {
                        fetches.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        Ok(vec!["https://new.com".to_string()])
                    })
                    .await
                })
            })
            .collect();

        let mut installed = 0;
        for t in tasks {
            if t.await.unwrap().unwrap() == Refresh::Installed {
                installed += 1;
            }
        }

        assert_eq!(installed, 1);
        assert_eq!(fetches.load(Ordering::SeqCst), 1);
        assert_eq!(list.snapshot(), (1, vec!["https://new.com".into()]));
    }

    #[tokio::test]
    async fn failed_fetch_keeps_old_list() {
        let list = HostList::new(["a.com"]);
        let r = list
            .refresh_with(0, || async { Err(JmError::HostDirectory("down".into())) })
            .await;

        assert!(matches!(r, Err(JmError::HostDirectory(_))));
        assert_eq!(list.snapshot(), (0, vec!["https://a.com".into()]));
    }
}
