//! Filter storage and refresh.
//!
//! Maintains the engine's current snapshot. On every refresh the storage
//! downloads the filter index, conditionally re-downloads each list (a 304
//! keeps the cached file), writes fresh payloads through to
//! `cache_dir/<id>` atomically, compiles everything, and publishes a new
//! snapshot in one swap. A list that fails to fetch or compile keeps its
//! previous compiled version; the refresh itself carries on. The data
//! plane is never failed by a refresh.
//!
//! Two nested deadlines apply: each individual fetch is capped at
//! [`LIST_FETCH_TIMEOUT`] while the whole refresh runs under the
//! configured `refresh_timeout`, so partial progress survives a slow
//! mirror.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Deserialize;

use crate::errcoll::ErrorCollector;
use crate::error::Error;
use crate::profile::{BlockedServiceId, FilterListId};

use super::rules::RuleList;
use super::safesearch::SafeSearch;
use super::{FilterEngine, Snapshot, ADULT_BLOCKING_LIST_ID, SAFE_BROWSING_LIST_ID};

/// The cap on each individual list fetch.
pub const LIST_FETCH_TIMEOUT: Duration = Duration::from_secs(30);

/// The filter index document.
#[derive(Debug, Deserialize)]
struct FilterIndex {
    filters: Vec<FilterIndexEntry>,
}

#[derive(Debug, Deserialize)]
struct FilterIndexEntry {
    #[serde(rename = "filterId")]
    filter_id: String,
    #[serde(rename = "downloadUrl")]
    download_url: String,
}

/// The blocked-service index document.
#[derive(Debug, Deserialize)]
struct ServiceIndex {
    blocked_services: Vec<ServiceIndexEntry>,
}

#[derive(Debug, Deserialize)]
struct ServiceIndexEntry {
    id: String,
    rules: Vec<String>,
}

/// Everything the storage needs to know at construction.
pub struct StorageConfig {
    pub filter_index_url: String,
    pub blocked_service_index_url: String,
    pub general_safe_search_url: String,
    pub youtube_safe_search_url: String,
    pub cache_dir: PathBuf,
    pub refresh_timeout: Duration,
    pub safe_browsing_block_host: String,
    pub adult_blocking_block_host: String,
}

/// Downloads, compiles, and publishes filter snapshots.
pub struct Storage {
    conf: StorageConfig,
    engine: Arc<FilterEngine>,
    errcoll: Arc<dyn ErrorCollector>,
    http: reqwest::Client,
    /// Last-Modified values per URL for conditional requests.
    last_modified: Mutex<HashMap<String, String>>,
}

impl Storage {
    pub fn new(
        conf: StorageConfig,
        engine: Arc<FilterEngine>,
        errcoll: Arc<dyn ErrorCollector>,
    ) -> Self {
        let http = reqwest::Client::builder()
            .timeout(LIST_FETCH_TIMEOUT)
            .build()
            .unwrap_or_default();

        Self {
            conf,
            engine,
            errcoll,
            http,
            last_modified: Mutex::new(HashMap::new()),
        }
    }

    /// Runs the refresh loop until cancelled, one refresh per interval,
    /// each under the configured overall timeout.
    pub async fn run(self: Arc<Self>, interval: Duration) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            self.refresh_with_timeout().await;
        }
    }

    /// One refresh under the overall `refresh_timeout` deadline. Failures
    /// are collected, never propagated: the previous snapshot stays up.
    pub async fn refresh_with_timeout(&self) {
        match tokio::time::timeout(self.conf.refresh_timeout, self.refresh()).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => self.errcoll.collect(&err),
            Err(_) => self.errcoll.collect(&Error::Internal(format!(
                "filter refresh timed out after {:?}",
                self.conf.refresh_timeout,
            ))),
        }
    }

    /// Builds and publishes a fresh snapshot.
    async fn refresh(&self) -> Result<(), Error> {
        tokio::fs::create_dir_all(&self.conf.cache_dir).await?;

        let previous = self.engine.snapshot();
        let mut next = Snapshot {
            safe_browsing_block_host: self.conf.safe_browsing_block_host.clone(),
            adult_blocking_block_host: self.conf.adult_blocking_block_host.clone(),
            ..Snapshot::default()
        };

        let index_text = self.fetch_text(&self.conf.filter_index_url, None).await?;
        let index: FilterIndex = serde_json::from_str(&index_text)
            .map_err(|err| Error::Internal(format!("parsing filter index: {err}")))?;

        for entry in &index.filters {
            let id = FilterListId(entry.filter_id.clone());
            let compiled = match self.refresh_list(&id, &entry.download_url).await {
                Ok(list) => Arc::new(list),
                Err(err) => {
                    self.errcoll.collect(&err);
                    match self.previous_list(&previous, &id) {
                        Some(prev) => prev,
                        None => continue,
                    }
                }
            };

            match id.0.as_str() {
                SAFE_BROWSING_LIST_ID => next.safe_browsing = Some(compiled),
                ADULT_BLOCKING_LIST_ID => next.adult_blocking = Some(compiled),
                _ => {
                    next.rule_lists.insert(id, compiled);
                }
            }
        }

        next.blocked_services = match self.refresh_services().await {
            Ok(services) => services,
            Err(err) => {
                self.errcoll.collect(&err);
                previous.blocked_services.clone()
            }
        };

        next.general_safe_search = self
            .refresh_safe_search("general_safe_search", &self.conf.general_safe_search_url)
            .await
            .unwrap_or_else(|err| {
                self.errcoll.collect(&err);
                SafeSearch::parse("")
            });
        next.youtube_safe_search = self
            .refresh_safe_search("youtube_safe_search", &self.conf.youtube_safe_search_url)
            .await
            .unwrap_or_else(|err| {
                self.errcoll.collect(&err);
                SafeSearch::parse("")
            });

        tracing::info!(
            rule_lists = next.rule_lists.len(),
            blocked_services = next.blocked_services.len(),
            "publishing filter snapshot",
        );
        self.engine.publish(next);

        Ok(())
    }

    fn previous_list(&self, previous: &Snapshot, id: &FilterListId) -> Option<Arc<RuleList>> {
        match id.0.as_str() {
            SAFE_BROWSING_LIST_ID => previous.safe_browsing.clone(),
            ADULT_BLOCKING_LIST_ID => previous.adult_blocking.clone(),
            _ => previous.rule_lists.get(id).cloned(),
        }
    }

    /// Conditionally downloads one list, writes it through to the cache
    /// directory, and compiles it.
    async fn refresh_list(&self, id: &FilterListId, url: &str) -> Result<RuleList, Error> {
        let cache_path = self.conf.cache_dir.join(&id.0);

        let text = match self.fetch_text(url, Some(&cache_path)).await {
            Ok(text) => {
                self.write_through(&cache_path, &text).await?;
                text
            }
            Err(err) => {
                // A stale cached copy beats no list at all.
                match tokio::fs::read_to_string(&cache_path).await {
                    Ok(cached) => {
                        self.errcoll.collect(&err);
                        cached
                    }
                    Err(_) => return Err(err),
                }
            }
        };

        RuleList::compile(id.clone(), &text)
    }

    async fn refresh_services(
        &self,
    ) -> Result<HashMap<BlockedServiceId, Arc<RuleList>>, Error> {
        let text = self
            .fetch_text(&self.conf.blocked_service_index_url, None)
            .await?;
        let index: ServiceIndex = serde_json::from_str(&text)
            .map_err(|err| Error::Internal(format!("parsing service index: {err}")))?;

        let mut services = HashMap::new();
        for entry in index.blocked_services {
            let id = FilterListId(format!("blocked_service:{}", entry.id));
            match RuleList::compile(id, &entry.rules.join("\n")) {
                Ok(list) => {
                    services.insert(BlockedServiceId(entry.id), Arc::new(list));
                }
                Err(err) => self.errcoll.collect(&err),
            }
        }

        Ok(services)
    }

    async fn refresh_safe_search(&self, name: &str, url: &str) -> Result<SafeSearch, Error> {
        let cache_path = self.conf.cache_dir.join(name);
        let text = match self.fetch_text(url, Some(&cache_path)).await {
            Ok(text) => {
                self.write_through(&cache_path, &text).await?;
                text
            }
            Err(err) => match tokio::fs::read_to_string(&cache_path).await {
                Ok(cached) => {
                    self.errcoll.collect(&err);
                    cached
                }
                Err(_) => return Err(err),
            },
        };

        Ok(SafeSearch::parse(&text))
    }

    /// GETs a URL as text. With a cache path, the request is conditional:
    /// on 304 the cached file is returned unchanged.
    async fn fetch_text(
        &self,
        url: &str,
        cache_path: Option<&std::path::Path>,
    ) -> Result<String, Error> {
        let mut req = self.http.get(url);
        if cache_path.is_some() {
            if let Some(since) = self.last_modified.lock().get(url) {
                req = req.header(reqwest::header::IF_MODIFIED_SINCE, since);
            }
        }

        let resp = req.send().await.map_err(|err| Error::FilterFetch {
            url: url.to_string(),
            source: err,
        })?;

        if resp.status() == reqwest::StatusCode::NOT_MODIFIED {
            if let Some(path) = cache_path {
                tracing::debug!(url, "not modified, using cached file");
                return Ok(tokio::fs::read_to_string(path).await?);
            }
        }

        let resp = resp.error_for_status().map_err(|err| Error::FilterFetch {
            url: url.to_string(),
            source: err,
        })?;

        if let Some(modified) = resp
            .headers()
            .get(reqwest::header::LAST_MODIFIED)
            .and_then(|v| v.to_str().ok())
        {
            self.last_modified
                .lock()
                .insert(url.to_string(), modified.to_string());
        }

        resp.text().await.map_err(|err| Error::FilterFetch {
            url: url.to_string(),
            source: err,
        })
    }

    /// Atomically replaces the cached file: write a temp file, then rename.
    async fn write_through(&self, path: &std::path::Path, text: &str) -> Result<(), Error> {
        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, text).await?;
        tokio::fs::rename(&tmp, path).await?;
        Ok(())
    }
}
