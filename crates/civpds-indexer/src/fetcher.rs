//! Rate-limited repository fetching.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use civpds_events::CommitEvent;
use civpds_types::{Did, Tid, Uid};
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use tracing::{debug, info, warn};

use crate::dispatcher::{CatchupEvent, CrawlJob, CrawlTarget, Pds, RepoIndexer};
use crate::error::{IndexerError, IndexerResult};

/// Downloads repository CARs from remote hosts.
#[async_trait]
pub trait RepoSource: Send + Sync {
    /// Fetch `did`'s repository, limited to commits after `since` when
    /// given.
    async fn fetch_repo(&self, pds: &Pds, did: &Did, since: Option<&Tid>) -> IndexerResult<Bytes>;
}

/// Applies fetched data to local storage.
#[async_trait]
pub trait ExternalRepoApplier: Send + Sync {
    /// Revision of the actor's current local head, if any.
    async fn current_rev(&self, actor: Uid) -> IndexerResult<Option<Tid>>;

    /// Import a fetched CAR. `since` is `None` for a full sync.
    async fn import_repo(
        &self,
        target: &CrawlTarget,
        car: Bytes,
        since: Option<Tid>,
    ) -> IndexerResult<()>;

    /// Apply one firehose commit.
    async fn apply_commit(&self, target: &CrawlTarget, commit: &CommitEvent) -> IndexerResult<()>;
}

/// [`RepoIndexer`] that fetches from a [`RepoSource`] under a per-host
/// token bucket and applies through an [`ExternalRepoApplier`].
pub struct RepoFetcher {
    source: Arc<dyn RepoSource>,
    applier: Arc<dyn ExternalRepoApplier>,
    limiters: Mutex<HashMap<String, Arc<DefaultDirectRateLimiter>>>,
}

impl RepoFetcher {
    pub fn new(source: Arc<dyn RepoSource>, applier: Arc<dyn ExternalRepoApplier>) -> Self {
        Self {
            source,
            applier,
            limiters: Mutex::new(HashMap::new()),
        }
    }

    fn limiter(&self, pds: &Pds) -> IndexerResult<Arc<DefaultDirectRateLimiter>> {
        let mut limiters = self.limiters.lock().expect("lock poisoned");
        if let Some(limiter) = limiters.get(&pds.host) {
            return Ok(limiter.clone());
        }
        let invalid = || IndexerError::InvalidCrawlRate(pds.crawl_rate, pds.host.clone());
        if !(pds.crawl_rate.is_finite() && pds.crawl_rate > 0.0) {
            return Err(invalid());
        }
        // `with_period` allows a burst of one.
        let quota = Quota::with_period(Duration::from_secs_f64(1.0 / pds.crawl_rate))
            .ok_or_else(invalid)?;
        let limiter = Arc::new(RateLimiter::direct(quota));
        limiters.insert(pds.host.clone(), limiter.clone());
        Ok(limiter)
    }

    async fn fetch(&self, target: &CrawlTarget, since: Option<&Tid>) -> IndexerResult<Bytes> {
        self.limiter(&target.pds)?.until_ready().await;
        debug!(did = %target.did, pds = %target.pds.host, since = ?since, "fetching repo");
        self.source.fetch_repo(&target.pds, &target.did, since).await
    }

    async fn full_resync(&self, target: &CrawlTarget) -> IndexerResult<()> {
        info!(did = %target.did, pds = %target.pds.host, "full repo resync");
        let car = self.fetch(target, None).await?;
        self.applier.import_repo(target, car, None).await
    }

    /// Fetch and import the repository. Returns whether a full resync was
    /// performed.
    async fn sync_repo(&self, target: &CrawlTarget, rev: Option<Tid>) -> IndexerResult<bool> {
        let Some(rev) = rev else {
            self.full_resync(target).await?;
            return Ok(true);
        };
        let car = self.fetch(target, Some(&rev)).await?;
        match self.applier.import_repo(target, car, Some(rev.clone())).await {
            Ok(()) => Ok(false),
            Err(e) if e.is_not_found() => {
                warn!(did = %target.did, pds = %target.pds.host, rev = %rev, error = %e, "partial repo fetch was missing data");
                self.full_resync(target).await?;
                Ok(true)
            }
            Err(e) => Err(e),
        }
    }

    /// Apply commits newer than the local head, in order.
    async fn apply_events(
        &self,
        target: &CrawlTarget,
        events: &[CatchupEvent],
        resynced: &mut bool,
    ) -> IndexerResult<()> {
        let mut current = self
            .applier
            .current_rev(target.actor)
            .await?
            .map(|rev| rev.as_str().to_string());
        let mut i = 0;
        while let Some(event) = events.get(i) {
            if current
                .as_deref()
                .is_some_and(|cur| event.commit.rev.as_str() <= cur)
            {
                debug!(did = %target.did, rev = %event.commit.rev, "skipping already applied commit");
                i += 1;
                continue;
            }
            match self.applier.apply_commit(target, &event.commit).await {
                Ok(()) => {
                    current = Some(event.commit.rev.clone());
                    i += 1;
                }
                Err(e) if e.is_not_found() && !*resynced => {
                    warn!(did = %target.did, seq = event.commit.seq, error = %e, "catchup missing data");
                    *resynced = true;
                    self.full_resync(target).await?;
                    // Retry the same commit against the resynced head.
                    current = self
                        .applier
                        .current_rev(target.actor)
                        .await?
                        .map(|rev| rev.as_str().to_string());
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Apply buffered commits until none remain on the job.
    async fn drain(&self, job: &CrawlJob, resynced: &mut bool) -> IndexerResult<()> {
        loop {
            let events = job.take_catchup();
            if events.is_empty() {
                return Ok(());
            }
            self.apply_events(job.target(), &events, resynced).await?;
        }
    }
}

#[async_trait]
impl RepoIndexer for RepoFetcher {
    async fn fetch_and_index(&self, job: &CrawlJob) -> IndexerResult<()> {
        let target = job.target();
        let rev = self.applier.current_rev(target.actor).await?;
        let mut resynced = false;
        let mut events = Vec::new();

        if !job.init_scrape() {
            events = job.take_catchup();
            let contiguous = events.first().is_some_and(|first| {
                first.commit.since.is_none()
                    || first.commit.since.as_deref() == rev.as_ref().map(Tid::as_str)
            });
            if contiguous {
                match self.apply_events(target, &events, &mut resynced).await {
                    Ok(()) => return self.drain(job, &mut resynced).await,
                    Err(e) => {
                        warn!(did = %target.did, error = %e, "buffered catchup failed, falling back to repo sync");
                    }
                }
                if resynced {
                    return self.drain(job, &mut resynced).await;
                }
            } else if !events.is_empty() {
                debug!(did = %target.did, "catchup does not follow local head, syncing repo");
            }
        }

        resynced |= self.sync_repo(target, rev).await?;
        self.apply_events(target, &events, &mut resynced).await?;
        self.drain(job, &mut resynced).await
    }
}

/// [`RepoSource`] over HTTP `com.atproto.sync.getRepo`.
pub struct HttpRepoSource {
    client: reqwest::Client,
    scheme: String,
}

impl HttpRepoSource {
    pub fn new(client: reqwest::Client) -> Self {
        Self {
            client,
            scheme: "https".into(),
        }
    }

    /// Use plain HTTP, for local hosts.
    pub fn insecure(mut self) -> Self {
        self.scheme = "http".into();
        self
    }

    pub fn repo_url(&self, pds: &Pds) -> String {
        format!("{}://{}/xrpc/com.atproto.sync.getRepo", self.scheme, pds.host)
    }
}

#[async_trait]
impl RepoSource for HttpRepoSource {
    async fn fetch_repo(&self, pds: &Pds, did: &Did, since: Option<&Tid>) -> IndexerResult<Bytes> {
        let mut request = self
            .client
            .get(self.repo_url(pds))
            .query(&[("did", did.as_str())]);
        if let Some(since) = since {
            request = request.query(&[("since", since.as_str())]);
        }
        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(IndexerError::Status {
                host: pds.host.clone(),
                status: status.as_u16(),
            });
        }
        Ok(response.bytes().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use civpds_events::now_rfc3339;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn pds(rate: f64) -> Arc<Pds> {
        Arc::new(Pds {
            id: 1,
            host: "pds.example".into(),
            crawl_rate: rate,
        })
    }

    fn target() -> CrawlTarget {
        CrawlTarget {
            actor: Uid::new(7),
            did: Did::parse("did:plc:aaa").unwrap(),
            pds: pds(1000.0),
        }
    }

    fn commit(rev: &str, since: Option<&str>) -> CommitEvent {
        CommitEvent {
            seq: 1,
            repo: "did:plc:aaa".into(),
            rev: rev.into(),
            since: since.map(str::to_string),
            blocks: Vec::new(),
            ops: Vec::new(),
            commit: civpds_types::cid_for_cbor(rev.as_bytes()),
            too_big: false,
            time: now_rfc3339(),
        }
    }

    #[derive(Default)]
    struct FakeSource {
        calls: Mutex<Vec<Option<String>>>,
    }

    #[async_trait]
    impl RepoSource for FakeSource {
        async fn fetch_repo(&self, _pds: &Pds, _did: &Did, since: Option<&Tid>) -> IndexerResult<Bytes> {
            self.calls
                .lock()
                .unwrap()
                .push(since.map(|t| t.as_str().to_string()));
            Ok(Bytes::from_static(b"car"))
        }
    }

    #[derive(Default)]
    struct FakeApplier {
        rev: Mutex<Option<Tid>>,
        partial_import_fails: bool,
        missing_commit_rev: Option<String>,
        imports: Mutex<Vec<Option<String>>>,
        applied: Mutex<Vec<String>>,
        fails: AtomicUsize,
    }

    #[async_trait]
    impl ExternalRepoApplier for FakeApplier {
        async fn current_rev(&self, _actor: Uid) -> IndexerResult<Option<Tid>> {
            Ok(self.rev.lock().unwrap().clone())
        }

        async fn import_repo(&self, _t: &CrawlTarget, _car: Bytes, since: Option<Tid>) -> IndexerResult<()> {
            self.imports
                .lock()
                .unwrap()
                .push(since.as_ref().map(|t| t.as_str().to_string()));
            if since.is_some() && self.partial_import_fails {
                self.fails.fetch_add(1, Ordering::SeqCst);
                return Err(IndexerError::MissingBlock("bafy".into()));
            }
            Ok(())
        }

        async fn apply_commit(&self, _t: &CrawlTarget, commit: &CommitEvent) -> IndexerResult<()> {
            if self.missing_commit_rev.as_deref() == Some(commit.rev.as_str())
                && self.fails.fetch_add(1, Ordering::SeqCst) == 0
            {
                return Err(IndexerError::MissingBlock("bafy".into()));
            }
            self.applied.lock().unwrap().push(commit.rev.clone());
            Ok(())
        }
    }

    fn tid(s: &str) -> Tid {
        Tid::parse(s).unwrap()
    }

    fn job(init_scrape: bool, commits: Vec<CommitEvent>) -> CrawlJob {
        let events = commits
            .into_iter()
            .map(|commit| CatchupEvent {
                target: target(),
                commit,
            })
            .collect();
        CrawlJob::new(target(), init_scrape, events)
    }

    #[test]
    fn invalid_crawl_rate_is_rejected() {
        let fetcher = RepoFetcher::new(Arc::new(FakeSource::default()), Arc::new(FakeApplier::default()));
        assert!(matches!(
            fetcher.limiter(&pds(0.0)),
            Err(IndexerError::InvalidCrawlRate(..))
        ));
        assert!(fetcher.limiter(&pds(5.0)).is_ok());
    }

    #[tokio::test]
    async fn init_scrape_imports_then_applies_newer_catchup() {
        let source = Arc::new(FakeSource::default());
        let applier = Arc::new(FakeApplier {
            rev: Mutex::new(Some(tid("3kaaaaaaaaaaa"))),
            ..FakeApplier::default()
        });
        let fetcher = RepoFetcher::new(source.clone(), applier.clone());
        let job = job(
            true,
            vec![commit("3kaaaaaaaaaaa", None), commit("3kbbbbbbbbbbb", None)],
        );
        fetcher.fetch_and_index(&job).await.unwrap();

        assert_eq!(*source.calls.lock().unwrap(), vec![Some("3kaaaaaaaaaaa".to_string())]);
        assert_eq!(*applier.applied.lock().unwrap(), vec!["3kbbbbbbbbbbb".to_string()]);
    }

    #[tokio::test]
    async fn contiguous_catchup_skips_fetch() {
        let source = Arc::new(FakeSource::default());
        let applier = Arc::new(FakeApplier {
            rev: Mutex::new(Some(tid("3kaaaaaaaaaaa"))),
            ..FakeApplier::default()
        });
        let fetcher = RepoFetcher::new(source.clone(), applier.clone());
        let job = job(false, vec![commit("3kbbbbbbbbbbb", Some("3kaaaaaaaaaaa"))]);
        fetcher.fetch_and_index(&job).await.unwrap();

        assert!(source.calls.lock().unwrap().is_empty());
        assert_eq!(applier.applied.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn gap_in_catchup_falls_back_to_sync() {
        let source = Arc::new(FakeSource::default());
        let applier = Arc::new(FakeApplier {
            rev: Mutex::new(Some(tid("3kaaaaaaaaaaa"))),
            ..FakeApplier::default()
        });
        let fetcher = RepoFetcher::new(source.clone(), applier.clone());
        let job = job(false, vec![commit("3kccccccccccc", Some("3kbbbbbbbbbbb"))]);
        fetcher.fetch_and_index(&job).await.unwrap();

        assert_eq!(source.calls.lock().unwrap().len(), 1);
        assert_eq!(*applier.applied.lock().unwrap(), vec!["3kccccccccccc".to_string()]);
    }

    #[tokio::test]
    async fn missing_data_on_partial_import_resyncs_once() {
        let source = Arc::new(FakeSource::default());
        let applier = Arc::new(FakeApplier {
            rev: Mutex::new(Some(tid("3kaaaaaaaaaaa"))),
            partial_import_fails: true,
            ..FakeApplier::default()
        });
        let fetcher = RepoFetcher::new(source.clone(), applier.clone());
        fetcher.fetch_and_index(&job(true, Vec::new())).await.unwrap();

        assert_eq!(
            *source.calls.lock().unwrap(),
            vec![Some("3kaaaaaaaaaaa".to_string()), None]
        );
        assert_eq!(
            *applier.imports.lock().unwrap(),
            vec![Some("3kaaaaaaaaaaa".to_string()), None]
        );
    }

    #[tokio::test]
    async fn missing_data_during_catchup_resyncs_once() {
        let source = Arc::new(FakeSource::default());
        let applier = Arc::new(FakeApplier {
            rev: Mutex::new(None),
            missing_commit_rev: Some("3kbbbbbbbbbbb".into()),
            ..FakeApplier::default()
        });
        let fetcher = RepoFetcher::new(source.clone(), applier.clone());
        let job = job(false, vec![commit("3kbbbbbbbbbbb", None)]);
        fetcher.fetch_and_index(&job).await.unwrap();

        assert_eq!(*source.calls.lock().unwrap(), vec![None]);
        assert_eq!(*applier.applied.lock().unwrap(), vec!["3kbbbbbbbbbbb".to_string()]);
    }
}
