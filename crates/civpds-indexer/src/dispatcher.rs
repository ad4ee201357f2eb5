//! Per-actor crawl scheduling.
//!
//! The dispatcher owns two maps behind one mutex: `todo` holds jobs waiting
//! for a worker and `in_progress` holds jobs a worker is running. A single
//! main loop is the only place jobs move between them, so at most one
//! worker ever handles a given actor. Firehose commits that arrive for an
//! actor with a queued or running job are attached to that job instead of
//! triggering another fetch.

use std::collections::{HashMap, VecDeque};
use std::mem;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use civpds_events::CommitEvent;
use civpds_types::{Did, Uid};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{IndexerError, IndexerResult};

/// A remote PDS host.
#[derive(Clone, Debug, PartialEq)]
pub struct Pds {
    pub id: u64,
    pub host: String,
    /// Permitted repo fetches per second.
    pub crawl_rate: f64,
}

/// An actor hosted on a remote PDS.
#[derive(Clone, Debug)]
pub struct CrawlTarget {
    pub actor: Uid,
    pub did: Did,
    pub pds: Arc<Pds>,
}

/// A firehose commit that must be applied in order with any crawl of its
/// actor.
#[derive(Clone, Debug)]
pub struct CatchupEvent {
    pub target: CrawlTarget,
    pub commit: CommitEvent,
}

#[derive(Default)]
struct Pending {
    /// Attached before the job was dispatched.
    catchup: Vec<CatchupEvent>,
    /// Attached while the job was running.
    next: Vec<CatchupEvent>,
}

/// One unit of crawl work for an actor.
pub struct CrawlJob {
    target: CrawlTarget,
    init_scrape: bool,
    pending: Mutex<Pending>,
}

impl CrawlJob {
    pub fn new(target: CrawlTarget, init_scrape: bool, catchup: Vec<CatchupEvent>) -> Self {
        Self {
            target,
            init_scrape,
            pending: Mutex::new(Pending {
                catchup,
                next: Vec::new(),
            }),
        }
    }

    pub fn target(&self) -> &CrawlTarget {
        &self.target
    }

    pub fn actor(&self) -> Uid {
        self.target.actor
    }

    /// Whether the job was created by a crawl request rather than by
    /// buffered commits alone.
    pub fn init_scrape(&self) -> bool {
        self.init_scrape
    }

    /// Take every buffered commit in arrival order, including those that
    /// arrived while the job was running.
    pub fn take_catchup(&self) -> Vec<CatchupEvent> {
        let mut pending = self.pending.lock().expect("lock poisoned");
        let mut out = mem::take(&mut pending.catchup);
        out.append(&mut pending.next);
        out
    }

    fn push_queued(&self, event: CatchupEvent) {
        self.pending
            .lock()
            .expect("lock poisoned")
            .catchup
            .push(event);
    }

    fn push_running(&self, event: CatchupEvent) {
        self.pending.lock().expect("lock poisoned").next.push(event);
    }
}

/// Fetches and indexes one actor's repository.
#[async_trait]
pub trait RepoIndexer: Send + Sync {
    async fn fetch_and_index(&self, job: &CrawlJob) -> IndexerResult<()>;
}

#[derive(Default)]
struct State {
    todo: HashMap<Uid, Arc<CrawlJob>>,
    in_progress: HashMap<Uid, Arc<CrawlJob>>,
}

struct Shared {
    state: Mutex<State>,
}

impl Shared {
    /// Record a crawl request; returns a job to queue when one was created.
    fn enqueue_crawl(&self, target: CrawlTarget) -> Option<Arc<CrawlJob>> {
        let mut state = self.state.lock().expect("lock poisoned");
        let actor = target.actor;
        if state.todo.contains_key(&actor) || state.in_progress.contains_key(&actor) {
            debug!(%actor, "crawl already scheduled");
            return None;
        }
        let job = Arc::new(CrawlJob::new(target, true, Vec::new()));
        state.todo.insert(actor, job.clone());
        Some(job)
    }

    /// Attach a commit to the actor's job or create a catchup-only job.
    fn add_catchup(&self, event: CatchupEvent) -> Option<Arc<CrawlJob>> {
        let mut state = self.state.lock().expect("lock poisoned");
        let actor = event.target.actor;
        if let Some(job) = state.todo.get(&actor) {
            job.push_queued(event);
            return None;
        }
        if let Some(job) = state.in_progress.get(&actor) {
            job.push_running(event);
            return None;
        }
        let job = Arc::new(CrawlJob::new(event.target.clone(), false, vec![event]));
        state.todo.insert(actor, job.clone());
        Some(job)
    }

    fn mark_dispatched(&self, job: &Arc<CrawlJob>) {
        let mut state = self.state.lock().expect("lock poisoned");
        state.todo.remove(&job.actor());
        state.in_progress.insert(job.actor(), job.clone());
    }

    /// Retire a finished job; commits left on it become a new job.
    fn complete(&self, actor: Uid) -> Option<Arc<CrawlJob>> {
        let mut state = self.state.lock().expect("lock poisoned");
        let job = state.in_progress.remove(&actor)?;
        let leftover = job.take_catchup();
        if leftover.is_empty() {
            return None;
        }
        debug!(%actor, events = leftover.len(), "requeueing leftover catchup");
        let next = Arc::new(CrawlJob::new(job.target.clone(), false, leftover));
        state.todo.insert(actor, next.clone());
        Some(next)
    }
}

/// Schedules crawl jobs over a fixed pool of workers.
pub struct CrawlDispatcher {
    ingest: mpsc::Sender<CrawlTarget>,
    catchup: mpsc::Sender<CatchupEvent>,
    shared: Arc<Shared>,
    shutdown: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl CrawlDispatcher {
    /// Start the main loop and `concurrency` workers on the current runtime.
    pub fn start(indexer: Arc<dyn RepoIndexer>, concurrency: usize) -> IndexerResult<Self> {
        if concurrency == 0 {
            return Err(IndexerError::ZeroConcurrency);
        }
        let shared = Arc::new(Shared {
            state: Mutex::new(State::default()),
        });
        let shutdown = CancellationToken::new();
        let (ingest_tx, ingest_rx) = mpsc::channel(1);
        let (catchup_tx, catchup_rx) = mpsc::channel(1);
        let (sync_tx, sync_rx) = mpsc::channel::<Arc<CrawlJob>>(1);
        let (complete_tx, complete_rx) = mpsc::channel(concurrency);

        let mut tasks = Vec::with_capacity(concurrency + 1);
        tasks.push(tokio::spawn(main_loop(
            shared.clone(),
            ingest_rx,
            catchup_rx,
            complete_rx,
            sync_tx,
            shutdown.clone(),
        )));
        let sync_rx = Arc::new(tokio::sync::Mutex::new(sync_rx));
        for worker in 0..concurrency {
            tasks.push(tokio::spawn(run_worker(
                worker,
                sync_rx.clone(),
                complete_tx.clone(),
                indexer.clone(),
                shutdown.clone(),
            )));
        }
        info!(concurrency, "crawl dispatcher started");

        Ok(Self {
            ingest: ingest_tx,
            catchup: catchup_tx,
            shared,
            shutdown,
            tasks: Mutex::new(tasks),
        })
    }

    /// Request a full crawl of `target`. Ignored if one is already
    /// scheduled.
    pub async fn crawl(&self, target: CrawlTarget) -> IndexerResult<()> {
        self.ingest
            .send(target)
            .await
            .map_err(|_| IndexerError::Closed)
    }

    /// Route a firehose commit through the dispatcher.
    pub async fn add_catchup(&self, event: CatchupEvent) -> IndexerResult<()> {
        self.catchup
            .send(event)
            .await
            .map_err(|_| IndexerError::Closed)
    }

    pub fn is_in_progress(&self, actor: Uid) -> bool {
        self.shared
            .state
            .lock()
            .expect("lock poisoned")
            .in_progress
            .contains_key(&actor)
    }

    pub fn is_queued(&self, actor: Uid) -> bool {
        self.shared
            .state
            .lock()
            .expect("lock poisoned")
            .todo
            .contains_key(&actor)
    }

    /// No job is queued or running.
    pub fn is_idle(&self) -> bool {
        let state = self.shared.state.lock().expect("lock poisoned");
        state.todo.is_empty() && state.in_progress.is_empty()
    }

    /// Stop the main loop and workers and wait for them to exit.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let tasks = mem::take(&mut *self.tasks.lock().expect("lock poisoned"));
        for task in tasks {
            let _ = task.await;
        }
        info!("crawl dispatcher stopped");
    }
}

impl Drop for CrawlDispatcher {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn main_loop(
    shared: Arc<Shared>,
    mut ingest: mpsc::Receiver<CrawlTarget>,
    mut catchup: mpsc::Receiver<CatchupEvent>,
    mut complete: mpsc::Receiver<Uid>,
    repo_sync: mpsc::Sender<Arc<CrawlJob>>,
    shutdown: CancellationToken,
) {
    let mut queue: VecDeque<Arc<CrawlJob>> = VecDeque::new();
    loop {
        let ready = !queue.is_empty();
        tokio::select! {
            _ = shutdown.cancelled() => return,
            Some(target) = ingest.recv() => {
                if let Some(job) = shared.enqueue_crawl(target) {
                    queue.push_back(job);
                }
            }
            Some(event) = catchup.recv() => {
                if let Some(job) = shared.add_catchup(event) {
                    queue.push_back(job);
                }
            }
            Some(actor) = complete.recv() => {
                if let Some(job) = shared.complete(actor) {
                    queue.push_back(job);
                }
            }
            permit = repo_sync.reserve(), if ready => {
                let Ok(permit) = permit else { return };
                if let Some(job) = queue.pop_front() {
                    shared.mark_dispatched(&job);
                    permit.send(job);
                }
            }
        }
    }
}

async fn run_worker(
    worker: usize,
    jobs: Arc<tokio::sync::Mutex<mpsc::Receiver<Arc<CrawlJob>>>>,
    complete: mpsc::Sender<Uid>,
    indexer: Arc<dyn RepoIndexer>,
    shutdown: CancellationToken,
) {
    loop {
        let job = {
            let mut jobs = jobs.lock().await;
            tokio::select! {
                _ = shutdown.cancelled() => return,
                job = jobs.recv() => job,
            }
        };
        let Some(job) = job else { return };
        let actor = job.actor();
        debug!(worker, %actor, init_scrape = job.init_scrape(), "crawl started");
        if let Err(e) = indexer.fetch_and_index(&job).await {
            warn!(worker, %actor, did = %job.target.did, pds = %job.target.pds.host, error = %e, "crawl failed");
        }
        if complete.send(actor).await.is_err() {
            return;
        }
    }
}
