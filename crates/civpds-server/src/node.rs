use std::sync::Arc;
use std::time::Duration;

use civpds_carstore::{CarStore, CarStoreConfig, ShardIndex};
use civpds_crypto::{
    DirectoryClient, DirectoryKeyResolver, HttpDirectory, KeyManager, KeyManagerConfig, LocalKms,
    MemDirectory,
};
use civpds_events::{
    connect, subscribe_uri, ConsumerConfig, DiskPersister, DiskPersisterConfig, EventManager,
    EventManagerConfig, EventResult, FirehoseConsumer, MemPersister, Persister,
};
use civpds_indexer::{CatchupForwarder, CrawlDispatcher, HttpRepoSource, Pds, RepoFetcher};
use civpds_repomgr::{EventManagerSink, MemActorDirectory, RepoManager, RepoManagerConfig};
use civpds_store::FsObjectStorage;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::NodeConfig;
use crate::error::ServerResult;

/// A running node: every core component wired together.
pub struct Node {
    config: NodeConfig,
    carstore: Arc<CarStore>,
    keys: Arc<KeyManager>,
    events: EventManager,
    repos: Arc<RepoManager>,
    crawler: Arc<CrawlDispatcher>,
    plc: Arc<dyn DirectoryClient>,
    shutdown: CancellationToken,
}

impl Node {
    /// Open storage under the configured data directory and start the
    /// background tasks.
    pub async fn open(config: NodeConfig) -> ServerResult<Self> {
        let storage = &config.storage;
        tokio::fs::create_dir_all(&storage.data_dir).await?;

        let index = ShardIndex::open(storage.db_path())?;
        let shards = Arc::new(FsObjectStorage::open(storage.shards_dir()).await?);
        let carstore = CarStore::new(
            index,
            shards,
            CarStoreConfig {
                prefetch: storage.prefetch,
                prefetch_limit: storage.prefetch_limit_bytes,
            },
        );

        let key_config = KeyManagerConfig {
            signing_ttl: Duration::from_secs(config.keys.signing_ttl_secs),
            encrypted_ttl: Duration::from_secs(config.keys.encrypted_ttl_secs),
            sweep_interval: Duration::from_secs(config.keys.sweep_interval_secs),
            ..KeyManagerConfig::default()
        };
        let kms = Arc::new(LocalKms::new());
        kms.add_master_key(&key_config.actor_key_alias, config.keys.master_key()?);
        match config.keys.directory_key()? {
            Some(secret) => kms.add_signing_key(&key_config.directory_key_alias, &secret)?,
            None => {
                warn!("no directory key configured; using an ephemeral one");
                kms.generate_signing_key(&key_config.directory_key_alias);
            }
        }
        let keystore = Arc::new(FsObjectStorage::open(storage.keystore_dir()).await?);
        let keys = KeyManager::new(kms, keystore, key_config);

        let persister: Arc<dyn Persister> = match &config.events.persist_dir {
            Some(dir) => Arc::new(DiskPersister::open(dir, DiskPersisterConfig::default())?),
            None => Arc::new(MemPersister::new()),
        };
        let events = EventManager::new(
            persister,
            EventManagerConfig {
                subscriber_buffer: config.events.subscriber_buffer,
                crossover_buffer: config.events.crossover_buffer,
                ..EventManagerConfig::default()
            },
        );

        let plc: Arc<dyn DirectoryClient> = match &config.keys.plc_url {
            Some(url) => Arc::new(HttpDirectory::new(reqwest::Client::new(), url.clone())),
            None => {
                warn!("no directory url configured; using an in-process directory");
                Arc::new(MemDirectory::new())
            }
        };
        let resolver = DirectoryKeyResolver::new(keys.clone(), plc.clone())
            .with_ttl(Duration::from_secs(config.keys.signing_ttl_secs));
        let repos = Arc::new(
            RepoManager::new(
                carstore.clone(),
                keys.clone(),
                Arc::new(resolver),
                Arc::new(MemActorDirectory::new()),
                Arc::new(EventManagerSink::new(events.clone())),
                RepoManagerConfig {
                    profile_collection: config.repo.profile_collection.clone(),
                    ..RepoManagerConfig::default()
                },
            )
            .with_accounts(keys.clone(), plc.clone()),
        );

        let fetcher = RepoFetcher::new(
            Arc::new(HttpRepoSource::new(reqwest::Client::new())),
            repos.clone(),
        );
        let crawler = Arc::new(CrawlDispatcher::start(
            Arc::new(fetcher),
            config.crawl.concurrency,
        )?);

        info!(
            data_dir = %storage.data_dir.display(),
            crawl_workers = config.crawl.concurrency,
            "node opened"
        );
        Ok(Self {
            config,
            carstore,
            keys,
            events,
            repos,
            crawler,
            plc,
            shutdown: CancellationToken::new(),
        })
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn carstore(&self) -> &Arc<CarStore> {
        &self.carstore
    }

    pub fn keys(&self) -> &Arc<KeyManager> {
        &self.keys
    }

    pub fn events(&self) -> &EventManager {
        &self.events
    }

    pub fn repos(&self) -> &Arc<RepoManager> {
        &self.repos
    }

    pub fn crawler(&self) -> &Arc<CrawlDispatcher> {
        &self.crawler
    }

    pub fn directory_client(&self) -> &Arc<dyn DirectoryClient> {
        &self.plc
    }

    /// Token cancelled by [`Node::shutdown`].
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// A remote host, using the default crawl rate unless one is declared.
    pub fn remote_pds(&self, id: u64, host: impl Into<String>, crawl_rate: Option<f64>) -> Arc<Pds> {
        Arc::new(Pds {
            id,
            host: host.into(),
            crawl_rate: crawl_rate.unwrap_or(self.config.crawl.default_crawl_rate),
        })
    }

    /// Follow a remote host's firehose, feeding commits for mirrored actors
    /// into the crawl dispatcher. The task ends on shutdown or when the
    /// connection fails.
    pub fn follow_firehose(&self, pds: Arc<Pds>, cursor: Option<i64>) -> JoinHandle<EventResult<()>> {
        let forwarder = CatchupForwarder::new(self.crawler.clone(), pds.clone(), self.repos.clone());
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            let uri = subscribe_uri(&pds.host, cursor);
            let ws = connect(&uri).await?;
            info!(pds = %pds.host, ?cursor, "following firehose");
            let mut consumer = FirehoseConsumer::new(forwarder, ConsumerConfig::default());
            let result = consumer.run(ws, shutdown).await;
            if let Err(e) = &result {
                warn!(pds = %pds.host, cursor = ?consumer.cursor(), error = %e, transient = e.is_transient(), "firehose ended");
            }
            result
        })
    }

    /// Stop background work and flush the event log.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        self.crawler.shutdown().await;
        self.events.shutdown();
        if let Err(e) = self.events.persister().flush().await {
            warn!(error = %e, "failed to flush event log");
        }
        self.keys.flush().await;
        info!("node stopped");
    }
}
