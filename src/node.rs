use std::sync::Arc;

use chrono::Utc;
use rand::RngCore;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::activity::ActivityLog;
use crate::auth::{AuthResolver, MemoryAuthRecords, StoreAuthResolver};
use crate::config::ServerConfig;
use crate::dispatcher::{router, DispatcherState};
use crate::error::Result;
use crate::event::{Event, SweepEvent};
use crate::store::{FsStore, ObjectStore, UrlSigner};
use crate::worker::{InvokeAck, Invoker, JobExecutor, JobRunner, Registry, Worker, WorkerPool};

/// One server process: dispatcher, worker pool, and the periodic tasks.
pub struct Node {
    pub config: ServerConfig,
    pub store: Arc<dyn ObjectStore>,
    pub auth: Arc<dyn AuthResolver>,
    pub registry: Registry,
    pub signer: UrlSigner,
}

impl Node {
    /// Build a node from configuration: a filesystem store under
    /// `data_dir`, auth records from `auth_file`, and the signing key.
    pub async fn new(config: ServerConfig, registry: Registry) -> Result<Self> {
        tokio::fs::create_dir_all(&config.data_dir).await?;
        let store: Arc<dyn ObjectStore> = Arc::new(FsStore::new(&config.data_dir));

        let records = match &config.auth_file {
            Some(path) => MemoryAuthRecords::load(path).await?,
            None => {
                tracing::warn!("No auth file configured, every request will be rejected");
                MemoryAuthRecords::new()
            }
        };
        let auth: Arc<dyn AuthResolver> = Arc::new(StoreAuthResolver::new(records));

        let key = match &config.signing_key {
            Some(hex_key) => UrlSigner::key_from_hex(hex_key)?,
            None => {
                let mut key = [0u8; 32];
                rand::thread_rng().fill_bytes(&mut key);
                key
            }
        };
        let signer = UrlSigner::new(&config.public_url, key)?;

        Ok(Self::with_parts(config, store, auth, registry, signer))
    }

    pub fn with_parts(
        config: ServerConfig,
        store: Arc<dyn ObjectStore>,
        auth: Arc<dyn AuthResolver>,
        registry: Registry,
        signer: UrlSigner,
    ) -> Self {
        Self {
            config,
            store,
            auth,
            registry,
            signer,
        }
    }

    /// Bind `listen_addr` and serve until `shutdown`.
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        let listener = TcpListener::bind(self.config.listen_addr).await?;
        self.serve(listener, shutdown).await
    }

    /// Run the node with all components on an already bound listener.
    ///
    /// 1. Starts the worker pool that executes jobs
    /// 2. Starts the activity flush loop
    /// 3. Starts the sweep timer, which submits a sweep event through the
    ///    same pool as jobs
    /// 4. Serves HTTP until `shutdown`, then lets in-flight jobs finish
    ///    and flushes activity one last time
    pub async fn serve(self, listener: TcpListener, shutdown: CancellationToken) -> Result<()> {
        let http = reqwest::Client::new();
        let executor = JobExecutor::new(self.registry.clone(), self.config.job.timeout);
        let runner = JobRunner::new(executor, self.store.clone(), http, self.config.job.clone());
        let worker = Arc::new(Worker::new(runner, self.store.clone()));
        let (pool, pool_handle) = WorkerPool::start(
            worker,
            self.config.worker_concurrency,
            self.config.queue_capacity,
            shutdown.clone(),
        );
        let invoker: Arc<dyn Invoker> = Arc::new(pool);

        let activity = ActivityLog::new(self.store.clone());
        let flush_handle =
            activity.spawn_flush_loop(self.config.activity_flush_interval, shutdown.clone());
        let sweep_handle = tokio::spawn(Self::sweep_loop(
            invoker.clone(),
            self.config.clone(),
            shutdown.clone(),
        ));

        let state = DispatcherState {
            auth: self.auth.clone(),
            store: self.store.clone(),
            invoker,
            registry: self.registry.clone(),
            signer: self.signer.clone(),
            activity: activity.clone(),
            unauthorized_delay: self.config.unauthorized_delay,
            read_url_ttl: self.config.read_url_ttl,
        };

        let addr = listener.local_addr()?;
        tracing::info!(addr = %addr, public_url = %self.config.public_url, data_dir = %self.config.data_dir.display(), "Starting server");
        axum::serve(listener, router(state))
            .with_graceful_shutdown(shutdown.clone().cancelled_owned())
            .await?;

        tracing::info!("HTTP server stopped, waiting for workers");
        shutdown.cancel();
        for (name, handle) in [("pool", pool_handle), ("activity", flush_handle), ("sweep", sweep_handle)] {
            if let Err(e) = handle.await {
                tracing::error!(task = name, error = %e, "Background task failed");
            }
        }
        // Requests that finished during the drain were recorded after the
        // flush loop's last pass.
        if let Err(e) = activity.flush().await {
            tracing::warn!(error = %e, "Activity flush after drain failed");
        }
        Ok(())
    }

    /// Sweep timer: every `sweep_interval`, submit a sweep of objects older
    /// than `job_retention`.
    async fn sweep_loop(invoker: Arc<dyn Invoker>, config: ServerConfig, shutdown: CancellationToken) {
        let mut interval =
            tokio::time::interval(config.sweep_interval.max(std::time::Duration::from_secs(1)));
        interval.tick().await;
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {}
            }
            let retention = match chrono::Duration::from_std(config.job_retention) {
                Ok(retention) => retention,
                Err(e) => {
                    tracing::error!(error = %e, "Job retention out of range, sweep disabled");
                    break;
                }
            };
            let event = Event::Sweep(SweepEvent {
                cutoff: Utc::now() - retention,
            });
            match invoker.invoke(&event).await {
                Ok(InvokeAck::Accepted) => tracing::debug!("Sweep scheduled"),
                Ok(ack) => tracing::warn!(status = ack.status_code(), "Sweep not accepted"),
                Err(e) => tracing::warn!(error = %e, "Failed to schedule sweep"),
            }
        }
    }
}
