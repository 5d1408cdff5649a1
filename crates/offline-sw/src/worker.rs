//! Worker lifecycle state machine and the dispatch loop hosts talk to.
//!
//! ```text
//! Installing ── install ok ──→ Activating ── activate ok ──→ Serving
//!     │
//!     └── install failed ──→ Redundant
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use offline_net::{Fetcher, Request, Response};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::classify::{RequestClassifier, Route};
use crate::config::WorkerConfig;
use crate::gc::{collect_stale_partitions, GcReport};
use crate::precache::precache_shell;
use crate::registry::{CacheRegistry, PartitionRole};
use crate::storage::CacheBackend;
use crate::strategy::Strategies;
use crate::{Result, ServiceWorkerError};

// ==================== Types ====================

/// Unique identifier for a worker instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WorkerId(u64);

impl WorkerId {
    fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

/// Worker lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WorkerState {
    /// Waiting for (or running) the install event.
    #[default]
    Installing,
    /// Installed; waiting for (or running) the activate event.
    Activating,
    /// Controlling clients and answering fetch events.
    Serving,
    /// Install failed; the previous worker stays in control.
    Redundant,
}

/// Result of a successful install.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallOutcome {
    /// Entries committed to the shell partition.
    pub precached: usize,
    /// Activate without waiting for clients of the old worker to close.
    pub skip_waiting: bool,
}

/// Result of a successful activation.
#[derive(Debug)]
pub struct ActivateOutcome {
    pub gc: GcReport,
    /// Take control of already-open pages immediately.
    pub clients_claimed: bool,
}

/// What the host should do with an intercepted request.
#[derive(Debug, Clone)]
pub enum FetchDisposition {
    /// Not handled; let the request continue to the network untouched.
    Decline,
    /// Use this response.
    Respond(Response),
}

impl FetchDisposition {
    pub fn response(&self) -> Option<&Response> {
        match self {
            FetchDisposition::Respond(response) => Some(response),
            FetchDisposition::Decline => None,
        }
    }

    pub fn is_decline(&self) -> bool {
        matches!(self, FetchDisposition::Decline)
    }
}

/// Lifecycle notifications for the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerEvent {
    StateChange {
        worker_id: WorkerId,
        state: WorkerState,
    },
    /// Install succeeded; activate right away.
    SkipWaiting { worker_id: WorkerId },
    /// Activation succeeded; open pages are now controlled.
    ClientsClaimed { worker_id: WorkerId },
}

// ==================== Fetch Router ====================

/// Classifies a request and runs the selected strategy.
///
/// Stateless apart from shared storage, so concurrent fetch events share one.
#[derive(Clone)]
pub struct FetchRouter {
    classifier: RequestClassifier,
    strategies: Strategies,
}

impl FetchRouter {
    pub fn new(classifier: RequestClassifier, strategies: Strategies) -> Self {
        Self {
            classifier,
            strategies,
        }
    }

    pub fn strategies(&self) -> &Strategies {
        &self.strategies
    }

    /// Answer one intercepted request.
    pub async fn route(&self, request: &Request) -> Result<FetchDisposition> {
        let response = match self.classifier.classify(request) {
            Route::Passthrough => return Ok(FetchDisposition::Decline),
            Route::StaleWhileRevalidate => self.strategies.stale_while_revalidate(request).await?,
            Route::CacheFirst => self
                .strategies
                .cache_first(request)
                .await?
                .ok_or_else(|| ServiceWorkerError::AssetUnavailable(request.url.to_string()))?,
            Route::NetworkFirst => self.strategies.network_first(request).await?,
        };
        Ok(FetchDisposition::Respond(response))
    }
}

// ==================== Service Worker ====================

/// One worker instance for one cache version.
pub struct ServiceWorker {
    id: WorkerId,
    config: Arc<WorkerConfig>,
    state: WorkerState,
    registry: CacheRegistry,
    fetcher: Arc<dyn Fetcher>,
    router: Arc<FetchRouter>,
    event_tx: mpsc::UnboundedSender<WorkerEvent>,
}

impl ServiceWorker {
    /// Create a worker in the `Installing` state.
    pub fn new(
        config: WorkerConfig,
        fetcher: Arc<dyn Fetcher>,
        backend: Arc<dyn CacheBackend>,
    ) -> Result<(Self, mpsc::UnboundedReceiver<WorkerEvent>)> {
        config.validate()?;

        let registry = CacheRegistry::new(&config.version, backend);
        let offline_page = Request::get(config.offline_url()?);
        let strategies = Strategies::new(registry.clone(), Arc::clone(&fetcher), offline_page);
        let router = FetchRouter::new(RequestClassifier::from_config(&config), strategies);
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        let worker = Self {
            id: WorkerId::new(),
            config: Arc::new(config),
            state: WorkerState::Installing,
            registry,
            fetcher,
            router: Arc::new(router),
            event_tx,
        };
        info!(worker = worker.id.raw(), version = %worker.config.version, "Service worker created");

        Ok((worker, event_rx))
    }

    pub fn id(&self) -> WorkerId {
        self.id
    }

    pub fn state(&self) -> WorkerState {
        self.state
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    pub fn registry(&self) -> &CacheRegistry {
        &self.registry
    }

    fn set_state(&mut self, state: WorkerState) {
        info!(worker = self.id.raw(), from = ?self.state, to = ?state, "Worker state change");
        self.state = state;
        let _ = self.event_tx.send(WorkerEvent::StateChange {
            worker_id: self.id,
            state,
        });
    }

    fn expect_state(&self, expected: WorkerState, action: &str) -> Result<()> {
        if self.state != expected {
            return Err(ServiceWorkerError::StateError(format!(
                "cannot {action} in state {:?}",
                self.state
            )));
        }
        Ok(())
    }

    /// Handle the install event: precache the shell.
    ///
    /// On failure the worker becomes redundant and must be discarded.
    pub async fn install(&mut self) -> Result<InstallOutcome> {
        self.expect_state(WorkerState::Installing, "install")?;

        match precache_shell(&self.registry, self.fetcher.as_ref(), &self.config).await {
            Ok(precached) => {
                self.set_state(WorkerState::Activating);
                let _ = self
                    .event_tx
                    .send(WorkerEvent::SkipWaiting { worker_id: self.id });
                Ok(InstallOutcome {
                    precached,
                    skip_waiting: true,
                })
            }
            Err(e) => {
                error!(worker = self.id.raw(), error = %e, "Install failed");
                self.set_state(WorkerState::Redundant);
                Err(e)
            }
        }
    }

    /// Handle the activate event: drop other versions' partitions, then claim
    /// clients.
    ///
    /// If the partition list cannot be read the worker stays `Activating` and
    /// the host may retry.
    pub async fn activate(&mut self) -> Result<ActivateOutcome> {
        self.expect_state(WorkerState::Activating, "activate")?;

        let gc = collect_stale_partitions(&self.registry).await?;
        if !gc.is_clean() {
            warn!(
                worker = self.id.raw(),
                failed = gc.failed.len(),
                "Some stale partitions were not deleted"
            );
        }
        for role in PartitionRole::ALL {
            self.registry.open(role).await?;
        }

        self.set_state(WorkerState::Serving);
        let _ = self
            .event_tx
            .send(WorkerEvent::ClientsClaimed { worker_id: self.id });

        Ok(ActivateOutcome {
            gc,
            clients_claimed: true,
        })
    }

    /// Handle one fetch event. Declines everything until the worker serves.
    pub async fn handle_fetch(&self, request: &Request) -> Result<FetchDisposition> {
        if self.state != WorkerState::Serving {
            debug!(url = %request.url, state = ?self.state, "Worker not serving, declining fetch");
            return Ok(FetchDisposition::Decline);
        }
        self.router.route(request).await
    }

    /// Wait for background cache writes and revalidations.
    pub async fn settle(&self) {
        self.router.strategies().background().settle().await;
    }

    /// Move the worker onto its own dispatch loop.
    pub fn spawn(self) -> (WorkerHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(self.run(rx));
        (WorkerHandle { tx }, task)
    }

    /// Lifecycle messages are handled one at a time; fetch events and settle
    /// requests are spawned so a hung request never stalls the loop.
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<WorkerMessage>) {
        while let Some(message) = rx.recv().await {
            match message {
                WorkerMessage::Install { reply } => {
                    let _ = reply.send(self.install().await);
                }
                WorkerMessage::Activate { reply } => {
                    let _ = reply.send(self.activate().await);
                }
                WorkerMessage::Fetch { request, reply } => {
                    if self.state != WorkerState::Serving {
                        let _ = reply.send(self.handle_fetch(&request).await);
                        continue;
                    }
                    let router = Arc::clone(&self.router);
                    tokio::spawn(async move {
                        let _ = reply.send(router.route(&request).await);
                    });
                }
                WorkerMessage::Settle { reply } => {
                    let background = self.router.strategies().background().clone();
                    tokio::spawn(async move {
                        background.settle().await;
                        let _ = reply.send(());
                    });
                }
            }
        }
        debug!(worker = self.id.raw(), "Dispatch loop stopped");
    }
}

// ==================== Handle ====================

enum WorkerMessage {
    Install {
        reply: oneshot::Sender<Result<InstallOutcome>>,
    },
    Activate {
        reply: oneshot::Sender<Result<ActivateOutcome>>,
    },
    Fetch {
        request: Request,
        reply: oneshot::Sender<Result<FetchDisposition>>,
    },
    Settle {
        reply: oneshot::Sender<()>,
    },
}

/// Host-side handle to a running worker. Dropping every handle stops it.
#[derive(Clone)]
pub struct WorkerHandle {
    tx: mpsc::UnboundedSender<WorkerMessage>,
}

impl WorkerHandle {
    async fn call<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> WorkerMessage,
    ) -> std::result::Result<T, ServiceWorkerError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(make(reply))
            .map_err(|_| ServiceWorkerError::WorkerGone)?;
        rx.await.map_err(|_| ServiceWorkerError::WorkerGone)
    }

    /// Deliver the install event and wait for it to complete.
    pub async fn install(&self) -> Result<InstallOutcome> {
        self.call(|reply| WorkerMessage::Install { reply }).await?
    }

    /// Deliver the activate event and wait for it to complete.
    pub async fn activate(&self) -> Result<ActivateOutcome> {
        self.call(|reply| WorkerMessage::Activate { reply }).await?
    }

    /// Deliver a fetch event and wait for the worker's answer.
    pub async fn fetch(&self, request: Request) -> Result<FetchDisposition> {
        self.call(|reply| WorkerMessage::Fetch { request, reply })
            .await?
    }

    /// Wait for the worker's background cache work to finish.
    pub async fn settle(&self) -> Result<()> {
        self.call(|reply| WorkerMessage::Settle { reply }).await
    }
}
