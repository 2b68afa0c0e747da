// src/orchestrator/mod.rs
//
// The lifecycle core: sequences the three backends as one environment,
// compensates on failure and reports what is left when compensation fails.

pub mod lifecycle;
pub mod lock;
pub mod reconcile;
pub mod registry;
pub mod report;
pub mod state;


use std::future::Future;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::error;

use crate::config::{AgentConfig, Subnet};
use crate::error::ErrorKind;
use crate::sys::traits::{ContainerBackend, DatabaseBackend, DnsBackend};

pub use lifecycle::{EditOutcome, EditRequest, Provisioned};
pub use reconcile::{Classification, EnvironmentEntry, ListError, ReconcileReport};
pub use report::{Mismatch, OperationFailure, OperationReport, Presence, StepOutcome, StepRecord};
pub use state::{DegradedKind, EnvState};

use lock::UserLocks;
use registry::Registry;

/// Orchestrator knobs taken from [`AgentConfig`].
#[derive(Debug, Clone)]
pub struct Settings {
    pub zone: String,
    pub subnet: Subnet,
    pub reload_retries: u32,
    pub lock_dir: Option<PathBuf>,
}

impl Settings {
    pub fn from_config(config: &AgentConfig) -> Self {
        Self {
            zone: config.dns.zone.clone(),
            subnet: config.subnet,
            reload_retries: config.dns.reload_retries,
            lock_dir: config.lock_dir.clone(),
        }
    }
}

pub(crate) struct Inner {
    pub(crate) dns: Arc<dyn DnsBackend>,
    pub(crate) database: Arc<dyn DatabaseBackend>,
    pub(crate) containers: Arc<dyn ContainerBackend>,
    pub(crate) registry: Registry,
    pub(crate) locks: UserLocks,
    pub(crate) settings: Settings,
}

impl Inner {
    pub(crate) fn hostname(&self, username: &str) -> String {
        format!("{}.{}", username, self.settings.zone)
    }

    /// Inverse of [`hostname`](Self::hostname); `None` outside the zone.
    pub(crate) fn username_of<'a>(&self, hostname: &'a str) -> Option<&'a str> {
        hostname
            .strip_suffix(self.settings.zone.as_str())
            .and_then(|h| h.strip_suffix('.'))
            .filter(|h| !h.is_empty())
    }
}

/// Environment-level operations over the three backends. Cheap to clone.
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

impl Orchestrator {
    pub fn new(
        dns: Arc<dyn DnsBackend>,
        database: Arc<dyn DatabaseBackend>,
        containers: Arc<dyn ContainerBackend>,
        settings: Settings,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                dns,
                database,
                containers,
                registry: Registry::default(),
                locks: UserLocks::new(settings.lock_dir.clone()),
                settings,
            }),
        }
    }

    /// Runs `op` on its own task. Dropping the caller's future does not stop
    /// it, so compensation always runs to the end once a backend was touched.
    async fn detached<T, F, Fut>(&self, username: &str, op: F) -> Result<T, OperationFailure>
    where
        T: Send + 'static,
        F: FnOnce(Arc<Inner>) -> Fut,
        Fut: Future<Output = Result<T, OperationFailure>> + Send + 'static,
    {
        let task = tokio::spawn(op(self.inner.clone()));
        match task.await {
            Ok(result) => result,
            Err(e) => {
                error!(username, error = %e, "operation task aborted");
                let state = self.inner.registry.state(username);
                Err(OperationFailure::rejected(
                    ErrorKind::BackendUnavailable,
                    format!("operation aborted: {}", e),
                    username,
                    state,
                ))
            }
        }
    }

    /// Provisions DNS, database and container for `username` on `ip`.
    /// The returned credentials are not stored anywhere.
    pub async fn create(&self, username: &str, ip: Ipv4Addr) -> Result<Provisioned, OperationFailure> {
        let name = username.to_string();
        self.detached(username, move |inner| async move { inner.create(&name, ip).await })
            .await
    }

    pub async fn edit(&self, username: &str, request: EditRequest) -> Result<EditOutcome, OperationFailure> {
        let name = username.to_string();
        self.detached(username, move |inner| async move { inner.edit(&name, request).await })
            .await
    }

    /// Tears the environment down. `NotFound` at any backend counts as done,
    /// so repeating a remove is safe.
    pub async fn remove(&self, username: &str) -> Result<OperationReport, OperationFailure> {
        let name = username.to_string();
        self.detached(username, move |inner| async move { inner.remove(&name).await })
            .await
    }

    pub async fn repair(&self, username: &str) -> Result<OperationReport, OperationFailure> {
        let name = username.to_string();
        self.detached(username, move |inner| async move { inner.repair(&name).await })
            .await
    }

    /// Read-only reconciliation across the live backends.
    pub async fn list(&self) -> Result<ReconcileReport, ListError> {
        self.inner.reconcile().await
    }

    /// Seeds the registry from live state after a restart.
    pub async fn adopt(&self) -> Result<usize, ListError> {
        self.inner.adopt().await
    }

    #[cfg(test)]
    pub fn state(&self, username: &str) -> EnvState {
        self.inner.registry.state(username)
    }
}
