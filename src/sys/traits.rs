// src/sys/traits.rs

use async_trait::async_trait;
use std::fmt;
use std::net::Ipv4Addr;

use crate::error::BackendError;
use crate::sys::secrets::{Credential, CredentialBundle};

// ==============================================================================
// 1. DNS (Shared Zone File)
// ==============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsRecord {
    pub hostname: String,
    pub ip: Ipv4Addr,
}

#[async_trait]
pub trait DnsBackend: Send + Sync {
    /// Appends an A-record. `AlreadyExists` if the hostname is present.
    async fn create(&self, hostname: &str, ip: Ipv4Addr) -> Result<(), BackendError>;

    /// Replaces the address of an existing record. `NotFound` if absent.
    async fn update(&self, hostname: &str, ip: Ipv4Addr) -> Result<(), BackendError>;

    /// Deletes a record. `NotFound` if absent.
    async fn remove(&self, hostname: &str) -> Result<(), BackendError>;

    /// Reads the live zone. Never served from a cache.
    async fn list(&self) -> Result<Vec<DnsRecord>, BackendError>;

    /// Re-signals the resolver without touching the zone.
    /// Used after a mutation returned `ReloadUnconfirmed`.
    async fn reload(&self) -> Result<(), BackendError>;
}

// ==============================================================================
// 2. Database (Shared Cluster Principals)
// ==============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatabaseAccount {
    pub username: String,
    pub database: String,
}

#[async_trait]
pub trait DatabaseBackend: Send + Sync {
    /// Creates an owner account for the database named after `username`.
    async fn create_account(&self, username: &str, password: &Credential) -> Result<(), BackendError>;

    /// Drops the account and its database. Data loss is intended.
    async fn remove_account(&self, username: &str) -> Result<(), BackendError>;

    async fn list(&self) -> Result<Vec<DatabaseAccount>, BackendError>;
}

// ==============================================================================
// 3. Container Runtime (One Instance Per Member)
// ==============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceStatus {
    Absent,
    Starting,
    Running,
    Stopped,
    Error,
}

impl InstanceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceStatus::Absent => "absent",
            InstanceStatus::Starting => "starting",
            InstanceStatus::Running => "running",
            InstanceStatus::Stopped => "stopped",
            InstanceStatus::Error => "error",
        }
    }
}

impl fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerInstance {
    pub username: String,
    /// Address the instance is bound to, when the runtime can tell.
    pub ip: Option<Ipv4Addr>,
    pub status: InstanceStatus,
}

/// What changes when an instance is rebuilt. Fields left `None` keep their
/// current value. The home volume always carries over to the target username.
#[derive(Debug, Default, Clone, Copy)]
pub struct RecreateSpec<'a> {
    pub new_username: Option<&'a str>,
    pub new_ip: Option<Ipv4Addr>,
    pub credentials: Option<&'a CredentialBundle>,
}

#[async_trait]
pub trait ContainerBackend: Send + Sync {
    /// `AlreadyExists` if `username` has an instance, `ResourceConflict` if
    /// `ip` is bound to another one.
    async fn create(
        &self,
        username: &str,
        ip: Ipv4Addr,
        credentials: &CredentialBundle,
    ) -> Result<(), BackendError>;

    /// Destroys and rebuilds the instance, preserving the home volume.
    /// `NotFound` if absent, `VolumeMissing` if the home volume is gone.
    async fn recreate(&self, username: &str, spec: RecreateSpec<'_>) -> Result<(), BackendError>;

    /// Removes the instance, its image and its home volume.
    async fn remove(&self, username: &str) -> Result<(), BackendError>;

    async fn status(&self, username: &str) -> Result<InstanceStatus, BackendError>;

    async fn list(&self) -> Result<Vec<ContainerInstance>, BackendError>;
}
