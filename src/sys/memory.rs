// src/sys/memory.rs
//
// In-memory backends with per-operation fault injection. Test only.

use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::net::Ipv4Addr;
use std::sync::Mutex;
use std::time::Duration;

use crate::error::BackendError;
use crate::sys::secrets::{Credential, CredentialBundle};
use crate::sys::traits::{
    ContainerBackend, ContainerInstance, DatabaseAccount, DatabaseBackend, DnsBackend, DnsRecord,
    InstanceStatus, RecreateSpec,
};

/// Errors queued per operation name. A persistent fault fires on every call
/// until cleared; a one-shot fault fires once.
#[derive(Default)]
pub struct Faults {
    inner: Mutex<HashMap<String, (BackendError, bool)>>,
}

impl Faults {
    pub fn inject(&self, op: &str, err: BackendError) {
        self.inner.lock().unwrap().insert(op.to_string(), (err, false));
    }

    pub fn inject_once(&self, op: &str, err: BackendError) {
        self.inner.lock().unwrap().insert(op.to_string(), (err, true));
    }

    pub fn clear(&self) {
        self.inner.lock().unwrap().clear();
    }

    fn take(&self, op: &str) -> Option<BackendError> {
        let mut inner = self.inner.lock().unwrap();
        let (err, once) = inner.get(op)?.clone();
        if once {
            inner.remove(op);
        }
        Some(err)
    }

    /// `Err` for anything but `ReloadUnconfirmed`, which mutating calls apply first.
    fn check(&self, op: &str) -> Result<Option<BackendError>, BackendError> {
        match self.take(op) {
            Some(err @ BackendError::ReloadUnconfirmed(_)) => Ok(Some(err)),
            Some(err) => Err(err),
            None => Ok(None),
        }
    }
}

#[derive(Default)]
pub struct MemoryDns {
    pub faults: Faults,
    records: Mutex<BTreeMap<String, Ipv4Addr>>,
    reloads: Mutex<u32>,
}

impl MemoryDns {
    pub fn get(&self, hostname: &str) -> Option<Ipv4Addr> {
        self.records.lock().unwrap().get(hostname).copied()
    }

    pub fn insert(&self, hostname: &str, ip: Ipv4Addr) {
        self.records.lock().unwrap().insert(hostname.to_string(), ip);
    }

    pub fn reloads(&self) -> u32 {
        *self.reloads.lock().unwrap()
    }

    fn finish(&self, deferred: Option<BackendError>) -> Result<(), BackendError> {
        match deferred {
            Some(err) => Err(err),
            None => {
                *self.reloads.lock().unwrap() += 1;
                Ok(())
            }
        }
    }
}

#[async_trait]
impl DnsBackend for MemoryDns {
    async fn create(&self, hostname: &str, ip: Ipv4Addr) -> Result<(), BackendError> {
        let deferred = self.faults.check("create")?;
        {
            let mut records = self.records.lock().unwrap();
            if records.contains_key(hostname) {
                return Err(BackendError::AlreadyExists(hostname.to_string()));
            }
            records.insert(hostname.to_string(), ip);
        }
        self.finish(deferred)
    }

    async fn update(&self, hostname: &str, ip: Ipv4Addr) -> Result<(), BackendError> {
        let deferred = self.faults.check("update")?;
        {
            let mut records = self.records.lock().unwrap();
            let Some(slot) = records.get_mut(hostname) else {
                return Err(BackendError::NotFound(hostname.to_string()));
            };
            *slot = ip;
        }
        self.finish(deferred)
    }

    async fn remove(&self, hostname: &str) -> Result<(), BackendError> {
        let deferred = self.faults.check("remove")?;
        if self.records.lock().unwrap().remove(hostname).is_none() {
            return Err(BackendError::NotFound(hostname.to_string()));
        }
        self.finish(deferred)
    }

    async fn list(&self) -> Result<Vec<DnsRecord>, BackendError> {
        self.faults.check("list")?;
        Ok(self
            .records
            .lock()
            .unwrap()
            .iter()
            .map(|(hostname, ip)| DnsRecord { hostname: hostname.clone(), ip: *ip })
            .collect())
    }

    async fn reload(&self) -> Result<(), BackendError> {
        if let Some(err) = self.faults.take("reload") {
            return Err(err);
        }
        *self.reloads.lock().unwrap() += 1;
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryDatabase {
    pub faults: Faults,
    accounts: Mutex<BTreeSet<String>>,
}

impl MemoryDatabase {
    pub fn contains(&self, username: &str) -> bool {
        self.accounts.lock().unwrap().contains(username)
    }

    pub fn insert(&self, username: &str) {
        self.accounts.lock().unwrap().insert(username.to_string());
    }
}

#[async_trait]
impl DatabaseBackend for MemoryDatabase {
    async fn create_account(&self, username: &str, _password: &Credential) -> Result<(), BackendError> {
        self.faults.check("create_account")?;
        if !self.accounts.lock().unwrap().insert(username.to_string()) {
            return Err(BackendError::AlreadyExists(username.to_string()));
        }
        Ok(())
    }

    async fn remove_account(&self, username: &str) -> Result<(), BackendError> {
        self.faults.check("remove_account")?;
        if !self.accounts.lock().unwrap().remove(username) {
            return Err(BackendError::NotFound(username.to_string()));
        }
        Ok(())
    }

    async fn list(&self) -> Result<Vec<DatabaseAccount>, BackendError> {
        self.faults.check("list")?;
        Ok(self
            .accounts
            .lock()
            .unwrap()
            .iter()
            .map(|u| DatabaseAccount { username: u.clone(), database: u.clone() })
            .collect())
    }
}

#[derive(Default)]
pub struct MemoryContainers {
    pub faults: Faults,
    instances: Mutex<BTreeMap<String, (Ipv4Addr, InstanceStatus)>>,
    volumes: Mutex<BTreeSet<String>>,
    create_delay: Mutex<Option<Duration>>,
}

impl MemoryContainers {
    pub fn get(&self, username: &str) -> Option<Ipv4Addr> {
        self.instances.lock().unwrap().get(username).map(|(ip, _)| *ip)
    }

    pub fn insert(&self, username: &str, ip: Ipv4Addr) {
        self.instances
            .lock()
            .unwrap()
            .insert(username.to_string(), (ip, InstanceStatus::Running));
        self.volumes.lock().unwrap().insert(username.to_string());
    }

    pub fn has_volume(&self, username: &str) -> bool {
        self.volumes.lock().unwrap().contains(username)
    }

    pub fn drop_volume(&self, username: &str) {
        self.volumes.lock().unwrap().remove(username);
    }

    /// Holds every create open for `delay`, widening race windows.
    pub fn slow_create(&self, delay: Duration) {
        *self.create_delay.lock().unwrap() = Some(delay);
    }
}

#[async_trait]
impl ContainerBackend for MemoryContainers {
    async fn create(&self, username: &str, ip: Ipv4Addr, _credentials: &CredentialBundle) -> Result<(), BackendError> {
        let delay = *self.create_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.faults.check("create")?;
        let mut instances = self.instances.lock().unwrap();
        if instances.contains_key(username) {
            return Err(BackendError::AlreadyExists(username.to_string()));
        }
        if let Some((other, _)) = instances.iter().find(|(_, (bound, _))| *bound == ip) {
            return Err(BackendError::ResourceConflict(format!("{} bound to {}", ip, other)));
        }
        instances.insert(username.to_string(), (ip, InstanceStatus::Running));
        self.volumes.lock().unwrap().insert(username.to_string());
        Ok(())
    }

    async fn recreate(&self, username: &str, spec: RecreateSpec<'_>) -> Result<(), BackendError> {
        self.faults.check("recreate")?;
        let mut instances = self.instances.lock().unwrap();
        let Some((ip, _)) = instances.get(username).copied() else {
            return Err(BackendError::NotFound(username.to_string()));
        };
        let mut volumes = self.volumes.lock().unwrap();
        if !volumes.contains(username) {
            return Err(BackendError::VolumeMissing(username.to_string()));
        }
        let target = spec.new_username.unwrap_or(username);
        if target != username && instances.contains_key(target) {
            return Err(BackendError::AlreadyExists(target.to_string()));
        }
        let ip = spec.new_ip.unwrap_or(ip);
        instances.remove(username);
        volumes.remove(username);
        instances.insert(target.to_string(), (ip, InstanceStatus::Running));
        volumes.insert(target.to_string());
        Ok(())
    }

    async fn remove(&self, username: &str) -> Result<(), BackendError> {
        self.faults.check("remove")?;
        if self.instances.lock().unwrap().remove(username).is_none() {
            return Err(BackendError::NotFound(username.to_string()));
        }
        self.volumes.lock().unwrap().remove(username);
        Ok(())
    }

    async fn status(&self, username: &str) -> Result<InstanceStatus, BackendError> {
        self.faults.check("status")?;
        Ok(self
            .instances
            .lock()
            .unwrap()
            .get(username)
            .map(|(_, status)| *status)
            .unwrap_or(InstanceStatus::Absent))
    }

    async fn list(&self) -> Result<Vec<ContainerInstance>, BackendError> {
        self.faults.check("list")?;
        Ok(self
            .instances
            .lock()
            .unwrap()
            .iter()
            .map(|(username, (ip, status))| ContainerInstance {
                username: username.clone(),
                ip: Some(*ip),
                status: *status,
            })
            .collect())
    }
}
