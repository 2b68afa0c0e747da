// src/orchestrator/reconcile.rs

use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::fmt;
use std::net::Ipv4Addr;
use thiserror::Error;
use tracing::{info, warn};

use crate::error::{Backend, BackendError, ErrorKind};
use crate::orchestrator::Inner;
use crate::orchestrator::report::{Mismatch, OperationFailure, OperationReport, Presence};
use crate::orchestrator::state::EnvState;
use crate::sys::traits::{ContainerInstance, InstanceStatus};

/// How the three backends agree about one username.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Classification {
    Consistent,
    IpMismatch { dns_ip: Ipv4Addr, container_ip: Ipv4Addr },
    /// Some backends hold resources, others do not.
    Orphaned { present: Vec<Backend> },
}

impl fmt::Display for Classification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Classification::Consistent => f.write_str("Consistent"),
            Classification::IpMismatch { .. } => f.write_str("IPMismatch"),
            Classification::Orphaned { present } => {
                let names: Vec<&str> = present.iter().map(Backend::as_str).collect();
                write!(f, "Orphaned:{}", names.join("+"))
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvironmentEntry {
    pub username: String,
    pub classification: Classification,
    /// This process's last known state; ABSENT when it has no record.
    pub state: EnvState,
    pub dns_ip: Option<Ipv4Addr>,
    pub database: bool,
    pub container_ip: Option<Ipv4Addr>,
    pub container_status: InstanceStatus,
}

#[derive(Debug, Clone)]
pub struct ReconcileReport {
    pub observed_at: DateTime<Utc>,
    pub entries: Vec<EnvironmentEntry>,
    pub dns_records: usize,
    pub database_accounts: usize,
    pub containers: usize,
}

impl ReconcileReport {
    #[cfg(test)]
    pub fn entry(&self, username: &str) -> Option<&EnvironmentEntry> {
        self.entries.iter().find(|e| e.username == username)
    }

    pub fn drifted(&self) -> usize {
        self.entries
            .iter()
            .filter(|e| e.classification != Classification::Consistent)
            .count()
    }
}

/// A backend could not be listed; nothing is classified from a partial view.
#[derive(Debug, Clone, Error)]
#[error("{backend} listing failed: {source}")]
pub struct ListError {
    pub backend: Backend,
    #[source]
    pub source: BackendError,
}

impl ListError {
    pub fn kind(&self) -> ErrorKind {
        self.source.kind()
    }
}

#[derive(Debug, Default)]
pub(crate) struct Observed {
    dns_ip: Option<Ipv4Addr>,
    database: bool,
    container: Option<ContainerInstance>,
}

impl Observed {
    fn classify(&self) -> Classification {
        match (self.dns_ip, self.database, &self.container) {
            (Some(dns_ip), true, Some(instance)) => match instance.ip {
                Some(container_ip) if container_ip != dns_ip => Classification::IpMismatch { dns_ip, container_ip },
                // An instance that does not expose its address cannot contradict DNS.
                _ => Classification::Consistent,
            },
            _ => {
                let mut present = Vec::new();
                if self.dns_ip.is_some() {
                    present.push(Backend::Dns);
                }
                if self.database {
                    present.push(Backend::Database);
                }
                if self.container.is_some() {
                    present.push(Backend::Container);
                }
                Classification::Orphaned { present }
            }
        }
    }
}

pub(crate) struct Observation {
    by_user: BTreeMap<String, Observed>,
    dns_records: usize,
    database_accounts: usize,
    containers: usize,
}

impl Inner {
    /// Lists all three backends concurrently and joins them by username.
    pub(crate) async fn observe(&self) -> Result<Observation, ListError> {
        let (dns, database, containers) =
            tokio::join!(self.dns.list(), self.database.list(), self.containers.list());
        let dns = dns.map_err(|source| ListError { backend: Backend::Dns, source })?;
        let database = database.map_err(|source| ListError { backend: Backend::Database, source })?;
        let containers = containers.map_err(|source| ListError { backend: Backend::Container, source })?;

        let mut by_user: BTreeMap<String, Observed> = BTreeMap::new();
        for record in &dns {
            match self.username_of(&record.hostname) {
                Some(username) => by_user.entry(username.to_string()).or_default().dns_ip = Some(record.ip),
                None => warn!(hostname = %record.hostname, "record outside the managed zone"),
            }
        }
        for account in &database {
            by_user.entry(account.username.clone()).or_default().database = true;
        }
        let container_count = containers.len();
        for instance in containers {
            let username = instance.username.clone();
            by_user.entry(username).or_default().container = Some(instance);
        }

        Ok(Observation {
            by_user,
            dns_records: dns.len(),
            database_accounts: database.len(),
            containers: container_count,
        })
    }

    pub(crate) async fn reconcile(&self) -> Result<ReconcileReport, ListError> {
        let observation = self.observe().await?;
        let entries: Vec<EnvironmentEntry> = observation
            .by_user
            .into_iter()
            .map(|(username, observed)| EnvironmentEntry {
                classification: observed.classify(),
                state: self.registry.state(&username),
                dns_ip: observed.dns_ip,
                database: observed.database,
                container_ip: observed.container.as_ref().and_then(|c| c.ip),
                container_status: observed
                    .container
                    .as_ref()
                    .map(|c| c.status)
                    .unwrap_or(InstanceStatus::Absent),
                username,
            })
            .collect();

        let report = ReconcileReport {
            observed_at: Utc::now(),
            entries,
            dns_records: observation.dns_records,
            database_accounts: observation.database_accounts,
            containers: observation.containers,
        };
        info!(
            environments = report.entries.len(),
            drifted = report.drifted(),
            "reconciliation complete"
        );
        Ok(report)
    }

    /// Registers every consistent environment as ACTIVE. Drifted ones stay
    /// unknown until an operator repairs them.
    pub(crate) async fn adopt(&self) -> Result<usize, ListError> {
        let observation = self.observe().await?;
        let mut adopted = 0;
        for (username, observed) in &observation.by_user {
            match observed.classify() {
                Classification::Consistent if self.registry.state(username) == EnvState::Absent => {
                    self.registry.settle(username, EnvState::Active, observed.dns_ip);
                    adopted += 1;
                }
                Classification::Consistent => {}
                drift => warn!(username, classification = %drift, "environment needs repair"),
            }
        }
        info!(adopted, "registry seeded from live backends");
        Ok(adopted)
    }

    /// Re-runs the compensation matching the username's live classification.
    pub(crate) async fn repair(&self, username: &str) -> Result<OperationReport, OperationFailure> {
        if let Err(e) = crate::sys::validate::validate_username(username) {
            return Err(OperationFailure::invalid(e.to_string(), username));
        }
        let _guard = self.lock(&[username]).await?;

        let state = self.registry.state(username);
        let observation = self.observe().await.map_err(|e| {
            OperationFailure::rejected(e.kind(), e.to_string(), username, state.clone())
        })?;
        let mut report = OperationReport::new(username);

        let Some(observed) = observation.by_user.get(username) else {
            info!(username, "nothing observed, marking absent");
            self.registry.transition(username, EnvState::Absent);
            self.release_cleanup_pending(username);
            report.state = EnvState::Absent;
            return Ok(report);
        };

        match observed.classify() {
            Classification::Consistent => {
                info!(username, from = %state, "environment consistent, marking active");
                self.registry.settle(username, EnvState::Active, observed.dns_ip);
                report.state = EnvState::Active;
                Ok(report)
            }

            // The container is authoritative for the address.
            Classification::IpMismatch { dns_ip, container_ip } => {
                let hostname = self.hostname(username);
                let action = format!("update {} -> {}", hostname, container_ip);
                match self.confirm_dns(self.dns.update(&hostname, container_ip).await).await {
                    Ok(()) => {
                        report.applied(Backend::Dns, action);
                        self.registry.settle(username, EnvState::Active, Some(container_ip));
                        report.state = EnvState::Active;
                        info!(username, from = %dns_ip, to = %container_ip, "DNS realigned with container");
                        Ok(report)
                    }
                    Err(e) => {
                        report.failed(Backend::Dns, action, &e);
                        let observed = if matches!(e, BackendError::ReloadUnconfirmed(_)) {
                            Presence::Unknown
                        } else {
                            Presence::Address(dns_ip)
                        };
                        report.mismatches.push(Mismatch {
                            backend: Backend::Dns,
                            expected: Presence::Address(container_ip),
                            observed,
                        });
                        report.state = state;
                        report.remediation = Some(format!("retry repair for {} once DNS is reachable", username));
                        Err(OperationFailure::new(e.kind(), format!("repair failed: {}", e), report))
                    }
                }
            }

            Classification::Orphaned { present } => {
                info!(username, backends = ?present, "removing orphaned resources");
                self.registry.transition(username, EnvState::Removing);
                let order: Vec<Backend> = [Backend::Container, Backend::Database, Backend::Dns]
                    .into_iter()
                    .filter(|b| present.contains(b))
                    .collect();
                if let Err((err, mismatches)) = self.teardown(username, &order, &mut report).await {
                    return Err(self.partial_removal(username, report, err, mismatches));
                }
                self.registry.transition(username, EnvState::Absent);
                self.release_cleanup_pending(username);
                report.state = EnvState::Absent;
                Ok(report)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(last: u8) -> Ipv4Addr {
        Ipv4Addr::new(10, 251, 1, last)
    }

    fn instance(ip: Option<Ipv4Addr>) -> Option<ContainerInstance> {
        Some(ContainerInstance { username: "alice".into(), ip, status: InstanceStatus::Running })
    }

    #[test]
    fn all_three_with_matching_address_is_consistent() {
        let observed = Observed { dns_ip: Some(ip(10)), database: true, container: instance(Some(ip(10))) };
        assert_eq!(observed.classify(), Classification::Consistent);
    }

    #[test]
    fn unknown_container_address_does_not_count_as_drift() {
        let observed = Observed { dns_ip: Some(ip(10)), database: true, container: instance(None) };
        assert_eq!(observed.classify(), Classification::Consistent);
    }

    #[test]
    fn diverging_addresses_are_flagged() {
        let observed = Observed { dns_ip: Some(ip(10)), database: true, container: instance(Some(ip(20))) };
        assert_eq!(
            observed.classify(),
            Classification::IpMismatch { dns_ip: ip(10), container_ip: ip(20) }
        );
        assert_eq!(observed.classify().to_string(), "IPMismatch");
    }

    #[test]
    fn partial_presence_names_the_holders() {
        let dns_only = Observed { dns_ip: Some(ip(10)), ..Default::default() };
        assert_eq!(dns_only.classify().to_string(), "Orphaned:dns");

        let db_and_container = Observed { dns_ip: None, database: true, container: instance(Some(ip(10))) };
        assert_eq!(db_and_container.classify().to_string(), "Orphaned:database+container");
    }
}
