// src/orchestrator/lifecycle.rs

use std::net::Ipv4Addr;
use tracing::{error, info, warn};

use crate::error::{Backend, BackendError, ErrorKind};
use crate::orchestrator::Inner;
use crate::orchestrator::lock::UserGuard;
use crate::orchestrator::report::{Mismatch, OperationFailure, OperationReport, Presence, StepOutcome};
use crate::orchestrator::state::{DegradedKind, EnvState};
use crate::sys::secrets::CredentialBundle;
use crate::sys::traits::RecreateSpec;
use crate::sys::validate::validate_username;

/// A freshly provisioned environment. `credentials` exist nowhere else.
#[derive(Debug)]
pub struct Provisioned {
    pub credentials: CredentialBundle,
    pub report: OperationReport,
}

/// The two edit classes are mutually exclusive.
#[derive(Debug, Clone, Default)]
pub struct EditRequest {
    pub new_username: Option<String>,
    pub new_ip: Option<Ipv4Addr>,
}

#[derive(Debug)]
pub struct EditOutcome {
    /// The identity the environment lives under after the edit.
    pub username: String,
    /// Present after a rename: the new identity gets fresh passwords.
    pub credentials: Option<CredentialBundle>,
    pub report: OperationReport,
}

/// A compensating call for a mutation that already landed.
#[derive(Debug, Clone)]
pub(crate) enum Undo {
    DnsRemove(String),
    DnsRestore(String, Ipv4Addr),
    DbRemove(String),
}

impl Undo {
    fn backend(&self) -> Backend {
        match self {
            Undo::DnsRemove(_) | Undo::DnsRestore(..) => Backend::Dns,
            Undo::DbRemove(_) => Backend::Database,
        }
    }

    fn action(&self) -> String {
        match self {
            Undo::DnsRemove(host) => format!("remove {}", host),
            Undo::DnsRestore(host, ip) => format!("update {} -> {}", host, ip),
            Undo::DbRemove(user) => format!("remove_account {}", user),
        }
    }

    fn mismatch(&self, err: &BackendError) -> Mismatch {
        let unconfirmed = matches!(err, BackendError::ReloadUnconfirmed(_));
        match self {
            Undo::DnsRestore(_, ip) => Mismatch {
                backend: Backend::Dns,
                expected: Presence::Address(*ip),
                observed: Presence::Unknown,
            },
            _ => Mismatch {
                backend: self.backend(),
                expected: Presence::Absent,
                observed: if unconfirmed { Presence::Unknown } else { Presence::Present },
            },
        }
    }
}

impl Inner {
    // ==============================================================================
    // Shared plumbing
    // ==============================================================================

    fn check_username(&self, username: &str) -> Result<(), OperationFailure> {
        validate_username(username).map_err(|e| OperationFailure::invalid(e.to_string(), username))
    }

    fn check_ip(&self, username: &str, ip: Ipv4Addr) -> Result<(), OperationFailure> {
        if self.settings.subnet.contains(ip) {
            Ok(())
        } else {
            Err(OperationFailure::invalid(
                format!("{} is not a host address in {}", ip, self.settings.subnet),
                username,
            ))
        }
    }

    pub(crate) async fn lock(&self, names: &[&str]) -> Result<UserGuard, OperationFailure> {
        let owner = names.first().copied().unwrap_or_default();
        self.locks.acquire(names).await.map_err(|e| {
            OperationFailure::rejected(e.kind(), e.to_string(), owner, self.registry.state(owner))
        })
    }

    /// Retries the resolver reload after a zone write that landed unconfirmed.
    /// The write itself is never repeated.
    pub(crate) async fn confirm_dns(&self, result: Result<(), BackendError>) -> Result<(), BackendError> {
        match result {
            Err(BackendError::ReloadUnconfirmed(reason)) => {
                for attempt in 1..=self.settings.reload_retries {
                    match self.dns.reload().await {
                        Ok(()) => {
                            info!(attempt, "DNS reload confirmed on retry");
                            return Ok(());
                        }
                        Err(e) => warn!(attempt, error = %e, "DNS reload retry failed"),
                    }
                }
                Err(BackendError::ReloadUnconfirmed(reason))
            }
            other => other,
        }
    }

    /// Runs `undo` newest first. Every entry is attempted; the ones that fail
    /// come back as mismatches.
    async fn compensate(&self, report: &mut OperationReport, undo: Vec<Undo>) -> Vec<Mismatch> {
        let mut mismatches = Vec::new();
        for step in undo.into_iter().rev() {
            let result = match &step {
                Undo::DnsRemove(host) => self.confirm_dns(self.dns.remove(host).await).await,
                Undo::DnsRestore(host, ip) => self.confirm_dns(self.dns.update(host, *ip).await).await,
                Undo::DbRemove(user) => self.database.remove_account(user).await,
            };
            match result {
                Ok(()) => report.record(step.backend(), step.action(), StepOutcome::Compensated, ""),
                Err(e) if e.is_not_found() && !matches!(step, Undo::DnsRestore(..)) => {
                    report.record(step.backend(), step.action(), StepOutcome::Compensated, "already absent")
                }
                Err(e) => {
                    error!(backend = %step.backend(), action = %step.action(), error = %e, "compensation failed");
                    report.record(step.backend(), step.action(), StepOutcome::CompensationFailed, e.to_string());
                    mismatches.push(step.mismatch(&e));
                }
            }
        }
        mismatches
    }

    /// Establishes the current address of an environment that edit is about
    /// to touch. Falls back to the live zone when this process has no record,
    /// adopting the environment as ACTIVE. A cleanup-pending identity is live
    /// under its new name and counts as ACTIVE here.
    async fn current_ip(&self, username: &str) -> Result<Ipv4Addr, OperationFailure> {
        let record = self.registry.get(username);
        match &record.state {
            EnvState::Active | EnvState::Degraded(DegradedKind::CleanupPending { .. }) => {
                if let Some(ip) = record.ip {
                    return Ok(ip);
                }
            }
            EnvState::Absent => {}
            state => {
                return Err(OperationFailure::rejected(
                    ErrorKind::ResourceConflict,
                    format!("environment {} is {}", username, state),
                    username,
                    state.clone(),
                ));
            }
        }

        let hostname = self.hostname(username);
        let records = self.dns.list().await.map_err(|e| {
            OperationFailure::rejected(e.kind(), format!("dns listing failed: {}", e), username, record.state.clone())
        })?;
        match records.into_iter().find(|r| r.hostname == hostname) {
            Some(found) => {
                info!(username, ip = %found.ip, "adopting environment from live DNS");
                self.registry.settle(username, EnvState::Active, Some(found.ip));
                Ok(found.ip)
            }
            None => Err(OperationFailure::rejected(
                ErrorKind::NotFound,
                format!("environment {} not found", username),
                username,
                EnvState::Absent,
            )),
        }
    }

    /// Environments waiting on `old_username`'s remnants are whole again.
    pub(crate) fn release_cleanup_pending(&self, old_username: &str) {
        for name in self.registry.pending_on(old_username) {
            info!(username = %name, old_username, "old identity cleaned up");
            self.registry.transition(&name, EnvState::Active);
        }
    }

    /// Removes `username` from `backends` in order, stopping at the first
    /// failure. `NotFound` counts as removed. On failure, the failing backend
    /// and every later one are reported as still holding resources.
    pub(crate) async fn teardown(
        &self,
        username: &str,
        backends: &[Backend],
        report: &mut OperationReport,
    ) -> Result<(), (BackendError, Vec<Mismatch>)> {
        let hostname = self.hostname(username);
        for (index, backend) in backends.iter().enumerate() {
            let (action, result) = match backend {
                Backend::Container => ("remove", self.containers.remove(username).await),
                Backend::Database => ("remove_account", self.database.remove_account(username).await),
                Backend::Dns => ("remove", self.confirm_dns(self.dns.remove(&hostname).await).await),
            };
            match result {
                Ok(()) => report.applied(*backend, action),
                Err(e) if e.is_not_found() => report.record(*backend, action, StepOutcome::AlreadyAbsent, ""),
                Err(e) => {
                    error!(username, %backend, error = %e, "removal step failed");
                    report.failed(*backend, action, &e);
                    let mismatches = backends[index..]
                        .iter()
                        .map(|b| match (&e, b) {
                            (BackendError::ReloadUnconfirmed(_), Backend::Dns) if b == backend => Mismatch {
                                backend: Backend::Dns,
                                expected: Presence::Absent,
                                observed: Presence::Unknown,
                            },
                            _ => Mismatch::leftover(*b),
                        })
                        .collect();
                    return Err((e, mismatches));
                }
            }
        }
        Ok(())
    }

    pub(crate) fn partial_removal(&self, username: &str, mut report: OperationReport, err: BackendError, mismatches: Vec<Mismatch>) -> OperationFailure {
        let state = EnvState::Degraded(DegradedKind::PartialRemoval);
        self.registry.transition(username, state.clone());
        let holders: Vec<&str> = mismatches.iter().map(|m| m.backend.as_str()).collect();
        report.state = state;
        report.remediation = Some(format!(
            "{} still hold resources for {}; retry remove once the backend is reachable",
            holders.join(", "),
            username
        ));
        report.mismatches = mismatches;
        OperationFailure::new(err.kind(), format!("removal incomplete: {}", err), report)
    }

    // ==============================================================================
    // Create
    // ==============================================================================

    pub(crate) async fn create(&self, username: &str, ip: Ipv4Addr) -> Result<Provisioned, OperationFailure> {
        self.check_username(username)?;
        self.check_ip(username, ip)?;
        let _guard = self.lock(&[username]).await?;

        match self.registry.state(username) {
            EnvState::Absent => {}
            state @ EnvState::Degraded(_) => {
                return Err(OperationFailure::rejected(
                    ErrorKind::ResourceConflict,
                    format!("environment {} is {}; repair or remove it first", username, state),
                    username,
                    state,
                ));
            }
            state => {
                return Err(OperationFailure::rejected(
                    ErrorKind::AlreadyExists,
                    format!("environment {} already exists", username),
                    username,
                    state,
                ));
            }
        }

        if let Err(holder) = self.registry.claim(username, ip) {
            return Err(OperationFailure::rejected(
                ErrorKind::ResourceConflict,
                format!("{} is already assigned to {}", ip, holder),
                username,
                EnvState::Absent,
            ));
        }

        // The registry only knows this process's history; the zone knows everyone's.
        let hostname = self.hostname(username);
        let conflict = match self.dns.list().await {
            Err(e) => Some((e.kind(), format!("dns listing failed: {}", e))),
            Ok(records) => {
                if records.iter().any(|r| r.hostname == hostname) {
                    Some((ErrorKind::AlreadyExists, format!("dns record {} already exists", hostname)))
                } else {
                    records.iter().find(|r| r.ip == ip).map(|r| {
                        (ErrorKind::ResourceConflict, format!("{} is already served for {}", ip, r.hostname))
                    })
                }
            }
        };
        if let Some((kind, message)) = conflict {
            self.registry.transition(username, EnvState::Absent);
            return Err(OperationFailure::rejected(kind, message, username, EnvState::Absent));
        }

        info!(username, %ip, "provisioning environment");
        let credentials = CredentialBundle::generate(hostname.clone());
        let mut report = OperationReport::new(username);
        let mut undo = Vec::new();

        // 1. DNS record
        if let Err(e) = self.confirm_dns(self.dns.create(&hostname, ip).await).await {
            report.failed(Backend::Dns, "create", &e);
            if matches!(e, BackendError::ReloadUnconfirmed(_)) {
                undo.push(Undo::DnsRemove(hostname.clone()));
            }
            return Err(self.abort_create(username, report, undo, e).await);
        }
        report.applied(Backend::Dns, "create");
        undo.push(Undo::DnsRemove(hostname.clone()));

        // 2. Database account
        if let Err(e) = self.database.create_account(username, &credentials.db_password).await {
            report.failed(Backend::Database, "create_account", &e);
            return Err(self.abort_create(username, report, undo, e).await);
        }
        report.applied(Backend::Database, "create_account");
        undo.push(Undo::DbRemove(username.to_string()));

        // 3. Container instance
        if let Err(e) = self.containers.create(username, ip, &credentials).await {
            report.failed(Backend::Container, "create", &e);
            return Err(self.abort_create(username, report, undo, e).await);
        }
        report.applied(Backend::Container, "create");

        self.registry.transition(username, EnvState::Active);
        report.state = EnvState::Active;
        info!(username, %ip, hostname, "environment active");
        Ok(Provisioned { credentials, report })
    }

    async fn abort_create(&self, username: &str, mut report: OperationReport, undo: Vec<Undo>, err: BackendError) -> OperationFailure {
        let landed = report.landed();
        if err.is_expected() {
            info!(username, error = %err, ?landed, "create aborted, compensating");
        } else {
            warn!(username, error = %err, ?landed, "create failed, compensating");
        }
        let mut mismatches = self.compensate(&mut report, undo).await;
        // The adapter could not tear down its own half-created instance.
        if matches!(err, BackendError::CompensationFailed(_)) {
            mismatches.push(Mismatch {
                backend: Backend::Container,
                expected: Presence::Absent,
                observed: Presence::Unknown,
            });
        }

        if mismatches.is_empty() {
            self.registry.transition(username, EnvState::Absent);
            report.state = EnvState::Absent;
            return OperationFailure::new(err.kind(), format!("create failed: {}", err), report);
        }

        let state = EnvState::Degraded(DegradedKind::CompensationFailed);
        self.registry.transition(username, state.clone());
        report.state = state;
        report.mismatches = mismatches;
        report.remediation = Some(format!("inspect the listed backends, then repair or remove {}", username));
        OperationFailure::new(
            ErrorKind::CompensationFailed,
            format!("create failed ({}) and compensation did not complete", err),
            report,
        )
    }

    // ==============================================================================
    // Edit
    // ==============================================================================

    pub(crate) async fn edit(&self, username: &str, request: EditRequest) -> Result<EditOutcome, OperationFailure> {
        self.check_username(username)?;
        match (request.new_username, request.new_ip) {
            (Some(_), Some(_)) => Err(OperationFailure::invalid(
                "change either the username or the address, not both",
                username,
            )),
            (None, None) => Err(OperationFailure::invalid("nothing to change", username)),
            (Some(new_username), None) => self.rename(username, &new_username).await,
            (None, Some(new_ip)) => self.move_ip(username, new_ip).await,
        }
    }

    async fn rename(&self, old: &str, new: &str) -> Result<EditOutcome, OperationFailure> {
        self.check_username(new)?;
        if old == new {
            return Err(OperationFailure::invalid("new username equals the current one", old));
        }
        let _guard = self.lock(&[old, new]).await?;
        let ip = self.current_ip(old).await?;

        // One outstanding old identity at a time.
        if let state @ EnvState::Degraded(DegradedKind::CleanupPending { .. }) = self.registry.state(old) {
            return Err(OperationFailure::rejected(
                ErrorKind::ResourceConflict,
                format!("environment {} is {}; repair its previous identity before renaming again", old, state),
                old,
                state,
            ));
        }

        match self.registry.state(new) {
            EnvState::Absent => {}
            state => {
                let kind = if state.is_degraded() { ErrorKind::ResourceConflict } else { ErrorKind::AlreadyExists };
                return Err(OperationFailure::rejected(
                    kind,
                    format!("environment {} is {}", new, state),
                    old,
                    EnvState::Active,
                ));
            }
        }

        let old_host = self.hostname(old);
        let new_host = self.hostname(new);
        match self.dns.list().await {
            Err(e) => {
                return Err(OperationFailure::rejected(e.kind(), format!("dns listing failed: {}", e), old, EnvState::Active));
            }
            Ok(records) if records.iter().any(|r| r.hostname == new_host) => {
                return Err(OperationFailure::rejected(
                    ErrorKind::AlreadyExists,
                    format!("dns record {} already exists", new_host),
                    old,
                    EnvState::Active,
                ));
            }
            Ok(_) => {}
        }

        info!(old, new, %ip, "renaming environment");
        self.registry.transition(old, EnvState::Editing);
        self.registry.settle(new, EnvState::Provisioning, Some(ip));

        let credentials = CredentialBundle::generate(new_host.clone());
        let mut report = OperationReport::new(old);
        let mut undo = Vec::new();

        // 1. Account for the new identity
        let action = format!("create_account {}", new);
        if let Err(e) = self.database.create_account(new, &credentials.db_password).await {
            report.failed(Backend::Database, action, &e);
            return Err(self.abort_rename(old, new, ip, report, undo, e).await);
        }
        report.applied(Backend::Database, action);
        undo.push(Undo::DbRemove(new.to_string()));

        // 2. Record for the new hostname, same address
        let action = format!("create {}", new_host);
        if let Err(e) = self.confirm_dns(self.dns.create(&new_host, ip).await).await {
            report.failed(Backend::Dns, action, &e);
            if matches!(e, BackendError::ReloadUnconfirmed(_)) {
                undo.push(Undo::DnsRemove(new_host.clone()));
            }
            return Err(self.abort_rename(old, new, ip, report, undo, e).await);
        }
        report.applied(Backend::Dns, action);
        undo.push(Undo::DnsRemove(new_host.clone()));

        // 3. Rebuild the instance under the new identity on the old home volume
        let action = format!("recreate {} -> {}", old, new);
        let spec = RecreateSpec { new_username: Some(new), new_ip: None, credentials: Some(&credentials) };
        if let Err(e) = self.containers.recreate(old, spec).await {
            report.failed(Backend::Container, action, &e);
            return Err(self.abort_rename(old, new, ip, report, undo, e).await);
        }
        report.applied(Backend::Container, action);

        // 4. Cleanup of the old identity. Both are attempted; failures do not
        //    undo the edit.
        let mut leftovers = Vec::new();
        let action = format!("remove {}", old_host);
        match self.confirm_dns(self.dns.remove(&old_host).await).await {
            Ok(()) => report.applied(Backend::Dns, action),
            Err(e) if e.is_not_found() => report.record(Backend::Dns, action, StepOutcome::AlreadyAbsent, ""),
            Err(e) => {
                report.failed(Backend::Dns, action, &e);
                let observed = if matches!(e, BackendError::ReloadUnconfirmed(_)) {
                    Presence::Unknown
                } else {
                    Presence::Address(ip)
                };
                leftovers.push(Mismatch { backend: Backend::Dns, expected: Presence::Absent, observed });
            }
        }
        let action = format!("remove_account {}", old);
        match self.database.remove_account(old).await {
            Ok(()) => report.applied(Backend::Database, action),
            Err(e) if e.is_not_found() => report.record(Backend::Database, action, StepOutcome::AlreadyAbsent, ""),
            Err(e) => {
                report.failed(Backend::Database, action, &e);
                leftovers.push(Mismatch::leftover(Backend::Database));
            }
        }

        self.registry.transition(old, EnvState::Absent);
        let state = if leftovers.is_empty() {
            EnvState::Active
        } else {
            warn!(old, new, "old identity left remnants behind");
            report.remediation = Some(format!("repair {} to remove the old identity's remaining resources", old));
            EnvState::Degraded(DegradedKind::CleanupPending { old_username: old.to_string() })
        };
        self.registry.transition(new, state.clone());

        report.username = new.to_string();
        report.state = state;
        report.mismatches = leftovers;
        info!(old, new, state = %report.state, "rename finished");
        Ok(EditOutcome { username: new.to_string(), credentials: Some(credentials), report })
    }

    async fn abort_rename(
        &self,
        old: &str,
        new: &str,
        ip: Ipv4Addr,
        mut report: OperationReport,
        undo: Vec<Undo>,
        err: BackendError,
    ) -> OperationFailure {
        warn!(old, new, error = %err, "rename failed, removing new identity");
        let mut mismatches = self.compensate(&mut report, undo).await;
        let new_leftovers = !mismatches.is_empty();
        // The adapter could not put the old instance back.
        let container_lost = matches!(err, BackendError::CompensationFailed(_));

        let old_state = if container_lost {
            mismatches.push(Mismatch {
                backend: Backend::Container,
                expected: Presence::Address(ip),
                observed: Presence::Unknown,
            });
            EnvState::Degraded(DegradedKind::CompensationFailed)
        } else {
            EnvState::Active
        };
        self.registry.transition(old, old_state.clone());
        self.registry.transition(
            new,
            if new_leftovers { EnvState::Degraded(DegradedKind::CompensationFailed) } else { EnvState::Absent },
        );

        report.state = old_state;
        report.mismatches = mismatches;
        if !new_leftovers && !container_lost {
            return OperationFailure::new(err.kind(), format!("rename failed: {}", err), report);
        }

        let mut hints = Vec::new();
        if new_leftovers {
            hints.push(format!("repair {} to remove the partially created identity", new));
        }
        if container_lost {
            hints.push(format!("the instance for {} could not be restored; inspect it and repair {}", old, old));
        }
        report.remediation = Some(hints.join("; "));
        OperationFailure::new(
            ErrorKind::CompensationFailed,
            format!("rename failed ({}) and compensation did not complete", err),
            report,
        )
    }

    async fn move_ip(&self, username: &str, new_ip: Ipv4Addr) -> Result<EditOutcome, OperationFailure> {
        self.check_ip(username, new_ip)?;
        let _guard = self.lock(&[username]).await?;
        let ip = self.current_ip(username).await?;
        // ACTIVE, or cleanup-pending; the edit returns to it either way.
        let resting = self.registry.state(username);

        if ip == new_ip {
            return Err(OperationFailure::rejected(
                ErrorKind::InvalidArgument,
                format!("{} is already on {}", username, ip),
                username,
                resting,
            ));
        }
        if let Err(holder) = self.registry.claim_move(username, ip, new_ip) {
            return Err(OperationFailure::rejected(
                ErrorKind::ResourceConflict,
                format!("{} is already assigned to {}", new_ip, holder),
                username,
                resting,
            ));
        }

        let hostname = self.hostname(username);
        let conflict = match self.dns.list().await {
            Err(e) => Some((e.kind(), format!("dns listing failed: {}", e))),
            Ok(records) => records
                .iter()
                .find(|r| r.ip == new_ip && r.hostname != hostname)
                .map(|r| (ErrorKind::ResourceConflict, format!("{} is already served for {}", new_ip, r.hostname))),
        };
        if let Some((kind, message)) = conflict {
            self.registry.settle(username, resting.clone(), Some(ip));
            return Err(OperationFailure::rejected(kind, message, username, resting));
        }

        info!(username, from = %ip, to = %new_ip, "moving environment");
        let mut report = OperationReport::new(username);
        let mut undo = Vec::new();

        // 1. Point the record at the new address
        let action = format!("update {} -> {}", hostname, new_ip);
        if let Err(e) = self.confirm_dns(self.dns.update(&hostname, new_ip).await).await {
            report.failed(Backend::Dns, action, &e);
            if matches!(e, BackendError::ReloadUnconfirmed(_)) {
                undo.push(Undo::DnsRestore(hostname.clone(), ip));
            }
            return Err(self.abort_move(username, ip, resting, report, undo, e).await);
        }
        report.applied(Backend::Dns, action);
        undo.push(Undo::DnsRestore(hostname.clone(), ip));

        // 2. Rebuild the instance on it
        let spec = RecreateSpec { new_ip: Some(new_ip), ..Default::default() };
        if let Err(e) = self.containers.recreate(username, spec).await {
            report.failed(Backend::Container, "recreate", &e);
            return Err(self.abort_move(username, ip, resting, report, undo, e).await);
        }
        report.applied(Backend::Container, "recreate");

        self.registry.settle(username, resting.clone(), Some(new_ip));
        report.state = resting;
        info!(username, ip = %new_ip, "environment moved");
        Ok(EditOutcome { username: username.to_string(), credentials: None, report })
    }

    async fn abort_move(
        &self,
        username: &str,
        ip: Ipv4Addr,
        resting: EnvState,
        mut report: OperationReport,
        undo: Vec<Undo>,
        err: BackendError,
    ) -> OperationFailure {
        warn!(username, error = %err, "address change failed, restoring");
        let mut mismatches = self.compensate(&mut report, undo).await;
        if matches!(err, BackendError::CompensationFailed(_)) {
            mismatches.push(Mismatch {
                backend: Backend::Container,
                expected: Presence::Address(ip),
                observed: Presence::Unknown,
            });
        }

        if mismatches.is_empty() {
            self.registry.settle(username, resting.clone(), Some(ip));
            report.state = resting;
            return OperationFailure::new(err.kind(), format!("address change failed: {}", err), report);
        }

        let state = EnvState::Degraded(DegradedKind::CompensationFailed);
        self.registry.settle(username, state.clone(), Some(ip));
        report.state = state;
        report.mismatches = mismatches;
        report.remediation = Some(format!("list environments, then repair {}", username));
        OperationFailure::new(
            ErrorKind::CompensationFailed,
            format!("address change failed ({}) and compensation did not complete", err),
            report,
        )
    }

    // ==============================================================================
    // Remove
    // ==============================================================================

    pub(crate) async fn remove(&self, username: &str) -> Result<OperationReport, OperationFailure> {
        self.check_username(username)?;
        let _guard = self.lock(&[username]).await?;

        let state = self.registry.state(username);
        if state.is_transient() {
            return Err(OperationFailure::rejected(
                ErrorKind::ResourceConflict,
                format!("environment {} is {}", username, state),
                username,
                state,
            ));
        }

        info!(username, from = %state, "removing environment");
        self.registry.transition(username, EnvState::Removing);
        let mut report = OperationReport::new(username);

        let order = [Backend::Container, Backend::Database, Backend::Dns];
        if let Err((err, mismatches)) = self.teardown(username, &order, &mut report).await {
            return Err(self.partial_removal(username, report, err, mismatches));
        }

        self.registry.transition(username, EnvState::Absent);
        self.release_cleanup_pending(username);
        report.state = EnvState::Absent;
        info!(username, "environment removed");
        Ok(report)
    }
}
