// src/orchestrator/registry.rs

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, warn};

use crate::orchestrator::state::{DegradedKind, EnvState};

/// Last known state of one username. Process-local; never a source of truth
/// for backend contents.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnvRecord {
    pub state: EnvState,
    pub ip: Option<Ipv4Addr>,
    /// Address being moved to by an in-flight IP edit.
    pub pending_ip: Option<Ipv4Addr>,
}

/// `username -> EnvRecord`. ABSENT usernames have no entry.
#[derive(Default)]
pub struct Registry {
    inner: Mutex<HashMap<String, EnvRecord>>,
}

impl Registry {
    fn entries(&self) -> MutexGuard<'_, HashMap<String, EnvRecord>> {
        // A panicking holder cannot leave a record half-written: every update
        // is a single insert or remove.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn get(&self, username: &str) -> EnvRecord {
        self.entries().get(username).cloned().unwrap_or_default()
    }

    pub fn state(&self, username: &str) -> EnvState {
        self.get(username).state
    }

    /// Applies a state change and, when `ip` is given, the new address in the
    /// same critical section. A pending address is released with it.
    fn apply(
        entries: &mut HashMap<String, EnvRecord>,
        username: &str,
        state: EnvState,
        ip: Option<Option<Ipv4Addr>>,
    ) {
        let current = entries.get(username).cloned().unwrap_or_default();
        if !current.state.can_transition(&state) && current.state != state {
            warn!(username, from = %current.state, to = %state, "unexpected state transition");
        }
        debug!(username, from = %current.state, to = %state, "state transition");
        if state == EnvState::Absent {
            entries.remove(username);
        } else {
            entries.insert(
                username.to_string(),
                EnvRecord { state, ip: ip.unwrap_or(current.ip), pending_ip: None },
            );
        }
    }

    /// Moves `username` to `state`, keeping its address. ABSENT drops the entry.
    pub fn transition(&self, username: &str, state: EnvState) {
        Self::apply(&mut self.entries(), username, state, None);
    }

    /// Like [`transition`](Self::transition) but also replaces the address.
    pub fn settle(&self, username: &str, state: EnvState, ip: Option<Ipv4Addr>) {
        Self::apply(&mut self.entries(), username, state, Some(ip));
    }

    /// Name of another non-ABSENT environment holding `ip`, current or pending.
    fn holder(entries: &HashMap<String, EnvRecord>, ip: Ipv4Addr, except: &str) -> Option<String> {
        entries
            .iter()
            .find(|(name, record)| {
                name.as_str() != except && (record.ip == Some(ip) || record.pending_ip == Some(ip))
            })
            .map(|(name, _)| name.clone())
    }

    /// Atomically checks `ip` against every other environment and marks
    /// `username` PROVISIONING on it. Returns the holder on conflict.
    pub fn claim(&self, username: &str, ip: Ipv4Addr) -> Result<(), String> {
        let mut entries = self.entries();
        if let Some(holder) = Self::holder(&entries, ip, username) {
            return Err(holder);
        }
        entries.insert(
            username.to_string(),
            EnvRecord { state: EnvState::Provisioning, ip: Some(ip), pending_ip: None },
        );
        Ok(())
    }

    /// Reserves `ip` as the pending address of an ACTIVE environment and marks it EDITING.
    pub fn claim_move(&self, username: &str, current_ip: Ipv4Addr, ip: Ipv4Addr) -> Result<(), String> {
        let mut entries = self.entries();
        if let Some(holder) = Self::holder(&entries, ip, username) {
            return Err(holder);
        }
        entries.insert(
            username.to_string(),
            EnvRecord { state: EnvState::Editing, ip: Some(current_ip), pending_ip: Some(ip) },
        );
        Ok(())
    }

    /// Environments flagged cleanup-pending on `old_username`.
    pub fn pending_on(&self, old_username: &str) -> Vec<String> {
        self.entries()
            .iter()
            .filter(|(_, record)| {
                matches!(&record.state, EnvState::Degraded(DegradedKind::CleanupPending { old_username: old }) if old == old_username)
            })
            .map(|(name, _)| name.clone())
            .collect()
    }
}
