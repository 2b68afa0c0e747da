// src/sys/dns.rs

use async_trait::async_trait;
use regex::Regex;
use std::io::Write;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use tempfile::NamedTempFile;
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::config::DnsConfig;
use crate::error::BackendError;
use crate::sys::backups;
use crate::sys::command::Program;
use crate::sys::traits::{DnsBackend, DnsRecord};
use crate::sys::validate::validate_hostname;

const BACKUP_PREFIX: &str = "dnsmasq";

static ADDRESS_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^address=/([^/\s]+)/(\d{1,3}\.\d{1,3}\.\d{1,3}\.\d{1,3})\s*$")
        .expect("static regex is valid")
});

fn parse_line(line: &str) -> Option<DnsRecord> {
    let caps = ADDRESS_LINE.captures(line.trim_end())?;
    let ip = caps[2].parse().ok()?;
    Some(DnsRecord { hostname: caps[1].to_string(), ip })
}

fn parse_records(content: &str) -> Vec<DnsRecord> {
    content.lines().filter_map(parse_line).collect()
}

fn render_line(hostname: &str, ip: Ipv4Addr) -> String {
    format!("address=/{}/{}", hostname, ip)
}

/// Rewrites `content`, replacing (or dropping, when `ip` is `None`) every
/// record for `hostname`. Unrelated lines are kept verbatim.
fn rewrite(content: &str, hostname: &str, ip: Option<Ipv4Addr>) -> String {
    let mut out = String::with_capacity(content.len());
    for line in content.lines() {
        match parse_line(line) {
            Some(record) if record.hostname == hostname => {
                if let Some(ip) = ip {
                    out.push_str(&render_line(hostname, ip));
                    out.push('\n');
                }
            }
            _ => {
                out.push_str(line);
                out.push('\n');
            }
        }
    }
    out
}

/// True when a resolver lookup for `hostname` answered with `ip`. Lines before
/// the answer section (the resolver's own address) are skipped.
fn answers(output: &str, hostname: &str, ip: Ipv4Addr) -> bool {
    let wanted = ip.to_string();
    output
        .lines()
        .skip_while(|line| !line.contains(hostname))
        .any(|line| line.split(|c: char| !(c.is_ascii_digit() || c == '.')).any(|token| token == wanted))
}

/// Writes through a temp file in the same directory and renames it into
/// place, so the resolver never sees a half-written zone. Blocking.
fn write_zone(path: &Path, content: &str) -> Result<(), BackendError> {
    let parent = path
        .parent()
        .ok_or_else(|| BackendError::unavailable("zone file has no parent directory"))?;
    std::fs::create_dir_all(parent)
        .map_err(|e| BackendError::unavailable(format!("failed to create {:?}: {}", parent, e)))?;

    let mut tmp = NamedTempFile::new_in(parent)
        .map_err(|e| BackendError::unavailable(format!("failed to stage zone file: {}", e)))?;
    tmp.write_all(content.as_bytes())
        .and_then(|_| tmp.as_file().sync_all())
        .map_err(|e| BackendError::unavailable(format!("failed to write zone file: {}", e)))?;
    tmp.persist(path)
        .map_err(|e| BackendError::unavailable(format!("failed to replace zone file: {}", e)))?;
    Ok(())
}

/// DNS backend over a dnsmasq `address=/host/ip` file shared with the resolver.
pub struct DnsmasqBackend {
    config_path: PathBuf,
    backup_dir: PathBuf,
    backup_keep: usize,
    reload_command: Vec<String>,
    verify_command: Vec<String>,
    zone: String,
    reserved_hosts: Vec<String>,
    // Serialises read-modify-write cycles across concurrent operations.
    write_lock: Mutex<()>,
    // Written records the resolver has not answered for yet. `reload` re-checks them.
    unconfirmed: Mutex<Vec<DnsRecord>>,
}

impl DnsmasqBackend {
    pub fn new(config: &DnsConfig) -> Self {
        Self {
            config_path: config.config_path.clone(),
            backup_dir: config.backup_dir.clone(),
            backup_keep: config.backup_keep,
            reload_command: config.reload_command.clone(),
            verify_command: config.verify_command.clone(),
            zone: config.zone.clone(),
            reserved_hosts: config.reserved_hosts.clone(),
            write_lock: Mutex::new(()),
            unconfirmed: Mutex::new(Vec::new()),
        }
    }

    fn is_managed(&self, hostname: &str) -> bool {
        let Some(short) = hostname.strip_suffix(&format!(".{}", self.zone)) else {
            return false;
        };
        !self
            .reserved_hosts
            .iter()
            .any(|r| r == short || r == hostname)
    }

    async fn read_zone(&self) -> Result<String, BackendError> {
        match fs::read_to_string(&self.config_path).await {
            Ok(content) => Ok(content),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(String::new()),
            Err(e) => Err(BackendError::unavailable(format!(
                "failed to read {:?}: {}",
                self.config_path, e
            ))),
        }
    }

    async fn store_zone(&self, content: String) -> Result<(), BackendError> {
        let path = self.config_path.clone();
        tokio::task::spawn_blocking(move || write_zone(&path, &content))
            .await
            .map_err(|e| BackendError::unavailable(format!("zone writer panicked: {}", e)))?
    }

    /// Asks the resolver for `record`. Skipped when no lookup is configured.
    async fn resolves(&self, record: &DnsRecord) -> Result<(), BackendError> {
        let argv: Vec<String> = self
            .verify_command
            .iter()
            .map(|arg| arg.replace("{hostname}", &record.hostname))
            .collect();
        let Some(lookup) = Program::from_argv(&argv) else {
            return Ok(());
        };
        let out = lookup.run(Vec::<String>::new()).await?;
        if answers(&out.stdout, &record.hostname, record.ip) {
            Ok(())
        } else {
            Err(BackendError::unavailable(format!(
                "{} does not resolve to {} yet",
                record.hostname, record.ip
            )))
        }
    }

    /// Backup, rewrite, prune, reload, resolve. The write is never rolled back
    /// once it lands; a failing reload, or a resolver that does not answer
    /// with `expect`, surfaces as `ReloadUnconfirmed`.
    async fn mutate<F>(&self, hostname: &str, expect: Option<Ipv4Addr>, change: F) -> Result<(), BackendError>
    where
        F: FnOnce(&str, &[DnsRecord]) -> Result<String, BackendError>,
    {
        validate_hostname(hostname)?;
        let _guard = self.write_lock.lock().await;

        let current = self.read_zone().await?;
        let records = parse_records(&current);
        let updated = change(&current, &records)?;

        if !current.is_empty() {
            backups::write_backup(&self.backup_dir, BACKUP_PREFIX, &current)
                .await
                .map_err(|e| BackendError::unavailable(format!("refusing to edit zone without backup: {}", e)))?;
        }

        self.store_zone(updated).await?;

        {
            // The latest write supersedes anything still pending for this host.
            let mut unconfirmed = self.unconfirmed.lock().await;
            unconfirmed.retain(|r| r.hostname != hostname);
            if let Some(ip) = expect {
                unconfirmed.push(DnsRecord { hostname: hostname.to_string(), ip });
            }
        }

        if let Err(e) = backups::prune_backups(&self.backup_dir, BACKUP_PREFIX, self.backup_keep).await {
            warn!(error = %e, "DNS backup pruning failed");
        }

        self.reload()
            .await
            .map_err(|e| BackendError::ReloadUnconfirmed(format!("{}: {}", hostname, e)))
    }
}

#[async_trait]
impl DnsBackend for DnsmasqBackend {
    async fn create(&self, hostname: &str, ip: Ipv4Addr) -> Result<(), BackendError> {
        self.mutate(hostname, Some(ip), |current, records| {
            if records.iter().any(|r| r.hostname == hostname) {
                return Err(BackendError::AlreadyExists(format!("dns record {}", hostname)));
            }
            let mut updated = current.to_string();
            if !updated.is_empty() && !updated.ends_with('\n') {
                updated.push('\n');
            }
            updated.push_str(&render_line(hostname, ip));
            updated.push('\n');
            Ok(updated)
        })
        .await?;
        info!(hostname, %ip, "DNS record added");
        Ok(())
    }

    async fn update(&self, hostname: &str, ip: Ipv4Addr) -> Result<(), BackendError> {
        self.mutate(hostname, Some(ip), |current, records| {
            if !records.iter().any(|r| r.hostname == hostname) {
                return Err(BackendError::NotFound(format!("dns record {}", hostname)));
            }
            Ok(rewrite(current, hostname, Some(ip)))
        })
        .await?;
        info!(hostname, %ip, "DNS record updated");
        Ok(())
    }

    async fn remove(&self, hostname: &str) -> Result<(), BackendError> {
        self.mutate(hostname, None, |current, records| {
            if !records.iter().any(|r| r.hostname == hostname) {
                return Err(BackendError::NotFound(format!("dns record {}", hostname)));
            }
            Ok(rewrite(current, hostname, None))
        })
        .await?;
        info!(hostname, "DNS record removed");
        Ok(())
    }

    async fn list(&self) -> Result<Vec<DnsRecord>, BackendError> {
        let content = self.read_zone().await?;
        let mut records: Vec<DnsRecord> = parse_records(&content)
            .into_iter()
            .filter(|r| self.is_managed(&r.hostname))
            .collect();
        records.sort_by(|a, b| a.hostname.cmp(&b.hostname));
        Ok(records)
    }

    async fn reload(&self) -> Result<(), BackendError> {
        let reload = Program::from_argv(&self.reload_command)
            .ok_or_else(|| BackendError::unavailable("no DNS reload command configured"))?;
        reload.run_checked(Vec::<String>::new()).await?;

        // A restart is only confirmed once every pending record resolves.
        let mut unconfirmed = self.unconfirmed.lock().await;
        let mut still_pending = Vec::new();
        let mut last_err = None;
        for record in unconfirmed.drain(..) {
            if let Err(e) = self.resolves(&record).await {
                warn!(hostname = %record.hostname, ip = %record.ip, error = %e, "record not resolving after reload");
                still_pending.push(record);
                last_err = Some(e);
            }
        }
        *unconfirmed = still_pending;
        match last_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn backend(dir: &TempDir, reload: &str) -> DnsmasqBackend {
        backend_resolving(dir, reload, Vec::new())
    }

    fn backend_resolving(dir: &TempDir, reload: &str, verify_command: Vec<String>) -> DnsmasqBackend {
        DnsmasqBackend::new(&DnsConfig {
            zone: "dev.internal".into(),
            config_path: dir.path().join("dnsmasq.conf"),
            backup_dir: dir.path().join("backups"),
            backup_keep: 2,
            reload_command: vec![reload.to_string()],
            reload_retries: 0,
            verify_command,
            reserved_hosts: vec!["shared-mongo".into()],
        })
    }

    fn ip(last: u8) -> Ipv4Addr {
        Ipv4Addr::new(10, 251, 1, last)
    }

    #[tokio::test]
    async fn create_list_update_remove_cycle() {
        let dir = tempfile::tempdir().unwrap();
        let dns = backend(&dir, "true");

        dns.create("alice.dev.internal", ip(10)).await.unwrap();
        dns.create("bob.dev.internal", ip(11)).await.unwrap();
        assert_eq!(dns.list().await.unwrap().len(), 2);

        dns.update("alice.dev.internal", ip(20)).await.unwrap();
        let records = dns.list().await.unwrap();
        assert_eq!(records[0], DnsRecord { hostname: "alice.dev.internal".into(), ip: ip(20) });

        dns.remove("alice.dev.internal").await.unwrap();
        let records = dns.list().await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].hostname, "bob.dev.internal");
    }

    #[tokio::test]
    async fn duplicate_and_missing_records_are_reported() {
        let dir = tempfile::tempdir().unwrap();
        let dns = backend(&dir, "true");

        dns.create("alice.dev.internal", ip(10)).await.unwrap();
        let err = dns.create("alice.dev.internal", ip(12)).await.unwrap_err();
        assert!(matches!(err, BackendError::AlreadyExists(_)));

        assert!(dns.update("ghost.dev.internal", ip(3)).await.unwrap_err().is_not_found());
        assert!(dns.remove("ghost.dev.internal").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn reload_failure_keeps_the_write() {
        let dir = tempfile::tempdir().unwrap();
        let dns = backend(&dir, "false");

        let err = dns.create("alice.dev.internal", ip(10)).await.unwrap_err();
        assert!(matches!(err, BackendError::ReloadUnconfirmed(_)));

        let records = dns.list().await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].ip, ip(10));
    }

    #[tokio::test]
    async fn resolver_answer_confirms_the_write() {
        let dir = tempfile::tempdir().unwrap();
        let answer = dir.path().join("answer");
        std::fs::write(&answer, "Server: devcenter-dns\nAddress: 10.251.1.2:53\n\nName: alice.dev.internal\nAddress: 10.251.1.99\n").unwrap();
        let lookup = vec!["cat".to_string(), answer.to_string_lossy().to_string()];
        let dns = backend_resolving(&dir, "true", lookup);

        // Stale answer: the write stays, the change is unconfirmed.
        let err = dns.create("alice.dev.internal", ip(10)).await.unwrap_err();
        assert!(matches!(err, BackendError::ReloadUnconfirmed(_)));
        assert_eq!(dns.list().await.unwrap()[0].ip, ip(10));
        assert!(dns.reload().await.is_err());

        // Once the resolver catches up, a bare reload confirms it.
        std::fs::write(&answer, "Name: alice.dev.internal\nAddress: 10.251.1.10\n").unwrap();
        dns.reload().await.unwrap();
        dns.reload().await.unwrap();
    }

    #[tokio::test]
    async fn removal_drops_a_pending_confirmation() {
        let dir = tempfile::tempdir().unwrap();
        let lookup = vec!["echo".to_string(), "no answer for {hostname}".to_string()];
        let dns = backend_resolving(&dir, "true", lookup);

        assert!(dns.create("alice.dev.internal", ip(10)).await.is_err());
        dns.remove("alice.dev.internal").await.unwrap();
        dns.reload().await.unwrap();
    }

    #[test]
    fn answers_ignore_the_resolver_address() {
        let out = "Server:\t\t10.251.1.10\nAddress:\t10.251.1.10:53\n\nName:\talice.dev.internal\nAddress: 10.251.1.20\n";
        assert!(answers(out, "alice.dev.internal", ip(20)));
        assert!(!answers(out, "alice.dev.internal", ip(10)));
        assert!(!answers("** server can't find alice.dev.internal: NXDOMAIN", "alice.dev.internal", ip(20)));
    }

    #[tokio::test]
    async fn reserved_and_foreign_lines_survive_but_are_not_listed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dnsmasq.conf");
        std::fs::write(
            &path,
            "# resolver settings\nno-resolv\naddress=/shared-mongo.dev.internal/10.251.0.2\naddress=/other.example.org/1.2.3.4\n",
        )
        .unwrap();
        let dns = backend(&dir, "true");

        assert!(dns.list().await.unwrap().is_empty());

        dns.create("alice.dev.internal", ip(10)).await.unwrap();
        dns.remove("alice.dev.internal").await.unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.contains("no-resolv"));
        assert!(content.contains("address=/shared-mongo.dev.internal/10.251.0.2"));
        assert!(content.contains("address=/other.example.org/1.2.3.4"));
        assert!(!content.contains("alice"));
    }

    #[tokio::test]
    async fn mutations_leave_bounded_backups() {
        let dir = tempfile::tempdir().unwrap();
        let dns = backend(&dir, "true");

        for last in 10..15 {
            dns.create(&format!("u{}.dev.internal", last), ip(last)).await.unwrap();
        }

        let backups = std::fs::read_dir(dir.path().join("backups")).unwrap().count();
        assert_eq!(backups, 2);
    }

    #[tokio::test]
    async fn injected_hostnames_are_rejected_before_touching_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let dns = backend(&dir, "true");

        let err = dns.create("evil.dev.internal/1.1.1.1\nserver=", ip(10)).await.unwrap_err();
        assert!(matches!(err, BackendError::Invalid(_)));
        assert!(!dir.path().join("dnsmasq.conf").exists());
    }

    #[test]
    fn rewrite_touches_only_the_target_host() {
        let content = "address=/a.dev.internal/10.251.1.1\naddress=/b.dev.internal/10.251.1.2\n";
        let updated = rewrite(content, "a.dev.internal", Some(ip(9)));
        assert_eq!(updated, "address=/a.dev.internal/10.251.1.9\naddress=/b.dev.internal/10.251.1.2\n");
        let removed = rewrite(content, "b.dev.internal", None);
        assert_eq!(removed, "address=/a.dev.internal/10.251.1.1\n");
    }
}
