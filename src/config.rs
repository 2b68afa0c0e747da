// src/config.rs

use std::env;
use std::fmt;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::str::FromStr;

use crate::error::ConfigError;
use crate::sys::command::Program;
use crate::sys::secrets::Credential;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Pretty,
}

/// IPv4 network that environment addresses are drawn from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Subnet {
    network: Ipv4Addr,
    prefix: u8,
}

impl Subnet {
    fn mask(&self) -> u32 {
        if self.prefix == 0 { 0 } else { u32::MAX << (32 - self.prefix) }
    }

    /// True for usable host addresses; the network and broadcast addresses are excluded.
    pub fn contains(&self, ip: Ipv4Addr) -> bool {
        let mask = self.mask();
        let raw = u32::from(ip);
        if raw & mask != u32::from(self.network) {
            return false;
        }
        if self.prefix >= 31 {
            return true;
        }
        let host = raw & !mask;
        host != 0 && host != !mask
    }
}

impl FromStr for Subnet {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (addr, prefix) = s.split_once('/').ok_or("missing '/prefix'")?;
        let addr: Ipv4Addr = addr.trim().parse().map_err(|_| "invalid IPv4 address")?;
        let prefix: u8 = prefix.trim().parse().map_err(|_| "invalid prefix length")?;
        if prefix > 32 {
            return Err("prefix length above 32".into());
        }
        let subnet = Self { network: addr, prefix };
        Ok(Self {
            network: Ipv4Addr::from(u32::from(addr) & subnet.mask()),
            prefix,
        })
    }
}

impl fmt::Display for Subnet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.network, self.prefix)
    }
}

#[derive(Debug, Clone)]
pub struct DnsConfig {
    pub zone: String,
    pub config_path: PathBuf,
    pub backup_dir: PathBuf,
    pub backup_keep: usize,
    pub reload_command: Vec<String>,
    pub reload_retries: u32,
    /// Resolver lookup run after a reload; `{hostname}` is substituted.
    /// Empty disables the check.
    pub verify_command: Vec<String>,
    pub reserved_hosts: Vec<String>,
}

#[derive(Debug)]
pub struct DatabaseConfig {
    pub docker: Program,
    pub container: String,
    pub shell: String,
    pub auth_db: String,
    pub host: String,
    pub root_username: String,
    pub root_password: Credential,
}

#[derive(Debug, Clone)]
pub struct ContainerConfig {
    pub docker: Program,
    pub build_dir: PathBuf,
    pub compose_dir: PathBuf,
    pub home_root: PathBuf,
    pub compose_template: Option<PathBuf>,
    /// (build arg name, template path) pairs.
    pub env_templates: Vec<(String, PathBuf)>,
    pub image_prefix: String,
    pub private_network: String,
    pub backend_network: String,
}

#[derive(Debug)]
pub struct AgentConfig {
    // 🛡️ SLA Boundary: Network & Identity
    pub socket_path: PathBuf,
    pub expected_api_uid: u32,
    pub log_format: LogFormat,
    pub lock_dir: Option<PathBuf>,
    pub subnet: Subnet,

    pub dns: DnsConfig,
    pub database: DatabaseConfig,
    pub container: ContainerConfig,
}

impl AgentConfig {
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str, default: &str| {
            lookup(key)
                .filter(|v| !v.trim().is_empty())
                .unwrap_or_else(|| default.to_string())
        };

        // 🛡️ Zero-Trust Identity Parsing
        // A non-numeric uid would silently disable the peer check, so we refuse to start.
        let uid_raw = var("DEVCENTER_API_UID", "1001");
        let expected_api_uid = uid_raw.parse::<u32>().map_err(|_| ConfigError::Invalid {
            key: "DEVCENTER_API_UID",
            expected: "a numeric user id",
            value: uid_raw.clone(),
        })?;

        let log_raw = var("DEVCENTER_LOG_FORMAT", "json");
        let log_format = match log_raw.as_str() {
            "json" => LogFormat::Json,
            "pretty" => LogFormat::Pretty,
            _ => {
                return Err(ConfigError::Invalid {
                    key: "DEVCENTER_LOG_FORMAT",
                    expected: "'json' or 'pretty'",
                    value: log_raw,
                });
            }
        };

        let subnet_raw = var("DEVCENTER_SUBNET", "10.251.1.0/24");
        let subnet = subnet_raw.parse::<Subnet>().map_err(|_| ConfigError::Invalid {
            key: "DEVCENTER_SUBNET",
            expected: "an IPv4 CIDR such as 10.251.1.0/24",
            value: subnet_raw.clone(),
        })?;

        let backup_raw = var("DEVCENTER_DNS_BACKUP_KEEP", "100");
        let backup_keep = backup_raw.parse::<usize>().map_err(|_| ConfigError::Invalid {
            key: "DEVCENTER_DNS_BACKUP_KEEP",
            expected: "a non-negative integer",
            value: backup_raw.clone(),
        })?;

        let retries_raw = var("DEVCENTER_DNS_RELOAD_RETRIES", "3");
        let reload_retries = retries_raw.parse::<u32>().map_err(|_| ConfigError::Invalid {
            key: "DEVCENTER_DNS_RELOAD_RETRIES",
            expected: "a non-negative integer",
            value: retries_raw.clone(),
        })?;

        let reload_command: Vec<String> = var("DEVCENTER_DNS_RELOAD_CMD", "docker restart devcenter-dns")
            .split_whitespace()
            .map(str::to_string)
            .collect();

        let verify_command: Vec<String> = var(
            "DEVCENTER_DNS_VERIFY_CMD",
            "docker run --rm --network devcenter_private busybox:1.36 nslookup {hostname} devcenter-dns",
        )
        .split_whitespace()
        .map(str::to_string)
        .collect();
        // An explicit "off" skips resolution checks, e.g. on hosts without the resolver network.
        let verify_command = if verify_command == ["off"] { Vec::new() } else { verify_command };

        let docker_raw = var("DEVCENTER_DOCKER_CMD", "docker");
        let docker_argv: Vec<String> = docker_raw.split_whitespace().map(str::to_string).collect();
        let docker = Program::from_argv(&docker_argv).ok_or(ConfigError::Invalid {
            key: "DEVCENTER_DOCKER_CMD",
            expected: "a command such as 'docker' or 'sudo -n docker'",
            value: docker_raw.clone(),
        })?;

        let root_password = lookup("DEVCENTER_MONGO_ROOT_PASSWORD")
            .filter(|v| !v.is_empty())
            .ok_or(ConfigError::Missing("DEVCENTER_MONGO_ROOT_PASSWORD"))?;

        let build_dir = PathBuf::from(var("DEVCENTER_BUILD_DIR", "/opt/devcenter"));
        let compose_dir = lookup("DEVCENTER_COMPOSE_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| build_dir.join("compose"));
        let home_root = lookup("DEVCENTER_HOME_ROOT")
            .map(PathBuf::from)
            .unwrap_or_else(|| build_dir.join("users"));

        let env_templates = parse_env_templates(&var("DEVCENTER_ENV_TEMPLATES", ""))?;

        Ok(Self {
            socket_path: PathBuf::from(var("DEVCENTER_SOCKET_PATH", "/var/run/devcenter/agent.sock")),
            expected_api_uid,
            log_format,
            lock_dir: lookup("DEVCENTER_LOCK_DIR").filter(|v| !v.is_empty()).map(PathBuf::from),
            subnet,

            dns: DnsConfig {
                zone: var("DEVCENTER_DNS_ZONE", "dev.internal"),
                config_path: PathBuf::from(var("DEVCENTER_DNS_CONFIG", "/etc/devcenter/dnsmasq.conf")),
                backup_dir: PathBuf::from(var("DEVCENTER_DNS_BACKUP_DIR", "/var/lib/devcenter/dns_backups")),
                backup_keep,
                reload_command,
                reload_retries,
                verify_command,
                reserved_hosts: var("DEVCENTER_DNS_RESERVED", "shared-mongo")
                    .split(',')
                    .map(|h| h.trim().to_string())
                    .filter(|h| !h.is_empty())
                    .collect(),
            },

            database: DatabaseConfig {
                docker: docker.clone(),
                container: var("DEVCENTER_MONGO_CONTAINER", "devcenter-mongo-shared"),
                shell: var("DEVCENTER_MONGO_SHELL", "mongosh"),
                auth_db: var("DEVCENTER_MONGO_AUTH_DB", "dev"),
                host: var("DEVCENTER_MONGO_HOST", "devcenter-mongo-shared:27017"),
                root_username: var("DEVCENTER_MONGO_ROOT_USERNAME", "root"),
                root_password: Credential::new(root_password),
            },

            container: ContainerConfig {
                docker,
                build_dir,
                compose_dir,
                home_root,
                compose_template: lookup("DEVCENTER_COMPOSE_TEMPLATE")
                    .filter(|v| !v.is_empty())
                    .map(PathBuf::from),
                env_templates,
                image_prefix: var("DEVCENTER_IMAGE_PREFIX", "devcenter"),
                private_network: var("DEVCENTER_PRIVATE_NETWORK", "devcenter_private"),
                backend_network: var("DEVCENTER_BACKEND_NETWORK", "devcenter_shared-backend"),
            },
        })
    }
}

/// Parses `NAME=path,NAME=path`. Build-arg names are restricted to `[A-Z0-9_]`.
fn parse_env_templates(raw: &str) -> Result<Vec<(String, PathBuf)>, ConfigError> {
    raw.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| {
            let invalid = || ConfigError::Invalid {
                key: "DEVCENTER_ENV_TEMPLATES",
                expected: "comma separated BUILD_ARG=path pairs",
                value: entry.to_string(),
            };
            let (name, path) = entry.split_once('=').ok_or_else(invalid)?;
            let valid_name = !name.is_empty()
                && name.chars().all(|c| c.is_ascii_uppercase() || c.is_ascii_digit() || c == '_');
            if !valid_name || path.is_empty() {
                return Err(invalid());
            }
            Ok((name.to_string(), PathBuf::from(path)))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_apply_when_only_the_password_is_set() {
        let config = AgentConfig::from_lookup(lookup_from(&[("DEVCENTER_MONGO_ROOT_PASSWORD", "pw")])).unwrap();
        assert_eq!(config.expected_api_uid, 1001);
        assert_eq!(config.log_format, LogFormat::Json);
        assert_eq!(config.dns.zone, "dev.internal");
        assert_eq!(config.dns.backup_keep, 100);
        assert_eq!(config.dns.reload_command, vec!["docker", "restart", "devcenter-dns"]);
        assert_eq!(config.dns.reserved_hosts, vec!["shared-mongo"]);
        assert_eq!(config.dns.verify_command.last().map(String::as_str), Some("devcenter-dns"));
        assert!(config.dns.verify_command.iter().any(|arg| arg == "{hostname}"));
        assert_eq!(config.container.docker, Program::new("docker"));
        assert_eq!(config.container.compose_dir, PathBuf::from("/opt/devcenter/compose"));
        assert_eq!(config.container.home_root, PathBuf::from("/opt/devcenter/users"));
        assert!(config.lock_dir.is_none());
        assert_eq!(config.subnet.to_string(), "10.251.1.0/24");
    }

    #[test]
    fn missing_admin_password_refuses_to_start() {
        let err = AgentConfig::from_lookup(lookup_from(&[])).unwrap_err();
        assert!(matches!(err, ConfigError::Missing("DEVCENTER_MONGO_ROOT_PASSWORD")));
    }

    #[test]
    fn non_numeric_uid_is_rejected() {
        let err = AgentConfig::from_lookup(lookup_from(&[
            ("DEVCENTER_MONGO_ROOT_PASSWORD", "pw"),
            ("DEVCENTER_API_UID", "root"),
        ]))
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: "DEVCENTER_API_UID", .. }));
    }

    #[test]
    fn docker_wrapper_and_disabled_resolver_check() {
        let config = AgentConfig::from_lookup(lookup_from(&[
            ("DEVCENTER_MONGO_ROOT_PASSWORD", "pw"),
            ("DEVCENTER_DOCKER_CMD", "sudo -n docker"),
            ("DEVCENTER_DNS_VERIFY_CMD", "off"),
        ]))
        .unwrap();
        assert_eq!(config.database.docker.name(), "sudo");
        assert!(config.dns.verify_command.is_empty());
    }

    #[test]
    fn env_templates_parse_and_validate() {
        let parsed = parse_env_templates("ENV_BACK_DEV=/a/.env.dev, ENV_FRONT=/a/.env.front").unwrap();
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[0].0, "ENV_BACK_DEV");
        assert_eq!(parsed[1].1, PathBuf::from("/a/.env.front"));

        assert!(parse_env_templates("").unwrap().is_empty());
        assert!(parse_env_templates("lower=/x").is_err());
        assert!(parse_env_templates("NOPATH=").is_err());
        assert!(parse_env_templates("garbage").is_err());
    }

    #[test]
    fn subnet_excludes_network_and_broadcast() {
        let subnet: Subnet = "10.251.1.0/24".parse().unwrap();
        assert!(subnet.contains(Ipv4Addr::new(10, 251, 1, 1)));
        assert!(subnet.contains(Ipv4Addr::new(10, 251, 1, 254)));
        assert!(!subnet.contains(Ipv4Addr::new(10, 251, 1, 0)));
        assert!(!subnet.contains(Ipv4Addr::new(10, 251, 1, 255)));
        assert!(!subnet.contains(Ipv4Addr::new(10, 251, 2, 10)));
    }

    #[test]
    fn subnet_normalises_host_bits() {
        let subnet: Subnet = "10.251.1.77/24".parse().unwrap();
        assert_eq!(subnet.to_string(), "10.251.1.0/24");
        assert!("10.251.1.0".parse::<Subnet>().is_err());
        assert!("10.251.1.0/33".parse::<Subnet>().is_err());
    }
}
