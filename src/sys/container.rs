// src/sys/container.rs

use async_trait::async_trait;
use regex::Regex;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use tokio::fs;
use tracing::{error, info, warn};
use zeroize::Zeroizing;

use crate::config::ContainerConfig;
use crate::error::BackendError;
use crate::sys::command::Program;
use crate::sys::image::{BuildArg, ImageBuilder};
use crate::sys::secrets::CredentialBundle;
use crate::sys::traits::{ContainerBackend, ContainerInstance, InstanceStatus, RecreateSpec};
use crate::sys::validate::validate_username;

const COMPOSE_PREFIX: &str = "docker-compose.";
const COMPOSE_SUFFIX: &str = ".yml";

const DEFAULT_TEMPLATE: &str = r#"services:
  {{ container_name }}:
    image: {{ image }}
    container_name: {{ container_name }}
    hostname: {{ username }}
    restart: unless-stopped
    volumes:
      - {{ home_dir }}:/home/{{ username }}
    networks:
      {{ private_network }}:
        ipv4_address: {{ ipv4_address }}
      {{ backend_network }}: {}

networks:
  {{ private_network }}:
    external: true
  {{ backend_network }}:
    external: true
"#;

static COMPOSE_IP: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"ipv4_address:\s*"?(\d{1,3}\.\d{1,3}\.\d{1,3}\.\d{1,3})"#).expect("static regex is valid")
});

/// Substitutes `{{ key }}` placeholders.
fn render_template(template: &str, values: &[(&str, &str)]) -> String {
    values.iter().fold(template.to_string(), |acc, (key, value)| {
        acc.replace(&format!("{{{{ {} }}}}", key), value)
    })
}

/// Rewrites the `DB_PATH=` line of an env template to point at the member's
/// own database. Every other line passes through untouched.
fn render_env_template(content: &str, username: &str, db_password: &str, db_host: &str, auth_db: &str) -> Zeroizing<String> {
    let mut out = Zeroizing::new(String::with_capacity(content.len() + 64));
    for line in content.lines() {
        if line.starts_with("DB_PATH=") {
            out.push_str(&format!(
                "DB_PATH=mongodb://{user}:{pw}@{host}/{user}?authSource={auth}",
                user = username,
                pw = db_password,
                host = db_host,
                auth = auth_db
            ));
        } else {
            out.push_str(line);
        }
        out.push('\n');
    }
    out
}

fn compose_ip(content: &str) -> Option<Ipv4Addr> {
    COMPOSE_IP.captures(content)?.get(1)?.as_str().parse().ok()
}

fn map_docker_state(state: &str) -> InstanceStatus {
    match state.trim() {
        "running" => InstanceStatus::Running,
        "created" | "restarting" => InstanceStatus::Starting,
        "exited" | "paused" => InstanceStatus::Stopped,
        _ => InstanceStatus::Error,
    }
}

/// Container backend built on per-member compose files and images.
pub struct DockerComposeBackend {
    docker: Program,
    compose_dir: PathBuf,
    home_root: PathBuf,
    template_path: Option<PathBuf>,
    env_templates: Vec<(String, PathBuf)>,
    image_prefix: String,
    private_network: String,
    backend_network: String,
    db_host: String,
    auth_db: String,
    images: ImageBuilder,
}

impl DockerComposeBackend {
    pub fn new(config: &ContainerConfig, db_host: String, auth_db: String) -> Self {
        Self {
            docker: config.docker.clone(),
            compose_dir: config.compose_dir.clone(),
            home_root: config.home_root.clone(),
            template_path: config.compose_template.clone(),
            env_templates: config.env_templates.clone(),
            image_prefix: config.image_prefix.clone(),
            private_network: config.private_network.clone(),
            backend_network: config.backend_network.clone(),
            db_host,
            auth_db,
            images: ImageBuilder::new(
                config.docker.clone(),
                config.build_dir.clone(),
                format!("{}-base", config.image_prefix),
            ),
        }
    }

    fn compose_file(&self, username: &str) -> PathBuf {
        self.compose_dir.join(format!("{}{}{}", COMPOSE_PREFIX, username, COMPOSE_SUFFIX))
    }

    fn home_dir(&self, username: &str) -> PathBuf {
        self.home_root.join(username)
    }

    fn instance_name(&self, username: &str) -> String {
        format!("{}-{}", self.image_prefix, username)
    }

    /// Usernames with a compose file on disk, paired with the address in it.
    async fn known_instances(&self) -> Result<Vec<(String, Option<Ipv4Addr>)>, BackendError> {
        let mut entries = match fs::read_dir(&self.compose_dir).await {
            Ok(dir) => dir,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(BackendError::unavailable(format!(
                    "failed to read compose directory: {}",
                    e
                )));
            }
        };

        let mut found = Vec::new();
        while let Ok(Some(entry)) = entries.next_entry().await {
            let path = entry.path();
            let Some(username) = path
                .file_name()
                .and_then(|n| n.to_str())
                .and_then(|n| n.strip_prefix(COMPOSE_PREFIX))
                .and_then(|n| n.strip_suffix(COMPOSE_SUFFIX))
                .map(str::to_string)
            else {
                continue;
            };
            let ip = fs::read_to_string(&path).await.ok().as_deref().and_then(compose_ip);
            found.push((username, ip));
        }
        found.sort();
        Ok(found)
    }

    async fn ensure_ip_free(&self, ip: Ipv4Addr, except: &[&str]) -> Result<(), BackendError> {
        for (other, bound) in self.known_instances().await? {
            if bound == Some(ip) && !except.contains(&other.as_str()) {
                return Err(BackendError::ResourceConflict(format!(
                    "{} is already bound to instance {}",
                    ip, other
                )));
            }
        }
        Ok(())
    }

    async fn render_compose(&self, username: &str, ip: Ipv4Addr) -> Result<String, BackendError> {
        let template = match &self.template_path {
            Some(path) => fs::read_to_string(path).await.map_err(|e| {
                BackendError::unavailable(format!("failed to read compose template {:?}: {}", path, e))
            })?,
            None => DEFAULT_TEMPLATE.to_string(),
        };
        let name = self.instance_name(username);
        let home = self.home_dir(username).to_string_lossy().to_string();
        let ip = ip.to_string();
        Ok(render_template(
            &template,
            &[
                ("username", username),
                ("container_name", name.as_str()),
                ("image", name.as_str()),
                ("ipv4_address", ip.as_str()),
                ("home_dir", home.as_str()),
                ("private_network", self.private_network.as_str()),
                ("backend_network", self.backend_network.as_str()),
            ],
        ))
    }

    async fn build_args(&self, username: &str, credentials: &CredentialBundle) -> Result<Vec<BuildArg>, BackendError> {
        let mut args = vec![
            BuildArg::new("SSH_PASSWORD", credentials.ssh_password.use_secret(|pw| Zeroizing::new(pw.to_string()))),
            BuildArg::new("DEV_USER", Zeroizing::new(username.to_string())),
        ];
        for (name, path) in &self.env_templates {
            let raw = Zeroizing::new(fs::read_to_string(path).await.map_err(|e| {
                BackendError::unavailable(format!("env template {:?} unreadable: {}", path, e))
            })?);
            let rendered = credentials
                .db_password
                .use_secret(|pw| render_env_template(&raw, username, pw, &self.db_host, &self.auth_db));
            args.push(BuildArg::new(name.clone(), rendered));
        }
        Ok(args)
    }

    async fn compose(&self, username: &str, action: &[&str]) -> Result<(), BackendError> {
        let file = self.compose_file(username);
        let project = self.instance_name(username);
        let file_str = file.to_string_lossy().to_string();
        let mut args: Vec<&str> = vec!["compose", "-p", project.as_str(), "-f", file_str.as_str()];
        args.extend_from_slice(action);
        self.docker.run_checked(&args).await?;
        Ok(())
    }

    async fn write_compose(&self, username: &str, content: &str) -> Result<(), BackendError> {
        fs::create_dir_all(&self.compose_dir)
            .await
            .map_err(|e| BackendError::unavailable(format!("failed to create compose directory: {}", e)))?;
        fs::write(self.compose_file(username), content)
            .await
            .map_err(|e| BackendError::unavailable(format!("failed to write compose file: {}", e)))
    }

    /// Stops the instance and retires its compose file. The file only goes
    /// once `down` succeeded: it is what `list` reads, so a container that may
    /// still hold its address must stay visible.
    async fn take_down(&self, username: &str) -> Result<(), BackendError> {
        let file = self.compose_file(username);
        if !file.exists() {
            return Ok(());
        }
        self.compose(username, &["down"]).await.map_err(|e| {
            BackendError::CompensationFailed(format!("instance {} not stopped: {}", self.instance_name(username), e))
        })?;
        fs::remove_file(&file).await.map_err(|e| {
            BackendError::CompensationFailed(format!("compose file {:?} not retired: {}", file, e))
        })
    }

    /// Tears down a half-created instance. Image and home leftovers are only
    /// logged; a container that would not stop is a `CompensationFailed`.
    async fn discard_partial(&self, username: &str, created_home: bool) -> Result<(), BackendError> {
        self.take_down(username).await?;
        if let Err(e) = self.images.remove(&self.instance_name(username)).await {
            warn!(username, error = %e, "partial member image left behind");
        }
        if created_home {
            if let Err(e) = fs::remove_dir_all(self.home_dir(username)).await {
                warn!(username, error = %e, "partial home volume left behind");
            }
        }
        Ok(())
    }

    /// Puts the previous instance back after a failed recreate.
    async fn restore(&self, username: &str, target: &str, old_compose: &str) -> Result<(), BackendError> {
        if target != username {
            self.take_down(target).await?;
            if let Err(e) = self.images.remove(&self.instance_name(target)).await {
                warn!(target, error = %e, "member image for abandoned identity left behind");
            }
            if self.home_dir(target).exists() {
                fs::rename(self.home_dir(target), self.home_dir(username))
                    .await
                    .map_err(|e| BackendError::CompensationFailed(format!("home volume not moved back: {}", e)))?;
            }
        }
        self.write_compose(username, old_compose)
            .await
            .map_err(|e| BackendError::CompensationFailed(e.to_string()))?;
        self.compose(username, &["up", "-d"])
            .await
            .map_err(|e| BackendError::CompensationFailed(format!("previous instance not restarted: {}", e)))
    }
}

async fn dir_exists(path: &Path) -> bool {
    fs::metadata(path).await.map(|m| m.is_dir()).unwrap_or(false)
}

#[async_trait]
impl ContainerBackend for DockerComposeBackend {
    async fn create(&self, username: &str, ip: Ipv4Addr, credentials: &CredentialBundle) -> Result<(), BackendError> {
        validate_username(username)?;

        if self.compose_file(username).exists() {
            return Err(BackendError::AlreadyExists(format!("container for {}", username)));
        }
        self.ensure_ip_free(ip, &[]).await?;

        let tag = self.instance_name(username);
        if self.images.image_exists(&tag).await? {
            warn!(tag, "stale member image found, rebuilding");
            self.images.remove(&tag).await?;
        }

        let home = self.home_dir(username);
        let created_home = !dir_exists(&home).await;
        fs::create_dir_all(&home)
            .await
            .map_err(|e| BackendError::unavailable(format!("failed to create home volume {:?}: {}", home, e)))?;

        let result = async {
            let args = self.build_args(username, credentials).await?;
            self.images.build_member(&tag, &args).await?;
            let compose = self.render_compose(username, ip).await?;
            self.write_compose(username, &compose).await?;
            self.compose(username, &["up", "-d"]).await
        }
        .await;

        if let Err(e) = result {
            error!(username, error = %e, "container create failed, discarding partial instance");
            self.discard_partial(username, created_home).await?;
            return Err(e);
        }

        info!(username, %ip, "container started");
        Ok(())
    }

    async fn recreate(&self, username: &str, spec: RecreateSpec<'_>) -> Result<(), BackendError> {
        validate_username(username)?;
        let target = spec.new_username.unwrap_or(username);
        validate_username(target)?;

        // Preflight: nothing is torn down until every check passes.
        let old_compose = match fs::read_to_string(self.compose_file(username)).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(BackendError::NotFound(format!("container for {}", username)));
            }
            Err(e) => return Err(BackendError::unavailable(format!("failed to read compose file: {}", e))),
        };

        let home = self.home_dir(username);
        if !dir_exists(&home).await {
            return Err(BackendError::VolumeMissing(home.to_string_lossy().to_string()));
        }

        if target != username {
            if self.compose_file(target).exists() {
                return Err(BackendError::AlreadyExists(format!("container for {}", target)));
            }
            if self.home_dir(target).exists() {
                return Err(BackendError::ResourceConflict(format!("home volume for {} already exists", target)));
            }
            if spec.credentials.is_none() {
                return Err(BackendError::invalid("renaming an instance requires fresh credentials"));
            }
        }

        let ip = match spec.new_ip.or_else(|| compose_ip(&old_compose)) {
            Some(ip) => ip,
            None => return Err(BackendError::unavailable(format!("no address recorded for {}", username))),
        };
        self.ensure_ip_free(ip, &[username]).await?;

        // Build first so a failed build leaves the running instance alone.
        if let Some(credentials) = spec.credentials {
            let args = self.build_args(target, credentials).await?;
            self.images.build_member(&self.instance_name(target), &args).await?;
        }

        self.compose(username, &["down"]).await?;

        let result = async {
            if target != username {
                fs::rename(&home, self.home_dir(target))
                    .await
                    .map_err(|e| BackendError::unavailable(format!("failed to move home volume: {}", e)))?;
                fs::remove_file(self.compose_file(username))
                    .await
                    .map_err(|e| BackendError::unavailable(format!("failed to retire compose file: {}", e)))?;
            }
            let compose = self.render_compose(target, ip).await?;
            self.write_compose(target, &compose).await?;
            self.compose(target, &["up", "-d"]).await
        }
        .await;

        if let Err(e) = result {
            error!(username, target, error = %e, "recreate failed, restoring previous instance");
            return match self.restore(username, target, &old_compose).await {
                Ok(()) => Err(e),
                Err(restore_err) => Err(restore_err),
            };
        }

        if target != username {
            if let Err(e) = self.images.remove(&self.instance_name(username)).await {
                warn!(username, error = %e, "old member image left behind");
            }
        }

        info!(username, target, %ip, "container recreated");
        Ok(())
    }

    async fn remove(&self, username: &str) -> Result<(), BackendError> {
        validate_username(username)?;

        let compose_file = self.compose_file(username);
        if !compose_file.exists() {
            return Err(BackendError::NotFound(format!("container for {}", username)));
        }

        // The compose file goes last so a retry after any failure finds it again.
        self.compose(username, &["down"]).await?;
        self.images.remove(&self.instance_name(username)).await?;

        let home = self.home_dir(username);
        if dir_exists(&home).await {
            fs::remove_dir_all(&home)
                .await
                .map_err(|e| BackendError::unavailable(format!("failed to delete home volume {:?}: {}", home, e)))?;
        }

        fs::remove_file(&compose_file)
            .await
            .map_err(|e| BackendError::unavailable(format!("failed to delete compose file: {}", e)))?;

        info!(username, "container, image and home volume removed");
        Ok(())
    }

    async fn status(&self, username: &str) -> Result<InstanceStatus, BackendError> {
        validate_username(username)?;
        if !self.compose_file(username).exists() {
            return Ok(InstanceStatus::Absent);
        }
        let name = self.instance_name(username);
        let out = self.docker.run(["inspect", "-f", "{{.State.Status}}", name.as_str()]).await?;
        if !out.success {
            // Configured but no container object yet.
            return Ok(InstanceStatus::Stopped);
        }
        Ok(map_docker_state(&out.stdout))
    }

    async fn list(&self) -> Result<Vec<ContainerInstance>, BackendError> {
        let mut instances = Vec::new();
        for (username, ip) in self.known_instances().await? {
            if validate_username(&username).is_err() {
                warn!(file = %username, "ignoring compose file with unexpected name");
                continue;
            }
            let status = self.status(&username).await?;
            instances.push(ContainerInstance { username, ip, status });
        }
        Ok(instances)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    /// Stand-in for the docker CLI: images are never present, builds pass,
    /// `up` fails. `down` fails too when `stuck` is set.
    fn fake_docker(dir: &TempDir, stuck: bool) -> Program {
        let down = if stuck { "echo 'container is wedged' >&2; exit 1" } else { "exit 0" };
        let script = format!(
            "case \"$*\" in\n  *' down'*) {down} ;;\n  *' up '*) echo 'address already in use' >&2; exit 1 ;;\n  'image inspect'*) exit 1 ;;\nesac\nexit 0\n"
        );
        let path = dir.path().join("docker.sh");
        std::fs::write(&path, script).unwrap();
        std::fs::write(dir.path().join("Dockerfile.base"), "FROM scratch\n").unwrap();
        Program::from_argv(&["sh".to_string(), path.to_string_lossy().to_string()]).unwrap()
    }

    fn backend(dir: &TempDir) -> DockerComposeBackend {
        backend_with(dir, Program::new("docker"))
    }

    fn backend_with(dir: &TempDir, docker: Program) -> DockerComposeBackend {
        let config = ContainerConfig {
            docker,
            build_dir: dir.path().to_path_buf(),
            compose_dir: dir.path().join("compose"),
            home_root: dir.path().join("users"),
            compose_template: None,
            env_templates: Vec::new(),
            image_prefix: "devcenter".into(),
            private_network: "devcenter_private".into(),
            backend_network: "devcenter_shared-backend".into(),
        };
        DockerComposeBackend::new(&config, "mongo:27017".into(), "dev".into())
    }

    fn ip(last: u8) -> Ipv4Addr {
        Ipv4Addr::new(10, 251, 1, last)
    }

    async fn seed(backend: &DockerComposeBackend, username: &str, last: u8, with_home: bool) {
        let compose = backend.render_compose(username, ip(last)).await.unwrap();
        backend.write_compose(username, &compose).await.unwrap();
        if with_home {
            fs::create_dir_all(backend.home_dir(username)).await.unwrap();
        }
    }

    #[tokio::test]
    async fn default_template_renders_identity_and_address() {
        let dir = tempfile::tempdir().unwrap();
        let backend = backend(&dir);
        let compose = backend.render_compose("alice", ip(10)).await.unwrap();

        assert!(compose.contains("container_name: devcenter-alice"));
        assert!(compose.contains("ipv4_address: 10.251.1.10"));
        assert!(compose.contains(":/home/alice"));
        assert!(!compose.contains("{{"));
        assert_eq!(compose_ip(&compose), Some(ip(10)));
    }

    #[test]
    fn env_template_rewrites_only_db_path() {
        let rendered = render_env_template("PORT=80\nDB_PATH=mongodb://localhost/x\nMODE=dev", "alice", "pw", "mongo:27017", "dev");
        assert_eq!(
            rendered.as_str(),
            "PORT=80\nDB_PATH=mongodb://alice:pw@mongo:27017/alice?authSource=dev\nMODE=dev\n"
        );
    }

    #[test]
    fn docker_states_map_to_instance_status() {
        assert_eq!(map_docker_state("running\n"), InstanceStatus::Running);
        assert_eq!(map_docker_state("created"), InstanceStatus::Starting);
        assert_eq!(map_docker_state("exited"), InstanceStatus::Stopped);
        assert_eq!(map_docker_state("dead"), InstanceStatus::Error);
    }

    #[tokio::test]
    async fn known_instances_reads_compose_directory() {
        let dir = tempfile::tempdir().unwrap();
        let backend = backend(&dir);
        assert!(backend.known_instances().await.unwrap().is_empty());

        seed(&backend, "bob", 11, false).await;
        seed(&backend, "alice", 10, false).await;
        fs::write(dir.path().join("compose").join("notes.txt"), "x").await.unwrap();

        let found = backend.known_instances().await.unwrap();
        assert_eq!(found, vec![("alice".to_string(), Some(ip(10))), ("bob".to_string(), Some(ip(11)))]);
    }

    #[tokio::test]
    async fn create_rejects_existing_instance_and_bound_address() {
        let dir = tempfile::tempdir().unwrap();
        let backend = backend(&dir);
        seed(&backend, "alice", 10, true).await;
        let creds = CredentialBundle::generate("x.dev.internal".into());

        let err = backend.create("alice", ip(12), &creds).await.unwrap_err();
        assert!(matches!(err, BackendError::AlreadyExists(_)));

        let err = backend.create("bob", ip(10), &creds).await.unwrap_err();
        assert!(matches!(err, BackendError::ResourceConflict(_)));
    }

    #[tokio::test]
    async fn failed_start_discards_the_partial_instance() {
        let dir = tempfile::tempdir().unwrap();
        let backend = backend_with(&dir, fake_docker(&dir, false));
        let creds = CredentialBundle::generate("alice.dev.internal".into());

        let err = backend.create("alice", ip(10), &creds).await.unwrap_err();
        assert!(matches!(err, BackendError::Unavailable(_)));
        assert!(backend.known_instances().await.unwrap().is_empty());
        assert!(!backend.home_dir("alice").exists());
    }

    #[tokio::test]
    async fn instance_that_will_not_stop_stays_visible() {
        let dir = tempfile::tempdir().unwrap();
        let backend = backend_with(&dir, fake_docker(&dir, true));
        let creds = CredentialBundle::generate("alice.dev.internal".into());

        let err = backend.create("alice", ip(10), &creds).await.unwrap_err();
        assert!(matches!(err, BackendError::CompensationFailed(_)));

        // The compose file still claims the address, so list and later creates see it.
        let listed = backend.list().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].username, "alice");
        assert_eq!(listed[0].ip, Some(ip(10)));
        assert!(backend.home_dir("alice").exists());

        let err = backend.create("bob", ip(10), &creds).await.unwrap_err();
        assert!(matches!(err, BackendError::ResourceConflict(_)));
    }

    #[tokio::test]
    async fn recreate_of_unknown_instance_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let backend = backend(&dir);
        let err = backend.recreate("ghost", RecreateSpec::default()).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn recreate_refuses_when_home_volume_is_missing() {
        let dir = tempfile::tempdir().unwrap();
        let backend = backend(&dir);
        seed(&backend, "alice", 10, false).await;

        let spec = RecreateSpec { new_ip: Some(ip(20)), ..Default::default() };
        let err = backend.recreate("alice", spec).await.unwrap_err();
        assert!(matches!(err, BackendError::VolumeMissing(_)));

        // Nothing was torn down or rewritten.
        let compose = fs::read_to_string(backend.compose_file("alice")).await.unwrap();
        assert_eq!(compose_ip(&compose), Some(ip(10)));
    }

    #[tokio::test]
    async fn rename_without_credentials_is_invalid() {
        let dir = tempfile::tempdir().unwrap();
        let backend = backend(&dir);
        seed(&backend, "alice", 10, true).await;

        let spec = RecreateSpec { new_username: Some("alice2"), ..Default::default() };
        let err = backend.recreate("alice", spec).await.unwrap_err();
        assert!(matches!(err, BackendError::Invalid(_)));
        assert!(backend.home_dir("alice").exists());
    }

    #[tokio::test]
    async fn remove_of_unknown_instance_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let backend = backend(&dir);
        assert!(backend.remove("ghost").await.unwrap_err().is_not_found());
        assert_eq!(backend.status("ghost").await.unwrap(), InstanceStatus::Absent);
    }
}
