//! Simulated container engine and checkout fixtures for pipeline tests.

#![allow(dead_code)]

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use anyhow::Result;
use selfhost_installer::{
    Cleanup, CleanupReason, CommandOutput, CommandRunner, CommandSpec, InstallConfig,
};
use tempfile::TempDir;

pub const SNUBA_TSDB_LINE: &str = r#"SENTRY_TSDB = "sentry.tsdb.redissnuba.RedisSnubaTSDB""#;

pub const CONFIG_YML_EXAMPLE: &str = "\
mail.backend: 'dummy'

# A new key can be generated with `$ sentry config generate-secret-key`
system.secret-key: '!!changeme!!'
";

pub const RELAY_CREDENTIALS: &str = r#"{"secret_key":"k2Y","public_key":"p7Q","id":"88888888-4444-4444-8444-cccccccccccc"}"#;

/// Mutable engine state the fake answers from.
#[derive(Debug, Clone)]
pub struct Engine {
    pub docker_version: String,
    pub compose_version: String,
    pub cpus: u32,
    pub ram_mb: u64,
    pub has_sse42: bool,
    pub kvm_guest: bool,
    pub volumes: BTreeSet<String>,
    pub topics: BTreeSet<String>,
    pub services: Vec<String>,
    pub pg_version: Option<String>,
    pub data_entries: Vec<String>,
    pub data_nested: bool,
    /// Health probes that fail before one answers `ok`.
    pub unhealthy_probes: u32,
    /// Any command whose line contains this exits 1.
    pub fail_on: Option<String>,
    pub log: Vec<String>,
}

impl Default for Engine {
    fn default() -> Self {
        Self {
            docker_version: "24.0.7".into(),
            compose_version: "2.24.5".into(),
            cpus: 8,
            ram_mb: 16_000,
            has_sse42: true,
            kvm_guest: false,
            volumes: BTreeSet::new(),
            topics: BTreeSet::new(),
            services: [
                "clickhouse",
                "kafka",
                "nginx",
                "postgres",
                "redis",
                "relay",
                "snuba-api",
                "web",
                "worker",
                "zookeeper",
            ]
            .iter()
            .map(|s| (*s).to_string())
            .collect(),
            pg_version: None,
            data_entries: Vec::new(),
            data_nested: false,
            unhealthy_probes: 0,
            fail_on: None,
            log: Vec::new(),
        }
    }
}

/// A [`CommandRunner`] that behaves like a docker host.
#[derive(Default)]
pub struct FakeDocker {
    engine: Mutex<Engine>,
    signal: OnceLock<(String, Arc<Cleanup>)>,
}

impl FakeDocker {
    pub fn new(engine: Engine) -> Arc<Self> {
        Arc::new(Self {
            engine: Mutex::new(engine),
            signal: OnceLock::new(),
        })
    }

    /// Deliver SIGTERM to `cleanup` while the first command containing
    /// `needle` is still running.
    pub fn signal_during(&self, needle: &str, cleanup: Arc<Cleanup>) {
        let _ = self.signal.set((needle.to_string(), cleanup));
    }

    /// Commands logged after the first one containing `needle`.
    pub fn commands_after(&self, needle: &str) -> Vec<String> {
        let commands = self.commands();
        match commands.iter().position(|c| c.contains(needle)) {
            Some(at) => commands[at + 1..].to_vec(),
            None => Vec::new(),
        }
    }

    pub fn with<R>(&self, f: impl FnOnce(&mut Engine) -> R) -> R {
        f(&mut self.engine.lock().unwrap())
    }

    pub fn commands(&self) -> Vec<String> {
        self.with(|e| e.log.clone())
    }

    pub fn clear_log(&self) {
        self.with(|e| e.log.clear());
    }

    pub fn count(&self, needle: &str) -> usize {
        self.commands().iter().filter(|c| c.contains(needle)).count()
    }

    pub fn position(&self, needle: &str) -> Option<usize> {
        self.commands().iter().position(|c| c.contains(needle))
    }

    pub fn find(&self, needle: &str) -> Option<String> {
        self.commands().into_iter().find(|c| c.contains(needle))
    }
}

fn exit_with(code: i32, stdout: &str) -> CommandOutput {
    CommandOutput {
        code: Some(code),
        stdout: stdout.to_string(),
        stderr: String::new(),
    }
}

fn respond(e: &mut Engine, line: &str, args: &[String]) -> CommandOutput {
    if e.fail_on.as_deref().is_some_and(|n| line.contains(n)) {
        return CommandOutput::failed(1, "injected failure");
    }

    let last = args.last().cloned().unwrap_or_default();

    if line == "docker compose version --short" {
        return CommandOutput::ok(format!("{}\n", e.compose_version));
    }
    if line.starts_with("docker version --format") {
        return CommandOutput::ok(format!("{}\n", e.docker_version));
    }
    if line.contains("busybox nproc") {
        return CommandOutput::ok(format!("{}\n", e.cpus));
    }
    if line.contains("busybox free -m") {
        return CommandOutput::ok(format!(
            "              total        used        free\nMem:          {}        1200        9000\nSwap:             0           0           0\n",
            e.ram_mb
        ));
    }
    if line.contains("busybox grep -c Common KVM processor") {
        return if e.kvm_guest { exit_with(0, "2\n") } else { exit_with(1, "0\n") };
    }
    if line.contains("busybox grep -c sse4_2") {
        return if e.has_sse42 { exit_with(0, "8\n") } else { exit_with(1, "0\n") };
    }
    if line.starts_with("docker volume inspect ") {
        return if e.volumes.contains(&last) {
            CommandOutput::ok("[]")
        } else {
            CommandOutput::failed(1, "Error: No such volume")
        };
    }
    if line.starts_with("docker volume create --name ") {
        e.volumes.insert(last.clone());
        return CommandOutput::ok(format!("{last}\n"));
    }
    if line.starts_with("docker volume rm ") {
        return if e.volumes.remove(&last) {
            CommandOutput::ok(format!("{last}\n"))
        } else {
            CommandOutput::failed(1, "Error: No such volume")
        };
    }
    if line.starts_with("docker compose pull")
        || line.starts_with("docker pull ")
        || line.starts_with("docker compose build")
        || line.contains(" down -t ")
        || line.starts_with("docker compose rm -fsv")
        || line.starts_with("docker compose up -d")
        || line.starts_with("docker compose exec -T nginx")
        || line.starts_with("docker compose stop")
        || line.contains("snuba-api")
        || line.contains("web upgrade --noinput")
        || line.contains("--entrypoint chown")
        || line.contains("ZOOKEEPER_SNAPSHOT_TRUST_EMPTY")
    {
        return CommandOutput::ok("");
    }
    if line == "docker compose config --services" {
        return CommandOutput::ok(e.services.join("\n") + "\n");
    }
    if line.contains("zookeeper bash -c ls") {
        return CommandOutput::ok("0\n");
    }
    if line.contains("kafka-topics --list") {
        let listed: Vec<&str> = e.topics.iter().map(String::as_str).collect();
        return CommandOutput::ok(listed.join("\n"));
    }
    if line.contains("kafka-topics --create") {
        if let Some(i) = args.iter().position(|a| a == "--topic") {
            if let Some(topic) = args.get(i + 1) {
                e.topics.insert(topic.clone());
            }
        }
        return CommandOutput::ok("");
    }
    if line.contains("cat /db/PG_VERSION") {
        return match &e.pg_version {
            Some(v) => CommandOutput::ok(format!("{v}\n")),
            None => CommandOutput::failed(1, "cat: can't open '/db/PG_VERSION'"),
        };
    }
    if line.contains("tianon/postgres-upgrade:9.5-to-9.6") {
        // Mounting a missing named volume creates it.
        e.volumes.insert("sentry-postgres-new".into());
        return CommandOutput::ok("");
    }
    if line.contains("alpine ash -c") {
        e.pg_version = Some("9.6".into());
        return CommandOutput::ok("");
    }
    if line.contains("alpine test -d /data/files") {
        return if e.data_nested {
            CommandOutput::ok("")
        } else {
            exit_with(1, "")
        };
    }
    if line.contains("alpine ls -A1 /data") {
        return CommandOutput::ok(e.data_entries.join("\n"));
    }
    if line.contains("alpine sh -c mkdir -p /data/files") {
        e.data_nested = true;
        e.data_entries = vec!["files".into()];
        return CommandOutput::ok("");
    }
    if line.contains("credentials generate --stdout") {
        return CommandOutput::ok(format!("{RELAY_CREDENTIALS}\n"));
    }
    if line.contains("alpine wget") {
        if e.unhealthy_probes > 0 {
            e.unhealthy_probes -= 1;
            return exit_with(1, "");
        }
        return CommandOutput::ok("ok");
    }

    CommandOutput::failed(127, format!("unexpected command: {line}"))
}

impl CommandRunner for FakeDocker {
    fn run(&self, spec: &CommandSpec) -> Result<CommandOutput> {
        let line = spec.command_line();
        let output = {
            let mut engine = self.engine.lock().unwrap();
            engine.log.push(line.clone());
            respond(&mut engine, &line, &spec.args)
        };
        if let Some((needle, cleanup)) = self.signal.get() {
            if line.contains(needle.as_str()) {
                cleanup.run(CleanupReason::Signal("SIGTERM"));
            }
        }
        Ok(output)
    }
}

/// A checkout with every example template in place.
pub fn checkout() -> TempDir {
    let dir = TempDir::new().unwrap();
    let root = dir.path();
    write(root, "sentry/config.example.yml", CONFIG_YML_EXAMPLE);
    write(
        root,
        "sentry/sentry.conf.example.py",
        &format!("from sentry.conf.server import *  # NOQA\n\n{SNUBA_TSDB_LINE}\n"),
    );
    write(root, "sentry/requirements.example.txt", "# extra plugins\n");
    write(root, "symbolicator/config.example.yml", "cache_dir: \"/data\"\n");
    write(root, "relay/config.example.yml", "relay:\n  upstream: \"http://web:9000/\"\n");
    write(root, "zookeeper/snapshot.0", "");
    dir
}

pub fn write(root: &Path, relative: &str, contents: &str) {
    let path = root.join(relative);
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(path, contents).unwrap();
}

pub fn read(root: &Path, relative: &str) -> String {
    std::fs::read_to_string(root.join(relative)).unwrap()
}

/// Non-interactive configuration for a checkout at `root`.
pub fn config(root: &Path) -> InstallConfig {
    let mut config = InstallConfig::with_defaults(root.to_path_buf());
    config.skip_user_prompt = true;
    config.health_check_interval = Duration::from_millis(1);
    config
        .env
        .insert("COMPOSE_PROJECT_NAME".into(), config.project_name.clone());
    config
}
