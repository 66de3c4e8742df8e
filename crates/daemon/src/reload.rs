//! Reload of the local tunnel, resolver and proxy
//!
//! The processes themselves are managed elsewhere; this module only knows
//! how to ask them to pick up new state, and how to keep two reloads from
//! overlapping.

use crate::scheduler::RestartScheduler;
use async_trait::async_trait;
use ipnetwork::Ipv4Network;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::process::Command;
use tracing::{debug, error, info, warn};

/// Reloads the external processes that consume node state
#[async_trait]
pub trait Reloader: Send + Sync {
    async fn reload(&self) -> anyhow::Result<()>;
}

/// Ensures a Docker network exists for a subnet
#[async_trait]
pub trait DockerNetwork: Send + Sync {
    async fn ensure(&self, subnet: Ipv4Network) -> anyhow::Result<()>;
}

/// Runs configured shell commands in order, stopping at the first failure
pub struct CommandReloader {
    commands: Vec<String>,
}

impl CommandReloader {
    pub fn new(commands: Vec<String>) -> Self {
        Self { commands }
    }
}

#[async_trait]
impl Reloader for CommandReloader {
    async fn reload(&self) -> anyhow::Result<()> {
        if self.commands.is_empty() {
            debug!("No reload commands configured");
            return Ok(());
        }

        for command in &self.commands {
            debug!(command = %command, "Running reload command");
            let output = Command::new("sh").arg("-c").arg(command).output().await?;
            if !output.status.success() {
                anyhow::bail!(
                    "reload command {:?} failed with {}: {}",
                    command,
                    output.status,
                    String::from_utf8_lossy(&output.stderr).trim()
                );
            }
        }
        Ok(())
    }
}

/// Docker CLI backed network management
pub struct DockerCli {
    network_name: String,
}

impl DockerCli {
    pub fn new(network_name: impl Into<String>) -> Self {
        Self {
            network_name: network_name.into(),
        }
    }
}

#[async_trait]
impl DockerNetwork for DockerCli {
    async fn ensure(&self, subnet: Ipv4Network) -> anyhow::Result<()> {
        let inspect = Command::new("docker")
            .args([
                "network",
                "inspect",
                "--format",
                "{{range .IPAM.Config}}{{.Subnet}} {{end}}",
                &self.network_name,
            ])
            .output()
            .await?;
        if inspect.status.success() {
            let existing = configured_subnets(&String::from_utf8_lossy(&inspect.stdout));
            if existing.contains(&subnet) {
                debug!(network = %self.network_name, "Docker network already exists");
                return Ok(());
            }

            warn!(
                network = %self.network_name,
                existing = ?existing,
                wanted = %subnet,
                "Docker network has a stale subnet, recreating"
            );
            let rm = Command::new("docker")
                .args(["network", "rm", &self.network_name])
                .output()
                .await?;
            if !rm.status.success() {
                anyhow::bail!(
                    "docker network rm failed: {}",
                    String::from_utf8_lossy(&rm.stderr).trim()
                );
            }
        }

        let output = Command::new("docker")
            .args([
                "network",
                "create",
                "--driver",
                "bridge",
                "--subnet",
                &subnet.to_string(),
                &self.network_name,
            ])
            .output()
            .await?;
        if !output.status.success() {
            anyhow::bail!(
                "docker network create failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }

        info!(network = %self.network_name, subnet = %subnet, "Created Docker network");
        Ok(())
    }
}

/// Subnets listed by `docker network inspect`, skipping anything unparsable
fn configured_subnets(inspect_output: &str) -> Vec<Ipv4Network> {
    inspect_output
        .split_whitespace()
        .filter_map(|s| s.parse().ok())
        .collect()
}

/// Used when Docker integration is turned off
pub struct DockerDisabled;

#[async_trait]
impl DockerNetwork for DockerDisabled {
    async fn ensure(&self, subnet: Ipv4Network) -> anyhow::Result<()> {
        info!(subnet = %subnet, "Docker integration disabled, skipping network setup");
        Ok(())
    }
}

/// Serializes reloads. Both the scheduler and the immediate path go
/// through `run_exclusive`, so at most one reload runs at a time.
pub struct ReloadRunner {
    reloader: Arc<dyn Reloader>,
    lock: tokio::sync::Mutex<()>,
    in_flight: AtomicBool,
    completed: AtomicU64,
}

impl ReloadRunner {
    pub fn new(reloader: Arc<dyn Reloader>) -> Arc<Self> {
        Arc::new(Self {
            reloader,
            lock: tokio::sync::Mutex::new(()),
            in_flight: AtomicBool::new(false),
            completed: AtomicU64::new(0),
        })
    }

    pub fn is_in_flight(&self) -> bool {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Number of reloads finished, successful or not
    pub fn completed(&self) -> u64 {
        self.completed.load(Ordering::SeqCst)
    }

    pub async fn run_exclusive(&self) -> anyhow::Result<()> {
        let _guard = self.lock.lock().await;
        self.in_flight.store(true, Ordering::SeqCst);

        let started = Instant::now();
        let result = self.reloader.reload().await;

        self.in_flight.store(false, Ordering::SeqCst);
        self.completed.fetch_add(1, Ordering::SeqCst);

        match &result {
            Ok(()) => info!(elapsed_ms = started.elapsed().as_millis() as u64, "Reload finished"),
            Err(e) => warn!(error = %e, "Reload failed"),
        }
        result
    }
}

/// Entry point for mutations that need a reload
#[derive(Clone)]
pub struct ReloadTrigger {
    runner: Arc<ReloadRunner>,
    scheduler: RestartScheduler,
}

impl ReloadTrigger {
    /// Start the scheduler worker for `runner`. Must be called inside a
    /// tokio runtime.
    pub fn spawn(runner: Arc<ReloadRunner>, delay: Duration) -> Self {
        let scheduler = RestartScheduler::spawn(runner.clone(), delay);
        Self { runner, scheduler }
    }

    /// Reload now and wait for it, or hand the request to the scheduler.
    ///
    /// Failures are logged and never propagated.
    pub async fn trigger(&self, immediate: bool) {
        if immediate {
            if let Err(e) = self.runner.run_exclusive().await {
                error!(error = %e, "Immediate reload failed");
            }
        } else {
            self.scheduler.schedule();
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::atomic::AtomicUsize;

    /// Reloader that records when it ran and how many ran at once
    #[derive(Default)]
    pub(crate) struct RecordingReloader {
        pub(crate) duration: Duration,
        pub(crate) fail: bool,
        pub(crate) started: Mutex<Vec<tokio::time::Instant>>,
        active: AtomicUsize,
        pub(crate) max_active: AtomicUsize,
    }

    impl RecordingReloader {
        pub(crate) fn with_duration(duration: Duration) -> Arc<Self> {
            Arc::new(Self {
                duration,
                ..Default::default()
            })
        }

        pub(crate) fn failing() -> Arc<Self> {
            Arc::new(Self {
                fail: true,
                ..Default::default()
            })
        }

        pub(crate) fn count(&self) -> usize {
            self.started.lock().len()
        }
    }

    /// Docker stand-in that remembers every subnet it was asked for
    #[derive(Default)]
    pub(crate) struct RecordingDocker {
        pub(crate) fail: bool,
        pub(crate) ensured: Mutex<Vec<Ipv4Network>>,
    }

    impl RecordingDocker {
        pub(crate) fn failing() -> Arc<Self> {
            Arc::new(Self {
                fail: true,
                ..Default::default()
            })
        }

        pub(crate) fn ensured(&self) -> Vec<Ipv4Network> {
            self.ensured.lock().clone()
        }
    }

    #[async_trait]
    impl DockerNetwork for RecordingDocker {
        async fn ensure(&self, subnet: Ipv4Network) -> anyhow::Result<()> {
            self.ensured.lock().push(subnet);
            if self.fail {
                anyhow::bail!("docker daemon unreachable");
            }
            Ok(())
        }
    }

    #[async_trait]
    impl Reloader for RecordingReloader {
        async fn reload(&self) -> anyhow::Result<()> {
            self.started.lock().push(tokio::time::Instant::now());
            let now_active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_active.fetch_max(now_active, Ordering::SeqCst);
            tokio::time::sleep(self.duration).await;
            self.active.fetch_sub(1, Ordering::SeqCst);
            if self.fail {
                anyhow::bail!("reload exploded");
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_command_reloader_runs_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("log");
        let reloader = CommandReloader::new(vec![
            format!("echo first >> {}", log.display()),
            format!("echo second >> {}", log.display()),
        ]);
        reloader.reload().await.unwrap();
        let content = std::fs::read_to_string(&log).unwrap();
        assert_eq!(content, "first\nsecond\n");
    }

    #[tokio::test]
    async fn test_command_reloader_stops_on_failure() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("marker");
        let reloader = CommandReloader::new(vec![
            "echo oops >&2; exit 3".to_string(),
            format!("touch {}", marker.display()),
        ]);
        let err = reloader.reload().await.unwrap_err();
        assert!(err.to_string().contains("oops"));
        assert!(!marker.exists());
    }

    #[tokio::test]
    async fn test_empty_command_list_is_ok() {
        CommandReloader::new(Vec::new()).reload().await.unwrap();
    }

    #[tokio::test]
    async fn test_runner_reports_failure_and_counts() {
        let reloader = RecordingReloader::failing();
        let runner = ReloadRunner::new(reloader.clone());
        assert!(runner.run_exclusive().await.is_err());
        assert_eq!(runner.completed(), 1);
        assert!(!runner.is_in_flight());
    }

    #[tokio::test(start_paused = true)]
    async fn test_immediate_trigger_swallows_errors() {
        let reloader = RecordingReloader::failing();
        let trigger = ReloadTrigger::spawn(ReloadRunner::new(reloader.clone()), Duration::from_secs(1));
        trigger.trigger(true).await;
        assert_eq!(reloader.count(), 1);
    }

    #[test]
    fn test_configured_subnets() {
        let wanted: Ipv4Network = "172.20.0.0/16".parse().unwrap();
        assert_eq!(configured_subnets("172.20.0.0/16 \n"), vec![wanted]);
        assert_eq!(
            configured_subnets("172.19.0.0/16 fd00::/64 "),
            vec!["172.19.0.0/16".parse::<Ipv4Network>().unwrap()]
        );
        assert!(configured_subnets("").is_empty());
        assert!(!configured_subnets("172.19.0.0/16").contains(&wanted));
    }

    #[tokio::test]
    async fn test_docker_disabled_is_noop() {
        DockerDisabled
            .ensure("172.20.0.0/16".parse().unwrap())
            .await
            .unwrap();
    }
}
