//! Gateway process supervision.
//!
//! One supervisor task owns the `heron gateway run` child for the life of
//! the wrapper: it spawns the process, scans stdout for a readiness marker,
//! restarts after unexpected exits with a fixed backoff, and forwards
//! shutdown signals. Status flows out through a `watch` channel whose sole
//! writer is the supervisor loop; everything else only reads.

use crate::config::Config;
use crate::envfile::EnvFile;
use anyhow::{Context, Result};
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use serde::Serialize;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{error, info, warn};

/// Fixed delay between an unexpected exit and the next spawn attempt.
pub const RESTART_BACKOFF: Duration = Duration::from_secs(3);

/// How long a signalled child gets before it is killed outright.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GatewayPhase {
    NotStarted,
    Starting,
    Running,
    Exited,
    ShuttingDown,
}

/// Published lifecycle state of the gateway child.
#[derive(Debug, Clone, Serialize)]
pub struct GatewayStatus {
    pub phase: GatewayPhase,
    pub exit_code: Option<i32>,
}

impl GatewayStatus {
    /// Human-readable form used by the health and status endpoints.
    pub fn label(&self) -> String {
        match self.phase {
            GatewayPhase::NotStarted => "not_started".to_string(),
            GatewayPhase::Starting => "starting".to_string(),
            GatewayPhase::Running => "running".to_string(),
            GatewayPhase::ShuttingDown => "shutting_down".to_string(),
            GatewayPhase::Exited => match self.exit_code {
                Some(code) => format!("exited({code})"),
                None => "exited".to_string(),
            },
        }
    }

    /// True while another spawn attempt is coming: a client seeing a
    /// gateway-unavailable response can retry soon instead of giving up.
    pub fn starting(&self) -> bool {
        matches!(self.phase, GatewayPhase::Starting | GatewayPhase::Exited)
    }
}

enum Ctrl {
    Restart,
    Shutdown(Signal),
}

/// Cheap-to-clone handle for reading status and steering the supervisor.
#[derive(Clone)]
pub struct SupervisorHandle {
    status_rx: watch::Receiver<GatewayStatus>,
    ctrl_tx: mpsc::Sender<Ctrl>,
}

impl SupervisorHandle {
    pub fn status(&self) -> GatewayStatus {
        self.status_rx.borrow().clone()
    }

    pub fn phase(&self) -> GatewayPhase {
        self.status_rx.borrow().phase
    }

    pub fn is_running(&self) -> bool {
        self.phase() == GatewayPhase::Running
    }

    pub fn subscribe(&self) -> watch::Receiver<GatewayStatus> {
        self.status_rx.clone()
    }

    /// Terminate the current child; the supervisor then follows the
    /// ordinary exit path, so the restart backoff applies.
    pub async fn restart(&self) {
        let _ = self.ctrl_tx.send(Ctrl::Restart).await;
    }

    /// Forward `sig` to the child and stop supervising. Terminal.
    pub async fn shutdown(&self, sig: Signal) {
        let _ = self.ctrl_tx.send(Ctrl::Shutdown(sig)).await;
    }

    /// Detached handle reporting a fixed phase, for router tests.
    #[cfg(test)]
    pub fn fixed(phase: GatewayPhase) -> Self {
        let (status_tx, status_rx) = watch::channel(GatewayStatus {
            phase,
            exit_code: None,
        });
        std::mem::forget(status_tx);
        let (ctrl_tx, _ctrl_rx) = mpsc::channel(4);
        Self { status_rx, ctrl_tx }
    }
}

pub struct Supervisor {
    config: Config,
    env_file: EnvFile,
    backoff: Duration,
}

impl Supervisor {
    pub fn new(config: Config, env_file: EnvFile) -> Self {
        Self {
            config,
            env_file,
            backoff: RESTART_BACKOFF,
        }
    }

    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }

    /// Start the supervision loop. The returned task completes only after a
    /// shutdown request has been honored.
    pub fn spawn(self) -> (SupervisorHandle, JoinHandle<()>) {
        let (status_tx, status_rx) = watch::channel(GatewayStatus {
            phase: GatewayPhase::NotStarted,
            exit_code: None,
        });
        let (ctrl_tx, ctrl_rx) = mpsc::channel(8);
        let handle = SupervisorHandle { status_rx, ctrl_tx };
        let task = tokio::spawn(self.run(status_tx, ctrl_rx));
        (handle, task)
    }

    async fn run(
        self,
        status_tx: watch::Sender<GatewayStatus>,
        mut ctrl_rx: mpsc::Receiver<Ctrl>,
    ) {
        let mut last_exit: Option<i32> = None;
        let mut ctrl_closed = false;
        loop {
            status_tx.send_replace(GatewayStatus {
                phase: GatewayPhase::Starting,
                exit_code: last_exit,
            });
            info!("starting gateway: {} gateway run", self.config.agent_bin);

            let exit_code = match self.spawn_child() {
                Ok(mut child) => {
                    let (ready_tx, mut ready_rx) = mpsc::channel::<()>(1);
                    spawn_readers(&mut child, self.config.readiness_markers.clone(), ready_tx);

                    let reaped = loop {
                        tokio::select! {
                            res = child.wait() => break res,
                            Some(()) = ready_rx.recv() => {
                                if status_tx.borrow().phase == GatewayPhase::Starting {
                                    info!("gateway ready");
                                    status_tx.send_replace(GatewayStatus {
                                        phase: GatewayPhase::Running,
                                        exit_code: None,
                                    });
                                }
                            }
                            ctrl = ctrl_rx.recv(), if !ctrl_closed => match ctrl {
                                Some(Ctrl::Restart) => {
                                    info!("gateway restart requested");
                                    forward_signal(&child, Signal::SIGTERM);
                                }
                                Some(Ctrl::Shutdown(sig)) => {
                                    shutdown_child(&status_tx, child, sig).await;
                                    return;
                                }
                                None => ctrl_closed = true,
                            }
                        }
                    };
                    match reaped {
                        Ok(status) => status.code(),
                        Err(e) => {
                            warn!("failed to reap gateway: {e}");
                            None
                        }
                    }
                }
                Err(e) => {
                    error!("failed to spawn gateway: {e:#}");
                    None
                }
            };

            last_exit = exit_code;
            status_tx.send_replace(GatewayStatus {
                phase: GatewayPhase::Exited,
                exit_code,
            });
            warn!(
                "gateway exited with code {exit_code:?}, restarting in {}ms",
                self.backoff.as_millis()
            );

            // Stay responsive to shutdown while waiting out the backoff.
            let backoff = tokio::time::sleep(self.backoff);
            tokio::pin!(backoff);
            loop {
                tokio::select! {
                    _ = &mut backoff => break,
                    ctrl = ctrl_rx.recv(), if !ctrl_closed => match ctrl {
                        Some(Ctrl::Shutdown(_)) => {
                            status_tx.send_replace(GatewayStatus {
                                phase: GatewayPhase::ShuttingDown,
                                exit_code,
                            });
                            info!("gateway supervisor stopped");
                            return;
                        }
                        Some(Ctrl::Restart) => {}
                        None => ctrl_closed = true,
                    }
                }
            }
        }
    }

    fn spawn_child(&self) -> Result<Child> {
        let mut cmd = Command::new(&self.config.agent_bin);
        cmd.args(["gateway", "run"])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        for (key, value) in self.env_file.load() {
            cmd.env(key, value);
        }
        for (key, value) in self.config.agent_env() {
            cmd.env(key, value);
        }
        cmd.spawn().context("Failed to spawn gateway process")
    }
}

/// Pump child output into the logs, reporting the first readiness marker
/// seen on stdout. Markers are matched as plain substrings.
fn spawn_readers(child: &mut Child, markers: Vec<String>, ready_tx: mpsc::Sender<()>) {
    if let Some(stdout) = child.stdout.take() {
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                info!(target: "gateway", "{line}");
                if markers.iter().any(|m| line.contains(m.as_str())) {
                    let _ = ready_tx.try_send(());
                }
            }
        });
    }
    if let Some(stderr) = child.stderr.take() {
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                warn!(target: "gateway", "{line}");
            }
        });
    }
}

async fn shutdown_child(status_tx: &watch::Sender<GatewayStatus>, mut child: Child, sig: Signal) {
    status_tx.send_replace(GatewayStatus {
        phase: GatewayPhase::ShuttingDown,
        exit_code: None,
    });
    info!("forwarding {sig} to gateway and shutting down");
    forward_signal(&child, sig);
    match timeout(SHUTDOWN_GRACE, child.wait()).await {
        Ok(Ok(status)) => info!("gateway exited: {status}"),
        Ok(Err(e)) => warn!("failed to reap gateway during shutdown: {e}"),
        Err(_) => {
            warn!(
                "gateway did not exit within {}s, killing",
                SHUTDOWN_GRACE.as_secs()
            );
            let _ = child.kill().await;
        }
    }
}

fn forward_signal(child: &Child, sig: Signal) {
    if let Some(pid) = child.id() {
        if let Err(e) = signal::kill(Pid::from_raw(pid as i32), sig) {
            warn!("failed to signal gateway (pid {pid}): {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::{Path, PathBuf};
    use tempfile::tempdir;

    fn create_test_script(dir: &Path, name: &str, content: &str) -> PathBuf {
        let script_path = dir.join(name);
        std::fs::write(&script_path, content).unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mut perms = std::fs::metadata(&script_path).unwrap().permissions();
            perms.set_mode(0o755);
            std::fs::set_permissions(&script_path, perms).unwrap();
        }
        script_path
    }

    fn test_supervisor(home: &Path, script: &Path) -> Supervisor {
        let mut config = Config::new(home.to_path_buf(), PathBuf::from("/app/setup"), 0, false);
        config.agent_bin = script.to_string_lossy().to_string();
        let env_file = EnvFile::new(config.env_file());
        Supervisor::new(config, env_file).with_backoff(Duration::from_millis(200))
    }

    async fn wait_for_phase(rx: &mut watch::Receiver<GatewayStatus>, phase: GatewayPhase) {
        timeout(Duration::from_secs(5), async {
            loop {
                if rx.borrow_and_update().phase == phase {
                    return;
                }
                rx.changed().await.unwrap();
            }
        })
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {phase:?}"));
    }

    #[tokio::test]
    async fn test_readiness_marker_flips_to_running() {
        let dir = tempdir().unwrap();
        let script = create_test_script(
            dir.path(),
            "gw.sh",
            "#!/bin/sh\necho 'Gateway listening on 18789'\nexec sleep 30\n",
        );
        let (handle, task) = test_supervisor(dir.path(), &script).spawn();

        let mut rx = handle.subscribe();
        wait_for_phase(&mut rx, GatewayPhase::Running).await;

        handle.shutdown(Signal::SIGTERM).await;
        timeout(Duration::from_secs(5), task).await.unwrap().unwrap();
        assert_eq!(handle.phase(), GatewayPhase::ShuttingDown);
    }

    #[tokio::test]
    async fn test_without_marker_stays_starting() {
        let dir = tempdir().unwrap();
        let script = create_test_script(
            dir.path(),
            "gw.sh",
            "#!/bin/sh\necho 'booting up'\nexec sleep 30\n",
        );
        let (handle, task) = test_supervisor(dir.path(), &script).spawn();

        let mut rx = handle.subscribe();
        wait_for_phase(&mut rx, GatewayPhase::Starting).await;
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(handle.phase(), GatewayPhase::Starting);

        handle.shutdown(Signal::SIGTERM).await;
        timeout(Duration::from_secs(5), task).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_custom_marker_is_honored() {
        let dir = tempdir().unwrap();
        let script = create_test_script(
            dir.path(),
            "gw.sh",
            "#!/bin/sh\necho 'CUSTOM READY LINE'\nexec sleep 30\n",
        );
        let mut config = Config::new(
            dir.path().to_path_buf(),
            PathBuf::from("/app/setup"),
            0,
            false,
        );
        config.agent_bin = script.to_string_lossy().to_string();
        config.readiness_markers = vec!["CUSTOM READY".to_string()];
        let env_file = EnvFile::new(config.env_file());
        let (handle, task) = Supervisor::new(config, env_file).spawn();

        let mut rx = handle.subscribe();
        wait_for_phase(&mut rx, GatewayPhase::Running).await;

        handle.shutdown(Signal::SIGTERM).await;
        timeout(Duration::from_secs(5), task).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_exit_code_published_and_backoff_delays_respawn() {
        let dir = tempdir().unwrap();
        let script = create_test_script(dir.path(), "gw.sh", "#!/bin/sh\nexit 7\n");
        let supervisor = test_supervisor(dir.path(), &script).with_backoff(Duration::from_millis(500));
        let (handle, task) = supervisor.spawn();

        let mut rx = handle.subscribe();
        wait_for_phase(&mut rx, GatewayPhase::Exited).await;
        let status = handle.status();
        assert_eq!(status.exit_code, Some(7));
        assert!(status.starting());

        // Exited must hold for the full backoff before the next spawn.
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(handle.phase(), GatewayPhase::Exited);

        handle.shutdown(Signal::SIGTERM).await;
        timeout(Duration::from_secs(5), task).await.unwrap().unwrap();
        assert_eq!(handle.phase(), GatewayPhase::ShuttingDown);
    }

    #[tokio::test]
    async fn test_restart_respawns_and_env_file_reaches_child() {
        let dir = tempdir().unwrap();
        let spawn_log = dir.path().join("spawns.log");
        let script = create_test_script(
            dir.path(),
            "gw.sh",
            "#!/bin/sh\necho x >> \"$SPAWN_LOG\"\necho ready\nexec sleep 30\n",
        );
        let supervisor = test_supervisor(dir.path(), &script);
        supervisor
            .env_file
            .merge(&[(
                "SPAWN_LOG".to_string(),
                spawn_log.to_string_lossy().to_string(),
            )])
            .unwrap();
        let (handle, task) = supervisor.spawn();

        let mut rx = handle.subscribe();
        wait_for_phase(&mut rx, GatewayPhase::Running).await;

        handle.restart().await;
        wait_for_phase(&mut rx, GatewayPhase::Exited).await;
        wait_for_phase(&mut rx, GatewayPhase::Running).await;

        let spawns = std::fs::read_to_string(&spawn_log).unwrap();
        assert_eq!(spawns.lines().count(), 2);

        handle.shutdown(Signal::SIGTERM).await;
        timeout(Duration::from_secs(5), task).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_missing_binary_cycles_through_exited() {
        let dir = tempdir().unwrap();
        let mut config = Config::new(
            dir.path().to_path_buf(),
            PathBuf::from("/app/setup"),
            0,
            false,
        );
        config.agent_bin = "/nonexistent/gateway-binary".to_string();
        let env_file = EnvFile::new(config.env_file());
        let (handle, task) = Supervisor::new(config, env_file)
            .with_backoff(Duration::from_millis(200))
            .spawn();

        let mut rx = handle.subscribe();
        wait_for_phase(&mut rx, GatewayPhase::Exited).await;
        assert_eq!(handle.status().exit_code, None);

        handle.shutdown(Signal::SIGTERM).await;
        timeout(Duration::from_secs(5), task).await.unwrap().unwrap();
    }

    #[test]
    fn test_starting_flag_by_phase() {
        let status = |phase| GatewayStatus {
            phase,
            exit_code: None,
        };
        assert!(status(GatewayPhase::Starting).starting());
        assert!(status(GatewayPhase::Exited).starting());
        assert!(!status(GatewayPhase::Running).starting());
        assert!(!status(GatewayPhase::NotStarted).starting());
        assert!(!status(GatewayPhase::ShuttingDown).starting());
    }

    #[test]
    fn test_status_labels() {
        let exited = GatewayStatus {
            phase: GatewayPhase::Exited,
            exit_code: Some(3),
        };
        assert_eq!(exited.label(), "exited(3)");
        let running = GatewayStatus {
            phase: GatewayPhase::Running,
            exit_code: None,
        };
        assert_eq!(running.label(), "running");
    }
}
