//! Local onion-routing daemon supervision
//!
//! The daemon is a process-wide singleton. Supervision is limited to
//! discovery, detached start, signal-based exit rotation, and teardown;
//! process access sits behind `ProcessControl` so alternate daemons and
//! test doubles can be substituted.

use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use sysinfo::{Pid, Signal, System};
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::error::{GiroError, Result};

/// Argument sequence that tells the daemon to detach and run on its own
pub const RUN_AS_DAEMON_ARGS: &[&str] = &["--RunAsDaemon", "1"];

/// Fixed wait after spawning; the daemon has no readiness probe
pub const DEFAULT_STARTUP_GRACE: Duration = Duration::from_secs(5);

/// How long a signalled process gets to prove it survived the signal
pub const SIGNAL_GRACE: Duration = Duration::from_secs(1);

/// Polling budget while waiting for a terminated process to exit
const KILL_WAIT_ROUNDS: u32 = 25;
const KILL_WAIT_STEP: Duration = Duration::from_millis(200);

/// What a reload signal did to the target process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RotateOutcome {
    /// The process absorbed the signal and stayed up: the success path
    Survived,
    /// The process died from the signal, which the daemon must not do
    Terminated,
}

/// Minimal process access: list, start, signal, kill
#[async_trait]
pub trait ProcessControl: Send + Sync {
    /// PIDs of running processes whose command matches
    fn list(&self, command: &str) -> Result<Vec<u32>>;

    /// Spawn the daemon detached from this process
    async fn start(&self, command: &str) -> Result<()>;

    /// Deliver the reconfigure signal and report whether the process survived
    async fn signal_reload(&self, pid: u32) -> Result<RotateOutcome>;

    /// Terminate the process and wait for it to exit
    async fn kill(&self, pid: u32) -> Result<()>;
}

/// `ProcessControl` backed by the host process table
pub struct SystemProcessControl;

impl SystemProcessControl {
    fn find(system: &System, pid: u32) -> Option<&sysinfo::Process> {
        system.process(Pid::from_u32(pid))
    }
}

#[async_trait]
impl ProcessControl for SystemProcessControl {
    fn list(&self, command: &str) -> Result<Vec<u32>> {
        let system = System::new_all();
        Ok(system
            .processes()
            .iter()
            .filter(|(_, process)| process.name() == command)
            .map(|(pid, _)| pid.as_u32())
            .collect())
    }

    async fn start(&self, command: &str) -> Result<()> {
        // The daemon forks itself with the run-as-daemon flag; the launcher
        // exits on its own, so the child is spawned and left alone.
        tokio::process::Command::new(command)
            .args(RUN_AS_DAEMON_ARGS)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| GiroError::Daemon(format!("failed to spawn {}: {}", command, e)))?;
        Ok(())
    }

    async fn signal_reload(&self, pid: u32) -> Result<RotateOutcome> {
        let system = System::new_all();
        let process = Self::find(&system, pid)
            .ok_or_else(|| GiroError::Daemon(format!("process {} vanished before signal", pid)))?;

        match process.kill_with(Signal::Hangup) {
            Some(true) => {}
            Some(false) => {
                return Err(GiroError::Daemon(format!(
                    "failed to deliver reload signal to {}",
                    pid
                )))
            }
            None => {
                return Err(GiroError::Daemon(
                    "reload signal unsupported on this platform".to_string(),
                ))
            }
        }

        sleep(SIGNAL_GRACE).await;
        let system = System::new_all();
        if Self::find(&system, pid).is_some() {
            Ok(RotateOutcome::Survived)
        } else {
            Ok(RotateOutcome::Terminated)
        }
    }

    async fn kill(&self, pid: u32) -> Result<()> {
        let system = System::new_all();
        let Some(process) = Self::find(&system, pid) else {
            return Ok(());
        };
        process.kill_with(Signal::Term);

        for _ in 0..KILL_WAIT_ROUNDS {
            sleep(KILL_WAIT_STEP).await;
            let system = System::new_all();
            if Self::find(&system, pid).is_none() {
                return Ok(());
            }
        }
        warn!(pid, "process still up after terminate signal");
        Ok(())
    }
}

/// Lifecycle control for the supervised daemon
pub struct DaemonSupervisor {
    control: Arc<dyn ProcessControl>,
    command: String,
    startup_grace: Duration,
}

impl DaemonSupervisor {
    pub fn new(control: Arc<dyn ProcessControl>, command: String, startup_grace: Duration) -> Self {
        Self {
            control,
            command,
            startup_grace,
        }
    }

    /// Start the daemon if no matching process is running.
    /// Returns whether it was already up.
    pub async fn start_if_not_running(&self) -> Result<bool> {
        let running = self.control.list(&self.command)?;
        if !running.is_empty() {
            debug!(count = running.len(), "daemon already running");
            return Ok(true);
        }

        info!(command = %self.command, "starting daemon");
        self.control.start(&self.command).await?;
        sleep(self.startup_grace).await;
        Ok(false)
    }

    /// Ask every running daemon process to pick a new exit.
    /// A process that dies from the reconfigure signal is a fatal error.
    pub async fn rotate_exit(&self) -> Result<()> {
        let pids = self.control.list(&self.command)?;
        if pids.is_empty() {
            warn!(command = %self.command, "no daemon process to signal");
            return Ok(());
        }

        for pid in pids {
            match self.control.signal_reload(pid).await? {
                RotateOutcome::Survived => debug!(pid, "exit rotation signalled"),
                RotateOutcome::Terminated => {
                    return Err(GiroError::Daemon(format!(
                        "daemon {} terminated on reload signal",
                        pid
                    )))
                }
            }
        }
        Ok(())
    }

    /// Terminate every matching process, awaiting each
    pub async fn kill_all(&self) -> Result<()> {
        let pids = self.control.list(&self.command)?;
        if pids.is_empty() {
            warn!(command = %self.command, "no daemon process found to terminate");
            return Ok(());
        }

        let results =
            futures::future::join_all(pids.iter().map(|&pid| self.control.kill(pid))).await;
        for result in results {
            result?;
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Scriptable process table for supervisor and coordinator tests
    #[derive(Default)]
    pub(crate) struct MockControl {
        pub running: Mutex<Vec<u32>>,
        pub starts: AtomicU32,
        pub rotations: AtomicU32,
        pub kills: AtomicU32,
        pub dies_on_reload: std::sync::atomic::AtomicBool,
    }

    #[async_trait]
    impl ProcessControl for MockControl {
        fn list(&self, _command: &str) -> Result<Vec<u32>> {
            Ok(self.running.lock().clone())
        }

        async fn start(&self, _command: &str) -> Result<()> {
            self.starts.fetch_add(1, Ordering::SeqCst);
            self.running.lock().push(4242);
            Ok(())
        }

        async fn signal_reload(&self, pid: u32) -> Result<RotateOutcome> {
            self.rotations.fetch_add(1, Ordering::SeqCst);
            if self.dies_on_reload.load(Ordering::SeqCst) {
                self.running.lock().retain(|&p| p != pid);
                return Ok(RotateOutcome::Terminated);
            }
            Ok(RotateOutcome::Survived)
        }

        async fn kill(&self, pid: u32) -> Result<()> {
            self.kills.fetch_add(1, Ordering::SeqCst);
            self.running.lock().retain(|&p| p != pid);
            Ok(())
        }
    }

    fn supervisor(control: Arc<MockControl>) -> DaemonSupervisor {
        DaemonSupervisor::new(control, "tor".to_string(), Duration::ZERO)
    }

    #[tokio::test]
    async fn test_start_if_not_running_spawns_once() {
        let control = Arc::new(MockControl::default());
        let supervisor = supervisor(control.clone());

        let was_running = supervisor.start_if_not_running().await.unwrap();
        assert!(!was_running);
        assert_eq!(control.starts.load(Ordering::SeqCst), 1);

        let was_running = supervisor.start_if_not_running().await.unwrap();
        assert!(was_running);
        assert_eq!(control.starts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_rotate_exit_signals_every_process() {
        let control = Arc::new(MockControl::default());
        control.running.lock().extend([11, 22]);
        let supervisor = supervisor(control.clone());

        supervisor.rotate_exit().await.unwrap();
        assert_eq!(control.rotations.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_rotate_exit_fatal_when_daemon_dies() {
        let control = Arc::new(MockControl::default());
        control.running.lock().push(11);
        control.dies_on_reload.store(true, Ordering::SeqCst);
        let supervisor = supervisor(control);

        let err = supervisor.rotate_exit().await.unwrap_err();
        assert!(matches!(err, GiroError::Daemon(_)));
    }

    #[tokio::test]
    async fn test_rotate_exit_tolerates_no_processes() {
        let control = Arc::new(MockControl::default());
        supervisor(control.clone()).rotate_exit().await.unwrap();
        assert_eq!(control.rotations.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_kill_all_terminates_everything() {
        let control = Arc::new(MockControl::default());
        control.running.lock().extend([11, 22, 33]);
        let supervisor = supervisor(control.clone());

        supervisor.kill_all().await.unwrap();
        assert_eq!(control.kills.load(Ordering::SeqCst), 3);
        assert!(control.running.lock().is_empty());
    }

    #[tokio::test]
    async fn test_kill_all_tolerates_none_found() {
        let control = Arc::new(MockControl::default());
        supervisor(control).kill_all().await.unwrap();
    }
}
