use crate::config::SessionConfig;
use log::{info, warn};
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProcessError {
    #[error("Failed to spawn server process {path:?}: {source}")]
    Spawn {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to kill server process: {0}")]
    Kill(#[source] std::io::Error),
}

/// Start/kill contract the session needs from whatever runs the vendor server.
pub trait Supervisor {
    fn start(&mut self, config: &SessionConfig) -> Result<(), ProcessError>;

    /// Forcibly stop the server. Does nothing when it is not running.
    fn kill(&mut self) -> Result<(), ProcessError>;

    fn is_running(&mut self) -> bool;
}

/// Vendor server launched as a child process.
#[derive(Debug, Default)]
pub struct ServerProcess {
    child: Option<Child>,
}

impl ServerProcess {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn id(&self) -> Option<u32> {
        self.child.as_ref().map(Child::id)
    }
}

impl Supervisor for ServerProcess {
    fn start(&mut self, config: &SessionConfig) -> Result<(), ProcessError> {
        // Reap (or stop) the previous server before its handle is replaced.
        self.kill()?;

        let path = config.resolved_server_path();
        info!("[SERVER] Launching {:?} {:?}", path, config.server_args);

        let mut command = Command::new(&path);
        command
            .args(&config.server_args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());

        #[cfg(windows)]
        {
            use std::os::windows::process::CommandExt;
            const CREATE_NO_WINDOW: u32 = 0x08000000;
            command.creation_flags(CREATE_NO_WINDOW);
        }

        let child = command
            .spawn()
            .map_err(|source| ProcessError::Spawn { path, source })?;

        info!("[SERVER] Started with pid {}", child.id());
        self.child = Some(child);
        Ok(())
    }

    fn kill(&mut self) -> Result<(), ProcessError> {
        let Some(mut child) = self.child.take() else {
            return Ok(());
        };

        match child.kill() {
            Ok(()) => {}
            // Already exited on its own after `stop`.
            Err(e) if e.kind() == std::io::ErrorKind::InvalidInput => {}
            Err(e) => return Err(ProcessError::Kill(e)),
        }

        match child.wait() {
            Ok(status) => info!("[SERVER] Exited with {}", status),
            Err(e) => warn!("[SERVER] Could not reap server process: {}", e),
        }
        Ok(())
    }

    fn is_running(&mut self) -> bool {
        match self.child.as_mut().map(Child::try_wait) {
            Some(Ok(None)) => true,
            Some(Ok(Some(status))) => {
                info!("[SERVER] Process already exited with {}", status);
                false
            }
            Some(Err(e)) => {
                warn!("[SERVER] Could not query server process: {}", e);
                false
            }
            None => false,
        }
    }
}

impl Drop for ServerProcess {
    fn drop(&mut self) {
        if let Err(e) = self.kill() {
            warn!("[SERVER] {}", e);
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn shell_config(script: &str) -> SessionConfig {
        SessionConfig {
            server_path: PathBuf::from("/bin/sh"),
            server_args: vec!["-c".to_string(), script.to_string()],
            ..SessionConfig::default()
        }
    }

    #[test]
    fn start_and_kill() {
        let mut server = ServerProcess::new();
        assert!(!server.is_running());

        server.start(&shell_config("sleep 30")).unwrap();
        assert!(server.is_running());
        assert!(server.id().is_some());

        server.kill().unwrap();
        assert!(!server.is_running());
        assert!(server.id().is_none());

        server.kill().unwrap();
    }

    #[test]
    fn kill_after_exit_is_ok() {
        let mut server = ServerProcess::new();
        server.start(&shell_config("exit 0")).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(200));

        assert!(!server.is_running());
        server.kill().unwrap();
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn relaunch_reaps_previous_child() {
        let mut server = ServerProcess::new();
        server.start(&shell_config("exit 0")).unwrap();
        let first = server.id().unwrap();
        std::thread::sleep(std::time::Duration::from_millis(200));

        // Exited but not yet waited on: still listed as a zombie.
        let entry = PathBuf::from(format!("/proc/{}", first));
        assert!(entry.exists());

        server.start(&shell_config("sleep 30")).unwrap();
        assert!(!entry.exists());
        assert_ne!(server.id(), Some(first));
        assert!(server.is_running());
        server.kill().unwrap();
    }

    #[test]
    fn missing_binary_reports_path() {
        let mut server = ServerProcess::new();
        let config = SessionConfig {
            server_path: PathBuf::from("/nonexistent/TLBP2PipeConnection.exe"),
            ..SessionConfig::default()
        };

        match server.start(&config) {
            Err(ProcessError::Spawn { path, .. }) => {
                assert_eq!(path, PathBuf::from("/nonexistent/TLBP2PipeConnection.exe"))
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }
}
