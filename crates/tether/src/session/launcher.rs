use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};

use super::error::SessionError;

/// What a provisioned server needs to know at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchRequest {
    pub port: u16,
    pub matchmaker: SocketAddr,
    pub expected_players: usize,
}

/// Starts dedicated servers on behalf of the matchmaker.
pub trait ServerLauncher: Send {
    fn launch(&mut self, request: &LaunchRequest) -> Result<(), SessionError>;

    /// The sub-session on `port` was abandoned or went silent.
    fn terminate(&mut self, _port: u16) {}
}

/// Runs `tether-server --port P --matchmaker ADDR --expected-players N` as a
/// child process.
#[derive(Debug)]
pub struct ProcessLauncher {
    program: PathBuf,
    extra_args: Vec<String>,
    children: HashMap<u16, Child>,
}

impl ProcessLauncher {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            extra_args: Vec::new(),
            children: HashMap::new(),
        }
    }

    /// Prefers a binary next to the running executable, falling back to `PATH`.
    pub fn sibling(name: &str) -> Self {
        let local = std::env::current_exe()
            .ok()
            .and_then(|exe| exe.parent().map(|dir| dir.join(name)))
            .filter(|path| path.exists());
        Self::new(local.unwrap_or_else(|| PathBuf::from(name)))
    }

    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.extra_args = args;
        self
    }

    pub fn program(&self) -> &PathBuf {
        &self.program
    }

    /// Forgets children that already exited.
    pub fn reap(&mut self) {
        self.children.retain(|port, child| match child.try_wait() {
            Ok(Some(status)) => {
                log::info!("server on port {} exited with {}", port, status);
                false
            }
            Ok(None) => true,
            Err(e) => {
                log::warn!("failed to poll server on port {}: {}", port, e);
                false
            }
        });
    }

    pub fn running(&self) -> usize {
        self.children.len()
    }
}

impl ServerLauncher for ProcessLauncher {
    fn launch(&mut self, request: &LaunchRequest) -> Result<(), SessionError> {
        self.reap();

        let child = Command::new(&self.program)
            .arg("--port")
            .arg(request.port.to_string())
            .arg("--matchmaker")
            .arg(request.matchmaker.to_string())
            .arg("--expected-players")
            .arg(request.expected_players.to_string())
            .args(&self.extra_args)
            .stdin(Stdio::null())
            .spawn()
            .map_err(|e| SessionError::Launch {
                port: request.port,
                reason: e.to_string(),
            })?;

        log::info!(
            "launched {} (pid {}) on port {}",
            self.program.display(),
            child.id(),
            request.port
        );
        self.children.insert(request.port, child);
        Ok(())
    }

    fn terminate(&mut self, port: u16) {
        if let Some(mut child) = self.children.remove(&port) {
            if let Err(e) = child.kill() {
                log::debug!("kill of server on port {} failed: {}", port, e);
            }
            let _ = child.wait();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_program_reports_launch_error() {
        let mut launcher = ProcessLauncher::new("/nonexistent/tether-server");
        let request = LaunchRequest {
            port: 27101,
            matchmaker: "127.0.0.1:27000".parse().unwrap(),
            expected_players: 2,
        };
        let err = launcher.launch(&request).unwrap_err();
        assert!(matches!(err, SessionError::Launch { port: 27101, .. }));
        assert_eq!(launcher.running(), 0);
    }

    #[test]
    fn test_sibling_falls_back_to_bare_name() {
        let launcher = ProcessLauncher::sibling("definitely-not-a-real-binary");
        assert_eq!(launcher.program(), &PathBuf::from("definitely-not-a-real-binary"));
    }
}
