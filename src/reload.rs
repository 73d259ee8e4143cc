//! Tells the external proxy process to re-read its configuration
//!
//! Two strategies are tried in order, each bounded by the same timeout:
//! asking the process supervisor to signal the managed service, then sending
//! the signal directly to the pid recorded in the proxy's pid file. Failures
//! are folded into a [`ReloadOutcome`]; nothing here returns an error.

use crate::config::ReloadConfig;
use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, error, info, warn};

/// Signal understood by the proxy as "reload configuration from disk"
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ReloadSignal {
    #[default]
    Hup,
    Usr1,
    Usr2,
}

impl ReloadSignal {
    /// Accepts `HUP`, `SIGHUP`, `hup`, ...
    pub fn parse(name: &str) -> Option<Self> {
        let name = name.trim().to_ascii_uppercase();
        match name.strip_prefix("SIG").unwrap_or(&name) {
            "HUP" => Some(ReloadSignal::Hup),
            "USR1" => Some(ReloadSignal::Usr1),
            "USR2" => Some(ReloadSignal::Usr2),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ReloadSignal::Hup => "SIGHUP",
            ReloadSignal::Usr1 => "SIGUSR1",
            ReloadSignal::Usr2 => "SIGUSR2",
        }
    }

    #[cfg(unix)]
    fn as_raw(&self) -> libc::c_int {
        match self {
            ReloadSignal::Hup => libc::SIGHUP,
            ReloadSignal::Usr1 => libc::SIGUSR1,
            ReloadSignal::Usr2 => libc::SIGUSR2,
        }
    }
}

/// Which strategy delivered the reload, if any
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReloadOutcome {
    /// The supervisor command succeeded
    Supervisor,
    /// The signal was sent straight to this pid
    PidSignal { pid: i32 },
    /// Neither strategy worked
    Failed,
}

impl ReloadOutcome {
    pub fn succeeded(&self) -> bool {
        !matches!(self, ReloadOutcome::Failed)
    }
}

pub struct ReloadSignaler {
    /// Program and arguments; `None` skips the supervisor step
    supervisor_command: Option<Vec<String>>,
    pid_file: Option<PathBuf>,
    signal: ReloadSignal,
    timeout: Duration,
}

impl ReloadSignaler {
    pub fn new(
        supervisor_command: Vec<String>,
        pid_file: Option<PathBuf>,
        signal: ReloadSignal,
        timeout: Duration,
    ) -> Self {
        Self {
            supervisor_command: if supervisor_command.is_empty() {
                None
            } else {
                Some(supervisor_command)
            },
            pid_file,
            signal,
            timeout,
        }
    }

    pub fn from_config(config: &ReloadConfig) -> Result<Self> {
        let argv = shell_words::split(&config.supervisor_command)
            .context("Failed to parse reload.supervisor_command")?;
        let signal = ReloadSignal::parse(&config.signal)
            .with_context(|| format!("Unsupported reload signal '{}'", config.signal))?;
        let pid_file = config
            .pid_file
            .as_deref()
            .filter(|p| !p.is_empty())
            .map(PathBuf::from);

        Ok(Self::new(argv, pid_file, signal, config.timeout()))
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Ask the proxy to reload, trying the supervisor first and the pid file second
    pub async fn reload(&self) -> ReloadOutcome {
        if let Some(argv) = &self.supervisor_command {
            match self.run_supervisor(argv).await {
                Ok(()) => {
                    info!(command = %argv.join(" "), "Proxy reload requested via supervisor");
                    return ReloadOutcome::Supervisor;
                }
                Err(e) => {
                    warn!(
                        command = %argv.join(" "),
                        error = %format!("{:#}", e),
                        "Supervisor reload failed, falling back to pid file"
                    );
                }
            }
        }

        let Some(pid_file) = &self.pid_file else {
            error!("Proxy reload failed: supervisor unavailable and no pid file configured");
            return ReloadOutcome::Failed;
        };

        match self.signal_pid_file(pid_file).await {
            Ok(pid) => {
                info!(pid, signal = self.signal.name(), "Proxy reload signal sent");
                ReloadOutcome::PidSignal { pid }
            }
            Err(e) => {
                error!(
                    pid_file = %pid_file.display(),
                    error = %format!("{:#}", e),
                    "Proxy reload failed; configuration on disk is current and will apply on next restart"
                );
                ReloadOutcome::Failed
            }
        }
    }

    /// Boolean form of [`reload`](Self::reload)
    pub async fn signal_reload(&self) -> bool {
        self.reload().await.succeeded()
    }

    async fn run_supervisor(&self, argv: &[String]) -> Result<()> {
        let (program, args) = argv.split_first().context("Empty supervisor command")?;

        let mut cmd = Command::new(program);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let output = tokio::time::timeout(self.timeout, cmd.output())
            .await
            .map_err(|_| anyhow::anyhow!("timed out after {}ms", self.timeout.as_millis()))?
            .with_context(|| format!("Failed to run '{}'", program))?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        debug!(status = %output.status, stdout = %stdout.trim(), "Supervisor command finished");

        if !output.status.success() {
            anyhow::bail!("exited with {}: {}", output.status, stderr.trim());
        }
        // supervisorctl reports some failures on stdout with a zero exit code
        if stdout.contains("ERROR") {
            anyhow::bail!("supervisor reported: {}", stdout.trim());
        }

        Ok(())
    }

    async fn signal_pid_file(&self, path: &Path) -> Result<i32> {
        let contents = tokio::time::timeout(self.timeout, tokio::fs::read_to_string(path))
            .await
            .map_err(|_| anyhow::anyhow!("timed out reading pid file"))?
            .context("Failed to read pid file")?;

        let pid: i32 = contents
            .trim()
            .parse()
            .with_context(|| format!("Invalid pid '{}'", contents.trim()))?;

        // 0 and negatives address process groups
        if pid <= 0 {
            anyhow::bail!("Refusing to signal pid {}", pid);
        }

        send_signal(pid, self.signal)?;
        Ok(pid)
    }
}

#[cfg(unix)]
fn send_signal(pid: i32, signal: ReloadSignal) -> Result<()> {
    let result = unsafe { libc::kill(pid, signal.as_raw()) };
    if result != 0 {
        return Err(std::io::Error::last_os_error())
            .with_context(|| format!("Failed to send {} to pid {}", signal.name(), pid));
    }
    Ok(())
}

#[cfg(not(unix))]
fn send_signal(pid: i32, signal: ReloadSignal) -> Result<()> {
    anyhow::bail!(
        "Cannot send {} to pid {}: direct signals need a Unix platform",
        signal.name(),
        pid
    )
}
