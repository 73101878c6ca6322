//! Tunnel engine process lifecycle.
//!
//! The engine is an external binary that reads a JSON configuration file.
//! `SingBoxProcess` writes that file, spawns `<binary> run -c <file>`,
//! forwards the engine's output to tracing and waits for its readiness line.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, info, warn};

use svpn_core::config::TunnelEngineConfig;
use svpn_core::tunnel_config::TunnelConfig;

use super::error::TunnelError;

/// Contract with the external tunnel engine.
#[async_trait]
pub trait TunnelProcess: Send + Sync {
    /// Durably persist `config` where the engine reads it.
    async fn configure(&self, config: &TunnelConfig) -> Result<(), TunnelError>;

    /// Start the engine and wait until it reports ready.
    async fn start(&self) -> Result<(), TunnelError>;

    /// Stop the engine. Stopping a stopped engine is not an error.
    async fn stop(&self) -> Result<(), TunnelError>;

    async fn is_running(&self) -> bool;
}

/// Settings for [`SingBoxProcess`].
#[derive(Debug, Clone)]
pub struct EngineOptions {
    pub binary: PathBuf,
    pub config_path: PathBuf,
    pub ready_marker: String,
    pub ready_timeout: Duration,
    pub terminate_timeout: Duration,
}

impl EngineOptions {
    pub fn from_config(config: &TunnelEngineConfig, config_path: PathBuf) -> Self {
        Self {
            binary: config.binary.clone(),
            config_path,
            ready_marker: config.ready_marker.clone(),
            ready_timeout: Duration::from_secs(config.ready_timeout_secs),
            terminate_timeout: Duration::from_secs(config.terminate_timeout_secs),
        }
    }
}

/// sing-box compatible engine driven as a child process.
pub struct SingBoxProcess {
    options: EngineOptions,
    child: Mutex<Option<Child>>,
}

impl SingBoxProcess {
    pub fn new(options: EngineOptions) -> Self {
        Self {
            options,
            child: Mutex::new(None),
        }
    }

    pub fn config_path(&self) -> &Path {
        &self.options.config_path
    }

    async fn wait_ready(&self, child: &mut Child) -> Result<(), TunnelError> {
        let (ready_tx, mut ready_rx) = mpsc::channel::<()>(1);
        let marker = self.options.ready_marker.clone();

        if let Some(stdout) = child.stdout.take() {
            forward_output(stdout, "stdout", marker.clone(), ready_tx.clone());
        }
        if let Some(stderr) = child.stderr.take() {
            forward_output(stderr, "stderr", marker, ready_tx);
        } else {
            drop(ready_tx);
        }

        let timeout = self.options.ready_timeout;
        let outcome = tokio::select! {
            ready = tokio::time::timeout(timeout, ready_rx.recv()) => match ready {
                Ok(Some(())) => Startup::Ready,
                Ok(None) => Startup::OutputClosed,
                Err(_) => Startup::TimedOut,
            },
            status = child.wait() => Startup::Exited(status),
        };

        match outcome {
            Startup::Ready => Ok(()),
            Startup::TimedOut => Err(TunnelError::NotReady(timeout)),
            // Both streams closed without the marker: the engine is going away.
            Startup::OutputClosed => match tokio::time::timeout(timeout, child.wait()).await {
                Ok(status) => Err(exited(status)),
                Err(_) => Err(TunnelError::NotReady(timeout)),
            },
            Startup::Exited(status) => Err(exited(status)),
        }
    }
}

enum Startup {
    Ready,
    OutputClosed,
    TimedOut,
    Exited(std::io::Result<std::process::ExitStatus>),
}

fn exited(status: std::io::Result<std::process::ExitStatus>) -> TunnelError {
    match status {
        Ok(status) => TunnelError::ExitedEarly {
            status: status.to_string(),
        },
        Err(e) => TunnelError::Io(e),
    }
}

/// Forward engine output lines to tracing, signalling once the marker appears.
fn forward_output<R>(stream: R, name: &'static str, marker: String, ready: mpsc::Sender<()>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(stream).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            debug!(stream = name, "engine: {}", line);
            if !marker.is_empty() && line.contains(&marker) {
                let _ = ready.try_send(());
            }
        }
        debug!(stream = name, "engine output closed");
    });
}

/// Resolve the engine binary: explicit paths must exist, bare names are
/// looked up on `PATH`.
pub fn resolve_binary(binary: &Path) -> Result<PathBuf, TunnelError> {
    if binary.components().count() > 1 || binary.is_absolute() {
        return if binary.is_file() {
            Ok(binary.to_path_buf())
        } else {
            Err(TunnelError::BinaryNotFound(binary.to_path_buf()))
        };
    }
    std::env::var_os("PATH")
        .iter()
        .flat_map(std::env::split_paths)
        .map(|dir| dir.join(binary))
        .find(|candidate| candidate.is_file())
        .ok_or_else(|| TunnelError::BinaryNotFound(binary.to_path_buf()))
}

#[async_trait]
impl TunnelProcess for SingBoxProcess {
    async fn configure(&self, config: &TunnelConfig) -> Result<(), TunnelError> {
        let json = config
            .to_json_pretty()
            .map_err(|e| TunnelError::Config(e.to_string()))?;
        let path = &self.options.config_path;
        if let Some(dir) = path.parent() {
            tokio::fs::create_dir_all(dir).await?;
        }
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json.as_bytes()).await?;
        tokio::fs::rename(&tmp, path).await?;
        info!(path = %path.display(), "Tunnel configuration written");
        Ok(())
    }

    async fn start(&self) -> Result<(), TunnelError> {
        let mut slot = self.child.lock().await;
        if let Some(child) = slot.as_mut()
            && matches!(child.try_wait(), Ok(None))
        {
            debug!("Tunnel engine already running");
            return Ok(());
        }

        let binary = resolve_binary(&self.options.binary)?;
        info!(
            binary = %binary.display(),
            config = %self.options.config_path.display(),
            "Starting tunnel engine"
        );
        let mut child = Command::new(&binary)
            .arg("run")
            .arg("-c")
            .arg(&self.options.config_path)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| TunnelError::Spawn(e.to_string()))?;

        if let Err(e) = self.wait_ready(&mut child).await {
            warn!(error = %e, "Tunnel engine failed to become ready");
            child.kill().await.ok();
            *slot = None;
            return Err(e);
        }

        info!(pid = ?child.id(), "Tunnel engine ready");
        *slot = Some(child);
        Ok(())
    }

    async fn stop(&self) -> Result<(), TunnelError> {
        let Some(mut child) = self.child.lock().await.take() else {
            return Ok(());
        };

        // Try graceful shutdown first
        #[cfg(unix)]
        {
            if let Some(pid) = child.id() {
                // SAFETY: pid is a valid process ID obtained from our own Child handle.
                // kill(2) with SIGINT is safe to call on any owned subprocess.
                #[allow(unsafe_code)]
                #[allow(clippy::cast_possible_wrap)]
                let ret = unsafe { libc::kill(pid as i32, libc::SIGINT) };
                if ret != 0 {
                    let err = std::io::Error::last_os_error();
                    warn!(pid, error = %err, "Failed to send SIGINT");
                }
            }
        }

        // Wait with timeout
        match tokio::time::timeout(self.options.terminate_timeout, child.wait()).await {
            Ok(Ok(status)) => {
                info!(?status, "Tunnel engine exited gracefully");
            }
            Ok(Err(e)) => {
                warn!(error = %e, "Error waiting for tunnel engine");
                child.kill().await.ok();
            }
            Err(_) => {
                warn!("Timeout waiting for graceful shutdown, killing");
                child.kill().await.ok();
            }
        }
        Ok(())
    }

    async fn is_running(&self) -> bool {
        self.child
            .lock()
            .await
            .as_mut()
            .is_some_and(|child| matches!(child.try_wait(), Ok(None)))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn options(dir: &Path, binary: PathBuf) -> EngineOptions {
        EngineOptions {
            binary,
            config_path: dir.join("engine").join("config.json"),
            ready_marker: "started".into(),
            ready_timeout: Duration::from_secs(2),
            terminate_timeout: Duration::from_secs(2),
        }
    }

    #[cfg(unix)]
    fn script(dir: &Path, name: &str, body: &str) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;
        let path = dir.join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    #[tokio::test]
    async fn configure_writes_compiled_json() {
        let dir = tempfile::tempdir().unwrap();
        let process = SingBoxProcess::new(options(dir.path(), "sing-box".into()));
        let config = svpn_core::tunnel_config::compile("vless://uuid@host:443").unwrap();

        process.configure(&config).await.unwrap();
        let written = std::fs::read_to_string(process.config_path()).unwrap();
        assert_eq!(written, config.to_json_pretty().unwrap());
        assert!(!process.config_path().with_extension("json.tmp").exists());
    }

    #[tokio::test]
    async fn missing_binary_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let process = SingBoxProcess::new(options(dir.path(), dir.path().join("nope")));
        assert!(matches!(
            process.start().await,
            Err(TunnelError::BinaryNotFound(_))
        ));
        assert!(matches!(
            resolve_binary(Path::new("definitely-not-a-real-engine-binary")),
            Err(TunnelError::BinaryNotFound(_))
        ));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn start_waits_for_marker_and_stop_terminates() {
        let dir = tempfile::tempdir().unwrap();
        let bin = script(dir.path(), "engine", "echo 'sing-box started (0.01s)' >&2\nexec sleep 30");
        let process = SingBoxProcess::new(options(dir.path(), bin));

        process.start().await.unwrap();
        assert!(process.is_running().await);
        // Starting again is a no-op.
        process.start().await.unwrap();

        process.stop().await.unwrap();
        assert!(!process.is_running().await);
        process.stop().await.unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn early_exit_fails_fast() {
        let dir = tempfile::tempdir().unwrap();
        let bin = script(dir.path(), "engine", "echo 'FATAL config invalid' >&2\nexit 1");
        let process = SingBoxProcess::new(options(dir.path(), bin));

        let err = process.start().await.unwrap_err();
        assert!(matches!(err, TunnelError::ExitedEarly { .. }), "{err}");
        assert!(!process.is_running().await);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn silent_engine_is_not_ready() {
        let dir = tempfile::tempdir().unwrap();
        let bin = script(dir.path(), "engine", "exec sleep 30");
        let mut opts = options(dir.path(), bin);
        opts.ready_timeout = Duration::from_millis(300);
        let process = SingBoxProcess::new(opts);

        let err = process.start().await.unwrap_err();
        assert!(matches!(err, TunnelError::NotReady(_)), "{err}");
        assert!(!process.is_running().await);
    }
}
