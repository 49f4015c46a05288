//! Supervision of the external onion router process.
//!
//! The router is a plain executable: we query its version, derive the
//! control-port password hash by running it with its hash flag, and keep
//! the long-running process as a child with its output optionally
//! appended to a log file.

use std::path::Path;
use std::process::Stdio;

use tokio::process::{Child, Command};
use tracing::{info, warn};

use crate::config::DaemonConfig;
use crate::error::DaemonError;

pub struct RouterProcess {
    child: Child,
    version: String,
}

impl RouterProcess {
    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn id(&self) -> Option<u32> {
        self.child.id()
    }

    pub async fn kill(mut self) -> Result<(), DaemonError> {
        self.child.kill().await?;
        Ok(())
    }
}

/// Launch the router with the environment inherited. Dies with the
/// daemon; stdout and stderr go to `log_file` when one is given.
pub async fn launch(
    exe: &Path,
    args: &[String],
    log_file: Option<&Path>,
) -> Result<RouterProcess, DaemonError> {
    let version = query_version(exe).await?;
    info!(version = %version, "Detected onion router");

    let mut command = Command::new(exe);
    command.args(args).stdin(Stdio::null()).kill_on_drop(true);

    if let Some(path) = log_file {
        match std::fs::OpenOptions::new()
            .append(true)
            .create(true)
            .open(path)
        {
            Ok(file) => {
                match file.try_clone() {
                    Ok(stderr_file) => {
                        command.stdout(Stdio::from(file)).stderr(Stdio::from(stderr_file));
                    }
                    Err(e) => {
                        warn!(error = %e, "Could not duplicate log handle, stderr stays inherited");
                        command.stdout(Stdio::from(file));
                    }
                }
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Unable to open router log file");
            }
        }
    }

    info!("Starting onion router");
    let child = command
        .spawn()
        .map_err(|e| DaemonError::Router(format!("failed to start {}: {e}", exe.display())))?;

    Ok(RouterProcess { child, version })
}

/// Command line for a daemon-owned router instance.
pub fn router_args(config: &DaemonConfig, hashed_control_pass: Option<&str>) -> Vec<String> {
    let mut args = vec![
        "--SocksPort".to_string(),
        config.socks_port.to_string(),
        "--ControlPort".to_string(),
        config.control_port.to_string(),
        "--DataDirectory".to_string(),
        config.router_data_dir().display().to_string(),
    ];
    if let Some(hash) = hashed_control_pass {
        args.push("--HashedControlPassword".to_string());
        args.push(hash.to_string());
    }
    args
}

pub async fn query_version(exe: &Path) -> Result<String, DaemonError> {
    run_with_args(exe, &["--version"]).await
}

/// The router hashes the control password itself; we run it once with
/// the hash flag and keep stdout minus the trailing newline.
pub async fn hash_password(exe: &Path, password: &str) -> Result<String, DaemonError> {
    run_with_args(exe, &["--hash-password", password]).await
}

async fn run_with_args(exe: &Path, args: &[&str]) -> Result<String, DaemonError> {
    let output = Command::new(exe)
        .args(args)
        .output()
        .await
        .map_err(|e| DaemonError::Router(format!("failed to run {}: {e}", exe.display())))?;

    if !output.status.success() {
        return Err(DaemonError::Router(format!(
            "{} exited with {}",
            exe.display(),
            output.status
        )));
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    Ok(stdout.trim_end_matches(['\r', '\n']).to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[tokio::test]
    async fn test_run_with_args_strips_trailing_newline() {
        let out = run_with_args(&PathBuf::from("echo"), &["--version"])
            .await
            .unwrap();
        assert_eq!(out, "--version");
    }

    #[tokio::test]
    async fn test_hash_password_passes_flag() {
        let out = hash_password(&PathBuf::from("echo"), "hunter2").await.unwrap();
        assert_eq!(out, "--hash-password hunter2");
    }

    #[tokio::test]
    async fn test_missing_executable_errors() {
        let result = query_version(&PathBuf::from("/nonexistent/router-binary")).await;
        assert!(matches!(result, Err(DaemonError::Router(_))));
    }

    #[test]
    fn test_router_args_include_control_password() {
        let config = DaemonConfig::default();
        let args = router_args(&config, Some("16:abcdef"));
        assert!(args.contains(&"--HashedControlPassword".to_string()));
        assert!(args.contains(&"16:abcdef".to_string()));

        let args = router_args(&config, None);
        assert!(!args.contains(&"--HashedControlPassword".to_string()));
    }
}
