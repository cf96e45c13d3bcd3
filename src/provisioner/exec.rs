//! Bridge executable provisioner
//!
//! Every operation is one invocation of the bridge binary:
//!
//! ```text
//! <bridge> profile-config <profile>
//! <bridge> node add <profile> --name N --worker=B --control-plane=B --kubernetes-version V --delete-on-failure=B
//! <bridge> node delete <profile> <node>
//! <bridge> node describe <profile> <node>
//! ```
//!
//! Queries print JSON on stdout. Exit code 2 means not found, 3 means
//! unavailable, anything else non-zero is a provisioning failure.

use std::path::{Path, PathBuf};
use std::process::Output;
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use tokio::process::Command;
use tracing::{debug, info, warn};

use super::{provider_id, NodeInfo, NodeProvisioner, NodeSpec, ProfileConfig};
use crate::error::ProvisionerErrorKind;
use crate::{Error, Result};

/// Default bridge executable, looked up on `PATH`
pub const DEFAULT_BRIDGE_BIN: &str = "minikube-bridge";

/// Default timeout for one bridge invocation
const COMMAND_TIMEOUT: Duration = Duration::from_secs(300);

const EXIT_NOT_FOUND: i32 = 2;
const EXIT_UNAVAILABLE: i32 = 3;

/// [`NodeProvisioner`] that shells out to the bridge executable
pub struct ExecProvisioner {
    binary: PathBuf,
    base_args: Vec<String>,
    storage_path: PathBuf,
    timeout: Duration,
}

impl ExecProvisioner {
    /// Create a provisioner using `binary` with `storage_path` as `MINIKUBE_HOME`
    pub fn new(binary: impl Into<PathBuf>, storage_path: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            base_args: Vec::new(),
            storage_path: storage_path.into(),
            timeout: COMMAND_TIMEOUT,
        }
    }

    /// Arguments placed before every command (e.g. a script for an interpreter)
    pub fn with_base_args(mut self, args: Vec<String>) -> Self {
        self.base_args = args;
        self
    }

    /// Per-command timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Storage directory handed to the bridge
    pub fn storage_path(&self) -> &Path {
        &self.storage_path
    }

    async fn run(&self, profile: &str, args: &[String]) -> Result<Vec<u8>> {
        let description = args.iter().take(2).cloned().collect::<Vec<_>>().join(" ");
        debug!(command = %description, profile = %profile, "running bridge command");

        let mut cmd = Command::new(&self.binary);
        cmd.args(&self.base_args)
            .args(args)
            .env("MINIKUBE_HOME", &self.storage_path)
            .kill_on_drop(true);

        let output = tokio::time::timeout(self.timeout, cmd.output())
            .await
            .map_err(|_| {
                warn!(command = %description, timeout = ?self.timeout, "bridge command timed out");
                Error::timeout(format!("bridge {description}"))
            })?
            .map_err(|e| {
                Error::provisioner(
                    profile,
                    ProvisionerErrorKind::Unavailable,
                    format!("failed to execute {}: {e}", self.binary.display()),
                )
            })?;

        check_output(profile, &description, output)
    }

    async fn query<T: DeserializeOwned>(&self, profile: &str, args: &[String]) -> Result<T> {
        let stdout = self.run(profile, args).await?;
        serde_json::from_slice(&stdout).map_err(|e| {
            Error::provisioner(
                profile,
                ProvisionerErrorKind::Provision,
                format!("invalid bridge output: {e}"),
            )
        })
    }
}

fn classify_exit(code: Option<i32>) -> ProvisionerErrorKind {
    match code {
        Some(EXIT_NOT_FOUND) => ProvisionerErrorKind::NotFound,
        Some(EXIT_UNAVAILABLE) => ProvisionerErrorKind::Unavailable,
        _ => ProvisionerErrorKind::Provision,
    }
}

fn check_output(profile: &str, description: &str, output: Output) -> Result<Vec<u8>> {
    if output.status.success() {
        return Ok(output.stdout);
    }
    let kind = classify_exit(output.status.code());
    let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
    let message = if stderr.is_empty() {
        format!("{description} exited with {}", output.status)
    } else {
        format!("{description}: {stderr}")
    };
    Err(Error::provisioner(profile, kind, message))
}

#[async_trait]
impl NodeProvisioner for ExecProvisioner {
    async fn get_profile_config(&self, profile: &str) -> Result<ProfileConfig> {
        self.query(profile, &["profile-config".to_string(), profile.to_string()])
            .await
    }

    async fn add_node(
        &self,
        profile: &str,
        spec: &NodeSpec,
        delete_on_failure: bool,
    ) -> Result<()> {
        let args = vec![
            "node".to_string(),
            "add".to_string(),
            profile.to_string(),
            "--name".to_string(),
            spec.name.clone(),
            format!("--worker={}", spec.worker),
            format!("--control-plane={}", spec.control_plane),
            "--kubernetes-version".to_string(),
            spec.kubernetes_version.clone(),
            format!("--delete-on-failure={delete_on_failure}"),
        ];
        self.run(profile, &args).await?;
        info!(profile = %profile, node = %spec.name, "node added");
        Ok(())
    }

    async fn delete_node(&self, profile: &str, node: &str) -> Result<()> {
        let args = [
            "node".to_string(),
            "delete".to_string(),
            profile.to_string(),
            node.to_string(),
        ];
        self.run(profile, &args).await?;
        info!(profile = %profile, node = %node, "node deleted");
        Ok(())
    }

    async fn describe_node(&self, profile: &str, node: &str) -> Result<NodeInfo> {
        let args = [
            "node".to_string(),
            "describe".to_string(),
            profile.to_string(),
            node.to_string(),
        ];
        let mut info: NodeInfo = self.query(profile, &args).await?;
        if info.provider_id.is_empty() {
            info.provider_id = provider_id(profile, node);
        }
        Ok(info)
    }
}
