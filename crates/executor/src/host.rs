//! Host operations the node agent needs from the machine it runs on.

use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;
use tokio::process::Command;
use tracing::debug;

#[derive(Debug, Error)]
pub enum HostError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Command '{command}' exited with status: {status}")]
    CommandFailed {
        command: String,
        status: std::process::ExitStatus,
    },

    #[error("Cannot parse block device list: {0}")]
    DeviceList(#[from] serde_json::Error),

    #[error("No usable IP address found")]
    NoAddress,
}

#[async_trait]
pub trait Host: Send + Sync {
    /// Primary IP address of this host.
    async fn discover_ip(&self) -> Result<String, HostError>;

    /// Issues a reboot. Returns once the command was accepted.
    async fn reboot(&self) -> Result<(), HostError>;

    /// Whole disks without partitions, filesystem or mount point.
    async fn unused_devices(&self) -> Result<Vec<String>, HostError>;
}

/// The machine the process runs on.
#[derive(Debug, Default, Clone)]
pub struct SystemHost;

impl SystemHost {
    pub fn new() -> Self {
        Self
    }
}

async fn output(program: &str, args: &[&str]) -> Result<String, HostError> {
    let output = Command::new(program).args(args).output().await?;
    if !output.status.success() {
        return Err(HostError::CommandFailed {
            command: format!("{program} {}", args.join(" ")),
            status: output.status,
        });
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

#[async_trait]
impl Host for SystemHost {
    async fn discover_ip(&self) -> Result<String, HostError> {
        let out = output("hostname", &["-I"]).await?;
        first_ipv4(&out).ok_or(HostError::NoAddress)
    }

    async fn reboot(&self) -> Result<(), HostError> {
        output("shutdown", &["-r", "now"]).await?;
        Ok(())
    }

    async fn unused_devices(&self) -> Result<Vec<String>, HostError> {
        let out = output("lsblk", &["--json", "--paths", "--output", "NAME,TYPE,FSTYPE,MOUNTPOINT"]).await?;
        let devices = parse_unused_devices(&out)?;
        debug!(count = devices.len(), "found unused block devices");
        Ok(devices)
    }
}

fn first_ipv4(out: &str) -> Option<String> {
    out.split_whitespace()
        .find(|addr| addr.parse::<std::net::Ipv4Addr>().is_ok_and(|ip| !ip.is_loopback()))
        .map(str::to_string)
}

#[derive(Debug, Deserialize)]
struct BlockDevices {
    blockdevices: Vec<BlockDevice>,
}

#[derive(Debug, Deserialize)]
struct BlockDevice {
    name: String,
    #[serde(rename = "type")]
    kind: String,
    fstype: Option<String>,
    mountpoint: Option<String>,
    #[serde(default)]
    children: Vec<BlockDevice>,
}

fn parse_unused_devices(json: &str) -> Result<Vec<String>, serde_json::Error> {
    let list: BlockDevices = serde_json::from_str(json)?;
    Ok(list
        .blockdevices
        .into_iter()
        .filter(|d| d.kind == "disk" && d.children.is_empty() && d.fstype.is_none() && d.mountpoint.is_none())
        .map(|d| d.name)
        .collect())
}
