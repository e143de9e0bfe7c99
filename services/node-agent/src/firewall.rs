//! Host firewall coordination.
//!
//! One rule per running instance port. Failures are reported to the caller,
//! which logs them; they never change instance state.

use std::collections::BTreeSet;
use std::sync::Mutex;

use async_trait::async_trait;
use thiserror::Error;
use tokio::process::Command;

#[derive(Debug, Error)]
pub enum FirewallError {
    #[error("`{command}` could not be run: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("`{command}` failed: {output}")]
    Failed { command: String, output: String },
}

impl FirewallError {
    pub fn command(&self) -> &str {
        match self {
            FirewallError::Spawn { command, .. } | FirewallError::Failed { command, .. } => command,
        }
    }
}

#[async_trait]
pub trait Firewall: Send + Sync {
    async fn open(&self, port: u16) -> Result<(), FirewallError>;
    async fn close(&self, port: u16) -> Result<(), FirewallError>;
}

/// Manages rules with `ufw`.
#[derive(Debug, Default, Clone)]
pub struct UfwFirewall;

impl UfwFirewall {
    async fn run(args: &[&str]) -> Result<(), FirewallError> {
        let command = format!("ufw {}", args.join(" "));
        let output = Command::new("ufw")
            .args(args)
            .output()
            .await
            .map_err(|source| FirewallError::Spawn {
                command: command.clone(),
                source,
            })?;
        if output.status.success() {
            return Ok(());
        }
        let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
        text.push_str(&String::from_utf8_lossy(&output.stderr));
        Err(FirewallError::Failed {
            command,
            output: text.trim().to_string(),
        })
    }
}

#[async_trait]
impl Firewall for UfwFirewall {
    async fn open(&self, port: u16) -> Result<(), FirewallError> {
        Self::run(&["allow", &port.to_string()]).await
    }

    async fn close(&self, port: u16) -> Result<(), FirewallError> {
        Self::run(&["delete", "allow", &port.to_string()]).await
    }
}

/// Tracks open ports in memory without touching the host.
#[derive(Debug, Default)]
pub struct MemoryFirewall {
    open: Mutex<BTreeSet<u16>>,
}

impl MemoryFirewall {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_open(&self, port: u16) -> bool {
        self.open
            .lock()
            .map(|open| open.contains(&port))
            .unwrap_or(false)
    }

    pub fn open_ports(&self) -> Vec<u16> {
        self.open
            .lock()
            .map(|open| open.iter().copied().collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl Firewall for MemoryFirewall {
    async fn open(&self, port: u16) -> Result<(), FirewallError> {
        if let Ok(mut open) = self.open.lock() {
            open.insert(port);
        }
        Ok(())
    }

    async fn close(&self, port: u16) -> Result<(), FirewallError> {
        if let Ok(mut open) = self.open.lock() {
            open.remove(&port);
        }
        Ok(())
    }
}
