//! Shell-out backend
//!
//! Runs a configured command per ban and unban, with `<ip>` replaced by the
//! address. Useful for iptables/ipset setups or remote firewalls. The
//! command is expected to treat repeated adds and removals of absent
//! entries as success.

use async_trait::async_trait;
use std::net::IpAddr;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::debug;

use super::{EnforcementBackend, EnforcementError};
use crate::config::CommandConfig;

pub struct CommandBackend {
    config: CommandConfig,
}

impl CommandBackend {
    pub fn new(config: CommandConfig) -> Self {
        Self { config }
    }

    async fn run(&self, template: &str, ip: IpAddr) -> Result<(), EnforcementError> {
        // The address is a parsed IpAddr, safe to place in a shell line
        let command = render(template, &ip);
        debug!("Running enforcement command: {}", command);

        let child = Command::new("sh")
            .arg("-c")
            .arg(&command)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let timeout = Duration::from_secs(self.config.timeout_secs.max(1));
        let output = tokio::time::timeout(timeout, child.wait_with_output())
            .await
            .map_err(|_| {
                EnforcementError::Unreachable(format!("'{}' timed out after {:?}", command, timeout))
            })??;

        if output.status.success() {
            Ok(())
        } else {
            Err(EnforcementError::Rejected {
                ip,
                reason: format!(
                    "'{}' exited with {}: {}",
                    command,
                    output.status,
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            })
        }
    }
}

fn render(template: &str, ip: &IpAddr) -> String {
    let family = match ip {
        IpAddr::V4(_) => "inet",
        IpAddr::V6(_) => "inet6",
    };
    template
        .replace("<ip>", &ip.to_string())
        .replace("<family>", family)
}

#[async_trait]
impl EnforcementBackend for CommandBackend {
    fn name(&self) -> &str {
        "command"
    }

    async fn install(&self, ip: IpAddr) -> Result<(), EnforcementError> {
        self.run(&self.config.ban, ip).await
    }

    async fn remove(&self, ip: IpAddr) -> Result<(), EnforcementError> {
        self.run(&self.config.unban, ip).await
    }
}
