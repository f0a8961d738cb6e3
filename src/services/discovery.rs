use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;
use tokio::time::timeout;

use crate::services::parser;

/// Fast ping sweep run before a heavy scan to narrow its target list.
///
/// Strictly best-effort: any failure (spawn error, timeout, unparseable
/// output, zero live hosts) returns an empty list and the caller falls back
/// to scanning the full CIDR. A broken pre-discovery must never block a
/// scan that would otherwise run.
pub struct PreDiscovery {
    binary: String,
    timeout: Duration,
}

impl PreDiscovery {
    pub fn new(binary: impl Into<String>, timeout: Duration) -> Self {
        Self {
            binary: binary.into(),
            timeout,
        }
    }

    pub async fn live_hosts(&self, cidr: &str) -> Vec<String> {
        // One retry covers transient failures like a busy interface
        for attempt in 1..=2 {
            match self.sweep(cidr).await {
                Ok(hosts) if !hosts.is_empty() => return hosts,
                Ok(_) => {
                    tracing::info!(cidr = %cidr, attempt = attempt, "pre-discovery found no hosts");
                }
                Err(reason) => {
                    tracing::warn!(cidr = %cidr, attempt = attempt, reason = %reason, "pre-discovery failed");
                }
            }
        }
        Vec::new()
    }

    async fn sweep(&self, cidr: &str) -> Result<Vec<String>, String> {
        let output_path = self.temp_output_path();

        let child = Command::new(&self.binary)
            .args([
                "-sn",
                "-T4",
                cidr,
                "-oX",
                &output_path.to_string_lossy(),
            ])
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| format!("spawn failed: {}", e))?;

        let result = timeout(self.timeout, child.wait_with_output()).await;

        let parsed = match result {
            Ok(Ok(output)) if output.status.success() => {
                match tokio::fs::read_to_string(&output_path).await {
                    Ok(xml) => parser::parse_hosts(&xml)
                        .map_err(|e| format!("unparseable sweep output: {}", e)),
                    Err(e) => Err(format!("sweep output unreadable: {}", e)),
                }
            }
            Ok(Ok(output)) => Err(format!("sweep exited with {}", output.status)),
            Ok(Err(e)) => Err(format!("sweep wait failed: {}", e)),
            Err(_) => Err(format!("sweep timed out after {:?}", self.timeout)),
        };

        let _ = tokio::fs::remove_file(&output_path).await;

        // parse_hosts already drops down hosts
        let hosts = parsed?;
        let hosts = parser::drop_boundary_addresses(hosts, cidr);
        Ok(hosts.into_iter().map(|h| h.ip).collect())
    }

    fn temp_output_path(&self) -> PathBuf {
        std::env::temp_dir().join(format!("discovery_{}.xml", uuid::Uuid::new_v4()))
    }
}
