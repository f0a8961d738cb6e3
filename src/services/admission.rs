use std::sync::Arc;

use crate::{error::ApiError, models::ScanType, repositories::ScanRepository};

/// Gate in front of scan creation. There is no queue: a request over the
/// concurrency ceiling is rejected outright and the client retries later.
/// Discovery sweeps are cheap liveness probes and bypass the ceiling.
pub struct AdmissionController {
    repo: Arc<dyn ScanRepository>,
    max_concurrent_scans: u32,
}

impl AdmissionController {
    pub fn new(repo: Arc<dyn ScanRepository>, max_concurrent_scans: u32) -> Self {
        Self {
            repo,
            max_concurrent_scans,
        }
    }

    pub async fn admit(&self, scan_type: ScanType, target_network: &str) -> Result<(), ApiError> {
        target_network
            .parse::<ipnet::IpNet>()
            .map_err(|_| {
                ApiError::validation(format!("Invalid target network: {}", target_network))
            })?;

        if !scan_type.counts_against_ceiling() {
            return Ok(());
        }

        let current = self.repo.count_active_heavy().await? as u32;
        if current >= self.max_concurrent_scans {
            tracing::warn!(
                scan_type = %scan_type,
                current = current,
                limit = self.max_concurrent_scans,
                "scan rejected by admission control"
            );
            return Err(ApiError::AdmissionRejected {
                current,
                limit: self.max_concurrent_scans,
            });
        }

        Ok(())
    }
}
