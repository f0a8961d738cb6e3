use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::FromRow;
use uuid::Uuid;

use crate::config::Settings;
use crate::error::ApiError;

// ============================================================================
// Scan type - which nmap profile a scan runs
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanType {
    FullTcp,
    Iot,
    Vuln,
    Discovery,
    Uploaded,
}

impl Default for ScanType {
    fn default() -> Self {
        Self::FullTcp
    }
}

impl std::fmt::Display for ScanType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ScanType::FullTcp => write!(f, "full_tcp"),
            ScanType::Iot => write!(f, "iot"),
            ScanType::Vuln => write!(f, "vuln"),
            ScanType::Discovery => write!(f, "discovery"),
            ScanType::Uploaded => write!(f, "uploaded"),
        }
    }
}

impl std::str::FromStr for ScanType {
    type Err = ApiError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "full_tcp" | "full tcp" | "full" => Ok(ScanType::FullTcp),
            "iot" | "iot_scan" | "iot scan" => Ok(ScanType::Iot),
            "vuln" | "vuln_scripts" | "vuln scripts" => Ok(ScanType::Vuln),
            "discovery" => Ok(ScanType::Discovery),
            "uploaded" => Ok(ScanType::Uploaded),
            other => Err(ApiError::validation(format!("Unknown scan type: {}", other))),
        }
    }
}

impl ScanType {
    /// Discovery sweeps are exempt from the concurrency ceiling.
    pub fn counts_against_ceiling(&self) -> bool {
        !matches!(self, ScanType::Discovery)
    }

    /// Types that use raw-socket SYN scans and can degrade to connect scans.
    pub fn supports_degraded_fallback(&self) -> bool {
        matches!(self, ScanType::FullTcp | ScanType::Vuln)
    }

    /// Uploaded scans are imported, never launched.
    pub fn is_launchable(&self) -> bool {
        !matches!(self, ScanType::Uploaded)
    }
}

// ============================================================================
// Scan status - lifecycle state machine
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScanStatus {
    Pending,
    Running,
    Parsing,
    Saving,
    Postprocessing,
    Complete,
    Error,
    Cancelled,
}

impl Default for ScanStatus {
    fn default() -> Self {
        Self::Pending
    }
}

impl std::fmt::Display for ScanStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ScanStatus::Pending => write!(f, "pending"),
            ScanStatus::Running => write!(f, "running"),
            ScanStatus::Parsing => write!(f, "parsing"),
            ScanStatus::Saving => write!(f, "saving"),
            ScanStatus::Postprocessing => write!(f, "postprocessing"),
            ScanStatus::Complete => write!(f, "complete"),
            ScanStatus::Error => write!(f, "error"),
            ScanStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl From<&str> for ScanStatus {
    fn from(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "running" => ScanStatus::Running,
            "parsing" => ScanStatus::Parsing,
            "saving" => ScanStatus::Saving,
            "postprocessing" => ScanStatus::Postprocessing,
            "complete" => ScanStatus::Complete,
            "error" => ScanStatus::Error,
            "cancelled" => ScanStatus::Cancelled,
            _ => ScanStatus::Pending,
        }
    }
}

impl ScanStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ScanStatus::Complete | ScanStatus::Error | ScanStatus::Cancelled
        )
    }

    /// Valid forward transitions. Terminal states admit none.
    pub fn can_transition_to(&self, next: ScanStatus) -> bool {
        if self.is_terminal() {
            return false;
        }
        if matches!(next, ScanStatus::Error | ScanStatus::Cancelled) {
            return true;
        }
        matches!(
            (self, next),
            (ScanStatus::Pending, ScanStatus::Running)
                | (ScanStatus::Pending, ScanStatus::Parsing)
                | (ScanStatus::Running, ScanStatus::Parsing)
                | (ScanStatus::Parsing, ScanStatus::Saving)
                | (ScanStatus::Saving, ScanStatus::Postprocessing)
                | (ScanStatus::Saving, ScanStatus::Complete)
                | (ScanStatus::Postprocessing, ScanStatus::Complete)
        )
    }
}

// ============================================================================
// Scan options - per-scan nmap feature toggles
// ============================================================================

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ScanOptions {
    #[serde(default = "default_true")]
    pub vuln_scanning_enabled: bool,
    #[serde(default = "default_true")]
    pub os_detection_enabled: bool,
    #[serde(default = "default_true")]
    pub service_detection_enabled: bool,
    #[serde(default)]
    pub aggressive_scanning: bool,
}

fn default_true() -> bool {
    true
}

impl Default for ScanOptions {
    fn default() -> Self {
        Self {
            vuln_scanning_enabled: true,
            os_detection_enabled: true,
            service_detection_enabled: true,
            aggressive_scanning: false,
        }
    }
}

impl ScanOptions {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            vuln_scanning_enabled: settings.vuln_scanning_enabled,
            os_detection_enabled: settings.os_detection_enabled,
            service_detection_enabled: settings.service_detection_enabled,
            aggressive_scanning: settings.aggressive_scanning,
        }
    }
}

// ============================================================================
// Scan record + DTOs
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ScanRecord {
    pub id: Uuid,
    pub scan_type: String,
    pub status: String,
    pub percent: f64,
    pub error_reason: Option<String>,
    pub target_network: String,
    pub raw_output_path: String,
    pub process_id: Option<i64>,
    pub hosts: Value,
    pub vulns: Value,
    pub insights: Value,
    pub total_hosts: i32,
    pub hosts_up: i32,
    pub total_ports: i32,
    pub open_ports: i32,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl ScanRecord {
    pub fn status_enum(&self) -> ScanStatus {
        ScanStatus::from(self.status.as_str())
    }

    pub fn scan_type_enum(&self) -> Result<ScanType, ApiError> {
        self.scan_type.parse()
    }
}

/// Request body for POST /api/scan
#[derive(Debug, Clone, Deserialize)]
pub struct TriggerScanRequest {
    pub scan_type: String,
    #[serde(default)]
    pub options: Option<ScanOptions>,
    #[serde(default)]
    pub target_network: Option<String>,
}

/// Compact status view for polling clients
#[derive(Debug, Clone, Serialize)]
pub struct ScanStatusResponse {
    pub id: Uuid,
    pub status: String,
    pub percent: f64,
    pub error_reason: Option<String>,
}

impl From<&ScanRecord> for ScanStatusResponse {
    fn from(record: &ScanRecord) -> Self {
        Self {
            id: record.id,
            status: record.status.clone(),
            percent: record.percent,
            error_reason: record.error_reason.clone(),
        }
    }
}

/// Result counters computed at save time
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct ScanCounters {
    pub total_hosts: i32,
    pub hosts_up: i32,
    pub total_ports: i32,
    pub open_ports: i32,
}
