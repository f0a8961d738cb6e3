//! In-memory repository used by service tests.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::{
    error::ApiError,
    models::{ScanCounters, ScanRecord, ScanStatus, ScanType},
    repositories::ScanRepository,
};

/// Mirrors the SQL repository's semantics: monotonic percent, terminal
/// closure, completed_at written at most once.
pub struct InMemoryScanRepository {
    scans: Mutex<HashMap<Uuid, ScanRecord>>,
}

impl InMemoryScanRepository {
    pub fn new() -> Self {
        Self {
            scans: Mutex::new(HashMap::new()),
        }
    }

    pub async fn insert(&self, scan_type: ScanType, target_network: &str) -> ScanRecord {
        self.create(scan_type, target_network)
            .await
            .expect("in-memory create cannot fail")
    }

    pub async fn get(&self, id: &Uuid) -> ScanRecord {
        self.get_by_id(id)
            .await
            .expect("in-memory get cannot fail")
            .expect("scan should exist")
    }

    pub fn set_status(&self, id: &Uuid, status: ScanStatus) {
        let mut scans = self.scans.lock().unwrap();
        if let Some(record) = scans.get_mut(id) {
            record.status = status.to_string();
        }
    }

    fn blank_record(scan_type: ScanType, target_network: &str) -> ScanRecord {
        ScanRecord {
            id: Uuid::new_v4(),
            scan_type: scan_type.to_string(),
            status: ScanStatus::Pending.to_string(),
            percent: 0.0,
            error_reason: None,
            target_network: target_network.to_string(),
            raw_output_path: String::new(),
            process_id: None,
            hosts: json!([]),
            vulns: json!([]),
            insights: json!([]),
            total_hosts: 0,
            hosts_up: 0,
            total_ports: 0,
            open_ports: 0,
            created_at: Utc::now(),
            completed_at: None,
        }
    }
}

#[async_trait]
impl ScanRepository for InMemoryScanRepository {
    async fn create(
        &self,
        scan_type: ScanType,
        target_network: &str,
    ) -> Result<ScanRecord, ApiError> {
        let record = Self::blank_record(scan_type, target_network);
        self.scans
            .lock()
            .unwrap()
            .insert(record.id, record.clone());
        Ok(record)
    }

    async fn get_by_id(&self, id: &Uuid) -> Result<Option<ScanRecord>, ApiError> {
        Ok(self.scans.lock().unwrap().get(id).cloned())
    }

    async fn list(&self, limit: i64, offset: i64) -> Result<Vec<ScanRecord>, ApiError> {
        let mut all: Vec<_> = self.scans.lock().unwrap().values().cloned().collect();
        all.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(all
            .into_iter()
            .skip(offset as usize)
            .take(limit as usize)
            .collect())
    }

    async fn list_active(&self) -> Result<Vec<ScanRecord>, ApiError> {
        Ok(self
            .scans
            .lock()
            .unwrap()
            .values()
            .filter(|s| !s.status_enum().is_terminal())
            .cloned()
            .collect())
    }

    async fn count_active_heavy(&self) -> Result<i64, ApiError> {
        Ok(self
            .scans
            .lock()
            .unwrap()
            .values()
            .filter(|s| {
                !s.status_enum().is_terminal() && s.scan_type != ScanType::Discovery.to_string()
            })
            .count() as i64)
    }

    async fn update_progress(
        &self,
        id: &Uuid,
        status: ScanStatus,
        percent: f64,
    ) -> Result<(), ApiError> {
        let mut scans = self.scans.lock().unwrap();
        if let Some(record) = scans.get_mut(id) {
            if !record.status_enum().is_terminal() {
                record.status = status.to_string();
                record.percent = record.percent.max(percent.clamp(0.0, 100.0));
            }
        }
        Ok(())
    }

    async fn set_process_id(&self, id: &Uuid, pid: Option<i64>) -> Result<(), ApiError> {
        let mut scans = self.scans.lock().unwrap();
        if let Some(record) = scans.get_mut(id) {
            record.process_id = pid;
        }
        Ok(())
    }

    async fn set_output_path(&self, id: &Uuid, path: &str) -> Result<(), ApiError> {
        let mut scans = self.scans.lock().unwrap();
        if let Some(record) = scans.get_mut(id) {
            record.raw_output_path = path.to_string();
        }
        Ok(())
    }

    async fn save_results(
        &self,
        id: &Uuid,
        hosts: &Value,
        vulns: &Value,
        counters: ScanCounters,
    ) -> Result<(), ApiError> {
        let mut scans = self.scans.lock().unwrap();
        if let Some(record) = scans.get_mut(id) {
            record.hosts = hosts.clone();
            record.vulns = vulns.clone();
            record.total_hosts = counters.total_hosts;
            record.hosts_up = counters.hosts_up;
            record.total_ports = counters.total_ports;
            record.open_ports = counters.open_ports;
        }
        Ok(())
    }

    async fn save_insights(&self, id: &Uuid, insights: &Value) -> Result<(), ApiError> {
        let mut scans = self.scans.lock().unwrap();
        if let Some(record) = scans.get_mut(id) {
            record.insights = insights.clone();
        }
        Ok(())
    }

    async fn finalize(
        &self,
        id: &Uuid,
        status: ScanStatus,
        reason: Option<&str>,
    ) -> Result<Option<ScanRecord>, ApiError> {
        if !status.is_terminal() {
            return Err(ApiError::internal("finalize with non-terminal status"));
        }
        let mut scans = self.scans.lock().unwrap();
        match scans.get_mut(id) {
            Some(record) if !record.status_enum().is_terminal() => {
                record.status = status.to_string();
                record.error_reason = reason.map(String::from);
                if status == ScanStatus::Complete {
                    record.percent = 100.0;
                }
                if record.completed_at.is_none() {
                    record.completed_at = Some(Utc::now());
                }
                Ok(Some(record.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn latest_completed_of_type(
        &self,
        scan_type: ScanType,
        exclude: &Uuid,
    ) -> Result<Option<ScanRecord>, ApiError> {
        let scans = self.scans.lock().unwrap();
        let mut candidates: Vec<_> = scans
            .values()
            .filter(|s| {
                s.scan_type == scan_type.to_string()
                    && s.status_enum() == ScanStatus::Complete
                    && s.id != *exclude
            })
            .cloned()
            .collect();
        candidates.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(candidates.into_iter().next())
    }

    async fn reconcile_interrupted(&self, reason: &str) -> Result<u64, ApiError> {
        let mut scans = self.scans.lock().unwrap();
        let mut count = 0;
        for record in scans.values_mut() {
            if !record.status_enum().is_terminal() {
                record.status = ScanStatus::Error.to_string();
                record.error_reason = Some(reason.to_string());
                record.process_id = None;
                if record.completed_at.is_none() {
                    record.completed_at = Some(Utc::now());
                }
                count += 1;
            }
        }
        Ok(count)
    }
}
