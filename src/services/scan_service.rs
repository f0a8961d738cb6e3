use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use uuid::Uuid;

use crate::{
    config::Settings,
    error::ApiError,
    models::{
        Finding, Host, Insight, ScanOptions, ScanRecord, ScanStatus, ScanStatusResponse, ScanType,
        SeverityRules, TriggerScanRequest,
    },
    repositories::ScanRepository,
    services::{
        admission::AdmissionController,
        command::{output_path_for, NmapCommand, ScanAttempt},
        discovery::PreDiscovery,
        events::{EventBus, ProgressReporter},
        insight_service::{InsightEngine, ScanSnapshot},
        notifications::Notifier,
        parser::{self, FalsePositiveFilter},
        supervisor::{LaunchOutcome, ProcessSupervisor, SupervisorLimits},
    },
};

/// Orchestrates the full scan lifecycle: admission, process supervision,
/// parsing, persistence, insight generation, and cancellation. One instance
/// is shared across all request handlers.
pub struct ScanService {
    settings: Arc<Settings>,
    repo: Arc<dyn ScanRepository>,
    bus: EventBus,
    notifier: Arc<dyn Notifier>,
    admission: AdmissionController,
    supervisor: ProcessSupervisor,
    insight_engine: InsightEngine,
    fp_filter: FalsePositiveFilter,
    // Live cancellation senders, keyed by scan id. Entries exist only while
    // a worker task is running; the database is the source of truth for
    // which scans are active.
    cancel_registry: Mutex<HashMap<Uuid, watch::Sender<bool>>>,
}

impl ScanService {
    pub fn new(
        settings: Arc<Settings>,
        repo: Arc<dyn ScanRepository>,
        bus: EventBus,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        let severity = SeverityRules {
            critical_keywords: settings.severity_critical_keywords.clone(),
            high_keywords: settings.severity_high_keywords.clone(),
            medium_keywords: settings.severity_medium_keywords.clone(),
            ..SeverityRules::default()
        };

        Self {
            admission: AdmissionController::new(repo.clone(), settings.max_concurrent_scans),
            supervisor: ProcessSupervisor::new(
                repo.clone(),
                SupervisorLimits::from_settings(&settings),
            ),
            insight_engine: InsightEngine::new(severity),
            fp_filter: FalsePositiveFilter::default(),
            settings,
            repo,
            bus,
            notifier,
            cancel_registry: Mutex::new(HashMap::new()),
        }
    }

    // ------------------------------------------------------------------
    // Public API
    // ------------------------------------------------------------------

    /// Admit, persist, and launch a scan. Returns as soon as the record
    /// exists and the worker task is running; progress flows through the
    /// event bus and the status endpoints.
    pub async fn trigger_scan(
        self: Arc<Self>,
        request: TriggerScanRequest,
    ) -> Result<ScanRecord, ApiError> {
        let scan_type: ScanType = request.scan_type.parse()?;
        if !scan_type.is_launchable() {
            return Err(ApiError::validation(
                "Uploaded scans are imported via the upload endpoint, not triggered",
            ));
        }

        let target = request
            .target_network
            .unwrap_or_else(|| self.settings.target_network.clone());
        let options = request
            .options
            .unwrap_or_else(|| ScanOptions::from_settings(&self.settings));

        self.admission.admit(scan_type, &target).await?;

        let record = self.repo.create(scan_type, &target).await?;
        tracing::info!(
            scan_id = %record.id,
            scan_type = %scan_type,
            target = %target,
            "scan admitted"
        );

        let cancel_rx = self.register_cancel(record.id);
        let service = Arc::clone(&self);
        let worker_record = record.clone();
        tokio::spawn(async move {
            service
                .run_scan(worker_record, scan_type, options, target, cancel_rx)
                .await;
        });

        Ok(record)
    }

    /// Cancel one scan. Idempotent: cancelling a terminal scan returns its
    /// record unchanged.
    pub async fn cancel_scan(&self, id: &Uuid) -> Result<ScanRecord, ApiError> {
        let record = self
            .repo
            .get_by_id(id)
            .await?
            .ok_or_else(|| ApiError::not_found(format!("Scan {} not found", id)))?;

        if record.status_enum().is_terminal() {
            return Ok(record);
        }

        // Persist the terminal state first, then tear down the process.
        let finalized = self
            .repo
            .finalize(id, ScanStatus::Cancelled, Some("cancelled by request"))
            .await?;

        self.signal_cancel(id);

        match finalized {
            Some(record) => {
                tracing::info!(scan_id = %id, "scan cancelled");
                self.bus.scan_complete(*id, ScanStatus::Cancelled);
                Ok(record)
            }
            // Lost the race against the worker's own finalize
            None => self
                .repo
                .get_by_id(id)
                .await?
                .ok_or_else(|| ApiError::not_found(format!("Scan {} not found", id))),
        }
    }

    /// Cancel every non-terminal scan. Returns how many were cancelled.
    pub async fn cancel_all_active(&self) -> Result<u64, ApiError> {
        let active = self.repo.list_active().await?;
        let mut cancelled = 0;
        for record in active {
            if self.cancel_scan(&record.id).await.is_ok() {
                cancelled += 1;
            }
        }
        Ok(cancelled)
    }

    pub async fn get_scan(&self, id: &Uuid) -> Result<ScanRecord, ApiError> {
        self.repo
            .get_by_id(id)
            .await?
            .ok_or_else(|| ApiError::not_found(format!("Scan {} not found", id)))
    }

    pub async fn get_status(&self, id: &Uuid) -> Result<ScanStatusResponse, ApiError> {
        Ok(ScanStatusResponse::from(&self.get_scan(id).await?))
    }

    pub async fn list_active(&self) -> Result<Vec<ScanRecord>, ApiError> {
        self.repo.list_active().await
    }

    pub async fn list_history(&self, limit: i64, offset: i64) -> Result<Vec<ScanRecord>, ApiError> {
        self.repo.list(limit.clamp(1, 500), offset.max(0)).await
    }

    /// Import a previously produced nmap XML document as a completed scan.
    /// Runs the same parse/save/insight pipeline without a process.
    pub async fn import_uploaded_xml(&self, xml: &str) -> Result<ScanRecord, ApiError> {
        let record = self
            .repo
            .create(ScanType::Uploaded, &self.settings.target_network)
            .await?;

        let dir = Path::new(&self.settings.scan_output_dir);
        tokio::fs::create_dir_all(dir).await?;
        let path = dir.join(format!(
            "uploaded_{}.xml",
            Utc::now().format("%Y-%m-%d_%H%M%S")
        ));
        tokio::fs::write(&path, xml).await?;
        self.repo
            .set_output_path(&record.id, &path.to_string_lossy())
            .await?;

        let reporter = ProgressReporter::new(record.id, self.repo.clone(), self.bus.clone());
        reporter.emit(ScanStatus::Parsing, 90.0, None).await?;

        let hosts = match parser::parse_hosts(xml) {
            Ok(hosts) => hosts,
            Err(e) => {
                self.repo
                    .finalize(&record.id, ScanStatus::Error, Some(&e.to_string()))
                    .await?;
                return Err(e);
            }
        };
        let findings = parser::extract_findings(&hosts, &self.fp_filter);

        reporter.emit(ScanStatus::Saving, 98.0, None).await?;
        self.save_parsed(&record.id, &hosts, &findings).await?;
        self.generate_insights(&record.id, ScanType::Uploaded, &hosts, &findings)
            .await?;

        let finalized = self
            .repo
            .finalize(&record.id, ScanStatus::Complete, None)
            .await?;
        self.bus.scan_complete(record.id, ScanStatus::Complete);

        match finalized {
            Some(record) => Ok(record),
            None => self.get_scan(&record.id).await,
        }
    }

    /// List a scan's insights, optionally filtered to unread ones or those
    /// at or above a priority floor. Order is as stored: priority descending.
    pub async fn list_insights(
        &self,
        scan_id: &Uuid,
        unread_only: bool,
        min_priority: Option<i32>,
    ) -> Result<Vec<Insight>, ApiError> {
        let record = self.get_scan(scan_id).await?;
        let insights: Vec<Insight> = serde_json::from_value(record.insights)?;
        Ok(insights
            .into_iter()
            .filter(|i| !unread_only || !i.is_read)
            .filter(|i| min_priority.map_or(true, |floor| i.priority >= floor))
            .collect())
    }

    /// Mark one insight on a scan as read.
    pub async fn mark_insight_read(
        &self,
        scan_id: &Uuid,
        insight_id: &Uuid,
    ) -> Result<Insight, ApiError> {
        let record = self.get_scan(scan_id).await?;
        let mut insights: Vec<Insight> = serde_json::from_value(record.insights)?;

        let target = insights
            .iter_mut()
            .find(|i| i.id == *insight_id)
            .ok_or_else(|| {
                ApiError::not_found(format!("Insight {} not found on scan {}", insight_id, scan_id))
            })?;
        target.is_read = true;
        let updated = target.clone();

        self.repo
            .save_insights(scan_id, &serde_json::to_value(&insights)?)
            .await?;
        Ok(updated)
    }

    // ------------------------------------------------------------------
    // Worker pipeline
    // ------------------------------------------------------------------

    async fn run_scan(
        self: Arc<Self>,
        record: ScanRecord,
        scan_type: ScanType,
        options: ScanOptions,
        target: String,
        cancel_rx: watch::Receiver<bool>,
    ) {
        let scan_id = record.id;
        let outcome = self
            .execute_scan(&record, scan_type, &options, &target, cancel_rx)
            .await;

        let final_status = match outcome {
            Ok(status) => status,
            Err(e) => {
                tracing::error!(scan_id = %scan_id, error = %e, "scan failed");
                let reason = e.to_string();
                match self
                    .repo
                    .finalize(&scan_id, ScanStatus::Error, Some(&reason))
                    .await
                {
                    Ok(Some(_)) => ScanStatus::Error,
                    // Already terminal: cancellation beat us to it
                    Ok(None) => self
                        .repo
                        .get_by_id(&scan_id)
                        .await
                        .ok()
                        .flatten()
                        .map(|r| r.status_enum())
                        .unwrap_or(ScanStatus::Error),
                    Err(db_err) => {
                        tracing::error!(scan_id = %scan_id, error = %db_err, "failed to record scan error");
                        ScanStatus::Error
                    }
                }
            }
        };

        self.unregister_cancel(&scan_id);
        self.bus.scan_complete(scan_id, final_status);

        let title = format!("Scan {}", final_status);
        let message = format!("{} scan of {} finished: {}", scan_type, target, final_status);
        self.notifier.notify(&title, &message).await;
    }

    async fn execute_scan(
        &self,
        record: &ScanRecord,
        scan_type: ScanType,
        options: &ScanOptions,
        target: &str,
        cancel_rx: watch::Receiver<bool>,
    ) -> Result<ScanStatus, ApiError> {
        let reporter = ProgressReporter::new(record.id, self.repo.clone(), self.bus.clone());

        let targets = self.resolve_targets(scan_type, target).await;

        let output_path = output_path_for(
            Path::new(&self.settings.scan_output_dir),
            scan_type,
            Utc::now(),
        );
        self.repo
            .set_output_path(&record.id, &output_path.to_string_lossy())
            .await?;

        reporter.emit(ScanStatus::Running, 0.0, None).await?;

        let command = NmapCommand::build(
            &self.settings.nmap_binary,
            scan_type,
            options,
            &targets,
            &output_path,
            ScanAttempt::Normal,
        )?;

        let mut outcome = self
            .supervisor
            .launch(&command, &reporter, cancel_rx.clone())
            .await?;

        // One unprivileged retry with a downgraded command profile
        if let LaunchOutcome::PrivilegeError { .. } = &outcome {
            if scan_type.supports_degraded_fallback() {
                tracing::warn!(
                    scan_id = %record.id,
                    "retrying with unprivileged scan profile"
                );
                reporter.log_line("Insufficient privileges; retrying with connect scan");
                let degraded = NmapCommand::build(
                    &self.settings.nmap_binary,
                    scan_type,
                    options,
                    &targets,
                    &output_path,
                    ScanAttempt::Degraded,
                )?;
                outcome = self
                    .supervisor
                    .launch(&degraded, &reporter, cancel_rx)
                    .await?;
            }
        }

        match outcome {
            LaunchOutcome::Completed => {}
            LaunchOutcome::Cancelled => {
                self.repo
                    .finalize(&record.id, ScanStatus::Cancelled, Some("cancelled by request"))
                    .await?;
                return Ok(ScanStatus::Cancelled);
            }
            LaunchOutcome::PrivilegeError { tail } => {
                return Err(ApiError::process_failure(format!(
                    "scanner requires elevated privileges; last output:\n{}",
                    tail
                )));
            }
            LaunchOutcome::Failed { reason } => {
                return Err(ApiError::process_failure(reason));
            }
        }

        reporter
            .emit(ScanStatus::Parsing, 90.0, Some("parsing results"))
            .await?;

        // On parse failure the XML artifact stays on disk for diagnosis
        let xml = tokio::fs::read_to_string(&output_path).await?;
        let mut hosts = parser::parse_hosts(&xml)?;
        if scan_type == ScanType::Discovery {
            hosts = parser::drop_boundary_addresses(hosts, target);
        }
        let findings = parser::extract_findings(&hosts, &self.fp_filter);
        reporter.emit(ScanStatus::Parsing, 95.0, None).await?;

        reporter
            .emit(ScanStatus::Saving, 98.0, Some("saving results"))
            .await?;
        self.save_parsed(&record.id, &hosts, &findings).await?;

        // Discovery sweeps complete without postprocessing
        if scan_type != ScanType::Discovery {
            reporter
                .emit(ScanStatus::Postprocessing, 98.0, Some("generating insights"))
                .await?;
            self.generate_insights(&record.id, scan_type, &hosts, &findings)
                .await?;
        }

        match self
            .repo
            .finalize(&record.id, ScanStatus::Complete, None)
            .await?
        {
            Some(_) => Ok(ScanStatus::Complete),
            // Cancelled between the last save and the finalize
            None => Ok(self
                .repo
                .get_by_id(&record.id)
                .await?
                .map(|r| r.status_enum())
                .unwrap_or(ScanStatus::Cancelled)),
        }
    }

    /// Optionally narrow the target list with a ping sweep. Empty results
    /// and failures fall back to the full CIDR.
    async fn resolve_targets(&self, scan_type: ScanType, target: &str) -> Vec<String> {
        if self.settings.pre_discovery_enabled && scan_type != ScanType::Discovery {
            let discovery = PreDiscovery::new(
                self.settings.nmap_binary.clone(),
                Duration::from_secs(self.settings.pre_discovery_timeout_seconds),
            );
            let live = discovery.live_hosts(target).await;
            if !live.is_empty() {
                tracing::info!(
                    target = %target,
                    live_hosts = live.len(),
                    "pre-discovery narrowed scan targets"
                );
                return live;
            }
        }
        vec![target.to_string()]
    }

    async fn save_parsed(
        &self,
        scan_id: &Uuid,
        hosts: &[Host],
        findings: &[Finding],
    ) -> Result<(), ApiError> {
        let counters = parser::count_results(hosts);
        self.repo
            .save_results(
                scan_id,
                &serde_json::to_value(hosts)?,
                &serde_json::to_value(findings)?,
                counters,
            )
            .await
    }

    /// Diff against the previous completed scan of the same type, or emit a
    /// baseline summary for the first one. Insight failures degrade to an
    /// empty list; they never fail the scan.
    async fn generate_insights(
        &self,
        scan_id: &Uuid,
        scan_type: ScanType,
        hosts: &[Host],
        findings: &[Finding],
    ) -> Result<(), ApiError> {
        let current = ScanSnapshot { hosts, findings };

        let insights = match self.repo.latest_completed_of_type(scan_type, scan_id).await {
            Ok(Some(previous_record)) => match snapshot_from_record(&previous_record) {
                Ok((prev_hosts, prev_findings)) => {
                    let previous = ScanSnapshot {
                        hosts: &prev_hosts,
                        findings: &prev_findings,
                    };
                    self.insight_engine.diff(&previous, &current, *scan_id)
                }
                Err(e) => {
                    tracing::warn!(
                        scan_id = %scan_id,
                        previous = %previous_record.id,
                        error = %e,
                        "previous scan results unreadable, skipping diff"
                    );
                    Vec::new()
                }
            },
            Ok(None) => self.insight_engine.baseline(&current, *scan_id),
            Err(e) => {
                tracing::warn!(scan_id = %scan_id, error = %e, "insight baseline lookup failed");
                Vec::new()
            }
        };

        tracing::info!(scan_id = %scan_id, count = insights.len(), "insights generated");
        self.repo
            .save_insights(scan_id, &serde_json::to_value(&insights)?)
            .await
    }

    // ------------------------------------------------------------------
    // Cancellation registry
    // ------------------------------------------------------------------

    fn register_cancel(&self, scan_id: Uuid) -> watch::Receiver<bool> {
        let (tx, rx) = watch::channel(false);
        self.cancel_registry
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(scan_id, tx);
        rx
    }

    fn signal_cancel(&self, scan_id: &Uuid) {
        let registry = self.cancel_registry.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(tx) = registry.get(scan_id) {
            let _ = tx.send(true);
        }
    }

    fn unregister_cancel(&self, scan_id: &Uuid) {
        self.cancel_registry
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(scan_id);
    }
}

fn snapshot_from_record(record: &ScanRecord) -> Result<(Vec<Host>, Vec<Finding>), ApiError> {
    let hosts: Vec<Host> = serde_json::from_value(record.hosts.clone())
        .map_err(|e| ApiError::InsightEngine(format!("stored hosts unreadable: {}", e)))?;
    let findings: Vec<Finding> = serde_json::from_value(record.vulns.clone())
        .map_err(|e| ApiError::InsightEngine(format!("stored findings unreadable: {}", e)))?;
    Ok((hosts, findings))
}
