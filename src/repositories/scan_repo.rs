use async_trait::async_trait;
use serde_json::Value;
use sqlx::PgPool;
use uuid::Uuid;

use crate::{
    error::ApiError,
    models::{ScanCounters, ScanRecord, ScanStatus, ScanType},
};

const TERMINAL_STATUSES: &str = "('complete', 'error', 'cancelled')";

#[async_trait]
pub trait ScanRepository: Send + Sync {
    async fn create(
        &self,
        scan_type: ScanType,
        target_network: &str,
    ) -> Result<ScanRecord, ApiError>;
    async fn get_by_id(&self, id: &Uuid) -> Result<Option<ScanRecord>, ApiError>;
    async fn list(&self, limit: i64, offset: i64) -> Result<Vec<ScanRecord>, ApiError>;
    /// Active scans are a database query, never an in-memory cache.
    async fn list_active(&self) -> Result<Vec<ScanRecord>, ApiError>;
    /// Count of active scans that count against the concurrency ceiling.
    async fn count_active_heavy(&self) -> Result<i64, ApiError>;
    /// Advance status/percent for a live scan. Percent can only grow; the
    /// update is a no-op once the scan is terminal.
    async fn update_progress(
        &self,
        id: &Uuid,
        status: ScanStatus,
        percent: f64,
    ) -> Result<(), ApiError>;
    async fn set_process_id(&self, id: &Uuid, pid: Option<i64>) -> Result<(), ApiError>;
    async fn set_output_path(&self, id: &Uuid, path: &str) -> Result<(), ApiError>;
    async fn save_results(
        &self,
        id: &Uuid,
        hosts: &Value,
        vulns: &Value,
        counters: ScanCounters,
    ) -> Result<(), ApiError>;
    async fn save_insights(&self, id: &Uuid, insights: &Value) -> Result<(), ApiError>;
    /// Move a scan into a terminal state. Returns None when the scan was
    /// already terminal; completed_at is set exactly once.
    async fn finalize(
        &self,
        id: &Uuid,
        status: ScanStatus,
        reason: Option<&str>,
    ) -> Result<Option<ScanRecord>, ApiError>;
    /// Most recent completed scan of the same type, for the insight diff.
    async fn latest_completed_of_type(
        &self,
        scan_type: ScanType,
        exclude: &Uuid,
    ) -> Result<Option<ScanRecord>, ApiError>;
    /// Finalize as error every scan a previous process run left in flight.
    async fn reconcile_interrupted(&self, reason: &str) -> Result<u64, ApiError>;
}

pub struct SqlxScanRepository {
    pool: PgPool,
}

impl SqlxScanRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ScanRepository for SqlxScanRepository {
    async fn create(
        &self,
        scan_type: ScanType,
        target_network: &str,
    ) -> Result<ScanRecord, ApiError> {
        let id = Uuid::new_v4();

        let row = sqlx::query_as::<_, ScanRecord>(
            r#"
            INSERT INTO scans (id, scan_type, status, target_network)
            VALUES ($1, $2, 'pending', $3)
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(scan_type.to_string())
        .bind(target_network)
        .fetch_one(&self.pool)
        .await?;

        Ok(row)
    }

    async fn get_by_id(&self, id: &Uuid) -> Result<Option<ScanRecord>, ApiError> {
        let row = sqlx::query_as::<_, ScanRecord>("SELECT * FROM scans WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row)
    }

    async fn list(&self, limit: i64, offset: i64) -> Result<Vec<ScanRecord>, ApiError> {
        let rows = sqlx::query_as::<_, ScanRecord>(
            "SELECT * FROM scans ORDER BY created_at DESC LIMIT $1 OFFSET $2",
        )
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    async fn list_active(&self) -> Result<Vec<ScanRecord>, ApiError> {
        let rows = sqlx::query_as::<_, ScanRecord>(&format!(
            "SELECT * FROM scans WHERE status NOT IN {} ORDER BY created_at DESC",
            TERMINAL_STATUSES
        ))
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    async fn count_active_heavy(&self) -> Result<i64, ApiError> {
        let count: i64 = sqlx::query_scalar(&format!(
            "SELECT COUNT(*) FROM scans WHERE status NOT IN {} AND scan_type <> 'discovery'",
            TERMINAL_STATUSES
        ))
        .fetch_one(&self.pool)
        .await?;

        Ok(count)
    }

    async fn update_progress(
        &self,
        id: &Uuid,
        status: ScanStatus,
        percent: f64,
    ) -> Result<(), ApiError> {
        sqlx::query(&format!(
            "UPDATE scans SET status = $2, percent = GREATEST(percent, $3) \
             WHERE id = $1 AND status NOT IN {}",
            TERMINAL_STATUSES
        ))
        .bind(id)
        .bind(status.to_string())
        .bind(percent.clamp(0.0, 100.0))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn set_process_id(&self, id: &Uuid, pid: Option<i64>) -> Result<(), ApiError> {
        sqlx::query("UPDATE scans SET process_id = $2 WHERE id = $1")
            .bind(id)
            .bind(pid)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn set_output_path(&self, id: &Uuid, path: &str) -> Result<(), ApiError> {
        sqlx::query("UPDATE scans SET raw_output_path = $2 WHERE id = $1")
            .bind(id)
            .bind(path)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn save_results(
        &self,
        id: &Uuid,
        hosts: &Value,
        vulns: &Value,
        counters: ScanCounters,
    ) -> Result<(), ApiError> {
        sqlx::query(
            r#"
            UPDATE scans
            SET hosts = $2, vulns = $3,
                total_hosts = $4, hosts_up = $5, total_ports = $6, open_ports = $7
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(hosts)
        .bind(vulns)
        .bind(counters.total_hosts)
        .bind(counters.hosts_up)
        .bind(counters.total_ports)
        .bind(counters.open_ports)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn save_insights(&self, id: &Uuid, insights: &Value) -> Result<(), ApiError> {
        sqlx::query("UPDATE scans SET insights = $2 WHERE id = $1")
            .bind(id)
            .bind(insights)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn finalize(
        &self,
        id: &Uuid,
        status: ScanStatus,
        reason: Option<&str>,
    ) -> Result<Option<ScanRecord>, ApiError> {
        if !status.is_terminal() {
            return Err(ApiError::internal(format!(
                "finalize called with non-terminal status {}",
                status
            )));
        }

        // Terminal closure is enforced here: an already-terminal row never
        // matches, so completed_at and status are written at most once.
        let row = sqlx::query_as::<_, ScanRecord>(&format!(
            r#"
            UPDATE scans
            SET status = $2,
                error_reason = $3,
                percent = CASE WHEN $2 = 'complete' THEN 100 ELSE percent END,
                completed_at = COALESCE(completed_at, now())
            WHERE id = $1 AND status NOT IN {}
            RETURNING *
            "#,
            TERMINAL_STATUSES
        ))
        .bind(id)
        .bind(status.to_string())
        .bind(reason)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row)
    }

    async fn latest_completed_of_type(
        &self,
        scan_type: ScanType,
        exclude: &Uuid,
    ) -> Result<Option<ScanRecord>, ApiError> {
        let row = sqlx::query_as::<_, ScanRecord>(
            r#"
            SELECT * FROM scans
            WHERE scan_type = $1 AND status = 'complete' AND id <> $2
            ORDER BY created_at DESC
            LIMIT 1
            "#,
        )
        .bind(scan_type.to_string())
        .bind(exclude)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row)
    }

    async fn reconcile_interrupted(&self, reason: &str) -> Result<u64, ApiError> {
        let result = sqlx::query(&format!(
            r#"
            UPDATE scans
            SET status = 'error', error_reason = $1,
                completed_at = COALESCE(completed_at, now()),
                process_id = NULL
            WHERE status NOT IN {}
            "#,
            TERMINAL_STATUSES
        ))
        .bind(reason)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }
}
