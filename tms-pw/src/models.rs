//! Payroll job, lock and incident models

use serde::{Deserialize, Serialize};
use tms_common::string_enum;

/// Payroll job lifecycle
///
/// `queued → running → completed`, `running → queued` on a retryable failure,
/// `running → failed` once retries are exhausted. Any active job may be moved
/// to `paused` and back to `queued`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Running,
    Completed,
    Failed,
    Paused,
}

string_enum!(JobStatus {
    Queued => "queued",
    Running => "running",
    Completed => "completed",
    Failed => "failed",
    Paused => "paused",
});

impl JobStatus {
    /// Statuses that count toward the one-active-job-per-organization rule
    pub const ACTIVE: [JobStatus; 3] = [JobStatus::Queued, JobStatus::Running, JobStatus::Paused];

    pub fn is_active(&self) -> bool {
        Self::ACTIVE.contains(self)
    }
}

/// Resume cursor stored as JSON in `payroll_jobs.checkpoint_data`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Highest ticket id fully processed; the next batch starts after it
    pub last_processed_ticket_id: i64,
    pub processed_count: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PayrollJob {
    pub id: String,
    pub organization_id: String,
    pub pay_period_start: Option<String>,
    pub pay_period_end: Option<String>,
    pub status: JobStatus,
    pub priority: i64,
    pub requested_at: String,
    pub started_at: Option<String>,
    pub completed_at: Option<String>,
    pub progress_percent: f64,
    pub checkpoint: Option<Checkpoint>,
    pub retry_count: i64,
    pub max_retries: i64,
    pub failure_reason: Option<String>,
    /// Earliest time a requeued job may be picked up again
    pub not_before: Option<String>,
    pub updated_at: String,
}

/// Parameters for a new payroll job
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobRequest {
    pub organization_id: String,
    pub priority: i64,
    /// Falls back to the `payroll_default_max_retries` setting
    pub max_retries: Option<i64>,
    pub pay_period_start: Option<chrono::NaiveDate>,
    pub pay_period_end: Option<chrono::NaiveDate>,
}

impl JobRequest {
    pub fn new(organization_id: impl Into<String>) -> Self {
        Self {
            organization_id: organization_id.into(),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct JobEvent {
    pub id: i64,
    pub job_id: String,
    pub event_type: String,
    pub message: Option<String>,
    pub created_at: String,
}

/// Answer of `can_queue_job`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueueDecision {
    pub allowed: bool,
    pub reason: Option<String>,
}

/// Answer of `acquire_slot`; a refusal is a normal "try next tick" signal
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SlotAcquisition {
    pub acquired: bool,
    pub reason: Option<String>,
}

/// What one orphan recovery pass changed
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RecoveryReport {
    /// Stale running jobs put back in the queue
    pub requeued: Vec<String>,
    /// Slots taken back because no running job held them
    pub slots_reclaimed: i64,
}

impl RecoveryReport {
    pub fn is_empty(&self) -> bool {
        self.requeued.is_empty() && self.slots_reclaimed == 0
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthStatus {
    pub healthy: bool,
    pub reason: Option<String>,
}

impl HealthStatus {
    pub fn healthy() -> Self {
        Self {
            healthy: true,
            reason: None,
        }
    }

    pub fn unhealthy(reason: impl Into<String>) -> Self {
        Self {
            healthy: false,
            reason: Some(reason.into()),
        }
    }
}

/// Observability snapshot of the payroll queue
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueueStatus {
    /// Slots currently held (`payroll_global_lock.running_count`)
    pub running: i64,
    pub queued: i64,
    pub paused: i64,
    pub max_concurrent: i64,
    pub is_paused: bool,
    pub pause_reason: Option<String>,
}

/// Snapshot of the singleton `payroll_global_lock` row
#[derive(Debug, Clone, PartialEq, Eq, Serialize, sqlx::FromRow)]
pub struct GlobalLock {
    pub is_paused: bool,
    pub pause_reason: Option<String>,
    pub max_concurrent_jobs: i64,
    pub running_count: i64,
}

pub const INCIDENT_MEMORY_EXHAUSTION: &str = "memory_exhaustion";
pub const INCIDENT_DISK_PRESSURE: &str = "disk_pressure";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IncidentSeverity {
    Info,
    Warning,
    Critical,
}

string_enum!(IncidentSeverity {
    Info => "info",
    Warning => "warning",
    Critical => "critical",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IncidentState {
    Open,
    Resolved,
}

string_enum!(IncidentState {
    Open => "open",
    Resolved => "resolved",
});

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Incident {
    pub id: String,
    pub incident_type: String,
    pub severity: IncidentSeverity,
    pub status: IncidentState,
    pub title: String,
    pub opened_at: String,
    pub resolved_at: Option<String>,
}

impl Incident {
    /// Open critical incidents, and open warnings about memory or disk, hold payroll
    pub fn requires_pause(&self) -> bool {
        if self.status != IncidentState::Open {
            return false;
        }
        match self.severity {
            IncidentSeverity::Critical => true,
            IncidentSeverity::Warning => {
                self.incident_type == INCIDENT_MEMORY_EXHAUSTION
                    || self.incident_type == INCIDENT_DISK_PRESSURE
            }
            IncidentSeverity::Info => false,
        }
    }
}

/// Answer of `check_incident_status`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IncidentStatus {
    pub must_pause: bool,
    pub reason: Option<String>,
    pub blocking_incident_ids: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct IncidentEvent {
    pub id: i64,
    pub incident_id: String,
    pub event_type: String,
    pub message: Option<String>,
    pub created_at: String,
}

/// Payroll input row from `tickets`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Ticket {
    pub id: i64,
    pub organization_id: String,
    pub driver_id: String,
    pub quantity: f64,
    pub pay_rate: f64,
}

impl Ticket {
    pub fn amount(&self) -> f64 {
        self.quantity * self.pay_rate
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn incident(severity: IncidentSeverity, incident_type: &str) -> Incident {
        Incident {
            id: "inc-1".to_string(),
            incident_type: incident_type.to_string(),
            severity,
            status: IncidentState::Open,
            title: "test".to_string(),
            opened_at: "2024-01-01T00:00:00.000000Z".to_string(),
            resolved_at: None,
        }
    }

    #[test]
    fn test_requires_pause() {
        assert!(incident(IncidentSeverity::Critical, "api_outage").requires_pause());
        assert!(incident(IncidentSeverity::Warning, INCIDENT_MEMORY_EXHAUSTION).requires_pause());
        assert!(incident(IncidentSeverity::Warning, INCIDENT_DISK_PRESSURE).requires_pause());
        assert!(!incident(IncidentSeverity::Warning, "api_latency").requires_pause());
        assert!(!incident(IncidentSeverity::Info, INCIDENT_MEMORY_EXHAUSTION).requires_pause());

        let mut resolved = incident(IncidentSeverity::Critical, "api_outage");
        resolved.status = IncidentState::Resolved;
        assert!(!resolved.requires_pause());
    }

    #[test]
    fn test_job_status_text() {
        assert_eq!("paused".parse::<JobStatus>().unwrap(), JobStatus::Paused);
        assert!("cancelled".parse::<JobStatus>().is_err());
        assert!(JobStatus::Paused.is_active());
        assert!(!JobStatus::Failed.is_active());
    }

    #[test]
    fn test_checkpoint_json_shape() {
        let json = serde_json::to_value(Checkpoint {
            last_processed_ticket_id: 150,
            processed_count: 150,
        })
        .unwrap();
        assert_eq!(json["last_processed_ticket_id"], 150);
        assert_eq!(json["processed_count"], 150);
    }
}
