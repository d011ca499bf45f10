//! Incident integration
//!
//! Bridges incident lifecycle to payroll admission control. Every action taken
//! on behalf of an incident is written to `tms_incident_events`.

use sqlx::{sqlite::SqliteRow, Row, SqlitePool};
use tms_common::time::now_db_string;
use tms_common::{uuid_utils, Error, Result};
use tracing::{info, warn};

use crate::controller::PayrollController;
use crate::models::{Incident, IncidentEvent, IncidentSeverity, IncidentState, IncidentStatus};

const INCIDENT_COLUMNS: &str =
    "id, incident_type, severity, status, title, opened_at, resolved_at";

fn incident_from_row(row: &SqliteRow) -> Result<Incident> {
    Ok(Incident {
        id: row.try_get("id")?,
        incident_type: row.try_get("incident_type")?,
        severity: row.try_get::<String, _>("severity")?.parse::<IncidentSeverity>()?,
        status: row.try_get::<String, _>("status")?.parse::<IncidentState>()?,
        title: row.try_get("title")?,
        opened_at: row.try_get("opened_at")?,
        resolved_at: row.try_get("resolved_at")?,
    })
}

async fn open_incidents(pool: &SqlitePool) -> Result<Vec<Incident>> {
    let sql = format!(
        "SELECT {} FROM tms_incidents WHERE status = 'open' ORDER BY opened_at, id",
        INCIDENT_COLUMNS
    );
    let rows = sqlx::query(&sql).fetch_all(pool).await?;
    rows.iter().map(incident_from_row).collect()
}

pub async fn get_incident(pool: &SqlitePool, incident_id: &str) -> Result<Option<Incident>> {
    let sql = format!("SELECT {} FROM tms_incidents WHERE id = ?", INCIDENT_COLUMNS);
    let row = sqlx::query(&sql).bind(incident_id).fetch_optional(pool).await?;
    row.as_ref().map(incident_from_row).transpose()
}

pub async fn log_incident_event(
    pool: &SqlitePool,
    incident_id: &str,
    event_type: &str,
    message: &str,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO tms_incident_events (incident_id, event_type, message, created_at) VALUES (?, ?, ?, ?)",
    )
    .bind(incident_id)
    .bind(event_type)
    .bind(message)
    .bind(now_db_string())
    .execute(pool)
    .await?;

    Ok(())
}

/// Timeline of an incident, oldest first
pub async fn list_incident_events(pool: &SqlitePool, incident_id: &str) -> Result<Vec<IncidentEvent>> {
    let events = sqlx::query_as::<_, IncidentEvent>(
        "SELECT id, incident_id, event_type, message, created_at FROM tms_incident_events WHERE incident_id = ? ORDER BY id",
    )
    .bind(incident_id)
    .fetch_all(pool)
    .await?;

    Ok(events)
}

impl PayrollController {
    /// Whether open incidents require payroll to stay paused
    ///
    /// Any open critical incident does; so does an open warning of type
    /// `memory_exhaustion` or `disk_pressure`.
    pub async fn check_incident_status(&self) -> Result<IncidentStatus> {
        let blocking: Vec<Incident> = open_incidents(&self.db)
            .await?
            .into_iter()
            .filter(Incident::requires_pause)
            .collect();

        let reason = blocking.first().map(|incident| {
            format!(
                "{} incident {} ({}): {}",
                incident.severity, incident.id, incident.incident_type, incident.title
            )
        });

        Ok(IncidentStatus {
            must_pause: !blocking.is_empty(),
            reason,
            blocking_incident_ids: blocking.into_iter().map(|i| i.id).collect(),
        })
    }

    /// Pause payroll on behalf of an incident
    pub async fn pause_for_incident(&self, incident_id: &str) -> Result<()> {
        let incident = get_incident(&self.db, incident_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("Incident {}", incident_id)))?;

        let reason = format!("Incident {}: {}", incident.id, incident.title);
        self.pause_queue(&reason).await?;
        log_incident_event(&self.db, incident_id, "payroll_paused", &reason).await?;

        warn!(incident_id, severity = %incident.severity, "Payroll paused for incident");
        Ok(())
    }

    /// Resume payroll after an incident, unless another open incident still holds it
    ///
    /// Re-reads open incidents at call time: with two critical incidents open,
    /// resolving the first leaves payroll paused. Returns true when payroll was
    /// resumed.
    pub async fn resume_after_incident(&self, incident_id: &str) -> Result<bool> {
        let others: Vec<Incident> = open_incidents(&self.db)
            .await?
            .into_iter()
            .filter(|i| i.id != incident_id)
            .filter(|i| {
                matches!(
                    i.severity,
                    IncidentSeverity::Critical | IncidentSeverity::Warning
                )
            })
            .collect();

        if !others.is_empty() {
            let ids: Vec<&str> = others.iter().map(|i| i.id.as_str()).collect();
            let message = format!("Resume deferred; still open: {}", ids.join(", "));
            log_incident_event(&self.db, incident_id, "payroll_resume_deferred", &message).await?;
            info!(incident_id, still_open = ?ids, "Payroll stays paused");
            return Ok(false);
        }

        if !self.is_paused().await? {
            return Ok(false);
        }

        self.resume_queue().await?;
        log_incident_event(&self.db, incident_id, "payroll_resumed", "Payroll queue resumed").await?;
        info!(incident_id, "Payroll resumed after incident");
        Ok(true)
    }

    /// Record a new open incident; pauses payroll when the incident requires it
    pub async fn open_incident(
        &self,
        incident_type: &str,
        severity: IncidentSeverity,
        title: &str,
    ) -> Result<Incident> {
        if incident_type.trim().is_empty() || title.trim().is_empty() {
            return Err(Error::InvalidInput(
                "incident type and title must not be empty".to_string(),
            ));
        }

        let incident = Incident {
            id: uuid_utils::generate_string(),
            incident_type: incident_type.to_string(),
            severity,
            status: IncidentState::Open,
            title: title.to_string(),
            opened_at: now_db_string(),
            resolved_at: None,
        };

        sqlx::query(
            "INSERT INTO tms_incidents (id, incident_type, severity, status, title, opened_at) VALUES (?, ?, ?, 'open', ?, ?)",
        )
        .bind(&incident.id)
        .bind(&incident.incident_type)
        .bind(incident.severity.as_str())
        .bind(&incident.title)
        .bind(&incident.opened_at)
        .execute(&self.db)
        .await?;

        log_incident_event(&self.db, &incident.id, "opened", title).await?;
        warn!(
            incident_id = %incident.id,
            incident_type,
            severity = %severity,
            "Incident opened"
        );

        if incident.requires_pause() {
            self.pause_for_incident(&incident.id).await?;
        }

        Ok(incident)
    }

    /// Mark an incident resolved, then try to resume payroll
    ///
    /// Returns whether payroll was resumed.
    pub async fn resolve_incident(&self, incident_id: &str) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE tms_incidents SET status = 'resolved', resolved_at = ? WHERE id = ? AND status = 'open'",
        )
        .bind(now_db_string())
        .bind(incident_id)
        .execute(&self.db)
        .await?;

        if result.rows_affected() == 0 {
            return match get_incident(&self.db, incident_id).await? {
                Some(_) => Err(Error::Conflict(format!(
                    "Incident {} is already resolved",
                    incident_id
                ))),
                None => Err(Error::NotFound(format!("Incident {}", incident_id))),
            };
        }

        log_incident_event(&self.db, incident_id, "resolved", "Incident resolved").await?;
        info!(incident_id, "Incident resolved");

        self.resume_after_incident(incident_id).await
    }
}
