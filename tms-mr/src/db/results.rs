//! Matched records, exceptions, exception queue and workflow tickets
//!
//! One reconciled group is written in a single transaction: the matched record,
//! then for every finding one exception row, one exception queue entry and one
//! workflow ticket.

use sqlx::{Row, SqlitePool};
use tms_common::time::now_db_string;
use tms_common::{uuid_utils, Result};

use crate::classify::EXCEPTION_CONFIDENCE;
use crate::models::{Department, ExceptionType, ExceptionView, Severity};
use crate::reconcile::ReconciledGroup;

/// Workflow ticket `source_type` for tickets raised by the matching engine
pub const TICKET_SOURCE_TYPE: &str = "matched_record";

/// Persist one reconciled group; returns the matched record id
pub async fn persist_group(
    pool: &SqlitePool,
    organization_id: &str,
    run_id: &str,
    group: &ReconciledGroup,
) -> Result<String> {
    let matched_record_id = uuid_utils::generate_string();
    let created_at = now_db_string();
    let evaluation = &group.evaluation;

    let mut tx = pool.begin().await?;

    sqlx::query(
        r#"
        INSERT INTO matched_records (
            id, organization_id, run_id, material_number, batch_lot,
            pit_id, receipt_id, po_id, invoice_id,
            quantity_received, quantity_billed, unit_of_measure,
            po_unit_price, invoice_unit_price, delivery_date, status,
            quantity_variance_pct, price_variance_pct, date_variance_days, created_at
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&matched_record_id)
    .bind(organization_id)
    .bind(run_id)
    .bind(&group.material_number)
    .bind(&group.batch_lot)
    .bind(group.pit_id)
    .bind(group.receipt_id)
    .bind(group.po_id)
    .bind(group.invoice_id)
    .bind(evaluation.quantity_received)
    .bind(evaluation.quantity_billed)
    .bind(&evaluation.unit_of_measure)
    .bind(evaluation.po_unit_price)
    .bind(evaluation.invoice_unit_price)
    .bind(evaluation.delivery_date)
    .bind(group.status().as_str())
    .bind(evaluation.quantity_variance_pct)
    .bind(evaluation.price_variance_pct)
    .bind(evaluation.date_variance_days)
    .bind(&created_at)
    .execute(&mut *tx)
    .await?;

    for finding in &evaluation.findings {
        let exception_id = uuid_utils::generate_string();

        sqlx::query(
            r#"
            INSERT INTO matching_exceptions (
                id, organization_id, run_id, matched_record_id,
                exception_type, severity, explanation, created_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&exception_id)
        .bind(organization_id)
        .bind(run_id)
        .bind(&matched_record_id)
        .bind(finding.exception_type.as_str())
        .bind(finding.severity.as_str())
        .bind(&finding.explanation)
        .bind(&created_at)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            INSERT INTO exception_queue (
                id, organization_id, exception_id, exception_type, severity,
                impact_score, confidence, status, created_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, 'open', ?)
            "#,
        )
        .bind(uuid_utils::generate_string())
        .bind(organization_id)
        .bind(&exception_id)
        .bind(finding.exception_type.as_str())
        .bind(finding.severity.as_str())
        .bind(finding.impact_score())
        .bind(EXCEPTION_CONFIDENCE)
        .bind(&created_at)
        .execute(&mut *tx)
        .await?;

        let description = format!(
            "{}\n\nInvoice {} | receipt {} | pit {} | PO {}",
            finding.explanation,
            group.invoice_id,
            display_id(group.receipt_id),
            display_id(group.pit_id),
            display_id(group.po_id),
        );

        sqlx::query(
            r#"
            INSERT INTO workflow_tickets (
                id, organization_id, source_type, source_id, exception_id,
                department, title, description, status, created_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, 'open', ?)
            "#,
        )
        .bind(uuid_utils::generate_string())
        .bind(organization_id)
        .bind(TICKET_SOURCE_TYPE)
        .bind(&matched_record_id)
        .bind(&exception_id)
        .bind(finding.department().as_str())
        .bind(finding.ticket_title())
        .bind(&description)
        .bind(&created_at)
        .execute(&mut *tx)
        .await?;
    }

    tx.commit().await?;

    Ok(matched_record_id)
}

fn display_id(id: Option<i64>) -> String {
    id.map(|v| v.to_string()).unwrap_or_else(|| "none".to_string())
}

/// Exceptions of one run with their routing, highest impact first
pub async fn list_exceptions(pool: &SqlitePool, run_id: &str) -> Result<Vec<ExceptionView>> {
    let rows = sqlx::query(
        r#"
        SELECT e.id, e.matched_record_id, e.exception_type, e.severity, e.explanation,
               q.impact_score, t.department, t.id AS ticket_id
        FROM matching_exceptions e
        JOIN exception_queue q ON q.exception_id = e.id
        JOIN workflow_tickets t ON t.exception_id = e.id
        WHERE e.run_id = ?
        ORDER BY q.impact_score DESC, e.created_at, e.id
        "#,
    )
    .bind(run_id)
    .fetch_all(pool)
    .await?;

    rows.iter()
        .map(|row| {
            Ok(ExceptionView {
                id: row.try_get("id")?,
                matched_record_id: row.try_get("matched_record_id")?,
                exception_type: row.try_get::<String, _>("exception_type")?.parse::<ExceptionType>()?,
                severity: row.try_get::<String, _>("severity")?.parse::<Severity>()?,
                explanation: row.try_get("explanation")?,
                impact_score: row.try_get("impact_score")?,
                department: row.try_get::<String, _>("department")?.parse::<Department>()?,
                ticket_id: row.try_get("ticket_id")?,
            })
        })
        .collect()
}
