//! Source record loading
//!
//! The full backlog for an organization is read on every run, ordered by
//! storage id so pairing is deterministic.

use sqlx::SqlitePool;
use tms_common::Result;

use crate::models::{InvoiceRecord, PitRecord, PurchaseOrderRecord, ReceiptRecord};
use crate::reconcile::SourceSet;

pub async fn load_pit_records(pool: &SqlitePool, organization_id: &str) -> Result<Vec<PitRecord>> {
    let rows = sqlx::query_as::<_, PitRecord>(
        r#"
        SELECT id, material_number, batch_lot, quantity, unit_of_measure, production_date
        FROM pit_data
        WHERE organization_id = ?
        ORDER BY id
        "#,
    )
    .bind(organization_id)
    .fetch_all(pool)
    .await?;

    Ok(rows)
}

pub async fn load_receipts(pool: &SqlitePool, organization_id: &str) -> Result<Vec<ReceiptRecord>> {
    let rows = sqlx::query_as::<_, ReceiptRecord>(
        r#"
        SELECT id, material_number, batch_lot, quantity, unit_of_measure, receipt_date,
               quality_hold, quality_notes
        FROM material_receipts
        WHERE organization_id = ?
        ORDER BY id
        "#,
    )
    .bind(organization_id)
    .fetch_all(pool)
    .await?;

    Ok(rows)
}

pub async fn load_purchase_orders(
    pool: &SqlitePool,
    organization_id: &str,
) -> Result<Vec<PurchaseOrderRecord>> {
    let rows = sqlx::query_as::<_, PurchaseOrderRecord>(
        r#"
        SELECT id, po_number, material_number, batch_lot, quantity, unit_of_measure, unit_price
        FROM po_data
        WHERE organization_id = ?
        ORDER BY id
        "#,
    )
    .bind(organization_id)
    .fetch_all(pool)
    .await?;

    Ok(rows)
}

pub async fn load_invoices(pool: &SqlitePool, organization_id: &str) -> Result<Vec<InvoiceRecord>> {
    let rows = sqlx::query_as::<_, InvoiceRecord>(
        r#"
        SELECT id, invoice_number, material_number, batch_lot, quantity, unit_of_measure,
               unit_price, invoice_date
        FROM supplier_invoices
        WHERE organization_id = ?
        ORDER BY id
        "#,
    )
    .bind(organization_id)
    .fetch_all(pool)
    .await?;

    Ok(rows)
}

/// Load all four streams for one organization
pub async fn load_sources(pool: &SqlitePool, organization_id: &str) -> Result<SourceSet> {
    Ok(SourceSet {
        pit: load_pit_records(pool, organization_id).await?,
        receipts: load_receipts(pool, organization_id).await?,
        purchase_orders: load_purchase_orders(pool, organization_id).await?,
        invoices: load_invoices(pool, organization_id).await?,
    })
}
