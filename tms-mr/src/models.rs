//! Reconciliation data model
//!
//! Source records are read-only inputs loaded per organization. Everything the
//! engine writes (runs, matched records, exceptions, tickets) is described by the
//! output types further down.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use tms_common::string_enum;

/// Site production (pit) record
#[derive(Debug, Clone, PartialEq, Serialize, sqlx::FromRow)]
pub struct PitRecord {
    pub id: i64,
    pub material_number: String,
    pub batch_lot: String,
    pub quantity: f64,
    pub unit_of_measure: String,
    pub production_date: Option<NaiveDate>,
}

/// Material receipt recorded at the scale house / yard
#[derive(Debug, Clone, PartialEq, Serialize, sqlx::FromRow)]
pub struct ReceiptRecord {
    pub id: i64,
    pub material_number: String,
    pub batch_lot: String,
    pub quantity: f64,
    pub unit_of_measure: String,
    pub receipt_date: Option<NaiveDate>,
    pub quality_hold: bool,
    pub quality_notes: Option<String>,
}

impl ReceiptRecord {
    /// Held by QA, either flagged outright or carrying inspection notes
    pub fn is_on_quality_hold(&self) -> bool {
        self.quality_hold
            || self
                .quality_notes
                .as_deref()
                .map(|n| !n.trim().is_empty())
                .unwrap_or(false)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, sqlx::FromRow)]
pub struct PurchaseOrderRecord {
    pub id: i64,
    pub po_number: Option<String>,
    pub material_number: String,
    pub batch_lot: String,
    pub quantity: f64,
    pub unit_of_measure: String,
    pub unit_price: Option<f64>,
}

/// Supplier invoice line; the driving stream of a matching run
#[derive(Debug, Clone, PartialEq, Serialize, sqlx::FromRow)]
pub struct InvoiceRecord {
    pub id: i64,
    pub invoice_number: Option<String>,
    pub material_number: String,
    pub batch_lot: String,
    pub quantity: f64,
    pub unit_of_measure: String,
    pub unit_price: Option<f64>,
    pub invoice_date: Option<NaiveDate>,
}

/// Discrepancy kinds, in evaluation order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExceptionType {
    MissingReceipt,
    MissingPo,
    QuantityVariance,
    PriceVariance,
    UomMismatch,
    DateWindow,
    InvoiceBeforeReceipt,
    QualityHold,
}

string_enum!(ExceptionType {
    MissingReceipt => "missing_receipt",
    MissingPo => "missing_po",
    QuantityVariance => "quantity_variance",
    PriceVariance => "price_variance",
    UomMismatch => "uom_mismatch",
    DateWindow => "date_window",
    InvoiceBeforeReceipt => "invoice_before_receipt",
    QualityHold => "quality_hold",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
}

string_enum!(Severity {
    Low => "low",
    Medium => "medium",
    High => "high",
});

/// Department queue a workflow ticket is routed to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Department {
    Procurement,
    Accounting,
    Warehouse,
}

string_enum!(Department {
    Procurement => "procurement",
    Accounting => "accounting",
    Warehouse => "warehouse",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchStatus {
    Matched,
    Exception,
}

string_enum!(MatchStatus {
    Matched => "matched",
    Exception => "exception",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Running,
    Completed,
}

string_enum!(RunStatus {
    Running => "running",
    Completed => "completed",
});

/// Number of rows loaded from each source for one run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputCounts {
    pub pit: usize,
    pub receipts: usize,
    pub purchase_orders: usize,
    pub invoices: usize,
}

/// Same-key records no invoice consumed during a run
///
/// They stay in storage untouched and are offered again to the next run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnconsumedCounts {
    pub pit: usize,
    pub receipts: usize,
    pub purchase_orders: usize,
    /// Group keys that still hold records after the last invoice
    pub keys: Vec<String>,
}

impl UnconsumedCounts {
    pub fn total(&self) -> usize {
        self.pit + self.receipts + self.purchase_orders
    }
}

/// Result of a completed matching run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchingSummary {
    pub run_id: String,
    pub organization_id: String,
    pub input_counts: InputCounts,
    /// Matched records with no exception
    pub matched_count: usize,
    /// Exception rows written (one record can carry several)
    pub exception_count: usize,
    pub unconsumed: UnconsumedCounts,
}

/// Stored matching run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchingRun {
    pub id: String,
    pub organization_id: String,
    pub status: RunStatus,
    pub input_counts: InputCounts,
    pub matched_count: i64,
    pub exception_count: i64,
    pub unconsumed_count: i64,
    pub started_at: String,
    pub completed_at: Option<String>,
}

/// Stored exception with its routed ticket
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExceptionView {
    pub id: String,
    pub matched_record_id: String,
    pub exception_type: ExceptionType,
    pub severity: Severity,
    pub explanation: String,
    pub impact_score: f64,
    pub department: Department,
    pub ticket_id: String,
}
