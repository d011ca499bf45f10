//! Exception classification and department routing
//!
//! Every check runs independently against one paired group, always in the same
//! order, so a single invoice can raise several exceptions at once.

use chrono::NaiveDate;
use serde::Serialize;

use crate::models::{
    Department, ExceptionType, InvoiceRecord, MatchStatus, PitRecord, PurchaseOrderRecord,
    ReceiptRecord, Severity,
};
use crate::uom::{convert_quantity, variance_pct, BASE_UNIT};

/// Quantity variance above this is `high` severity
pub const QUANTITY_HIGH_SEVERITY_PCT: f64 = 10.0;
/// Price variance above this is `high` severity
pub const PRICE_HIGH_SEVERITY_PCT: f64 = 15.0;
/// Impact score for exceptions without a variance percentage
pub const FALLBACK_IMPACT_SCORE: f64 = 10.0;
pub const MAX_IMPACT_SCORE: f64 = 100.0;
/// Confidence attached to every exception queue entry
pub const EXCEPTION_CONFIDENCE: f64 = 1.0;

/// Variance limits; comparisons are strict (`>`), a value equal to a limit passes
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Thresholds {
    pub quantity_variance_pct: f64,
    pub price_variance_pct: f64,
    pub delivery_window_days: i64,
}

/// The records an invoice was paired with (each at most one)
#[derive(Debug, Clone, Copy)]
pub struct PairedRecords<'a> {
    pub invoice: &'a InvoiceRecord,
    pub receipt: Option<&'a ReceiptRecord>,
    pub pit: Option<&'a PitRecord>,
    pub purchase_order: Option<&'a PurchaseOrderRecord>,
}

/// One discrepancy found on a paired group
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Finding {
    pub exception_type: ExceptionType,
    pub severity: Severity,
    pub explanation: String,
    pub variance_pct: Option<f64>,
}

impl Finding {
    /// Bounded [0, 100] priority proxy: the variance percentage, else a fixed 10
    pub fn impact_score(&self) -> f64 {
        self.variance_pct
            .filter(|v| v.is_finite())
            .unwrap_or(FALLBACK_IMPACT_SCORE)
            .clamp(0.0, MAX_IMPACT_SCORE)
    }

    pub fn department(&self) -> Department {
        department_for(self.exception_type)
    }

    pub fn ticket_title(&self) -> String {
        let label = match self.exception_type {
            ExceptionType::MissingReceipt => "Missing receipt",
            ExceptionType::MissingPo => "Missing purchase order",
            ExceptionType::QuantityVariance => "Quantity variance",
            ExceptionType::PriceVariance => "Price variance",
            ExceptionType::UomMismatch => "Unit of measure mismatch",
            ExceptionType::DateWindow => "Delivery outside date window",
            ExceptionType::InvoiceBeforeReceipt => "Invoice dated before receipt",
            ExceptionType::QualityHold => "Quality hold",
        };
        format!("{} ({} severity)", label, self.severity)
    }
}

/// Fixed routing table from exception type to department queue
pub fn department_for(exception_type: ExceptionType) -> Department {
    match exception_type {
        ExceptionType::PriceVariance | ExceptionType::MissingPo => Department::Procurement,
        ExceptionType::QualityHold
        | ExceptionType::DateWindow
        | ExceptionType::InvoiceBeforeReceipt => Department::Accounting,
        _ => Department::Warehouse,
    }
}

/// Values computed for a paired group plus every finding raised
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Evaluation {
    pub findings: Vec<Finding>,
    pub quantity_received: Option<f64>,
    pub quantity_billed: f64,
    pub unit_of_measure: String,
    pub po_unit_price: Option<f64>,
    pub invoice_unit_price: Option<f64>,
    pub delivery_date: Option<NaiveDate>,
    pub quantity_variance_pct: Option<f64>,
    pub price_variance_pct: Option<f64>,
    pub date_variance_days: Option<i64>,
}

impl Evaluation {
    pub fn status(&self) -> MatchStatus {
        if self.findings.is_empty() {
            MatchStatus::Matched
        } else {
            MatchStatus::Exception
        }
    }
}

/// Evaluate one paired group against the thresholds
pub fn evaluate(paired: &PairedRecords<'_>, thresholds: &Thresholds) -> Evaluation {
    let invoice = paired.invoice;
    let subject = format!("material {} lot {}", invoice.material_number, invoice.batch_lot);
    let mut findings = Vec::new();

    // missing_receipt
    if paired.receipt.is_none() && paired.pit.is_none() {
        findings.push(Finding {
            exception_type: ExceptionType::MissingReceipt,
            severity: Severity::High,
            explanation: format!("No receipt or pit record found for {}", subject),
            variance_pct: None,
        });
    }

    // missing_po
    if paired.purchase_order.is_none() {
        findings.push(Finding {
            exception_type: ExceptionType::MissingPo,
            severity: Severity::Medium,
            explanation: format!("No purchase order found for {}", subject),
            variance_pct: None,
        });
    }

    // quantity_variance / uom_mismatch, receipt preferred over pit
    let received = paired
        .receipt
        .map(|r| (r.quantity, r.unit_of_measure.as_str()))
        .or_else(|| paired.pit.map(|p| (p.quantity, p.unit_of_measure.as_str())));

    let mut quantity_received = received.map(|(qty, _)| qty);
    let mut quantity_billed = invoice.quantity;
    let mut unit_of_measure = invoice.unit_of_measure.clone();
    let mut quantity_variance = None;

    if let Some((received_qty, received_uom)) = received {
        let received_tons = convert_quantity(received_qty, received_uom, BASE_UNIT);
        let billed_tons = convert_quantity(invoice.quantity, &invoice.unit_of_measure, BASE_UNIT);

        match (received_tons, billed_tons) {
            (Some(received_tons), Some(billed_tons)) => {
                quantity_received = Some(received_tons);
                quantity_billed = billed_tons;
                unit_of_measure = BASE_UNIT.to_string();
                quantity_variance = variance_pct(received_tons, billed_tons);

                if let Some(pct) = quantity_variance {
                    if pct > thresholds.quantity_variance_pct {
                        let severity = if pct > QUANTITY_HIGH_SEVERITY_PCT {
                            Severity::High
                        } else {
                            Severity::Medium
                        };
                        findings.push(Finding {
                            exception_type: ExceptionType::QuantityVariance,
                            severity,
                            explanation: format!(
                                "Billed {:.2} {} vs received {:.2} {} for {} ({:.1}% variance exceeds {:.1}% threshold)",
                                billed_tons,
                                BASE_UNIT,
                                received_tons,
                                BASE_UNIT,
                                subject,
                                pct,
                                thresholds.quantity_variance_pct
                            ),
                            variance_pct: Some(pct),
                        });
                    }
                }
            }
            _ => {
                findings.push(Finding {
                    exception_type: ExceptionType::UomMismatch,
                    severity: Severity::Medium,
                    explanation: format!(
                        "Cannot compare received unit '{}' with billed unit '{}' for {}",
                        received_uom, invoice.unit_of_measure, subject
                    ),
                    variance_pct: None,
                });
            }
        }
    }

    // price_variance
    let po_unit_price = paired.purchase_order.and_then(|po| po.unit_price);
    let invoice_unit_price = invoice.unit_price;
    let mut price_variance = None;

    if let (Some(po_price), Some(invoice_price)) = (po_unit_price, invoice_unit_price) {
        price_variance = variance_pct(po_price, invoice_price);
        if let Some(pct) = price_variance {
            if pct > thresholds.price_variance_pct {
                let severity = if pct > PRICE_HIGH_SEVERITY_PCT {
                    Severity::High
                } else {
                    Severity::Medium
                };
                findings.push(Finding {
                    exception_type: ExceptionType::PriceVariance,
                    severity,
                    explanation: format!(
                        "Invoiced unit price {:.2} vs PO unit price {:.2} for {} ({:.1}% variance exceeds {:.1}% threshold)",
                        invoice_price, po_price, subject, pct, thresholds.price_variance_pct
                    ),
                    variance_pct: Some(pct),
                });
            }
        }
    }

    // date_window / invoice_before_receipt
    let receipt_date = paired.receipt.and_then(|r| r.receipt_date);
    let mut date_variance_days = None;

    if let (Some(received_on), Some(invoiced_on)) = (receipt_date, invoice.invoice_date) {
        let days = tms_common::time::whole_days_between(received_on, invoiced_on);
        date_variance_days = Some(days);

        if days > thresholds.delivery_window_days {
            findings.push(Finding {
                exception_type: ExceptionType::DateWindow,
                severity: Severity::Low,
                explanation: format!(
                    "Invoice dated {} is {} days from receipt on {} for {} (window {} days)",
                    invoiced_on, days, received_on, subject, thresholds.delivery_window_days
                ),
                variance_pct: None,
            });
        }

        if invoiced_on < received_on {
            findings.push(Finding {
                exception_type: ExceptionType::InvoiceBeforeReceipt,
                severity: Severity::Medium,
                explanation: format!(
                    "Invoice dated {} precedes receipt on {} for {}",
                    invoiced_on, received_on, subject
                ),
                variance_pct: None,
            });
        }
    }

    // quality_hold
    if let Some(receipt) = paired.receipt {
        if receipt.is_on_quality_hold() {
            let notes = receipt.quality_notes.as_deref().unwrap_or("").trim();
            findings.push(Finding {
                exception_type: ExceptionType::QualityHold,
                severity: Severity::High,
                explanation: if notes.is_empty() {
                    format!("Receipt {} is on quality hold for {}", receipt.id, subject)
                } else {
                    format!("Receipt {} is on quality hold for {}: {}", receipt.id, subject, notes)
                },
                variance_pct: None,
            });
        }
    }

    Evaluation {
        findings,
        quantity_received,
        quantity_billed,
        unit_of_measure,
        po_unit_price,
        invoice_unit_price,
        delivery_date: receipt_date.or_else(|| paired.pit.and_then(|p| p.production_date)),
        quantity_variance_pct: quantity_variance,
        price_variance_pct: price_variance,
        date_variance_days,
    }
}
