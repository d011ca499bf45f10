//! Pairing of invoices with receipts, pit records and purchase orders
//!
//! Invoices drive the pass. For each invoice, in input order, at most one record
//! of each other kind is taken from that invoice's key queue. Records left in a
//! queue after the last invoice are not reconciled in this run; they are
//! reported in [`UnconsumedCounts`] and remain available to the next run.

use tracing::{debug, warn};

use crate::classify::{evaluate, Evaluation, PairedRecords, Thresholds};
use crate::grouping::{KeyedQueues, Keyed};
use crate::models::{
    InputCounts, InvoiceRecord, MatchStatus, PitRecord, PurchaseOrderRecord, ReceiptRecord,
    UnconsumedCounts,
};

/// All four source streams for one organization
#[derive(Debug, Clone, Default)]
pub struct SourceSet {
    pub pit: Vec<PitRecord>,
    pub receipts: Vec<ReceiptRecord>,
    pub purchase_orders: Vec<PurchaseOrderRecord>,
    pub invoices: Vec<InvoiceRecord>,
}

impl SourceSet {
    pub fn counts(&self) -> InputCounts {
        InputCounts {
            pit: self.pit.len(),
            receipts: self.receipts.len(),
            purchase_orders: self.purchase_orders.len(),
            invoices: self.invoices.len(),
        }
    }
}

/// One invoice with the ids it was paired with and its evaluation
#[derive(Debug, Clone, PartialEq)]
pub struct ReconciledGroup {
    pub group_key: String,
    pub material_number: String,
    pub batch_lot: String,
    pub invoice_id: i64,
    pub receipt_id: Option<i64>,
    pub pit_id: Option<i64>,
    pub po_id: Option<i64>,
    pub evaluation: Evaluation,
}

impl ReconciledGroup {
    pub fn status(&self) -> MatchStatus {
        self.evaluation.status()
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Reconciliation {
    pub groups: Vec<ReconciledGroup>,
    pub unconsumed: UnconsumedCounts,
}

impl Reconciliation {
    pub fn matched_count(&self) -> usize {
        self.groups
            .iter()
            .filter(|g| g.status() == MatchStatus::Matched)
            .count()
    }

    pub fn exception_count(&self) -> usize {
        self.groups.iter().map(|g| g.evaluation.findings.len()).sum()
    }
}

/// Pair and evaluate every invoice in `sources`
pub fn reconcile(sources: &SourceSet, thresholds: &Thresholds) -> Reconciliation {
    let mut receipts = KeyedQueues::build(sources.receipts.iter());
    let mut pits = KeyedQueues::build(sources.pit.iter());
    let mut purchase_orders = KeyedQueues::build(sources.purchase_orders.iter());

    let mut groups = Vec::with_capacity(sources.invoices.len());

    for invoice in &sources.invoices {
        let key = invoice.group_key();
        let receipt = receipts.take(&key);
        let pit = pits.take(&key);
        let purchase_order = purchase_orders.take(&key);

        let evaluation = evaluate(
            &PairedRecords {
                invoice,
                receipt,
                pit,
                purchase_order,
            },
            thresholds,
        );

        debug!(
            invoice_id = invoice.id,
            key = %key,
            findings = evaluation.findings.len(),
            "Invoice reconciled"
        );

        groups.push(ReconciledGroup {
            group_key: key,
            material_number: invoice.material_number.clone(),
            batch_lot: invoice.batch_lot.clone(),
            invoice_id: invoice.id,
            receipt_id: receipt.map(|r| r.id),
            pit_id: pit.map(|p| p.id),
            po_id: purchase_order.map(|po| po.id),
            evaluation,
        });
    }

    let mut keys = receipts.remaining_keys();
    keys.extend(pits.remaining_keys());
    keys.extend(purchase_orders.remaining_keys());
    keys.sort();
    keys.dedup();

    let unconsumed = UnconsumedCounts {
        pit: pits.remaining(),
        receipts: receipts.remaining(),
        purchase_orders: purchase_orders.remaining(),
        keys,
    };

    if unconsumed.total() > 0 {
        warn!(
            pit = unconsumed.pit,
            receipts = unconsumed.receipts,
            purchase_orders = unconsumed.purchase_orders,
            keys = ?unconsumed.keys,
            "Source records left unconsumed; carried forward to the next run"
        );
    }

    Reconciliation { groups, unconsumed }
}
