//! Grouping of source records by material + lot
//!
//! Keys are case-insensitive and ignore surrounding whitespace, so
//! `"  Lime-20 "` and `"lime-20"` land in the same group.

use std::collections::{HashMap, VecDeque};

use crate::models::{InvoiceRecord, PitRecord, PurchaseOrderRecord, ReceiptRecord};

/// Canonical form of one key component
pub fn normalize(value: &str) -> String {
    value.trim().to_lowercase()
}

/// Grouping key: `normalize(material) + "|" + normalize(batch_lot)`
pub fn group_key(material_number: &str, batch_lot: &str) -> String {
    format!("{}|{}", normalize(material_number), normalize(batch_lot))
}

/// Anything carrying a material number and a batch/lot
pub trait Keyed {
    fn material_number(&self) -> &str;
    fn batch_lot(&self) -> &str;

    fn group_key(&self) -> String {
        group_key(self.material_number(), self.batch_lot())
    }
}

impl<T: Keyed + ?Sized> Keyed for &T {
    fn material_number(&self) -> &str {
        (**self).material_number()
    }

    fn batch_lot(&self) -> &str {
        (**self).batch_lot()
    }
}

macro_rules! impl_keyed {
    ($($ty:ty),+) => {
        $(
            impl Keyed for $ty {
                fn material_number(&self) -> &str {
                    &self.material_number
                }

                fn batch_lot(&self) -> &str {
                    &self.batch_lot
                }
            }
        )+
    };
}

impl_keyed!(PitRecord, ReceiptRecord, PurchaseOrderRecord, InvoiceRecord);

/// Per-key FIFO queues of not-yet-consumed records
///
/// Records keep their input order within a key; taking the last record of a key
/// removes the key.
#[derive(Debug)]
pub struct KeyedQueues<T> {
    queues: HashMap<String, VecDeque<T>>,
}

impl<T: Keyed> KeyedQueues<T> {
    pub fn build(records: impl IntoIterator<Item = T>) -> Self {
        let mut queues: HashMap<String, VecDeque<T>> = HashMap::new();
        for record in records {
            queues.entry(record.group_key()).or_default().push_back(record);
        }
        Self { queues }
    }

    /// Consume the oldest record for `key`
    pub fn take(&mut self, key: &str) -> Option<T> {
        let queue = self.queues.get_mut(key)?;
        let record = queue.pop_front();
        if queue.is_empty() {
            self.queues.remove(key);
        }
        record
    }

    /// Records left across all keys
    pub fn remaining(&self) -> usize {
        self.queues.values().map(VecDeque::len).sum()
    }

    /// Keys that still hold records, sorted
    pub fn remaining_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.queues.keys().cloned().collect();
        keys.sort();
        keys
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pit(id: i64, material: &str, lot: &str) -> PitRecord {
        PitRecord {
            id,
            material_number: material.to_string(),
            batch_lot: lot.to_string(),
            quantity: 1.0,
            unit_of_measure: "ton".to_string(),
            production_date: None,
        }
    }

    #[test]
    fn test_key_ignores_case_and_whitespace() {
        assert_eq!(group_key("  Lime-20 ", "L1"), group_key("lime-20", " l1"));
        assert_eq!(group_key("GRAVEL-A", "L100"), "gravel-a|l100");
    }

    #[test]
    fn test_key_keeps_components_separate() {
        assert_ne!(group_key("ab", "c"), group_key("a", "bc"));
    }

    #[test]
    fn test_take_is_fifo_and_drops_empty_keys() {
        let mut queues = KeyedQueues::build(vec![
            pit(1, "Lime-20", "A"),
            pit(2, "lime-20 ", "a"),
            pit(3, "sand", "b"),
        ]);
        let key = group_key("lime-20", "a");

        assert_eq!(queues.remaining(), 3);
        assert_eq!(queues.take(&key).map(|p| p.id), Some(1));
        assert_eq!(queues.take(&key).map(|p| p.id), Some(2));
        assert_eq!(queues.take(&key), None);
        assert_eq!(queues.remaining_keys(), vec!["sand|b".to_string()]);
    }

    #[test]
    fn test_build_over_references() {
        let records = vec![pit(7, "X", "Y")];
        let mut queues = KeyedQueues::build(records.iter());
        assert_eq!(queues.take("x|y").map(|p| p.id), Some(7));
    }
}
