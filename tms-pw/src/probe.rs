//! Host resource readings for the system health gate

use sysinfo::{Disks, System};

/// Memory and disk usage, in percent of capacity
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResourceUsage {
    pub memory_pct: f64,
    pub disk_pct: f64,
}

pub trait ResourceProbe: Send + Sync {
    fn sample(&self) -> ResourceUsage;
}

/// Reads the host through `sysinfo`
///
/// Disk usage aggregates every mounted disk: `(total - available) / total`.
/// A host reporting zero capacity reads as 0%.
#[derive(Debug, Default)]
pub struct SystemProbe;

impl ResourceProbe for SystemProbe {
    fn sample(&self) -> ResourceUsage {
        let mut sys = System::new();
        sys.refresh_memory();
        let memory_pct = percent(sys.used_memory(), sys.total_memory());

        let disks = Disks::new_with_refreshed_list();
        let (total, available) = disks.list().iter().fold((0u64, 0u64), |(t, a), disk| {
            (
                t.saturating_add(disk.total_space()),
                a.saturating_add(disk.available_space()),
            )
        });
        let disk_pct = percent(total.saturating_sub(available), total);

        ResourceUsage {
            memory_pct,
            disk_pct,
        }
    }
}

fn percent(used: u64, total: u64) -> f64 {
    if total == 0 {
        return 0.0;
    }
    used as f64 / total as f64 * 100.0
}

/// Constant readings
#[derive(Debug, Clone, Copy)]
pub struct FixedProbe(pub ResourceUsage);

impl FixedProbe {
    pub fn new(memory_pct: f64, disk_pct: f64) -> Self {
        Self(ResourceUsage {
            memory_pct,
            disk_pct,
        })
    }

    pub fn idle() -> Self {
        Self::new(0.0, 0.0)
    }
}

impl ResourceProbe for FixedProbe {
    fn sample(&self) -> ResourceUsage {
        self.0
    }
}
