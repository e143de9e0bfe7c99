//! Host resource metrics reported in heartbeats.

use std::path::Path;

use sysinfo::{Disks, System};

/// Snapshot of host usage.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct HostMetrics {
    pub cpu_usage: f64,
    pub mem_used: u64,
    pub mem_total: u64,
    pub disk_used: u64,
    pub disk_total: u64,
}

/// Keeps sysinfo state between samples so CPU usage has a baseline.
pub struct HostSampler {
    system: System,
    disks: Disks,
}

impl Default for HostSampler {
    fn default() -> Self {
        Self::new()
    }
}

impl HostSampler {
    pub fn new() -> Self {
        let mut system = System::new();
        system.refresh_cpu_usage();
        system.refresh_memory();
        Self {
            system,
            disks: Disks::new_with_refreshed_list(),
        }
    }

    /// Samples CPU, memory and the disk holding `path`.
    pub fn sample(&mut self, path: &Path) -> HostMetrics {
        self.system.refresh_cpu_usage();
        self.system.refresh_memory();
        self.disks.refresh_list();

        let (disk_used, disk_total) = self.disk_for(path);
        HostMetrics {
            cpu_usage: f64::from(self.system.global_cpu_usage()),
            mem_used: self.system.used_memory(),
            mem_total: self.system.total_memory(),
            disk_used,
            disk_total,
        }
    }

    pub fn total_memory(&mut self) -> u64 {
        self.system.refresh_memory();
        self.system.total_memory()
    }

    /// Usage of the disk with the longest mount point containing `path`.
    fn disk_for(&self, path: &Path) -> (u64, u64) {
        let path = std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());
        self.disks
            .list()
            .iter()
            .filter(|d| path.starts_with(d.mount_point()))
            .max_by_key(|d| d.mount_point().as_os_str().len())
            .map(|d| {
                let total = d.total_space();
                (total.saturating_sub(d.available_space()), total)
            })
            .unwrap_or_default()
    }
}
