//! Per-instance process metrics.
//!
//! The probe is a re-acquirable back-reference to a PID. Losing it (the
//! process exited, or was never seen) is not an error; the next sample
//! simply attaches again.

use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System};

/// CPU and resident memory of one process.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ProcessSample {
    pub cpu_percent: f64,
    pub memory_bytes: u64,
}

#[derive(Debug)]
pub struct ProcessProbe {
    system: System,
    pid: Option<Pid>,
}

impl Default for ProcessProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessProbe {
    pub fn new() -> Self {
        Self {
            system: System::new(),
            pid: None,
        }
    }

    /// Attaches to `pid` and primes the CPU counter.
    pub fn attach(&mut self, pid: u32) {
        self.pid = Some(Pid::from_u32(pid));
        self.refresh();
    }

    pub fn detach(&mut self) {
        self.pid = None;
    }

    pub fn is_attached(&self) -> bool {
        self.pid.is_some()
    }

    /// Samples `pid`, re-attaching first if the cached handle was lost or
    /// points elsewhere.
    pub fn sample(&mut self, pid: u32) -> Option<ProcessSample> {
        if self.pid != Some(Pid::from_u32(pid)) {
            self.attach(pid);
        }
        self.refresh();
        let process = self.pid.and_then(|p| self.system.process(p));
        match process {
            Some(process) => Some(ProcessSample {
                cpu_percent: f64::from(process.cpu_usage()),
                memory_bytes: process.memory(),
            }),
            None => {
                self.pid = None;
                None
            }
        }
    }

    fn refresh(&mut self) {
        if let Some(pid) = self.pid {
            self.system.refresh_processes_specifics(
                ProcessesToUpdate::Some(&[pid]),
                true,
                ProcessRefreshKind::new().with_cpu().with_memory(),
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_samples_own_process() {
        let mut probe = ProcessProbe::new();
        let sample = probe.sample(std::process::id()).unwrap();
        assert!(sample.memory_bytes > 0);
        assert!(probe.is_attached());
    }

    #[test]
    fn test_missing_process_detaches() {
        let mut probe = ProcessProbe::new();
        assert!(probe.sample(u32::MAX - 1).is_none());
        assert!(!probe.is_attached());
    }
}
