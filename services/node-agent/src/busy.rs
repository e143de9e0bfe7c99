//! Manager-wide exclusion while the shared game template is rewritten.

use std::sync::atomic::{AtomicBool, Ordering};

use crate::error::NodeError;

/// Operations gated by the busy flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Spawn,
    Start,
    Stop,
    Restart,
    Remove,
    Rename,
    Update,
    Backup,
    Restore,
    DeleteBackup,
    ListInstances,
    Stats,
    History,
    ListBackups,
    Logs,
}

impl Operation {
    /// Whether the operation must be refused while a template update runs.
    pub fn excluded_while_busy(self) -> bool {
        match self {
            Operation::Spawn
            | Operation::Start
            | Operation::Stop
            | Operation::Restart
            | Operation::Remove
            | Operation::Rename
            | Operation::Update
            | Operation::Backup
            | Operation::Restore
            | Operation::DeleteBackup => true,
            Operation::ListInstances
            | Operation::Stats
            | Operation::History
            | Operation::ListBackups
            | Operation::Logs => false,
        }
    }
}

/// Atomic busy token. Set only by a template update.
#[derive(Debug, Default)]
pub struct BusyFlag(AtomicBool);

impl BusyFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_busy(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    /// Fails with `InstanceBusyGlobal` when `op` is excluded and the flag is set.
    pub fn check(&self, op: Operation) -> Result<(), NodeError> {
        if op.excluded_while_busy() && self.is_busy() {
            return Err(NodeError::InstanceBusyGlobal);
        }
        Ok(())
    }

    /// Sets the flag, or returns `None` if it was already set.
    pub fn try_acquire(&self) -> Option<BusyGuard<'_>> {
        self.0
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| BusyGuard { flag: self })
    }
}

/// Clears the flag on drop.
#[derive(Debug)]
pub struct BusyGuard<'a> {
    flag: &'a BusyFlag,
}

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.flag.0.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(Operation::Spawn, true)]
    #[case(Operation::Start, true)]
    #[case(Operation::Stop, true)]
    #[case(Operation::Remove, true)]
    #[case(Operation::Rename, true)]
    #[case(Operation::Backup, true)]
    #[case(Operation::Restore, true)]
    #[case(Operation::ListInstances, false)]
    #[case(Operation::Stats, false)]
    #[case(Operation::History, false)]
    #[case(Operation::Logs, false)]
    fn test_exclusion_table(#[case] op: Operation, #[case] excluded: bool) {
        let flag = BusyFlag::new();
        let _guard = flag.try_acquire().unwrap();
        assert_eq!(flag.check(op).is_err(), excluded);
    }

    #[test]
    fn test_guard_is_exclusive_and_released_on_drop() {
        let flag = BusyFlag::new();
        let guard = flag.try_acquire();
        assert!(guard.is_some());
        assert!(flag.try_acquire().is_none());
        drop(guard);
        assert!(!flag.is_busy());
        assert!(flag.check(Operation::Spawn).is_ok());
    }
}
