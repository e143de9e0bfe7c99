//! Instance records and the manager that owns them.

mod manager;

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use exile_id::InstanceId;
use exile_proto::{HistoryPoint, InstanceStatus, InstanceView, HISTORY_CAPACITY};

use crate::error::NodeError;
use crate::probe::ProcessProbe;
use crate::process::ProcessHandle;
use crate::state::InstanceRecord;

pub use manager::{InstanceManager, TemplateUpdate};

/// In-memory state of one instance. Guarded by the manager's lock, except
/// for `probe`, which has its own.
#[derive(Debug)]
pub(crate) struct Instance {
    pub id: InstanceId,
    pub port: u16,
    pub pid: Option<u32>,
    pub status: InstanceStatus,
    pub region: String,
    pub version: String,
    pub start_time: Option<DateTime<Utc>>,
    pub path: PathBuf,
    pub player_count: u32,
    pub max_players: u32,
    pub history: VecDeque<HistoryPoint>,
    pub process: Option<ProcessHandle>,
    pub probe: Arc<Mutex<ProcessProbe>>,
    /// Long-running file operation holding this instance outside the lock.
    pub pending: Option<&'static str>,
}

impl Instance {
    pub fn provisioning(id: InstanceId, port: u16, region: String, path: PathBuf) -> Self {
        Self {
            id,
            port,
            pid: None,
            status: InstanceStatus::Provisioning,
            region,
            version: String::new(),
            start_time: None,
            path,
            player_count: 0,
            max_players: 0,
            history: VecDeque::new(),
            process: None,
            probe: Arc::new(Mutex::new(ProcessProbe::new())),
            pending: None,
        }
    }

    pub fn from_record(record: InstanceRecord) -> Self {
        Self {
            id: record.id,
            port: record.port,
            pid: record.pid,
            status: record.status,
            region: record.region,
            version: record.version,
            start_time: record.start_time,
            path: record.path,
            player_count: record.player_count,
            max_players: record.max_players,
            history: VecDeque::new(),
            process: None,
            probe: Arc::new(Mutex::new(ProcessProbe::new())),
            pending: None,
        }
    }

    pub fn record(&self) -> InstanceRecord {
        InstanceRecord {
            id: self.id.clone(),
            port: self.port,
            pid: self.pid,
            status: self.status,
            region: self.region.clone(),
            version: self.version.clone(),
            start_time: self.start_time,
            path: self.path.clone(),
            player_count: self.player_count,
            max_players: self.max_players,
        }
    }

    pub fn view(&self) -> InstanceView {
        InstanceView {
            id: self.id.clone(),
            port: self.port,
            pid: self.pid.unwrap_or(0),
            status: self.status,
            region: self.region.clone(),
            version: self.version.clone(),
            start_time: self.start_time,
            path: self.path.to_string_lossy().into_owned(),
            player_count: self.player_count,
            max_players: self.max_players,
        }
    }

    pub fn generation(&self) -> Option<u64> {
        self.process.as_ref().map(|p| p.generation)
    }

    /// Appends a sample, evicting the oldest beyond [`HISTORY_CAPACITY`].
    pub fn push_history(&mut self, point: HistoryPoint) {
        self.history.push_back(point);
        while self.history.len() > HISTORY_CAPACITY {
            self.history.pop_front();
        }
    }

    /// Claims the instance for a file operation that runs outside the lock.
    pub fn claim(&mut self, op: &'static str) -> Result<(), NodeError> {
        if self.status.is_running() {
            return Err(NodeError::MustBeStopped {
                id: self.id.to_string(),
                op,
            });
        }
        self.ensure_idle()?;
        self.pending = Some(op);
        Ok(())
    }

    /// Fails if provisioning or another file operation is in flight.
    pub fn ensure_idle(&self) -> Result<(), NodeError> {
        if let Some(other) = self.pending {
            return Err(NodeError::Conflict(format!(
                "instance {} is busy with {other}",
                self.id
            )));
        }
        if self.status == InstanceStatus::Provisioning {
            return Err(NodeError::Conflict(format!(
                "instance {} is still provisioning",
                self.id
            )));
        }
        Ok(())
    }

    pub fn release(&mut self) {
        self.pending = None;
    }

    pub fn detach_probe(&self) {
        if let Ok(mut probe) = self.probe.lock() {
            probe.detach();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn instance() -> Instance {
        Instance::provisioning(
            InstanceId::derive("eu", 7777).unwrap(),
            7777,
            "eu".into(),
            PathBuf::from("/srv/instances/eu-7777"),
        )
    }

    fn point(i: u32) -> HistoryPoint {
        HistoryPoint {
            timestamp: Utc::now(),
            cpu: f64::from(i),
            memory_bytes: 0,
            memory_percent: 0.0,
            player_count: i,
        }
    }

    #[test]
    fn test_history_is_bounded_fifo() {
        let mut inst = instance();
        for i in 0..(HISTORY_CAPACITY as u32 + 10) {
            inst.push_history(point(i));
        }
        assert_eq!(inst.history.len(), HISTORY_CAPACITY);
        assert_eq!(inst.history.front().unwrap().player_count, 10);
        assert_eq!(
            inst.history.back().unwrap().player_count,
            HISTORY_CAPACITY as u32 + 9
        );
    }

    #[test]
    fn test_claim_rules() {
        let mut inst = instance();
        assert!(inst.claim("backup").is_err());

        inst.status = InstanceStatus::Stopped;
        inst.claim("backup").unwrap();
        let err = inst.claim("restore").unwrap_err();
        assert!(err.to_string().contains("busy with backup"));
        inst.release();

        inst.status = InstanceStatus::Running;
        assert!(matches!(
            inst.claim("backup"),
            Err(NodeError::MustBeStopped { op: "backup", .. })
        ));
    }

    #[test]
    fn test_view_reports_zero_pid_when_idle() {
        let inst = instance();
        let view = inst.view();
        assert_eq!(view.pid, 0);
        assert_eq!(view.status, InstanceStatus::Provisioning);
        assert_eq!(inst.record().id.as_str(), "eu-7777");
    }
}
