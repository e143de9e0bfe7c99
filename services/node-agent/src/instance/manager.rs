//! Instance manager.
//!
//! One `RwLock` guards the instance table. Process launch runs with the
//! write lock held so the launch and the `Running` transition are atomic;
//! file copies, archive work and disk walks run with the lock released and
//! the instance claimed through `Instance::pending`. Each instance's metrics
//! probe has its own mutex, so stats sampling never waits on lifecycle work.
//!
//! The shared template directory has a lock of its own: provisioning copies
//! read it, template refreshes write it.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use exile_id::InstanceId;
use exile_proto::{BackupEntry, HistoryPoint, InstanceStats, InstanceStatus, InstanceView};
use tokio::process::Child;
use tokio::sync::{oneshot, watch, RwLock};
use tracing::{debug, error, info, warn};

use super::Instance;
use crate::busy::{BusyFlag, Operation};
use crate::config::{Config, SharedSettings};
use crate::error::{ErrorKind, NodeError, RemoveOutcome};
use crate::files::{self, BACKUPS_DIR, GAME_LOG_FILE};
use crate::firewall::Firewall;
use crate::process::{self, ProcessHandle};
use crate::resources::HostSampler;
use crate::state::SnapshotStore;
use crate::template::TemplateSource;
use crate::{archive, logs, ports};

const STOP_POLL_INTERVAL: Duration = Duration::from_millis(100);

type InstanceMap = HashMap<InstanceId, Instance>;

/// Result of a template update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TemplateUpdate {
    pub previous: String,
    pub version: String,
}

impl TemplateUpdate {
    pub fn changed(&self) -> bool {
        self.previous != self.version
    }
}

pub struct InstanceManager {
    config: Config,
    settings: SharedSettings,
    instances: RwLock<InstanceMap>,
    busy: BusyFlag,
    template_lock: RwLock<()>,
    template: Arc<dyn TemplateSource>,
    firewall: Arc<dyn Firewall>,
    store: Arc<dyn SnapshotStore>,
    generation: AtomicU64,
    shutting_down: AtomicBool,
}

impl InstanceManager {
    pub fn new(
        config: Config,
        settings: SharedSettings,
        store: Arc<dyn SnapshotStore>,
        firewall: Arc<dyn Firewall>,
        template: Arc<dyn TemplateSource>,
    ) -> Self {
        Self {
            config,
            settings,
            instances: RwLock::new(HashMap::new()),
            busy: BusyFlag::new(),
            template_lock: RwLock::new(()),
            template,
            firewall,
            store,
            generation: AtomicU64::new(0),
            shutting_down: AtomicBool::new(false),
        }
    }

    /// True while a template update is in progress.
    pub fn is_busy(&self) -> bool {
        self.busy.is_busy()
    }

    pub fn game_install_dir(&self) -> &Path {
        &self.config.game_install_dir
    }

    pub async fn instance_count(&self) -> usize {
        self.instances.read().await.len()
    }

    /// All instances, ordered by port.
    pub async fn list_instances(&self) -> Vec<InstanceView> {
        let instances = self.instances.read().await;
        let mut views: Vec<_> = instances.values().map(Instance::view).collect();
        views.sort_by_key(|v| v.port);
        views
    }

    pub async fn get_instance(&self, id: &str) -> Option<InstanceView> {
        self.instances.read().await.get(id).map(Instance::view)
    }

    /// Reserves a port, records a `Provisioning` instance and provisions it
    /// in the background.
    pub async fn spawn(self: &Arc<Self>) -> Result<InstanceView, NodeError> {
        let mut instances = self.instances.write().await;
        self.busy.check(Operation::Spawn)?;

        let (region, max_instances) = {
            let settings = self.settings.read().await;
            (settings.region.clone(), settings.max_instances)
        };
        let reserved: HashSet<u16> = instances.values().map(|i| i.port).collect();
        let port = ports::allocate(
            self.config.starting_port,
            max_instances,
            &reserved,
            ports::os_probe,
        )?;
        let id = InstanceId::derive(&region, port)?;
        let path = self.config.instances_dir.join(id.as_str());

        let instance = Instance::provisioning(id.clone(), port, region, path);
        let view = instance.view();
        instances.insert(id.clone(), instance);
        if let Err(e) = self.persist(&instances) {
            instances.remove(&id);
            return Err(e);
        }
        drop(instances);

        info!(instance_id = %id, port, "Starting async provisioning for new instance");
        tokio::spawn(Arc::clone(self).provision(id));
        Ok(view)
    }

    async fn provision(self: Arc<Self>, id: InstanceId) {
        if let Err(e) = self.try_provision(&id).await {
            error!(instance_id = %id, kind = ?e.kind(), error = %e, "Provisioning failed");
            self.mark_error(id.as_str()).await;
        }
    }

    async fn try_provision(self: &Arc<Self>, id: &InstanceId) -> Result<(), NodeError> {
        let path = self.instance_path(id.as_str()).await?;
        let instances_dir = &self.config.instances_dir;
        tokio::fs::create_dir_all(instances_dir)
            .await
            .map_err(|e| NodeError::file("create_instances_dir", instances_dir, e))?;

        {
            let _template = self.template_lock.read().await;
            let src = self.config.game_install_dir.clone();
            let dst = path.clone();
            info!(
                instance_id = %id,
                source = %src.display(),
                dir = %dst.display(),
                "Copying game files"
            );
            tokio::task::spawn_blocking(move || files::copy_dir(&src, &dst))
                .await?
                .map_err(|e| NodeError::file("copy_game_files", &path, e))?;
        }
        let version = files::read_version(&path);

        let mut instances = self.instances.write().await;
        let Some(instance) = instances.get_mut(id) else {
            warn!(instance_id = %id, "Instance disappeared during provisioning");
            return Ok(());
        };
        if !version.is_empty() {
            info!(instance_id = %id, version = %version, "Game version detected");
        }
        instance.version = version;
        let port = instance.port;
        self.start_process(instance).await?;

        info!(instance_id = %id, port, path = %path.display(), "Instance provisioning complete and started");
        self.persist(&instances)
    }

    /// Launches the game server for `instance`. The caller holds the write
    /// lock; `instance` is borrowed from the guarded table.
    async fn start_process(self: &Arc<Self>, instance: &mut Instance) -> Result<(), NodeError> {
        let binary = std::path::absolute(instance.path.join(&self.config.game_binary_path))
            .map_err(|e| NodeError::file("resolve_binary_path", &instance.path, e))?;

        process::ensure_executable(&binary).map_err(|source| {
            if source.kind() == std::io::ErrorKind::NotFound {
                NodeError::file("resolve_binary_path", &binary, source)
            } else {
                NodeError::Permission {
                    op: "make_binary_executable",
                    path: binary.clone(),
                    source,
                }
            }
        })?;

        let log_path = instance.path.join(GAME_LOG_FILE);
        let log = process::open_log(&log_path)
            .map_err(|e| NodeError::file("open_log_file", &log_path, e))?;

        self.open_firewall(instance.port).await;

        let url = process::callback_url(&self.config.host, self.config.port, instance.id.as_str());
        let args = process::game_args(instance.port, &url);
        let child = match process::launch(&binary, &args, &instance.path, log) {
            Ok(child) => child,
            Err(source) => {
                self.close_firewall(instance.port).await;
                error!(
                    instance_id = %instance.id,
                    binary = %binary.display(),
                    port = instance.port,
                    error = %source,
                    "Failed to start process"
                );
                return Err(NodeError::ProcessStart {
                    op: "start_game_binary",
                    source,
                });
            }
        };

        let pid = child.id().unwrap_or_default();
        let generation = self.generation.fetch_add(1, Ordering::Relaxed) + 1;
        let (handle, kill_rx) = ProcessHandle::new(generation);

        instance.process = Some(handle);
        instance.pid = Some(pid);
        instance.status = InstanceStatus::Running;
        instance.start_time = Some(Utc::now());
        if let Ok(mut probe) = instance.probe.lock() {
            probe.attach(pid);
        }

        info!(instance_id = %instance.id, pid, port = instance.port, "Game server started");
        tokio::spawn(Arc::clone(self).monitor(generation, child, kill_rx));
        Ok(())
    }

    /// Waits for one launch to exit and records the transition, unless a
    /// later launch has replaced it.
    async fn monitor(self: Arc<Self>, generation: u64, child: Child, kill: oneshot::Receiver<()>) {
        let exit = process::wait_for_exit(child, kill).await;

        let mut instances = self.instances.write().await;
        let Some(instance) = instances
            .values_mut()
            .find(|i| i.generation() == Some(generation))
        else {
            debug!(generation, "Exited process is no longer tracked");
            return;
        };
        let id = instance.id.clone();
        let port = instance.port;

        match &exit {
            Ok(status) if status.success() => info!(instance_id = %id, "Game server stopped normally"),
            Ok(status) => warn!(
                instance_id = %id,
                exit_code = ?status.code(),
                "Game server exited with error"
            ),
            Err(e) => warn!(instance_id = %id, error = %e, "Failed waiting for game server"),
        }

        if self.shutting_down.load(Ordering::Acquire) {
            // Keep the record Running so the next start restores it.
            self.close_firewall(port).await;
            return;
        }

        instance.status = InstanceStatus::Stopped;
        instance.pid = None;
        instance.process = None;
        instance.detach_probe();

        self.close_firewall(port).await;
        self.persist_logged(&instances);
    }

    /// Signals the process, then polls until the monitor records the exit.
    pub async fn stop_instance(&self, id: &str) -> Result<(), NodeError> {
        {
            let mut instances = self.instances.write().await;
            self.busy.check(Operation::Stop)?;

            let instance = instances
                .get_mut(id)
                .ok_or_else(|| NodeError::InstanceNotFound(id.to_string()))?;
            if !instance.status.is_running() {
                return Err(NodeError::InstanceNotRunning(id.to_string()));
            }

            info!(instance_id = %id, pid = ?instance.pid, "Stopping instance");
            match instance.process.as_mut() {
                Some(process) => process.kill(),
                None => {
                    // Nothing supervised; the record is stale.
                    let port = instance.port;
                    instance.status = InstanceStatus::Stopped;
                    instance.pid = None;
                    self.close_firewall(port).await;
                    self.persist(&instances)?;
                    return Ok(());
                }
            }
        }

        self.wait_until_stopped(id).await
    }

    async fn wait_until_stopped(&self, id: &str) -> Result<(), NodeError> {
        let after = self.config.stop_timeout;
        let poll = async {
            let mut ticker = tokio::time::interval(STOP_POLL_INTERVAL);
            loop {
                ticker.tick().await;
                let instances = self.instances.read().await;
                match instances.get(id).map(|i| i.status) {
                    None | Some(InstanceStatus::Stopped) | Some(InstanceStatus::Error) => return,
                    Some(_) => {}
                }
            }
        };
        tokio::time::timeout(after, poll)
            .await
            .map_err(|_| NodeError::Timeout {
                what: format!("instance {id} to stop"),
                after,
            })
    }

    async fn stop_if_running(&self, id: &str) -> Result<(), NodeError> {
        let running = self
            .instances
            .read()
            .await
            .get(id)
            .is_some_and(|i| i.status.is_running());
        if !running {
            return Ok(());
        }
        match self.stop_instance(id).await {
            Err(e) if e.kind() == ErrorKind::InstanceNotRunning => Ok(()),
            other => other,
        }
    }

    pub async fn start_instance(self: &Arc<Self>, id: &str) -> Result<(), NodeError> {
        let mut instances = self.instances.write().await;
        self.busy.check(Operation::Start)?;

        let instance = instances
            .get_mut(id)
            .ok_or_else(|| NodeError::InstanceNotFound(id.to_string()))?;
        if instance.status.is_running() {
            return Err(NodeError::InstanceAlreadyRunning(id.to_string()));
        }
        instance.ensure_idle()?;

        info!(instance_id = %id, status = %instance.status, "Starting instance");
        let result = self.start_process(instance).await;
        if let Err(e) = &result {
            error!(instance_id = %id, error = %e, "Failed to start instance");
            instance.status = InstanceStatus::Error;
        }
        self.persist_logged(&instances);
        result
    }

    /// Stop then start; an instance that was not running is just started.
    pub async fn restart_instance(self: &Arc<Self>, id: &str) -> Result<(), NodeError> {
        self.busy.check(Operation::Restart)?;
        self.stop_if_running(id).await?;
        self.start_instance(id).await
    }

    /// Drops the record and deletes the directory.
    ///
    /// The directory is moved aside under the lock and deleted after it is
    /// released; a deletion failure is reported in the outcome.
    pub async fn remove_instance(&self, id: &str) -> Result<RemoveOutcome, NodeError> {
        let (path, moved) = {
            let mut instances = self.instances.write().await;
            self.busy.check(Operation::Remove)?;

            let instance = instances
                .get(id)
                .ok_or_else(|| NodeError::InstanceNotFound(id.to_string()))?;
            if instance.status.is_running() {
                return Err(NodeError::MustBeStopped {
                    id: id.to_string(),
                    op: "removal",
                });
            }
            instance.ensure_idle()?;

            let path = instance.path.clone();
            // Dots never appear in instance ids, so this cannot collide.
            let tombstone = self
                .config
                .instances_dir
                .join(format!(".removed-{id}-{}", Utc::now().timestamp_millis()));
            info!(instance_id = %id, path = %path.display(), "Removing instance");

            let moved = match tokio::fs::rename(&path, &tombstone).await {
                Ok(()) => Ok(Some(tombstone)),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
                Err(e) => Err(e),
            };

            if let Some(instance) = instances.remove(id) {
                instance.detach_probe();
            }
            self.persist(&instances)?;
            (path, moved)
        };

        let file_error = match moved {
            Ok(None) => None,
            Ok(Some(tombstone)) => tokio::fs::remove_dir_all(&tombstone)
                .await
                .err()
                .map(|e| format!("failed to delete {}: {e}", tombstone.display())),
            Err(e) => Some(format!("failed to remove {}: {e}", path.display())),
        };
        if let Some(file_error) = &file_error {
            error!(instance_id = %id, error = %file_error, "Failed to remove instance files");
        }
        Ok(RemoveOutcome { file_error })
    }

    /// Renames the instance and its directory. Stops it first if running.
    pub async fn rename_instance(&self, id: &str, new_id: &str) -> Result<InstanceView, NodeError> {
        let new_id = InstanceId::parse(new_id)?;
        self.busy.check(Operation::Rename)?;
        self.stop_if_running(id).await?;

        let mut instances = self.instances.write().await;
        self.busy.check(Operation::Rename)?;

        if instances.contains_key(&new_id) {
            return Err(NodeError::Conflict(format!(
                "instance with id {new_id} already exists"
            )));
        }
        let instance = instances
            .get(id)
            .ok_or_else(|| NodeError::InstanceNotFound(id.to_string()))?;
        if instance.status.is_running() {
            return Err(NodeError::MustBeStopped {
                id: id.to_string(),
                op: "rename",
            });
        }
        instance.ensure_idle()?;

        let old_path = instance.path.clone();
        let new_path = self.config.instances_dir.join(new_id.as_str());
        info!(
            old_id = %id,
            new_id = %new_id,
            old_path = %old_path.display(),
            new_path = %new_path.display(),
            "Renaming instance"
        );
        tokio::fs::rename(&old_path, &new_path)
            .await
            .map_err(|e| NodeError::file("rename_instance_dir", &old_path, e))?;

        let Some(mut instance) = instances.remove(id) else {
            return Err(NodeError::InstanceNotFound(id.to_string()));
        };
        instance.id = new_id.clone();
        instance.path = new_path;
        let view = instance.view();
        instances.insert(new_id, instance);

        self.persist(&instances)?;
        Ok(view)
    }

    /// Refreshes the template, then re-copies it into the instance.
    pub async fn update_instance(&self, id: &str) -> Result<InstanceView, NodeError> {
        self.busy.check(Operation::Update)?;
        self.stop_if_running(id).await?;

        let template = self.template_lock.write().await;
        let path = {
            let mut instances = self.instances.write().await;
            self.busy.check(Operation::Update)?;
            let instance = instances
                .get_mut(id)
                .ok_or_else(|| NodeError::InstanceNotFound(id.to_string()))?;
            instance.claim("update")?;
            instance.path.clone()
        };

        let result = async {
            self.template.refresh(&self.config.game_install_dir).await?;
            let _template = template.downgrade();

            info!(instance_id = %id, "Updating instance files");
            let src = self.config.game_install_dir.clone();
            let dst = path.clone();
            tokio::task::spawn_blocking(move || {
                files::copy_dir(&src, &dst)?;
                Ok::<_, std::io::Error>(files::read_version(&dst))
            })
            .await?
            .map_err(|e| NodeError::file("update_game_files", &path, e))
        }
        .await;

        let mut instances = self.instances.write().await;
        let instance = instances
            .get_mut(id)
            .ok_or_else(|| NodeError::InstanceNotFound(id.to_string()))?;
        instance.release();
        match result {
            Ok(version) => {
                instance.version = version;
                let view = instance.view();
                self.persist(&instances)?;
                info!(instance_id = %id, version = %view.version, "Instance updated");
                Ok(view)
            }
            Err(e) => {
                instance.status = InstanceStatus::Error;
                self.persist_logged(&instances);
                Err(e)
            }
        }
    }

    /// Refreshes the shared template with the busy flag set.
    pub async fn update_template(&self) -> Result<TemplateUpdate, NodeError> {
        let _busy = {
            let _instances = self.instances.write().await;
            self.busy
                .try_acquire()
                .ok_or(NodeError::InstanceBusyGlobal)?
        };
        let _template = self.template_lock.write().await;

        let dir = &self.config.game_install_dir;
        let previous = files::read_version(dir);
        info!(previous = %previous, "Updating game template");
        let version = self.template.refresh(dir).await?;

        Ok(TemplateUpdate { previous, version })
    }

    /// Archives a stopped instance into its backups directory.
    pub async fn backup_instance(&self, id: &str) -> Result<BackupEntry, NodeError> {
        let (path, version) = {
            let mut instances = self.instances.write().await;
            self.busy.check(Operation::Backup)?;
            let instance = instances
                .get_mut(id)
                .ok_or_else(|| NodeError::InstanceNotFound(id.to_string()))?;
            instance.claim("backup")?;
            (instance.path.clone(), instance.version.clone())
        };

        let result = write_backup(id, &path, &version).await;
        self.release(id).await;
        result
    }

    /// Replaces a stopped instance's files with the contents of a backup.
    pub async fn restore_instance(&self, id: &str, filename: &str) -> Result<InstanceView, NodeError> {
        if !files::is_plain_file_name(filename) {
            return Err(NodeError::InvalidRequest(format!(
                "invalid backup filename {filename:?}"
            )));
        }
        let path = {
            let mut instances = self.instances.write().await;
            self.busy.check(Operation::Restore)?;
            let instance = instances
                .get_mut(id)
                .ok_or_else(|| NodeError::InstanceNotFound(id.to_string()))?;
            instance.claim("restore")?;
            instance.path.clone()
        };

        let archive_path = path.join(BACKUPS_DIR).join(filename);
        if !tokio::fs::try_exists(&archive_path).await.unwrap_or(false) {
            self.release(id).await;
            return Err(NodeError::InvalidRequest(format!(
                "backup file {filename} not found"
            )));
        }

        let result = async {
            info!(instance_id = %id, file = %filename, "Restoring backup");
            let dir = path.clone();
            let source = archive_path.clone();
            tokio::task::spawn_blocking(move || {
                files::wipe_except(&dir, BACKUPS_DIR)?;
                archive::extract(&source, &dir)?;
                Ok::<_, std::io::Error>(files::read_version(&dir))
            })
            .await?
            .map_err(|e| NodeError::file("restore_backup", &archive_path, e))
        }
        .await;

        let mut instances = self.instances.write().await;
        let instance = instances
            .get_mut(id)
            .ok_or_else(|| NodeError::InstanceNotFound(id.to_string()))?;
        instance.release();
        match result {
            Ok(version) => {
                instance.version = version;
                let view = instance.view();
                self.persist(&instances)?;
                Ok(view)
            }
            Err(e) => {
                // The directory may already be wiped.
                instance.status = InstanceStatus::Error;
                self.persist_logged(&instances);
                Err(e)
            }
        }
    }

    pub async fn list_backups(&self, id: &str) -> Result<Vec<BackupEntry>, NodeError> {
        let dir = self.instance_path(id).await?.join(BACKUPS_DIR);
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(NodeError::file("list_backups", &dir, e)),
        };

        let mut backups = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| NodeError::file("list_backups", &dir, e))?
        {
            let filename = entry.file_name().to_string_lossy().into_owned();
            if !filename.ends_with(archive::BACKUP_EXTENSION) {
                continue;
            }
            let meta = entry
                .metadata()
                .await
                .map_err(|e| NodeError::file("list_backups", entry.path(), e))?;
            if !meta.is_file() {
                continue;
            }
            backups.push(BackupEntry {
                filename,
                size: meta.len(),
                date: meta
                    .modified()
                    .map(DateTime::<Utc>::from)
                    .unwrap_or_else(|_| Utc::now()),
            });
        }
        backups.sort_by(|a, b| a.filename.cmp(&b.filename));
        Ok(backups)
    }

    pub async fn delete_backup(&self, id: &str, filename: &str) -> Result<(), NodeError> {
        self.busy.check(Operation::DeleteBackup)?;
        if !files::is_plain_file_name(filename) {
            return Err(NodeError::InvalidRequest(format!(
                "invalid backup filename {filename:?}"
            )));
        }
        let backup = self.instance_path(id).await?.join(BACKUPS_DIR).join(filename);
        info!(instance_id = %id, file = %filename, "Deleting backup");
        tokio::fs::remove_file(&backup)
            .await
            .map_err(|e| NodeError::file("delete_backup", &backup, e))
    }

    /// Live CPU, memory and disk usage. Disk walking and process sampling
    /// happen outside the manager lock.
    pub async fn get_instance_stats(&self, id: &str) -> Result<InstanceStats, NodeError> {
        let (status, pid, start_time, path, players, max_players, probe) = {
            let instances = self.instances.read().await;
            let i = instances
                .get(id)
                .ok_or_else(|| NodeError::InstanceNotFound(id.to_string()))?;
            (
                i.status,
                i.pid,
                i.start_time,
                i.path.clone(),
                i.player_count,
                i.max_players,
                Arc::clone(&i.probe),
            )
        };
        let running = status.is_running();

        let instance_id = id.to_string();
        let (disk_usage, sample) = tokio::task::spawn_blocking(move || {
            let disk = files::dir_size(&path).unwrap_or_else(|e| {
                debug!(instance_id = %instance_id, error = %e, "Failed to calculate disk usage");
                0
            });
            let sample = match pid {
                Some(pid) if running => probe.lock().ok().and_then(|mut p| p.sample(pid)),
                _ => None,
            };
            (disk, sample)
        })
        .await?;

        let mut stats = InstanceStats {
            status: status.to_string(),
            disk_usage,
            ..InstanceStats::default()
        };
        if running {
            stats.uptime = start_time
                .map(|t| (Utc::now() - t).num_seconds())
                .unwrap_or_default();
            stats.player_count = players;
            stats.maximum_players = max_players;
            if let Some(sample) = sample {
                stats.cpu_percent = sample.cpu_percent;
                stats.memory_usage = sample.memory_bytes;
            }
        }
        Ok(stats)
    }

    pub async fn get_instance_history(&self, id: &str) -> Result<Vec<HistoryPoint>, NodeError> {
        let instances = self.instances.read().await;
        let instance = instances
            .get(id)
            .ok_or_else(|| NodeError::InstanceNotFound(id.to_string()))?;
        Ok(instance.history.iter().cloned().collect())
    }

    pub async fn record_history(&self, id: &str, point: HistoryPoint) -> Result<(), NodeError> {
        let mut instances = self.instances.write().await;
        let instance = instances
            .get_mut(id)
            .ok_or_else(|| NodeError::InstanceNotFound(id.to_string()))?;
        instance.push_history(point);
        Ok(())
    }

    /// One stats tick: snapshot the ids, sample each outside the lock,
    /// append a history point for every running instance.
    pub async fn collect_stats(&self, total_memory: u64) {
        let ids: Vec<InstanceId> = self.instances.read().await.keys().cloned().collect();
        for id in ids {
            let stats = match self.get_instance_stats(id.as_str()).await {
                Ok(stats) => stats,
                Err(e) => {
                    debug!(instance_id = %id, error = %e, "Skipping stats sample");
                    continue;
                }
            };
            if stats.status != InstanceStatus::Running.as_str() {
                continue;
            }
            let memory_percent = if total_memory > 0 {
                stats.memory_usage as f64 / total_memory as f64 * 100.0
            } else {
                0.0
            };
            let point = HistoryPoint {
                timestamp: Utc::now(),
                cpu: stats.cpu_percent,
                memory_bytes: stats.memory_usage,
                memory_percent,
                player_count: stats.player_count,
            };
            // The instance may have been removed since the snapshot.
            let _ = self.record_history(id.as_str(), point).await;
        }
    }

    pub async fn run_stats_collector(
        self: Arc<Self>,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!(interval_secs = interval.as_secs(), "Starting stats collector");
        let mut sampler = HostSampler::new();
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let total_memory = sampler.total_memory();
                    self.collect_stats(total_memory).await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Stats collector shutting down");
                        break;
                    }
                }
            }
        }
    }

    pub async fn update_player_stats(&self, id: &str, current: u32, max: u32) -> Result<(), NodeError> {
        let mut instances = self.instances.write().await;
        let instance = instances
            .get_mut(id)
            .ok_or_else(|| NodeError::InstanceNotFound(id.to_string()))?;
        instance.player_count = current;
        instance.max_players = max;
        Ok(())
    }

    pub async fn instance_log_path(&self, id: &str) -> Result<PathBuf, NodeError> {
        Ok(self.instance_path(id).await?.join(GAME_LOG_FILE))
    }

    pub async fn read_instance_logs(&self, id: &str) -> Result<String, NodeError> {
        let path = self.instance_log_path(id).await?;
        logs::read_log(&path)
            .await
            .map(|(content, _)| content)
            .map_err(|e| NodeError::file("read_instance_logs", &path, e))
    }

    pub async fn clear_instance_logs(&self, id: &str) -> Result<(), NodeError> {
        let path = self.instance_log_path(id).await?;
        logs::clear_log(&path)
            .await
            .map_err(|e| NodeError::file("clear_instance_logs", &path, e))
    }

    /// Loads the snapshot and restarts every instance recorded as running.
    ///
    /// Returns the number of instances restarted.
    pub async fn restore_instances(self: &Arc<Self>) -> Result<usize, NodeError> {
        let records = self.store.load()?;
        let mut instances = self.instances.write().await;
        for record in records {
            let instance = Instance::from_record(record);
            instances.insert(instance.id.clone(), instance);
        }

        let mut restarted = 0;
        let ids: Vec<InstanceId> = instances.keys().cloned().collect();
        for id in ids {
            let Some(instance) = instances.get_mut(&id) else {
                continue;
            };
            if instance.version.is_empty() {
                instance.version = files::read_version(&instance.path);
            }
            instance.pid = None;
            match instance.status {
                InstanceStatus::Running => {
                    info!(instance_id = %id, port = instance.port, "Restoring instance");
                    match self.start_process(instance).await {
                        Ok(()) => restarted += 1,
                        Err(e) => {
                            error!(instance_id = %id, error = %e, "Failed to restore instance");
                            instance.status = InstanceStatus::Error;
                        }
                    }
                }
                InstanceStatus::Provisioning => {
                    warn!(instance_id = %id, "Provisioning was interrupted; marking instance as failed");
                    instance.status = InstanceStatus::Error;
                }
                InstanceStatus::Stopped | InstanceStatus::Error => {}
            }
        }

        self.persist(&instances)?;
        Ok(restarted)
    }

    /// Kills every supervised process. Records stay as they are so the next
    /// start restores them.
    pub async fn shutdown(&self) {
        self.shutting_down.store(true, Ordering::Release);
        let mut instances = self.instances.write().await;
        info!(count = instances.len(), "Shutting down manager, stopping all instances");
        for instance in instances.values_mut() {
            if let Some(process) = instance.process.as_mut() {
                debug!(instance_id = %instance.id, pid = ?instance.pid, "Killing instance");
                process.kill();
            }
        }
    }

    async fn instance_path(&self, id: &str) -> Result<PathBuf, NodeError> {
        self.instances
            .read()
            .await
            .get(id)
            .map(|i| i.path.clone())
            .ok_or_else(|| NodeError::InstanceNotFound(id.to_string()))
    }

    async fn release(&self, id: &str) {
        if let Some(instance) = self.instances.write().await.get_mut(id) {
            instance.release();
        }
    }

    async fn mark_error(&self, id: &str) {
        let mut instances = self.instances.write().await;
        if let Some(instance) = instances.get_mut(id) {
            instance.status = InstanceStatus::Error;
        }
        self.persist_logged(&instances);
    }

    fn persist(&self, instances: &InstanceMap) -> Result<(), NodeError> {
        let mut records: Vec<_> = instances.values().map(Instance::record).collect();
        records.sort_by_key(|r| r.port);
        self.store.save(&records)?;
        Ok(())
    }

    fn persist_logged(&self, instances: &InstanceMap) {
        if let Err(e) = self.persist(instances) {
            error!(error = %e, "Failed to persist instance state");
        }
    }

    async fn open_firewall(&self, port: u16) {
        match self.firewall.open(port).await {
            Ok(()) => info!(port, "Opened firewall port"),
            Err(e) => error!(port, command = e.command(), error = %e, "Failed to open firewall port"),
        }
    }

    async fn close_firewall(&self, port: u16) {
        match self.firewall.close(port).await {
            Ok(()) => info!(port, "Closed firewall port"),
            Err(e) => error!(port, command = e.command(), error = %e, "Failed to close firewall port"),
        }
    }
}

async fn write_backup(id: &str, path: &Path, version: &str) -> Result<BackupEntry, NodeError> {
    let backups = path.join(BACKUPS_DIR);
    tokio::fs::create_dir_all(&backups)
        .await
        .map_err(|e| NodeError::file("create_backup_dir", &backups, e))?;

    let date = Utc::now();
    let filename = archive::backup_file_name(date, version);
    let dest = backups.join(&filename);
    info!(instance_id = %id, file = %filename, "Creating backup");

    let src = path.to_path_buf();
    let target = dest.clone();
    let created = tokio::task::spawn_blocking(move || {
        archive::create(&src, &target, &[BACKUPS_DIR, GAME_LOG_FILE])
    })
    .await?;
    if let Err(e) = created {
        let _ = tokio::fs::remove_file(&dest).await;
        return Err(NodeError::file("create_backup", &dest, e));
    }

    let size = tokio::fs::metadata(&dest)
        .await
        .map(|m| m.len())
        .unwrap_or_default();
    Ok(BackupEntry {
        filename,
        size,
        date,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuntimeSettings;
    use crate::firewall::MemoryFirewall;
    use crate::state::SqliteSnapshotStore;
    use crate::template::LocalTemplate;

    #[tokio::test]
    async fn test_stop_without_process_closes_port() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::for_base_dir(dir.path());
        let settings = Arc::new(RwLock::new(RuntimeSettings::from_config(&config)));
        let firewall = Arc::new(MemoryFirewall::new());
        let manager = InstanceManager::new(
            config.clone(),
            settings,
            Arc::new(SqliteSnapshotStore::open_in_memory().unwrap()),
            firewall.clone(),
            Arc::new(LocalTemplate),
        );

        let id = InstanceId::derive("eu", 7777).unwrap();
        let mut instance =
            Instance::provisioning(id.clone(), 7777, "eu".into(), config.instances_dir.join(&id));
        instance.status = InstanceStatus::Running;
        instance.pid = Some(4242);
        manager.instances.write().await.insert(id.clone(), instance);
        firewall.open(7777).await.unwrap();

        manager.stop_instance(id.as_str()).await.unwrap();

        let view = manager.get_instance(id.as_str()).await.unwrap();
        assert_eq!(view.status, InstanceStatus::Stopped);
        assert_eq!(view.pid, 0);
        assert!(!firewall.is_open(7777));
    }
}
