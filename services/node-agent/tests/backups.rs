//! Backup, restore and log operations on a stopped instance.

#![cfg(unix)]

mod common;

use exile_node_agent::error::ErrorKind;
use exile_proto::InstanceStatus;

use common::{wait_for_status, Node, GAME_VERSION};

#[tokio::test]
async fn test_backup_restore_roundtrip() {
    let node = Node::new(32100, 4);
    let manager = &node.manager;

    let id = manager.spawn().await.unwrap().id.to_string();
    wait_for_status(manager, &id, InstanceStatus::Running).await;

    let err = manager.backup_instance(&id).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InstanceAlreadyRunning);

    manager.stop_instance(&id).await.unwrap();
    let dir = node.config.instances_dir.join(&id);
    std::fs::write(dir.join("save.dat"), "day 1").unwrap();

    let backup = manager.backup_instance(&id).await.unwrap();
    assert!(backup.filename.ends_with(".tar.gz"));
    assert!(backup.filename.contains(GAME_VERSION));
    assert!(backup.size > 0);

    std::fs::write(dir.join("save.dat"), "day 2").unwrap();
    std::fs::write(dir.join("junk.tmp"), "x").unwrap();
    std::fs::remove_file(dir.join("version.txt")).unwrap();

    let restored = manager.restore_instance(&id, &backup.filename).await.unwrap();
    assert_eq!(restored.version, GAME_VERSION);
    assert_eq!(std::fs::read_to_string(dir.join("save.dat")).unwrap(), "day 1");
    assert!(!dir.join("junk.tmp").exists());
    assert!(dir.join("backups").join(&backup.filename).exists());

    let backups = manager.list_backups(&id).await.unwrap();
    assert_eq!(backups.len(), 1);
    assert_eq!(backups[0].filename, backup.filename);

    manager.delete_backup(&id, &backup.filename).await.unwrap();
    assert!(manager.list_backups(&id).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_backup_names_are_validated() {
    let node = Node::new(32200, 4);
    let manager = &node.manager;

    let id = manager.spawn().await.unwrap().id.to_string();
    wait_for_status(manager, &id, InstanceStatus::Running).await;
    manager.stop_instance(&id).await.unwrap();

    let err = manager.delete_backup(&id, "../gameserver").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidRequest);
    assert!(node.config.instances_dir.join(&id).join("gameserver").exists());

    let err = manager.restore_instance(&id, "../../etc").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidRequest);

    let err = manager.restore_instance(&id, "missing.tar.gz").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidRequest);

    // A failed restore leaves the instance usable.
    manager.start_instance(&id).await.unwrap();
    manager.shutdown().await;
}

#[tokio::test]
async fn test_backups_of_unknown_instance() {
    let node = Node::new(32300, 4);
    let err = node.manager.list_backups("local-1").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InstanceNotFound);
    let err = node.manager.backup_instance("local-1").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InstanceNotFound);
}

#[tokio::test]
async fn test_instance_logs_read_and_clear() {
    let node = Node::new(32400, 4);
    let manager = &node.manager;

    let id = manager.spawn().await.unwrap().id.to_string();
    wait_for_status(manager, &id, InstanceStatus::Running).await;
    manager.stop_instance(&id).await.unwrap();

    let log = manager.instance_log_path(&id).await.unwrap();
    std::fs::write(&log, "server ready\n").unwrap();
    assert_eq!(manager.read_instance_logs(&id).await.unwrap(), "server ready\n");

    manager.clear_instance_logs(&id).await.unwrap();
    assert_eq!(manager.read_instance_logs(&id).await.unwrap(), "");
}

#[tokio::test]
async fn test_corrupt_backup_marks_instance_failed() {
    let node = Node::new(32500, 4);
    let manager = &node.manager;

    let id = manager.spawn().await.unwrap().id.to_string();
    wait_for_status(manager, &id, InstanceStatus::Running).await;
    manager.stop_instance(&id).await.unwrap();

    let backups = node.config.instances_dir.join(&id).join("backups");
    std::fs::create_dir_all(&backups).unwrap();
    std::fs::write(backups.join("bad.tar.gz"), "not a gzip").unwrap();

    let err = manager.restore_instance(&id, "bad.tar.gz").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::FileOperationFailure);

    let view = manager.get_instance(&id).await.unwrap();
    assert_eq!(view.status, InstanceStatus::Error);
    assert!(backups.join("bad.tar.gz").exists());
}
