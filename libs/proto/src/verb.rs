//! Verbs understood by controller and node.

/// Frame discriminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Verb {
    Register,
    RegisterResponse,
    Heartbeat,
    Response,
    Spawn,
    StartInstance,
    StopInstance,
    RestartInstance,
    RemoveInstance,
    RenameInstance,
    UpdateInstance,
    UpdateTemplate,
    UpdateConfig,
    ListInstances,
    GetInstanceStats,
    GetInstanceHistory,
    BackupInstance,
    RestoreInstance,
    ListBackups,
    DeleteBackup,
    GetLogs,
    ClearLogs,
    GetInstanceLogs,
    ClearInstanceLogs,
}

impl Verb {
    pub const ALL: [Verb; 24] = [
        Verb::Register,
        Verb::RegisterResponse,
        Verb::Heartbeat,
        Verb::Response,
        Verb::Spawn,
        Verb::StartInstance,
        Verb::StopInstance,
        Verb::RestartInstance,
        Verb::RemoveInstance,
        Verb::RenameInstance,
        Verb::UpdateInstance,
        Verb::UpdateTemplate,
        Verb::UpdateConfig,
        Verb::ListInstances,
        Verb::GetInstanceStats,
        Verb::GetInstanceHistory,
        Verb::BackupInstance,
        Verb::RestoreInstance,
        Verb::ListBackups,
        Verb::DeleteBackup,
        Verb::GetLogs,
        Verb::ClearLogs,
        Verb::GetInstanceLogs,
        Verb::ClearInstanceLogs,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Verb::Register => "REGISTER",
            Verb::RegisterResponse => "REGISTER_RESPONSE",
            Verb::Heartbeat => "HEARTBEAT",
            Verb::Response => "RESPONSE",
            Verb::Spawn => "spawn",
            Verb::StartInstance => "start_instance",
            Verb::StopInstance => "stop_instance",
            Verb::RestartInstance => "restart_instance",
            Verb::RemoveInstance => "remove_instance",
            Verb::RenameInstance => "rename_instance",
            Verb::UpdateInstance => "update_instance",
            Verb::UpdateTemplate => "update_template",
            Verb::UpdateConfig => "update_config",
            Verb::ListInstances => "list_instances",
            Verb::GetInstanceStats => "get_instance_stats",
            Verb::GetInstanceHistory => "get_instance_history",
            Verb::BackupInstance => "backup_instance",
            Verb::RestoreInstance => "restore_instance",
            Verb::ListBackups => "list_backups",
            Verb::DeleteBackup => "delete_backup",
            Verb::GetLogs => "get_logs",
            Verb::ClearLogs => "clear_logs",
            Verb::GetInstanceLogs => "get_instance_logs",
            Verb::ClearInstanceLogs => "clear_instance_logs",
        }
    }

    /// Case-sensitive lookup; unknown verbs return `None`.
    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|verb| verb.as_str() == s)
    }

    /// Verbs polled frequently enough that logging each one is noise.
    pub fn is_chatty(&self) -> bool {
        matches!(
            self,
            Verb::GetLogs | Verb::GetInstanceLogs | Verb::GetInstanceStats | Verb::Heartbeat
        )
    }
}

impl std::fmt::Display for Verb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_every_verb_roundtrips() {
        for verb in Verb::ALL {
            assert_eq!(Verb::parse(verb.as_str()), Some(verb));
        }
    }

    #[rstest]
    #[case("SPAWN")]
    #[case("register")]
    #[case("")]
    #[case("update_everything")]
    fn test_unknown_verbs(#[case] raw: &str) {
        assert_eq!(Verb::parse(raw), None);
    }
}
