//! Game-server process launch and exit supervision.

use std::fs::{File, OpenOptions};
use std::io;
use std::path::Path;
use std::process::{ExitStatus, Stdio};

use tokio::process::{Child, Command};
use tokio::sync::oneshot;
use tracing::debug;

/// Argument contract of the game-server binary.
pub fn game_args(port: u16, callback_url: &str) -> Vec<String> {
    vec![
        "-batchmode".to_string(),
        "-nographics".to_string(),
        "-mode".to_string(),
        "server".to_string(),
        "-port".to_string(),
        port.to_string(),
        "-ws".to_string(),
        callback_url.to_string(),
    ]
}

/// URL the game server dials back into the node on.
pub fn callback_url(host: &str, node_port: u16, instance_id: &str) -> String {
    format!("ws://{host}:{node_port}/instance/{instance_id}/ws")
}

/// Marks `path` executable (0755 on unix).
pub fn ensure_executable(path: &Path) -> io::Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755))
    }
    #[cfg(not(unix))]
    {
        std::fs::metadata(path).map(|_| ())
    }
}

/// Opens the instance log for appending, creating it if needed.
pub fn open_log(path: &Path) -> io::Result<File> {
    let mut options = OpenOptions::new();
    options.create(true).append(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    options.open(path)
}

/// Starts `binary` in `dir` with stdout and stderr appended to `log`.
///
/// The parent's copies of the log handle are dropped once the child has
/// inherited them.
pub fn launch(binary: &Path, args: &[String], dir: &Path, log: File) -> io::Result<Child> {
    let stderr = log.try_clone()?;
    Command::new(binary)
        .args(args)
        .current_dir(dir)
        .stdin(Stdio::null())
        .stdout(Stdio::from(log))
        .stderr(Stdio::from(stderr))
        .spawn()
}

/// Handle kept in the instance record while its process runs.
#[derive(Debug)]
pub struct ProcessHandle {
    /// Distinguishes this launch from any later one on the same instance.
    pub generation: u64,
    kill: Option<oneshot::Sender<()>>,
}

impl ProcessHandle {
    pub fn new(generation: u64) -> (Self, oneshot::Receiver<()>) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                generation,
                kill: Some(tx),
            },
            rx,
        )
    }

    /// Asks the monitor to kill the process. Repeated calls are no-ops.
    pub fn kill(&mut self) {
        if let Some(tx) = self.kill.take() {
            // A closed receiver means the monitor already saw the exit.
            let _ = tx.send(());
        }
    }
}

/// Waits for `child` to exit, killing it first if `kill` fires.
pub async fn wait_for_exit(
    mut child: Child,
    kill: oneshot::Receiver<()>,
) -> io::Result<ExitStatus> {
    tokio::select! {
        status = child.wait() => status,
        signal = kill => {
            if signal.is_ok() {
                if let Err(e) = child.start_kill() {
                    debug!(error = %e, "Kill raced with process exit");
                }
            }
            child.wait().await
        }
    }
}
