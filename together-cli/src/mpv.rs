//! mpv process handling

use std::io;
use std::path::Path;
use std::process::Stdio;

use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

/// Start mpv on `file` with its JSON IPC server at `endpoint`
pub fn launch(mpv: &Path, endpoint: &str, file: &Path) -> io::Result<Child> {
    info!("Starting {} on {}", mpv.display(), file.display());
    Command::new(mpv)
        .arg(format!("--input-ipc-server={}", endpoint))
        .arg(file)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::inherit())
        .kill_on_drop(true)
        .spawn()
}

/// Make sure mpv is gone
pub async fn stop(child: &mut Child) {
    match child.try_wait() {
        Ok(Some(status)) => debug!("mpv already exited ({})", status),
        _ => {
            if let Err(e) = child.kill().await {
                warn!("Failed to stop mpv: {}", e);
            }
        }
    }
}
