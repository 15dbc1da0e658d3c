//! Shared helpers for building child-process commands.

use std::path::Path;
use tokio::process::Command;

/// Build a shell invocation of `command_line` (`sh -c` / `cmd /C`).
pub fn shell_command(command_line: &str) -> Command {
    #[cfg(target_os = "windows")]
    {
        let mut cmd = Command::new("cmd");
        cmd.args(["/C", command_line]);
        cmd
    }
    #[cfg(not(target_os = "windows"))]
    {
        let mut cmd = Command::new("sh");
        cmd.args(["-c", command_line]);
        cmd
    }
}

/// Put the child in its own process group so its whole subtree can be signalled.
#[cfg(unix)]
pub fn detach_process_group(cmd: &mut Command) -> &mut Command {
    cmd.process_group(0)
}

#[cfg(not(unix))]
pub fn detach_process_group(cmd: &mut Command) -> &mut Command {
    cmd
}

/// Apply platform-specific flags to hide the console window on Windows.
/// On non-Windows platforms, this is a no-op.
#[cfg(target_os = "windows")]
pub fn apply_creation_flags(cmd: &mut Command) -> &mut Command {
    const CREATE_NO_WINDOW: u32 = 0x08000000;
    const CREATE_NEW_PROCESS_GROUP: u32 = 0x00000200;
    cmd.creation_flags(CREATE_NO_WINDOW | CREATE_NEW_PROCESS_GROUP)
}

#[cfg(not(target_os = "windows"))]
pub fn apply_creation_flags(cmd: &mut Command) -> &mut Command {
    cmd
}

/// `root/suffix` when that directory exists, otherwise `root`.
pub fn resolve_working_dir(root: &Path, suffix: &str) -> std::path::PathBuf {
    let suffix = suffix.trim();
    if suffix.is_empty() {
        return root.to_path_buf();
    }
    let candidate = root.join(suffix);
    if candidate.is_dir() {
        candidate
    } else {
        tracing::debug!(
            "Working directory {} does not exist, falling back to {}",
            candidate.display(),
            root.display()
        );
        root.to_path_buf()
    }
}
