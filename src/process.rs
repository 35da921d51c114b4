// ============================================
// FFU Builder - process.rs
// ============================================
// Every OS operation in this crate goes through an external Windows tool:
// dism.exe, diskpart.exe, powershell.exe, reg.exe, sc.exe, bcdboot.exe.
// This module runs them the same way everywhere: no console window, stdout
// and stderr captured, exit code preserved so callers can classify failures
// by status code instead of by message text.
// ============================================

use std::ffi::OsStr;
use std::fs;
use std::io;
use std::path::Path;
use std::process::Command;

#[cfg(windows)]
use std::os::windows::process::CommandExt;

/// CREATE_NO_WINDOW - keeps dism/diskpart from flashing console windows
#[cfg(windows)]
const CREATE_NO_WINDOW: u32 = 0x0800_0000;

/// Captured result of one external tool invocation.
#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    /// Process exit code. `None` if the process was killed by a signal.
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    /// stdout and stderr joined, trimmed. Used in error messages.
    pub fn combined(&self) -> String {
        let out = self.stdout.trim();
        let err = self.stderr.trim();
        match (out.is_empty(), err.is_empty()) {
            (true, true) => String::new(),
            (false, true) => out.to_string(),
            (true, false) => err.to_string(),
            (false, false) => format!("{}\n{}", out, err),
        }
    }
}

/// Run a program to completion and capture its output.
///
/// Only a failure to *start* the process is an `Err`. A non-zero exit code
/// is returned as a normal `CommandOutput` for the caller to interpret.
pub fn run<I, S>(program: &str, args: I) -> io::Result<CommandOutput>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let mut command = Command::new(program);
    command.args(args);

    #[cfg(windows)]
    command.creation_flags(CREATE_NO_WINDOW);

    log::debug!("running {}", program);
    let output = command.output()?;

    Ok(CommandOutput {
        code: output.status.code(),
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    })
}

/// Run a PowerShell snippet non-interactively.
///
/// `$ErrorActionPreference = 'Stop'` makes cmdlet errors terminate the
/// script with a non-zero exit code instead of printing and carrying on.
pub fn powershell(script: &str) -> io::Result<CommandOutput> {
    let wrapped = format!("$ErrorActionPreference = 'Stop'; {}", script);
    run(
        "powershell",
        ["-NoProfile", "-NonInteractive", "-ExecutionPolicy", "Bypass", "-Command", &wrapped],
    )
}

/// Write a diskpart script next to the build's work files and run it with
/// `diskpart /s`. The script file is removed afterwards.
pub fn diskpart(script_dir: &Path, script: &str) -> io::Result<CommandOutput> {
    fs::create_dir_all(script_dir)?;
    let script_path = script_dir.join(format!("diskpart-{}.txt", uuid::Uuid::new_v4().simple()));
    fs::write(&script_path, script)?;

    let result = run("diskpart", [OsStr::new("/s"), script_path.as_os_str()]);

    if let Err(e) = fs::remove_file(&script_path) {
        log::debug!("Script {} not removed: {}", script_path.display(), e);
    }
    result
}

/// Quote a path for embedding in a PowerShell single-quoted string.
pub fn ps_quote(value: &Path) -> String {
    format!("'{}'", value.display().to_string().replace('\'', "''"))
}
