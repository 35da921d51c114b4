// ============================================
// FFU Builder - dism.rs
// ============================================
// Imaging operations: DISM for apply / mount / capture / optimize,
// bcdboot for boot files, reagentc for WinRE registration.
//
// FAILURE CLASSIFICATION:
// The apply and optimize retry loops need to know WHY DISM failed.
// Two classes matter:
//   - Disconnected: the source media went away mid-operation
//     (USB pulled, ISO auto-dismounted). Fix: remount, find the image again.
//   - Locked: someone else holds the file (antivirus, indexer, a stale
//     mount). Fix: wait, clean up mount points, try again.
// DISM's exit code is the HRESULT, so the numeric code is checked first.
// Message substrings are only a fallback for older DISM builds that exit
// with a generic code and print the real error in the text.
// ============================================

use std::fmt;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::process::{self, CommandOutput};

// ============================================
// CLASSIFICATION
// ============================================

/// Win32 error codes that mean "the device is gone".
///
/// 21 ERROR_NOT_READY, 31 ERROR_GEN_FAILURE, 55 ERROR_DEV_NOT_EXIST,
/// 1006 ERROR_FILE_INVALID, 1167 ERROR_DEVICE_NOT_CONNECTED
pub const DISCONNECT_CODES: &[u32] = &[21, 31, 55, 1006, 1167];

/// 32 ERROR_SHARING_VIOLATION, 33 ERROR_LOCK_VIOLATION
pub const LOCK_CODES: &[u32] = &[32, 33];

const DISCONNECT_PHRASES: &[&str] = &[
    "device is not ready",
    "no longer available",
    "device does not exist",
    "volume for a file has been externally altered",
];

const LOCK_PHRASES: &[&str] = &[
    "being used by another process",
    "sharing violation",
    "lock violation",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    Disconnected,
    Locked,
    Other,
}

impl fmt::Display for FailureClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureClass::Disconnected => write!(f, "source disconnected"),
            FailureClass::Locked => write!(f, "file locked"),
            FailureClass::Other => write!(f, "other failure"),
        }
    }
}

/// Reduce an HRESULT of the form 0x8007xxxx to its Win32 code.
pub fn win32_code(code: i32) -> u32 {
    let raw = code as u32;
    if raw & 0xFFFF_0000 == 0x8007_0000 {
        raw & 0xFFFF
    } else {
        raw
    }
}

/// Pull the `Error: <code>` DISM prints, in hex or decimal.
pub fn error_code_in_output(output: &str) -> Option<u32> {
    output.lines().find_map(|line| {
        let rest = line.trim().strip_prefix("Error:")?.trim();
        let token = rest.split_whitespace().next()?;
        let value = match token.strip_prefix("0x").or_else(|| token.strip_prefix("0X")) {
            Some(hex) => u32::from_str_radix(hex, 16).ok()?,
            None => token.parse::<u32>().ok()?,
        };
        Some(win32_code(value as i32))
    })
}

/// Classify a failed tool run: exit code, then the code printed in the
/// output, then message text.
pub fn classify_failure(code: Option<i32>, output: &str) -> FailureClass {
    let numeric = code
        .filter(|c| *c != 0)
        .map(win32_code)
        .into_iter()
        .chain(error_code_in_output(output));
    for value in numeric {
        if DISCONNECT_CODES.contains(&value) {
            return FailureClass::Disconnected;
        }
        if LOCK_CODES.contains(&value) {
            return FailureClass::Locked;
        }
    }

    let lower = output.to_lowercase();
    if DISCONNECT_PHRASES.iter().any(|p| lower.contains(p)) {
        FailureClass::Disconnected
    } else if LOCK_PHRASES.iter().any(|p| lower.contains(p)) {
        FailureClass::Locked
    } else {
        FailureClass::Other
    }
}

// ============================================
// ERRORS AND RESULTS
// ============================================

#[derive(Debug, Error)]
pub enum ImagingError {
    #[error("{operation} failed (exit code {}): {output}", code_text(.code))]
    Failed {
        operation: String,
        code: Option<i32>,
        output: String,
    },

    #[error("failed to start {operation}: {source}")]
    Start {
        operation: String,
        #[source]
        source: std::io::Error,
    },
}

fn code_text(code: &Option<i32>) -> String {
    match code {
        Some(c) if *c < 0 => format!("0x{:08X}", *c as u32),
        Some(c) => c.to_string(),
        None => "none".to_string(),
    }
}

impl ImagingError {
    pub fn classify(&self) -> FailureClass {
        match self {
            ImagingError::Failed { code, output, .. } => classify_failure(*code, output),
            ImagingError::Start { .. } => FailureClass::Other,
        }
    }
}

/// The bits of `dism /Get-ImageInfo` the pipeline cares about.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ImageInfo {
    pub name: Option<String>,
    pub edition: Option<String>,
    pub installation_type: Option<String>,
}

impl ImageInfo {
    /// "Server" and "Server Core" installation types.
    pub fn is_server(&self) -> bool {
        self.installation_type
            .as_deref()
            .map(|t| t.to_ascii_lowercase().starts_with("server"))
            .unwrap_or(false)
    }
}

pub fn parse_image_info(output: &str) -> ImageInfo {
    let field = |key: &str| {
        output.lines().find_map(|line| {
            let (k, v) = line.split_once(':')?;
            (k.trim() == key).then(|| v.trim().to_string()).filter(|v| !v.is_empty())
        })
    };
    ImageInfo {
        name: field("Name"),
        edition: field("Edition"),
        installation_type: field("Installation"),
    }
}

/// Outcome of `/Add-Driver /Recurse`. Individual driver failures are
/// reported here instead of failing the whole injection.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DriverAddSummary {
    pub installed: usize,
    pub failed: Vec<String>,
}

/// Parse the per-package lines:
/// `Installing 2 of 5 - C:\Drivers\net.inf: The driver package was successfully installed.`
/// `Installing 3 of 5 - C:\Drivers\bad.inf: Error - An error occurred ...`
pub fn parse_driver_summary(output: &str) -> DriverAddSummary {
    let mut summary = DriverAddSummary::default();
    for line in output.lines().map(str::trim) {
        if !line.starts_with("Installing") {
            continue;
        }
        let Some((_, rest)) = line.split_once(" - ") else { continue };
        // Driver paths contain a drive colon; the status follows the last ": ".
        let (package, status) = rest.rsplit_once(": ").unwrap_or((rest, ""));
        if status.to_lowercase().contains("successfully installed") {
            summary.installed += 1;
        } else {
            summary.failed.push(package.to_string());
        }
    }
    summary
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnmountMode {
    Commit,
    Discard,
}

// ============================================
// IMAGING CAPABILITY
// ============================================

pub trait ImagingTool {
    fn image_info(&self, image: &Path, index: u32) -> Result<ImageInfo, ImagingError>;

    fn apply_image(&self, image: &Path, index: u32, apply_dir: &Path, compact: bool) -> Result<(), ImagingError>;

    /// `bcdboot <windows> /S <system> /F UEFI`
    fn make_bootable(&self, windows_dir: &Path, system_drive: &str) -> Result<(), ImagingError>;

    /// Point the offline image's WinRE configuration at `re_dir`.
    fn register_recovery(&self, re_dir: &Path, windows_dir: &Path) -> Result<(), ImagingError>;

    fn mount_image(&self, image: &Path, index: u32, mount_dir: &Path) -> Result<(), ImagingError>;

    fn unmount_image(&self, mount_dir: &Path, mode: UnmountMode) -> Result<(), ImagingError>;

    fn add_drivers(&self, mount_dir: &Path, drivers: &Path) -> Result<DriverAddSummary, ImagingError>;

    /// System-wide cleanup of stale or orphaned mount points.
    fn cleanup_mountpoints(&self) -> Result<(), ImagingError>;

    fn capture_ffu(&self, physical_drive: &str, target: &Path, name: &str) -> Result<(), ImagingError>;

    fn optimize_ffu(&self, ffu: &Path, scratch_dir: &Path) -> Result<(), ImagingError>;
}

/// The real thing: dism.exe, bcdboot.exe, reagentc.exe.
#[derive(Debug, Clone, Default)]
pub struct Dism {
    /// Passed as `/LogPath:` when set
    pub log_path: Option<PathBuf>,
}

impl Dism {
    pub fn new(log_path: Option<PathBuf>) -> Self {
        Dism { log_path }
    }

    fn run(&self, operation: &str, args: Vec<String>) -> Result<CommandOutput, ImagingError> {
        let mut full = vec!["/English".to_string()];
        if let Some(log) = &self.log_path {
            full.push(format!("/LogPath:{}", log.display()));
        }
        full.extend(args);
        run_tool("dism", operation, &full)
    }
}

fn run_tool(program: &str, operation: &str, args: &[String]) -> Result<CommandOutput, ImagingError> {
    log::debug!("{} {}", program, args.join(" "));
    let output = process::run(program, args).map_err(|source| ImagingError::Start {
        operation: operation.to_string(),
        source,
    })?;
    if !output.success() {
        return Err(ImagingError::Failed {
            operation: operation.to_string(),
            code: output.code,
            output: output.combined(),
        });
    }
    Ok(output)
}

impl ImagingTool for Dism {
    fn image_info(&self, image: &Path, index: u32) -> Result<ImageInfo, ImagingError> {
        let output = self.run(
            "DISM /Get-ImageInfo",
            vec![
                "/Get-ImageInfo".into(),
                format!("/ImageFile:{}", image.display()),
                format!("/Index:{}", index),
            ],
        )?;
        Ok(parse_image_info(&output.stdout))
    }

    fn apply_image(&self, image: &Path, index: u32, apply_dir: &Path, compact: bool) -> Result<(), ImagingError> {
        log::info!(
            "Applying {} (index {}) to {}{}",
            image.display(),
            index,
            apply_dir.display(),
            if compact { " [compact]" } else { "" }
        );
        let mut args = vec![
            "/Apply-Image".to_string(),
            format!("/ImageFile:{}", image.display()),
            format!("/Index:{}", index),
            format!("/ApplyDir:{}", apply_dir.display()),
        ];
        if compact {
            args.push("/Compact".into());
        }
        self.run("DISM /Apply-Image", args)?;
        Ok(())
    }

    fn make_bootable(&self, windows_dir: &Path, system_drive: &str) -> Result<(), ImagingError> {
        log::info!("Writing UEFI boot files to {}", system_drive);
        run_tool(
            "bcdboot",
            "bcdboot",
            &[
                windows_dir.display().to_string(),
                "/S".into(),
                system_drive.to_string(),
                "/F".into(),
                "UEFI".into(),
            ],
        )?;
        Ok(())
    }

    fn register_recovery(&self, re_dir: &Path, windows_dir: &Path) -> Result<(), ImagingError> {
        run_tool(
            "reagentc",
            "reagentc /setreimage",
            &[
                "/setreimage".into(),
                "/path".into(),
                re_dir.display().to_string(),
                "/target".into(),
                windows_dir.display().to_string(),
            ],
        )?;
        Ok(())
    }

    fn mount_image(&self, image: &Path, index: u32, mount_dir: &Path) -> Result<(), ImagingError> {
        log::info!("Mounting {} to {}", image.display(), mount_dir.display());
        self.run(
            "DISM /Mount-Image",
            vec![
                "/Mount-Image".into(),
                format!("/ImageFile:{}", image.display()),
                format!("/Index:{}", index),
                format!("/MountDir:{}", mount_dir.display()),
            ],
        )?;
        Ok(())
    }

    fn unmount_image(&self, mount_dir: &Path, mode: UnmountMode) -> Result<(), ImagingError> {
        let flag = match mode {
            UnmountMode::Commit => "/Commit",
            UnmountMode::Discard => "/Discard",
        };
        log::info!("Unmounting {} ({})", mount_dir.display(), flag);
        self.run(
            "DISM /Unmount-Image",
            vec!["/Unmount-Image".into(), format!("/MountDir:{}", mount_dir.display()), flag.into()],
        )?;
        Ok(())
    }

    fn add_drivers(&self, mount_dir: &Path, drivers: &Path) -> Result<DriverAddSummary, ImagingError> {
        log::info!("Adding drivers from {}", drivers.display());
        let args = vec![
            format!("/Image:{}", mount_dir.display()),
            "/Add-Driver".into(),
            format!("/Driver:{}", drivers.display()),
            "/Recurse".into(),
        ];
        // Some bad packages make DISM exit non-zero even though the rest
        // installed; the per-package lines are the real result.
        match self.run("DISM /Add-Driver", args) {
            Ok(output) => Ok(parse_driver_summary(&output.stdout)),
            Err(ImagingError::Failed { output, .. }) if output.contains("Installing") => {
                Ok(parse_driver_summary(&output))
            }
            Err(e) => Err(e),
        }
    }

    fn cleanup_mountpoints(&self) -> Result<(), ImagingError> {
        log::info!("Cleaning up stale DISM mount points");
        self.run("DISM /Cleanup-Mountpoints", vec!["/Cleanup-Mountpoints".into()])?;
        Ok(())
    }

    fn capture_ffu(&self, physical_drive: &str, target: &Path, name: &str) -> Result<(), ImagingError> {
        log::info!("Capturing {} to {}", physical_drive, target.display());
        self.run(
            "DISM /Capture-FFU",
            vec![
                "/Capture-FFU".into(),
                format!("/ImageFile:{}", target.display()),
                format!("/CaptureDrive:{}", physical_drive),
                format!("/Name:{}", name),
                "/Compress:Default".into(),
            ],
        )?;
        Ok(())
    }

    fn optimize_ffu(&self, ffu: &Path, scratch_dir: &Path) -> Result<(), ImagingError> {
        log::info!("Optimizing {} (scratch {})", ffu.display(), scratch_dir.display());
        self.run(
            "DISM /Optimize-FFU",
            vec![
                "/Optimize-FFU".into(),
                format!("/ImageFile:{}", ffu.display()),
                format!("/ScratchDir:{}", scratch_dir.display()),
            ],
        )?;
        Ok(())
    }
}
