// ============================================
// FFU Builder - capture.rs
// ============================================
// Produces the final FFU and post-processes it.
//
// HOW IT WORKS:
// 1. Get an FFU:
//    - Disk mode: DISM /Capture-FFU straight from \\.\PhysicalDriveN
//    - VM mode:   wait for the build VM to power off, then take the
//                 newest .ffu its capture media wrote to the capture folder
// 2. Settle delay, then wait until the file can be opened for writing
// 3. Optional driver injection: mount, add drivers, unmount (save)
// 4. Optional optimize, with cleanup + retry
//
// LOCKS:
// A freshly written multi-GB file is a magnet for antivirus and the search
// indexer. Every step that opens the FFU first waits for the settle delay
// or probes the file, and the optimize retry loop repeats its cleanup each
// time round.
// ============================================

use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use thiserror::Error;
use walkdir::WalkDir;

use crate::config::Timings;
use crate::disk::DiskBackend;
use crate::dism::{DriverAddSummary, ImagingError, ImagingTool, UnmountMode};
use crate::hypervisor::{HypervisorError, HypervisorProvider, PowerState};
use crate::services::ServiceReadinessChecker;
use crate::volume;

/// Prefix DISM uses for the temporary VHDs it creates while mounting FFUs.
pub const ORPHAN_VHD_PREFIX: &str = "_ffumount";

// ============================================
// TYPES
// ============================================

#[derive(Debug, Clone, PartialEq)]
pub enum CaptureSource {
    /// Capture directly from an attached disk.
    Disk {
        physical_drive: String,
        target: PathBuf,
        name: String,
    },
    /// The VM captures itself; collect what it leaves in `capture_dir`.
    VmOutput { vm: String, capture_dir: PathBuf },
}

#[derive(Debug, Clone)]
pub struct CaptureJob {
    pub source: CaptureSource,
    pub drivers: Option<PathBuf>,
    pub optimize: bool,
    pub mount_dir: PathBuf,
    pub scratch_dir: PathBuf,
}

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("{}", not_found_message(.dir, .found))]
    SourceNotFound { dir: PathBuf, found: Vec<PathBuf> },

    #[error("capture target already exists: {0}")]
    TargetExists(PathBuf),

    #[error("FFU capture failed: {0}")]
    Capture(#[source] ImagingError),

    #[error(transparent)]
    Vm(#[from] HypervisorError),

    #[error("VM {vm} still {last:?} after {polls} power-state poll(s)")]
    VmPollLimit { vm: String, polls: u32, last: PowerState },

    #[error("{path} is still locked after {attempts} attempt(s): {last}")]
    Locked { path: PathBuf, attempts: u32, last: String },

    #[error("mounting {image} failed (after stale-mount cleanup): {source}")]
    Mount {
        image: PathBuf,
        #[source]
        source: ImagingError,
    },

    #[error("{}", optimize_message(.path, .attempts, .last))]
    OptimizeFailed { path: PathBuf, attempts: u32, last: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

fn not_found_message(dir: &Path, found: &[PathBuf]) -> String {
    let listing = if found.is_empty() {
        "  (folder is empty or missing)".to_string()
    } else {
        found
            .iter()
            .map(|p| format!("  - {}", p.display()))
            .collect::<Vec<_>>()
            .join("\n")
    };
    format!("no .ffu file found in {}\nfound:\n{}", dir.display(), listing)
}

fn optimize_message(path: &Path, attempts: &u32, last: &str) -> String {
    format!(
        "optimizing {} failed after {} attempt(s): {}\n\
         Likely causes:\n\
         1. Antivirus or the search indexer is scanning the FFU or scratch folder (add an exclusion for the capture folder)\n\
         2. A stale DISM mount is holding the image (run `ffubuilder cleanup`)\n\
         3. Not enough free space on the scratch volume\n\
         4. An orphaned {}*.vhdx is still attached (detach it in Disk Management)",
        path.display(),
        attempts,
        last,
        ORPHAN_VHD_PREFIX
    )
}

// ============================================
// SCRATCH AREA
// ============================================

/// Optimize scratch directory. Created empty; removed when dropped, on
/// every exit path.
pub struct ScratchArea {
    path: PathBuf,
}

impl ScratchArea {
    pub fn create(path: &Path) -> std::io::Result<ScratchArea> {
        if path.exists() {
            fs::remove_dir_all(path)?;
        }
        fs::create_dir_all(path)?;
        Ok(ScratchArea { path: path.to_path_buf() })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for ScratchArea {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_dir_all(&self.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                log::warn!("Failed to remove scratch folder {}: {}", self.path.display(), e);
            }
        }
    }
}

// ============================================
// MOUNT GUARD
// ============================================
// Same contract as a WIM mount guard: once mounted, exactly one of
// finish() or Drop unmounts. finish() saves, falls back to discard,
// then falls back to a system-wide mount-point cleanup.

pub struct MountGuard<'a> {
    imaging: &'a dyn ImagingTool,
    mount_dir: PathBuf,
    finished: bool,
}

impl<'a> MountGuard<'a> {
    /// Mount `image` at `mount_dir`, retrying once after a stale-mount cleanup.
    pub fn mount(imaging: &'a dyn ImagingTool, image: &Path, mount_dir: &Path) -> Result<Self, CaptureError> {
        fs::create_dir_all(mount_dir)?;
        if let Err(first) = imaging.mount_image(image, 1, mount_dir) {
            log::warn!("Mount failed ({}); cleaning up stale mounts and retrying once", first);
            if let Err(e) = imaging.cleanup_mountpoints() {
                log::warn!("Mount-point cleanup failed: {}", e);
            }
            imaging.mount_image(image, 1, mount_dir).map_err(|source| CaptureError::Mount {
                image: image.to_path_buf(),
                source,
            })?;
        }
        Ok(MountGuard { imaging, mount_dir: mount_dir.to_path_buf(), finished: false })
    }

    pub fn mount_dir(&self) -> &Path {
        &self.mount_dir
    }

    /// Unmount saving changes. Returns `true` if the changes were saved.
    pub fn finish(mut self) -> bool {
        self.finished = true;
        match self.imaging.unmount_image(&self.mount_dir, UnmountMode::Commit) {
            Ok(()) => true,
            Err(save) => {
                log::warn!("Saving the mounted image failed: {}; discarding", save);
                if let Err(discard) = self.imaging.unmount_image(&self.mount_dir, UnmountMode::Discard) {
                    log::warn!("Discard failed too: {}; forcing mount-point cleanup", discard);
                    if let Err(e) = self.imaging.cleanup_mountpoints() {
                        log::error!("Mount-point cleanup failed: {}", e);
                    }
                }
                false
            }
        }
    }
}

impl Drop for MountGuard<'_> {
    fn drop(&mut self) {
        if !self.finished {
            log::warn!("Error path: discarding mount at {}", self.mount_dir.display());
            if let Err(discard) = self.imaging.unmount_image(&self.mount_dir, UnmountMode::Discard) {
                log::warn!("Discard failed: {}; forcing mount-point cleanup", discard);
                if let Err(e) = self.imaging.cleanup_mountpoints() {
                    log::error!("Mount-point cleanup failed: {}", e);
                }
            }
        }
    }
}

// ============================================
// HELPERS
// ============================================

/// Newest `.ffu` directly inside `dir`.
pub fn newest_ffu(dir: &Path) -> Result<PathBuf, CaptureError> {
    let entries: Vec<PathBuf> = WalkDir::new(dir)
        .min_depth(1)
        .max_depth(1)
        .into_iter()
        .filter_map(|e| e.ok())
        .map(|e| e.into_path())
        .collect();

    entries
        .iter()
        .filter(|p| {
            p.is_file()
                && p.extension()
                    .map(|e| e.eq_ignore_ascii_case("ffu"))
                    .unwrap_or(false)
        })
        .filter_map(|p| fs::metadata(p).and_then(|m| m.modified()).ok().map(|t| (t, p)))
        .max_by_key(|(t, _)| *t)
        .map(|(_, p)| p.clone())
        .ok_or_else(|| CaptureError::SourceNotFound { dir: dir.to_path_buf(), found: entries.clone() })
}

/// Detach and delete DISM's leftover `_ffumount*.vhd[x]` files. Returns how
/// many were removed.
pub fn remove_orphan_vhds(dirs: &[PathBuf], disks: &dyn DiskBackend) -> usize {
    let mut removed = 0;
    for dir in dirs.iter().filter(|d| d.is_dir()) {
        for entry in WalkDir::new(dir).min_depth(1).max_depth(1).into_iter().filter_map(|e| e.ok()) {
            let name = entry.file_name().to_string_lossy().to_lowercase();
            let is_orphan = name.starts_with(ORPHAN_VHD_PREFIX)
                && (name.ends_with(".vhd") || name.ends_with(".vhdx"));
            if !is_orphan || !entry.file_type().is_file() {
                continue;
            }
            // Most orphans are not attached; a failed detach is expected then.
            if let Err(e) = disks.detach(entry.path()) {
                log::debug!("Detaching {} failed: {}", entry.path().display(), e);
            }
            match fs::remove_file(entry.path()) {
                Ok(()) => {
                    log::info!("Removed orphaned {}", entry.path().display());
                    removed += 1;
                }
                Err(e) => log::warn!("Could not remove {}: {}", entry.path().display(), e),
            }
        }
    }
    removed
}

// ============================================
// ENGINE
// ============================================

pub struct CaptureEngine<'a> {
    imaging: &'a dyn ImagingTool,
    disks: &'a dyn DiskBackend,
    hypervisor: Option<&'a dyn HypervisorProvider>,
    readiness: &'a ServiceReadinessChecker<'a>,
    timings: &'a Timings,
}

impl<'a> CaptureEngine<'a> {
    pub fn new(
        imaging: &'a dyn ImagingTool,
        disks: &'a dyn DiskBackend,
        hypervisor: Option<&'a dyn HypervisorProvider>,
        readiness: &'a ServiceReadinessChecker<'a>,
        timings: &'a Timings,
    ) -> Self {
        CaptureEngine { imaging, disks, hypervisor, readiness, timings }
    }

    /// Run a capture job and return the finished FFU path.
    pub fn capture(&self, job: &CaptureJob) -> Result<PathBuf, CaptureError> {
        let ffu = match &job.source {
            CaptureSource::Disk { physical_drive, target, name } => {
                if target.exists() {
                    return Err(CaptureError::TargetExists(target.clone()));
                }
                if let Some(parent) = target.parent() {
                    fs::create_dir_all(parent)?;
                }
                self.readiness.ensure_ready();
                self.imaging
                    .capture_ffu(physical_drive, target, name)
                    .map_err(CaptureError::Capture)?;
                target.clone()
            }
            CaptureSource::VmOutput { vm, capture_dir } => {
                self.wait_for_power_off(vm)?;
                newest_ffu(capture_dir)?
            }
        };
        log::info!("Captured {}", ffu.display());

        log::info!("Waiting {}s for the new FFU to settle", self.timings.capture_settle.as_secs());
        std::thread::sleep(self.timings.capture_settle);
        self.wait_until_openable(&ffu)?;

        if let Some(drivers) = &job.drivers {
            self.inject_drivers(&ffu, drivers, &job.mount_dir)?;
        }
        if job.optimize {
            self.optimize(&ffu, &job.scratch_dir)?;
        }
        Ok(ffu)
    }

    fn wait_for_power_off(&self, vm: &str) -> Result<(), CaptureError> {
        let hypervisor = self.hypervisor.ok_or_else(|| HypervisorError::Tool {
            vm: vm.to_string(),
            operation: "power state",
            message: "no hypervisor provider configured".to_string(),
        })?;

        let mut polls = 0;
        loop {
            let state = hypervisor.power_state(vm)?;
            if state == PowerState::Off {
                log::info!("VM {} is off", vm);
                return Ok(());
            }
            polls += 1;
            if let Some(limit) = self.timings.vm_poll_limit {
                if polls >= limit {
                    return Err(CaptureError::VmPollLimit { vm: vm.to_string(), polls, last: state });
                }
            }
            log::debug!("VM {} is {:?}, waiting", vm, state);
            std::thread::sleep(self.timings.vm_poll_interval);
        }
    }

    /// Probe-open the file read/write until nothing else holds it.
    fn wait_until_openable(&self, path: &Path) -> Result<(), CaptureError> {
        let attempts = self.timings.lock_probe_attempts.max(1);
        let mut last = String::new();
        for attempt in 1..=attempts {
            match OpenOptions::new().read(true).write(true).open(path) {
                Ok(_) => return Ok(()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Err(CaptureError::Io(e)),
                Err(e) => {
                    log::warn!("{} is locked (check {}/{}): {}", path.display(), attempt, attempts, e);
                    last = e.to_string();
                }
            }
            if attempt < attempts {
                std::thread::sleep(self.timings.lock_probe_delay);
            }
        }
        Err(CaptureError::Locked { path: path.to_path_buf(), attempts, last })
    }

    /// Add drivers to the FFU. Only a mount that fails twice is fatal;
    /// driver and save failures are logged.
    pub fn inject_drivers(
        &self,
        ffu: &Path,
        drivers: &Path,
        mount_dir: &Path,
    ) -> Result<Option<DriverAddSummary>, CaptureError> {
        log::info!("Injecting drivers from {} into {}", drivers.display(), ffu.display());
        self.readiness.ensure_ready();

        let guard = MountGuard::mount(self.imaging, ffu, mount_dir)?;
        let summary = match self.imaging.add_drivers(guard.mount_dir(), drivers) {
            Ok(summary) => {
                log::info!("{} driver package(s) installed", summary.installed);
                for failed in &summary.failed {
                    log::warn!("Driver package failed: {}", failed);
                }
                Some(summary)
            }
            Err(e) => {
                log::warn!("Adding drivers failed: {}", e);
                None
            }
        };

        if !guard.finish() {
            log::warn!("Driver changes were not saved to {}", ffu.display());
        }
        if let Err(e) = fs::remove_dir(mount_dir) {
            log::debug!("Mount folder {} not removed: {}", mount_dir.display(), e);
        }
        Ok(summary)
    }

    /// Optimize with a fresh scratch area and full cleanup before every attempt.
    pub fn optimize(&self, ffu: &Path, scratch_dir: &Path) -> Result<(), CaptureError> {
        let attempts = self.timings.optimize_attempts.max(1);
        let mut last = String::new();

        for attempt in 1..=attempts {
            log::info!("Optimize attempt {}/{}", attempt, attempts);
            self.pre_optimize_cleanup(scratch_dir);

            let outcome = match ScratchArea::create(scratch_dir) {
                Ok(scratch) => self.wait_until_openable(ffu).map_err(|e| e.to_string()).and_then(|()| {
                    self.warn_if_low_space(ffu, scratch.path());
                    self.imaging.optimize_ffu(ffu, scratch.path()).map_err(|e| {
                        log::warn!("Optimize failed ({}): {}", e.classify(), e);
                        e.to_string()
                    })
                }),
                Err(e) => {
                    log::warn!("Could not prepare scratch folder {}: {}", scratch_dir.display(), e);
                    Err(format!("scratch folder {}: {}", scratch_dir.display(), e))
                }
            };

            match outcome {
                Ok(()) => {
                    log::info!("Optimized {}", ffu.display());
                    return Ok(());
                }
                Err(message) => last = message,
            }
            if attempt < attempts {
                std::thread::sleep(self.timings.optimize_backoff);
            }
        }

        Err(CaptureError::OptimizeFailed { path: ffu.to_path_buf(), attempts, last })
    }

    fn pre_optimize_cleanup(&self, scratch_dir: &Path) {
        if let Err(e) = self.imaging.cleanup_mountpoints() {
            log::warn!("Mount-point cleanup failed: {}", e);
        }
        remove_orphan_vhds(&[std::env::temp_dir(), scratch_dir.to_path_buf()], self.disks);
    }

    fn warn_if_low_space(&self, ffu: &Path, scratch: &Path) {
        let needed = fs::metadata(ffu).map(|m| m.len()).unwrap_or(0);
        if let Some(free) = volume::free_space(scratch) {
            if free < needed {
                log::warn!(
                    "Scratch volume has {} free; optimizing a {} FFU may run out of space",
                    volume::format_size(free),
                    volume::format_size(needed)
                );
            }
        }
    }
}
