// ============================================
// FFU Builder - cleanup.rs
// ============================================
// Tears down everything a build acquired, on success and on failure.
//
// Every stage registers what it creates (attached disk, ISO mount, mounted
// image, temp folder) as it creates it. release_all() walks the list in
// reverse order, so things are undone in the opposite order they were
// done. A failed release is logged and the rest still run; cleanup never
// stops half way.
// ============================================

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use walkdir::WalkDir;

use crate::capture;
use crate::disk::{DiskBackend, ProvisionError};
use crate::dism::{ImagingError, ImagingTool, UnmountMode};
use crate::media::{MediaError, MediaManager};

#[derive(Debug, Clone, PartialEq)]
pub enum Resource {
    /// Backing file of an attached virtual disk
    VirtualDisk(PathBuf),
    /// Mount folder of a mounted image
    MountedImage(PathBuf),
    IsoMount(PathBuf),
    TempDir(PathBuf),
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Resource::VirtualDisk(p) => write!(f, "virtual disk {}", p.display()),
            Resource::MountedImage(p) => write!(f, "image mount {}", p.display()),
            Resource::IsoMount(p) => write!(f, "ISO {}", p.display()),
            Resource::TempDir(p) => write!(f, "folder {}", p.display()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceId(usize);

#[derive(Debug, Error)]
pub enum CleanupError {
    #[error("detaching failed: {0}")]
    Disk(#[from] ProvisionError),
    #[error("unmounting failed: {0}")]
    Image(#[from] ImagingError),
    #[error("dismounting failed: {0}")]
    Media(#[from] MediaError),
    #[error("removing failed: {0}")]
    Io(#[from] std::io::Error),
}

/// What release_all() did.
#[derive(Debug, Default)]
pub struct CleanupReport {
    pub released: usize,
    pub failures: Vec<String>,
}

pub struct CleanupCoordinator<'a> {
    disks: &'a dyn DiskBackend,
    imaging: &'a dyn ImagingTool,
    media: &'a dyn MediaManager,
    resources: Vec<(ResourceId, Resource)>,
    next_id: usize,
}

impl<'a> CleanupCoordinator<'a> {
    pub fn new(disks: &'a dyn DiskBackend, imaging: &'a dyn ImagingTool, media: &'a dyn MediaManager) -> Self {
        CleanupCoordinator { disks, imaging, media, resources: Vec::new(), next_id: 0 }
    }

    pub fn register(&mut self, resource: Resource) -> ResourceId {
        let id = ResourceId(self.next_id);
        self.next_id += 1;
        log::debug!("Tracking {}", resource);
        self.resources.push((id, resource));
        id
    }

    /// Release one resource early (e.g. detach the disk before the VM boots
    /// from it). On failure it stays registered for release_all().
    pub fn release(&mut self, id: ResourceId) -> Result<(), CleanupError> {
        let Some(index) = self.resources.iter().position(|(i, _)| *i == id) else {
            return Ok(());
        };
        self.release_resource(&self.resources[index].1)?;
        self.resources.remove(index);
        Ok(())
    }

    pub fn pending(&self) -> Vec<&Resource> {
        self.resources.iter().map(|(_, r)| r).collect()
    }

    /// Release everything still registered, newest first.
    pub fn release_all(&mut self) -> CleanupReport {
        let mut report = CleanupReport::default();
        while let Some((_, resource)) = self.resources.pop() {
            match self.release_resource(&resource) {
                Ok(()) => {
                    log::info!("Released {}", resource);
                    report.released += 1;
                }
                Err(e) => {
                    log::error!("Cleanup of {} failed: {}", resource, e);
                    report.failures.push(format!("{}: {}", resource, e));
                }
            }
        }
        report
    }

    fn release_resource(&self, resource: &Resource) -> Result<(), CleanupError> {
        match resource {
            Resource::VirtualDisk(path) => self.disks.detach(path)?,
            Resource::MountedImage(dir) => {
                // An absent or empty folder means the image was already unmounted.
                if !is_populated(dir) {
                    return Ok(());
                }
                if let Err(e) = self.imaging.unmount_image(dir, UnmountMode::Discard) {
                    log::warn!("Discarding mount at {} failed: {}; forcing mount-point cleanup", dir.display(), e);
                    self.imaging.cleanup_mountpoints()?;
                }
                if let Err(e) = fs::remove_dir(dir) {
                    log::debug!("Mount folder {} not removed: {}", dir.display(), e);
                }
            }
            Resource::IsoMount(iso) => self.media.dismount_iso(iso)?,
            Resource::TempDir(dir) => {
                if dir.exists() {
                    fs::remove_dir_all(dir)?;
                }
            }
        }
        Ok(())
    }
}

fn is_populated(dir: &Path) -> bool {
    fs::read_dir(dir).map(|mut entries| entries.next().is_some()).unwrap_or(false)
}

/// Clean up after a crashed or killed build: stale mount points, orphaned
/// `_ffumount` VHDs, and empty per-build mount folders under `work_dir`.
pub fn sweep_stale_state(work_dir: &Path, imaging: &dyn ImagingTool, disks: &dyn DiskBackend) -> CleanupReport {
    let mut report = CleanupReport::default();

    match imaging.cleanup_mountpoints() {
        Ok(()) => report.released += 1,
        Err(e) => report.failures.push(format!("mount-point cleanup: {}", e)),
    }

    report.released += capture::remove_orphan_vhds(&[std::env::temp_dir(), work_dir.to_path_buf()], disks);

    if work_dir.is_dir() {
        for entry in WalkDir::new(work_dir).min_depth(1).max_depth(1).into_iter().filter_map(|e| e.ok()) {
            let is_mount_dir = entry.file_type().is_dir()
                && entry.file_name().to_string_lossy().starts_with("Mount-");
            if !is_mount_dir {
                continue;
            }
            // remove_dir only succeeds on empty folders; a populated one is
            // still mounted and must not be deleted from under DISM.
            match fs::remove_dir(entry.path()) {
                Ok(()) => report.released += 1,
                Err(e) => report.failures.push(format!("{}: {}", entry.path().display(), e)),
            }
        }
    }
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::disk::BackendKind;
    use crate::testing::{FakeDiskBackend, FakeImaging, FakeMedia};
    use tempfile::TempDir;

    #[test]
    fn test_release_all_runs_in_reverse_and_survives_failures() {
        let disks = FakeDiskBackend::new(BackendKind::Native, 3);
        disks.fail_detach();
        let imaging = FakeImaging::new();
        let media = FakeMedia::new(vec![]);
        let tmp = TempDir::new().unwrap();
        let scratch = tmp.path().join("scratch");
        fs::create_dir_all(&scratch).unwrap();
        let mount = tmp.path().join("Mount");
        fs::create_dir_all(mount.join("Windows")).unwrap();

        let mut cleanup = CleanupCoordinator::new(&disks, &imaging, &media);
        cleanup.register(Resource::IsoMount(PathBuf::from(r"C:\isos\win.iso")));
        cleanup.register(Resource::VirtualDisk(PathBuf::from(r"C:\VM\build.vhdx")));
        cleanup.register(Resource::MountedImage(mount));
        cleanup.register(Resource::TempDir(scratch.clone()));

        let report = cleanup.release_all();

        assert_eq!(report.released, 3);
        assert_eq!(report.failures.len(), 1);
        assert!(report.failures[0].contains("build.vhdx"));
        assert!(!scratch.exists());
        assert!(cleanup.pending().is_empty());
        // ISO was registered first, so it is released last
        assert_eq!(media.journal().last().map(String::as_str), Some(r"dismount_iso C:\isos\win.iso"));
        assert_eq!(imaging.calls("unmount_image"), vec!["unmount_image Discard".to_string()]);
    }

    #[test]
    fn test_unmounted_image_folder_needs_no_unmount() {
        let disks = FakeDiskBackend::new(BackendKind::Native, 3);
        let imaging = FakeImaging::new();
        let media = FakeMedia::new(vec![]);
        let tmp = TempDir::new().unwrap();
        let empty = tmp.path().join("Mount-empty");
        fs::create_dir_all(&empty).unwrap();

        let mut cleanup = CleanupCoordinator::new(&disks, &imaging, &media);
        cleanup.register(Resource::MountedImage(tmp.path().join("Mount-gone")));
        cleanup.register(Resource::MountedImage(empty));

        assert_eq!(cleanup.release_all().released, 2);
        assert_eq!(imaging.count("unmount_image"), 0);
        assert_eq!(imaging.count("cleanup_mountpoints"), 0);
    }

    #[test]
    fn test_early_release_removes_resource() {
        let disks = FakeDiskBackend::new(BackendKind::Native, 3);
        let imaging = FakeImaging::new();
        let media = FakeMedia::new(vec![]);
        let mut cleanup = CleanupCoordinator::new(&disks, &imaging, &media);

        let id = cleanup.register(Resource::VirtualDisk(PathBuf::from(r"C:\VM\build.vhdx")));
        cleanup.release(id).unwrap();

        assert!(cleanup.pending().is_empty());
        assert_eq!(cleanup.release_all().released, 0);
        assert_eq!(disks.journal().iter().filter(|c| c.starts_with("detach")).count(), 1);
    }

    #[test]
    fn test_sweep_removes_orphans_and_empty_mount_dirs() {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join("_ffumount77.vhdx"), b"").unwrap();
        fs::create_dir_all(tmp.path().join("Mount-abc")).unwrap();
        fs::create_dir_all(tmp.path().join("Mount-busy").join("Windows")).unwrap();
        fs::create_dir_all(tmp.path().join("FFU")).unwrap();
        let imaging = FakeImaging::new();
        let disks = FakeDiskBackend::new(BackendKind::Native, 3);

        let report = sweep_stale_state(tmp.path(), &imaging, &disks);

        assert!(!tmp.path().join("_ffumount77.vhdx").exists());
        assert!(!tmp.path().join("Mount-abc").exists());
        assert!(tmp.path().join("Mount-busy").exists());
        assert!(tmp.path().join("FFU").exists());
        assert_eq!(report.failures.len(), 1);
        assert_eq!(imaging.count("cleanup_mountpoints"), 1);
        assert!(disks.journal().iter().any(|c| c.starts_with("detach") && c.contains("_ffumount77")));
    }
}
