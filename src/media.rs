// ============================================
// FFU Builder - media.rs
// ============================================
// Source media handling: the WIM/ESD we apply from, and the ISO it may
// live inside.
//
// An image inside a mounted ISO is only valid while that ISO stays mounted
// at the same root. Windows auto-dismounts ISOs and USB sticks get pulled,
// so the source is re-validated before every use and can be remounted
// mid-deploy (see deploy.rs).
// ============================================

use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::process::{self, ps_quote};

/// Bytes read by the validation probe.
const PROBE_BYTES: usize = 4096;

#[derive(Debug, Error)]
pub enum MediaError {
    #[error("image file not found: {0}")]
    NotFound(PathBuf),

    #[error("image file {path} exists but cannot be read: {source}")]
    Unreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("image file {0} is empty")]
    Empty(PathBuf),

    #[error("source media {0} is no longer mounted")]
    Detached(PathBuf),

    #[error("source media {iso} moved from {expected} to {actual}")]
    RootChanged {
        iso: PathBuf,
        expected: PathBuf,
        actual: PathBuf,
    },

    #[error("no sources\\install.wim or sources\\install.esd under {0}")]
    NoInstallImage(PathBuf),

    #[error("unsupported image type {0} (expected .wim, .esd or .iso)")]
    UnsupportedExtension(PathBuf),

    #[error("{operation} failed: {message}")]
    Tool { operation: String, message: String },
}

impl MediaError {
    /// The source media went away (as opposed to a bad file).
    pub fn media_gone(&self) -> bool {
        matches!(self, MediaError::Detached(_) | MediaError::RootChanged { .. })
    }
}

/// The ISO an image was found in.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceMedia {
    pub iso_path: PathBuf,
    pub mount_root: PathBuf,
}

/// What the deployer applies from.
#[derive(Debug, Clone, PartialEq)]
pub struct ImageSource {
    pub path: PathBuf,
    pub index: u32,
    pub media: Option<SourceMedia>,
}

/// ISO mount operations.
pub trait MediaManager {
    /// Mount an ISO and return its root (`E:\`).
    fn mount_iso(&self, iso: &Path) -> Result<PathBuf, MediaError>;

    /// Where the ISO is mounted right now, `None` if it isn't.
    fn mount_root(&self, iso: &Path) -> Result<Option<PathBuf>, MediaError>;

    fn dismount_iso(&self, iso: &Path) -> Result<(), MediaError>;
}

fn same_root(a: &Path, b: &Path) -> bool {
    let norm = |p: &Path| p.to_string_lossy().trim_end_matches(['\\', '/']).to_lowercase();
    norm(a) == norm(b)
}

/// Open the file and actually read from it. `exists()` alone says yes for
/// files on media that has gone away but whose directory entry is cached.
pub fn probe_read(path: &Path) -> Result<(), MediaError> {
    let mut file = File::open(path).map_err(|source| match source.kind() {
        std::io::ErrorKind::NotFound => MediaError::NotFound(path.to_path_buf()),
        _ => MediaError::Unreadable { path: path.to_path_buf(), source },
    })?;
    let mut buffer = [0u8; PROBE_BYTES];
    let read = file.read(&mut buffer).map_err(|source| MediaError::Unreadable {
        path: path.to_path_buf(),
        source,
    })?;
    if read == 0 {
        return Err(MediaError::Empty(path.to_path_buf()));
    }
    Ok(())
}

impl ImageSource {
    /// Check the source is usable right now.
    pub fn validate(&self, media: &dyn MediaManager) -> Result<(), MediaError> {
        if let Some(parent) = &self.media {
            match media.mount_root(&parent.iso_path)? {
                None => return Err(MediaError::Detached(parent.iso_path.clone())),
                Some(actual) if !same_root(&actual, &parent.mount_root) => {
                    return Err(MediaError::RootChanged {
                        iso: parent.iso_path.clone(),
                        expected: parent.mount_root.clone(),
                        actual,
                    })
                }
                Some(_) => {}
            }
        }
        probe_read(&self.path)
    }
}

/// `sources\install.wim`, else `sources\install.esd`, under a media root.
pub fn locate_install_image(root: &Path) -> Result<PathBuf, MediaError> {
    let sources = root.join("sources");
    ["install.wim", "install.esd"]
        .iter()
        .map(|name| sources.join(name))
        .find(|p| p.is_file())
        .ok_or_else(|| MediaError::NoInstallImage(root.to_path_buf()))
}

/// Turn the configured image path into an [`ImageSource`], mounting the ISO
/// if that is what was given. The caller owns the mount from then on.
pub fn resolve_source(path: &Path, index: u32, media: &dyn MediaManager) -> Result<ImageSource, MediaError> {
    let ext = path
        .extension()
        .map(|e| e.to_string_lossy().to_lowercase())
        .unwrap_or_default();

    match ext.as_str() {
        "wim" | "esd" => Ok(ImageSource { path: path.to_path_buf(), index, media: None }),
        "iso" => {
            log::info!("ISO detected, mounting {} to find install.wim", path.display());
            let root = media.mount_iso(path)?;
            log::info!("ISO mounted at {}", root.display());
            match locate_install_image(&root) {
                Ok(image) => {
                    log::info!("Found {}", image.display());
                    Ok(ImageSource {
                        path: image,
                        index,
                        media: Some(SourceMedia { iso_path: path.to_path_buf(), mount_root: root }),
                    })
                }
                Err(e) => {
                    if let Err(dismount) = media.dismount_iso(path) {
                        log::warn!("Failed to dismount {}: {}", path.display(), dismount);
                    }
                    Err(e)
                }
            }
        }
        _ => Err(MediaError::UnsupportedExtension(path.to_path_buf())),
    }
}

/// Dismount and remount the parent ISO, wait for the volume to settle,
/// then find the image again (the drive letter may have changed).
pub fn remount_source(
    source: &ImageSource,
    media: &dyn MediaManager,
    settle: Duration,
) -> Result<ImageSource, MediaError> {
    let Some(parent) = &source.media else {
        return Ok(source.clone());
    };

    log::warn!("Remounting source media {}", parent.iso_path.display());
    if let Err(e) = media.dismount_iso(&parent.iso_path) {
        log::info!("Dismount before remount failed (already gone?): {}", e);
    }
    let root = media.mount_iso(&parent.iso_path)?;
    std::thread::sleep(settle);

    let relative = source.path.strip_prefix(&parent.mount_root).ok();
    let image = match relative.map(|r| root.join(r)).filter(|p| p.is_file()) {
        Some(path) => path,
        None => locate_install_image(&root)?,
    };
    if !same_root(&root, &parent.mount_root) {
        log::info!("Source media moved from {} to {}", parent.mount_root.display(), root.display());
    }

    Ok(ImageSource {
        path: image,
        index: source.index,
        media: Some(SourceMedia { iso_path: parent.iso_path.clone(), mount_root: root }),
    })
}

// ============================================
// POWERSHELL IMPLEMENTATION
// ============================================

/// Mount-DiskImage / Get-DiskImage / Dismount-DiskImage.
pub struct DiskImageCmdlets;

fn letter_to_root(stdout: &str) -> Option<PathBuf> {
    stdout
        .lines()
        .filter_map(|l| l.trim().chars().next())
        .find(|c| c.is_ascii_alphabetic())
        .map(|c| PathBuf::from(format!("{}:\\", c)))
}

impl MediaManager for DiskImageCmdlets {
    fn mount_iso(&self, iso: &Path) -> Result<PathBuf, MediaError> {
        let script = format!(
            "(Mount-DiskImage -ImagePath {} -PassThru | Get-Volume).DriveLetter",
            ps_quote(iso)
        );
        let output = process::powershell(&script).map_err(|e| MediaError::Tool {
            operation: "Mount-DiskImage".into(),
            message: e.to_string(),
        })?;
        if !output.success() {
            return Err(MediaError::Tool {
                operation: "Mount-DiskImage".into(),
                message: output.combined(),
            });
        }
        letter_to_root(&output.stdout).ok_or_else(|| MediaError::Tool {
            operation: "Mount-DiskImage".into(),
            message: "ISO mounted but no drive letter assigned".into(),
        })
    }

    fn mount_root(&self, iso: &Path) -> Result<Option<PathBuf>, MediaError> {
        let script = format!(
            "$i = Get-DiskImage -ImagePath {}; if ($i.Attached) {{ ($i | Get-Volume).DriveLetter }}",
            ps_quote(iso)
        );
        let output = process::powershell(&script).map_err(|e| MediaError::Tool {
            operation: "Get-DiskImage".into(),
            message: e.to_string(),
        })?;
        if !output.success() {
            return Ok(None);
        }
        Ok(letter_to_root(&output.stdout))
    }

    fn dismount_iso(&self, iso: &Path) -> Result<(), MediaError> {
        log::info!("Dismounting ISO {}", iso.display());
        let script = format!("Dismount-DiskImage -ImagePath {} | Out-Null", ps_quote(iso));
        let output = process::powershell(&script).map_err(|e| MediaError::Tool {
            operation: "Dismount-DiskImage".into(),
            message: e.to_string(),
        })?;
        if !output.success() {
            return Err(MediaError::Tool {
                operation: "Dismount-DiskImage".into(),
                message: output.combined(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeMedia;
    use std::fs;
    use tempfile::TempDir;

    fn media_root(dir: &TempDir, name: &str, file: &str) -> PathBuf {
        let root = dir.path().join(name);
        fs::create_dir_all(root.join("sources")).unwrap();
        fs::write(root.join("sources").join(file), b"MSWIM\0\0\0").unwrap();
        root
    }

    #[test]
    fn test_probe_read() {
        let dir = TempDir::new().unwrap();
        let empty = dir.path().join("empty.wim");
        fs::write(&empty, b"").unwrap();
        assert!(matches!(probe_read(&empty), Err(MediaError::Empty(_))));
        assert!(matches!(probe_read(&dir.path().join("nope.wim")), Err(MediaError::NotFound(_))));

        let good = dir.path().join("install.wim");
        fs::write(&good, b"MSWIM").unwrap();
        assert!(probe_read(&good).is_ok());
    }

    #[test]
    fn test_locate_prefers_wim_over_esd() {
        let dir = TempDir::new().unwrap();
        let root = media_root(&dir, "E", "install.esd");
        assert!(locate_install_image(&root).unwrap().ends_with("install.esd"));
        fs::write(root.join("sources").join("install.wim"), b"x").unwrap();
        assert!(locate_install_image(&root).unwrap().ends_with("install.wim"));
        assert!(locate_install_image(dir.path()).is_err());
    }

    #[test]
    fn test_resolve_plain_wim_does_not_mount() {
        let media = FakeMedia::new(vec![]);
        let source = resolve_source(Path::new(r"C:\images\install.wim"), 3, &media).unwrap();
        assert!(source.media.is_none());
        assert_eq!(source.index, 3);
        assert!(media.journal().is_empty());
    }

    #[test]
    fn test_resolve_iso_and_detect_detach() {
        let dir = TempDir::new().unwrap();
        let root = media_root(&dir, "E", "install.wim");
        let media = FakeMedia::new(vec![root.clone()]);
        let iso = dir.path().join("win11.iso");

        let source = resolve_source(&iso, 1, &media).unwrap();
        assert_eq!(source.path, root.join("sources").join("install.wim"));
        assert!(source.validate(&media).is_ok());

        media.detach_all();
        let err = source.validate(&media).unwrap_err();
        assert!(err.media_gone());
    }

    #[test]
    fn test_resolve_iso_without_image_dismounts() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("E");
        fs::create_dir_all(&root).unwrap();
        let media = FakeMedia::new(vec![root]);
        let iso = dir.path().join("blank.iso");

        assert!(matches!(resolve_source(&iso, 1, &media), Err(MediaError::NoInstallImage(_))));
        assert!(media.journal().iter().any(|e| e.starts_with("dismount_iso")));
    }

    #[test]
    fn test_remount_follows_new_drive_letter() {
        let dir = TempDir::new().unwrap();
        let first = media_root(&dir, "E", "install.wim");
        let second = media_root(&dir, "F", "install.wim");
        let media = FakeMedia::new(vec![first.clone(), second.clone()]);
        let iso = dir.path().join("win11.iso");

        let source = resolve_source(&iso, 6, &media).unwrap();
        let moved = remount_source(&source, &media, Duration::ZERO).unwrap();

        assert_eq!(moved.path, second.join("sources").join("install.wim"));
        assert_eq!(moved.index, 6);
        assert_eq!(moved.media.as_ref().unwrap().mount_root, second);
        assert!(moved.validate(&media).is_ok());
        // The old source now points at the wrong root
        assert!(matches!(source.validate(&media), Err(MediaError::RootChanged { .. })));
    }
}
