// ============================================
// FFU Builder - disk/mod.rs
// ============================================
// Virtual disk provisioning.
//
// Two backends create and attach the virtual disk:
// - native:   Hyper-V / Storage PowerShell cmdlets (New-VHD, Mount-VHD)
// - diskpart: a generated diskpart script, output parsed as text
//
// Both sit behind the DiskBackend trait. DiskProvisioner drives whichever
// one it is given through the same steps: create, attach (bounded retry),
// locate the new disk (bounded polling, disambiguation), initialize GPT,
// strip default partitions. Every path ends with a GPT disk that has zero
// partitions, or an error carrying the candidate disks for triage.
// ============================================

pub mod diskpart;
pub mod native;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::config::Timings;

pub const MIB: u64 = 1024 * 1024;
pub const GIB: u64 = 1024 * MIB;

// ============================================
// GPT PARTITION TYPE GUIDS
// ============================================

pub const GPT_TYPE_ESP: &str = "{c12a7328-f81f-11d2-ba4b-00a0c93ec93b}";
pub const GPT_TYPE_MSR: &str = "{e3c9e316-0b5c-4db8-817d-f92df00215ae}";
pub const GPT_TYPE_BASIC_DATA: &str = "{ebd0a0a2-b9e5-4433-87c0-68b6b72699c7}";
pub const GPT_TYPE_RECOVERY: &str = "{de94bba4-06d1-4d40-a16a-bfd50179d6ac}";

// ============================================
// ENUMS
// ============================================

/// Which backend the operator asked for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum BackendChoice {
    /// Native when available and the file format allows it, else diskpart
    #[default]
    Auto,
    Native,
    Diskpart,
}

/// Which backend actually produced a disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Native,
    Diskpart,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendKind::Native => write!(f, "native"),
            BackendKind::Diskpart => write!(f, "diskpart"),
        }
    }
}

/// Resolve the operator's choice against what the host can do.
///
/// `.vhd` files are what non-Hyper-V hypervisors boot; the native path
/// creates them poorly, so they always go through diskpart.
pub fn choose_backend(choice: BackendChoice, disk_path: &Path, native_available: bool) -> BackendKind {
    let wants_vhd = disk_path
        .extension()
        .map(|e| e.eq_ignore_ascii_case("vhd"))
        .unwrap_or(false);

    match choice {
        BackendChoice::Diskpart => BackendKind::Diskpart,
        BackendChoice::Native if wants_vhd => {
            log::warn!("Native backend requested for a .vhd file; using diskpart instead");
            BackendKind::Diskpart
        }
        BackendChoice::Native => BackendKind::Native,
        BackendChoice::Auto if wants_vhd || !native_available => BackendKind::Diskpart,
        BackendChoice::Auto => BackendKind::Native,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionStyle {
    Raw,
    Gpt,
    Mbr,
    Unknown,
}

impl PartitionStyle {
    pub fn parse(text: &str) -> PartitionStyle {
        match text.trim().to_ascii_uppercase().as_str() {
            "RAW" => PartitionStyle::Raw,
            "GPT" => PartitionStyle::Gpt,
            "MBR" => PartitionStyle::Mbr,
            _ => PartitionStyle::Unknown,
        }
    }
}

/// Role of a partition in the Windows layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionKind {
    System,
    Msr,
    Os,
    Data,
    Recovery,
    Other,
}

impl PartitionKind {
    pub fn gpt_type(self) -> &'static str {
        match self {
            PartitionKind::System => GPT_TYPE_ESP,
            PartitionKind::Msr => GPT_TYPE_MSR,
            PartitionKind::Os | PartitionKind::Data | PartitionKind::Other => GPT_TYPE_BASIC_DATA,
            PartitionKind::Recovery => GPT_TYPE_RECOVERY,
        }
    }

    /// Best guess from a GPT type GUID. Basic-data partitions come back as
    /// `Other`; the layout code knows which one is the OS.
    pub fn from_gpt_type(guid: &str) -> PartitionKind {
        let guid = guid.trim().to_ascii_lowercase();
        if guid == GPT_TYPE_ESP {
            PartitionKind::System
        } else if guid == GPT_TYPE_MSR {
            PartitionKind::Msr
        } else if guid == GPT_TYPE_RECOVERY {
            PartitionKind::Recovery
        } else {
            PartitionKind::Other
        }
    }

    /// MSR is never given a drive letter.
    pub fn receives_letter(self) -> bool {
        self != PartitionKind::Msr
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileSystem {
    Fat32,
    Ntfs,
}

impl FileSystem {
    pub fn as_str(self) -> &'static str {
        match self {
            FileSystem::Fat32 => "FAT32",
            FileSystem::Ntfs => "NTFS",
        }
    }

    pub fn parse(text: &str) -> Option<FileSystem> {
        match text.trim().to_ascii_uppercase().as_str() {
            "FAT32" => Some(FileSystem::Fat32),
            "NTFS" => Some(FileSystem::Ntfs),
            _ => None,
        }
    }
}

// ============================================
// DATA STRUCTURES
// ============================================

/// What to create. Immutable once handed to the provisioner.
#[derive(Debug, Clone, PartialEq)]
pub struct VirtualDiskSpec {
    pub path: PathBuf,
    pub size_bytes: u64,
    pub sector_size: u32,
    pub dynamic: bool,
    pub backend: BackendChoice,
}

/// One disk as reported by an enumeration pass.
#[derive(Debug, Clone, PartialEq)]
pub struct DiskInfo {
    pub number: u32,
    pub size_bytes: u64,
    pub style: PartitionStyle,
    /// Backing file for virtual disks when the backend reports it
    pub location: Option<String>,
}

impl fmt::Display for DiskInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Disk {} ({} bytes, {:?}, location: {})",
            self.number,
            self.size_bytes,
            self.style,
            self.location.as_deref().unwrap_or("-")
        )
    }
}

/// A partition on the provisioned disk.
#[derive(Debug, Clone, PartialEq)]
pub struct PartitionHandle {
    pub disk_number: u32,
    pub number: u32,
    pub kind: PartitionKind,
    pub gpt_type: String,
    pub offset: u64,
    pub size_bytes: u64,
    /// `None` until formatted and lettered
    pub drive_letter: Option<char>,
    pub filesystem: Option<FileSystem>,
    pub label: Option<String>,
}

impl PartitionHandle {
    /// `X:\` for a lettered partition.
    pub fn root(&self) -> Option<PathBuf> {
        self.drive_letter.map(|l| PathBuf::from(format!("{}:\\", l)))
    }

    /// `X:` without the trailing slash, as bcdboot and reagentc want it.
    pub fn drive(&self) -> Option<String> {
        self.drive_letter.map(|l| format!("{}:", l))
    }
}

/// An attached virtual disk owned by the build.
#[derive(Debug, Clone, PartialEq)]
pub struct DiskHandle {
    /// OS-assigned index. Can change if the disk is detached and reattached.
    pub number: u32,
    pub path: PathBuf,
    pub size_bytes: u64,
    pub sector_size: u32,
    pub backend: BackendKind,
    pub style: PartitionStyle,
    pub partitions: Vec<PartitionHandle>,
}

impl DiskHandle {
    /// `\\.\PhysicalDriveN`, the device path DISM captures from.
    pub fn physical_drive(&self) -> String {
        format!(r"\\.\PhysicalDrive{}", self.number)
    }
}

// ============================================
// ERRORS
// ============================================

#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error("{tool} failed: {message}")]
    Tool { tool: &'static str, message: String },

    #[error("virtual disk file already exists: {0} (remove it or pick another path)")]
    AlreadyExists(PathBuf),

    #[error("attaching {path} timed out after {attempts} attempt(s): {last}")]
    AttachTimeout {
        path: PathBuf,
        attempts: u32,
        last: String,
    },

    #[error("{}", not_found_message(.path, .expected_size, .polls, .candidates))]
    DiskNotFound {
        path: PathBuf,
        expected_size: u64,
        polls: u32,
        candidates: Vec<DiskInfo>,
    },

    #[error("{}", init_message(.disk, .message, .candidates))]
    Initialize {
        disk: u32,
        message: String,
        candidates: Vec<DiskInfo>,
    },

    #[error("disk {disk} still has {remaining} partition(s) after clearing the default layout")]
    NotEmpty { disk: u32, remaining: usize },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProvisionError {
    /// Attach hiccups and tool failures are worth another try; everything
    /// else means the disk is in a state retrying won't fix.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ProvisionError::Tool { .. } | ProvisionError::AttachTimeout { .. }
        )
    }
}

fn candidate_lines(candidates: &[DiskInfo]) -> String {
    if candidates.is_empty() {
        return "  (no disks were enumerated)".to_string();
    }
    candidates
        .iter()
        .map(|d| format!("  - {}", d))
        .collect::<Vec<_>>()
        .join("\n")
}

fn not_found_message(path: &Path, expected_size: &u64, polls: &u32, candidates: &[DiskInfo]) -> String {
    format!(
        "attached {} but no matching disk appeared after {} enumeration pass(es)\n\
         expected: a disk of ~{} bytes backed by that file\n\
         found:\n{}",
        path.display(),
        polls,
        expected_size,
        candidate_lines(candidates)
    )
}

fn init_message(disk: &u32, message: &str, candidates: &[DiskInfo]) -> String {
    format!(
        "failed to initialize disk {} as GPT: {}\ndisks visible at the time:\n{}",
        disk,
        message,
        candidate_lines(candidates)
    )
}

// ============================================
// BACKEND CAPABILITY
// ============================================

/// What the provisioner needs from a virtual-disk backend.
pub trait DiskBackend {
    fn kind(&self) -> BackendKind;

    /// Create the backing file.
    fn create(&self, spec: &VirtualDiskSpec) -> Result<(), ProvisionError>;

    /// Attach the backing file. Returns the disk number if the tool reported one.
    fn attach(&self, spec: &VirtualDiskSpec) -> Result<Option<u32>, ProvisionError>;

    /// List every disk the OS currently sees.
    fn enumerate(&self) -> Result<Vec<DiskInfo>, ProvisionError>;

    fn initialize_gpt(&self, disk_number: u32) -> Result<(), ProvisionError>;

    fn partition_table(&self, disk_number: u32) -> Result<Vec<PartitionHandle>, ProvisionError>;

    fn remove_partition(&self, disk_number: u32, partition_number: u32) -> Result<(), ProvisionError>;

    /// Detach the disk backed by `path`.
    fn detach(&self, path: &Path) -> Result<(), ProvisionError>;
}

// ============================================
// PROVISIONER
// ============================================

/// True if `actual` is within tolerance of `expected`.
///
/// Fixed VHDs carry a footer, VHDX carries metadata, and diskpart reports
/// sizes rounded to whole GB, so an exact match never happens.
pub fn sizes_match(expected: u64, actual: u64) -> bool {
    let tolerance = (expected / 100).max(64 * MIB);
    expected.abs_diff(actual) <= tolerance
}

pub struct DiskProvisioner<'a> {
    backend: &'a dyn DiskBackend,
    timings: &'a Timings,
}

impl<'a> DiskProvisioner<'a> {
    pub fn new(backend: &'a dyn DiskBackend, timings: &'a Timings) -> Self {
        DiskProvisioner { backend, timings }
    }

    /// Create, attach and initialize a virtual disk.
    ///
    /// On success the disk is GPT and has no partitions. On failure the
    /// backing file may exist and be attached; detaching it is the
    /// CleanupCoordinator's job.
    pub fn create_disk(&self, spec: &VirtualDiskSpec) -> Result<DiskHandle, ProvisionError> {
        log::info!(
            "Creating {} virtual disk {} ({} bytes, {} byte sectors, {})",
            self.backend.kind(),
            spec.path.display(),
            spec.size_bytes,
            spec.sector_size,
            if spec.dynamic { "dynamic" } else { "fixed" }
        );

        if spec.path.exists() {
            return Err(ProvisionError::AlreadyExists(spec.path.clone()));
        }
        if let Some(parent) = spec.path.parent() {
            fs::create_dir_all(parent)?;
        }

        // Disks listed before the attach belong to the host and are never
        // candidates, whatever their size.
        let preexisting: Vec<u32> = self.backend.enumerate()?.iter().map(|d| d.number).collect();

        self.backend.create(spec)?;
        let reported = self.attach_with_retry(spec)?;
        let info = self.locate(spec, reported, &preexisting)?;
        log::info!("Virtual disk attached as disk {}", info.number);

        if info.style != PartitionStyle::Gpt {
            self.backend.initialize_gpt(info.number).map_err(|e| self.init_error(info.number, e))?;
        }

        // Initializing GPT (and diskpart's `convert gpt`) can leave a
        // default MSR partition behind. Start from an empty table.
        for partition in self.backend.partition_table(info.number)? {
            log::info!(
                "Removing default partition {} ({} bytes) from disk {}",
                partition.number,
                partition.size_bytes,
                info.number
            );
            self.backend.remove_partition(info.number, partition.number)?;
        }

        let remaining = self.backend.partition_table(info.number)?;
        if !remaining.is_empty() {
            return Err(ProvisionError::NotEmpty {
                disk: info.number,
                remaining: remaining.len(),
            });
        }

        let style = self
            .backend
            .enumerate()?
            .into_iter()
            .find(|d| d.number == info.number)
            .map(|d| d.style)
            .unwrap_or(PartitionStyle::Unknown);
        if style != PartitionStyle::Gpt {
            let message = format!("disk reports partition style {:?} after initialization", style);
            return Err(self.init_error(info.number, ProvisionError::Tool { tool: "initialize", message }));
        }

        Ok(DiskHandle {
            number: info.number,
            path: spec.path.clone(),
            size_bytes: info.size_bytes,
            sector_size: spec.sector_size,
            backend: self.backend.kind(),
            style,
            partitions: Vec::new(),
        })
    }

    fn attach_with_retry(&self, spec: &VirtualDiskSpec) -> Result<Option<u32>, ProvisionError> {
        let attempts = self.timings.attach_attempts.max(1);
        let mut last = String::new();

        for attempt in 1..=attempts {
            match self.backend.attach(spec) {
                Ok(number) => return Ok(number),
                Err(e) if e.is_retryable() => {
                    log::warn!("Attach attempt {}/{} failed: {}", attempt, attempts, e);
                    last = e.to_string();
                    if attempt < attempts {
                        std::thread::sleep(self.timings.attach_retry_delay);
                    }
                }
                Err(e) => return Err(e),
            }
        }

        Err(ProvisionError::AttachTimeout {
            path: spec.path.clone(),
            attempts,
            last,
        })
    }

    /// Find the freshly attached disk. Enumeration lags attach, so poll.
    fn locate(
        &self,
        spec: &VirtualDiskSpec,
        reported: Option<u32>,
        preexisting: &[u32],
    ) -> Result<DiskInfo, ProvisionError> {
        let polls = self.timings.enumerate_polls.max(1);
        let mut last_seen = Vec::new();

        let reported = match reported {
            Some(number) if preexisting.contains(&number) => {
                log::warn!("Attach reported disk {}, which was already present; ignoring it", number);
                None
            }
            other => other,
        };

        for poll in 1..=polls {
            match self.backend.enumerate() {
                Ok(disks) => {
                    if let Some(found) = pick_disk(&disks, spec, reported, preexisting) {
                        return Ok(found);
                    }
                    log::info!("Disk not visible yet (pass {}/{}, {} disk(s) listed)", poll, polls, disks.len());
                    last_seen = disks;
                }
                Err(e) => log::warn!("Disk enumeration pass {}/{} failed: {}", poll, polls, e),
            }
            if poll < polls {
                std::thread::sleep(self.timings.enumerate_delay);
            }
        }

        Err(ProvisionError::DiskNotFound {
            path: spec.path.clone(),
            expected_size: spec.size_bytes,
            polls,
            candidates: last_seen,
        })
    }

    fn init_error(&self, disk: u32, cause: ProvisionError) -> ProvisionError {
        let candidates = self.backend.enumerate().unwrap_or_default();
        ProvisionError::Initialize {
            disk,
            message: cause.to_string(),
            candidates,
        }
    }

    pub fn detach(&self, disk: &DiskHandle) -> Result<(), ProvisionError> {
        log::info!("Detaching disk {} ({})", disk.number, disk.path.display());
        self.backend.detach(&disk.path)
    }
}

/// Choose the disk that belongs to `spec` out of an enumeration pass.
///
/// Order of preference: the number the attach call reported, a disk whose
/// location is the backing file, then a size match (raw disks first, then
/// the highest number, since the newest attach gets the newest index).
/// Disks listed in `preexisting` (the pass taken before attach) only ever
/// qualify through the location match.
pub fn pick_disk(
    disks: &[DiskInfo],
    spec: &VirtualDiskSpec,
    reported: Option<u32>,
    preexisting: &[u32],
) -> Option<DiskInfo> {
    let fresh: Vec<&DiskInfo> = disks.iter().filter(|d| !preexisting.contains(&d.number)).collect();

    if let Some(number) = reported {
        if let Some(disk) = fresh.iter().find(|d| d.number == number) {
            return Some((*disk).clone());
        }
    }

    let wanted = spec.path.to_string_lossy().to_lowercase();
    if let Some(disk) = disks
        .iter()
        .find(|d| d.location.as_deref().map(|l| l.to_lowercase() == wanted).unwrap_or(false))
    {
        return Some(disk.clone());
    }

    let mut by_size: Vec<&DiskInfo> = fresh
        .into_iter()
        .filter(|d| sizes_match(spec.size_bytes, d.size_bytes))
        .filter(|d| matches!(d.style, PartitionStyle::Raw | PartitionStyle::Unknown | PartitionStyle::Gpt))
        .collect();

    match by_size.len() {
        0 => None,
        1 => Some(by_size[0].clone()),
        _ => {
            by_size.sort_by_key(|d| (d.style == PartitionStyle::Raw, d.number));
            let chosen = by_size[by_size.len() - 1];
            log::warn!(
                "{} disks match the expected size; choosing disk {}",
                by_size.len(),
                chosen.number
            );
            Some(chosen.clone())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeDiskBackend;
    use tempfile::TempDir;

    fn spec_in(dir: &TempDir) -> VirtualDiskSpec {
        VirtualDiskSpec {
            path: dir.path().join("VM").join("build.vhdx"),
            size_bytes: 50 * GIB,
            sector_size: 512,
            dynamic: true,
            backend: BackendChoice::Auto,
        }
    }

    fn disk(number: u32, size: u64, style: PartitionStyle) -> DiskInfo {
        DiskInfo { number, size_bytes: size, style, location: None }
    }

    #[test]
    fn test_choose_backend() {
        let vhdx = Path::new(r"C:\VM\a.vhdx");
        let vhd = Path::new(r"C:\VM\a.VHD");
        assert_eq!(choose_backend(BackendChoice::Auto, vhdx, true), BackendKind::Native);
        assert_eq!(choose_backend(BackendChoice::Auto, vhdx, false), BackendKind::Diskpart);
        assert_eq!(choose_backend(BackendChoice::Auto, vhd, true), BackendKind::Diskpart);
        assert_eq!(choose_backend(BackendChoice::Native, vhd, true), BackendKind::Diskpart);
        assert_eq!(choose_backend(BackendChoice::Diskpart, vhdx, true), BackendKind::Diskpart);
    }

    #[test]
    fn test_sizes_match_tolerates_overhead() {
        assert!(sizes_match(50 * GIB, 50 * GIB + 4 * MIB));
        assert!(sizes_match(50 * GIB, 50 * GIB - 200 * MIB));
        assert!(!sizes_match(50 * GIB, 60 * GIB));
        // Small disks still get the 64 MiB floor
        assert!(sizes_match(GIB, GIB + 60 * MIB));
    }

    #[test]
    fn test_pick_disk_prefers_reported_then_location_then_size() {
        let dir = TempDir::new().unwrap();
        let spec = spec_in(&dir);
        let mut located = disk(3, 10 * GIB, PartitionStyle::Gpt);
        located.location = Some(spec.path.to_string_lossy().to_uppercase());
        let disks = vec![
            disk(0, 500 * GIB, PartitionStyle::Gpt),
            disk(2, 50 * GIB, PartitionStyle::Raw),
            located,
        ];

        assert_eq!(pick_disk(&disks, &spec, Some(0), &[]).unwrap().number, 0);
        assert_eq!(pick_disk(&disks, &spec, Some(9), &[]).unwrap().number, 3);
        assert_eq!(pick_disk(&disks[..2], &spec, None, &[]).unwrap().number, 2);
        // A reported number that was already listed before attach is not ours
        assert_eq!(pick_disk(&disks, &spec, Some(0), &[0]).unwrap().number, 3);
    }

    #[test]
    fn test_pick_disk_disambiguates_same_size_candidates() {
        let dir = TempDir::new().unwrap();
        let spec = spec_in(&dir);
        let disks = vec![
            disk(1, 50 * GIB, PartitionStyle::Gpt),
            disk(2, 50 * GIB, PartitionStyle::Raw),
            disk(4, 50 * GIB, PartitionStyle::Gpt),
            disk(5, 50 * GIB, PartitionStyle::Mbr),
        ];
        // Raw wins over a higher-numbered GPT disk; MBR disks are never ours
        assert_eq!(pick_disk(&disks, &spec, None, &[]).unwrap().number, 2);
        assert!(pick_disk(&disks[3..], &spec, None, &[]).is_none());
        assert_eq!(pick_disk(&disks, &spec, None, &[1, 2]).unwrap().number, 4);
    }

    #[test]
    fn test_pick_disk_ignores_host_disks_of_the_same_size() {
        let dir = TempDir::new().unwrap();
        let spec = spec_in(&dir);
        let host = vec![disk(0, 500 * GIB, PartitionStyle::Gpt), disk(1, 50 * GIB, PartitionStyle::Gpt)];

        // The new disk 2 is not listed yet: nothing qualifies
        assert!(pick_disk(&host, &spec, Some(2), &[0, 1]).is_none());
        assert!(pick_disk(&host, &spec, None, &[0, 1]).is_none());

        let mut listed = host.clone();
        listed.push(disk(2, 50 * GIB, PartitionStyle::Raw));
        assert_eq!(pick_disk(&listed, &spec, None, &[0, 1]).unwrap().number, 2);
    }

    #[test]
    fn test_create_disk_polls_until_disk_appears_and_clears_defaults() {
        let dir = TempDir::new().unwrap();
        let spec = spec_in(&dir);
        let backend = FakeDiskBackend::new(BackendKind::Diskpart, 7);
        backend.hide_for_polls(3);
        backend.add_default_partition();
        let timings = Timings::immediate();

        let handle = DiskProvisioner::new(&backend, &timings).create_disk(&spec).unwrap();

        assert_eq!(handle.number, 7);
        assert_eq!(handle.style, PartitionStyle::Gpt);
        assert!(handle.partitions.is_empty());
        assert_eq!(backend.partition_count(), 0);
        assert!(backend.journal().contains(&"initialize_gpt 7".to_string()));
        assert!(backend.journal().iter().any(|c| c.starts_with("remove_partition 7")));
    }

    #[test]
    fn test_create_disk_leaves_same_size_host_disk_alone() {
        let dir = TempDir::new().unwrap();
        let spec = spec_in(&dir);
        let backend = FakeDiskBackend::new(BackendKind::Diskpart, 2);
        backend.add_host_disk(1, 50 * GIB, PartitionStyle::Gpt, 2);
        backend.report_no_number();
        backend.hide_location();
        backend.hide_for_polls(1);
        let timings = Timings::immediate();

        let handle = DiskProvisioner::new(&backend, &timings).create_disk(&spec).unwrap();

        assert_eq!(handle.number, 2);
        assert_eq!(backend.host_partition_count(1), 2);
        let journal = backend.journal();
        assert!(!journal.iter().any(|c| c.starts_with("remove_partition 1 ")), "{journal:?}");
        assert!(!journal.contains(&"initialize_gpt 1".to_string()));
        assert!(journal.contains(&"initialize_gpt 2".to_string()));
    }

    #[test]
    fn test_create_disk_retries_attach_then_times_out() {
        let dir = TempDir::new().unwrap();
        let spec = spec_in(&dir);
        let backend = FakeDiskBackend::new(BackendKind::Native, 1);
        backend.fail_attach(10);
        let timings = Timings::immediate();

        let err = DiskProvisioner::new(&backend, &timings).create_disk(&spec).unwrap_err();
        match err {
            ProvisionError::AttachTimeout { attempts, .. } => assert_eq!(attempts, timings.attach_attempts),
            other => panic!("unexpected error: {other}"),
        }
        let attaches = backend.journal().iter().filter(|c| c.starts_with("attach")).count();
        assert_eq!(attaches as u32, timings.attach_attempts);
    }

    #[test]
    fn test_disk_never_appearing_reports_candidates() {
        let dir = TempDir::new().unwrap();
        let spec = spec_in(&dir);
        let backend = FakeDiskBackend::new(BackendKind::Diskpart, 4);
        backend.hide_for_polls(u32::MAX);
        let timings = Timings::immediate();

        let err = DiskProvisioner::new(&backend, &timings).create_disk(&spec).unwrap_err();
        let message = err.to_string();
        assert!(matches!(err, ProvisionError::DiskNotFound { .. }));
        assert!(message.contains("Disk 0"), "diagnostics should list the system disk: {message}");
    }

    #[test]
    fn test_existing_backing_file_is_refused() {
        let dir = TempDir::new().unwrap();
        let spec = spec_in(&dir);
        fs::create_dir_all(spec.path.parent().unwrap()).unwrap();
        fs::write(&spec.path, b"old").unwrap();
        let backend = FakeDiskBackend::new(BackendKind::Native, 1);
        let timings = Timings::immediate();

        let err = DiskProvisioner::new(&backend, &timings).create_disk(&spec).unwrap_err();
        assert!(matches!(err, ProvisionError::AlreadyExists(_)));
        assert!(backend.journal().is_empty());
    }
}
