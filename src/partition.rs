// ============================================
// FFU Builder - partition.rs
// ============================================
// Builds the GPT layout Windows boots from:
//
//   1. System   (ESP, FAT32, 260 MB)
//   2. MSR      (16 MB, never formatted, never lettered)
//   3. Windows  (NTFS, fixed size or the rest of the disk)
//   4. Data     (NTFS, optional, rest of the disk)
//   5. Recovery (NTFS, optional, sized from the WinRE image after apply)
//
// ORDERING RULE: format first, assign the drive letter second, then
// re-read the partition to confirm the letter stuck. A letter on a RAW
// partition makes Explorer pop "You need to format the disk before you can
// use it", which blocks an unattended build.
// ============================================

use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::disk::{
    native, DiskHandle, FileSystem, PartitionHandle, PartitionKind, GIB, MIB,
};
use crate::process::{self, CommandOutput};

// ============================================
// SIZES
// ============================================

pub const SYSTEM_PARTITION_SIZE: u64 = 260 * MIB;
pub const MSR_PARTITION_SIZE: u64 = 16 * MIB;

/// Free space WinRE needs inside the Recovery partition.
pub const WINRE_FREE_SPACE: u64 = 250 * MIB;

/// NTFS metadata headroom on top of WinRE + free space.
pub const RECOVERY_FS_OVERHEAD: u64 = 32 * MIB;

/// Smallest OS partition we will create when it takes "the rest".
pub const MIN_OS_PARTITION_SIZE: u64 = 16 * GIB;

/// Leading 1 MiB alignment gap plus the backup GPT at the end of the disk.
const LAYOUT_RESERVE: u64 = 2 * MIB;

/// GPT attributes for Recovery: required (0x1) + no drive letter (0x8000...).
pub const RECOVERY_GPT_ATTRIBUTES: u64 = 0x8000_0000_0000_0001;

/// Where a deployed image keeps WinRE.
pub const WINRE_RELATIVE_PATH: &str = r"Windows\System32\Recovery\winre.wim";

// ============================================
// TYPES
// ============================================

/// Which optional partitions to create.
#[derive(Debug, Clone, Default)]
pub struct LayoutPolicy {
    /// `None`: OS partition takes all remaining space.
    pub os_size: Option<u64>,
    pub data_partition: bool,
    pub recovery: bool,
}

/// One `New-Partition` call.
#[derive(Debug, Clone, PartialEq)]
pub struct PartitionRequest {
    pub kind: PartitionKind,
    /// `None`: use the maximum free size.
    pub size: Option<u64>,
    pub gpt_attributes: Option<u64>,
}

/// The finished layout.
#[derive(Debug, Clone)]
pub struct PartitionSet {
    pub system: PartitionHandle,
    pub msr: PartitionHandle,
    pub os: PartitionHandle,
    pub data: Option<PartitionHandle>,
    pub recovery: Option<PartitionHandle>,
}

impl PartitionSet {
    pub fn all(&self) -> Vec<&PartitionHandle> {
        let mut parts = vec![&self.system, &self.msr, &self.os];
        parts.extend(self.data.iter());
        parts.extend(self.recovery.iter());
        parts
    }
}

#[derive(Debug, Error)]
pub enum PartitionError {
    #[error("layout needs {needed} bytes but disk {disk} has {available}")]
    InsufficientSpace { disk: u32, needed: u64, available: u64 },

    #[error("{operation} failed: {message}")]
    Tool { operation: String, message: String },

    #[error("formatting partition {partition} on disk {disk} as {filesystem} failed: {message}")]
    Format {
        disk: u32,
        partition: u32,
        filesystem: &'static str,
        message: String,
    },

    #[error("partition {partition} on disk {disk} has no drive letter after assignment")]
    LetterNotAssigned { disk: u32, partition: u32 },

    #[error("{0} partition has no drive letter")]
    NoRoot(&'static str),

    #[error("moving WinRE into the Recovery partition failed: {0}")]
    Winre(#[from] std::io::Error),
}

// ============================================
// STORAGE CAPABILITY
// ============================================

/// Partition operations on an attached disk.
pub trait PartitionOps {
    fn create(&self, disk_number: u32, request: &PartitionRequest) -> Result<PartitionHandle, PartitionError>;

    fn format(&self, partition: &PartitionHandle, filesystem: FileSystem, label: &str) -> Result<(), PartitionError>;

    fn assign_letter(&self, partition: &PartitionHandle) -> Result<(), PartitionError>;

    /// Re-read a partition (letter, filesystem, size) from the OS.
    fn get(&self, disk_number: u32, partition_number: u32) -> Result<PartitionHandle, PartitionError>;

    fn resize(&self, partition: &PartitionHandle, new_size: u64) -> Result<(), PartitionError>;
}

// ============================================
// BUILDER
// ============================================

/// Recovery partition size for a WinRE image of `winre_size` bytes,
/// rounded up to whole sectors.
pub fn recovery_size(winre_size: u64, sector_size: u32) -> u64 {
    let raw = winre_size + WINRE_FREE_SPACE + RECOVERY_FS_OVERHEAD;
    raw.next_multiple_of(sector_size as u64)
}

/// Size of `<os>\Windows\System32\Recovery\winre.wim`, if the image has one.
pub fn winre_image_size(os_root: &Path) -> Option<u64> {
    fs::metadata(os_root.join(WINRE_RELATIVE_PATH)).ok().map(|m| m.len())
}

pub struct PartitionBuilder<'a> {
    ops: &'a dyn PartitionOps,
}

impl<'a> PartitionBuilder<'a> {
    pub fn new(ops: &'a dyn PartitionOps) -> Self {
        PartitionBuilder { ops }
    }

    /// Create System, MSR, OS and (optionally) Data on an empty disk.
    ///
    /// Recovery is created later by [`create_recovery`](Self::create_recovery)
    /// because its size depends on the WinRE image inside the applied OS.
    /// A failure here leaves whatever was created in place; the disk is
    /// thrown away by cleanup, not repaired.
    pub fn build_layout(&self, disk: &DiskHandle, policy: &LayoutPolicy) -> Result<PartitionSet, PartitionError> {
        let fixed = SYSTEM_PARTITION_SIZE + MSR_PARTITION_SIZE + LAYOUT_RESERVE;
        let os_min = policy.os_size.unwrap_or(MIN_OS_PARTITION_SIZE);
        let data_min = if policy.data_partition { GIB } else { 0 };
        let needed = fixed + os_min + data_min;
        if needed > disk.size_bytes {
            return Err(PartitionError::InsufficientSpace {
                disk: disk.number,
                needed,
                available: disk.size_bytes,
            });
        }

        log::info!("Creating partition layout on disk {}", disk.number);

        let system = self.ops.create(
            disk.number,
            &PartitionRequest {
                kind: PartitionKind::System,
                size: Some(SYSTEM_PARTITION_SIZE),
                gpt_attributes: None,
            },
        )?;
        let system = self.format_then_letter(system, FileSystem::Fat32, "System")?;

        let msr = self.ops.create(
            disk.number,
            &PartitionRequest {
                kind: PartitionKind::Msr,
                size: Some(MSR_PARTITION_SIZE),
                gpt_attributes: None,
            },
        )?;
        log::info!("  MSR partition {} created (no filesystem, no letter)", msr.number);

        let os = self.ops.create(
            disk.number,
            &PartitionRequest {
                kind: PartitionKind::Os,
                size: policy.os_size,
                gpt_attributes: None,
            },
        )?;
        let os = self.format_then_letter(os, FileSystem::Ntfs, "Windows")?;

        let data = if policy.data_partition {
            let data = self.ops.create(
                disk.number,
                &PartitionRequest {
                    kind: PartitionKind::Data,
                    size: None,
                    gpt_attributes: None,
                },
            )?;
            Some(self.format_then_letter(data, FileSystem::Ntfs, "Data")?)
        } else {
            None
        };

        Ok(PartitionSet {
            system,
            msr,
            os,
            data,
            recovery: None,
        })
    }

    /// Carve a Recovery partition out of the donor (Data if present, else OS).
    ///
    /// Returns `Ok(None)` without touching the disk when there is no WinRE
    /// image to host.
    pub fn create_recovery(
        &self,
        disk: &DiskHandle,
        set: &mut PartitionSet,
        winre_size: Option<u64>,
    ) -> Result<Option<PartitionHandle>, PartitionError> {
        let Some(winre_size) = winre_size else {
            log::info!("No WinRE image on the OS partition; skipping Recovery partition");
            return Ok(None);
        };

        let size = recovery_size(winre_size, disk.sector_size);
        let donor = set.data.as_mut().unwrap_or(&mut set.os);
        if donor.size_bytes <= size {
            return Err(PartitionError::InsufficientSpace {
                disk: disk.number,
                needed: size,
                available: donor.size_bytes,
            });
        }

        let sector = disk.sector_size as u64;
        let new_size = (donor.size_bytes - size) / sector * sector;
        log::info!(
            "Shrinking partition {} from {} to {} bytes for a {} byte Recovery partition (WinRE {} bytes)",
            donor.number,
            donor.size_bytes,
            new_size,
            size,
            winre_size
        );
        self.ops.resize(donor, new_size)?;
        let kind = donor.kind;
        let mut refreshed = self.ops.get(disk.number, donor.number)?;
        refreshed.kind = kind;
        refreshed.filesystem = refreshed.filesystem.or(donor.filesystem);
        *donor = refreshed;

        let recovery = self.ops.create(
            disk.number,
            &PartitionRequest {
                kind: PartitionKind::Recovery,
                size: Some(size),
                gpt_attributes: Some(RECOVERY_GPT_ATTRIBUTES),
            },
        )?;
        let recovery = self.format_then_letter(recovery, FileSystem::Ntfs, "Recovery")?;
        set.recovery = Some(recovery.clone());
        Ok(Some(recovery))
    }

    /// Format, assign a letter, then re-read to confirm the letter stuck.
    fn format_then_letter(
        &self,
        partition: PartitionHandle,
        filesystem: FileSystem,
        label: &str,
    ) -> Result<PartitionHandle, PartitionError> {
        self.ops.format(&partition, filesystem, label)?;
        self.ops.assign_letter(&partition)?;

        let mut refreshed = self.ops.get(partition.disk_number, partition.number)?;
        let Some(letter) = refreshed.drive_letter else {
            return Err(PartitionError::LetterNotAssigned {
                disk: partition.disk_number,
                partition: partition.number,
            });
        };

        refreshed.kind = partition.kind;
        refreshed.filesystem = refreshed.filesystem.or(Some(filesystem));
        refreshed.label = refreshed.label.or_else(|| Some(label.to_string()));
        log::info!(
            "  {} partition {} formatted {} and mounted at {}:",
            label,
            refreshed.number,
            filesystem.as_str(),
            letter
        );
        Ok(refreshed)
    }
}

/// Move winre.wim from the OS partition into `<recovery>\Recovery\WindowsRE`.
///
/// Returns the WindowsRE folder for `reagentc /setreimage`.
pub fn place_winre(os: &PartitionHandle, recovery: &PartitionHandle) -> Result<PathBuf, PartitionError> {
    let os_root = os.root().ok_or(PartitionError::NoRoot("OS"))?;
    let re_root = recovery.root().ok_or(PartitionError::NoRoot("Recovery"))?;

    let source = os_root.join(WINRE_RELATIVE_PATH);
    let target_dir = re_root.join("Recovery").join("WindowsRE");
    fs::create_dir_all(&target_dir)?;
    let target = target_dir.join("winre.wim");

    // Different volumes, so rename would fail; copy then delete.
    fs::copy(&source, &target)?;
    fs::remove_file(&source)?;
    log::info!("Moved WinRE to {}", target.display());
    Ok(target_dir)
}

// ============================================
// STORAGE CMDLET IMPLEMENTATION
// ============================================

/// Parse `PartitionNumber|GptType|Offset|Size|DriveLetter|FileSystem|Label`.
pub fn parse_partition_detail(disk_number: u32, stdout: &str) -> Option<PartitionHandle> {
    let line = stdout.lines().find(|l| l.contains('|'))?;
    let mut handle = native::parse_partition_lines(disk_number, line).into_iter().next()?;
    let parts: Vec<&str> = line.trim().split('|').collect();
    handle.filesystem = parts.get(5).and_then(|f| FileSystem::parse(f));
    handle.label = parts.get(6).map(|l| l.trim().to_string()).filter(|l| !l.is_empty());
    Some(handle)
}

/// Partition operations through the Storage module (works for disks
/// attached by either backend). GPT attribute bits need diskpart.
pub struct StorageCmdlets {
    script_dir: PathBuf,
}

impl StorageCmdlets {
    pub fn new(script_dir: PathBuf) -> Self {
        StorageCmdlets { script_dir }
    }

    fn run(&self, operation: &str, script: &str) -> Result<CommandOutput, PartitionError> {
        let output = process::powershell(script).map_err(|e| PartitionError::Tool {
            operation: operation.to_string(),
            message: format!("failed to start PowerShell: {}", e),
        })?;
        if !output.success() {
            return Err(PartitionError::Tool {
                operation: operation.to_string(),
                message: output.combined(),
            });
        }
        Ok(output)
    }

    fn set_gpt_attributes(&self, partition: &PartitionHandle, attributes: u64) -> Result<(), PartitionError> {
        let script = format!(
            "select disk {}\nselect partition {}\ngpt attributes=0x{:016x}\nexit\n",
            partition.disk_number, partition.number, attributes
        );
        let output = process::diskpart(&self.script_dir, &script).map_err(|e| PartitionError::Tool {
            operation: "diskpart gpt attributes".to_string(),
            message: e.to_string(),
        })?;
        if !output.success() {
            return Err(PartitionError::Tool {
                operation: "diskpart gpt attributes".to_string(),
                message: output.combined(),
            });
        }
        Ok(())
    }
}

const PARTITION_FIELDS: &str =
    r#""$($_.PartitionNumber)|$($_.GptType)|$($_.Offset)|$($_.Size)|$($_.DriveLetter)""#;

impl PartitionOps for StorageCmdlets {
    fn create(&self, disk_number: u32, request: &PartitionRequest) -> Result<PartitionHandle, PartitionError> {
        let size = match request.size {
            Some(bytes) => format!("-Size {}", bytes),
            None => "-UseMaximumSize".to_string(),
        };
        let script = format!(
            "New-Partition -DiskNumber {} {} -GptType '{}' | ForEach-Object {{ {} }}",
            disk_number,
            size,
            request.kind.gpt_type(),
            PARTITION_FIELDS
        );
        let output = self.run("New-Partition", &script)?;
        let mut handle = native::parse_partition_lines(disk_number, &output.stdout)
            .into_iter()
            .next()
            .ok_or_else(|| PartitionError::Tool {
                operation: "New-Partition".to_string(),
                message: format!("unexpected output: {}", output.stdout.trim()),
            })?;
        handle.kind = request.kind;

        if let Some(attributes) = request.gpt_attributes {
            self.set_gpt_attributes(&handle, attributes)?;
        }
        Ok(handle)
    }

    fn format(&self, partition: &PartitionHandle, filesystem: FileSystem, label: &str) -> Result<(), PartitionError> {
        let script = format!(
            "Get-Partition -DiskNumber {} -PartitionNumber {} | Format-Volume -FileSystem {} -NewFileSystemLabel '{}' -Force -Confirm:$false | Out-Null",
            partition.disk_number,
            partition.number,
            filesystem.as_str(),
            label.replace('\'', "''")
        );
        self.run("Format-Volume", &script).map_err(|e| PartitionError::Format {
            disk: partition.disk_number,
            partition: partition.number,
            filesystem: filesystem.as_str(),
            message: e.to_string(),
        })?;
        Ok(())
    }

    fn assign_letter(&self, partition: &PartitionHandle) -> Result<(), PartitionError> {
        let script = format!(
            "Add-PartitionAccessPath -DiskNumber {} -PartitionNumber {} -AssignDriveLetter",
            partition.disk_number, partition.number
        );
        self.run("Add-PartitionAccessPath", &script)?;
        Ok(())
    }

    fn get(&self, disk_number: u32, partition_number: u32) -> Result<PartitionHandle, PartitionError> {
        let script = format!(
            r#"Get-Partition -DiskNumber {} -PartitionNumber {} | ForEach-Object {{ $v = $_ | Get-Volume -ErrorAction SilentlyContinue; "$($_.PartitionNumber)|$($_.GptType)|$($_.Offset)|$($_.Size)|$($_.DriveLetter)|$($v.FileSystem)|$($v.FileSystemLabel)" }}"#,
            disk_number, partition_number
        );
        let output = self.run("Get-Partition", &script)?;
        parse_partition_detail(disk_number, &output.stdout).ok_or_else(|| PartitionError::Tool {
            operation: "Get-Partition".to_string(),
            message: format!("unexpected output: {}", output.stdout.trim()),
        })
    }

    fn resize(&self, partition: &PartitionHandle, new_size: u64) -> Result<(), PartitionError> {
        let script = format!(
            "Resize-Partition -DiskNumber {} -PartitionNumber {} -Size {}",
            partition.disk_number, partition.number, new_size
        );
        self.run("Resize-Partition", &script)?;
        Ok(())
    }
}
