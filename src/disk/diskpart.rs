// ============================================
// FFU Builder - disk/diskpart.rs
// ============================================
// The text-protocol fallback backend.
//
// diskpart is driven with generated scripts (`diskpart /s script.txt`) and
// its human-readable output is scraped. That output is NOT stable across
// Windows releases, so the parsing lives here behind small functions with
// one entry per known format. A new output variant is one new entry in
// DISK_NUMBER_FORMATS; callers never change.
// ============================================

use std::path::{Path, PathBuf};
use thiserror::Error;

use super::{
    BackendKind, DiskBackend, DiskInfo, PartitionHandle, PartitionKind, PartitionStyle,
    ProvisionError, VirtualDiskSpec, GIB, MIB,
};
use crate::process;

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("no known disk-number pattern ({patterns}) matched diskpart output:\n{output}")]
    NoDiskNumber { patterns: String, output: String },
}

// ============================================
// DISK NUMBER EXTRACTION
// ============================================

type DiskNumberExtractor = fn(&str) -> Option<u32>;

/// Known spellings of the disk-number line, tried in order.
pub const DISK_NUMBER_FORMATS: &[(&str, DiskNumberExtractor)] = &[
    ("Associated disk#: N", associated_disk),
    ("Disk #: N", disk_hash),
    ("Disk : Disk N", disk_colon_disk),
];

/// Pull the disk number out of `detail vdisk` / `detail disk` output.
pub fn parse_disk_number(output: &str) -> Result<u32, ParseError> {
    for (name, extract) in DISK_NUMBER_FORMATS {
        if let Some(number) = extract(output) {
            log::debug!("diskpart disk number {} matched format \"{}\"", number, name);
            return Ok(number);
        }
    }

    Err(ParseError::NoDiskNumber {
        patterns: DISK_NUMBER_FORMATS
            .iter()
            .map(|(name, _)| *name)
            .collect::<Vec<_>>()
            .join(" | "),
        output: output.trim().to_string(),
    })
}

/// Leading digits of `text` after trimming, e.g. `"  12 "` -> 12.
fn leading_number(text: &str) -> Option<u32> {
    let digits: String = text.trim().chars().take_while(|c| c.is_ascii_digit()).collect();
    digits.parse().ok()
}

/// `Associated disk#: 1`
fn associated_disk(output: &str) -> Option<u32> {
    output.lines().find_map(|line| {
        let (key, value) = line.trim().split_once(':')?;
        if key.trim().eq_ignore_ascii_case("associated disk#") {
            leading_number(value)
        } else {
            None
        }
    })
}

/// `Disk #: 1`
fn disk_hash(output: &str) -> Option<u32> {
    output.lines().find_map(|line| {
        let (key, value) = line.trim().split_once(':')?;
        let key: String = key.chars().filter(|c| !c.is_whitespace()).collect();
        if key.eq_ignore_ascii_case("disk#") {
            leading_number(value)
        } else {
            None
        }
    })
}

/// `Disk : Disk 1`
fn disk_colon_disk(output: &str) -> Option<u32> {
    output.lines().find_map(|line| {
        let (key, value) = line.trim().split_once(':')?;
        if !key.trim().eq_ignore_ascii_case("disk") {
            return None;
        }
        let value = value.trim();
        let number = value.strip_prefix("Disk").or_else(|| value.strip_prefix("disk"))?;
        leading_number(number)
    })
}

// ============================================
// TABLE PARSING
// ============================================

/// `50 GB` style size followed by its unit, first occurrence only.
fn first_size(words: &[&str]) -> Option<u64> {
    words.windows(2).find_map(|pair| {
        let number = pair[0].parse::<u64>().ok()?;
        let unit = match pair[1] {
            "TB" => 1024 * GIB,
            "GB" => GIB,
            "MB" => MIB,
            "KB" => 1024,
            "B" => 1,
            _ => return None,
        };
        Some(number * unit)
    })
}

/// Parse `list disk` output.
///
/// ```text
///   Disk ###  Status         Size     Free     Dyn  Gpt
///   --------  -------------  -------  -------  ---  ---
///   Disk 0    Online          476 GB      0 B        *
///   Disk 1    Online           50 GB    50 GB
/// ```
///
/// The Gpt flag is read from the header's column position so a `*` in the
/// Dyn column is not mistaken for GPT.
pub fn parse_list_disk(output: &str) -> Vec<DiskInfo> {
    let gpt_column = output
        .lines()
        .find(|l| l.contains("###"))
        .and_then(|header| header.find("Gpt"));

    let mut disks = Vec::new();
    for raw in output.lines() {
        let line = raw.trim();
        if !line.starts_with("Disk ") || line.contains("###") {
            continue;
        }
        let Some(number) = leading_number(&line[5..]) else {
            continue;
        };

        let words: Vec<&str> = line.split_whitespace().collect();
        let size_bytes = first_size(&words).unwrap_or(0);

        let is_gpt = match gpt_column {
            Some(col) => raw.get(col..).map(|s| s.trim_start().starts_with('*')).unwrap_or(false),
            None => line.ends_with('*'),
        };
        let style = if is_gpt {
            PartitionStyle::Gpt
        } else if line.contains("Not Init") {
            PartitionStyle::Raw
        } else {
            PartitionStyle::Unknown
        };

        disks.push(DiskInfo {
            number,
            size_bytes,
            style,
            location: None,
        });
    }
    disks
}

/// Parse `list partition` output for one disk.
///
/// ```text
///   Partition ###  Type              Size     Offset
///   -------------  ----------------  -------  -------
///   Partition 1    Reserved            16 MB    17 KB
/// ```
pub fn parse_list_partition(disk_number: u32, output: &str) -> Vec<PartitionHandle> {
    let mut partitions = Vec::new();
    for line in output.lines() {
        let line = line.trim();
        if !line.starts_with("Partition ") || line.contains("###") {
            continue;
        }
        let Some(number) = leading_number(&line[10..]) else {
            continue;
        };
        let words: Vec<&str> = line.split_whitespace().collect();
        let kind = match words.get(2).copied() {
            Some("System") => PartitionKind::System,
            Some("Reserved") => PartitionKind::Msr,
            Some("Recovery") => PartitionKind::Recovery,
            _ => PartitionKind::Other,
        };
        let size_bytes = first_size(&words).unwrap_or(0);
        let offset = words
            .iter()
            .position(|w| matches!(*w, "TB" | "GB" | "MB" | "KB" | "B"))
            .and_then(|i| first_size(&words[i + 1..]))
            .unwrap_or(0);

        partitions.push(PartitionHandle {
            disk_number,
            number,
            kind,
            gpt_type: kind.gpt_type().to_string(),
            offset,
            size_bytes,
            drive_letter: None,
            filesystem: None,
            label: None,
        });
    }
    partitions
}

/// diskpart exits 0 even on some failures; these markers catch the rest.
fn output_has_error(output: &str) -> bool {
    output.contains("DiskPart has encountered an error")
        || output.contains("Virtual Disk Service error")
        || output.contains("DiskPart failed")
}

// ============================================
// SCRIPTS
// ============================================

fn quoted(path: &Path) -> String {
    format!("\"{}\"", path.display())
}

pub fn create_vdisk_script(spec: &VirtualDiskSpec) -> String {
    let size_mb = spec.size_bytes.div_ceil(MIB);
    let kind = if spec.dynamic { "expandable" } else { "fixed" };
    format!(
        "create vdisk file={} maximum={} type={}\nexit\n",
        quoted(&spec.path),
        size_mb,
        kind
    )
}

pub fn attach_vdisk_script(path: &Path) -> String {
    format!(
        "select vdisk file={}\nattach vdisk\ndetail vdisk\nexit\n",
        quoted(path)
    )
}

pub fn detach_vdisk_script(path: &Path) -> String {
    format!("select vdisk file={}\ndetach vdisk\nexit\n", quoted(path))
}

pub fn convert_gpt_script(disk_number: u32) -> String {
    format!("select disk {}\nconvert gpt\nexit\n", disk_number)
}

pub fn list_partition_script(disk_number: u32) -> String {
    format!("select disk {}\nlist partition\nexit\n", disk_number)
}

pub fn delete_partition_script(disk_number: u32, partition_number: u32) -> String {
    format!(
        "select disk {}\nselect partition {}\ndelete partition override\nexit\n",
        disk_number, partition_number
    )
}

// ============================================
// BACKEND
// ============================================

/// Virtual disks through diskpart. Works wherever diskpart exists, including
/// hosts without the Hyper-V module, and produces `.vhd` files other
/// hypervisors accept.
pub struct DiskpartBackend {
    script_dir: PathBuf,
}

impl DiskpartBackend {
    pub fn new(script_dir: PathBuf) -> Self {
        DiskpartBackend { script_dir }
    }

    fn run_script(&self, script: &str) -> Result<String, ProvisionError> {
        let output = process::diskpart(&self.script_dir, script).map_err(|e| ProvisionError::Tool {
            tool: "diskpart",
            message: format!("failed to run diskpart: {}", e),
        })?;

        if !output.success() || output_has_error(&output.stdout) {
            return Err(ProvisionError::Tool {
                tool: "diskpart",
                message: format!(
                    "exit code {}: {}",
                    output.code.unwrap_or(-1),
                    output.combined()
                ),
            });
        }
        Ok(output.stdout)
    }
}

impl DiskBackend for DiskpartBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Diskpart
    }

    fn create(&self, spec: &VirtualDiskSpec) -> Result<(), ProvisionError> {
        if spec.sector_size != 512 {
            log::warn!(
                "diskpart cannot set a {} byte logical sector size; the disk will use the default",
                spec.sector_size
            );
        }
        self.run_script(&create_vdisk_script(spec))?;
        Ok(())
    }

    fn attach(&self, spec: &VirtualDiskSpec) -> Result<Option<u32>, ProvisionError> {
        let output = self.run_script(&attach_vdisk_script(&spec.path))?;
        match parse_disk_number(&output) {
            Ok(number) => Ok(Some(number)),
            Err(e) => {
                // The disk may not be associated yet; the provisioner falls
                // back to enumeration and size matching.
                log::warn!("{}", e);
                Ok(None)
            }
        }
    }

    fn enumerate(&self) -> Result<Vec<DiskInfo>, ProvisionError> {
        let output = self.run_script("list disk\nexit\n")?;
        Ok(parse_list_disk(&output))
    }

    fn initialize_gpt(&self, disk_number: u32) -> Result<(), ProvisionError> {
        log::info!("Converting disk {} to GPT (diskpart)", disk_number);
        self.run_script(&convert_gpt_script(disk_number))?;
        Ok(())
    }

    fn partition_table(&self, disk_number: u32) -> Result<Vec<PartitionHandle>, ProvisionError> {
        match self.run_script(&list_partition_script(disk_number)) {
            Ok(output) => Ok(parse_list_partition(disk_number, &output)),
            // An empty disk makes `list partition` print "There are no
            // partitions on this disk to show." and some builds exit non-zero.
            Err(ProvisionError::Tool { message, .. }) if message.contains("no partitions") => Ok(Vec::new()),
            Err(e) => Err(e),
        }
    }

    fn remove_partition(&self, disk_number: u32, partition_number: u32) -> Result<(), ProvisionError> {
        self.run_script(&delete_partition_script(disk_number, partition_number))?;
        Ok(())
    }

    fn detach(&self, path: &Path) -> Result<(), ProvisionError> {
        self.run_script(&detach_vdisk_script(path))?;
        Ok(())
    }
}
