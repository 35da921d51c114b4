// ============================================
// FFU Builder - disk/native.rs
// ============================================
// The native backend: Hyper-V and Storage module cmdlets.
//
// Cmdlet output is turned into one `a|b|c|d` line per object (same trick
// the deploy module uses for Get-Disk) so parsing is a split on '|'
// instead of scraping PowerShell's table formatting.
// ============================================

use std::path::Path;

use super::{
    BackendKind, DiskBackend, DiskInfo, PartitionHandle, PartitionKind, PartitionStyle,
    ProvisionError, VirtualDiskSpec,
};
use crate::process::{self, ps_quote, CommandOutput};

/// Parse `Number|Size|PartitionStyle|Location` lines.
pub fn parse_disk_lines(stdout: &str) -> Vec<DiskInfo> {
    stdout
        .lines()
        .filter_map(|line| {
            let parts: Vec<&str> = line.trim().split('|').collect();
            if parts.len() < 3 {
                return None;
            }
            let location = parts.get(3).map(|l| l.trim()).filter(|l| !l.is_empty());
            Some(DiskInfo {
                number: parts[0].trim().parse().ok()?,
                size_bytes: parts[1].trim().parse().ok()?,
                style: PartitionStyle::parse(parts[2]),
                location: location.map(str::to_string),
            })
        })
        .collect()
}

/// Parse `PartitionNumber|GptType|Offset|Size|DriveLetter` lines.
pub fn parse_partition_lines(disk_number: u32, stdout: &str) -> Vec<PartitionHandle> {
    stdout
        .lines()
        .filter_map(|line| {
            let parts: Vec<&str> = line.trim().split('|').collect();
            if parts.len() < 4 {
                return None;
            }
            let gpt_type = parts[1].trim().to_lowercase();
            let drive_letter = parts
                .get(4)
                .and_then(|l| l.trim().chars().next())
                .filter(|c| c.is_ascii_alphabetic());
            Some(PartitionHandle {
                disk_number,
                number: parts[0].trim().parse().ok()?,
                kind: PartitionKind::from_gpt_type(&gpt_type),
                gpt_type,
                offset: parts[2].trim().parse().ok()?,
                size_bytes: parts[3].trim().parse().ok()?,
                drive_letter,
                filesystem: None,
                label: None,
            })
        })
        .collect()
}

/// Virtual disks through New-VHD / Mount-VHD.
pub struct NativeBackend;

impl NativeBackend {
    /// True if the Hyper-V module's New-VHD cmdlet is present.
    pub fn is_available() -> bool {
        match process::powershell("if (Get-Command New-VHD -ErrorAction SilentlyContinue) { 'yes' } else { 'no' }") {
            Ok(out) => out.success() && out.stdout.trim() == "yes",
            Err(_) => false,
        }
    }

    fn run(&self, what: &str, script: &str) -> Result<CommandOutput, ProvisionError> {
        let output = process::powershell(script).map_err(|e| ProvisionError::Tool {
            tool: "powershell",
            message: format!("{}: failed to start PowerShell: {}", what, e),
        })?;
        if !output.success() {
            return Err(ProvisionError::Tool {
                tool: "powershell",
                message: format!("{}: {}", what, output.combined()),
            });
        }
        Ok(output)
    }
}

impl DiskBackend for NativeBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Native
    }

    fn create(&self, spec: &VirtualDiskSpec) -> Result<(), ProvisionError> {
        let allocation = if spec.dynamic { "-Dynamic" } else { "-Fixed" };
        let script = format!(
            "New-VHD -Path {} -SizeBytes {} -LogicalSectorSizeBytes {} {} | Out-Null",
            ps_quote(&spec.path),
            spec.size_bytes,
            spec.sector_size,
            allocation
        );
        self.run("New-VHD", &script)?;
        Ok(())
    }

    fn attach(&self, spec: &VirtualDiskSpec) -> Result<Option<u32>, ProvisionError> {
        let script = format!(
            "(Mount-VHD -Path {} -Passthru | Get-Disk).Number",
            ps_quote(&spec.path)
        );
        let output = self.run("Mount-VHD", &script)?;
        Ok(output.stdout.trim().parse::<u32>().ok())
    }

    fn enumerate(&self) -> Result<Vec<DiskInfo>, ProvisionError> {
        let script = r#"Update-HostStorageCache; Get-Disk | ForEach-Object { "$($_.Number)|$($_.Size)|$($_.PartitionStyle)|$($_.Location)" }"#;
        let output = self.run("Get-Disk", script)?;
        Ok(parse_disk_lines(&output.stdout))
    }

    fn initialize_gpt(&self, disk_number: u32) -> Result<(), ProvisionError> {
        log::info!("Initializing disk {} as GPT", disk_number);
        let script = format!("Initialize-Disk -Number {} -PartitionStyle GPT", disk_number);
        self.run("Initialize-Disk", &script)?;
        Ok(())
    }

    fn partition_table(&self, disk_number: u32) -> Result<Vec<PartitionHandle>, ProvisionError> {
        let script = format!(
            r#"Get-Partition -DiskNumber {} -ErrorAction SilentlyContinue | ForEach-Object {{ "$($_.PartitionNumber)|$($_.GptType)|$($_.Offset)|$($_.Size)|$($_.DriveLetter)" }}"#,
            disk_number
        );
        let output = self.run("Get-Partition", &script)?;
        Ok(parse_partition_lines(disk_number, &output.stdout))
    }

    fn remove_partition(&self, disk_number: u32, partition_number: u32) -> Result<(), ProvisionError> {
        let script = format!(
            "Remove-Partition -DiskNumber {} -PartitionNumber {} -Confirm:$false",
            disk_number, partition_number
        );
        self.run("Remove-Partition", &script)?;
        Ok(())
    }

    fn detach(&self, path: &Path) -> Result<(), ProvisionError> {
        let script = format!("Dismount-VHD -Path {}", ps_quote(path));
        self.run("Dismount-VHD", &script)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::disk::{GPT_TYPE_MSR, GPT_TYPE_RECOVERY};

    #[test]
    fn test_parse_disk_lines() {
        let stdout = "0|512110190592|GPT|PCIROOT(0)#PCI(1D00)\r\n\
                      3|53687091200|RAW|C:\\FFUDevelopment\\VM\\build.vhdx\r\n\
                      garbage line\r\n";
        let disks = parse_disk_lines(stdout);
        assert_eq!(disks.len(), 2);
        assert_eq!(disks[1].number, 3);
        assert_eq!(disks[1].style, PartitionStyle::Raw);
        assert_eq!(disks[1].location.as_deref(), Some("C:\\FFUDevelopment\\VM\\build.vhdx"));
    }

    #[test]
    fn test_parse_partition_lines() {
        let stdout = format!(
            "1|{}|1048576|16777216|\n2|{}|17825792|1073741824|R\n",
            GPT_TYPE_MSR.to_uppercase(),
            GPT_TYPE_RECOVERY
        );
        let parts = parse_partition_lines(3, &stdout);
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[0].kind, PartitionKind::Msr);
        assert_eq!(parts[0].drive_letter, None);
        assert_eq!(parts[1].kind, PartitionKind::Recovery);
        assert_eq!(parts[1].drive_letter, Some('R'));
        assert_eq!(parts[1].offset, 17825792);
    }
}
