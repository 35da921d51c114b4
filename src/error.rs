// ============================================
// FFU Builder - error.rs
// ============================================
// One error type for a whole build, wrapping each stage's typed error,
// plus the operator checklist printed when a build aborts.
// ============================================

use thiserror::Error;

use crate::capture::CaptureError;
use crate::cleanup::CleanupError;
use crate::config::ConfigError;
use crate::deploy::DeployError;
use crate::disk::ProvisionError;
use crate::dism::{FailureClass, ImagingError};
use crate::hypervisor::HypervisorError;
use crate::media::MediaError;
use crate::partition::PartitionError;

#[derive(Debug, Error)]
pub enum BuildError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("disk provisioning failed: {0}")]
    Provision(#[from] ProvisionError),

    #[error("partitioning failed: {0}")]
    Partition(#[from] PartitionError),

    #[error("source media: {0}")]
    Media(#[from] MediaError),

    #[error("deployment failed: {0}")]
    Deploy(#[from] DeployError),

    #[error("{stage} failed: {source}")]
    Imaging {
        stage: &'static str,
        #[source]
        source: ImagingError,
    },

    #[error("VM: {0}")]
    Hypervisor(#[from] HypervisorError),

    #[error("capture failed: {0}")]
    Capture(#[from] CaptureError),

    #[error("releasing {resource} failed: {source}")]
    Cleanup {
        resource: String,
        #[source]
        source: CleanupError,
    },
}

impl BuildError {
    /// Likely causes and what to do about them, most likely first.
    pub fn remediation(&self) -> Vec<String> {
        let mut steps: Vec<&str> = Vec::new();
        match self {
            BuildError::Config(_) => {
                steps.push("Fix the reported config values and run `ffubuilder check --config <file>`");
            }
            BuildError::Provision(ProvisionError::AlreadyExists(_)) => {
                steps.push("Delete the old virtual disk file or point disk.path somewhere else");
            }
            BuildError::Provision(ProvisionError::DiskNotFound { .. } | ProvisionError::Initialize { .. }) => {
                steps.push("Compare the candidate disks listed above with Disk Management");
                steps.push("Detach leftover virtual disks from earlier builds");
                steps.push("Try the other backend (disk.backend = \"diskpart\" or \"native\")");
            }
            BuildError::Provision(_) => {
                steps.push("Run as Administrator; creating and attaching virtual disks needs elevation");
                steps.push("Check the Virtual Disk service (vds) is not disabled");
            }
            BuildError::Partition(PartitionError::InsufficientSpace { .. }) => {
                steps.push("Increase disk.size_bytes or reduce layout.os_size_bytes");
            }
            BuildError::Partition(_) => {
                steps.push("Close Explorer windows on the new volumes and retry");
                steps.push("Check the Storage management provider service (smphost) is not disabled");
            }
            BuildError::Media(_) => {
                steps.push("Check image.path points to a readable .wim, .esd or .iso");
                steps.push("Copy the image off removable media to a local disk");
            }
            BuildError::Deploy(DeployError::ServerCompact { .. }) => {
                steps.push("Set image.compact = false for server images");
            }
            BuildError::Deploy(DeployError::RetriesExhausted { class: FailureClass::Disconnected, .. }) => {
                steps.push("The source media kept disconnecting; copy the image to a local disk");
                steps.push("Use a different USB port or re-download the ISO");
            }
            BuildError::Deploy(_) => {
                steps.push("Verify the image index exists (dism /Get-ImageInfo)");
                steps.push("Check the target disk has room for the expanded image");
                steps.push("Read %WINDIR%\\Logs\\DISM\\dism.log for the underlying error");
            }
            BuildError::Imaging { .. } => {
                steps.push("Read %WINDIR%\\Logs\\DISM\\dism.log for the underlying error");
                steps.push("Run `ffubuilder cleanup --work-dir <dir>` and retry");
            }
            BuildError::Hypervisor(_) => {
                steps.push("Check the VM exists and Hyper-V is enabled (Get-VM)");
            }
            BuildError::Capture(CaptureError::SourceNotFound { .. }) => {
                steps.push("Check the VM's capture media wrote to capture.dir");
            }
            BuildError::Cleanup { .. } => {
                steps.push("Detach the virtual disk in Disk Management before starting the VM");
            }
            BuildError::Capture(_) => {
                steps.push("Exclude the capture folder from antivirus scanning");
                steps.push("Run `ffubuilder cleanup --work-dir <dir>` to clear stale mounts");
                steps.push("Check free space on the capture volume");
            }
        }
        steps.push("Run elevated (as Administrator)");
        steps.into_iter().map(str::to_string).collect()
    }
}
