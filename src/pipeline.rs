// ============================================
// FFU Builder - pipeline.rs
// ============================================
// One build, start to finish:
//
//   resolve source -> provision disk -> partition -> apply image
//   -> boot files -> recovery -> read OS version -> capture
//
// Every OS capability comes in through the Toolchain, so the same code
// runs against the real Windows tools and against the in-memory fakes in
// the tests. Whatever happens, the CleanupCoordinator releases what the
// stages registered before run() returns.
// ============================================

use std::path::{Path, PathBuf};
use time::OffsetDateTime;

use crate::capture::{CaptureEngine, CaptureJob, CaptureSource};
use crate::cleanup::{CleanupCoordinator, Resource};
use crate::config::BuildContext;
use crate::deploy::{DeploymentAttempt, ImageDeployer};
use crate::disk::{DiskBackend, DiskHandle, DiskProvisioner, ProvisionError};
use crate::dism::ImagingTool;
use crate::error::BuildError;
use crate::hypervisor::{HypervisorError, HypervisorProvider};
use crate::media::{self, MediaManager};
use crate::partition::{self, LayoutPolicy, PartitionBuilder, PartitionError, PartitionOps, PartitionSet};
use crate::registry::{self, OfflineRegistry, OsVersion};
use crate::services::{ServiceControl, ServiceReadinessChecker};

/// The OS capabilities a build runs against.
pub struct Toolchain<'a> {
    pub disks: &'a dyn DiskBackend,
    pub partitions: &'a dyn PartitionOps,
    pub imaging: &'a dyn ImagingTool,
    pub media: &'a dyn MediaManager,
    pub services: &'a dyn ServiceControl,
    pub registry: &'a dyn OfflineRegistry,
    pub hypervisor: Option<&'a dyn HypervisorProvider>,
}

#[derive(Debug)]
pub struct BuildOutcome {
    pub ffu: PathBuf,
    /// The build disk with its final partition table
    pub disk: DiskHandle,
    pub deployment: DeploymentAttempt,
    pub partitions: PartitionSet,
    pub os_version: Option<OsVersion>,
    /// Cleanup problems after an otherwise successful build
    pub cleanup_failures: Vec<String>,
}

/// Run a full build. Cleanup always runs before this returns.
pub fn run(ctx: &BuildContext, tools: &Toolchain) -> Result<BuildOutcome, BuildError> {
    log::info!("Build {} starting (work dir {})", ctx.build_id, ctx.work_dir.display());

    let mut cleanup = CleanupCoordinator::new(tools.disks, tools.imaging, tools.media);
    let result = run_stages(ctx, tools, &mut cleanup);

    let report = cleanup.release_all();
    if !report.failures.is_empty() {
        log::warn!("{} resource(s) could not be released:", report.failures.len());
        for failure in &report.failures {
            log::warn!("  - {}", failure);
        }
    }

    match result {
        Ok(mut outcome) => {
            log::info!("Build {} finished: {}", ctx.build_id, outcome.ffu.display());
            outcome.cleanup_failures = report.failures;
            Ok(outcome)
        }
        Err(e) => {
            log::error!("Build {} failed: {}", ctx.build_id, e);
            Err(e)
        }
    }
}

fn run_stages(
    ctx: &BuildContext,
    tools: &Toolchain,
    cleanup: &mut CleanupCoordinator,
) -> Result<BuildOutcome, BuildError> {
    let readiness = ServiceReadinessChecker::new(tools.services, &ctx.timings);

    // ============================================
    // SOURCE + DISK
    // ============================================
    let source = media::resolve_source(&ctx.image.path, ctx.image.index, tools.media)?;
    let iso = source
        .media
        .as_ref()
        .map(|m| cleanup.register(Resource::IsoMount(m.iso_path.clone())));

    let mut disk = match DiskProvisioner::new(tools.disks, &ctx.timings).create_disk(&ctx.disk) {
        Ok(disk) => disk,
        Err(e) => {
            // A half-provisioned disk may still be attached.
            if !matches!(e, ProvisionError::AlreadyExists(_)) && ctx.disk.path.exists() {
                cleanup.register(Resource::VirtualDisk(ctx.disk.path.clone()));
            }
            return Err(e.into());
        }
    };
    let disk_resource = cleanup.register(Resource::VirtualDisk(disk.path.clone()));

    // ============================================
    // PARTITIONS + IMAGE
    // ============================================
    let builder = PartitionBuilder::new(tools.partitions);
    let policy = LayoutPolicy {
        os_size: ctx.layout.os_size_bytes,
        data_partition: ctx.layout.data_partition,
        recovery: ctx.layout.recovery,
    };
    let mut partitions = builder.build_layout(&disk, &policy)?;
    let os_root = partitions.os.root().ok_or(PartitionError::NoRoot("OS"))?;
    let system_drive = partitions.system.drive().ok_or(PartitionError::NoRoot("System"))?;

    let deployment = ImageDeployer::new(tools.imaging, tools.media, &readiness, &ctx.timings).apply_image(
        &source,
        &os_root,
        ctx.image.compact,
    )?;
    if let Some(id) = iso {
        if let Err(e) = cleanup.release(id) {
            log::warn!("Could not dismount the source ISO yet: {}", e);
        }
    }

    let windows_dir = os_root.join("Windows");
    tools
        .imaging
        .make_bootable(&windows_dir, &system_drive)
        .map_err(|source| BuildError::Imaging { stage: "boot files", source })?;

    if policy.recovery {
        let winre = partition::winre_image_size(&os_root);
        if let Some(recovery) = builder.create_recovery(&disk, &mut partitions, winre)? {
            let re_dir = partition::place_winre(&partitions.os, &recovery)?;
            tools
                .imaging
                .register_recovery(&re_dir, &windows_dir)
                .map_err(|source| BuildError::Imaging { stage: "WinRE registration", source })?;
        }
    }

    disk.partitions = partitions.all().into_iter().cloned().collect();
    for part in &disk.partitions {
        log::info!(
            "Disk {} partition {}: {:?}, {} bytes",
            disk.number,
            part.number,
            part.kind,
            part.size_bytes
        );
    }

    // ============================================
    // NAME + CAPTURE
    // ============================================
    let os_version = read_version(ctx, tools, &os_root);
    let now = OffsetDateTime::now_local().unwrap_or_else(|_| OffsetDateTime::now_utc());
    let file_name = registry::ffu_file_name(&ctx.name_template, os_version.as_ref(), now);

    let capture_source = match &ctx.vm {
        Some(vm) => {
            let hypervisor = tools.hypervisor.ok_or_else(|| HypervisorError::Tool {
                vm: vm.name.clone(),
                operation: "start",
                message: "a VM is configured but no hypervisor provider is available".to_string(),
            })?;
            // The VM boots from the disk file; the host must let go of it first.
            cleanup.release(disk_resource).map_err(|source| BuildError::Cleanup {
                resource: disk.path.display().to_string(),
                source,
            })?;
            hypervisor.start_vm(&vm.name, vm.show_console)?;
            CaptureSource::VmOutput { vm: vm.name.clone(), capture_dir: ctx.capture_dir.clone() }
        }
        None => CaptureSource::Disk {
            physical_drive: disk.physical_drive(),
            target: ctx.capture_dir.join(&file_name),
            name: Path::new(&file_name)
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_else(|| file_name.clone()),
        },
    };

    let job = CaptureJob {
        source: capture_source,
        drivers: ctx.drivers.clone(),
        optimize: ctx.optimize,
        mount_dir: ctx.mount_dir(),
        scratch_dir: ctx.scratch_dir(),
    };
    cleanup.register(Resource::TempDir(job.scratch_dir.clone()));
    if job.drivers.is_some() {
        cleanup.register(Resource::MountedImage(job.mount_dir.clone()));
    }

    let ffu = CaptureEngine::new(tools.imaging, tools.disks, tools.hypervisor, &readiness, &ctx.timings)
        .capture(&job)?;

    Ok(BuildOutcome {
        ffu,
        disk,
        deployment,
        partitions,
        os_version,
        cleanup_failures: Vec::new(),
    })
}

/// Version metadata only feeds the file name; a failure is logged, not fatal.
fn read_version(ctx: &BuildContext, tools: &Toolchain, os_root: &Path) -> Option<OsVersion> {
    let id = ctx.build_id.simple().to_string();
    let mount_name = format!("FFU_{}", &id[..8]);
    match registry::read_os_version(tools.registry, os_root, &mount_name, ctx.timings.registry_settle) {
        Ok(version) => Some(version),
        Err(e) => {
            log::warn!("Could not read OS version from the offline registry: {}", e);
            None
        }
    }
}
