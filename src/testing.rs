// ============================================
// FFU Builder - testing.rs
// ============================================
// In-memory stand-ins for every OS capability, for unit tests.
//
// Each fake records what it was asked to do as "op args" lines in a
// journal, so tests can assert on call order and counts. Failures are
// scripted up front (fail_apply, fail_mount, ...) and consumed in order.
// ============================================

use std::cell::{Cell, RefCell};
use std::collections::{HashMap, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};

use crate::disk::{
    BackendKind, DiskBackend, DiskInfo, FileSystem, PartitionHandle, PartitionKind, PartitionStyle,
    ProvisionError, VirtualDiskSpec, GIB, MIB,
};
use crate::dism::{DriverAddSummary, ImageInfo, ImagingError, ImagingTool, UnmountMode};
use crate::hypervisor::{HypervisorError, HypervisorProvider, PowerState};
use crate::media::{MediaError, MediaManager};
use crate::partition::{PartitionError, PartitionOps, PartitionRequest};
use crate::registry::{OfflineRegistry, OsVersion, RegistryError};
use crate::services::{Expectation, ServiceControl, ServiceError, ServiceState, StartType, IMAGING_SERVICES};

#[derive(Default)]
struct Journal(RefCell<Vec<String>>);

impl Journal {
    fn log(&self, entry: String) {
        self.0.borrow_mut().push(entry);
    }

    fn entries(&self) -> Vec<String> {
        self.0.borrow().clone()
    }

    fn calls(&self, op: &str) -> Vec<String> {
        self.0
            .borrow()
            .iter()
            .filter(|e| e.split_whitespace().next() == Some(op))
            .cloned()
            .collect()
    }
}

/// DISM failing with ERROR_NOT_READY, as when an ISO drops out mid-apply.
pub fn disconnect_error() -> ImagingError {
    ImagingError::Failed {
        operation: "DISM /Apply-Image".into(),
        code: Some(0x8007_0015_u32 as i32),
        output: "Error: 0x80070015\n\nThe device is not ready.".into(),
    }
}

/// DISM failing with a sharing violation.
pub fn lock_error() -> ImagingError {
    ImagingError::Failed {
        operation: "DISM /Optimize-FFU".into(),
        code: Some(0x8007_0020_u32 as i32),
        output: "Error: 0x80070020\n\nThe process cannot access the file because it is being used by another process."
            .into(),
    }
}

// ============================================
// DISK BACKEND
// ============================================

#[derive(Default)]
struct DiskState {
    spec: Option<VirtualDiskSpec>,
    attached: bool,
    style: Option<PartitionStyle>,
    partitions: Vec<PartitionHandle>,
    hidden_polls: u32,
    attach_failures: u32,
    default_partition: bool,
    detach_fails: bool,
    no_number: bool,
    no_location: bool,
    host_disks: Vec<(DiskInfo, Vec<PartitionHandle>)>,
    orphans: Vec<PathBuf>,
}

fn fake_partition(disk_number: u32, number: u32, kind: PartitionKind, offset: u64, size_bytes: u64) -> PartitionHandle {
    PartitionHandle {
        disk_number,
        number,
        kind,
        gpt_type: kind.gpt_type().to_string(),
        offset,
        size_bytes,
        drive_letter: None,
        filesystem: None,
        label: None,
    }
}

/// One virtual disk plus a 500 GB system disk 0 that is always listed.
/// Extra host disks can be added; they are listed from the start.
pub struct FakeDiskBackend {
    kind: BackendKind,
    number: u32,
    state: RefCell<DiskState>,
    journal: Journal,
}

impl FakeDiskBackend {
    pub fn new(kind: BackendKind, number: u32) -> Self {
        FakeDiskBackend { kind, number, state: RefCell::default(), journal: Journal::default() }
    }

    /// Leave the new disk out of the next `polls` enumerations.
    pub fn hide_for_polls(&self, polls: u32) {
        self.state.borrow_mut().hidden_polls = polls;
    }

    /// Initializing GPT leaves a default MSR partition behind.
    pub fn add_default_partition(&self) {
        self.state.borrow_mut().default_partition = true;
    }

    pub fn fail_attach(&self, times: u32) {
        self.state.borrow_mut().attach_failures = times;
    }

    pub fn fail_detach(&self) {
        self.state.borrow_mut().detach_fails = true;
    }

    /// Attach succeeds but reports no disk number.
    pub fn report_no_number(&self) {
        self.state.borrow_mut().no_number = true;
    }

    /// Enumeration lists the virtual disk without its backing-file location.
    pub fn hide_location(&self) {
        self.state.borrow_mut().no_location = true;
    }

    pub fn add_host_disk(&self, number: u32, size_bytes: u64, style: PartitionStyle, partitions: u32) {
        let table = (1..=partitions)
            .map(|n| fake_partition(number, n, PartitionKind::Data, n as u64 * GIB, GIB))
            .collect();
        let info = DiskInfo { number, size_bytes, style, location: None };
        self.state.borrow_mut().host_disks.push((info, table));
    }

    /// A leftover disk file that is still attached until detached by path.
    pub fn attach_orphan(&self, path: &Path) {
        self.state.borrow_mut().orphans.push(path.to_path_buf());
    }

    pub fn attached_orphans(&self) -> Vec<PathBuf> {
        self.state.borrow().orphans.clone()
    }

    pub fn host_partition_count(&self, number: u32) -> usize {
        self.state
            .borrow()
            .host_disks
            .iter()
            .find(|(d, _)| d.number == number)
            .map(|(_, table)| table.len())
            .unwrap_or(0)
    }

    pub fn partition_count(&self) -> usize {
        self.state.borrow().partitions.len()
    }

    pub fn journal(&self) -> Vec<String> {
        self.journal.entries()
    }
}

impl DiskBackend for FakeDiskBackend {
    fn kind(&self) -> BackendKind {
        self.kind
    }

    fn create(&self, spec: &VirtualDiskSpec) -> Result<(), ProvisionError> {
        self.journal.log(format!("create {}", spec.path.display()));
        self.state.borrow_mut().spec = Some(spec.clone());
        Ok(())
    }

    fn attach(&self, spec: &VirtualDiskSpec) -> Result<Option<u32>, ProvisionError> {
        self.journal.log(format!("attach {}", spec.path.display()));
        let mut state = self.state.borrow_mut();
        if state.attach_failures > 0 {
            state.attach_failures -= 1;
            return Err(ProvisionError::Tool { tool: "fake", message: "attach timed out".into() });
        }
        state.attached = true;
        state.style.get_or_insert(PartitionStyle::Raw);
        Ok(if state.no_number { None } else { Some(self.number) })
    }

    fn enumerate(&self) -> Result<Vec<DiskInfo>, ProvisionError> {
        self.journal.log("enumerate".into());
        let mut state = self.state.borrow_mut();
        let mut disks = vec![DiskInfo {
            number: 0,
            size_bytes: 500 * GIB,
            style: PartitionStyle::Gpt,
            location: None,
        }];
        disks.extend(state.host_disks.iter().map(|(d, _)| d.clone()));
        if state.attached {
            if state.hidden_polls > 0 {
                state.hidden_polls -= 1;
            } else if let Some(spec) = &state.spec {
                disks.push(DiskInfo {
                    number: self.number,
                    size_bytes: spec.size_bytes,
                    style: state.style.unwrap_or(PartitionStyle::Raw),
                    location: (!state.no_location).then(|| spec.path.display().to_string()),
                });
            }
        }
        Ok(disks)
    }

    fn initialize_gpt(&self, disk_number: u32) -> Result<(), ProvisionError> {
        self.journal.log(format!("initialize_gpt {}", disk_number));
        let mut state = self.state.borrow_mut();
        if let Some((info, _)) = state.host_disks.iter_mut().find(|(d, _)| d.number == disk_number) {
            info.style = PartitionStyle::Gpt;
            return Ok(());
        }
        state.style = Some(PartitionStyle::Gpt);
        if state.default_partition {
            state
                .partitions
                .push(fake_partition(disk_number, 1, PartitionKind::Msr, 17 * 1024, 16 * MIB));
        }
        Ok(())
    }

    fn partition_table(&self, disk_number: u32) -> Result<Vec<PartitionHandle>, ProvisionError> {
        self.journal.log(format!("partition_table {}", disk_number));
        let state = self.state.borrow();
        match state.host_disks.iter().find(|(d, _)| d.number == disk_number) {
            Some((_, table)) => Ok(table.clone()),
            None => Ok(state.partitions.clone()),
        }
    }

    fn remove_partition(&self, disk_number: u32, partition_number: u32) -> Result<(), ProvisionError> {
        self.journal.log(format!("remove_partition {} {}", disk_number, partition_number));
        let mut guard = self.state.borrow_mut();
        let state = &mut *guard;
        match state.host_disks.iter_mut().find(|(d, _)| d.number == disk_number) {
            Some((_, table)) => table.retain(|p| p.number != partition_number),
            None => state.partitions.retain(|p| p.number != partition_number),
        }
        Ok(())
    }

    fn detach(&self, path: &Path) -> Result<(), ProvisionError> {
        self.journal.log(format!("detach {}", path.display()));
        let mut state = self.state.borrow_mut();
        if state.detach_fails {
            return Err(ProvisionError::Tool { tool: "fake", message: "disk is in use".into() });
        }
        state.orphans.retain(|p| p != path);
        state.attached = false;
        Ok(())
    }
}

// ============================================
// PARTITION OPS
// ============================================

/// Space the fake keeps free at the start and end of the disk.
const FAKE_RESERVE: u64 = 2 * MIB;

#[derive(Default)]
struct PartState {
    partitions: Vec<PartitionHandle>,
    formatted: HashMap<u32, (FileSystem, String)>,
    requests: Vec<PartitionRequest>,
    next_letter: u8,
    drop_letters: bool,
}

pub struct FakePartitionOps {
    disk_size: u64,
    state: RefCell<PartState>,
    journal: Journal,
}

impl FakePartitionOps {
    pub fn new(disk_size: u64) -> Self {
        FakePartitionOps {
            disk_size,
            state: RefCell::new(PartState { next_letter: b'E', ..PartState::default() }),
            journal: Journal::default(),
        }
    }

    /// Letter assignment "succeeds" but the letter never shows up.
    pub fn drop_letters(&self) {
        self.state.borrow_mut().drop_letters = true;
    }

    pub fn last_request(&self) -> Option<PartitionRequest> {
        self.state.borrow().requests.last().cloned()
    }

    pub fn journal(&self) -> Vec<String> {
        self.journal.entries()
    }
}

impl PartitionOps for FakePartitionOps {
    fn create(&self, disk_number: u32, request: &PartitionRequest) -> Result<PartitionHandle, PartitionError> {
        self.journal.log(format!("create {:?}", request.kind));
        let mut state = self.state.borrow_mut();
        let used: u64 = state.partitions.iter().map(|p| p.size_bytes).sum();
        let free = self.disk_size.saturating_sub(FAKE_RESERVE + used);
        let size = request.size.unwrap_or(free);
        if size == 0 || size > free {
            return Err(PartitionError::InsufficientSpace { disk: disk_number, needed: size, available: free });
        }

        let handle = PartitionHandle {
            disk_number,
            number: state.partitions.len() as u32 + 1,
            kind: request.kind,
            gpt_type: request.kind.gpt_type().to_string(),
            offset: MIB + used,
            size_bytes: size,
            drive_letter: None,
            filesystem: None,
            label: None,
        };
        state.partitions.push(handle.clone());
        state.requests.push(request.clone());
        Ok(handle)
    }

    fn format(&self, partition: &PartitionHandle, filesystem: FileSystem, label: &str) -> Result<(), PartitionError> {
        self.journal.log(format!("format {}", partition.number));
        self.state
            .borrow_mut()
            .formatted
            .insert(partition.number, (filesystem, label.to_string()));
        Ok(())
    }

    fn assign_letter(&self, partition: &PartitionHandle) -> Result<(), PartitionError> {
        self.journal.log(format!("assign {}", partition.number));
        let mut state = self.state.borrow_mut();
        if state.drop_letters {
            return Ok(());
        }
        let letter = state.next_letter as char;
        state.next_letter += 1;
        if let Some(p) = state.partitions.iter_mut().find(|p| p.number == partition.number) {
            p.drive_letter = Some(letter);
        }
        Ok(())
    }

    fn get(&self, disk_number: u32, partition_number: u32) -> Result<PartitionHandle, PartitionError> {
        self.journal.log(format!("get {}", partition_number));
        let state = self.state.borrow();
        let mut handle = state
            .partitions
            .iter()
            .find(|p| p.number == partition_number)
            .cloned()
            .ok_or_else(|| PartitionError::Tool {
                operation: "Get-Partition".into(),
                message: format!("no partition {} on disk {}", partition_number, disk_number),
            })?;
        // Like the real cmdlet, the role is only as good as the GPT type.
        handle.kind = PartitionKind::from_gpt_type(&handle.gpt_type);
        if let Some((fs, label)) = state.formatted.get(&partition_number) {
            handle.filesystem = Some(*fs);
            handle.label = Some(label.clone());
        }
        Ok(handle)
    }

    fn resize(&self, partition: &PartitionHandle, new_size: u64) -> Result<(), PartitionError> {
        self.journal.log(format!("resize {} {}", partition.number, new_size));
        if let Some(p) = self
            .state
            .borrow_mut()
            .partitions
            .iter_mut()
            .find(|p| p.number == partition.number)
        {
            p.size_bytes = new_size;
        }
        Ok(())
    }
}

// ============================================
// IMAGING
// ============================================

#[derive(Default)]
struct ImagingState {
    apply_failures: VecDeque<ImagingError>,
    optimize_failures: VecDeque<ImagingError>,
    mount_failures: u32,
    unmount_failures: u32,
    add_drivers_fails: bool,
    image_info: ImageInfo,
    scratch_seen: Option<bool>,
}

pub struct FakeImaging {
    state: RefCell<ImagingState>,
    journal: Journal,
}

impl FakeImaging {
    pub fn new() -> Self {
        FakeImaging { state: RefCell::default(), journal: Journal::default() }
    }

    /// Fail the next applies with these errors, in order.
    pub fn fail_apply(&self, errors: Vec<ImagingError>) {
        self.state.borrow_mut().apply_failures = errors.into();
    }

    pub fn fail_optimize(&self, errors: Vec<ImagingError>) {
        self.state.borrow_mut().optimize_failures = errors.into();
    }

    pub fn fail_mount(&self, times: u32) {
        self.state.borrow_mut().mount_failures = times;
    }

    pub fn fail_unmount(&self, times: u32) {
        self.state.borrow_mut().unmount_failures = times;
    }

    pub fn fail_add_drivers(&self) {
        self.state.borrow_mut().add_drivers_fails = true;
    }

    pub fn set_image_info(&self, info: ImageInfo) {
        self.state.borrow_mut().image_info = info;
    }

    /// True if the scratch folder existed every time optimize ran.
    pub fn scratch_existed_during_optimize(&self) -> bool {
        self.state.borrow().scratch_seen.unwrap_or(false)
    }

    pub fn count(&self, op: &str) -> usize {
        self.journal.calls(op).len()
    }

    pub fn calls(&self, op: &str) -> Vec<String> {
        self.journal.calls(op)
    }

    fn failed(operation: &str) -> ImagingError {
        ImagingError::Failed { operation: operation.into(), code: Some(1), output: "fake failure".into() }
    }
}

impl ImagingTool for FakeImaging {
    fn image_info(&self, image: &Path, index: u32) -> Result<ImageInfo, ImagingError> {
        self.journal.log(format!("image_info {} {}", image.display(), index));
        Ok(self.state.borrow().image_info.clone())
    }

    fn apply_image(&self, image: &Path, index: u32, apply_dir: &Path, _compact: bool) -> Result<(), ImagingError> {
        self.journal
            .log(format!("apply_image {} {} {}", image.display(), index, apply_dir.display()));
        match self.state.borrow_mut().apply_failures.pop_front() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn make_bootable(&self, windows_dir: &Path, system_drive: &str) -> Result<(), ImagingError> {
        self.journal
            .log(format!("make_bootable {} {}", windows_dir.display(), system_drive));
        Ok(())
    }

    fn register_recovery(&self, re_dir: &Path, _windows_dir: &Path) -> Result<(), ImagingError> {
        self.journal.log(format!("register_recovery {}", re_dir.display()));
        Ok(())
    }

    fn mount_image(&self, image: &Path, _index: u32, _mount_dir: &Path) -> Result<(), ImagingError> {
        self.journal.log(format!("mount_image {}", image.display()));
        let mut state = self.state.borrow_mut();
        if state.mount_failures > 0 {
            state.mount_failures -= 1;
            return Err(Self::failed("DISM /Mount-Image"));
        }
        Ok(())
    }

    fn unmount_image(&self, _mount_dir: &Path, mode: UnmountMode) -> Result<(), ImagingError> {
        self.journal.log(format!("unmount_image {:?}", mode));
        let mut state = self.state.borrow_mut();
        if state.unmount_failures > 0 {
            state.unmount_failures -= 1;
            return Err(Self::failed("DISM /Unmount-Image"));
        }
        Ok(())
    }

    fn add_drivers(&self, _mount_dir: &Path, drivers: &Path) -> Result<DriverAddSummary, ImagingError> {
        self.journal.log(format!("add_drivers {}", drivers.display()));
        if self.state.borrow().add_drivers_fails {
            return Err(Self::failed("DISM /Add-Driver"));
        }
        Ok(DriverAddSummary { installed: 1, failed: Vec::new() })
    }

    fn cleanup_mountpoints(&self) -> Result<(), ImagingError> {
        self.journal.log("cleanup_mountpoints".into());
        Ok(())
    }

    fn capture_ffu(&self, physical_drive: &str, target: &Path, _name: &str) -> Result<(), ImagingError> {
        self.journal
            .log(format!("capture_ffu {} {}", physical_drive, target.display()));
        fs::write(target, b"FFU").map_err(|source| ImagingError::Start {
            operation: "fake capture".into(),
            source,
        })
    }

    fn optimize_ffu(&self, ffu: &Path, scratch_dir: &Path) -> Result<(), ImagingError> {
        self.journal.log(format!("optimize_ffu {}", ffu.display()));
        let mut state = self.state.borrow_mut();
        let seen = scratch_dir.is_dir();
        state.scratch_seen = Some(state.scratch_seen.unwrap_or(true) && seen);
        match state.optimize_failures.pop_front() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

// ============================================
// MEDIA
// ============================================

#[derive(Default)]
struct MediaState {
    next_root: usize,
    mounted: HashMap<PathBuf, PathBuf>,
}

/// Each mount_iso call lands on the next root in the list (the last one
/// repeats), like Windows handing out a new drive letter on remount.
pub struct FakeMedia {
    roots: Vec<PathBuf>,
    state: RefCell<MediaState>,
    journal: Journal,
}

impl FakeMedia {
    pub fn new(roots: Vec<PathBuf>) -> Self {
        FakeMedia { roots, state: RefCell::default(), journal: Journal::default() }
    }

    /// Simulate Windows auto-dismounting every ISO.
    pub fn detach_all(&self) {
        self.state.borrow_mut().mounted.clear();
    }

    pub fn journal(&self) -> Vec<String> {
        self.journal.entries()
    }
}

impl MediaManager for FakeMedia {
    fn mount_iso(&self, iso: &Path) -> Result<PathBuf, MediaError> {
        self.journal.log(format!("mount_iso {}", iso.display()));
        let mut state = self.state.borrow_mut();
        let index = state.next_root.min(self.roots.len().saturating_sub(1));
        let root = self.roots.get(index).cloned().ok_or_else(|| MediaError::Tool {
            operation: "Mount-DiskImage".into(),
            message: "no drive letters left".into(),
        })?;
        state.next_root += 1;
        state.mounted.insert(iso.to_path_buf(), root.clone());
        Ok(root)
    }

    fn mount_root(&self, iso: &Path) -> Result<Option<PathBuf>, MediaError> {
        Ok(self.state.borrow().mounted.get(iso).cloned())
    }

    fn dismount_iso(&self, iso: &Path) -> Result<(), MediaError> {
        self.journal.log(format!("dismount_iso {}", iso.display()));
        self.state.borrow_mut().mounted.remove(iso);
        Ok(())
    }
}

// ============================================
// SERVICES
// ============================================

pub struct FakeServices {
    start_types: RefCell<HashMap<String, StartType>>,
    states: RefCell<HashMap<String, VecDeque<ServiceState>>>,
    queries: RefCell<HashMap<String, usize>>,
}

impl FakeServices {
    /// Running services running, demand-start services stopped but enabled.
    pub fn healthy() -> Self {
        let mut start_types = HashMap::new();
        let mut states = HashMap::new();
        for requirement in IMAGING_SERVICES {
            let (start, state) = match requirement.expectation {
                Expectation::Running => (StartType::Auto, ServiceState::Running),
                Expectation::NotDisabled => (StartType::Demand, ServiceState::Stopped),
            };
            start_types.insert(requirement.name.to_string(), start);
            states.insert(requirement.name.to_string(), VecDeque::from(vec![state]));
        }
        FakeServices {
            start_types: RefCell::new(start_types),
            states: RefCell::new(states),
            queries: RefCell::default(),
        }
    }

    pub fn set_start_type(&self, service: &str, start: StartType) {
        self.start_types.borrow_mut().insert(service.to_string(), start);
    }

    /// States returned by successive queries; the last one repeats.
    pub fn set_states(&self, service: &str, states: Vec<ServiceState>) {
        self.states.borrow_mut().insert(service.to_string(), states.into());
    }

    pub fn state_queries(&self, service: &str) -> usize {
        self.queries.borrow().get(service).copied().unwrap_or(0)
    }
}

impl ServiceControl for FakeServices {
    fn start_type(&self, service: &str) -> Result<StartType, ServiceError> {
        self.start_types.borrow().get(service).copied().ok_or_else(|| ServiceError {
            service: service.to_string(),
            message: "The specified service does not exist as an installed service.".into(),
        })
    }

    fn state(&self, service: &str) -> Result<ServiceState, ServiceError> {
        *self.queries.borrow_mut().entry(service.to_string()).or_default() += 1;
        let mut states = self.states.borrow_mut();
        let queue = states.get_mut(service).ok_or_else(|| ServiceError {
            service: service.to_string(),
            message: "The specified service does not exist as an installed service.".into(),
        })?;
        let state = if queue.len() > 1 { queue.pop_front() } else { queue.front().copied() };
        Ok(state.unwrap_or(ServiceState::Other))
    }
}

// ============================================
// REGISTRY
// ============================================

pub struct FakeRegistry {
    values: RefCell<HashMap<String, String>>,
    loaded: RefCell<Option<String>>,
    journal: Journal,
}

impl FakeRegistry {
    pub fn with_version(version: &OsVersion) -> Self {
        let mut values = HashMap::new();
        values.insert("ProductName".to_string(), version.product_name.clone());
        values.insert("EditionID".to_string(), version.edition_id.clone());
        values.insert("CurrentBuild".to_string(), version.current_build.clone());
        if let Some(display) = &version.display_version {
            values.insert("DisplayVersion".to_string(), display.clone());
        }
        if let Some(ubr) = version.ubr {
            values.insert("UBR".to_string(), ubr.to_string());
        }
        if let Some(kind) = &version.installation_type {
            values.insert("InstallationType".to_string(), kind.clone());
        }
        FakeRegistry { values: RefCell::new(values), loaded: RefCell::default(), journal: Journal::default() }
    }

    pub fn remove_value(&self, name: &str) {
        self.values.borrow_mut().remove(name);
    }

    pub fn is_loaded(&self) -> bool {
        self.loaded.borrow().is_some()
    }

    /// Load and unload calls only.
    pub fn journal(&self) -> Vec<String> {
        self.journal.entries()
    }
}

impl OfflineRegistry for FakeRegistry {
    fn load_hive(&self, mount_name: &str, _hive_file: &Path) -> Result<(), RegistryError> {
        self.journal.log(format!("load {}", mount_name));
        *self.loaded.borrow_mut() = Some(mount_name.to_string());
        Ok(())
    }

    fn query_value(&self, key: &str, value: &str) -> Result<Option<String>, RegistryError> {
        let loaded = self.loaded.borrow();
        match loaded.as_deref() {
            Some(name) if key.contains(name) => Ok(self.values.borrow().get(value).cloned()),
            _ => Err(RegistryError::Tool {
                verb: "query",
                key: key.to_string(),
                message: "The system was unable to find the specified registry key or value.".into(),
            }),
        }
    }

    fn unload_hive(&self, mount_name: &str) -> Result<(), RegistryError> {
        self.journal.log(format!("unload {}", mount_name));
        *self.loaded.borrow_mut() = None;
        Ok(())
    }
}

// ============================================
// HYPERVISOR
// ============================================

pub struct FakeHypervisor {
    states: RefCell<VecDeque<PowerState>>,
    polls: Cell<u32>,
    started: RefCell<Vec<String>>,
}

impl FakeHypervisor {
    /// Power states returned by successive polls; the last one repeats.
    pub fn new(states: Vec<PowerState>) -> Self {
        FakeHypervisor { states: RefCell::new(states.into()), polls: Cell::new(0), started: RefCell::default() }
    }

    pub fn polls(&self) -> u32 {
        self.polls.get()
    }

    pub fn started(&self) -> Vec<String> {
        self.started.borrow().clone()
    }
}

impl HypervisorProvider for FakeHypervisor {
    fn start_vm(&self, vm: &str, _show_console: bool) -> Result<(), HypervisorError> {
        self.started.borrow_mut().push(vm.to_string());
        Ok(())
    }

    fn power_state(&self, _vm: &str) -> Result<PowerState, HypervisorError> {
        self.polls.set(self.polls.get() + 1);
        let mut states = self.states.borrow_mut();
        let state = if states.len() > 1 { states.pop_front() } else { states.front().copied() };
        Ok(state.unwrap_or(PowerState::Off))
    }
}
