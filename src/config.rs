// ============================================
// FFU Builder - config.rs
// ============================================
// Build configuration and the per-build context derived from it.
//
// BuildConfig is what the operator writes (TOML) or saves as a profile
// (JSON). BuildContext is what the pipeline actually passes around: paths
// resolved against the work directory, a per-build id, and the timing
// table every retry loop reads from. Nothing in the pipeline reads
// environment state directly; it all flows through BuildContext.
// ============================================

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

use crate::disk::{BackendChoice, VirtualDiskSpec, GIB};

// ============================================
// NAMED DELAYS
// ============================================
// Fixed waits where the OS gives us nothing observable to poll.

/// Wait after a capture finishes before touching the FFU. Antivirus and the
/// search indexer open freshly written large files for a short window and a
/// mount during that window fails with a sharing violation.
pub const CAPTURE_SETTLE_DELAY: Duration = Duration::from_secs(15);

/// Wait before loading and after unloading the offline SOFTWARE hive.
/// Touching the hive too quickly after apply (or the file right after
/// unload) has corrupted the registry store, which later surfaces as
/// failed cumulative update installs.
pub const REGISTRY_SETTLE_DELAY: Duration = Duration::from_secs(10);

/// Wait after remounting source media so the volume is fully online.
pub const REMOUNT_SETTLE_DELAY: Duration = Duration::from_secs(5);

/// Default name template for the captured FFU.
pub const DEFAULT_NAME_TEMPLATE: &str = "{release}_{version}_{sku}_{date}";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to write config {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid TOML in {path}: {message}")]
    Toml { path: PathBuf, message: String },
    #[error("invalid JSON in {path}: {message}")]
    Json { path: PathBuf, message: String },
    #[error("unsupported config extension for {0} (expected .toml or .json)")]
    Extension(PathBuf),
    #[error("invalid build config: {0}")]
    Invalid(String),
}

// ============================================
// TIMINGS
// ============================================

/// Retry counts and delays for every bounded wait in the pipeline.
///
/// Each loop in the crate is a (count, delay) pair from this table rather
/// than a wall-clock deadline. In config files delays are written in
/// whole seconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Timings {
    pub attach_attempts: u32,
    #[serde(with = "secs")]
    pub attach_retry_delay: Duration,
    pub enumerate_polls: u32,
    #[serde(with = "secs")]
    pub enumerate_delay: Duration,
    pub apply_attempts: u32,
    #[serde(with = "secs")]
    pub apply_backoff: Duration,
    #[serde(with = "secs")]
    pub remount_settle: Duration,
    pub service_polls: u32,
    #[serde(with = "secs")]
    pub service_poll_delay: Duration,
    #[serde(with = "secs")]
    pub capture_settle: Duration,
    #[serde(with = "secs")]
    pub registry_settle: Duration,
    #[serde(with = "secs")]
    pub vm_poll_interval: Duration,
    /// Caller-imposed ceiling on VM power-state polls. `None` waits forever.
    pub vm_poll_limit: Option<u32>,
    pub lock_probe_attempts: u32,
    #[serde(with = "secs")]
    pub lock_probe_delay: Duration,
    pub optimize_attempts: u32,
    #[serde(with = "secs")]
    pub optimize_backoff: Duration,
}

impl Default for Timings {
    fn default() -> Self {
        Timings {
            attach_attempts: 3,
            attach_retry_delay: Duration::from_secs(2),
            enumerate_polls: 10,
            enumerate_delay: Duration::from_secs(1),
            apply_attempts: 2,
            apply_backoff: Duration::from_secs(30),
            remount_settle: REMOUNT_SETTLE_DELAY,
            service_polls: 5,
            service_poll_delay: Duration::from_secs(2),
            capture_settle: CAPTURE_SETTLE_DELAY,
            registry_settle: REGISTRY_SETTLE_DELAY,
            vm_poll_interval: Duration::from_secs(10),
            vm_poll_limit: None,
            lock_probe_attempts: 3,
            lock_probe_delay: Duration::from_secs(5),
            optimize_attempts: 3,
            optimize_backoff: Duration::from_secs(15),
        }
    }
}

impl Timings {
    /// Same retry counts as the defaults, zero delays. For tests and dry runs.
    pub fn immediate() -> Self {
        Timings {
            attach_retry_delay: Duration::ZERO,
            enumerate_delay: Duration::ZERO,
            apply_backoff: Duration::ZERO,
            remount_settle: Duration::ZERO,
            service_poll_delay: Duration::ZERO,
            capture_settle: Duration::ZERO,
            registry_settle: Duration::ZERO,
            vm_poll_interval: Duration::ZERO,
            lock_probe_delay: Duration::ZERO,
            optimize_backoff: Duration::ZERO,
            ..Timings::default()
        }
    }
}

/// Serialize `Duration` as whole seconds.
mod secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }
}

// ============================================
// BUILD CONFIG (what the operator writes)
// ============================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiskConfig {
    /// Backing file. Defaults to `<work_dir>\VM\<build>.vhdx`.
    pub path: Option<PathBuf>,
    pub size_bytes: u64,
    pub sector_size: u32,
    pub dynamic: bool,
    pub backend: BackendChoice,
}

impl Default for DiskConfig {
    fn default() -> Self {
        DiskConfig {
            path: None,
            size_bytes: 50 * GIB,
            sector_size: 512,
            dynamic: true,
            backend: BackendChoice::Auto,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LayoutConfig {
    /// Fixed OS partition size. `None` gives the OS all remaining space.
    pub os_size_bytes: Option<u64>,
    /// Add an NTFS data partition after the OS (requires a fixed OS size).
    pub data_partition: bool,
    /// Create a Recovery partition when the image ships a WinRE.
    pub recovery: bool,
}

impl Default for LayoutConfig {
    fn default() -> Self {
        LayoutConfig {
            os_size_bytes: None,
            data_partition: false,
            recovery: true,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ImageConfig {
    /// install.wim, install.esd, or a Windows .iso
    pub path: PathBuf,
    pub index: u32,
    pub compact: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// Where FFUs land. Defaults to `<work_dir>\FFU`.
    pub dir: Option<PathBuf>,
    pub name_template: String,
    pub drivers: Option<PathBuf>,
    pub optimize: bool,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        CaptureConfig {
            dir: None,
            name_template: DEFAULT_NAME_TEMPLATE.to_string(),
            drivers: None,
            optimize: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VmConfig {
    pub name: String,
    #[serde(default)]
    pub show_console: bool,
}

/// Everything the operator can set for one build.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildConfig {
    pub work_dir: PathBuf,
    #[serde(default)]
    pub disk: DiskConfig,
    #[serde(default)]
    pub layout: LayoutConfig,
    pub image: ImageConfig,
    #[serde(default)]
    pub capture: CaptureConfig,
    #[serde(default)]
    pub vm: Option<VmConfig>,
    #[serde(default)]
    pub timings: Timings,
}

impl BuildConfig {
    /// Load a config from `.toml` or `.json` (saved profile) by extension.
    pub fn load(path: &Path) -> Result<BuildConfig, ConfigError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;

        let ext = path
            .extension()
            .map(|e| e.to_string_lossy().to_lowercase())
            .unwrap_or_default();

        let config: BuildConfig = match ext.as_str() {
            "toml" => toml::from_str(&text).map_err(|e| ConfigError::Toml {
                path: path.to_path_buf(),
                message: e.to_string(),
            })?,
            "json" => serde_json::from_str(&text).map_err(|e| ConfigError::Json {
                path: path.to_path_buf(),
                message: e.to_string(),
            })?,
            _ => return Err(ConfigError::Extension(path.to_path_buf())),
        };

        log::info!("Loaded build config from {}", path.display());
        Ok(config)
    }

    /// Save as a pretty-printed JSON profile.
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let json = serde_json::to_string_pretty(self).map_err(|e| ConfigError::Json {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|source| ConfigError::Write {
                path: path.to_path_buf(),
                source,
            })?;
        }
        fs::write(path, json).map_err(|source| ConfigError::Write {
            path: path.to_path_buf(),
            source,
        })?;
        log::info!("Saved build profile to {}", path.display());
        Ok(())
    }

    /// Check the config before any OS call is made.
    ///
    /// Collects every problem rather than stopping at the first, so the
    /// operator fixes the file once.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut problems = Vec::new();

        if self.work_dir.as_os_str().is_empty() {
            problems.push("work_dir is empty".to_string());
        }
        if self.image.path.as_os_str().is_empty() {
            problems.push("image.path is empty (expected a .wim, .esd or .iso)".to_string());
        } else if !self.image.path.exists() {
            problems.push(format!("image.path not found: {}", self.image.path.display()));
        } else {
            let ext = self
                .image
                .path
                .extension()
                .map(|e| e.to_string_lossy().to_lowercase())
                .unwrap_or_default();
            if !matches!(ext.as_str(), "wim" | "esd" | "iso") {
                problems.push(format!("image.path has unsupported extension .{}", ext));
            }
        }
        if self.image.index == 0 {
            problems.push("image.index must be 1 or greater".to_string());
        }
        if !matches!(self.disk.sector_size, 512 | 4096) {
            problems.push(format!("disk.sector_size must be 512 or 4096, got {}", self.disk.sector_size));
        }
        if self.disk.size_bytes < 16 * GIB {
            problems.push(format!(
                "disk.size_bytes is {} bytes; at least 16 GiB is needed for a Windows image",
                self.disk.size_bytes
            ));
        }
        if self.layout.data_partition && self.layout.os_size_bytes.is_none() {
            problems.push("layout.data_partition requires layout.os_size_bytes".to_string());
        }
        if let Some(drivers) = &self.capture.drivers {
            if !drivers.is_dir() {
                problems.push(format!("capture.drivers is not a folder: {}", drivers.display()));
            }
        }
        if self.capture.name_template.trim().is_empty() {
            problems.push("capture.name_template is empty".to_string());
        }
        if self.timings.apply_attempts == 0 || self.timings.optimize_attempts == 0 {
            problems.push("timings: attempt counts must be at least 1".to_string());
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Invalid(problems.join("; ")))
        }
    }
}

// ============================================
// BUILD CONTEXT (what the pipeline passes around)
// ============================================

/// Resolved, immutable inputs for one build.
#[derive(Debug, Clone)]
pub struct BuildContext {
    pub build_id: Uuid,
    pub work_dir: PathBuf,
    pub disk: VirtualDiskSpec,
    pub layout: LayoutConfig,
    pub image: ImageConfig,
    pub capture_dir: PathBuf,
    pub name_template: String,
    pub drivers: Option<PathBuf>,
    pub optimize: bool,
    pub vm: Option<VmConfig>,
    pub timings: Timings,
}

impl BuildContext {
    pub fn from_config(config: &BuildConfig) -> BuildContext {
        let build_id = Uuid::new_v4();
        let work_dir = config.work_dir.clone();
        let disk_path = config
            .disk
            .path
            .clone()
            .unwrap_or_else(|| work_dir.join("VM").join(format!("ffu-{}.vhdx", build_id.simple())));

        BuildContext {
            build_id,
            disk: VirtualDiskSpec {
                path: disk_path,
                size_bytes: config.disk.size_bytes,
                sector_size: config.disk.sector_size,
                dynamic: config.disk.dynamic,
                backend: config.disk.backend,
            },
            layout: config.layout.clone(),
            image: config.image.clone(),
            capture_dir: config.capture.dir.clone().unwrap_or_else(|| work_dir.join("FFU")),
            name_template: config.capture.name_template.clone(),
            drivers: config.capture.drivers.clone(),
            optimize: config.capture.optimize,
            vm: config.vm.clone(),
            timings: config.timings.clone(),
            work_dir,
        }
    }

    /// Folder diskpart scripts are written to.
    pub fn script_dir(&self) -> PathBuf {
        self.work_dir.join("scripts")
    }

    /// Mount folder for driver injection. Unique per build.
    pub fn mount_dir(&self) -> PathBuf {
        self.work_dir.join(format!("Mount-{}", self.build_id.simple()))
    }

    /// Dedicated optimize scratch folder. Lives beside the FFUs, never in %TEMP%.
    pub fn scratch_dir(&self) -> PathBuf {
        self.capture_dir.join(".optimize-scratch")
    }
}
