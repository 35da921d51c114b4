// ============================================
// FFU Builder - registry.rs
// ============================================
// OS version metadata from the deployed image's offline SOFTWARE hive,
// and the FFU file name built from it.
//
// HIVE SAFETY:
// The hive is loaded under HKLM\FFU_<id>, read, and ALWAYS unloaded, even
// when a query fails. A hive left loaded keeps SOFTWARE open and the
// next mount or capture of the disk fails. Settle delays bracket the
// load and unload (REGISTRY_SETTLE_DELAY in config.rs).
// ============================================

use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use time::OffsetDateTime;

use crate::process;

const CURRENT_VERSION: &str = r"Microsoft\Windows NT\CurrentVersion";

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("reg {verb} {key} failed: {message}")]
    Tool {
        verb: &'static str,
        key: String,
        message: String,
    },

    #[error("offline hive not found: {0}")]
    HiveMissing(String),

    #[error("value {value} missing under {key}")]
    MissingValue { key: String, value: String },
}

/// reg.exe-style access to offline hives.
pub trait OfflineRegistry {
    /// Load `hive_file` under `HKLM\<mount_name>`.
    fn load_hive(&self, mount_name: &str, hive_file: &Path) -> Result<(), RegistryError>;

    /// Read a value as text. DWORDs come back in decimal.
    fn query_value(&self, key: &str, value: &str) -> Result<Option<String>, RegistryError>;

    fn unload_hive(&self, mount_name: &str) -> Result<(), RegistryError>;
}

// ============================================
// OS VERSION
// ============================================

#[derive(Debug, Clone, PartialEq, Default)]
pub struct OsVersion {
    pub product_name: String,
    pub edition_id: String,
    pub display_version: Option<String>,
    pub current_build: String,
    pub ubr: Option<u32>,
    pub installation_type: Option<String>,
}

impl OsVersion {
    pub fn is_server(&self) -> bool {
        self.installation_type
            .as_deref()
            .map(|t| t.to_ascii_lowercase().starts_with("server"))
            .unwrap_or(false)
            || self.product_name.contains("Server")
    }

    /// "Windows 11", "Windows 10", "Windows Server 2022".
    ///
    /// Windows 11 still writes "Windows 10" into ProductName, so client
    /// releases are told apart by build number.
    pub fn release(&self) -> String {
        if self.is_server() {
            let mut words = Vec::new();
            for word in self.product_name.split_whitespace() {
                words.push(word);
                if word.len() == 4 && word.chars().all(|c| c.is_ascii_digit()) {
                    break;
                }
            }
            return words.join(" ");
        }
        match self.current_build.parse::<u32>() {
            Ok(build) if build >= 22000 => "Windows 11".to_string(),
            _ => "Windows 10".to_string(),
        }
    }

    /// "23H2", falling back to the build number on old releases.
    pub fn version(&self) -> String {
        self.display_version.clone().unwrap_or_else(|| self.current_build.clone())
    }

    /// "22631.2861"
    pub fn build(&self) -> String {
        match self.ubr {
            Some(ubr) => format!("{}.{}", self.current_build, ubr),
            None => self.current_build.clone(),
        }
    }

    /// Short SKU name from EditionID.
    pub fn sku(&self) -> String {
        match self.edition_id.as_str() {
            "Professional" => "Pro".to_string(),
            "ProfessionalWorkstation" => "Pro_Wks".to_string(),
            "ProfessionalEducation" => "Pro_Edu".to_string(),
            "Core" => "Home".to_string(),
            "CoreSingleLanguage" => "Home_SL".to_string(),
            "Enterprise" => "Ent".to_string(),
            "Education" => "Edu".to_string(),
            other => other.to_string(),
        }
    }
}

/// Unloads the hive on drop if `unload` was never called.
struct LoadedHive<'a> {
    registry: &'a dyn OfflineRegistry,
    mount_name: String,
    unloaded: bool,
}

impl LoadedHive<'_> {
    fn unload(mut self) -> Result<(), RegistryError> {
        self.unloaded = true;
        self.registry.unload_hive(&self.mount_name)
    }
}

impl Drop for LoadedHive<'_> {
    fn drop(&mut self) {
        if !self.unloaded {
            log::warn!("Unloading hive HKLM\\{} on the error path", self.mount_name);
            if let Err(e) = self.registry.unload_hive(&self.mount_name) {
                log::error!("Hive HKLM\\{} is still loaded: {}", self.mount_name, e);
            }
        }
    }
}

/// Read version metadata from `<os_root>\Windows\System32\config\SOFTWARE`.
pub fn read_os_version(
    registry: &dyn OfflineRegistry,
    os_root: &Path,
    mount_name: &str,
    settle: Duration,
) -> Result<OsVersion, RegistryError> {
    let hive_file = os_root.join(r"Windows\System32\config\SOFTWARE");

    log::info!("Waiting {}s before loading the offline SOFTWARE hive", settle.as_secs());
    std::thread::sleep(settle);
    registry.load_hive(mount_name, &hive_file)?;
    let hive = LoadedHive { registry, mount_name: mount_name.to_string(), unloaded: false };

    let key = format!(r"HKLM\{}\{}", mount_name, CURRENT_VERSION);
    let result = query_version(registry, &key);

    let unload = hive.unload();
    std::thread::sleep(settle);
    if let Err(e) = unload {
        log::warn!("Failed to unload HKLM\\{}: {}", mount_name, e);
    }

    let version = result?;
    log::info!(
        "Deployed OS: {} {} ({}), build {}",
        version.release(),
        version.version(),
        version.edition_id,
        version.build()
    );
    Ok(version)
}

fn query_version(registry: &dyn OfflineRegistry, key: &str) -> Result<OsVersion, RegistryError> {
    let required = |value: &str| -> Result<String, RegistryError> {
        registry.query_value(key, value)?.ok_or_else(|| RegistryError::MissingValue {
            key: key.to_string(),
            value: value.to_string(),
        })
    };

    Ok(OsVersion {
        product_name: required("ProductName")?,
        edition_id: required("EditionID")?,
        current_build: required("CurrentBuild")?,
        display_version: registry.query_value(key, "DisplayVersion")?,
        ubr: registry.query_value(key, "UBR")?.and_then(|v| v.parse().ok()),
        installation_type: registry.query_value(key, "InstallationType")?,
    })
}

// ============================================
// FFU NAMING
// ============================================

/// Expand a name template. Placeholders: `{release}`, `{version}`,
/// `{build}`, `{sku}`, `{date}` (yyyy-mm-dd), `{time}` (hhmm).
/// Unknown metadata becomes "unknown". Always ends in `.ffu`.
pub fn ffu_file_name(template: &str, version: Option<&OsVersion>, now: OffsetDateTime) -> String {
    let get = |f: fn(&OsVersion) -> String| version.map(f).unwrap_or_else(|| "unknown".to_string());
    let date = format!("{:04}-{:02}-{:02}", now.year(), u8::from(now.month()), now.day());
    let clock = format!("{:02}{:02}", now.hour(), now.minute());

    let expanded = template
        .replace("{release}", &get(OsVersion::release))
        .replace("{version}", &get(OsVersion::version))
        .replace("{build}", &get(OsVersion::build))
        .replace("{sku}", &get(OsVersion::sku))
        .replace("{date}", &date)
        .replace("{time}", &clock);

    let mut name: String = expanded
        .chars()
        .map(|c| match c {
            '<' | '>' | ':' | '"' | '/' | '\\' | '|' | '?' | '*' => '_',
            c if c.is_control() || c.is_whitespace() => '_',
            c => c,
        })
        .collect();

    if !name.to_ascii_lowercase().ends_with(".ffu") {
        name.push_str(".ffu");
    }
    name
}

// ============================================
// reg.exe IMPLEMENTATION
// ============================================

/// Pull a value out of `reg query <key> /v <name>` output:
/// `    UBR    REG_DWORD    0xb2d`
pub fn parse_reg_value(output: &str, value: &str) -> Option<String> {
    output.lines().find_map(|line| {
        let mut parts = line.trim().splitn(3, "    ");
        let name = parts.next()?.trim();
        let kind = parts.next()?.trim();
        let data = parts.next().unwrap_or("").trim();
        if !name.eq_ignore_ascii_case(value) {
            return None;
        }
        match kind {
            "REG_DWORD" | "REG_QWORD" => {
                let hex = data.trim_start_matches("0x");
                u64::from_str_radix(hex, 16).ok().map(|n| n.to_string())
            }
            _ => Some(data.to_string()),
        }
    })
}

pub struct RegExe;

impl RegExe {
    fn reg(&self, verb: &'static str, key: &str, args: &[&str]) -> Result<process::CommandOutput, RegistryError> {
        let mut full = vec![verb, key];
        full.extend_from_slice(args);
        let output = process::run("reg", &full).map_err(|e| RegistryError::Tool {
            verb,
            key: key.to_string(),
            message: e.to_string(),
        })?;
        Ok(output)
    }
}

impl OfflineRegistry for RegExe {
    fn load_hive(&self, mount_name: &str, hive_file: &Path) -> Result<(), RegistryError> {
        if !hive_file.is_file() {
            return Err(RegistryError::HiveMissing(hive_file.display().to_string()));
        }
        let key = format!(r"HKLM\{}", mount_name);
        let file = hive_file.display().to_string();
        let output = self.reg("load", &key, &[&file])?;
        if !output.success() {
            return Err(RegistryError::Tool { verb: "load", key, message: output.combined() });
        }
        Ok(())
    }

    fn query_value(&self, key: &str, value: &str) -> Result<Option<String>, RegistryError> {
        let output = self.reg("query", key, &["/v", value])?;
        // reg exits 1 when the value does not exist
        if !output.success() {
            return Ok(None);
        }
        Ok(parse_reg_value(&output.stdout, value))
    }

    fn unload_hive(&self, mount_name: &str) -> Result<(), RegistryError> {
        let key = format!(r"HKLM\{}", mount_name);
        let output = self.reg("unload", &key, &[])?;
        if !output.success() {
            return Err(RegistryError::Tool { verb: "unload", key, message: output.combined() });
        }
        Ok(())
    }
}
