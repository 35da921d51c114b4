// ============================================
// FFU Builder - services.rs
// ============================================
// Pre-flight check of the Windows services DISM and the Storage stack
// depend on. Mount and apply fail with unhelpful errors (or hang) when
// one of these is disabled, so they are checked up front and the result
// is logged for the operator.
//
// This check only READS service state. It never starts or reconfigures a
// service: the build host belongs to the operator.
// ============================================

use std::fmt;
use std::time::Duration;
use thiserror::Error;

use crate::config::Timings;
use crate::process;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartType {
    Boot,
    System,
    Auto,
    Demand,
    Disabled,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
    Running,
    Stopped,
    StartPending,
    StopPending,
    Paused,
    Other,
}

impl fmt::Display for ServiceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            ServiceState::Running => "running",
            ServiceState::Stopped => "stopped",
            ServiceState::StartPending => "start pending",
            ServiceState::StopPending => "stop pending",
            ServiceState::Paused => "paused",
            ServiceState::Other => "unknown",
        };
        write!(f, "{}", text)
    }
}

#[derive(Debug, Error)]
#[error("querying service {service} failed: {message}")]
pub struct ServiceError {
    pub service: String,
    pub message: String,
}

/// Read-only view of the service control manager.
pub trait ServiceControl {
    fn start_type(&self, service: &str) -> Result<StartType, ServiceError>;
    fn state(&self, service: &str) -> Result<ServiceState, ServiceError>;
}

/// What a service must look like for imaging to work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expectation {
    /// Must be running now.
    Running,
    /// Started on demand; only has to not be disabled.
    NotDisabled,
}

#[derive(Debug, Clone, Copy)]
pub struct ServiceRequirement {
    pub name: &'static str,
    pub expectation: Expectation,
}

/// RPC and WMI must be up; the Virtual Disk service, the Windows Modules
/// Installer and the Storage management provider start on demand.
pub const IMAGING_SERVICES: &[ServiceRequirement] = &[
    ServiceRequirement { name: "RpcSs", expectation: Expectation::Running },
    ServiceRequirement { name: "Winmgmt", expectation: Expectation::Running },
    ServiceRequirement { name: "vds", expectation: Expectation::NotDisabled },
    ServiceRequirement { name: "TrustedInstaller", expectation: Expectation::NotDisabled },
    ServiceRequirement { name: "smphost", expectation: Expectation::NotDisabled },
];

pub struct ServiceReadinessChecker<'a> {
    control: &'a dyn ServiceControl,
    requirements: &'a [ServiceRequirement],
    polls: u32,
    poll_delay: Duration,
}

impl<'a> ServiceReadinessChecker<'a> {
    pub fn new(control: &'a dyn ServiceControl, timings: &Timings) -> Self {
        ServiceReadinessChecker {
            control,
            requirements: IMAGING_SERVICES,
            polls: timings.service_polls.max(1),
            poll_delay: timings.service_poll_delay,
        }
    }

    /// Check every requirement. Returns `false` if any service looks wrong;
    /// callers log and carry on, the imaging tool reports the hard error.
    pub fn ensure_ready(&self) -> bool {
        let mut ready = true;
        for requirement in self.requirements {
            let ok = match requirement.expectation {
                Expectation::NotDisabled => self.check_not_disabled(requirement.name),
                Expectation::Running => self.check_running(requirement.name),
            };
            ready &= ok;
        }
        if ready {
            log::info!("Imaging services ready");
        } else {
            log::warn!("One or more imaging services are not ready; DISM operations may fail");
        }
        ready
    }

    fn check_not_disabled(&self, name: &str) -> bool {
        match self.control.start_type(name) {
            Ok(StartType::Disabled) => {
                log::warn!("Service {} is disabled (set it to Manual: sc config {} start= demand)", name, name);
                false
            }
            Ok(start) => {
                log::debug!("Service {} start type {:?}", name, start);
                true
            }
            Err(e) => {
                log::warn!("{}", e);
                false
            }
        }
    }

    /// Poll until running. A service in StartPending gets the full poll
    /// budget; a stopped one is reported, never started.
    fn check_running(&self, name: &str) -> bool {
        let mut last = ServiceState::Other;
        for poll in 1..=self.polls {
            match self.control.state(name) {
                Ok(ServiceState::Running) => {
                    log::debug!("Service {} running", name);
                    return true;
                }
                Ok(state) => {
                    log::info!("Service {} is {} (check {}/{})", name, state, poll, self.polls);
                    last = state;
                }
                Err(e) => log::warn!("{}", e),
            }
            if poll < self.polls {
                std::thread::sleep(self.poll_delay);
            }
        }
        log::warn!("Service {} is {}, expected running", name, last);
        false
    }
}

// ============================================
// sc.exe IMPLEMENTATION
// ============================================

/// `START_TYPE         : 3   DEMAND_START`
pub fn parse_start_type(output: &str) -> StartType {
    let Some(value) = field_value(output, "START_TYPE") else {
        return StartType::Unknown;
    };
    match value.split_whitespace().next().and_then(|n| n.parse::<u32>().ok()) {
        Some(0) => StartType::Boot,
        Some(1) => StartType::System,
        Some(2) => StartType::Auto,
        Some(3) => StartType::Demand,
        Some(4) => StartType::Disabled,
        _ => StartType::Unknown,
    }
}

/// `STATE              : 4  RUNNING`
pub fn parse_state(output: &str) -> ServiceState {
    let Some(value) = field_value(output, "STATE") else {
        return ServiceState::Other;
    };
    match value.split_whitespace().next().and_then(|n| n.parse::<u32>().ok()) {
        Some(1) => ServiceState::Stopped,
        Some(2) => ServiceState::StartPending,
        Some(3) => ServiceState::StopPending,
        Some(4) => ServiceState::Running,
        Some(7) => ServiceState::Paused,
        _ => ServiceState::Other,
    }
}

fn field_value<'a>(output: &'a str, key: &str) -> Option<&'a str> {
    output.lines().find_map(|line| {
        let (k, v) = line.split_once(':')?;
        (k.trim() == key).then(|| v.trim())
    })
}

pub struct ScServiceControl;

impl ScServiceControl {
    fn sc(&self, verb: &str, service: &str) -> Result<String, ServiceError> {
        let output = process::run("sc", [verb, service]).map_err(|e| ServiceError {
            service: service.to_string(),
            message: e.to_string(),
        })?;
        if !output.success() {
            return Err(ServiceError {
                service: service.to_string(),
                message: output.combined(),
            });
        }
        Ok(output.stdout)
    }
}

impl ServiceControl for ScServiceControl {
    fn start_type(&self, service: &str) -> Result<StartType, ServiceError> {
        Ok(parse_start_type(&self.sc("qc", service)?))
    }

    fn state(&self, service: &str) -> Result<ServiceState, ServiceError> {
        Ok(parse_state(&self.sc("query", service)?))
    }
}
