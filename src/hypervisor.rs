// ============================================
// FFU Builder - hypervisor.rs
// ============================================
// The narrow slice of VM control the capture step needs: start the
// build VM and report its power state. Creating, configuring and
// deleting VMs is someone else's job.
// ============================================

use std::process::Command;
use thiserror::Error;

use crate::process;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerState {
    Off,
    Running,
    Paused,
    Saved,
    Other,
}

impl PowerState {
    pub fn parse(text: &str) -> PowerState {
        match text.trim().to_ascii_lowercase().as_str() {
            "off" => PowerState::Off,
            "running" => PowerState::Running,
            "paused" => PowerState::Paused,
            "saved" => PowerState::Saved,
            _ => PowerState::Other,
        }
    }
}

#[derive(Debug, Error)]
pub enum HypervisorError {
    #[error("VM {vm}: {operation} failed: {message}")]
    Tool {
        vm: String,
        operation: &'static str,
        message: String,
    },
}

pub trait HypervisorProvider {
    fn start_vm(&self, vm: &str, show_console: bool) -> Result<(), HypervisorError>;
    fn power_state(&self, vm: &str) -> Result<PowerState, HypervisorError>;
}

/// Hyper-V through its PowerShell module.
pub struct HyperV;

impl HyperV {
    fn run(&self, vm: &str, operation: &'static str, script: &str) -> Result<String, HypervisorError> {
        let output = process::powershell(script).map_err(|e| HypervisorError::Tool {
            vm: vm.to_string(),
            operation,
            message: e.to_string(),
        })?;
        if !output.success() {
            return Err(HypervisorError::Tool {
                vm: vm.to_string(),
                operation,
                message: output.combined(),
            });
        }
        Ok(output.stdout)
    }
}

fn quote(name: &str) -> String {
    format!("'{}'", name.replace('\'', "''"))
}

impl HypervisorProvider for HyperV {
    fn start_vm(&self, vm: &str, show_console: bool) -> Result<(), HypervisorError> {
        log::info!("Starting VM {}", vm);
        self.run(vm, "Start-VM", &format!("Start-VM -Name {}", quote(vm)))?;

        if show_console {
            // vmconnect stays open until the operator closes it; don't wait.
            if let Err(e) = Command::new("vmconnect").args(["localhost", vm]).spawn() {
                log::warn!("Could not open a console for {}: {}", vm, e);
            }
        }
        Ok(())
    }

    fn power_state(&self, vm: &str) -> Result<PowerState, HypervisorError> {
        let stdout = self.run(vm, "Get-VM", &format!("(Get-VM -Name {}).State", quote(vm)))?;
        Ok(PowerState::parse(&stdout))
    }
}
