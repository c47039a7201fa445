use std::process::Command;

use derive_more::{Display, Error};

use crate::environment::ServiceManagerKind;

/// Failure of a single service operation.
#[derive(Debug, Display, Error)]
pub enum ServiceControlError {
    /// The service manager binary could not be executed.
    #[display("Running `{command}` failed: {source}")]
    NotRun {
        command: String,
        source: std::io::Error,
    },
    /// The service manager reported a failure.
    #[display("`{command}` failed: {stderr}")]
    CommandFailed {
        command: String,
        #[error(ignore)]
        stderr: String,
    },
    /// No service manager known for this host.
    #[display("No supported service manager, manual action required for {_0}")]
    ManualActionRequired(#[error(ignore)] String),
}

/// Control of the services of the host.
pub trait ServiceManager: Send + Sync {
    /// Whether the service is currently running.
    fn is_active(&self, service: &str) -> Result<bool, ServiceControlError>;

    fn stop(&self, service: &str) -> Result<(), ServiceControlError>;

    fn start(&self, service: &str) -> Result<(), ServiceControlError>;
}

/// Select the [ServiceManager] for `kind`.
pub fn for_kind(kind: ServiceManagerKind) -> Box<dyn ServiceManager> {
    match kind {
        ServiceManagerKind::Systemd => Box::new(Systemd),
        ServiceManagerKind::Launchd => Box::new(Launchd),
        ServiceManagerKind::OpenRc => Box::new(OpenRc),
        ServiceManagerKind::Unknown => Box::new(Manual),
    }
}

fn execute_command(program: &str, args: &[&str]) -> Result<(bool, String), ServiceControlError> {
    let command = format!("{program} {}", args.join(" "));
    log::trace!(target: "services::manager", "Running: {command}");

    let output = Command::new(program)
        .args(args)
        .output()
        .map_err(|source| ServiceControlError::NotRun {
            command: command.clone(),
            source,
        })?;

    let stdout = String::from_utf8_lossy(&output.stdout).trim_end().to_string();
    let stderr = String::from_utf8_lossy(&output.stderr);
    if !output.status.success() {
        log::trace!(target: "services::manager", "`{command}` exited with {}: {stderr}", output.status);
        return Ok((false, stderr.trim_end().to_string()));
    }

    // relay stderr
    if !stderr.is_empty() {
        log::warn!(target: "services::manager", "{}", stderr.trim_end());
    }

    Ok((true, stdout))
}

fn expect_success(program: &str, args: &[&str]) -> Result<(), ServiceControlError> {
    match execute_command(program, args)? {
        (true, _) => Ok(()),
        (false, stderr) => Err(ServiceControlError::CommandFailed {
            command: format!("{program} {}", args.join(" ")),
            stderr,
        }),
    }
}

/// `systemctl` based service control.
#[derive(Debug, Clone, Copy)]
pub struct Systemd;

impl ServiceManager for Systemd {
    fn is_active(&self, service: &str) -> Result<bool, ServiceControlError> {
        // non-zero exit for inactive, failed and unknown units
        let (active, _) = execute_command("systemctl", &["is-active", "--quiet", service])?;
        Ok(active)
    }

    fn stop(&self, service: &str) -> Result<(), ServiceControlError> {
        expect_success("systemctl", &["stop", service])
    }

    fn start(&self, service: &str) -> Result<(), ServiceControlError> {
        expect_success("systemctl", &["start", service])
    }
}

/// `launchctl` based service control of Homebrew services.
#[derive(Debug, Clone, Copy)]
pub struct Launchd;

impl ServiceManager for Launchd {
    fn is_active(&self, service: &str) -> Result<bool, ServiceControlError> {
        let (known, listing) = execute_command("launchctl", &["list", service])?;
        // a loaded but stopped job has no "PID" key
        Ok(known && listing.contains("\"PID\""))
    }

    fn stop(&self, service: &str) -> Result<(), ServiceControlError> {
        expect_success("launchctl", &["stop", service])
    }

    fn start(&self, service: &str) -> Result<(), ServiceControlError> {
        expect_success("launchctl", &["start", service])
    }
}

/// `rc-service` based service control.
#[derive(Debug, Clone, Copy)]
pub struct OpenRc;

impl ServiceManager for OpenRc {
    fn is_active(&self, service: &str) -> Result<bool, ServiceControlError> {
        let (running, _) = execute_command("rc-service", &[service, "status"])?;
        Ok(running)
    }

    fn stop(&self, service: &str) -> Result<(), ServiceControlError> {
        expect_success("rc-service", &[service, "stop"])
    }

    fn start(&self, service: &str) -> Result<(), ServiceControlError> {
        expect_success("rc-service", &[service, "start"])
    }
}

/// Hosts without a known service manager.
///
/// Every service is reported as not running, so it is neither stopped nor
/// started by the backup.
#[derive(Debug, Clone, Copy)]
pub struct Manual;

impl ServiceManager for Manual {
    fn is_active(&self, service: &str) -> Result<bool, ServiceControlError> {
        log::warn!(target: "services::manager", "Unable to query {service}: no supported service manager");
        Ok(false)
    }

    fn stop(&self, service: &str) -> Result<(), ServiceControlError> {
        Err(ServiceControlError::ManualActionRequired(service.to_string()))
    }

    fn start(&self, service: &str) -> Result<(), ServiceControlError> {
        Err(ServiceControlError::ManualActionRequired(service.to_string()))
    }
}
