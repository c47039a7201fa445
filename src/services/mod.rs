//! Quiescing of the web-related services while the pipeline runs.
//!
//! All operations are best effort: a failure of one service is logged and
//! recorded, but never aborts the operation for the remaining services.

pub mod manager;

use std::collections::BTreeMap;

use derive_more::Display;

pub use manager::{ServiceControlError, ServiceManager};

/// Last known state of a service in a [ServiceSet].
#[derive(Copy, Clone, Debug, Display, PartialEq, Eq)]
pub enum ServiceState {
    #[display("unknown")]
    Unknown,
    #[display("running")]
    Running,
    #[display("stopped")]
    Stopped,
}

/// State of a service before the pipeline touched it.
#[derive(Copy, Clone, Debug, Display, PartialEq, Eq)]
pub enum PriorState {
    #[display("running")]
    Running,
    #[display("stopped")]
    Stopped,
}

/// Outcome of restarting a single service.
#[derive(Copy, Clone, Debug, Display, PartialEq, Eq)]
pub enum StartOutcome {
    #[display("started")]
    Started,
    #[display("already running")]
    AlreadyRunning,
    /// Service was stopped before the run and is left alone.
    #[display("left stopped")]
    LeftStopped,
}

#[derive(Clone, Debug)]
struct Service {
    name: String,
    state: ServiceState,
}

/// Ordered set of services considered web-related.
#[derive(Clone, Debug, Default)]
pub struct ServiceSet {
    services: Vec<Service>,
}

impl ServiceSet {
    pub fn new<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut services: Vec<Service> = Vec::new();
        for name in names {
            let name = name.into();
            if !services.iter().any(|s| s.name == name) {
                services.push(Service {
                    name,
                    state: ServiceState::Unknown,
                });
            }
        }

        Self { services }
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.services.iter().map(|s| s.name.as_str())
    }

    pub fn state(&self, name: &str) -> Option<ServiceState> {
        self.services
            .iter()
            .find(|s| s.name == name)
            .map(|s| s.state)
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }

    fn mark(&mut self, name: &str, state: ServiceState) {
        if let Some(service) = self.services.iter_mut().find(|s| s.name == name) {
            service.state = state;
        }
    }
}

/// Prior states captured by [`ServiceController::stop_all`], in stop order.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PriorStates {
    states: Vec<(String, PriorState)>,
    /// Services which were running but could not be stopped.
    pub stop_failures: BTreeMap<String, String>,
}

impl PriorStates {
    pub fn get(&self, name: &str) -> Option<PriorState> {
        self.states
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, state)| *state)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, PriorState)> {
        self.states.iter().map(|(n, s)| (n.as_str(), *s))
    }

    /// Names of the services which have been running before the run.
    pub fn running(&self) -> impl Iterator<Item = &str> {
        self.iter()
            .filter(|(_, s)| *s == PriorState::Running)
            .map(|(n, _)| n)
    }
}

pub type StartResults = BTreeMap<String, Result<StartOutcome, ServiceControlError>>;

/// Stops and restarts a [ServiceSet] using a [ServiceManager].
pub struct ServiceController<'a> {
    manager: &'a dyn ServiceManager,
}

impl<'a> ServiceController<'a> {
    pub fn new(manager: &'a dyn ServiceManager) -> Self {
        Self { manager }
    }

    /// Stop every running service of `set` and return the state each was in before.
    pub fn stop_all(&self, set: &mut ServiceSet) -> PriorStates {
        let mut prior = PriorStates::default();
        let names: Vec<String> = set.names().map(String::from).collect();

        for name in names {
            let running = match self.manager.is_active(&name) {
                Ok(running) => running,
                Err(e) => {
                    log::warn!(target: "services", "Querying state of {name} failed, assuming it is stopped: {e}");
                    false
                }
            };

            if !running {
                log::debug!(target: "services", "{name} is not running, leaving it alone");
                set.mark(&name, ServiceState::Stopped);
                prior.states.push((name, PriorState::Stopped));
                continue;
            }

            prior.states.push((name.clone(), PriorState::Running));
            match self.manager.stop(&name) {
                Ok(()) => {
                    log::info!(target: "services", "Stopped {name}");
                    set.mark(&name, ServiceState::Stopped);
                }
                Err(e) => {
                    log::warn!(target: "services", "Stopping {name} failed: {e}");
                    set.mark(&name, ServiceState::Running);
                    prior.stop_failures.insert(name, e.to_string());
                }
            }
        }

        prior
    }

    /// Start every service which was running according to `prior`.
    ///
    /// Calling this repeatedly is harmless: services already running are
    /// reported as [`StartOutcome::AlreadyRunning`].
    pub fn start_all(&self, prior: &PriorStates, set: &mut ServiceSet) -> StartResults {
        let mut results = StartResults::new();

        // restart in reverse stop order
        for (name, state) in prior.states.iter().rev() {
            let result = match state {
                PriorState::Stopped => Ok(StartOutcome::LeftStopped),
                PriorState::Running => self.start_one(name, set),
            };
            results.insert(name.clone(), result);
        }

        results
    }

    fn start_one(&self, name: &str, set: &mut ServiceSet) -> Result<StartOutcome, ServiceControlError> {
        if self.manager.is_active(name).unwrap_or(false) {
            set.mark(name, ServiceState::Running);
            return Ok(StartOutcome::AlreadyRunning);
        }

        match self.manager.start(name) {
            Ok(()) => {
                log::info!(target: "services", "Started {name}");
                set.mark(name, ServiceState::Running);
                Ok(StartOutcome::Started)
            }
            Err(e) => {
                log::error!(target: "services", "Starting {name} failed: {e}");
                Err(e)
            }
        }
    }
}

/// Services stopped for the duration of a pipeline step.
///
/// The services are restarted exactly once: either through [release](Self::release)
/// or, if the guard is dropped without releasing, on drop.
pub struct StoppedServices<'a> {
    controller: ServiceController<'a>,
    set: ServiceSet,
    prior: PriorStates,
    released: Option<StartResults>,
}

impl<'a> StoppedServices<'a> {
    /// Stop all services of `set`.
    pub fn acquire(manager: &'a dyn ServiceManager, mut set: ServiceSet) -> Self {
        let controller = ServiceController::new(manager);
        let prior = controller.stop_all(&mut set);

        Self {
            controller,
            set,
            prior,
            released: None,
        }
    }

    pub fn prior(&self) -> &PriorStates {
        &self.prior
    }

    pub fn set(&self) -> &ServiceSet {
        &self.set
    }

    /// Restart the services which were running before [acquire](Self::acquire).
    ///
    /// Only the first call acts; later calls return the same results.
    pub fn release(&mut self) -> &StartResults {
        if self.released.is_none() {
            let results = self.controller.start_all(&self.prior, &mut self.set);
            self.released = Some(results);
        }

        self.released.get_or_insert_with(StartResults::new)
    }

    /// Whether every previously running service is running again.
    pub fn restored(&self) -> Option<bool> {
        self.released
            .as_ref()
            .map(|results| results.values().all(Result::is_ok))
    }
}

impl Drop for StoppedServices<'_> {
    fn drop(&mut self) {
        if self.released.is_none() {
            log::warn!(target: "services", "Restarting services during unwind");
            let results = self.release();
            for (name, result) in results {
                if let Err(e) = result {
                    log::error!(target: "services", "{name} could not be restarted: {e}");
                }
            }
        }
    }
}
