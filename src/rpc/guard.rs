use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Lets at most one holder run a named operation at a time.
#[derive(Debug)]
pub struct SingleFlight {
    name: &'static str,
    busy: AtomicBool,
}

impl SingleFlight {
    pub fn new(name: &'static str) -> Arc<Self> {
        Arc::new(Self {
            name,
            busy: AtomicBool::new(false),
        })
    }

    /// `None` when another holder is active. The flag clears when the
    /// returned guard drops, on every exit path.
    pub fn try_acquire(self: &Arc<Self>) -> Option<FlightGuard> {
        if self
            .busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!(flight = self.name, "operation already running");
            return None;
        }
        Some(FlightGuard {
            flight: Arc::clone(self),
        })
    }

    pub fn is_held(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }
}

#[derive(Debug)]
pub struct FlightGuard {
    flight: Arc<SingleFlight>,
}

impl Drop for FlightGuard {
    fn drop(&mut self) {
        self.flight.busy.store(false, Ordering::Release);
    }
}

/// The long-running operations the dispatcher refuses to overlap.
#[derive(Debug)]
pub struct Flights {
    pub agent_update: Arc<SingleFlight>,
    pub win_update_scan: Arc<SingleFlight>,
    pub win_update_install: Arc<SingleFlight>,
}

impl Flights {
    pub fn new() -> Self {
        Self {
            agent_update: SingleFlight::new("agentupdate"),
            win_update_scan: SingleFlight::new("getwinupdates"),
            win_update_install: SingleFlight::new("installwinupdates"),
        }
    }
}

impl Default for Flights {
    fn default() -> Self {
        Self::new()
    }
}
