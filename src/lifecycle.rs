use log::warn;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Lifecycle {
    Uninitialized,
    Running,
    Stopped,
}

impl Default for Lifecycle {
    fn default() -> Self {
        Lifecycle::Uninitialized
    }
}

impl Lifecycle {
    pub fn is_running(&self) -> bool {
        *self == Lifecycle::Running
    }
}

/// Called by component handles when their actor is gone. Debug builds abort so
/// lifecycle bugs surface in tests, release builds drop the call.
pub fn used_after_stop(component: &str) {
    debug_assert!(false, "{component} used after stop");
    warn!("Ignoring call to {component} after it was stopped. ");
}
