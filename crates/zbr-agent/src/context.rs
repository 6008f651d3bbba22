use std::sync::{Arc, Mutex, MutexGuard};

use crate::settings::Settings;

/// Process-local view of the run and test currently being reported.
///
/// `test_id` is only ever set while `run_id` is set.
#[derive(Debug, Clone, Default)]
pub struct RunContext {
    pub run_id: Option<u64>,
    pub test_id: Option<u64>,
    pub is_reverted: bool,
    pub settings: Option<Arc<Settings>>,
}

impl RunContext {
    pub fn new(settings: Option<Arc<Settings>>) -> Self {
        Self {
            settings,
            ..Self::default()
        }
    }

    pub fn is_configured(&self) -> bool {
        self.settings
            .as_ref()
            .is_some_and(|settings| settings.enabled)
    }

    pub fn run_is_active(&self) -> bool {
        self.is_configured() && self.run_id.is_some()
    }

    pub fn test_is_active(&self) -> bool {
        self.run_is_active() && self.test_id.is_some()
    }

    /// Run and test ids when a test is active.
    pub fn active_test(&self) -> Option<(u64, u64)> {
        if !self.test_is_active() {
            return None;
        }
        self.run_id.zip(self.test_id)
    }

    /// Run id when a run is active.
    pub fn active_run(&self) -> Option<u64> {
        if self.run_is_active() {
            self.run_id
        } else {
            None
        }
    }
}

pub type SharedRunContext = Arc<Mutex<RunContext>>;

pub(crate) fn lock_or_recover<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
