//! Installation bookkeeping.
//!
//! Each install step registers how to undo itself. Teardown runs the undo
//! steps in reverse order of installation, once.

use parking_lot::Mutex;

type Undo = Box<dyn FnOnce() + Send>;

#[derive(Default)]
struct Steps {
    active: bool,
    undo: Vec<(&'static str, Undo)>,
}

/// Reverse-order teardown of installed steps
#[derive(Default)]
pub struct Installation {
    steps: Mutex<Steps>,
}

impl Installation {
    /// Nothing installed
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark the installation as started
    pub fn activate(&self) {
        self.steps.lock().active = true;
    }

    /// Whether anything is installed
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.steps.lock().active
    }

    /// Register the undo action of an installed step
    pub fn push(&self, name: &'static str, undo: impl FnOnce() + Send + 'static) {
        self.steps.lock().undo.push((name, Box::new(undo)));
    }

    /// Installed steps
    #[must_use]
    pub fn len(&self) -> usize {
        self.steps.lock().undo.len()
    }

    /// Whether no steps are installed
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.steps.lock().undo.is_empty()
    }

    /// Undo every step, last first. Returns the number of steps undone;
    /// zero on repeated calls.
    pub fn uninstall(&self) -> usize {
        let undo = {
            let mut steps = self.steps.lock();
            steps.active = false;
            std::mem::take(&mut steps.undo)
        };
        let count = undo.len();
        for (name, step) in undo.into_iter().rev() {
            tracing::debug!(step = name, "uninstalling");
            step();
        }
        count
    }
}

impl std::fmt::Debug for Installation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let steps = self.steps.lock();
        let names: Vec<_> = steps.undo.iter().map(|(name, _)| *name).collect();
        f.debug_struct("Installation")
            .field("active", &steps.active)
            .field("steps", &names)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_reverse_order_once() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let installation = Installation::new();
        installation.activate();
        for name in ["hooks", "hash", "patches"] {
            let log = Arc::clone(&log);
            installation.push(name, move || log.lock().push(name));
        }
        assert_eq!(installation.len(), 3);

        assert_eq!(installation.uninstall(), 3);
        assert_eq!(*log.lock(), vec!["patches", "hash", "hooks"]);
        assert!(!installation.is_active());

        assert_eq!(installation.uninstall(), 0);
        assert_eq!(log.lock().len(), 3);
        assert!(installation.is_empty());
    }
}
