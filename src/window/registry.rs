//! Authoritative in-memory index of live windows.

use super::{Window, WindowId, WindowState};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Single source of truth for live windows.
///
/// The lock guards only map operations and is never held across I/O;
/// per-window mutation happens on the `Window` itself. An entry may remain
/// briefly while its teardown completes, so lookup callers check state
/// before acting; enumeration always filters `Terminal` entries out.
pub struct Registry {
    windows: Mutex<HashMap<WindowId, Arc<Window>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self {
            windows: Mutex::new(HashMap::new()),
        }
    }

    pub fn insert(&self, window: Arc<Window>) {
        self.windows
            .lock()
            .unwrap()
            .insert(window.id().clone(), window);
    }

    pub fn get(&self, id: &WindowId) -> Option<Arc<Window>> {
        self.windows.lock().unwrap().get(id).cloned()
    }

    /// Remove an entry. Idempotent.
    pub fn remove(&self, id: &WindowId) -> Option<Arc<Window>> {
        self.windows.lock().unwrap().remove(id)
    }

    /// All live (non-Terminal) windows.
    pub fn list(&self) -> Vec<Arc<Window>> {
        self.windows
            .lock()
            .unwrap()
            .values()
            .filter(|w| w.state() != WindowState::Terminal)
            .cloned()
            .collect()
    }

    /// Number of live windows.
    pub fn len(&self) -> usize {
        self.list().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Take every entry, leaving the registry empty. Used on shutdown.
    pub fn drain(&self) -> Vec<Arc<Window>> {
        let mut windows = self.windows.lock().unwrap();
        std::mem::take(&mut *windows).into_values().collect()
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}
