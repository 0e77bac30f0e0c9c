//! Persistence for endpoint rotation indices.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;

use nebula_config::EndpointState;

/// Where the orchestrator keeps each entry's current endpoint index.
pub trait EndpointStore: Send + Sync {
    /// Index saved for `slot`, if any.
    fn load(&self, slot: usize) -> Option<usize>;
    /// Remember `index` for `slot`.
    fn save(&self, slot: usize, index: usize);
}

/// In-process store; rotation resets with the process.
#[derive(Debug, Default)]
pub struct MemoryEndpointStore {
    indices: Mutex<HashMap<usize, usize>>,
}

impl MemoryEndpointStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl EndpointStore for MemoryEndpointStore {
    fn load(&self, slot: usize) -> Option<usize> {
        self.indices
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(&slot)
            .copied()
    }

    fn save(&self, slot: usize, index: usize) {
        self.indices
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(slot, index);
    }
}

/// Store backed by `endpoints.ron` in a directory. Every save rewrites the
/// file; write failures are logged and otherwise ignored.
#[derive(Debug)]
pub struct FileEndpointStore {
    dir: PathBuf,
    state: Mutex<EndpointState>,
}

impl FileEndpointStore {
    /// Open the store in `dir`. A missing file starts empty; an unreadable
    /// one is logged and replaced on the next save.
    pub fn open(dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        let state = EndpointState::load_or_default(&dir).unwrap_or_else(|e| {
            tracing::warn!(dir = %dir.display(), "Ignoring endpoint state: {e}");
            EndpointState::default()
        });
        Self {
            dir,
            state: Mutex::new(state),
        }
    }
}

impl EndpointStore for FileEndpointStore {
    fn load(&self, slot: usize) -> Option<usize> {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(slot)
    }

    fn save(&self, slot: usize, index: usize) {
        let mut state = self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        if state.get(slot) == Some(index) {
            return;
        }
        state.set(slot, index);
        if let Err(e) = state.save(&self.dir) {
            tracing::warn!(dir = %self.dir.display(), "Failed to persist endpoint state: {e}");
        }
    }
}
