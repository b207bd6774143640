//! Per-name workflow locks
//!
//! Create, clone and delete hold the lock for their instance name for the
//! whole workflow. A second workflow on the same name fails fast instead of
//! waiting.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::debug;

use crate::error::{ProvisionError, Result};

type Held = Arc<Mutex<HashSet<String>>>;

fn lock(held: &Held) -> MutexGuard<'_, HashSet<String>> {
    // The set stays consistent even if a holder panicked.
    held.lock().unwrap_or_else(|e| e.into_inner())
}

/// Set of instance names with a workflow in progress.
#[derive(Debug, Clone, Default)]
pub struct NameLocks {
    held: Held,
}

impl NameLocks {
    /// Empty lock set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `name` until the returned guard is dropped.
    pub fn acquire(&self, name: &str) -> Result<NameGuard> {
        if !lock(&self.held).insert(name.to_string()) {
            return Err(ProvisionError::InvalidParameter(format!(
                "another operation on {name} is in progress"
            )));
        }
        debug!("Locked {}", name);
        Ok(NameGuard {
            held: Arc::clone(&self.held),
            name: name.to_string(),
        })
    }

    /// Whether a workflow currently holds `name`.
    pub fn is_held(&self, name: &str) -> bool {
        lock(&self.held).contains(name)
    }
}

/// Releases its name on drop.
#[derive(Debug)]
pub struct NameGuard {
    held: Held,
    name: String,
}

impl Drop for NameGuard {
    fn drop(&mut self) {
        lock(&self.held).remove(&self.name);
        debug!("Unlocked {}", self.name);
    }
}
