//! Name registry for app subdomains
//!
//! Names become the leftmost label of an app's URL, so they are validated
//! before use and reserved for as long as their instance is alive.

use crate::error::NameError;
use parking_lot::Mutex;
use std::collections::HashSet;
use tracing::debug;

/// Tracks which app names are currently taken
#[derive(Debug, Default)]
pub struct NameRegistry {
    reserved: Mutex<HashSet<String>>,
}

impl NameRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Check that a name is usable as an app subdomain
    ///
    /// Must start with an ASCII letter or digit, followed by any number of
    /// letters, digits, spaces, underscores or hyphens.
    pub fn validate(name: &str) -> bool {
        let mut chars = name.chars();
        match chars.next() {
            Some(first) if first.is_ascii_alphanumeric() => {}
            _ => return false,
        }
        chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, ' ' | '_' | '-'))
    }

    /// Claim a name, failing if someone else already holds it
    pub fn reserve(&self, name: &str) -> Result<(), NameError> {
        if self.reserved.lock().insert(name.to_string()) {
            debug!(name, "Reserved app name");
            Ok(())
        } else {
            Err(NameError::AlreadyReserved(name.to_string()))
        }
    }

    /// Give a name back. Releasing a name that isn't held is a no-op.
    pub fn release(&self, name: &str) {
        if self.reserved.lock().remove(name) {
            debug!(name, "Released app name");
        }
    }

    pub fn is_reserved(&self, name: &str) -> bool {
        self.reserved.lock().contains(name)
    }

    pub fn len(&self) -> usize {
        self.reserved.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.reserved.lock().is_empty()
    }
}
