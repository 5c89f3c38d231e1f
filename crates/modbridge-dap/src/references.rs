use std::collections::HashMap;

use modbridge_wire::wire::{ScopeKind, TargetFrameId, TargetHandle};
use thiserror::Error;

/// What a DAP `frameId`/`variablesReference` points at on the target side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reference {
    Frame {
        frame: TargetFrameId,
    },
    /// One of the four fixed scopes of a frame. The target handle is resolved
    /// lazily the first time the scope is expanded.
    Scope {
        frame: TargetFrameId,
        kind: ScopeKind,
        handle: Option<TargetHandle>,
    },
    /// An expandable value (table, temporaries, ...).
    Container {
        handle: TargetHandle,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ReferenceError {
    #[error("reference {0} is no longer valid; the target has resumed since it was issued")]
    Expired(i64),
    #[error("unknown reference {0}")]
    Unknown(i64),
}

/// Ids handed to the client for frames, scopes and expandable values.
///
/// Entries live for one stopped state. Ids are never reused: after a
/// [`ReferenceTable::reset`] every earlier id resolves to
/// [`ReferenceError::Expired`].
#[derive(Debug)]
pub struct ReferenceTable {
    next: i64,
    /// First id issued in the current stopped state.
    epoch_start: i64,
    entries: HashMap<i64, Reference>,
}

impl Default for ReferenceTable {
    fn default() -> Self {
        Self {
            next: 1,
            epoch_start: 1,
            entries: HashMap::new(),
        }
    }
}

impl ReferenceTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, reference: Reference) -> i64 {
        let id = self.next;
        self.next += 1;
        self.entries.insert(id, reference);
        id
    }

    pub fn get(&self, id: i64) -> Result<Reference, ReferenceError> {
        if let Some(reference) = self.entries.get(&id) {
            return Ok(*reference);
        }
        if id > 0 && id < self.epoch_start {
            Err(ReferenceError::Expired(id))
        } else {
            Err(ReferenceError::Unknown(id))
        }
    }

    /// Remember the target handle a scope resolved to.
    pub fn resolve_scope(&mut self, id: i64, resolved: TargetHandle) {
        if let Some(Reference::Scope { handle, .. }) = self.entries.get_mut(&id) {
            *handle = Some(resolved);
        }
    }

    /// Drop every entry; ids issued so far become expired.
    pub fn reset(&mut self) {
        self.entries.clear();
        self.epoch_start = self.next;
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
