//! Identities used to tag and demultiplex events.
//!
//! Threads are identified by a logical [`ThreadKey`] derived from the spawn
//! tree, never by OS thread ids, so the same program produces the same keys
//! on every run.

use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::fmt;
use uuid::Uuid;

/// Logical thread identity: the path of spawn indices from the root thread
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ThreadKey(Vec<u32>);

impl ThreadKey {
    /// The root thread of a context
    #[must_use]
    pub const fn root() -> Self {
        Self(Vec::new())
    }

    /// The `index`-th thread spawned by this one
    #[must_use]
    pub fn child(&self, index: u32) -> Self {
        let mut path = self.0.clone();
        path.push(index);
        Self(path)
    }

    /// Spawn path
    #[must_use]
    pub fn path(&self) -> &[u32] {
        &self.0
    }

    /// Whether this is the root thread
    #[must_use]
    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    /// Logical identity of the calling thread
    #[must_use]
    pub fn current() -> Self {
        IDENTITY.with(|id| id.borrow().key.clone())
    }

    /// Allocate the key for the next thread the calling thread spawns
    #[must_use]
    pub fn next_child() -> Self {
        IDENTITY.with(|id| {
            let mut id = id.borrow_mut();
            let index = id.spawned;
            id.spawned += 1;
            id.key.child(index)
        })
    }

    /// Make `self` the calling thread's identity until the guard drops.
    /// The spawn counter restarts at zero for the duration.
    #[must_use = "the previous identity is restored as soon as the guard drops"]
    pub fn enter(self) -> IdentityGuard {
        let previous = IDENTITY.with(|id| {
            std::mem::replace(
                &mut *id.borrow_mut(),
                Identity {
                    key: self,
                    spawned: 0,
                },
            )
        });
        IdentityGuard {
            previous: Some(previous),
        }
    }
}

impl fmt::Display for ThreadKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            return f.write_str("main");
        }
        f.write_str("main")?;
        for index in &self.0 {
            write!(f, ".{}", index)?;
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
struct Identity {
    key: ThreadKey,
    spawned: u32,
}

thread_local! {
    static IDENTITY: RefCell<Identity> = RefCell::new(Identity::default());
}

/// Restores the previous thread identity on drop
#[derive(Debug)]
pub struct IdentityGuard {
    previous: Option<Identity>,
}

impl Drop for IdentityGuard {
    fn drop(&mut self) {
        if let Some(previous) = self.previous.take() {
            let _ = IDENTITY.try_with(|id| *id.borrow_mut() = previous);
        }
    }
}

/// Process identity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ProcessKey(pub u32);

impl ProcessKey {
    /// The calling process
    #[must_use]
    pub fn current() -> Self {
        Self(std::process::id())
    }
}

impl fmt::Display for ProcessKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pid:{}", self.0)
    }
}

/// Unique identifier of one recording
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RecordingId(Uuid);

impl RecordingId {
    /// Generate a fresh id
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Underlying UUID
    #[must_use]
    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for RecordingId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RecordingId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "rec_{}", self.0)
    }
}
