//! Weak references and finalizers.
//!
//! Finalizers run when the last strong handle of a [`Tracked`] value drops,
//! which is scheduling dependent. While recording, each finalizer is
//! bracketed by callback start/end events so its own stream activity can be
//! told apart from the surrounding program. The decision is made once, when
//! the weak reference is created.

use crate::context::Mode;
use crate::system::System;
use parking_lot::Mutex;
use retrace_log::StreamWriter;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

/// Finalizer body
pub type Callback = Box<dyn FnOnce() + Send>;

/// A finalizer, as registered
pub enum Finalizer {
    /// Bracketed by callback events on `writer`
    Wrapped {
        /// Recording stream
        writer: Arc<StreamWriter>,
        /// Finalizer body
        callback: Callback,
    },
    /// Invoked as-is
    PassThrough(Callback),
}

struct EndBracket<'a>(&'a StreamWriter);

impl Drop for EndBracket<'_> {
    fn drop(&mut self) {
        if let Err(err) = self.0.weakref_callback_end() {
            tracing::error!(%err, "cannot record finalizer end");
        }
    }
}

impl Finalizer {
    /// Run the finalizer
    pub fn run(self) {
        match self {
            Self::Wrapped { writer, callback } => {
                if let Err(err) = writer.weakref_callback_start() {
                    tracing::error!(%err, "cannot record finalizer start");
                }
                let _end = EndBracket(&writer);
                callback();
            }
            Self::PassThrough(callback) => callback(),
        }
    }

    /// Whether the finalizer is bracketed
    #[must_use]
    pub const fn is_wrapped(&self) -> bool {
        matches!(self, Self::Wrapped { .. })
    }
}

impl std::fmt::Debug for Finalizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(if self.is_wrapped() {
            "Finalizer::Wrapped"
        } else {
            "Finalizer::PassThrough"
        })
    }
}

static NEXT_REGISTRATION: AtomicU64 = AtomicU64::new(1);

struct Inner<T> {
    value: T,
    finalizers: Mutex<Vec<(u64, Finalizer)>>,
}

impl<T> Drop for Inner<T> {
    fn drop(&mut self) {
        let finalizers = std::mem::take(&mut *self.finalizers.lock());
        for (_, finalizer) in finalizers {
            finalizer.run();
        }
    }
}

/// A shared value whose weak references can carry finalizers
pub struct Tracked<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Tracked<T> {
    /// Track `value`
    pub fn new(value: T) -> Self {
        Self {
            inner: Arc::new(Inner {
                value,
                finalizers: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Tracked value
    #[must_use]
    pub fn get(&self) -> &T {
        &self.inner.value
    }

    /// Weak reference without a finalizer
    #[must_use]
    pub fn downgrade(&self) -> WeakRef<T> {
        WeakRef {
            inner: Arc::downgrade(&self.inner),
            registration: None,
        }
    }

    /// Weak reference whose `finalizer` runs when the value is released,
    /// unless the reference is dropped first
    #[must_use]
    pub fn downgrade_with(&self, finalizer: Finalizer) -> WeakRef<T> {
        let id = NEXT_REGISTRATION.fetch_add(1, Ordering::Relaxed);
        self.inner.finalizers.lock().push((id, finalizer));
        WeakRef {
            inner: Arc::downgrade(&self.inner),
            registration: Some(id),
        }
    }

    /// Strong handles to the value
    #[must_use]
    pub fn strong_count(&self) -> usize {
        Arc::strong_count(&self.inner)
    }
}

impl<T> Clone for Tracked<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: std::fmt::Debug> std::fmt::Debug for Tracked<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Tracked").field(&self.inner.value).finish()
    }
}

/// Weak reference to a [`Tracked`] value
pub struct WeakRef<T> {
    inner: Weak<Inner<T>>,
    registration: Option<u64>,
}

impl<T> WeakRef<T> {
    /// Strong handle, if the value is still alive
    #[must_use]
    pub fn upgrade(&self) -> Option<Tracked<T>> {
        self.inner.upgrade().map(|inner| Tracked { inner })
    }

    /// Whether the value is still alive
    #[must_use]
    pub fn is_alive(&self) -> bool {
        self.inner.strong_count() > 0
    }
}

impl<T> Drop for WeakRef<T> {
    fn drop(&mut self) {
        let Some(id) = self.registration else {
            return;
        };
        if let Some(inner) = self.inner.upgrade() {
            inner.finalizers.lock().retain(|(registered, _)| *registered != id);
        }
    }
}

impl<T> std::fmt::Debug for WeakRef<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WeakRef")
            .field("alive", &self.is_alive())
            .field("finalizer", &self.registration.is_some())
            .finish()
    }
}

impl System {
    /// Weak reference to `target` with an optional finalizer. Inside a
    /// record context the finalizer is bracketed by callback events;
    /// otherwise it is passed through.
    pub fn weak_ref<T, F>(&self, target: &Tracked<T>, callback: Option<F>) -> WeakRef<T>
    where
        F: FnOnce() + Send + 'static,
    {
        let Some(callback) = callback else {
            return target.downgrade();
        };
        let callback: Callback = Box::new(callback);
        let finalizer = match self.core.active().as_deref().map(|ctx| ctx.mode()) {
            Some(Mode::Record { writer, .. }) => Finalizer::Wrapped {
                writer: Arc::clone(writer),
                callback,
            },
            _ => Finalizer::PassThrough(callback),
        };
        tracing::trace!(?finalizer, "weak reference created");
        target.downgrade_with(finalizer)
    }
}
