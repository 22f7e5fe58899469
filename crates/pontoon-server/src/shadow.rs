//! The shadow map: client handle → live native object.
//!
//! The client mints a `u32` handle for every resource wrapper it hands the
//! game; create-commands carry that handle and the map binds it to the
//! native object the dispatcher produced. Every later command referencing
//! the handle resolves through here.
//!
//! Destruction policy: the transported API is refcounted and games
//! over-release with abandon, so destroy is "release until the count hits
//! zero, then stop". A single release is never trusted to have destroyed
//! the object, and releasing an already-dead binding is tolerated.

use std::collections::HashMap;

use parking_lot::Mutex;

/// Refcounting surface of a native object. `add_ref`/`release` return the
/// new count.
pub trait RefCounted {
    fn add_ref(&self) -> u32;
    fn release(&self) -> u32;
}

/// Handle → native binding table. Process-local; the handles themselves
/// are the cross-process currency.
pub struct ShadowMap<R: RefCounted + Clone> {
    entries: Mutex<HashMap<u32, R>>,
}

impl<R: RefCounted + Clone> ShadowMap<R> {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Bind `handle` to `native`, returning the native for call chaining.
    /// Rebinding a live handle indicates a client-side leak and is logged.
    pub fn track(&self, handle: u32, native: R) -> R {
        let previous = self.entries.lock().insert(handle, native.clone());
        if previous.is_some() {
            tracing::warn!(handle, "shadow handle rebound while still live");
        }
        native
    }

    /// Look up a handle, taking a reference on the native object.
    pub fn resolve(&self, handle: u32) -> Option<R> {
        let entries = self.entries.lock();
        let native = entries.get(&handle)?;
        native.add_ref();
        Some(native.clone())
    }

    /// Look up a handle; when no binding exists yet, build the wrapper,
    /// bind it, and return it. Existing bindings get a reference taken,
    /// exactly like [`ShadowMap::resolve`].
    pub fn resolve_or_track(&self, handle: u32, create: impl FnOnce() -> R) -> R {
        let mut entries = self.entries.lock();
        if let Some(native) = entries.get(&handle) {
            native.add_ref();
            return native.clone();
        }
        let native = create();
        entries.insert(handle, native.clone());
        native
    }

    /// Whether a binding exists, without touching its refcount.
    pub fn contains(&self, handle: u32) -> bool {
        self.entries.lock().contains_key(&handle)
    }

    /// Destroy the binding: release the native until its count reaches
    /// zero. Missing handles are tolerated (auxiliary destroys race the
    /// primary one).
    pub fn erase(&self, handle: u32) -> bool {
        let Some(native) = self.entries.lock().remove(&handle) else {
            tracing::debug!(handle, "erase of unknown shadow handle");
            return false;
        };
        let mut guard = 0u32;
        while native.release() > 0 {
            guard += 1;
            if guard > 1_000_000 {
                tracing::error!(handle, "native refcount refuses to reach zero");
                break;
            }
        }
        true
    }

    /// Drop the binding without touching the native refcount (the client
    /// asked to unlink, not destroy).
    pub fn unlink(&self, handle: u32) -> bool {
        self.entries.lock().remove(&handle).is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Log any bindings still alive at shutdown. Returns true when leaks
    /// were found.
    pub fn dump_leaks(&self, kind: &str) -> bool {
        let entries = self.entries.lock();
        if entries.is_empty() {
            return false;
        }
        tracing::warn!(kind, count = entries.len(), "leaked shadow bindings");
        for handle in entries.keys() {
            tracing::warn!(kind, handle, "  leaked handle");
        }
        true
    }
}

impl<R: RefCounted + Clone> Default for ShadowMap<R> {
    fn default() -> Self {
        Self::new()
    }
}
