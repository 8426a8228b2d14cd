//! Callback registration and dispatch (component F).
//!
//! A callback is a host closure the guest must be able to call back into as
//! if it were an ordinary exported routine: the guest holds a function
//! pointer (in this design, a [`CallbackId`] trampoline the RPC protocol
//! recognizes) and the host resolves `callback_invoke` requests against
//! [`CallbackFactory`]. Because the routine that owns the callback may
//! itself still be running on the guest, `callback_invoke` arrives over the
//! same reverse channel a session keeps open for exactly this, and may nest
//! arbitrarily deep — a callback calling a routine that calls another
//! callback — so dispatch must not hold a lock across the user closure.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use crate::error::BridgeError;
use crate::types::{Decl, TypeDesc, encode};
use crate::value::Arg;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct CallbackId(pub u64);

/// The closure type a callback wraps. Boxed so [`CallbackFactory::register`]
/// can accept any `Fn(&[Arg]) -> Result<Arg, BridgeError>` closure, matching
/// how a Python callback can be any callable.
pub type CallbackFn = dyn Fn(&[Arg]) -> Result<Arg, BridgeError> + Send + Sync;

/// What the guest needs to build a function-pointer trampoline for a
/// registered callback: its id and its declared signature.
#[derive(Debug, Clone)]
pub struct CallbackHandle {
    pub id: CallbackId,
    pub argument_types: Vec<TypeDesc>,
    pub return_type: TypeDesc,
}

struct Entry {
    argument_types: Vec<TypeDesc>,
    return_type: TypeDesc,
    f: Option<Arc<CallbackFn>>,
}

/// Registers host closures and dispatches `callback_invoke` requests
/// against them. One factory per session; shared between the session's
/// public API and its reverse-RPC request handler.
#[derive(Default)]
pub struct CallbackFactory {
    next_id: AtomicU64,
    callbacks: RwLock<HashMap<u64, Entry>>,
}

impl CallbackFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a closure as a callback with the given declared signature.
    /// The closure is kept alive for as long as it is reachable from the
    /// factory — call [`CallbackFactory::forget`] to release it early.
    pub fn register<F>(&self, argument_types: &[Decl], return_type: &Decl, f: F) -> CallbackHandle
    where
        F: Fn(&[Arg]) -> Result<Arg, BridgeError> + Send + Sync + 'static,
    {
        let id = CallbackId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let argument_types: Vec<TypeDesc> = argument_types.iter().map(encode).collect();
        let return_type = encode(return_type);
        let entry = Entry {
            argument_types: argument_types.clone(),
            return_type: return_type.clone(),
            f: Some(Arc::new(f)),
        };
        self.callbacks.write().expect("callback table poisoned").insert(id.0, entry);
        CallbackHandle {
            id,
            argument_types,
            return_type,
        }
    }

    /// Releases a callback early, per [`CallbackFactory::register`]'s
    /// lifetime note.
    pub fn forget(&self, id: CallbackId) {
        self.callbacks.write().expect("callback table poisoned").remove(&id.0);
    }

    /// The declared argument/return types for `id`, so a reverse-channel
    /// dispatcher can decode a `callback_invoke` request's raw bytes without
    /// the caller needing to remember the signature itself.
    pub fn signature(&self, id: CallbackId) -> Option<(Vec<TypeDesc>, TypeDesc)> {
        let table = self.callbacks.read().expect("callback table poisoned");
        table.get(&id.0).map(|entry| (entry.argument_types.clone(), entry.return_type.clone()))
    }

    /// Looks up the closure for `id` without holding the table lock while
    /// it runs, so a re-entrant nested `callback_invoke` (the callback
    /// itself calling another routine that calls back in) cannot deadlock
    /// against this factory.
    pub fn invoke(&self, id: CallbackId, args: &[Arg]) -> Result<Arg, BridgeError> {
        let f = {
            let table = self.callbacks.read().expect("callback table poisoned");
            table
                .get(&id.0)
                .and_then(|entry| entry.f.clone())
                .ok_or_else(|| BridgeError::AttributeMissing {
                    library: "<callback>".to_string(),
                    routine: format!("{}", id.0),
                })?
        };
        f(args)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Fundamental;

    #[test]
    fn registered_callback_can_be_invoked_by_id() {
        let factory = CallbackFactory::new();
        let handle = factory.register(
            &[Decl::Fundamental(Fundamental::I32), Decl::Fundamental(Fundamental::I32)],
            &Decl::Fundamental(Fundamental::I32),
            |args| match args {
                [Arg::I32(a), Arg::I32(b)] => Ok(Arg::I32(a + b)),
                _ => panic!("unexpected args"),
            },
        );
        let result = factory.invoke(handle.id, &[Arg::I32(2), Arg::I32(3)]).unwrap();
        assert_eq!(result, Arg::I32(5));
    }

    #[test]
    fn forgotten_callback_is_no_longer_reachable() {
        let factory = CallbackFactory::new();
        let handle = factory.register(&[], &Decl::Fundamental(Fundamental::Bool), |_| Ok(Arg::Bool(true)));
        factory.forget(handle.id);
        let err = factory.invoke(handle.id, &[]).unwrap_err();
        assert!(matches!(err, BridgeError::AttributeMissing { .. }));
    }

    #[test]
    fn nested_invoke_from_within_a_callback_does_not_deadlock() {
        let factory = Arc::new(CallbackFactory::new());
        let inner = factory.clone();
        let outer_handle = factory.register(&[], &Decl::Fundamental(Fundamental::I32), move |_| {
            inner.invoke(CallbackId(99), &[]).or(Ok(Arg::I32(0)))
        });
        let _ = factory.register(&[], &Decl::Fundamental(Fundamental::I32), |_| Ok(Arg::I32(1)));
        let result = factory.invoke(outer_handle.id, &[]).unwrap();
        assert_eq!(result, Arg::I32(0));
    }
}
