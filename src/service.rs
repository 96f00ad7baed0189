//! Weft runtime: the server-side binding surface.
//!
//! A service implementation describes itself through a [`DispatchTable`]:
//! one entry per operation, keyed by a method identifier that must be
//! unique across the interface (the tests use a `name@arity` convention so
//! overloads of one logical name stay distinct). Each entry decodes the
//! argument payload, invokes the method, and encodes the result; the
//! dispatcher in [`crate::node`] only ever sees opaque bytes.
//!
//! Methods take `&self` — a node services further inbound calls while one
//! of its methods is suspended on an outbound call, so state that a method
//! mutates lives behind interior mutability, and a method must not hold a
//! lock across an outbound call.

use std::collections::HashMap;
use std::fmt;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::codec;
use crate::error::MethodFailure;

/// A user object servable by a node.
pub trait Service: Send + Sync + Sized + 'static {
    /// The table mapping method identifiers to typed handlers.
    fn dispatch_table() -> DispatchTable<Self>;
}

// ── DispatchTable ───────────────────────────────────────────────────────

type Handler<S> = Box<dyn Fn(&S, &[u8]) -> Result<Vec<u8>, MethodFailure> + Send + Sync>;

/// Method-id-keyed dispatch table for one service type.
pub struct DispatchTable<S> {
    handlers: HashMap<&'static str, Handler<S>>,
}

impl<S> DispatchTable<S> {
    /// An empty table.
    #[must_use]
    pub fn new() -> Self {
        DispatchTable {
            handlers: HashMap::new(),
        }
    }

    /// Register an infallible method.
    ///
    /// `A` is the argument tuple and `R` the return type; both go through
    /// [`crate::codec`]. Use `()` and one-element tuples for arities 0
    /// and 1.
    #[must_use]
    pub fn on<A, R, F>(self, method: &'static str, f: F) -> Self
    where
        A: DeserializeOwned,
        R: Serialize,
        F: Fn(&S, A) -> R + Send + Sync + 'static,
    {
        self.on_try(method, move |service, args| {
            Ok::<R, std::convert::Infallible>(f(service, args))
        })
    }

    /// Register a fallible method; the error's `Display` text becomes the
    /// failure response payload.
    ///
    /// # Panics
    ///
    /// Registering the same method identifier twice is a programming error.
    #[must_use]
    pub fn on_try<A, R, E, F>(mut self, method: &'static str, f: F) -> Self
    where
        A: DeserializeOwned,
        R: Serialize,
        E: fmt::Display,
        F: Fn(&S, A) -> Result<R, E> + Send + Sync + 'static,
    {
        let previous = self.handlers.insert(
            method,
            Box::new(move |service, payload| {
                let args: A = codec::decode(payload).map_err(MethodFailure::BadPayload)?;
                let value = f(service, args).map_err(|e| MethodFailure::App(e.to_string()))?;
                codec::encode(&value).map_err(|e| MethodFailure::App(e.to_string()))
            }),
        );
        assert!(previous.is_none(), "duplicate method id {method:?}");
        self
    }

    /// Look up the handler for a method identifier.
    #[must_use]
    pub fn handler(&self, method: &str) -> Option<&Handler<S>> {
        self.handlers.get(method)
    }
}

impl<S> Default for DispatchTable<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S> fmt::Debug for DispatchTable<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut methods: Vec<_> = self.handlers.keys().collect();
        methods.sort_unstable();
        f.debug_struct("DispatchTable")
            .field("methods", &methods)
            .finish()
    }
}
