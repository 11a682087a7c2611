//! The worker execution collaborator: how one payload becomes one value.
//!
//! The engine never inspects payloads or values; it hands a payload to an
//! [`Executor`] on some worker and routes the outcome back. An `Err` from
//! `execute` is a domain fault and lands verbatim in the batch's result
//! sequence; a panic models a worker crash (the infrastructure fault the
//! retry policy exists for) and is never shown to the caller directly.

use std::fmt;
use std::marker::PhantomData;

use crate::errors::FunctionError;

/// Executes a single evaluation. Shared across all workers in a pool, so
/// implementations must be `Sync`; per-evaluation state belongs in the
/// payload.
pub trait Executor: Send + Sync + 'static {
    type Payload: fmt::Debug + Clone + Send + 'static;
    type Value: fmt::Debug + Clone + Send + 'static;

    fn execute(&self, payload: &Self::Payload) -> Result<Self::Value, FunctionError>;
}

/// Adapter turning a plain closure into an [`Executor`].
pub struct FnExecutor<P, V, F> {
    func: F,
    _marker: PhantomData<fn(&P) -> V>,
}

impl<P, V, F> FnExecutor<P, V, F>
where
    F: Fn(&P) -> Result<V, FunctionError>,
{
    pub fn new(func: F) -> Self {
        Self {
            func,
            _marker: PhantomData,
        }
    }
}

impl<P, V, F> Executor for FnExecutor<P, V, F>
where
    P: fmt::Debug + Clone + Send + 'static,
    V: fmt::Debug + Clone + Send + 'static,
    F: Fn(&P) -> Result<V, FunctionError> + Send + Sync + 'static,
{
    type Payload = P;
    type Value = V;

    fn execute(&self, payload: &P) -> Result<V, FunctionError> {
        (self.func)(payload)
    }
}
