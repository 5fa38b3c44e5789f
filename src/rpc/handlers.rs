//! Static dispatch table for inbound RPC methods.
//!
//! The host registers one async handler per supported inbound method (the
//! filesystem side-effect methods, the approval-request method, and so on).
//! Handlers receive the raw params payload and return a result value or an
//! error that the dispatcher maps to a JSON-RPC error response.

use std::collections::HashMap;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use serde_json::Value;

use crate::RpcError;

/// Boxed future returned by a method handler.
pub type HandlerFuture = BoxFuture<'static, Result<Value, RpcError>>;

/// One registered method handler.
pub type MethodHandler = Arc<dyn Fn(Option<Value>) -> HandlerFuture + Send + Sync>;

/// Registry of inbound method handlers for one connection.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, MethodHandler>,
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut methods: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        methods.sort_unstable();
        f.debug_struct("HandlerRegistry")
            .field("methods", &methods)
            .finish()
    }
}

impl HandlerRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `method`, replacing any previous handler.
    pub fn register<F, Fut>(&mut self, method: impl Into<String>, handler: F)
    where
        F: Fn(Option<Value>) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<Value, RpcError>> + Send + 'static,
    {
        self.handlers
            .insert(method.into(), Arc::new(move |params| handler(params).boxed()));
    }

    /// Look up the handler for `method`.
    #[must_use]
    pub fn get(&self, method: &str) -> Option<MethodHandler> {
        self.handlers.get(method).map(Arc::clone)
    }

    /// Whether `method` has a registered handler.
    #[must_use]
    pub fn contains(&self, method: &str) -> bool {
        self.handlers.contains_key(method)
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
