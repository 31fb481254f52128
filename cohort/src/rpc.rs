//! Worker-side registry of remotely callable functions.

use crate::error::{CohortError, Result};
use std::collections::HashMap;
use std::sync::Arc;

/// Receives the encoded arguments and returns the encoded response.
pub type RpcHandler = Arc<dyn Fn(&[u8]) -> Vec<u8> + Send + Sync>;

/// Function ids mapped to handlers. Built before a worker starts serving and
/// shared read-only afterwards.
#[derive(Clone, Default)]
pub struct RpcRegistry {
    handlers: HashMap<u16, RpcHandler>,
}

impl RpcRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` under `fn_id`, replacing any previous one.
    pub fn register(&mut self, fn_id: u16, handler: RpcHandler) {
        self.handlers.insert(fn_id, handler);
    }

    pub fn contains(&self, fn_id: u16) -> bool {
        self.handlers.contains_key(&fn_id)
    }

    pub fn call(&self, fn_id: u16, payload: &[u8]) -> Result<Vec<u8>> {
        let handler = self
            .handlers
            .get(&fn_id)
            .ok_or(CohortError::RpcNotRegistered { fn_id })?;
        Ok(handler(payload))
    }
}

impl std::fmt::Debug for RpcRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut ids: Vec<_> = self.handlers.keys().collect();
        ids.sort();
        f.debug_struct("RpcRegistry").field("fn_ids", &ids).finish()
    }
}
