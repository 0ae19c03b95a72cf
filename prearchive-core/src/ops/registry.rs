//! Explicit operation-kind → handler registry, built at startup. The
//! dispatch table is static and verifiable; nothing is discovered at
//! runtime.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::ops::{
    ArchiveOperation, DeleteOperation, MoveOperation, OperationHandler, OperationKind,
    RebuildOperation, SeparateOperation,
};

#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<OperationKind, Arc<dyn OperationHandler>>,
}

impl fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut kinds: Vec<String> = self.handlers.keys().map(|k| k.to_string()).collect();
        kinds.sort();
        f.debug_struct("HandlerRegistry").field("kinds", &kinds).finish()
    }
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The full standard dispatch table.
    pub fn standard() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(RebuildOperation));
        registry.register(Arc::new(ArchiveOperation));
        registry.register(Arc::new(MoveOperation));
        registry.register(Arc::new(SeparateOperation));
        registry.register(Arc::new(DeleteOperation));
        registry
    }

    pub fn register(&mut self, handler: Arc<dyn OperationHandler>) {
        self.handlers.insert(handler.kind(), handler);
    }

    pub fn resolve(&self, kind: OperationKind) -> Option<Arc<dyn OperationHandler>> {
        self.handlers.get(&kind).cloned()
    }
}
