//! Lifecycle events emitted toward the external event bus.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

use prearchive_model::SessionKey;

use crate::Result;
use crate::ops::OperationKind;

/// Event payload for operation lifecycle transitions.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum OperationEventPayload {
    Started,
    Progress {
        percent: Option<u8>,
        message: String,
    },
    Completed {
        destination: Option<String>,
    },
    Failed {
        error: String,
    },
}

/// Fully qualified operation event.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OperationEvent {
    pub kind: OperationKind,
    pub key: SessionKey,
    pub correlation_id: Uuid,
    pub payload: OperationEventPayload,
    pub occurred_at: DateTime<Utc>,
}

impl OperationEvent {
    pub fn new(
        kind: OperationKind,
        key: SessionKey,
        correlation_id: Uuid,
        payload: OperationEventPayload,
    ) -> Self {
        Self {
            kind,
            key,
            correlation_id,
            payload,
            occurred_at: Utc::now(),
        }
    }
}

#[async_trait]
pub trait OperationEventBus: Send + Sync {
    async fn publish(&self, event: OperationEvent) -> Result<()>;
}

/// Lightweight in-process event bus that fans out operation notifications to
/// observers inside the runtime. This keeps the wiring flexible while the
/// external message broker integration stays upstream.
#[derive(Debug)]
pub struct InProcEventBus {
    sender: broadcast::Sender<OperationEvent>,
}

impl InProcEventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<OperationEvent> {
        self.sender.subscribe()
    }
}

#[async_trait]
impl OperationEventBus for InProcEventBus {
    async fn publish(&self, event: OperationEvent) -> Result<()> {
        let _ = self.sender.send(event);
        Ok(())
    }
}
