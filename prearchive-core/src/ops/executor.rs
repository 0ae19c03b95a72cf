//! Dispatch runtime: consumes operation requests from the queue, resolves
//! handlers, and publishes lifecycle events. One task per request; the
//! status CAS inside each handler is what serializes work per session.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{Instrument, debug, error, info_span, warn};

use crate::Result;
use crate::error::ArchiveError;
use crate::events::{OperationEvent, OperationEventBus, OperationEventPayload};
use crate::ops::{OperationContext, OperationRequest, Outcome, registry::HandlerRegistry};

/// Where follow-up operations go. Production wiring hands handlers the
/// executor's own queue sender; tests capture submissions instead.
pub trait RequestSink: Send + Sync {
    fn submit(&self, request: OperationRequest) -> Result<()>;
}

impl RequestSink for mpsc::UnboundedSender<OperationRequest> {
    fn submit(&self, request: OperationRequest) -> Result<()> {
        self.send(request)
            .map_err(|_| ArchiveError::Internal("operation queue closed".into()))
    }
}

pub struct OperationExecutor {
    registry: Arc<HandlerRegistry>,
    ctx: OperationContext,
    events: Arc<dyn OperationEventBus>,
}

impl std::fmt::Debug for OperationExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OperationExecutor")
            .field("registry", &self.registry)
            .finish()
    }
}

impl OperationExecutor {
    pub fn new(
        registry: Arc<HandlerRegistry>,
        ctx: OperationContext,
        events: Arc<dyn OperationEventBus>,
    ) -> Self {
        Self {
            registry,
            ctx,
            events,
        }
    }

    /// Consume requests until the channel closes. Requests for different
    /// sessions run fully in parallel; requests for the same session are
    /// serialized by the status mutex, with losers no-opping.
    pub async fn run(self: Arc<Self>, mut rx: mpsc::UnboundedReceiver<OperationRequest>) {
        while let Some(request) = rx.recv().await {
            let executor = Arc::clone(&self);
            tokio::spawn(async move {
                executor.dispatch(request).await;
            });
        }
    }

    /// Execute a single request to completion, converting the outcome into
    /// events and tracker notes. Never panics the worker: failures become
    /// failure notifications carrying the original cause.
    pub async fn dispatch(&self, request: OperationRequest) {
        let span = info_span!(
            "operation",
            kind = %request.kind,
            session = %request.key,
            correlation = %request.correlation_id,
        );
        async {
            self.publish(&request, OperationEventPayload::Started).await;

            let Some(handler) = self.registry.resolve(request.kind) else {
                let message = format!("no handler registered for {}", request.kind);
                error!("{message}");
                self.fail(&request, &message).await;
                return;
            };

            match handler.execute(&self.ctx, &request).await {
                Ok(Outcome::Completed { destination }) => {
                    self.publish(
                        &request,
                        OperationEventPayload::Completed {
                            destination: destination.clone(),
                        },
                    )
                    .await;
                    if let Err(e) = self
                        .ctx
                        .tracker
                        .record_completion(request.correlation_id, destination.as_deref())
                        .await
                    {
                        warn!(error = %e, "import tracker completion note failed");
                    }
                }
                Ok(Outcome::Skipped { reason }) => {
                    // Lock contention: someone else is already handling it.
                    debug!(reason = %reason, "operation skipped");
                }
                Err(e) => {
                    error!(error = %e, "operation failed");
                    self.fail(&request, &e.to_string()).await;
                }
            }
        }
        .instrument(span)
        .await;
    }

    async fn publish(&self, request: &OperationRequest, payload: OperationEventPayload) {
        let event = OperationEvent::new(
            request.kind,
            request.key.clone(),
            request.correlation_id,
            payload,
        );
        if let Err(e) = self.events.publish(event).await {
            warn!(error = %e, "event publish failed");
        }
    }

    async fn fail(&self, request: &OperationRequest, message: &str) {
        self.publish(
            request,
            OperationEventPayload::Failed {
                error: message.to_string(),
            },
        )
        .await;
        if let Err(e) = self
            .ctx
            .tracker
            .record_failure(request.correlation_id, message)
            .await
        {
            warn!(error = %e, "import tracker failure note failed");
        }
    }
}
