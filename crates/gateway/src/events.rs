use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use frontdesk_core::domain::envelope::{Envelope, EnvelopeType};

use crate::pipeline::PipelineError;

#[derive(Clone, Debug, PartialEq)]
pub enum HandlerOutcome {
    Responded(Box<Envelope>),
    Duplicate,
    Ignored,
}

#[async_trait]
pub trait EnvelopeHandler: Send + Sync {
    fn envelope_type(&self) -> EnvelopeType;

    async fn handle(&self, envelope: &Envelope) -> Result<HandlerOutcome, PipelineError>;
}

/// Routes envelopes to the handler registered for their type. Types without a
/// handler, such as our own `agent.response` output, are ignored.
#[derive(Default)]
pub struct EnvelopeDispatcher {
    handlers: HashMap<EnvelopeType, Arc<dyn EnvelopeHandler>>,
}

impl EnvelopeDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, handler: Arc<dyn EnvelopeHandler>) {
        self.handlers.insert(handler.envelope_type(), handler);
    }

    pub async fn dispatch(&self, envelope: &Envelope) -> Result<HandlerOutcome, PipelineError> {
        let Some(handler) = self.handlers.get(&envelope.envelope_type) else {
            return Ok(HandlerOutcome::Ignored);
        };
        handler.handle(envelope).await
    }

    pub fn handler_count(&self) -> usize {
        self.handlers.len()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use async_trait::async_trait;
    use chrono::Utc;
    use serde_json::json;

    use frontdesk_core::domain::envelope::{Envelope, EnvelopePayload, EnvelopeType, MessageId};

    use super::{EnvelopeDispatcher, EnvelopeHandler, HandlerOutcome};
    use crate::pipeline::PipelineError;

    #[derive(Default)]
    struct CountingHandler {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl EnvelopeHandler for CountingHandler {
        fn envelope_type(&self) -> EnvelopeType {
            EnvelopeType::UserMessage
        }

        async fn handle(&self, _envelope: &Envelope) -> Result<HandlerOutcome, PipelineError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(HandlerOutcome::Duplicate)
        }
    }

    fn envelope(envelope_type: EnvelopeType) -> Envelope {
        Envelope {
            tenant_id: "gym-1".to_owned(),
            user_id: "member-1".to_owned(),
            session_id: "s-1".to_owned(),
            message_id: MessageId::generate(),
            envelope_type,
            payload: EnvelopePayload { content: "hi".to_owned(), context: json!({}) },
            timestamp: Utc::now(),
        }
    }

    #[tokio::test]
    async fn routes_by_type_and_ignores_the_rest() {
        let handler = Arc::new(CountingHandler::default());
        let mut dispatcher = EnvelopeDispatcher::new();
        dispatcher.register(handler.clone());

        let routed =
            dispatcher.dispatch(&envelope(EnvelopeType::UserMessage)).await.expect("dispatch");
        let ignored =
            dispatcher.dispatch(&envelope(EnvelopeType::AgentResponse)).await.expect("dispatch");

        assert_eq!(routed, HandlerOutcome::Duplicate);
        assert_eq!(ignored, HandlerOutcome::Ignored);
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
        assert_eq!(dispatcher.handler_count(), 1);
    }
}
