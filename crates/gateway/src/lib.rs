//! Event Gateway - bus ingress and egress for the frontdesk agent
//!
//! - **Bus** (`bus`) - partitioned at-least-once `MessageBus` port plus an in-process bus
//! - **Consumer** (`consumer`) - one task per partition, subscribe retries, shutdown signal
//! - **Events** (`events`) - routes envelopes to the handler for their type
//! - **Pipeline** (`pipeline`) - dedup, persist, decide, dispatch, reply, publish
//! - **Responder** (`responder`) - reply text from a summary or the language model
//!
//! # Architecture
//!
//! ```text
//! inbound topic → GatewayConsumer → EnvelopeDispatcher → MessagePipeline
//!                                                           ↓
//!                  outbound topic ← response envelope ← DecisionEngine + ActionDispatcher
//! ```
//!
//! Messages in one session share a partition, so they are handled in arrival order.
//! Redelivered messages are answered at most once inside the dedup window.

pub mod audit;
pub mod bus;
pub mod consumer;
pub mod events;
pub mod pipeline;
pub mod responder;

pub use audit::TracingAuditSink;
pub use bus::{BusError, InMemoryBus, MessageBus, PartitionConsumer};
pub use consumer::{spawn_dedup_sweeper, ConsumerReport, GatewayConsumer, SubscribePolicy};
pub use events::{EnvelopeDispatcher, EnvelopeHandler, HandlerOutcome};
pub use pipeline::{MessagePipeline, MessagePipelineParts, PipelineError};
pub use responder::{
    LlmResponseGenerator, ResponseError, ResponseGenerator, SummaryResponseGenerator,
};
