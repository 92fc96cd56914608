use tracing::{info, warn};

use frontdesk_core::audit::{AuditEvent, AuditOutcome, AuditSink};

/// Writes audit events to the process log as structured records.
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn emit(&self, event: AuditEvent) {
        let metadata = event
            .metadata
            .iter()
            .map(|(key, value)| format!("{key}={value}"))
            .collect::<Vec<_>>()
            .join(" ");
        match event.outcome {
            AuditOutcome::Success => info!(
                event_name = %event.event_type,
                audit_id = %event.event_id,
                category = ?event.category,
                tenant_id = %event.tenant_id,
                session_id = event.session_id.as_deref().unwrap_or("none"),
                correlation_id = %event.correlation_id,
                actor = %event.actor,
                metadata = %metadata,
                "audit"
            ),
            AuditOutcome::Rejected | AuditOutcome::Failed => warn!(
                event_name = %event.event_type,
                audit_id = %event.event_id,
                category = ?event.category,
                outcome = ?event.outcome,
                tenant_id = %event.tenant_id,
                session_id = event.session_id.as_deref().unwrap_or("none"),
                correlation_id = %event.correlation_id,
                actor = %event.actor,
                metadata = %metadata,
                "audit"
            ),
        }
    }
}
