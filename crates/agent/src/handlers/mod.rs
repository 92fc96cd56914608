//! Side-effecting executors for catalog actions.
//!
//! Each handler owns one category of actions and talks to a single collaborator
//! port. The dispatcher looks handlers up by action type, so a new action type only
//! needs a catalog entry and a registration here.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};
use thiserror::Error;

use frontdesk_core::domain::action::{ActionContext, ActionErrorKind, ActionType};

pub mod communication;
pub mod coordination;
pub mod resources;

pub use communication::{
    CommunicationHandler, DeliveryChannel, LoggingNotificationGateway, Notification,
    NotificationGateway,
};
pub use coordination::{
    ApprovalQueue, CoordinationHandler, CoordinationTicket, InMemoryApprovalQueue, TicketKind,
};
pub use resources::{InMemoryResourceService, ResourceProxyHandler, ResourceService};

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum HandlerError {
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("{resource_type} `{resource_id}` not found")]
    NotFound { resource_type: String, resource_id: String },
    #[error("collaborator failed: {0}")]
    Collaborator(String),
}

impl HandlerError {
    pub fn kind(&self) -> ActionErrorKind {
        match self {
            Self::InvalidInput(_) | Self::NotFound { .. } => ActionErrorKind::Validation,
            Self::Collaborator(_) => ActionErrorKind::ExternalCollaborator,
        }
    }
}

/// Executes a validated action. Either the whole side effect happens or an error
/// is returned; handlers never report partial success.
#[async_trait]
pub trait ActionHandler: Send + Sync {
    async fn handle(
        &self,
        action_type: &ActionType,
        parameters: &Map<String, Value>,
        context: &ActionContext,
    ) -> Result<Value, HandlerError>;
}

#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<ActionType, Arc<dyn ActionHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Handlers for every standard catalog action, wired to the given collaborators.
    pub fn builtin(
        notifications: Arc<dyn NotificationGateway>,
        resources: Arc<dyn ResourceService>,
        approvals: Arc<dyn ApprovalQueue>,
    ) -> Self {
        let mut registry = Self::new();

        let communication: Arc<dyn ActionHandler> =
            Arc::new(CommunicationHandler::new(notifications));
        for action_type in CommunicationHandler::ACTION_TYPES {
            registry.register(ActionType::new(*action_type), communication.clone());
        }

        let resource_proxy: Arc<dyn ActionHandler> = Arc::new(ResourceProxyHandler::new(resources));
        for action_type in ResourceProxyHandler::ACTION_TYPES {
            registry.register(ActionType::new(*action_type), resource_proxy.clone());
        }

        let coordination: Arc<dyn ActionHandler> = Arc::new(CoordinationHandler::new(approvals));
        for action_type in CoordinationHandler::ACTION_TYPES {
            registry.register(ActionType::new(*action_type), coordination.clone());
        }

        registry
    }

    pub fn register(&mut self, action_type: ActionType, handler: Arc<dyn ActionHandler>) {
        self.handlers.insert(action_type, handler);
    }

    pub fn get(&self, action_type: &ActionType) -> Option<Arc<dyn ActionHandler>> {
        self.handlers.get(action_type).cloned()
    }

    pub fn action_types(&self) -> Vec<&ActionType> {
        let mut types: Vec<_> = self.handlers.keys().collect();
        types.sort();
        types
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

pub(crate) fn required_str<'a>(
    parameters: &'a Map<String, Value>,
    name: &str,
) -> Result<&'a str, HandlerError> {
    parameters
        .get(name)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .ok_or_else(|| HandlerError::InvalidInput(format!("`{name}` must be a non-empty string")))
}

pub(crate) fn optional_str<'a>(parameters: &'a Map<String, Value>, name: &str) -> Option<&'a str> {
    parameters.get(name).and_then(Value::as_str)
}
