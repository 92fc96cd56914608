use std::collections::HashMap;

use async_trait::async_trait;
use thiserror::Error;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum AuthzError {
    #[error("permission lookup failed: {0}")]
    Lookup(String),
}

/// Source of a user's permission strings when the inbound message does not carry them.
#[async_trait]
pub trait PermissionResolver: Send + Sync {
    async fn get_user_permissions(
        &self,
        tenant_id: &str,
        user_id: &str,
        location_id: Option<&str>,
    ) -> Result<Vec<String>, AuthzError>;
}

/// Fixed grants keyed by tenant and user, with a fallback set for everyone else.
#[derive(Clone, Debug, Default)]
pub struct StaticPermissionResolver {
    grants: HashMap<(String, String), Vec<String>>,
    fallback: Vec<String>,
}

impl StaticPermissionResolver {
    pub fn new(fallback: Vec<String>) -> Self {
        Self { grants: HashMap::new(), fallback }
    }

    pub fn with_grant(
        mut self,
        tenant_id: impl Into<String>,
        user_id: impl Into<String>,
        permissions: Vec<String>,
    ) -> Self {
        self.grants.insert((tenant_id.into(), user_id.into()), permissions);
        self
    }
}

#[async_trait]
impl PermissionResolver for StaticPermissionResolver {
    async fn get_user_permissions(
        &self,
        tenant_id: &str,
        user_id: &str,
        _location_id: Option<&str>,
    ) -> Result<Vec<String>, AuthzError> {
        Ok(self
            .grants
            .get(&(tenant_id.to_owned(), user_id.to_owned()))
            .cloned()
            .unwrap_or_else(|| self.fallback.clone()))
    }
}
