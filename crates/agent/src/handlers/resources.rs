use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Map, Value};
use uuid::Uuid;

use frontdesk_core::domain::action::{ActionContext, ActionType};

use super::{required_str, ActionHandler, HandlerError};

/// Tenant-scoped CRUD over business records (appointments, bookings, members...).
#[async_trait]
pub trait ResourceService: Send + Sync {
    async fn create(
        &self,
        tenant_id: &str,
        resource_type: &str,
        data: &Map<String, Value>,
    ) -> Result<Value, HandlerError>;

    async fn update(
        &self,
        tenant_id: &str,
        resource_type: &str,
        resource_id: &str,
        data: &Map<String, Value>,
    ) -> Result<Value, HandlerError>;

    async fn delete(
        &self,
        tenant_id: &str,
        resource_type: &str,
        resource_id: &str,
    ) -> Result<(), HandlerError>;
}

type RecordKey = (String, String, String);

#[derive(Clone, Default)]
pub struct InMemoryResourceService {
    records: Arc<Mutex<BTreeMap<RecordKey, Map<String, Value>>>>,
}

impl InMemoryResourceService {
    pub fn get(&self, tenant_id: &str, resource_type: &str, resource_id: &str) -> Option<Value> {
        let key = (tenant_id.to_owned(), resource_type.to_owned(), resource_id.to_owned());
        self.with_records(|records| records.get(&key).cloned().map(Value::Object))
    }

    pub fn len(&self) -> usize {
        self.with_records(|records| records.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn with_records<T>(
        &self,
        apply: impl FnOnce(&mut BTreeMap<RecordKey, Map<String, Value>>) -> T,
    ) -> T {
        match self.records.lock() {
            Ok(mut records) => apply(&mut records),
            Err(poisoned) => apply(&mut poisoned.into_inner()),
        }
    }
}

#[async_trait]
impl ResourceService for InMemoryResourceService {
    async fn create(
        &self,
        tenant_id: &str,
        resource_type: &str,
        data: &Map<String, Value>,
    ) -> Result<Value, HandlerError> {
        let resource_id = Uuid::new_v4().to_string();
        let mut record = data.clone();
        record.insert("id".to_owned(), json!(resource_id));
        record.insert("updatedAt".to_owned(), json!(Utc::now().to_rfc3339()));

        let key = (tenant_id.to_owned(), resource_type.to_owned(), resource_id);
        self.with_records(|records| records.insert(key, record.clone()));
        Ok(Value::Object(record))
    }

    async fn update(
        &self,
        tenant_id: &str,
        resource_type: &str,
        resource_id: &str,
        data: &Map<String, Value>,
    ) -> Result<Value, HandlerError> {
        let key = (tenant_id.to_owned(), resource_type.to_owned(), resource_id.to_owned());
        self.with_records(|records| {
            let Some(record) = records.get_mut(&key) else {
                return Err(not_found(resource_type, resource_id));
            };
            for (field, value) in data {
                if field != "id" {
                    record.insert(field.clone(), value.clone());
                }
            }
            record.insert("updatedAt".to_owned(), json!(Utc::now().to_rfc3339()));
            Ok(Value::Object(record.clone()))
        })
    }

    async fn delete(
        &self,
        tenant_id: &str,
        resource_type: &str,
        resource_id: &str,
    ) -> Result<(), HandlerError> {
        let key = (tenant_id.to_owned(), resource_type.to_owned(), resource_id.to_owned());
        self.with_records(|records| match records.remove(&key) {
            Some(_) => Ok(()),
            None => Err(not_found(resource_type, resource_id)),
        })
    }
}

fn not_found(resource_type: &str, resource_id: &str) -> HandlerError {
    HandlerError::NotFound {
        resource_type: resource_type.to_owned(),
        resource_id: resource_id.to_owned(),
    }
}

pub struct ResourceProxyHandler {
    service: Arc<dyn ResourceService>,
}

impl ResourceProxyHandler {
    pub const ACTION_TYPES: &'static [&'static str] =
        &["create_resource", "update_resource", "delete_resource"];

    pub fn new(service: Arc<dyn ResourceService>) -> Self {
        Self { service }
    }
}

#[async_trait]
impl ActionHandler for ResourceProxyHandler {
    async fn handle(
        &self,
        action_type: &ActionType,
        parameters: &Map<String, Value>,
        context: &ActionContext,
    ) -> Result<Value, HandlerError> {
        let tenant_id = context.tenant_id.as_str();
        let resource_type = required_str(parameters, "resource_type")?;
        let data = || {
            parameters
                .get("data")
                .and_then(Value::as_object)
                .ok_or_else(|| HandlerError::InvalidInput("`data` must be an object".to_owned()))
        };

        match action_type.as_str() {
            "create_resource" => {
                let record = self.service.create(tenant_id, resource_type, data()?).await?;
                Ok(json!({ "resourceType": resource_type, "record": record }))
            }
            "update_resource" => {
                let resource_id = required_str(parameters, "resource_id")?;
                let record =
                    self.service.update(tenant_id, resource_type, resource_id, data()?).await?;
                Ok(json!({ "resourceType": resource_type, "record": record }))
            }
            "delete_resource" => {
                let resource_id = required_str(parameters, "resource_id")?;
                self.service.delete(tenant_id, resource_type, resource_id).await?;
                Ok(json!({
                    "resourceType": resource_type,
                    "resourceId": resource_id,
                    "deleted": true,
                }))
            }
            other => Err(HandlerError::InvalidInput(format!(
                "resource handler cannot run `{other}`"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::{json, Map, Value};

    use frontdesk_core::domain::action::{ActionContext, ActionType};

    use super::{InMemoryResourceService, ResourceProxyHandler};
    use crate::handlers::{ActionHandler, HandlerError};

    fn params(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap_or_default()
    }

    fn context(tenant_id: &str) -> ActionContext {
        ActionContext {
            tenant_id: tenant_id.to_owned(),
            user_id: "staff-1".to_owned(),
            location_id: None,
            session_id: None,
        }
    }

    #[tokio::test]
    async fn create_update_delete_are_tenant_scoped() {
        let service = InMemoryResourceService::default();
        let handler = ResourceProxyHandler::new(Arc::new(service.clone()));

        let created = handler
            .handle(
                &ActionType::new("create_resource"),
                &params(json!({ "resource_type": "appointment", "data": { "slot": "09:00" } })),
                &context("dental-1"),
            )
            .await
            .expect("create");
        let id = created["record"]["id"].as_str().expect("id").to_owned();

        let foreign = handler
            .handle(
                &ActionType::new("update_resource"),
                &params(json!({
                    "resource_type": "appointment",
                    "resource_id": id,
                    "data": { "slot": "10:00" }
                })),
                &context("gym-2"),
            )
            .await
            .err()
            .expect("other tenant cannot see the record");
        assert!(matches!(foreign, HandlerError::NotFound { .. }));

        let updated = handler
            .handle(
                &ActionType::new("update_resource"),
                &params(json!({
                    "resource_type": "appointment",
                    "resource_id": id,
                    "data": { "slot": "10:00", "id": "hijack" }
                })),
                &context("dental-1"),
            )
            .await
            .expect("update");
        assert_eq!(updated["record"]["slot"], "10:00");
        assert_eq!(updated["record"]["id"], json!(id));

        handler
            .handle(
                &ActionType::new("delete_resource"),
                &params(json!({ "resource_type": "appointment", "resource_id": id })),
                &context("dental-1"),
            )
            .await
            .expect("delete");
        assert!(service.is_empty());
    }
}
