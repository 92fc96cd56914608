//! Registry of every action the agent may propose or execute.

use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::domain::action::{
    ActionCategory, ActionDefinition, ActionType, DecisionLevel, ParameterKind, ParameterSpec,
};
use crate::domain::ledger::OperationType;
use crate::domain::policy::WILDCARD;
use crate::ledger::OperationCostTable;

pub const PERMISSION_COMMUNICATION_SEND: &str = "communication:send";
pub const PERMISSION_RESOURCES_WRITE: &str = "resources:write";
pub const PERMISSION_RESOURCES_DELETE: &str = "resources:delete";
pub const PERMISSION_COORDINATION_REQUEST: &str = "coordination:request";

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub valid: bool,
    pub errors: Vec<String>,
}

impl ValidationReport {
    fn from_errors(errors: Vec<String>) -> Self {
        Self { valid: errors.is_empty(), errors }
    }
}

#[derive(Clone, Debug, Default)]
pub struct ActionCatalog {
    definitions: BTreeMap<ActionType, ActionDefinition>,
}

impl ActionCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Built-in definitions for the three handler categories, priced from `costs`.
    pub fn standard(costs: &OperationCostTable) -> Self {
        let mut catalog = Self::new();
        for definition in standard_definitions(costs) {
            catalog.register(definition);
        }
        catalog
    }

    /// Adds `definition`, replacing any existing entry of the same type.
    pub fn register(&mut self, definition: ActionDefinition) {
        self.definitions.insert(definition.action_type.clone(), definition);
    }

    pub fn get(&self, action_type: &ActionType) -> Option<&ActionDefinition> {
        self.definitions.get(action_type)
    }

    pub fn len(&self) -> usize {
        self.definitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.definitions.is_empty()
    }

    pub fn definitions(&self) -> Vec<&ActionDefinition> {
        self.definitions.values().collect()
    }

    pub fn by_category(&self) -> BTreeMap<ActionCategory, Vec<&ActionDefinition>> {
        let mut grouped: BTreeMap<ActionCategory, Vec<&ActionDefinition>> = BTreeMap::new();
        for definition in self.definitions.values() {
            grouped.entry(definition.category).or_default().push(definition);
        }
        grouped
    }

    /// Definitions whose every required permission is held. `*` holds everything.
    pub fn permitted_for(&self, permissions: &[String]) -> Vec<&ActionDefinition> {
        let held: HashSet<&str> = permissions.iter().map(String::as_str).collect();
        if held.contains(WILDCARD) {
            return self.definitions();
        }

        self.definitions
            .values()
            .filter(|definition| {
                definition.permissions.iter().all(|permission| held.contains(permission.as_str()))
            })
            .collect()
    }

    /// Checks required presence and kind of every declared field, reporting all
    /// violations. Undeclared fields pass through unchecked.
    pub fn validate_parameters(
        &self,
        action_type: &ActionType,
        parameters: &Map<String, Value>,
    ) -> ValidationReport {
        let Some(definition) = self.get(action_type) else {
            return ValidationReport::from_errors(vec![format!(
                "unknown action type `{action_type}`"
            )]);
        };

        let mut errors = Vec::new();
        for spec in &definition.parameters {
            match parameters.get(&spec.name) {
                None | Some(Value::Null) if spec.required => {
                    errors.push(format!("missing required parameter `{}`", spec.name));
                }
                None | Some(Value::Null) => {}
                Some(value) if !spec.kind.matches(value) => {
                    errors.push(format!(
                        "parameter `{}` must be of type {}",
                        spec.name,
                        spec.kind.as_str()
                    ));
                }
                Some(_) => {}
            }
        }

        ValidationReport::from_errors(errors)
    }

    /// Returns `parameters` with declared defaults filled in for absent fields.
    pub fn with_defaults(
        &self,
        action_type: &ActionType,
        parameters: &Map<String, Value>,
    ) -> Map<String, Value> {
        let mut filled = parameters.clone();
        if let Some(definition) = self.get(action_type) {
            for spec in &definition.parameters {
                let Some(default) = &spec.default else { continue };
                let absent = filled.get(&spec.name).map(Value::is_null).unwrap_or(true);
                if absent {
                    filled.insert(spec.name.clone(), default.clone());
                }
            }
        }
        filled
    }
}

struct StandardAction {
    action_type: &'static str,
    category: ActionCategory,
    description: &'static str,
    permissions: &'static [&'static str],
    parameters: Vec<ParameterSpec>,
    operation: &'static str,
    default_level: DecisionLevel,
    requires_approval: bool,
}

fn standard_definitions(costs: &OperationCostTable) -> Vec<ActionDefinition> {
    use ParameterKind::{Array, Integer, Object, String as Text};

    let actions = vec![
        StandardAction {
            action_type: "send_email",
            category: ActionCategory::Communication,
            description: "Send an email to a customer or contact",
            permissions: &[PERMISSION_COMMUNICATION_SEND],
            parameters: vec![
                ParameterSpec::required("to", Text),
                ParameterSpec::required("subject", Text),
                ParameterSpec::required("body", Text),
                ParameterSpec::optional("cc", Array),
            ],
            operation: OperationType::EMAIL_SEND,
            default_level: DecisionLevel::Automatic,
            requires_approval: false,
        },
        StandardAction {
            action_type: "send_sms",
            category: ActionCategory::Communication,
            description: "Send a short text message to a phone number",
            permissions: &[PERMISSION_COMMUNICATION_SEND],
            parameters: vec![
                ParameterSpec::required("to", Text),
                ParameterSpec::required("message", Text),
            ],
            operation: OperationType::SMS_SEND,
            default_level: DecisionLevel::Automatic,
            requires_approval: false,
        },
        StandardAction {
            action_type: "schedule_call",
            category: ActionCategory::Communication,
            description: "Schedule a phone call with a customer",
            permissions: &[PERMISSION_COMMUNICATION_SEND],
            parameters: vec![
                ParameterSpec::required("to", Text),
                ParameterSpec::required("scheduled_at", Text),
                ParameterSpec::optional("duration_minutes", Integer).with_default(json!(15)),
                ParameterSpec::optional("notes", Text),
            ],
            operation: OperationType::CALL_SCHEDULE,
            default_level: DecisionLevel::Suggestion,
            requires_approval: false,
        },
        StandardAction {
            action_type: "create_resource",
            category: ActionCategory::ResourceManagement,
            description: "Create a booking, appointment or other business record",
            permissions: &[PERMISSION_RESOURCES_WRITE],
            parameters: vec![
                ParameterSpec::required("resource_type", Text),
                ParameterSpec::required("data", Object),
            ],
            operation: OperationType::RESOURCE_WRITE,
            default_level: DecisionLevel::Suggestion,
            requires_approval: false,
        },
        StandardAction {
            action_type: "update_resource",
            category: ActionCategory::ResourceManagement,
            description: "Change fields on an existing business record",
            permissions: &[PERMISSION_RESOURCES_WRITE],
            parameters: vec![
                ParameterSpec::required("resource_type", Text),
                ParameterSpec::required("resource_id", Text),
                ParameterSpec::required("data", Object),
            ],
            operation: OperationType::RESOURCE_WRITE,
            default_level: DecisionLevel::Consultation,
            requires_approval: false,
        },
        StandardAction {
            action_type: "delete_resource",
            category: ActionCategory::ResourceManagement,
            description: "Remove an existing business record",
            permissions: &[PERMISSION_RESOURCES_WRITE, PERMISSION_RESOURCES_DELETE],
            parameters: vec![
                ParameterSpec::required("resource_type", Text),
                ParameterSpec::required("resource_id", Text),
            ],
            operation: OperationType::RESOURCE_WRITE,
            default_level: DecisionLevel::ApprovalRequired,
            requires_approval: true,
        },
        StandardAction {
            action_type: "request_approval",
            category: ActionCategory::Coordination,
            description: "Ask a staff member to approve a pending change",
            permissions: &[PERMISSION_COORDINATION_REQUEST],
            parameters: vec![
                ParameterSpec::required("summary", Text),
                ParameterSpec::optional("approver_role", Text).with_default(json!("manager")),
                ParameterSpec::optional("details", Object),
            ],
            operation: OperationType::COORDINATION,
            default_level: DecisionLevel::ApprovalRequired,
            requires_approval: true,
        },
        StandardAction {
            action_type: "escalate_to_human",
            category: ActionCategory::Coordination,
            description: "Hand the conversation to a human staff member",
            permissions: &[PERMISSION_COORDINATION_REQUEST],
            parameters: vec![
                ParameterSpec::required("reason", Text),
                ParameterSpec::optional("urgency", Text).with_default(json!("normal")),
            ],
            operation: OperationType::COORDINATION,
            default_level: DecisionLevel::Consultation,
            requires_approval: false,
        },
    ];

    actions
        .into_iter()
        .map(|action| {
            let operation = OperationType::new(action.operation);
            ActionDefinition {
                action_type: ActionType::new(action.action_type),
                category: action.category,
                description: action.description.to_owned(),
                permissions: action.permissions.iter().map(|value| (*value).to_owned()).collect(),
                parameters: action.parameters,
                token_cost: costs.cost(&operation).unwrap_or(0),
                operation,
                default_level: action.default_level,
                requires_approval: action.requires_approval,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use serde_json::{json, Map, Value};

    use super::{ActionCatalog, PERMISSION_COMMUNICATION_SEND, PERMISSION_RESOURCES_WRITE};
    use crate::domain::action::{
        ActionCategory, ActionDefinition, ActionType, DecisionLevel, ParameterKind, ParameterSpec,
    };
    use crate::domain::ledger::OperationType;
    use crate::ledger::OperationCostTable;

    fn catalog() -> ActionCatalog {
        ActionCatalog::standard(&OperationCostTable::default())
    }

    fn sample_value(kind: ParameterKind) -> Value {
        match kind {
            ParameterKind::String => json!("value"),
            ParameterKind::Number => json!(1.5),
            ParameterKind::Integer => json!(3),
            ParameterKind::Boolean => json!(true),
            ParameterKind::Object => json!({ "field": "value" }),
            ParameterKind::Array => json!(["value"]),
        }
    }

    fn complete_parameters(definition: &ActionDefinition) -> Map<String, Value> {
        definition
            .parameters
            .iter()
            .filter(|spec| spec.required)
            .map(|spec| (spec.name.clone(), sample_value(spec.kind)))
            .collect()
    }

    #[test]
    fn every_registered_type_rejects_each_missing_required_parameter() {
        let catalog = catalog();
        assert_eq!(catalog.len(), 8);

        for definition in catalog.definitions() {
            let complete = complete_parameters(definition);
            let report = catalog.validate_parameters(&definition.action_type, &complete);
            assert!(report.valid, "{} should accept {complete:?}", definition.action_type);

            for spec in definition.parameters.iter().filter(|spec| spec.required) {
                let mut missing = complete.clone();
                missing.remove(&spec.name);
                let report = catalog.validate_parameters(&definition.action_type, &missing);
                assert!(
                    !report.valid,
                    "{} accepted missing `{}`",
                    definition.action_type,
                    spec.name
                );
                assert!(report.errors.iter().any(|error| error.contains(&spec.name)));
            }
        }
    }

    #[test]
    fn validation_accumulates_every_violation() {
        let catalog = catalog();
        let parameters: Map<String, Value> = json!({ "to": 42, "subject": null, "extra": "kept" })
            .as_object()
            .cloned()
            .unwrap_or_default();

        let report = catalog.validate_parameters(&ActionType::new("send_email"), &parameters);

        assert!(!report.valid);
        assert_eq!(report.errors.len(), 3, "{:?}", report.errors);
        assert!(report.errors.iter().any(|error| error.contains("`to` must be of type string")));
        assert!(report.errors.iter().any(|error| error.contains("`subject`")));
        assert!(report.errors.iter().any(|error| error.contains("`body`")));
    }

    #[test]
    fn unknown_type_is_invalid_with_single_error() {
        let report = catalog().validate_parameters(&ActionType::new("launch_rocket"), &Map::new());
        assert!(!report.valid);
        assert_eq!(report.errors.len(), 1);
    }

    #[test]
    fn register_overwrites_existing_definition() {
        let mut catalog = catalog();
        catalog.register(ActionDefinition {
            action_type: ActionType::new("send_sms"),
            category: ActionCategory::Communication,
            description: "premium sms".to_owned(),
            permissions: vec![PERMISSION_COMMUNICATION_SEND.to_owned()],
            parameters: vec![ParameterSpec::required("to", ParameterKind::String)],
            token_cost: 10,
            operation: OperationType::new("premium_sms"),
            default_level: DecisionLevel::Automatic,
            requires_approval: false,
        });

        assert_eq!(catalog.len(), 8);
        let definition = catalog.get(&ActionType::new("send_sms")).expect("definition");
        assert_eq!(definition.token_cost, 10);
    }

    #[test]
    fn standard_costs_follow_the_metering_table() {
        let costs = OperationCostTable::default().with_cost(OperationType::SMS_SEND, 7);
        let catalog = ActionCatalog::standard(&costs);

        let sms = catalog.get(&ActionType::new("send_sms")).expect("sms");
        assert_eq!(sms.token_cost, 7);
        let approval = catalog.get(&ActionType::new("request_approval")).expect("approval");
        assert_eq!(approval.token_cost, 0);
        assert!(approval.requires_approval);
    }

    #[test]
    fn permitted_subset_requires_every_permission() {
        let catalog = catalog();

        let writers = catalog.permitted_for(&[PERMISSION_RESOURCES_WRITE.to_owned()]);
        let types: Vec<&str> = writers.iter().map(|d| d.action_type.as_str()).collect();
        assert_eq!(types, vec!["create_resource", "update_resource"]);

        assert_eq!(catalog.permitted_for(&["*".to_owned()]).len(), 8);
        assert!(catalog.permitted_for(&[]).is_empty());
    }

    #[test]
    fn defaults_fill_absent_optional_fields_only() {
        let catalog = catalog();
        let parameters: Map<String, Value> =
            json!({ "summary": "refund", "approver_role": "owner" })
                .as_object()
                .cloned()
                .unwrap_or_default();
        let filled =
            catalog.with_defaults(&ActionType::new("request_approval"), &parameters);
        assert_eq!(filled["approver_role"], "owner");

        let filled = catalog.with_defaults(
            &ActionType::new("schedule_call"),
            &json!({ "to": "+1555" }).as_object().cloned().unwrap_or_default(),
        );
        assert_eq!(filled["duration_minutes"], 15);
    }

    #[test]
    fn categories_group_for_prompts() {
        let catalog = catalog();
        let grouped = catalog.by_category();
        assert_eq!(grouped[&ActionCategory::Communication].len(), 3);
        assert_eq!(grouped[&ActionCategory::ResourceManagement].len(), 3);
        assert_eq!(grouped[&ActionCategory::Coordination].len(), 2);
    }
}
