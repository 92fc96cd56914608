use frontdesk_core::catalog::ActionCatalog;
use serde_json::json;

use crate::commands::{load_config, CommandResult};

/// Lists the registered action types with their category, cost, and parameters.
pub fn run() -> CommandResult {
    let config = match load_config("catalog") {
        Ok(config) => config,
        Err(failure) => return failure,
    };

    let catalog = ActionCatalog::standard(&config.metering.costs);
    let actions = catalog
        .definitions()
        .into_iter()
        .map(|definition| {
            json!({
                "action_type": definition.action_type,
                "category": definition.category,
                "token_cost": definition.token_cost,
                "default_level": definition.default_level,
                "requires_approval": definition.requires_approval,
                "permissions": definition.permissions,
                "parameters": definition.parameters,
            })
        })
        .collect::<Vec<_>>();

    CommandResult::success_with_data(
        "catalog",
        format!("{} action types registered", catalog.len()),
        Some(json!({ "actions": actions })),
    )
}
