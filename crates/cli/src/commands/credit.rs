use std::sync::Arc;

use frontdesk_core::ledger::ResourceLedger;
use frontdesk_db::{connect_with_settings, migrations, SqlLedgerStore};
use serde_json::json;

use crate::commands::{block_on, load_config, CommandResult};

pub fn run(tenant: &str, location: Option<&str>, tokens: u64) -> CommandResult {
    if tokens == 0 {
        return CommandResult::failure(
            "credit",
            "invalid_input",
            "credit amount must be positive",
            2,
        );
    }
    let config = match load_config("credit") {
        Ok(config) => config,
        Err(failure) => return failure,
    };

    let result = block_on("credit", async {
        let pool = connect_with_settings(
            &config.database.url,
            config.database.max_connections,
            config.database.timeout_secs,
        )
        .await
        .map_err(|error| {
            CommandResult::failure("credit", "db_connectivity", error.to_string(), 4)
        })?;
        migrations::run_pending(&pool)
            .await
            .map_err(|error| CommandResult::failure("credit", "migration", error.to_string(), 5))?;

        let ledger = ResourceLedger::new(
            Arc::new(SqlLedgerStore::new(pool.clone())),
            config.metering.costs.clone(),
        );
        let account = ledger
            .credit(tenant, location, tokens)
            .await
            .map_err(|error| CommandResult::failure("credit", "ledger", error.to_string(), 6))?;
        pool.close().await;
        Ok(account)
    });

    match result {
        Ok(account) => CommandResult::success_with_data(
            "credit",
            format!("credited {tokens} tokens; {} available", account.available),
            Some(json!({ "account": account })),
        ),
        Err(failure) => failure,
    }
}
