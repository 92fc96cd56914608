use std::sync::Arc;

use frontdesk_core::ledger::{LedgerError, ResourceLedger};
use frontdesk_db::{connect_with_settings, migrations, SqlLedgerStore};
use serde_json::json;

use crate::commands::{block_on, load_config, CommandResult};

/// Shows the account balance and its usage log; unknown accounts are created at zero.
pub fn run(tenant: &str, location: Option<&str>) -> CommandResult {
    let config = match load_config("balance") {
        Ok(config) => config,
        Err(failure) => return failure,
    };

    let result = block_on("balance", async {
        let pool = connect_with_settings(
            &config.database.url,
            config.database.max_connections,
            config.database.timeout_secs,
        )
        .await
        .map_err(|error| {
            CommandResult::failure("balance", "db_connectivity", error.to_string(), 4)
        })?;
        migrations::run_pending(&pool).await.map_err(|error| {
            CommandResult::failure("balance", "migration", error.to_string(), 5)
        })?;

        let ledger = ResourceLedger::new(
            Arc::new(SqlLedgerStore::new(pool.clone())),
            config.metering.costs.clone(),
        );
        let ledger_failure = |error: LedgerError| {
            CommandResult::failure("balance", "ledger", error.to_string(), 6)
        };
        let account = ledger.get_or_create(tenant, location).await.map_err(ledger_failure)?;
        let usage = ledger.usage_log(tenant, location).await.map_err(ledger_failure)?;
        pool.close().await;
        Ok((account, usage))
    });

    match result {
        Ok((account, usage)) => CommandResult::success_with_data(
            "balance",
            format!("{} tokens available", account.available),
            Some(json!({ "account": account, "usage": usage })),
        ),
        Err(failure) => failure,
    }
}
