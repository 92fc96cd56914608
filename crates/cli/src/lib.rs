pub mod commands;

use clap::{Parser, Subcommand};
use std::process::ExitCode;

#[derive(Debug, Parser)]
#[command(
    name = "frontdesk",
    about = "Frontdesk operator CLI",
    long_about = "Operate frontdesk migrations, readiness checks, config inspection, the action \
                  catalog, and tenant token ledgers.",
    after_help = "Examples:\n  frontdesk doctor --json\n  frontdesk credit --tenant gym-1 \
                  --tokens 500\n  frontdesk balance --tenant gym-1 --location downtown"
)]
pub struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    #[command(about = "Apply pending database migrations and return structured status output")]
    Migrate,
    #[command(
        about = "Inspect effective configuration values with source attribution and redaction"
    )]
    Config,
    #[command(about = "Validate config, model readiness, policy file, and DB connectivity")]
    Doctor {
        #[arg(long, help = "Emit machine-readable JSON output")]
        json: bool,
    },
    #[command(about = "List registered action types with cost, permissions, and parameters")]
    Catalog,
    #[command(about = "Add purchased tokens to a tenant or location account")]
    Credit {
        #[arg(long)]
        tenant: String,
        #[arg(long)]
        location: Option<String>,
        #[arg(long)]
        tokens: u64,
    },
    #[command(about = "Show an account balance and its usage log")]
    Balance {
        #[arg(long)]
        tenant: String,
        #[arg(long)]
        location: Option<String>,
    },
}

pub fn run() -> ExitCode {
    let cli = Cli::parse();

    let result = match cli.command {
        Command::Migrate => commands::migrate::run(),
        Command::Config => {
            commands::CommandResult { exit_code: 0, output: commands::config::run() }
        }
        Command::Doctor { json } => commands::doctor::run(json),
        Command::Catalog => commands::catalog::run(),
        Command::Credit { tenant, location, tokens } => {
            commands::credit::run(&tenant, location.as_deref(), tokens)
        }
        Command::Balance { tenant, location } => {
            commands::balance::run(&tenant, location.as_deref())
        }
    };

    println!("{}", result.output);
    ExitCode::from(result.exit_code)
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use super::{Cli, Command};

    #[test]
    fn credit_arguments_parse_with_optional_location() {
        let cli =
            Cli::try_parse_from(["frontdesk", "credit", "--tenant", "gym-1", "--tokens", "50"])
                .expect("parse");

        match cli.command {
            Command::Credit { tenant, location, tokens } => {
                assert_eq!(tenant, "gym-1");
                assert_eq!(location, None);
                assert_eq!(tokens, 50);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn credit_requires_a_token_amount() {
        assert!(Cli::try_parse_from(["frontdesk", "credit", "--tenant", "gym-1"]).is_err());
    }
}
