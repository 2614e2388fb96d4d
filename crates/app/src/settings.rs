use api_types::expense::ExpenseStatus;
use chrono::NaiveDate;
use clap::{Args, Parser, Subcommand};
use data_access::ConnectionConfig;
use rust_decimal::Decimal;
use serde::Deserialize;
use uuid::Uuid;

use crate::error::Result;

const DEFAULT_CONFIG_PATH: &str = "config/spese.toml";

#[derive(Clone, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub endpoint: String,
    pub credential: String,
    pub email: Option<String>,
    pub password: Option<String>,
    pub log_level: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            endpoint: "http://127.0.0.1:54321".to_string(),
            credential: String::new(),
            email: None,
            password: None,
            log_level: "info".to_string(),
        }
    }
}

impl std::fmt::Debug for Settings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Settings")
            .field("endpoint", &self.endpoint)
            .field("email", &self.email)
            .field("log_level", &self.log_level)
            .finish_non_exhaustive()
    }
}

impl Settings {
    pub fn connection(&self) -> ConnectionConfig {
        ConnectionConfig::new(&self.endpoint, &self.credential)
    }
}

#[derive(Debug, Parser)]
#[command(name = "spese", disable_version_flag = true)]
struct Cli {
    /// Optional config file path (TOML).
    #[arg(long, global = true)]
    config: Option<String>,
    /// Override the service endpoint (e.g. https://project.example.co).
    #[arg(long, global = true)]
    endpoint: Option<String>,
    /// Override the API credential.
    #[arg(long, global = true)]
    credential: Option<String>,
    /// Override the sign-in email (password is never read from CLI).
    #[arg(long, global = true)]
    email: Option<String>,
    /// Override the log level.
    #[arg(long, global = true)]
    log_level: Option<String>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, PartialEq, Subcommand)]
pub enum Command {
    /// List expenses, newest first.
    List {
        #[arg(long)]
        status: Option<ExpenseStatus>,
    },
    /// Record a new expense.
    Add(AddArgs),
    /// Change fields of an expense.
    Update(UpdateArgs),
    /// Delete an expense.
    Delete { id: Uuid },
    /// Print the expense list again on every remote change until Ctrl-C.
    Watch,
    /// List expense categories.
    Categories,
}

#[derive(Debug, Clone, PartialEq, Args)]
pub struct AddArgs {
    #[arg(long)]
    pub amount: Decimal,
    #[arg(long)]
    pub category: Uuid,
    #[arg(long)]
    pub organization: Uuid,
    /// Defaults to the signed-in user.
    #[arg(long)]
    pub user: Option<Uuid>,
    /// Defaults to today.
    #[arg(long)]
    pub date: Option<NaiveDate>,
    #[arg(long)]
    pub description: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Args)]
pub struct UpdateArgs {
    pub id: Uuid,
    #[arg(long)]
    pub amount: Option<Decimal>,
    #[arg(long)]
    pub category: Option<Uuid>,
    #[arg(long)]
    pub date: Option<NaiveDate>,
    #[arg(long)]
    pub description: Option<String>,
    #[arg(long)]
    pub status: Option<ExpenseStatus>,
}

pub fn load() -> Result<(Settings, Command)> {
    resolve(Cli::parse())
}

fn resolve(cli: Cli) -> Result<(Settings, Command)> {
    let config_path = cli.config.as_deref().unwrap_or(DEFAULT_CONFIG_PATH);
    let mut builder = config::Config::builder();
    builder = builder.add_source(config::File::with_name(config_path).required(false));
    builder = builder.add_source(config::Environment::with_prefix("SPESE"));
    let mut settings: Settings = builder.build()?.try_deserialize()?;

    if let Some(endpoint) = cli.endpoint {
        settings.endpoint = endpoint;
    }
    if let Some(credential) = cli.credential {
        settings.credential = credential;
    }
    if let Some(email) = cli.email {
        settings.email = Some(email);
    }
    if let Some(log_level) = cli.log_level {
        settings.log_level = log_level;
    }

    Ok((settings, cli.command))
}
