use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::info;

use subst_notifier::app::Services;
use subst_notifier::config;
use subst_notifier::db;
use subst_notifier::model::{AccountClaims, Credentials};

#[derive(Debug, Parser)]
#[command(author, version, about = "Operator tool for accounts and enrollments")]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Register portal credentials and print the new account id
    AddAccount { auth_id: String, auth_pw: String },
    /// Set the phone number that receives notifications
    SetPhone { account_id: String, phone_number: String },
    /// Enroll an account and capture its baseline
    Enroll {
        account_id: String,
        /// Portal login to use instead of the account's own
        #[arg(long, requires = "auth_pw")]
        auth_id: Option<String>,
        #[arg(long, requires = "auth_id")]
        auth_pw: Option<String>,
    },
    /// Remove an account's enrollment
    Unenroll { account_id: String },
    /// List accounts with their enrollment state
    List,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    let cfg = config::load(Some(&args.config))?;
    let services = Services::from_config(&cfg).await?;

    match args.command {
        Command::AddAccount { auth_id, auth_pw } => {
            let id = db::create_account(&services.pool, &Credentials::new(auth_id, auth_pw)).await?;
            println!("{id}");
        }
        Command::SetPhone {
            account_id,
            phone_number,
        } => {
            let claims = AccountClaims::new(account_id);
            let stored = services
                .enrollment
                .set_phone_number(&claims, &phone_number)
                .await?;
            info!(phone_number = %stored, "phone number saved");
        }
        Command::Enroll {
            account_id,
            auth_id,
            auth_pw,
        } => {
            let claims = AccountClaims::new(account_id);
            let override_credentials = auth_id.zip(auth_pw).map(|(id, pw)| Credentials::new(id, pw));
            let outcome = services
                .enrollment
                .enroll(&claims, override_credentials)
                .await?;
            info!(?outcome, "enrolled");
        }
        Command::Unenroll { account_id } => {
            services
                .enrollment
                .unenroll(&AccountClaims::new(account_id))
                .await?;
        }
        Command::List => {
            for account in db::list_accounts(&services.pool).await? {
                println!(
                    "{}\t{}\t{}\t{}",
                    account.id,
                    account.auth_id,
                    account.phone_number.as_deref().unwrap_or("-"),
                    if account.enrolled { "enrolled" } else { "-" }
                );
            }
        }
    }

    Ok(())
}
