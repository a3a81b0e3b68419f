//! Manage provider passwords in the desktop secret service.
//!
//! ```text
//! secretserviceclient search <connectionstring> <username>
//! secretserviceclient set [<connectionstring>] <username>
//! ```
//!
//! Exits with 1 on usage errors and 2 when the store fails.

use clap::Parser;
use console::Term;
use exasol_provider::credentials::{
    Cli, CliCommand, CredentialStore, EXIT_FAILURE, EXIT_USAGE, SecretServiceStore,
};
use exasol_provider::error::{ProviderError, ProviderResult};

fn prompt_password(username: &str) -> ProviderResult<String> {
    let term = Term::stderr();
    term.write_str(&format!("Password for {}: ", username))?;
    let password = term.read_secure_line()?;
    if password.is_empty() {
        return Err(ProviderError::invalid_argument("Empty password"));
    }
    Ok(password)
}

async fn run(command: CliCommand) -> ProviderResult<()> {
    let store = SecretServiceStore::new();
    match command {
        CliCommand::Search {
            connection,
            username,
        } => {
            for path in store.search(Some(&connection), &username).await? {
                println!("{}", path);
            }
        }
        CliCommand::Set {
            connection,
            username,
        } => {
            let password = prompt_password(&username)?;
            store
                .set(connection.as_deref(), &username, &password)
                .await?;
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            // --help and --version print to stdout and succeed
            let code = if e.use_stderr() { EXIT_USAGE } else { 0 };
            let _ = e.print();
            std::process::exit(code);
        }
    };

    if let Err(e) = run(cli.command).await {
        eprintln!("secretserviceclient: {}", e);
        std::process::exit(EXIT_FAILURE);
    }
}
