mod auth;
mod callback;
mod client;
mod commands;
mod config;
mod error;
mod logging;
#[cfg(test)]
mod testing;

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use tracing::{debug, error};

use auth::{RedirectTarget, SmartThings};
use client::{HttpClient, SmartAppClient};
use commands::Dispatcher;
use error::Result;

const COMMANDS_HELP: &str = "The following commands are supported:
  query DEVICE_TYPE all
  query DEVICE_TYPE DEVICE_NAME
  set DEVICE_TYPE DEVICE_NAME COMMAND";

#[derive(Parser)]
#[command(
    name = "smartthings-cli",
    about = "Query and control SmartThings devices from the command line",
    after_help = COMMANDS_HELP
)]
struct Cli {
    /// HTTP port number for initial authentication
    #[arg(long = "httpport", default_value_t = 8080)]
    http_port: u16,

    /// Enable debug messages
    #[arg(long)]
    debug: bool,

    /// OAuth2 client ID
    #[arg(long = "clientid")]
    client_id: Option<String>,

    /// OAuth2 client secret
    #[arg(long = "clientsecret")]
    client_secret: Option<String>,

    /// Public IP of this computer, used in the OAuth2 redirect URI
    #[arg(long = "publicip")]
    public_ip: Option<String>,

    /// Seconds to wait for the authorization redirect (0 waits forever)
    #[arg(long = "auth-timeout", default_value_t = 600)]
    auth_timeout: u64,

    /// Session file (defaults to ~/.smartthings_cli.json)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Command tokens, e.g. `query switch all`
    commands: Vec<String>,
}

impl Cli {
    fn auth_timeout(&self) -> Option<Duration> {
        (self.auth_timeout > 0).then(|| Duration::from_secs(self.auth_timeout))
    }
}

async fn run(cli: Cli) -> Result<i32> {
    let path = match &cli.config {
        Some(path) => path.clone(),
        None => config::default_config_path()?,
    };
    let mut session = config::load(&path)?;
    let credentials =
        session.credentials(cli.client_id.as_deref(), cli.client_secret.as_deref())?;

    let http = HttpClient::new();
    let provider = SmartThings::new(
        http.clone(),
        auth::API_BASE,
        RedirectTarget {
            public_ip: cli.public_ip.clone(),
            port: cli.http_port,
        },
        cli.auth_timeout(),
    );
    let authorized = auth::ensure_authorized(&mut session, &credentials, &provider).await?;

    let api = SmartAppClient::new(http, authorized.access_token, authorized.endpoint);
    let outcome = Dispatcher::new(&api)
        .run(commands::parse(&cli.commands))
        .await;

    config::save(&path, &session)?;
    let outcome = outcome?;
    debug!(
        "Reported {} device state(s), skipped {} command(s)",
        outcome.reported, outcome.failed
    );
    Ok(outcome.exit_code())
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    logging::init_logging(cli.debug);

    let code = match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            error!("{e}");
            e.exit_code()
        }
    };
    std::process::exit(code);
}
