use std::sync::Arc;

use authgate::api::{ApiClient, ApiError};
use authgate::config::{ClientConfig, ConfigError};
use authgate::query::{QueryError, QueryResult};
use authgate::{QueryClient, QueryKey, QueryRequest, SessionProvider};
use clap::{Parser, Subcommand};
use serde_json::{Value, json};
use tracing_subscriber::EnvFilter;

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Api(#[from] ApiError),
    #[error("invalid JSON output: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Parser, Debug)]
#[command(name = "authgate", about = "Inspect session state and run auth-gated API queries")]
struct Cli {
    #[arg(long, env = "AUTHGATE_BASE_URL")]
    base_url: Option<String>,

    #[arg(long, env = "AUTHGATE_SESSION_TOKEN")]
    session_token: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Resolve the session and print the auth guard.
    Status,
    /// Run one guarded GET against an API path.
    Fetch {
        path: String,
        #[arg(long, default_value_t = false, help = "Endpoint does not require a signed-in user")]
        public: bool,
        #[arg(long, default_value_t = false, help = "Force the caller precondition off")]
        disabled: bool,
    },
}

#[tokio::main]
async fn main() -> Result<(), CliError> {
    let _ = dotenvy::dotenv();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let mut config = ClientConfig::from_env()?;
    if let Some(base_url) = cli.base_url.as_deref() {
        config = config.with_base_url(base_url)?;
    }
    if let Some(token) = cli.session_token.as_deref() {
        config = config.with_session_token(token);
    }

    let api = Arc::new(ApiClient::new(&config)?);
    let provider = SessionProvider::new();
    if let Err(e) = provider.refresh(api.as_ref()).await {
        tracing::warn!(error = %e, base_url = api.base_url(), "continuing without a session");
    }

    let output = match cli.command {
        Command::Status => status_json(&provider),
        Command::Fetch { path, public, disabled } => {
            let client = QueryClient::new(config.query);
            let fetch_api = Arc::clone(&api);
            let fetch_path = path.clone();
            let request = QueryRequest::new(QueryKey::from_path(&path), move || {
                let api = Arc::clone(&fetch_api);
                let path = fetch_path.clone();
                async move { api.get_json(&path).await.map_err(QueryError::from) }
            })
            .with_require_auth(!public)
            .with_enabled(!disabled);

            let result = provider.guarded_fetch(request, &client).await;
            result_json(&path, &result)
        }
    };

    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

fn status_json(provider: &SessionProvider) -> Value {
    let guard = provider.guard();
    json!({
        "guard": guard,
        "phase": guard.phase(),
        "user": provider.snapshot().user,
    })
}

fn result_json(path: &str, result: &QueryResult<Value>) -> Value {
    json!({
        "path": path,
        "status": result.status,
        "data": result.data,
        "error": result.error.as_ref().map(ToString::to_string),
    })
}
