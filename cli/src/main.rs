use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use reqwest::Method;
use serde_json::{Map, Value};
use session_guard::codec::{self, Claims};
use session_guard::config::ConfigError;
use session_guard::policy::unix_now;
use session_guard::store::StoreError;
use session_guard::{
    ApiError, ApiRequest, FileStore, LoginError, MemoryHistory, Navigator, SessionConfig, SessionContext,
    SessionEvent,
};
use time::format_description::well_known::Rfc3339;
use tokio::sync::broadcast;
use tracing_subscriber::EnvFilter;

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error("no credential stored; run `session-cli login <token>` first")]
    MissingToken,
    #[error("credential is not a decodable three-segment token")]
    Undecodable,
    #[error("invalid HTTP method: {0}")]
    InvalidMethod(String),
    #[error("invalid query pair `{0}`; expected key=value")]
    InvalidQuery(String),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("session store error: {0}")]
    Store(#[from] StoreError),
    #[error("login failed: {0}")]
    Login(#[from] LoginError),
    #[error(transparent)]
    Api(#[from] ApiError),
    #[error("invalid JSON payload: {0}")]
    InvalidJson(#[from] serde_json::Error),
    #[error("timestamp formatting failed: {0}")]
    Format(#[from] time::error::Format),
}

#[derive(Parser, Debug)]
#[command(name = "session-cli", about = "Inspect and drive a stored API session")]
struct Cli {
    /// Session store file; defaults to SESSION_STORE_PATH.
    #[arg(long, env = "SESSION_STORE_PATH")]
    store: Option<PathBuf>,

    /// Path the client is "on", used as the post-login redirect target.
    #[arg(long, default_value = "/")]
    at: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Decode a token (or the stored one) and report its expiry.
    Inspect { token: Option<String> },
    /// Mint an unsigned token for local testing.
    Mint {
        #[arg(long, default_value_t = 3600)]
        expires_in: i64,
        #[arg(long, default_value = "local-user")]
        sub: String,
        #[arg(long)]
        no_exp: bool,
    },
    Login { token: String },
    Logout,
    Status,
    /// Send one request through the authenticated pipeline.
    Request {
        method: String,
        path: String,
        #[arg(long)]
        data: Option<String>,
        #[arg(long = "query", short = 'q')]
        query: Vec<String>,
    },
    /// Run the expiry monitor until the session ends.
    Watch,
}

#[tokio::main]
async fn main() -> Result<(), CliError> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let mut config = SessionConfig::from_env()?;
    if let Some(store) = cli.store {
        config.store_path = store;
    }

    let history = Arc::new(MemoryHistory::new(cli.at));
    let backend = Arc::new(FileStore::new(config.store_path.clone()));
    let ctx = SessionContext::new(config, backend, history.clone());

    match cli.command {
        Command::Inspect { token } => run_inspect(&ctx, token),
        Command::Mint { expires_in, sub, no_exp } => {
            println!("{}", mint(&sub, (!no_exp).then(|| unix_now() + expires_in)));
            Ok(())
        }
        Command::Login { token } => run_login(&ctx, &token),
        Command::Logout => {
            ctx.logout()?;
            println!("logged out");
            Ok(())
        }
        Command::Status => run_status(&ctx),
        Command::Request { method, path, data, query } => {
            run_request(&ctx, &history, &method, &path, data.as_deref(), &query).await
        }
        Command::Watch => run_watch(&ctx, &history).await,
    }
}

fn run_inspect(ctx: &SessionContext, token: Option<String>) -> Result<(), CliError> {
    let token = token.or_else(|| ctx.store().get()).ok_or(CliError::MissingToken)?;
    let claims = codec::decode(&token).ok_or(CliError::Undecodable)?;
    let mut report = Map::new();
    report.insert("claims".into(), Value::Object(claims));
    report.extend(expiry_report(ctx, &token)?);
    print_json(&Value::Object(report))
}

fn run_login(ctx: &SessionContext, token: &str) -> Result<(), CliError> {
    let redirect = ctx.login(token)?;
    match redirect {
        Some(target) => println!("logged in; continue at {target}"),
        None => println!("logged in; continue at {}", ctx.config().home_path),
    }
    Ok(())
}

fn run_status(ctx: &SessionContext) -> Result<(), CliError> {
    let Some(token) = ctx.store().get() else {
        println!("logged out");
        return Ok(());
    };
    let mut report = Map::new();
    report.insert("store".into(), Value::String(ctx.config().store_path.display().to_string()));
    report.extend(expiry_report(ctx, &token)?);
    if let Some(target) = ctx.store().redirect_target() {
        report.insert("redirect_after_login".into(), Value::String(target));
    }
    print_json(&Value::Object(report))
}

async fn run_request(
    ctx: &SessionContext,
    history: &MemoryHistory,
    method: &str,
    path: &str,
    data: Option<&str>,
    query: &[String],
) -> Result<(), CliError> {
    let method = Method::from_bytes(method.to_ascii_uppercase().as_bytes())
        .map_err(|_| CliError::InvalidMethod(method.to_owned()))?;
    let pairs = query
        .iter()
        .map(|pair| {
            pair.split_once('=')
                .ok_or_else(|| CliError::InvalidQuery(pair.clone()))
        })
        .collect::<Result<Vec<_>, _>>()?;

    let mut request = ApiRequest::new(method, path).with_query(&pairs);
    if let Some(data) = data {
        request = request.with_json(serde_json::from_str(data)?);
    }

    let client = ctx.http_client()?;
    let mut events = ctx.subscribe();
    let result = client.execute(request).await;
    report_events(&mut events);

    match result {
        Ok(response) => print_json(&response.body),
        Err(err) => {
            if let Some(body) = err.body() {
                print_json(body)?;
            }
            if history.navigation_count() > 0 {
                eprintln!("navigated to {}", history.current_path());
            }
            Err(err.into())
        }
    }
}

async fn run_watch(ctx: &SessionContext, history: &MemoryHistory) -> Result<(), CliError> {
    if ctx.store().get().is_none() {
        return Err(CliError::MissingToken);
    }
    // Subscribe first: an already-expired credential is handled inside `start`.
    let mut events = ctx.subscribe();
    ctx.monitor().start();
    eprintln!(
        "watching session, {}s remaining, polling every {}s",
        ctx.policy().remaining_seconds(None),
        ctx.monitor().interval().as_secs()
    );

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(SessionEvent::TokenExpired) => {
                    eprintln!("session expired; navigated to {}", history.current_path());
                    break;
                }
                Ok(SessionEvent::Notice(notice)) => eprintln!("{:?}: {}", notice.kind, notice.message),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "event receiver lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            _ = tokio::signal::ctrl_c() => {
                ctx.monitor().stop();
                eprintln!("stopped");
                break;
            }
        }
    }
    Ok(())
}

fn expiry_report(ctx: &SessionContext, token: &str) -> Result<Map<String, Value>, CliError> {
    let policy = ctx.policy();
    let mut report = Map::new();
    let expires_at = match policy.expiry_instant(Some(token)) {
        Some(at) => Value::String(at.format(&Rfc3339)?),
        None => Value::Null,
    };
    report.insert("expires_at".into(), expires_at);
    report.insert("remaining_seconds".into(), policy.remaining_seconds(Some(token)).into());
    report.insert("expired".into(), policy.is_expired(Some(token)).into());
    report.insert("valid".into(), policy.is_valid(Some(token)).into());
    Ok(report)
}

fn mint(sub: &str, exp: Option<i64>) -> String {
    let mut claims = Claims::new();
    claims.insert("sub".into(), Value::String(sub.to_owned()));
    claims.insert("iat".into(), unix_now().into());
    if let Some(exp) = exp {
        claims.insert("exp".into(), exp.into());
    }
    codec::encode_unsigned(&claims)
}

fn report_events(events: &mut broadcast::Receiver<SessionEvent>) {
    while let Ok(event) = events.try_recv() {
        match event {
            SessionEvent::TokenExpired => eprintln!("session expired"),
            SessionEvent::Notice(notice) => eprintln!("{:?}: {}", notice.kind, notice.message),
        }
    }
}

fn print_json(value: &Value) -> Result<(), CliError> {
    let rendered = serde_json::to_string_pretty(value)?;
    println!("{rendered}");
    Ok(())
}
