//! Sentinel Client - Entry Point
//!
//! Restores (or establishes) a console session, then streams telemetry to
//! stdout as JSON lines until Ctrl-C.

use anyhow::{bail, Result};
use sentinel_client::session::{InvalidReason, RejectReason};
use sentinel_client::{
    ChannelConfig, Config, FileStore, HttpAuthService, LoginOutcome, ResendOutcome, Session,
    SessionManager, TelemetryChannel, VerifyOutcome, WebSocketConnector,
};
use std::io::Write;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader, Lines, Stdin};
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

type Input = Lines<BufReader<Stdin>>;

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment
    dotenvy::dotenv().ok();

    // Parse args
    let args: Vec<String> = std::env::args().collect();
    let json_logs = args.iter().any(|a| a == "--json-logs");
    let logout_mode = args.iter().any(|a| a == "--logout");
    let help_mode = args.iter().any(|a| a == "--help" || a == "-h");

    if help_mode {
        println!("Sentinel Client v{}", env!("CARGO_PKG_VERSION"));
        println!();
        println!("Usage: sentinel-client [OPTIONS]");
        println!();
        println!("Options:");
        println!("  --logout           Clear the stored session and exit");
        println!("  --json-logs        Log as JSON (stderr)");
        println!("  --help, -h         Show this help");
        println!();
        println!("Environment variables:");
        println!("  SENTINEL_AUTH_URL                   Auth service base URL");
        println!("  SENTINEL_TELEMETRY_URL              Telemetry WebSocket endpoint");
        println!("  SENTINEL_SESSION_PATH               Session file location");
        println!("  SENTINEL_AUTH_TIMEOUT               Auth request timeout (seconds)");
        println!("  SENTINEL_HEARTBEAT_MS               Synthetic heartbeat interval");
        println!("  SENTINEL_RECONNECT_MODE             fixed | exponential");
        println!("  SENTINEL_RECONNECT_MS               Reconnect (base) delay");
        println!("  SENTINEL_RECONNECT_MAX_MS           Reconnect delay cap");
        println!("  SENTINEL_TELEMETRY_REQUIRE_SESSION  Gate telemetry on login");
        println!("  RUST_LOG                            Log filter (e.g. info, sentinel_client=debug)");
        return Ok(());
    }

    // Logs go to stderr; stdout carries the telemetry stream
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    if json_logs {
        let subscriber = FmtSubscriber::builder()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .with_ansi(false)
            .json()
            .finish();
        tracing::subscriber::set_global_default(subscriber)?;
    } else {
        let subscriber = FmtSubscriber::builder()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .with_ansi(true)
            .finish();
        tracing::subscriber::set_global_default(subscriber)?;
    }

    info!("Sentinel Client v{}", env!("CARGO_PKG_VERSION"));

    let config = Config::from_env()?;
    let auth = HttpAuthService::from_config(&config)?;
    let store = FileStore::new(config.session_path.clone());
    let manager = SessionManager::new(Arc::new(auth), Arc::new(store));

    if logout_mode {
        manager.logout();
        println!("Signed out.");
        return Ok(());
    }

    let mut input = BufReader::new(tokio::io::stdin()).lines();

    let session = match manager.restore_session() {
        Some(session) => session,
        None => login(&manager, &mut input).await?,
    };
    eprintln!(
        "Signed in as {} <{}>",
        session.principal.display_name, session.principal.email
    );

    stream_telemetry(&config, &session).await
}

/// Credential → code flow on stdin
async fn login(manager: &SessionManager, input: &mut Input) -> Result<Session> {
    loop {
        let email = prompt(input, "Email: ").await?;
        let password = prompt(input, "Password: ").await?;

        match manager.submit_credentials(&email, &password).await {
            LoginOutcome::SessionEstablished(session) => return Ok(session),
            LoginOutcome::ChallengeRequired(view) => {
                eprintln!("A 6-digit code was sent for {}.", view.subject);
                if let Some(session) = challenge(manager, input).await? {
                    return Ok(session);
                }
            }
            LoginOutcome::InvalidCredentials(InvalidReason::Malformed(e)) => eprintln!("{}", e),
            LoginOutcome::InvalidCredentials(InvalidReason::Rejected) => {
                eprintln!("Invalid email or password.")
            }
            LoginOutcome::Unavailable(e) => eprintln!("Sign-in unavailable ({}), try again.", e),
            LoginOutcome::Superseded => {}
        }
    }
}

/// Code entry; `None` when the user goes back to the credential step
async fn challenge(manager: &SessionManager, input: &mut Input) -> Result<Option<Session>> {
    loop {
        let line = prompt(input, "Code (or 'resend', 'back'): ").await?;

        match line.as_str() {
            "back" => {
                manager.cancel_challenge();
                return Ok(None);
            }
            "resend" => {
                match manager.request_resend().await? {
                    ResendOutcome::Resent(_) => eprintln!("A new code was sent."),
                    ResendOutcome::Throttled { remaining_secs } => {
                        eprintln!("You can request a new code in {}s.", remaining_secs)
                    }
                    ResendOutcome::Unavailable(e) => eprintln!("Could not resend ({}).", e),
                    ResendOutcome::Superseded => {}
                }
                continue;
            }
            code => {
                if let Err(e) = manager.paste_challenge_code(code) {
                    eprintln!("{}", e);
                    continue;
                }
            }
        }

        match manager.verify_challenge().await? {
            VerifyOutcome::SessionEstablished(session) => return Ok(Some(session)),
            VerifyOutcome::ChallengeRejected(RejectReason::Incomplete) => {
                eprintln!("Enter all 6 digits.")
            }
            VerifyOutcome::ChallengeRejected(RejectReason::WrongCode) => {
                eprintln!("That code is not valid.")
            }
            VerifyOutcome::Unavailable(e) => eprintln!("Verification unavailable ({}), try again.", e),
            VerifyOutcome::Superseded => {}
        }
    }
}

async fn prompt(input: &mut Input, label: &str) -> Result<String> {
    eprint!("{}", label);
    std::io::stderr().flush()?;

    match input.next_line().await? {
        Some(line) => Ok(line.trim().to_string()),
        None => bail!("Input closed"),
    }
}

/// Print every payload as a JSON line until Ctrl-C
async fn stream_telemetry(config: &Config, session: &Session) -> Result<()> {
    let channel = TelemetryChannel::new(
        Arc::new(WebSocketConnector::default()),
        ChannelConfig::from_config(config),
    );

    channel.on_data(|payload| match serde_json::to_string(payload) {
        Ok(line) => println!("{}", line),
        Err(e) => warn!("Failed to render payload: {}", e),
    });
    channel.on_error(|e| warn!("Telemetry: {}", e));

    channel.authorize(Some(session.access_token.clone())).await;
    channel.open(config.telemetry_url.clone()).await?;
    info!("Streaming telemetry from {} (Ctrl-C to stop)", config.telemetry_url);

    tokio::signal::ctrl_c().await?;

    channel.close().await;
    info!("Telemetry channel closed");
    Ok(())
}
