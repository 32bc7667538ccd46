//! sessionvault - privileged session host and command-line client.
//!
//! `sessionvault serve` is the privileged process: it owns the encrypted
//! credential store and the session manager, and speaks the bridge protocol
//! on stdin/stdout. Every other user-facing command plays the UI role: it
//! spawns `sessionvault serve` as a child and talks to it over the bridge.

use std::io;
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use tokio::process::{Child, Command};
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use sessionvault_core::bridge::BridgeResponse;
use sessionvault_core::store::SESSION_KEY;
use sessionvault_core::{
    AuthError, BridgeClient, BridgeServer, Config, CredentialStore, HttpIdentityProvider, KeySource,
    ManagerOptions, SessionManager, StorageAdapter,
};

// ============================================================================
// Constants
// ============================================================================

/// Rolling log file prefix for the privileged process
const LOG_FILE_PREFIX: &str = "sessionvault.log";

/// How often `watch` checks whether the session host is still there
const CLOSED_POLL_INTERVAL: Duration = Duration::from_secs(1);

const USAGE: &str = "\
Usage: sessionvault <command>

Commands:
  serve                        Run the privileged session process on stdio
  init-key                     Generate an encryption secret in the OS keychain
  configure <url> <api-key>    Save the identity provider endpoint
  purge                        Delete the persisted session without signing out remotely
  sign-in <email>              Sign in (password read from the terminal)
  sign-up <email>              Register a new account
  sign-out                     Sign out and forget the session
  whoami                       Show the signed-in user
  reset-password <email>       Send a password reset email
  update-password              Change the password of the signed-in user
  watch                        Print session changes as they happen";

/// Initialize the tracing subscriber for logging.
///
/// With `log_dir`, events are also written to a daily-rolling file there;
/// the returned guard flushes it on drop.
fn init_tracing(log_dir: Option<&Path>) -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let stderr_layer = fmt::layer().with_writer(io::stderr);

    match log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::registry()
                .with(stderr_layer)
                .with(fmt::layer().with_ansi(false).with_writer(writer))
                .with(filter)
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::registry()
                .with(stderr_layer)
                .with(filter)
                .init();
            None
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (silently ignore if not found)
    let _ = dotenvy::dotenv();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let command = args.first().map(String::as_str).unwrap_or("");
    let operand = args.get(1).map(String::as_str);

    if command == "serve" {
        return serve().await;
    }

    init_tracing(None);
    match (command, operand) {
        ("init-key", _) => init_key(),
        ("configure", Some(url)) => configure(url, args.get(2).map(String::as_str)),
        ("purge", _) => purge(),
        ("sign-in", Some(email)) => sign_in(email).await,
        ("sign-up", Some(email)) => sign_up(email).await,
        ("sign-out", _) => sign_out().await,
        ("whoami", _) => whoami().await,
        ("reset-password", Some(email)) => reset_password(email).await,
        ("update-password", _) => update_password().await,
        ("watch", _) => watch().await,
        _ => {
            eprintln!("{}", USAGE);
            std::process::exit(2);
        }
    }
}

// ============================================================================
// Privileged process
// ============================================================================

async fn serve() -> Result<()> {
    let config = Config::load()?;
    let data_dir = config.data_dir()?;
    std::fs::create_dir_all(&data_dir)
        .with_context(|| format!("Failed to create data directory {:?}", data_dir))?;
    let _log_guard = init_tracing(Some(&data_dir));

    config.validate()?;
    let secret = KeySource::resolve()?;
    let store = Arc::new(
        CredentialStore::open(config.store_path()?, &secret, &config.key_id)
            .context("Failed to open credential store")?,
    );
    drop(secret);

    let (provider_url, api_key) = match (&config.provider_url, &config.provider_api_key) {
        (Some(url), Some(key)) => (url.clone(), key.clone()),
        _ => bail!("Identity provider is not configured"),
    };
    let provider = HttpIdentityProvider::with_timeout(provider_url, api_key, config.request_timeout())?
        .with_storage(Arc::new(StorageAdapter::new(store.clone())));

    info!(store = ?store.path(), "Session host starting");
    let handle = SessionManager::spawn(Arc::new(provider), store, ManagerOptions::from(&config));
    let server = BridgeServer::new(handle.clone());

    let result = server.serve(tokio::io::stdin(), tokio::io::stdout()).await;
    handle.shutdown();
    info!("Session host shutting down");
    result.context("Bridge connection failed")
}

// ============================================================================
// Maintenance
// ============================================================================

fn init_key() -> Result<()> {
    if KeySource::has_keychain_secret() {
        bail!("An encryption secret already exists in the keychain; purge the store before replacing it");
    }
    KeySource::generate_into_keychain()?;
    println!("Encryption secret stored in the OS keychain.");
    Ok(())
}

fn configure(url: &str, api_key: Option<&str>) -> Result<()> {
    let api_key = api_key.ok_or_else(|| anyhow!("Missing API key\n\n{}", USAGE))?;
    let mut config = Config::load()?;
    config.provider_url = Some(url.to_string());
    config.provider_api_key = Some(api_key.to_string());
    config.validate()?;
    config.save()?;
    println!("Identity provider set to {}", url);
    Ok(())
}

/// Drop the persisted session without contacting the provider.
///
/// A running session host notices the next time it renews the session and
/// signs out locally.
fn purge() -> Result<()> {
    let config = Config::load()?;
    let secret = KeySource::resolve()?;
    let store = CredentialStore::open(config.store_path()?, &secret, &config.key_id)
        .context("Failed to open credential store")?;
    store
        .delete(SESSION_KEY)
        .context("Failed to remove persisted session")?;
    println!("Persisted session removed.");
    Ok(())
}

// ============================================================================
// UI side
// ============================================================================

/// A running `sessionvault serve` child and the bridge connected to it.
struct SessionHost {
    child: Child,
    client: BridgeClient,
}

impl SessionHost {
    fn spawn() -> Result<Self> {
        let exe = std::env::current_exe().context("Cannot locate sessionvault executable")?;
        let mut child = Command::new(exe)
            .arg("serve")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .context("Failed to start session host")?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow!("Session host stdin unavailable"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow!("Session host stdout unavailable"))?;

        Ok(Self {
            child,
            client: BridgeClient::connect(stdout, stdin),
        })
    }

    /// Close the bridge and wait for the host to exit.
    async fn close(self) -> Result<()> {
        let SessionHost { mut child, client } = self;
        drop(client);
        let status = child.wait().await?;
        if !status.success() {
            warn!(%status, "Session host exited with an error");
        }
        Ok(())
    }
}

/// Print a bridge response; failures become the command's error.
fn report(response: BridgeResponse, success: &str) -> Result<()> {
    match response.into_result() {
        Ok(outcome) => {
            if let Some(warning) = outcome.warning {
                eprintln!("Warning: {}", warning);
            }
            println!("{}", success);
            if let Some(user) = outcome.user {
                println!("Signed in as {} ({})", user.email, user.user_id);
            }
            Ok(())
        }
        Err(e) if e.is_retryable() => Err(anyhow!("{} Please try again.", failure_text(&e))),
        Err(e) => Err(e.into()),
    }
}

fn failure_text(error: &AuthError) -> String {
    let text = error.to_string();
    if text.ends_with('.') {
        text
    } else {
        format!("{}.", text)
    }
}

fn read_password(prompt: &str) -> Result<String> {
    let password = rpassword::prompt_password(prompt).context("Failed to read password")?;
    if password.is_empty() {
        bail!("Password cannot be empty");
    }
    Ok(password)
}

async fn sign_in(email: &str) -> Result<()> {
    let password = read_password("Password: ")?;
    let host = SessionHost::spawn()?;
    let response = host.client.sign_in_with_email(email, &password).await?;
    host.close().await?;
    report(response, "Signed in.")
}

async fn sign_up(email: &str) -> Result<()> {
    let password = read_password("Choose a password: ")?;
    if read_password("Confirm password: ")? != password {
        bail!("Passwords do not match");
    }
    let host = SessionHost::spawn()?;
    let response = host.client.sign_up(email, &password).await?;
    host.close().await?;
    report(response, "Account registered. Check your email to confirm it, then sign in.")
}

async fn sign_out() -> Result<()> {
    let host = SessionHost::spawn()?;
    let response = host.client.sign_out().await?;
    host.close().await?;
    report(response, "Signed out.")
}

async fn whoami() -> Result<()> {
    let host = SessionHost::spawn()?;
    let response = host.client.get_current_user().await?;
    host.close().await?;
    let outcome = response.into_result()?;
    match outcome.user {
        Some(user) => println!("{} ({})", user.email, user.user_id),
        None => println!("Not signed in."),
    }
    Ok(())
}

async fn reset_password(email: &str) -> Result<()> {
    let host = SessionHost::spawn()?;
    let response = host.client.reset_password(email).await?;
    host.close().await?;
    report(response, "If that account exists, a reset email is on its way.")
}

async fn update_password() -> Result<()> {
    let password = read_password("New password: ")?;
    if read_password("Confirm new password: ")? != password {
        bail!("Passwords do not match");
    }
    let host = SessionHost::spawn()?;
    let response = host.client.update_password(&password).await?;
    host.close().await?;
    report(response, "Password updated.")
}

async fn watch() -> Result<()> {
    let host = SessionHost::spawn()?;
    let mut events = host.client.subscribe().await?;
    let current = host.client.get_current_user().await?.into_result()?;
    match current.user {
        Some(user) => println!("session: signed in as {}", user.email),
        None => println!("session: signed out"),
    }

    while !host.client.is_closed() {
        let event = match tokio::time::timeout(CLOSED_POLL_INTERVAL, events.recv()).await {
            Ok(event) => event,
            Err(_) => continue,
        };
        match event {
            Ok(event) => match event.user {
                Some(user) => println!("{:?}: {}", event.reason, user.email),
                None => println!("{:?}", event.reason),
            },
            Err(RecvError::Lagged(skipped)) => warn!(skipped, "Missed session events"),
            Err(RecvError::Closed) => break,
        }
    }
    eprintln!("Session host went away.");
    host.close().await
}
