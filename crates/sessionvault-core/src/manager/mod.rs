//! Session lifecycle manager.
//!
//! `SessionManager::spawn` starts a single worker task that owns the live
//! session and the only handle allowed to write it to the credential store.
//! Callers talk to it through a cloneable [`SessionHandle`]; every intent is
//! queued and processed to completion, in arrival order, before the next.
//!
//! States: `SignedOut`, `Authenticating` (startup hydration or sign-in in
//! flight), `Authenticated`, `Refreshing`, `SigningOut`.

mod intent;
mod worker;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, oneshot, watch};

pub use intent::{AuthIntent, IntentOutcome, SessionChange, SessionEvent, SessionPhase};

use crate::api::IdentityProvider;
use crate::auth::{RedactedUser, DEFAULT_REFRESH_MARGIN_SECS};
use crate::config::Config;
use crate::error::AuthError;
use crate::store::CredentialStore;
use worker::{Command, SessionWorker};

/// Pending intents before callers are made to wait
const COMMAND_QUEUE_CAPACITY: usize = 64;

/// Buffered session events per subscriber
const EVENT_CHANNEL_CAPACITY: usize = 32;

/// Delay before retrying a refresh that failed for a transient reason
const DEFAULT_RETRY_BACKOFF_SECS: u64 = 30;

const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 20;

#[derive(Debug, Clone)]
pub struct ManagerOptions {
    /// Upper bound on any single identity provider call
    pub request_timeout: Duration,
    /// How long before expiry a refresh is scheduled
    pub refresh_margin_secs: i64,
    pub retry_backoff: Duration,
}

impl Default for ManagerOptions {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS),
            refresh_margin_secs: DEFAULT_REFRESH_MARGIN_SECS,
            retry_backoff: Duration::from_secs(DEFAULT_RETRY_BACKOFF_SECS),
        }
    }
}

impl From<&Config> for ManagerOptions {
    fn from(config: &Config) -> Self {
        Self {
            request_timeout: config.request_timeout(),
            refresh_margin_secs: config.refresh_margin_secs,
            ..Self::default()
        }
    }
}

pub struct SessionManager;

impl SessionManager {
    /// Start the session worker. Must be called inside a tokio runtime.
    ///
    /// Hydration from the store is queued first, so the first intent any
    /// caller sends observes its outcome.
    pub fn spawn(
        provider: Arc<dyn IdentityProvider>,
        store: Arc<CredentialStore>,
        options: ManagerOptions,
    ) -> SessionHandle {
        let (commands, queue) = mpsc::channel(COMMAND_QUEUE_CAPACITY);
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (phase_tx, phase) = watch::channel(SessionPhase::Authenticating);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let worker = SessionWorker::new(
            provider,
            store,
            options,
            phase_tx,
            events.clone(),
            commands.downgrade(),
        );
        // Fresh channel with spare capacity; this cannot fail
        let _ = commands.try_send(Command::Hydrate);
        tokio::spawn(worker.run(queue, shutdown_rx));

        SessionHandle {
            commands,
            events,
            phase,
            shutdown: Arc::new(shutdown_tx),
        }
    }
}

/// Cloneable front door to the session worker.
#[derive(Clone)]
pub struct SessionHandle {
    commands: mpsc::Sender<Command>,
    events: broadcast::Sender<SessionEvent>,
    phase: watch::Receiver<SessionPhase>,
    shutdown: Arc<watch::Sender<bool>>,
}

impl SessionHandle {
    /// Queue an intent and wait for its result.
    pub async fn dispatch(&self, intent: AuthIntent) -> Result<IntentOutcome, AuthError> {
        self.submit(intent).await?.wait().await
    }

    /// Queue an intent without waiting for it to run.
    ///
    /// Intents run in the order `submit` returns, which lets a caller keep
    /// reading new requests while earlier ones are still in flight.
    pub async fn submit(&self, intent: AuthIntent) -> Result<PendingIntent, AuthError> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(Command::Intent { intent, reply })
            .await
            .map_err(|_| AuthError::Unavailable)?;
        Ok(PendingIntent(response))
    }

    pub async fn sign_in(&self, email: &str, password: &str) -> Result<IntentOutcome, AuthError> {
        self.dispatch(AuthIntent::SignIn {
            email: email.to_string(),
            password: password.to_string(),
        })
        .await
    }

    pub async fn sign_up(&self, email: &str, password: &str) -> Result<IntentOutcome, AuthError> {
        self.dispatch(AuthIntent::SignUp {
            email: email.to_string(),
            password: password.to_string(),
        })
        .await
    }

    pub async fn sign_out(&self) -> Result<IntentOutcome, AuthError> {
        self.dispatch(AuthIntent::SignOut).await
    }

    pub async fn reset_password(&self, email: &str) -> Result<IntentOutcome, AuthError> {
        self.dispatch(AuthIntent::ResetPassword {
            email: email.to_string(),
        })
        .await
    }

    pub async fn update_password(&self, new_password: &str) -> Result<IntentOutcome, AuthError> {
        self.dispatch(AuthIntent::UpdatePassword {
            new_password: new_password.to_string(),
        })
        .await
    }

    pub async fn refresh(&self) -> Result<IntentOutcome, AuthError> {
        self.dispatch(AuthIntent::RefreshSession).await
    }

    /// Redacted view of the current user, if signed in.
    pub async fn current_user(&self) -> Result<Option<RedactedUser>, AuthError> {
        Ok(self.dispatch(AuthIntent::GetCurrentSession).await?.user)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    pub fn phase(&self) -> SessionPhase {
        *self.phase.borrow()
    }

    pub fn watch_phase(&self) -> watch::Receiver<SessionPhase> {
        self.phase.clone()
    }

    /// Stop the worker, abandoning any in-flight operation.
    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
    }

    pub fn is_closed(&self) -> bool {
        self.commands.is_closed()
    }
}

/// An intent that has been queued but may not have run yet.
pub struct PendingIntent(oneshot::Receiver<Result<IntentOutcome, AuthError>>);

impl PendingIntent {
    pub async fn wait(self) -> Result<IntentOutcome, AuthError> {
        self.0.await.map_err(|_| AuthError::Unavailable)?
    }
}
