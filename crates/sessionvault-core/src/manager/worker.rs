use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::intent::{AuthIntent, IntentOutcome, SessionChange, SessionEvent, SessionPhase};
use super::ManagerOptions;
use crate::api::{IdentityProvider, ProviderError};
use crate::auth::{RedactedUser, Session};
use crate::error::AuthError;
use crate::store::{CredentialStore, SESSION_KEY};

/// Shortest delay before a scheduled refresh fires
const MIN_REFRESH_DELAY_SECS: i64 = 1;

pub(super) type Reply = oneshot::Sender<Result<IntentOutcome, AuthError>>;

pub(super) enum Command {
    Intent { intent: AuthIntent, reply: Reply },
    Hydrate,
    Validate,
    TimedRefresh { generation: u64 },
}

enum SessionState {
    SignedOut,
    Authenticating,
    Authenticated(Session),
    Refreshing(Session),
    SigningOut,
}

impl SessionState {
    fn phase(&self) -> SessionPhase {
        match self {
            SessionState::SignedOut => SessionPhase::SignedOut,
            SessionState::Authenticating => SessionPhase::Authenticating,
            SessionState::Authenticated(_) => SessionPhase::Authenticated,
            SessionState::Refreshing(_) => SessionPhase::Refreshing,
            SessionState::SigningOut => SessionPhase::SigningOut,
        }
    }

    fn session(&self) -> Option<&Session> {
        match self {
            SessionState::Authenticated(session) | SessionState::Refreshing(session) => Some(session),
            _ => None,
        }
    }

    fn into_session(self) -> Option<Session> {
        match self {
            SessionState::Authenticated(session) | SessionState::Refreshing(session) => Some(session),
            _ => None,
        }
    }
}

/// Owns the live session and runs one command at a time.
///
/// Within the process, only this worker writes the persisted session. Commands arrive on a
/// single ordered queue, so a sign-out queued behind a sign-in runs after
/// the sign-in completes and then undoes it.
pub(super) struct SessionWorker {
    provider: Arc<dyn IdentityProvider>,
    store: Arc<CredentialStore>,
    options: ManagerOptions,
    state: SessionState,
    phase_tx: watch::Sender<SessionPhase>,
    events: broadcast::Sender<SessionEvent>,
    commands: mpsc::WeakSender<Command>,
    timer: Option<JoinHandle<()>>,
    generation: u64,
    /// Whether the store holds the session this worker is running
    persisted: bool,
}

impl SessionWorker {
    pub(super) fn new(
        provider: Arc<dyn IdentityProvider>,
        store: Arc<CredentialStore>,
        options: ManagerOptions,
        phase_tx: watch::Sender<SessionPhase>,
        events: broadcast::Sender<SessionEvent>,
        commands: mpsc::WeakSender<Command>,
    ) -> Self {
        Self {
            provider,
            store,
            options,
            state: SessionState::Authenticating,
            phase_tx,
            events,
            commands,
            timer: None,
            generation: 0,
            persisted: false,
        }
    }

    pub(super) async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        debug!("Session worker started");
        loop {
            let command = tokio::select! {
                biased;
                _ = shutdown.changed() => break,
                command = commands.recv() => match command {
                    Some(command) => command,
                    None => break,
                },
            };

            tokio::select! {
                biased;
                _ = shutdown.changed() => {
                    debug!("Shutdown requested, abandoning in-flight operation");
                    break;
                }
                _ = self.handle(command) => {}
            }
        }
        self.disarm_timer();
        debug!("Session worker stopped");
    }

    async fn handle(&mut self, command: Command) {
        match command {
            Command::Intent { intent, reply } => {
                let name = intent.name();
                debug!(intent = name, "Processing intent");
                let result = self.execute(intent).await;
                if let Err(ref e) = result {
                    debug!(intent = name, code = e.code(), "Intent failed");
                }
                // The caller may have given up waiting
                let _ = reply.send(result);
            }
            Command::Hydrate => self.hydrate().await,
            Command::Validate => self.validate().await,
            Command::TimedRefresh { generation } => {
                if generation != self.generation {
                    debug!("Ignoring superseded refresh timer");
                    return;
                }
                if let SessionState::Authenticated(session) = &self.state {
                    let session = session.clone();
                    if let Err(e) = self.refresh(session).await {
                        warn!(code = e.code(), "Background refresh failed");
                    }
                }
            }
        }
    }

    async fn execute(&mut self, intent: AuthIntent) -> Result<IntentOutcome, AuthError> {
        match intent {
            AuthIntent::SignIn { email, password } => self.sign_in(&email, &password).await,
            AuthIntent::SignUp { email, password } => self.sign_up(&email, &password).await,
            AuthIntent::SignOut => Ok(self.sign_out().await),
            AuthIntent::ResetPassword { email } => {
                self.call(self.provider.reset_password(&email)).await?;
                info!("Password reset requested");
                Ok(self.outcome(None))
            }
            AuthIntent::UpdatePassword { new_password } => self.update_password(&new_password).await,
            AuthIntent::GetCurrentSession => Ok(self.outcome(None)),
            AuthIntent::RefreshSession => {
                let session = self.current_authenticated()?;
                let warning = self.refresh(session).await?;
                Ok(self.outcome(warning))
            }
        }
    }

    // ===== Transitions =====

    async fn hydrate(&mut self) {
        self.set_state(SessionState::Authenticating);

        let stored = match self.call(self.provider.get_session()).await {
            Ok(stored) => stored,
            Err(e) => {
                warn!(error = %e, "Could not read persisted session");
                None
            }
        };

        let Some(session) = stored else {
            debug!("No persisted session");
            self.set_state(SessionState::SignedOut);
            self.emit(SessionChange::Hydrated);
            return;
        };

        self.persisted = true;
        if session.is_expired() {
            info!(user_id = %session.user_id(), "Persisted session expired, refreshing before use");
            if let Err(e) = self.refresh(session).await {
                debug!(code = e.code(), "Could not revive persisted session");
            }
            return;
        }

        info!(user_id = %session.user_id(), "Restored persisted session");
        self.enter_authenticated(session, SessionChange::Hydrated);
        self.queue(Command::Validate);
    }

    /// Confirm a hydrated session with the provider.
    async fn validate(&mut self) {
        let SessionState::Authenticated(session) = &self.state else {
            return;
        };
        let session = session.clone();

        if session.needs_refresh(self.options.refresh_margin_secs) {
            if let Err(e) = self.refresh(session).await {
                debug!(code = e.code(), "Refresh during validation failed");
            }
            return;
        }

        match self.call(self.provider.get_user(session.access_token())).await {
            Ok(identity) if identity.id != session.user_id() => {
                warn!(user_id = %session.user_id(), "Access token belongs to another user, discarding session");
                self.expire();
            }
            Ok(identity) => match identity.email.filter(|email| email != session.email()) {
                Some(email) => {
                    let updated = session.with_email(email);
                    let Ok(warning) = self.persist_renewal(&updated) else {
                        return;
                    };
                    if let Some(e) = warning {
                        warn!(code = e.code(), "Updated email kept in memory only");
                    }
                    self.set_state(SessionState::Authenticated(updated));
                    self.emit(SessionChange::UserUpdated);
                }
                None => debug!(user_id = %session.user_id(), "Persisted session validated"),
            },
            Err(e) if e.is_revocation() => {
                debug!("Access token rejected, attempting refresh");
                if let Err(e) = self.refresh(session).await {
                    debug!(code = e.code(), "Refresh after rejected token failed");
                }
            }
            Err(e) => debug!(error = %e, "Could not validate session, keeping it"),
        }
    }

    async fn sign_in(&mut self, email: &str, password: &str) -> Result<IntentOutcome, AuthError> {
        let prior = std::mem::replace(&mut self.state, SessionState::Authenticating);
        self.publish_phase();

        match self.call(self.provider.sign_in(email, password)).await {
            Ok(session) => {
                let warning = self.persist(&session);
                self.persisted = warning.is_none();
                info!(user_id = %session.user_id(), "Signed in");
                self.enter_authenticated(session, SessionChange::SignedIn);
                Ok(self.outcome(warning))
            }
            Err(e) => {
                warn!(error = %e, "Sign-in failed");
                self.set_state(prior);
                Err(e.into())
            }
        }
    }

    async fn sign_up(&mut self, email: &str, password: &str) -> Result<IntentOutcome, AuthError> {
        match self.call(self.provider.sign_up(email, password)).await? {
            Some(_) => debug!("Provider issued a session at sign-up; it is not adopted"),
            None => debug!("Sign-up accepted, email confirmation may be required"),
        }
        info!("Account registered");
        Ok(self.outcome(None))
    }

    async fn sign_out(&mut self) -> IntentOutcome {
        let previous = std::mem::replace(&mut self.state, SessionState::SigningOut);
        self.publish_phase();
        self.disarm_timer();

        let was_signed_in = match previous.into_session() {
            Some(session) => {
                if let Err(e) = self.call(self.provider.sign_out(session.access_token())).await {
                    warn!(error = %e, "Remote sign-out failed, continuing with local sign-out");
                }
                true
            }
            None => false,
        };

        self.persisted = false;
        let warning = match self.store.delete(SESSION_KEY) {
            Ok(()) => None,
            Err(e) => {
                warn!(error = %e, "Failed to remove persisted session");
                Some(AuthError::from(e))
            }
        };

        self.set_state(SessionState::SignedOut);
        if was_signed_in {
            info!("Signed out");
            self.emit(SessionChange::SignedOut);
        }
        IntentOutcome {
            user: None,
            warning,
        }
    }

    async fn update_password(&mut self, new_password: &str) -> Result<IntentOutcome, AuthError> {
        let session = self.current_authenticated()?;
        let identity = self
            .call(self.provider.update_password(session.access_token(), new_password))
            .await?;
        info!(user_id = %session.user_id(), "Password updated");

        let session = match identity.email {
            Some(email) => session.with_email(email),
            None => session,
        };

        // Password rotation can rotate tokens; the password change itself has
        // already succeeded, so refresh problems are reported as warnings.
        let warning = match self.refresh(session).await {
            Ok(warning) => warning,
            Err(e) => Some(e),
        };
        Ok(self.outcome(warning))
    }

    /// Exchange the refresh token for a new session.
    ///
    /// Revocation signs out and clears the store. A transient failure keeps
    /// a still-valid session and retries after a backoff; other failures keep
    /// it until it expires. An already-expired session is dropped from
    /// memory but left on disk for the next launch.
    async fn refresh(&mut self, session: Session) -> Result<Option<AuthError>, AuthError> {
        self.set_state(SessionState::Refreshing(session.clone()));

        match self.call(self.provider.refresh_session(session.refresh_token())).await {
            Ok(fresh) => {
                let warning = self.persist_renewal(&fresh)?;
                debug!(
                    user_id = %fresh.user_id(),
                    expires_in = fresh.seconds_until_expiry(),
                    "Session refreshed"
                );
                self.enter_authenticated(fresh, SessionChange::Refreshed);
                Ok(warning)
            }
            Err(e) if e.is_revocation() => {
                info!(user_id = %session.user_id(), "Refresh token rejected, signing out");
                self.expire();
                Err(AuthError::SessionExpired)
            }
            Err(e) if session.is_expired() => {
                warn!(error = %e, "Refresh failed and the session has already expired");
                self.disarm_timer();
                self.set_state(SessionState::SignedOut);
                self.emit(SessionChange::SignedOut);
                Err(e.into())
            }
            Err(e) if e.is_transient() => {
                warn!(error = %e, retry_in = ?self.options.retry_backoff, "Refresh failed, keeping current session");
                self.set_state(SessionState::Authenticated(session));
                self.arm_timer(self.options.retry_backoff);
                Err(e.into())
            }
            Err(e) => {
                warn!(error = %e, "Refresh refused, keeping current session until it expires");
                let remaining = session.seconds_until_expiry().max(MIN_REFRESH_DELAY_SECS);
                self.set_state(SessionState::Authenticated(session));
                self.arm_timer(Duration::from_secs(remaining as u64));
                Err(e.into())
            }
        }
    }

    fn expire(&mut self) {
        self.disarm_timer();
        self.persisted = false;
        if let Err(e) = self.store.delete(SESSION_KEY) {
            warn!(error = %e, "Failed to remove expired session");
        }
        self.set_state(SessionState::SignedOut);
        self.emit(SessionChange::Expired);
    }

    fn enter_authenticated(&mut self, session: Session, reason: SessionChange) {
        let delay = self.refresh_delay(&session);
        self.set_state(SessionState::Authenticated(session));
        self.arm_timer(delay);
        self.emit(reason);
    }

    // ===== Helpers =====

    async fn call<T>(
        &self,
        request: impl Future<Output = Result<T, ProviderError>>,
    ) -> Result<T, ProviderError> {
        match tokio::time::timeout(self.options.request_timeout, request).await {
            Ok(result) => result,
            Err(_) => {
                warn!(timeout = ?self.options.request_timeout, "Identity provider call timed out");
                Err(ProviderError::Timeout)
            }
        }
    }

    fn persist(&self, session: &Session) -> Option<AuthError> {
        match self.store.set(SESSION_KEY, session.to_payload().as_bytes()) {
            Ok(()) => None,
            Err(e) => {
                warn!(error = %e, "Failed to persist session, it will not survive a restart");
                Some(AuthError::from(e))
            }
        }
    }

    /// Write a renewed copy of the running session.
    ///
    /// Only overwrites a record that is still there: if the session was
    /// removed from the store behind this worker's back (e.g. by `purge`),
    /// the worker signs out locally instead of bringing it back.
    fn persist_renewal(&mut self, session: &Session) -> Result<Option<AuthError>, AuthError> {
        if !self.persisted {
            let warning = self.persist(session);
            self.persisted = warning.is_none();
            return Ok(warning);
        }
        match self.store.replace(SESSION_KEY, session.to_payload().as_bytes()) {
            Ok(true) => Ok(None),
            Ok(false) => {
                info!(user_id = %session.user_id(), "Persisted session was removed, signing out");
                self.disarm_timer();
                self.persisted = false;
                self.set_state(SessionState::SignedOut);
                self.emit(SessionChange::SignedOut);
                Err(AuthError::SessionExpired)
            }
            Err(e) => {
                warn!(error = %e, "Failed to persist session, it will not survive a restart");
                Ok(Some(AuthError::from(e)))
            }
        }
    }

    fn current_authenticated(&self) -> Result<Session, AuthError> {
        match &self.state {
            SessionState::Authenticated(session) => Ok(session.clone()),
            _ => Err(AuthError::Unauthorized),
        }
    }

    fn current_user(&self) -> Option<RedactedUser> {
        self.state.session().map(Session::redacted)
    }

    fn outcome(&self, warning: Option<AuthError>) -> IntentOutcome {
        IntentOutcome {
            user: self.current_user(),
            warning,
        }
    }

    fn set_state(&mut self, state: SessionState) {
        self.state = state;
        self.publish_phase();
    }

    fn publish_phase(&self) {
        self.phase_tx.send_replace(self.state.phase());
    }

    fn emit(&self, reason: SessionChange) {
        // No subscribers is fine
        let _ = self.events.send(SessionEvent {
            reason,
            user: self.current_user(),
        });
    }

    fn queue(&self, command: Command) {
        if let Some(commands) = self.commands.upgrade() {
            if commands.try_send(command).is_err() {
                debug!("Command queue full, dropping follow-up command");
            }
        }
    }

    fn refresh_delay(&self, session: &Session) -> Duration {
        let remaining = session.seconds_until_expiry();
        let margin = self.options.refresh_margin_secs;
        let secs = if remaining > margin {
            remaining - margin
        } else {
            remaining / 2
        };
        Duration::from_secs(secs.max(MIN_REFRESH_DELAY_SECS) as u64)
    }

    fn arm_timer(&mut self, delay: Duration) {
        self.disarm_timer();
        let generation = self.generation;
        let commands = self.commands.clone();
        self.timer = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(commands) = commands.upgrade() {
                let _ = commands.send(Command::TimedRefresh { generation }).await;
            }
        }));
    }

    fn disarm_timer(&mut self) {
        self.generation = self.generation.wrapping_add(1);
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }
}
