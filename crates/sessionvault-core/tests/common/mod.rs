#![allow(dead_code)]

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tempfile::TempDir;
use tokio::sync::Notify;

use sessionvault_core::api::{IdentityProvider, ProviderError};
use sessionvault_core::auth::{EncryptionSecret, Session, UserIdentity};
use sessionvault_core::manager::{
    ManagerOptions, SessionChange, SessionEvent, SessionHandle, SessionManager, SessionPhase,
};
use sessionvault_core::store::{CredentialStore, SessionStorage, StorageAdapter, SESSION_KEY, STORE_FILE};

pub const SECRET: &str = "test-encryption-secret";
pub const EMAIL: &str = "a@x.com";
pub const PASSWORD: &str = "correct-password";
pub const USER_ID: &str = "user-1";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshBehavior {
    Succeed,
    Revoke,
    NetworkDown,
    Refuse,
}

/// What `get_user` answers for any access token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UserLookup {
    Match,
    NewEmail(String),
    OtherUser,
    Unauthorized,
}

/// Scripted identity provider with one account.
pub struct FakeProvider {
    storage: StorageAdapter,
    refresh: Mutex<RefreshBehavior>,
    lookup: Mutex<UserLookup>,
    sign_out_fails: AtomicBool,
    sign_in_gate: Mutex<Option<Arc<Notify>>>,
    pub sign_in_started: Notify,
    calls: Mutex<Vec<&'static str>>,
    counter: AtomicU64,
    refresh_tokens: Mutex<HashMap<String, (String, String)>>,
}

impl FakeProvider {
    pub fn new(store: Arc<CredentialStore>) -> Self {
        Self {
            storage: StorageAdapter::new(store),
            refresh: Mutex::new(RefreshBehavior::Succeed),
            lookup: Mutex::new(UserLookup::Match),
            sign_out_fails: AtomicBool::new(false),
            sign_in_gate: Mutex::new(None),
            sign_in_started: Notify::new(),
            calls: Mutex::new(Vec::new()),
            counter: AtomicU64::new(0),
            refresh_tokens: Mutex::new(HashMap::new()),
        }
    }

    pub fn set_refresh(&self, behavior: RefreshBehavior) {
        *self.refresh.lock().unwrap() = behavior;
    }

    pub fn set_user_lookup(&self, lookup: UserLookup) {
        *self.lookup.lock().unwrap() = lookup;
    }

    pub fn fail_sign_out(&self) {
        self.sign_out_fails.store(true, Ordering::SeqCst);
    }

    /// Hold every sign-in until the returned gate is notified.
    pub fn gate_sign_in(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *self.sign_in_gate.lock().unwrap() = Some(gate.clone());
        gate
    }

    /// Teach the fake about a refresh token minted outside of it.
    pub fn know_refresh_token(&self, refresh_token: &str, user_id: &str, email: &str) {
        self.refresh_tokens
            .lock()
            .unwrap()
            .insert(refresh_token.to_string(), (user_id.to_string(), email.to_string()));
    }

    pub fn calls(&self) -> Vec<&'static str> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, name: &str) -> usize {
        self.calls().iter().filter(|c| **c == name).count()
    }

    fn record(&self, name: &'static str) {
        self.calls.lock().unwrap().push(name);
    }

    fn issue(&self, user_id: &str, email: &str) -> Session {
        let n = self.counter.fetch_add(1, Ordering::SeqCst);
        let refresh_token = format!("rt-{}", n);
        self.know_refresh_token(&refresh_token, user_id, email);
        Session::new(
            user_id,
            email,
            format!("at-{}", n),
            refresh_token,
            Utc::now().timestamp() + 3600,
        )
        .unwrap()
    }
}

#[async_trait]
impl IdentityProvider for FakeProvider {
    async fn sign_up(&self, _email: &str, _password: &str) -> Result<Option<Session>, ProviderError> {
        self.record("sign_up");
        Ok(None)
    }

    async fn sign_in(&self, email: &str, password: &str) -> Result<Session, ProviderError> {
        self.record("sign_in");
        self.sign_in_started.notify_one();
        let gate = self.sign_in_gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        if email == EMAIL && password == PASSWORD {
            Ok(self.issue(USER_ID, EMAIL))
        } else {
            Err(ProviderError::InvalidCredentials)
        }
    }

    async fn sign_out(&self, _access_token: &str) -> Result<(), ProviderError> {
        self.record("sign_out");
        if self.sign_out_fails.load(Ordering::SeqCst) {
            return Err(ProviderError::ServerError("unavailable".to_string()));
        }
        Ok(())
    }

    async fn get_session(&self) -> Result<Option<Session>, ProviderError> {
        self.record("get_session");
        Ok(self
            .storage
            .get_item(SESSION_KEY)
            .and_then(|payload| Session::from_payload(&payload).ok()))
    }

    async fn refresh_session(&self, refresh_token: &str) -> Result<Session, ProviderError> {
        self.record("refresh_session");
        let behavior = *self.refresh.lock().unwrap();
        match behavior {
            RefreshBehavior::Revoke => Err(ProviderError::RefreshRevoked),
            RefreshBehavior::NetworkDown => Err(ProviderError::Timeout),
            RefreshBehavior::Refuse => Err(ProviderError::Rejected("refresh disabled".to_string())),
            RefreshBehavior::Succeed => {
                let owner = self.refresh_tokens.lock().unwrap().remove(refresh_token);
                match owner {
                    Some((user_id, email)) => Ok(self.issue(&user_id, &email)),
                    None => Err(ProviderError::RefreshRevoked),
                }
            }
        }
    }

    async fn get_user(&self, _access_token: &str) -> Result<UserIdentity, ProviderError> {
        self.record("get_user");
        let lookup = self.lookup.lock().unwrap().clone();
        match lookup {
            UserLookup::Match => Ok(UserIdentity {
                id: USER_ID.to_string(),
                email: Some(EMAIL.to_string()),
            }),
            UserLookup::NewEmail(email) => Ok(UserIdentity {
                id: USER_ID.to_string(),
                email: Some(email),
            }),
            UserLookup::OtherUser => Ok(UserIdentity {
                id: "user-2".to_string(),
                email: Some("b@x.com".to_string()),
            }),
            UserLookup::Unauthorized => Err(ProviderError::Unauthorized),
        }
    }

    async fn reset_password(&self, _email: &str) -> Result<(), ProviderError> {
        self.record("reset_password");
        Ok(())
    }

    async fn update_password(
        &self,
        _access_token: &str,
        _new_password: &str,
    ) -> Result<UserIdentity, ProviderError> {
        self.record("update_password");
        Ok(UserIdentity {
            id: USER_ID.to_string(),
            email: Some(EMAIL.to_string()),
        })
    }
}

pub fn open_store(dir: &TempDir) -> Arc<CredentialStore> {
    Arc::new(
        CredentialStore::open(
            dir.path().join(STORE_FILE),
            &EncryptionSecret::new(SECRET),
            "v1",
        )
        .unwrap(),
    )
}

pub struct Harness {
    pub dir: TempDir,
    pub store: Arc<CredentialStore>,
    pub provider: Arc<FakeProvider>,
}

impl Harness {
    pub fn new() -> Self {
        Self::in_dir(TempDir::new().unwrap())
    }

    /// Reuse a directory prepared by the test (e.g. with a persisted session).
    pub fn in_dir(dir: TempDir) -> Self {
        let store = open_store(&dir);
        let provider = Arc::new(FakeProvider::new(store.clone()));
        Self {
            dir,
            store,
            provider,
        }
    }

    pub fn spawn(&self) -> SessionHandle {
        self.spawn_with(ManagerOptions::default())
    }

    pub fn spawn_with(&self, options: ManagerOptions) -> SessionHandle {
        SessionManager::spawn(self.provider.clone(), self.store.clone(), options)
    }

    pub fn store_bytes(&self) -> Vec<u8> {
        std::fs::read(self.dir.path().join(STORE_FILE)).unwrap()
    }

    pub fn has_persisted_session(&self) -> bool {
        self.store.contains(SESSION_KEY)
    }

    pub fn persisted_session(&self) -> Option<Session> {
        let bytes = self.store.get(SESSION_KEY)?;
        Session::from_payload(std::str::from_utf8(&bytes).ok()?).ok()
    }
}

/// A complete session that expired `ago_secs` seconds ago.
pub fn expired_session(refresh_token: &str, ago_secs: i64) -> Session {
    let json = format!(
        r#"{{"access_token":"stale-at","refresh_token":"{}","expires_at":{},"user":{{"id":"{}","email":"{}"}}}}"#,
        refresh_token,
        Utc::now().timestamp() - ago_secs,
        USER_ID,
        EMAIL
    );
    Session::from_payload(&json).unwrap()
}

pub fn live_session(access_token: &str, refresh_token: &str) -> Session {
    Session::new(USER_ID, EMAIL, access_token, refresh_token, Utc::now().timestamp() + 3600).unwrap()
}

pub async fn within<F: Future>(future: F) -> F::Output {
    tokio::time::timeout(Duration::from_secs(5), future)
        .await
        .expect("timed out waiting")
}

/// Wait for the next event with the given reason, skipping others.
pub async fn wait_for_event(
    events: &mut tokio::sync::broadcast::Receiver<SessionEvent>,
    reason: SessionChange,
) -> SessionEvent {
    within(async {
        loop {
            let event = events.recv().await.unwrap();
            if event.reason == reason {
                return event;
            }
        }
    })
    .await
}

pub async fn wait_for_phase(handle: &SessionHandle, phase: SessionPhase) {
    let mut watch = handle.watch_phase();
    within(watch.wait_for(|p| *p == phase)).await.unwrap();
}
