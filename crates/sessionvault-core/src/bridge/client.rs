use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::protocol::{BridgeCall, BridgeMessage, BridgeRequest, BridgeResponse, UNCORRELATED_ID};
use super::BridgeError;
use crate::manager::{AuthIntent, SessionEvent};

/// Buffered session events for local subscribers
const EVENT_CHANNEL_CAPACITY: usize = 32;

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

#[derive(Default)]
struct Pending {
    closed: bool,
    waiting: HashMap<u64, oneshot::Sender<BridgeResponse>>,
}

/// UI side of the bridge.
///
/// Each call is tagged with a fresh correlation id and resolved when the
/// response with that id arrives. Session events pushed by the privileged
/// process are fanned out to [`subscribe`](Self::subscribe) receivers.
pub struct BridgeClient {
    writer: tokio::sync::Mutex<BoxedWriter>,
    pending: Arc<Mutex<Pending>>,
    next_id: AtomicU64,
    events: broadcast::Sender<SessionEvent>,
    reader_task: JoinHandle<()>,
}

impl BridgeClient {
    pub fn connect<R, W>(reader: R, writer: W) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let pending = Arc::new(Mutex::new(Pending::default()));
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let reader_task = tokio::spawn(read_frames(reader, pending.clone(), events.clone()));

        Self {
            writer: tokio::sync::Mutex::new(Box::new(writer)),
            pending,
            next_id: AtomicU64::new(UNCORRELATED_ID + 1),
            events,
            reader_task,
        }
    }

    /// Send one call and wait for its correlated response.
    pub async fn call(&self, call: BridgeCall) -> Result<BridgeResponse, BridgeError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        {
            let mut pending = lock(&self.pending);
            if pending.closed {
                return Err(BridgeError::Closed);
            }
            pending.waiting.insert(id, tx);
        }

        let mut line = serde_json::to_vec(&BridgeRequest { id, call })
            .map_err(|e| BridgeError::Protocol(e.to_string()))?;
        line.push(b'\n');

        let written = {
            let mut writer = self.writer.lock().await;
            match writer.write_all(&line).await {
                Ok(()) => writer.flush().await,
                Err(e) => Err(e),
            }
        };
        if let Err(e) = written {
            lock(&self.pending).waiting.remove(&id);
            return Err(BridgeError::Io(e));
        }

        rx.await.map_err(|_| BridgeError::Closed)
    }

    pub async fn intent(&self, intent: AuthIntent) -> Result<BridgeResponse, BridgeError> {
        self.call(BridgeCall::Intent(intent)).await
    }

    pub async fn sign_in_with_email(&self, email: &str, password: &str) -> Result<BridgeResponse, BridgeError> {
        self.intent(AuthIntent::SignIn {
            email: email.to_string(),
            password: password.to_string(),
        })
        .await
    }

    pub async fn sign_up(&self, email: &str, password: &str) -> Result<BridgeResponse, BridgeError> {
        self.intent(AuthIntent::SignUp {
            email: email.to_string(),
            password: password.to_string(),
        })
        .await
    }

    pub async fn sign_out(&self) -> Result<BridgeResponse, BridgeError> {
        self.intent(AuthIntent::SignOut).await
    }

    pub async fn reset_password(&self, email: &str) -> Result<BridgeResponse, BridgeError> {
        self.intent(AuthIntent::ResetPassword {
            email: email.to_string(),
        })
        .await
    }

    pub async fn update_password(&self, new_password: &str) -> Result<BridgeResponse, BridgeError> {
        self.intent(AuthIntent::UpdatePassword {
            new_password: new_password.to_string(),
        })
        .await
    }

    pub async fn get_current_user(&self) -> Result<BridgeResponse, BridgeError> {
        self.intent(AuthIntent::GetCurrentSession).await
    }

    pub async fn refresh_session(&self) -> Result<BridgeResponse, BridgeError> {
        self.intent(AuthIntent::RefreshSession).await
    }

    /// Start receiving session-change events.
    ///
    /// The local receiver is created before the request is sent, so no event
    /// emitted after the server acknowledges is missed.
    pub async fn subscribe(&self) -> Result<broadcast::Receiver<SessionEvent>, BridgeError> {
        let receiver = self.events.subscribe();
        self.call(BridgeCall::Subscribe).await?;
        Ok(receiver)
    }

    pub async fn unsubscribe(&self) -> Result<(), BridgeError> {
        self.call(BridgeCall::Unsubscribe).await?;
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        lock(&self.pending).closed
    }
}

impl Drop for BridgeClient {
    fn drop(&mut self) {
        self.reader_task.abort();
    }
}

fn lock(pending: &Mutex<Pending>) -> MutexGuard<'_, Pending> {
    pending.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

async fn read_frames<R>(reader: R, pending: Arc<Mutex<Pending>>, events: broadcast::Sender<SessionEvent>)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                warn!(error = %e, "Bridge read failed");
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        match serde_json::from_str::<BridgeMessage>(&line) {
            Ok(BridgeMessage::Response(response)) => {
                let waiter = lock(&pending).waiting.remove(&response.id);
                match waiter {
                    Some(waiter) => {
                        let _ = waiter.send(response);
                    }
                    None => warn!(id = response.id, error = ?response.error, "Uncorrelated bridge response"),
                }
            }
            Ok(BridgeMessage::Event(event)) => {
                debug!(reason = ?event.reason, "Session event received");
                let _ = events.send(event);
            }
            Err(e) => warn!(error = %e, "Malformed bridge frame"),
        }
    }

    // Fail every outstanding call
    let mut pending = lock(&pending);
    pending.closed = true;
    pending.waiting.clear();
    debug!("Bridge reader stopped");
}
