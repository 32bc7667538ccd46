use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::protocol::{BridgeCall, BridgeMessage, BridgeRequest, BridgeResponse, UNCORRELATED_ID};
use super::BridgeError;
use crate::error::AuthError;
use crate::manager::SessionHandle;

/// Outbound frames buffered ahead of the writer
const OUTBOUND_CAPACITY: usize = 64;

/// Privileged side of the bridge: reads requests, forwards them to the
/// session manager, and writes responses and session events back.
///
/// The server keeps no session state of its own.
pub struct BridgeServer {
    handle: SessionHandle,
}

impl BridgeServer {
    pub fn new(handle: SessionHandle) -> Self {
        Self { handle }
    }

    /// Serve one connection until the reader reaches EOF.
    ///
    /// Requests are queued with the session manager in the order they are
    /// read; responses are written as they complete.
    pub async fn serve<R, W>(&self, reader: R, writer: W) -> Result<(), BridgeError>
    where
        R: AsyncRead + Unpin + Send,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (outbound, outbound_rx) = mpsc::channel(OUTBOUND_CAPACITY);
        let writer_task = tokio::spawn(write_frames(writer, outbound_rx));
        let mut subscription: Option<JoinHandle<()>> = None;

        let mut lines = BufReader::new(reader).lines();
        let read_result = loop {
            let line = match lines.next_line().await {
                Ok(Some(line)) => line,
                Ok(None) => break Ok(()),
                Err(e) => break Err(BridgeError::Io(e)),
            };
            if line.trim().is_empty() {
                continue;
            }

            let request: BridgeRequest = match serde_json::from_str(&line) {
                Ok(request) => request,
                Err(e) => {
                    warn!(error = %e, "Malformed bridge request");
                    let response = BridgeResponse::failure(
                        UNCORRELATED_ID,
                        AuthError::Rejected(format!("malformed request: {}", e)),
                    );
                    let _ = outbound.send(BridgeMessage::Response(response)).await;
                    continue;
                }
            };

            let id = request.id;
            match request.call {
                BridgeCall::Intent(intent) => {
                    debug!(id, intent = intent.name(), "Bridge request");
                    match self.handle.submit(intent).await {
                        Ok(pending) => {
                            let outbound = outbound.clone();
                            tokio::spawn(async move {
                                let response = BridgeResponse::from_result(id, pending.wait().await);
                                let _ = outbound.send(BridgeMessage::Response(response)).await;
                            });
                        }
                        Err(e) => {
                            let _ = outbound
                                .send(BridgeMessage::Response(BridgeResponse::failure(id, e)))
                                .await;
                        }
                    }
                }
                BridgeCall::Subscribe => {
                    if subscription.is_none() {
                        subscription = Some(tokio::spawn(forward_events(
                            self.handle.subscribe(),
                            outbound.clone(),
                        )));
                        debug!(id, "Client subscribed to session events");
                    }
                    let _ = outbound.send(BridgeMessage::Response(BridgeResponse::ok(id))).await;
                }
                BridgeCall::Unsubscribe => {
                    if let Some(task) = subscription.take() {
                        task.abort();
                        debug!(id, "Client unsubscribed from session events");
                    }
                    let _ = outbound.send(BridgeMessage::Response(BridgeResponse::ok(id))).await;
                }
            }
        };

        if let Some(task) = subscription.take() {
            task.abort();
        }
        // In-flight responses hold their own senders; the writer drains them
        drop(outbound);
        if let Err(e) = writer_task.await {
            warn!(error = %e, "Bridge writer task failed");
        }
        debug!("Bridge connection closed");
        read_result
    }
}

async fn forward_events(
    mut events: broadcast::Receiver<crate::manager::SessionEvent>,
    outbound: mpsc::Sender<BridgeMessage>,
) {
    loop {
        match events.recv().await {
            Ok(event) => {
                if outbound.send(BridgeMessage::Event(event)).await.is_err() {
                    break;
                }
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "Bridge subscriber lagged, events dropped");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

async fn write_frames<W>(mut writer: W, mut frames: mpsc::Receiver<BridgeMessage>)
where
    W: AsyncWrite + Unpin,
{
    while let Some(frame) = frames.recv().await {
        let mut line = match serde_json::to_vec(&frame) {
            Ok(line) => line,
            Err(e) => {
                warn!(error = %e, "Failed to encode bridge frame");
                continue;
            }
        };
        line.push(b'\n');
        if let Err(e) = writer.write_all(&line).await {
            warn!(error = %e, "Bridge peer went away");
            break;
        }
        if let Err(e) = writer.flush().await {
            warn!(error = %e, "Bridge peer went away");
            break;
        }
    }
}
