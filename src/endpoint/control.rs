//! Control connection to the rendezvous server
//!
//! Requests carry a request id and resolve to the matching [`Ack`]; every
//! other server frame is forwarded as a [`ControlEvent`].

use super::EndpointError;
use crate::protocol::{Ack, ClientId, ClientMessage, ServerMessage};
use futures::{SinkExt, StreamExt};
use log::{debug, info, warn};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

/// Frames the owner of the connection has to react to
#[derive(Debug, Clone, PartialEq)]
pub enum ControlEvent {
    Message(ServerMessage),
    /// Socket dropped without a local close
    Lost,
}

type PendingMap = Arc<Mutex<HashMap<u64, oneshot::Sender<Ack>>>>;

pub struct ControlConnection {
    client_id: ClientId,
    outbound: mpsc::UnboundedSender<Message>,
    pending: PendingMap,
    next_request_id: AtomicU64,
    connected: Arc<AtomicBool>,
    closing: Arc<AtomicBool>,
    reader: JoinHandle<()>,
}

impl ControlConnection {
    /// Connect and wait for the server's welcome, all within `timeout`
    pub async fn connect(
        url: &str,
        timeout: Duration,
    ) -> Result<(Self, mpsc::UnboundedReceiver<ControlEvent>), EndpointError> {
        let (ws_stream, _) = tokio::time::timeout(timeout, connect_async(url))
            .await
            .map_err(|_| EndpointError::Timeout(format!("control connection to {}", url)))?
            .map_err(|e| EndpointError::ControlConnect(e.to_string()))?;

        let (mut ws_write, mut ws_read) = ws_stream.split();

        let client_id = tokio::time::timeout(timeout, async {
            while let Some(frame) = ws_read.next().await {
                match frame {
                    Ok(Message::Text(text)) => match ServerMessage::from_json(&text) {
                        Ok(ServerMessage::Welcome { client_id }) => return Ok(client_id),
                        Ok(other) => debug!("Ignoring frame before welcome: {:?}", other),
                        Err(e) => warn!("Invalid frame before welcome: {}", e),
                    },
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(e) => return Err(EndpointError::ControlConnect(e.to_string())),
                }
            }
            Err(EndpointError::ControlLost)
        })
        .await
        .map_err(|_| EndpointError::Timeout("server welcome".to_string()))??;

        info!("Control connection open as {}", client_id);

        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<Message>();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let connected = Arc::new(AtomicBool::new(true));
        let closing = Arc::new(AtomicBool::new(false));

        tokio::spawn(async move {
            while let Some(message) = outbound_rx.recv().await {
                let is_close = matches!(message, Message::Close(_));
                if ws_write.send(message).await.is_err() || is_close {
                    break;
                }
            }
            let _ = ws_write.close().await;
        });

        let reader = {
            let pending = pending.clone();
            let connected = connected.clone();
            let closing = closing.clone();
            tokio::spawn(async move {
                while let Some(frame) = ws_read.next().await {
                    let text = match frame {
                        Ok(Message::Text(text)) => text,
                        Ok(Message::Close(_)) => break,
                        Ok(_) => continue,
                        Err(e) => {
                            debug!("Control socket error: {}", e);
                            break;
                        }
                    };
                    match ServerMessage::from_json(&text) {
                        Ok(ServerMessage::Ack(ack)) => {
                            let waiter = pending.lock().remove(&ack.request_id);
                            match waiter {
                                Some(waiter) => {
                                    let _ = waiter.send(ack);
                                }
                                None => debug!("Ack for unknown request {}", ack.request_id),
                            }
                        }
                        Ok(message) => {
                            let _ = events_tx.send(ControlEvent::Message(message));
                        }
                        Err(e) => warn!("Invalid control frame: {}", e),
                    }
                }

                connected.store(false, Ordering::SeqCst);
                // Dropping the waiters fails their requests with ControlLost
                pending.lock().clear();
                if !closing.load(Ordering::SeqCst) {
                    warn!("Control connection lost");
                    let _ = events_tx.send(ControlEvent::Lost);
                }
            })
        };

        Ok((
            Self {
                client_id,
                outbound,
                pending,
                next_request_id: AtomicU64::new(1),
                connected,
                closing,
                reader,
            },
            events_rx,
        ))
    }

    /// Server-assigned id of this connection
    pub fn client_id(&self) -> &ClientId {
        &self.client_id
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Send a request built around a fresh request id and wait for its ack.
    /// A failed ack is returned as-is; see [`Ack::into_result`].
    pub async fn request<F>(&self, build: F, timeout: Duration) -> Result<Ack, EndpointError>
    where
        F: FnOnce(u64) -> ClientMessage,
    {
        if !self.is_connected() {
            return Err(EndpointError::ControlUnavailable);
        }

        let request_id = self.next_request_id.fetch_add(1, Ordering::SeqCst);
        let message = build(request_id);
        let kind = message.kind();
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(request_id, tx);

        if let Err(e) = self.send(&message) {
            self.pending.lock().remove(&request_id);
            return Err(e);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(ack)) => Ok(ack),
            Ok(Err(_)) => Err(EndpointError::ControlLost),
            Err(_) => {
                self.pending.lock().remove(&request_id);
                Err(EndpointError::Timeout(format!("{} ack", kind)))
            }
        }
    }

    /// Send a message that has no ack
    pub fn notify(&self, message: &ClientMessage) -> Result<(), EndpointError> {
        if !self.is_connected() {
            return Err(EndpointError::ControlUnavailable);
        }
        self.send(message)
    }

    /// Close on purpose; no [`ControlEvent::Lost`] follows
    pub fn close(&self) {
        self.closing.store(true, Ordering::SeqCst);
        self.connected.store(false, Ordering::SeqCst);
        let _ = self.outbound.send(Message::Close(None));
    }

    /// Drop the socket as if the network went away; a [`ControlEvent::Lost`] follows
    #[cfg(test)]
    pub(crate) fn sever(&self) {
        let _ = self.outbound.send(Message::Close(None));
    }

    fn send(&self, message: &ClientMessage) -> Result<(), EndpointError> {
        let text = message.to_json()?;
        self.outbound
            .send(Message::Text(text))
            .map_err(|_| EndpointError::ControlUnavailable)
    }
}

impl Drop for ControlConnection {
    fn drop(&mut self) {
        self.closing.store(true, Ordering::SeqCst);
        let _ = self.outbound.send(Message::Close(None));
        self.reader.abort();
    }
}
