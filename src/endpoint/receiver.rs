//! Receiver endpoint (display side, responder)
//!
//! Registers a pairing code, answers the sender's offer and hands decoded
//! channel traffic to a registered callback.

use super::control::{ControlConnection, ControlEvent};
use super::supervisor::{LinkStatus, LossDecision, ResumeAction};
use super::{next_control_event, wire_peer_connection, EndpointError, EndpointShared};
use crate::config::{Config, EndpointConfig};
use crate::protocol::{
    generate_code, is_valid_code, ClientId, ClientMessage, IceCandidate, ServerMessage, SessionDescription,
    SignalError,
};
use crate::webrtc::data_channel::{attach_inbound, ChannelKind, InboundEvent, InboundHandler};
use crate::webrtc::{LinkState, NegotiationSession, PeerConnectionManager};
use log::{debug, error, info, warn};
use parking_lot::Mutex as SyncMutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use webrtc::data_channel::RTCDataChannel;
use webrtc::peer_connection::RTCPeerConnection;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiverState {
    Idle,
    ControlConnected,
    CodeRegistered,
    /// A sender claimed the code; its offer is on the way
    PeerIncoming,
    Answering,
    Connected,
    Disconnected,
    Failed,
}

impl ReceiverState {
    pub fn is_finished(&self) -> bool {
        matches!(self, ReceiverState::Disconnected | ReceiverState::Failed)
    }
}

type SharedHandler = Arc<SyncMutex<Option<InboundHandler>>>;

enum DriverCommand {
    Shutdown { done: oneshot::Sender<()> },
    Resume {
        control: Arc<ControlConnection>,
        events: mpsc::UnboundedReceiver<ControlEvent>,
    },
}

struct ActivePairing {
    code: String,
    client_id: ClientId,
    driver_tx: mpsc::UnboundedSender<DriverCommand>,
    driver: JoinHandle<()>,
}

pub struct ReceiverEndpoint {
    config: EndpointConfig,
    peers: Arc<PeerConnectionManager>,
    max_chunks: usize,
    shared: Arc<EndpointShared<ReceiverState>>,
    handler: SharedHandler,
    active: Mutex<Option<ActivePairing>>,
}

impl ReceiverEndpoint {
    pub fn new(config: &Config) -> Self {
        Self {
            config: config.endpoint.clone(),
            peers: Arc::new(PeerConnectionManager::new(config.webrtc.clone())),
            max_chunks: config.transport.max_chunks,
            shared: Arc::new(EndpointShared::new("receiver", ReceiverState::Idle)),
            handler: Arc::new(SyncMutex::new(None)),
            active: Mutex::new(None),
        }
    }

    pub fn state(&self) -> ReceiverState {
        self.shared.state()
    }

    /// Watch state transitions
    pub fn subscribe(&self) -> watch::Receiver<ReceiverState> {
        self.shared.subscribe()
    }

    pub fn status(&self) -> LinkStatus {
        self.shared.supervisor().status()
    }

    /// Code currently registered, if any
    pub async fn code(&self) -> Option<String> {
        self.active.lock().await.as_ref().map(|pairing| pairing.code.clone())
    }

    /// Register the callback that receives decoded commands and text events
    pub fn on_event(&self, handler: impl Fn(InboundEvent) + Send + Sync + 'static) {
        *self.handler.lock() = Some(Arc::new(handler));
    }

    /// Register a freshly generated code. A collision is returned as
    /// `Rejected(CodeExists)`; pick a new code and call again.
    pub async fn connect(&self) -> Result<String, EndpointError> {
        let code = generate_code();
        self.connect_with_code(&code).await?;
        Ok(code)
    }

    pub async fn connect_with_code(&self, code: &str) -> Result<(), EndpointError> {
        if !is_valid_code(code) {
            return Err(EndpointError::Rejected(SignalError::InvalidCode));
        }

        let mut active = self.active.lock().await;
        if let Some(pairing) = active.as_ref() {
            if !pairing.driver.is_finished() {
                return Err(EndpointError::InvalidState(format!("code {} already registered", pairing.code)));
            }
        }

        self.shared.supervisor().reset();
        let (control, events) =
            match ControlConnection::connect(&self.config.signaling_url, self.config.control_connect_timeout()).await {
                Ok(connected) => connected,
                Err(e) => {
                    error!("Control connection failed: {}", e);
                    self.shared.set_state(ReceiverState::Failed);
                    return Err(e);
                }
            };
        let control = Arc::new(control);
        self.shared.set_signaling(true);
        self.shared.set_state(ReceiverState::ControlConnected);

        let registered = control
            .request(
                |request_id| ClientMessage::RegisterPairingCode {
                    request_id,
                    code: code.to_string(),
                    resume_from: None,
                },
                self.config.request_timeout(),
            )
            .await
            .and_then(|ack| ack.into_result().map_err(EndpointError::from));
        if let Err(e) = registered {
            warn!("Registration of code {} failed: {}", code, e);
            control.close();
            self.shared.set_signaling(false);
            let state = match e {
                EndpointError::Rejected(_) => ReceiverState::Idle,
                _ => ReceiverState::Failed,
            };
            self.shared.set_state(state);
            return Err(e);
        }
        info!("Code {} registered", code);
        self.shared.set_state(ReceiverState::CodeRegistered);

        let client_id = control.client_id().clone();
        let (driver_tx, driver_rx) = mpsc::unbounded_channel();
        let (link_tx, link_rx) = mpsc::unbounded_channel();
        let (ice_tx, ice_rx) = mpsc::unbounded_channel();
        let (channel_tx, channel_rx) = mpsc::unbounded_channel();

        let driver = ReceiverDriver {
            session: NegotiationSession::new(),
            control: Some(control),
            events: Some(events),
            commands: driver_rx,
            link_tx,
            link_states: link_rx,
            ice_tx,
            local_ice: ice_rx,
            channel_tx,
            channels: channel_rx,
            peers: self.peers.clone(),
            handler: self.handler.clone(),
            max_chunks: self.max_chunks,
            request_timeout: self.config.request_timeout(),
            shared: self.shared.clone(),
            connected: false,
        };
        let driver = tokio::spawn(driver.run());

        *active = Some(ActivePairing {
            code: code.to_string(),
            client_id,
            driver_tx,
            driver,
        });
        Ok(())
    }

    /// Wait for the peer link to connect (or the pairing to end)
    pub async fn wait_until_connected(&self, timeout: Duration) -> Result<(), EndpointError> {
        match self
            .shared
            .wait_for(timeout, |s| s == ReceiverState::Connected || s.is_finished())
            .await?
        {
            ReceiverState::Connected => Ok(()),
            other => Err(EndpointError::InvalidState(format!("pairing ended in {:?}", other))),
        }
    }

    /// Application came back to the foreground
    pub fn on_resume(&self) -> ResumeAction {
        self.shared.on_resume()
    }

    /// Re-open the control connection and re-register the same code
    pub async fn reconnect(&self) -> Result<(), EndpointError> {
        if !self.shared.supervisor().begin_reconnect() {
            return Err(EndpointError::InvalidState("pairing was closed manually".to_string()));
        }

        let mut active = self.active.lock().await;
        let Some(pairing) = active.as_mut().filter(|pairing| !pairing.driver.is_finished()) else {
            self.shared.supervisor().reconnect_failed(false);
            return Err(EndpointError::InvalidState("no code registered".to_string()));
        };

        match self.resume_registration(&pairing.code, &pairing.client_id).await {
            Ok((control, events)) => {
                let client_id = control.client_id().clone();
                pairing
                    .driver_tx
                    .send(DriverCommand::Resume { control, events })
                    .map_err(|_| EndpointError::InvalidState("pairing ended".to_string()))?;
                info!("Code {} resumed (was {}, now {})", pairing.code, pairing.client_id, client_id);
                pairing.client_id = client_id;
                Ok(())
            }
            Err(e) => {
                self.shared.supervisor().reconnect_failed(self.shared.peer_connected());
                Err(e)
            }
        }
    }

    async fn resume_registration(
        &self,
        code: &str,
        previous: &ClientId,
    ) -> Result<(Arc<ControlConnection>, mpsc::UnboundedReceiver<ControlEvent>), EndpointError> {
        let (control, events) =
            ControlConnection::connect(&self.config.signaling_url, self.config.control_connect_timeout()).await?;
        let control = Arc::new(control);

        let result = control
            .request(
                |request_id| ClientMessage::RegisterPairingCode {
                    request_id,
                    code: code.to_string(),
                    resume_from: Some(previous.clone()),
                },
                self.config.request_timeout(),
            )
            .await
            .and_then(|ack| ack.into_result().map_err(EndpointError::from));

        match result {
            Ok(_) => Ok((control, events)),
            Err(e) => {
                control.close();
                Err(e)
            }
        }
    }

    /// Manual teardown: tell the peer, then close channels, link and control connection.
    /// A pairing that already ended keeps its final state.
    pub async fn disconnect(&self) {
        let Some(pairing) = self.active.lock().await.take() else {
            return;
        };

        let (done_tx, done_rx) = oneshot::channel();
        if pairing.driver_tx.send(DriverCommand::Shutdown { done: done_tx }).is_ok() {
            let _ = done_rx.await;
        }
        let _ = pairing.driver.await;

        self.shared.supervisor().mark_manual();
        if !self.state().is_finished() {
            self.shared.set_state(ReceiverState::Disconnected);
        }
        info!("Code {} released", pairing.code);
    }
}

struct ReceiverDriver {
    session: NegotiationSession,
    control: Option<Arc<ControlConnection>>,
    events: Option<mpsc::UnboundedReceiver<ControlEvent>>,
    commands: mpsc::UnboundedReceiver<DriverCommand>,
    link_tx: mpsc::UnboundedSender<LinkState>,
    link_states: mpsc::UnboundedReceiver<LinkState>,
    ice_tx: mpsc::UnboundedSender<IceCandidate>,
    local_ice: mpsc::UnboundedReceiver<IceCandidate>,
    channel_tx: mpsc::UnboundedSender<(ChannelKind, Arc<RTCDataChannel>)>,
    channels: mpsc::UnboundedReceiver<(ChannelKind, Arc<RTCDataChannel>)>,
    peers: Arc<PeerConnectionManager>,
    handler: SharedHandler,
    max_chunks: usize,
    request_timeout: Duration,
    shared: Arc<EndpointShared<ReceiverState>>,
    connected: bool,
}

impl ReceiverDriver {
    async fn run(mut self) {
        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(DriverCommand::Shutdown { done }) => {
                        self.shutdown().await;
                        let _ = done.send(());
                        break;
                    }
                    Some(DriverCommand::Resume { control, events }) => {
                        self.control = Some(control);
                        self.events = Some(events);
                        self.shared.set_signaling(true);
                        self.shared.supervisor().reconnected();
                    }
                    None => {
                        self.teardown(ReceiverState::Disconnected).await;
                        break;
                    }
                },
                event = next_control_event(&mut self.events) => {
                    if !self.on_control_event(event).await {
                        break;
                    }
                }
                Some(state) = self.link_states.recv() => {
                    if !self.on_link_state(state).await {
                        break;
                    }
                }
                Some(candidate) = self.local_ice.recv() => {
                    if let Some(control) = &self.control {
                        if let Err(e) = control.notify(&ClientMessage::IceCandidate { candidate }) {
                            debug!("Local ICE candidate not sent: {}", e);
                        }
                    }
                }
                Some((kind, channel)) = self.channels.recv() => {
                    debug!("{} channel opened by sender", kind.label());
                    self.session.add_channel(kind, channel);
                }
            }
        }
    }

    async fn on_control_event(&mut self, event: ControlEvent) -> bool {
        match event {
            ControlEvent::Message(ServerMessage::PeerConnected { peer_id }) => {
                info!("Sender {} claimed the code", peer_id);
                self.shared.set_state(ReceiverState::PeerIncoming);
                true
            }
            ControlEvent::Message(ServerMessage::Offer { offer, sender_id }) => {
                debug!("Offer from {}", sender_id);
                self.shared.set_state(ReceiverState::Answering);
                match self.answer(offer).await {
                    Ok(()) => true,
                    Err(e) => {
                        error!("Failed to answer offer: {}", e);
                        self.teardown(ReceiverState::Failed).await;
                        false
                    }
                }
            }
            ControlEvent::Message(ServerMessage::IceCandidate { candidate }) => {
                match self.session.add_remote_candidate(candidate).await {
                    Ok(false) => debug!("Queued early ICE candidate ({} waiting)", self.session.queued_candidates()),
                    Ok(true) => {}
                    Err(e) => warn!("{}", e),
                }
                true
            }
            ControlEvent::Message(ServerMessage::PeerDisconnected) => {
                info!("Sender closed the pairing");
                self.shared.supervisor().mark_disconnected();
                self.teardown(ReceiverState::Disconnected).await;
                false
            }
            ControlEvent::Message(ServerMessage::Error { error, message }) => {
                warn!("Server error {}: {}", error, message);
                true
            }
            ControlEvent::Message(other) => {
                debug!("Ignoring unexpected control message {:?}", other);
                true
            }
            ControlEvent::Lost => {
                self.control = None;
                self.events = None;
                self.shared.set_signaling(false);
                let decision = self.shared.supervisor().on_control_lost(self.connected);
                match decision {
                    LossDecision::Degrade => true,
                    LossDecision::Teardown => {
                        self.teardown(ReceiverState::Disconnected).await;
                        false
                    }
                }
            }
        }
    }

    /// Create the peer link on first offer, apply it, answer
    async fn answer(&mut self, offer: SessionDescription) -> Result<(), EndpointError> {
        if !self.session.has_peer_connection() {
            let pc = self.peers.create_peer_connection().await?;
            wire_peer_connection(&pc, self.link_tx.clone(), self.ice_tx.clone());
            self.wire_data_channels(&pc);
            self.session.attach(pc);
        }

        let flushed = self.session.apply_remote_description(offer).await?;
        if flushed > 0 {
            debug!("Applied {} candidate(s) that arrived before the offer", flushed);
        }

        let pc = self
            .session
            .peer_connection()
            .cloned()
            .ok_or_else(|| EndpointError::InvalidState("peer connection closed".to_string()))?;
        let answer = PeerConnectionManager::create_answer(&pc).await?;
        self.session.set_local_description(answer.clone());

        let control = self.control.clone().ok_or(EndpointError::ControlUnavailable)?;
        control
            .request(|request_id| ClientMessage::Answer { request_id, answer }, self.request_timeout)
            .await?
            .into_result()?;
        Ok(())
    }

    fn wire_data_channels(&self, pc: &Arc<RTCPeerConnection>) {
        let channel_tx = self.channel_tx.clone();
        let handler = self.handler.clone();
        let max_chunks = self.max_chunks;

        pc.on_data_channel(Box::new(move |channel: Arc<RTCDataChannel>| {
            let channel_tx = channel_tx.clone();
            let handler = handler.clone();
            Box::pin(async move {
                let Some(kind) = ChannelKind::from_label(channel.label()) else {
                    warn!("Ignoring unexpected data channel {}", channel.label());
                    return;
                };
                let dispatch: InboundHandler = Arc::new(move |event: InboundEvent| {
                    let current = handler.lock().clone();
                    match current {
                        Some(callback) => callback(event),
                        None => debug!("No event handler registered; dropping {:?}", event),
                    }
                });
                attach_inbound(&channel, kind, max_chunks, dispatch);
                let _ = channel_tx.send((kind, channel));
            })
        }));
    }

    async fn on_link_state(&mut self, state: LinkState) -> bool {
        self.shared.set_link_state(state);
        match state {
            LinkState::Connected => {
                self.connected = true;
                self.shared.supervisor().link_connected();
                self.shared.set_state(ReceiverState::Connected);
                true
            }
            LinkState::Disconnected => {
                warn!("Peer link interrupted; waiting for ICE to recover");
                true
            }
            LinkState::Failed => {
                error!("Peer link failed");
                self.teardown(ReceiverState::Failed).await;
                false
            }
            LinkState::Closed => {
                self.teardown(ReceiverState::Disconnected).await;
                false
            }
            LinkState::New | LinkState::Connecting => true,
        }
    }

    async fn shutdown(&mut self) {
        if let Some(control) = &self.control {
            if let Err(e) = control.notify(&ClientMessage::ManualDisconnect) {
                debug!("Manual disconnect not relayed: {}", e);
            }
        }
        self.shared.supervisor().mark_manual();
        self.teardown(ReceiverState::Disconnected).await;
    }

    async fn teardown(&mut self, state: ReceiverState) {
        self.session.close().await;
        if let Some(control) = self.control.take() {
            control.close();
        }
        self.events = None;
        self.shared.set_signaling(false);
        self.shared.set_link_state(LinkState::Closed);
        if state == ReceiverState::Failed {
            self.shared.supervisor().mark_disconnected();
        }
        self.shared.set_state(state);
    }
}
