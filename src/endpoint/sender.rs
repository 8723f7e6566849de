//! Sender endpoint (capture side, initiator)
//!
//! Claims a pairing code, opens both data channels, sends the offer and
//! drives the negotiation until the peer link is connected. After that the
//! control connection is only needed for teardown and trickled candidates.

use super::control::{ControlConnection, ControlEvent};
use super::{next_control_event, wire_peer_connection, EndpointError, EndpointShared};
use super::supervisor::{LinkStatus, LossDecision, ResumeAction};
use crate::config::{Config, EndpointConfig};
use crate::protocol::{is_valid_code, ClientId, ClientMessage, IceCandidate, ServerMessage, SignalError};
use crate::transport::{ChunkSettings, ChunkedSender, Command, TextEvent};
use crate::webrtc::data_channel::ChannelKind;
use crate::webrtc::peer_connection::Reliability;
use crate::webrtc::{LinkState, NegotiationSession, PeerConnectionManager};
use log::{debug, error, info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use webrtc::data_channel::RTCDataChannel;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SenderState {
    Idle,
    AwaitingControlConnection,
    ClaimingCode,
    /// Offer created and sent, waiting for the answer
    Negotiating,
    /// Answer applied, ICE still searching
    IceGathering,
    Connected,
    Disconnected,
    Failed,
}

impl SenderState {
    pub fn is_finished(&self) -> bool {
        matches!(self, SenderState::Disconnected | SenderState::Failed)
    }
}

enum DriverCommand {
    /// Manual teardown
    Shutdown { done: oneshot::Sender<()> },
    /// Replacement control connection after a reconnect
    Resume {
        control: Arc<ControlConnection>,
        events: mpsc::UnboundedReceiver<ControlEvent>,
    },
    #[cfg(test)]
    SeverControl,
}

struct ActiveLink {
    code: String,
    /// Id the server knows this side of the pair by
    client_id: ClientId,
    commands: Arc<RTCDataChannel>,
    text: Arc<RTCDataChannel>,
    driver_tx: mpsc::UnboundedSender<DriverCommand>,
    driver: JoinHandle<()>,
}

pub struct SenderEndpoint {
    config: EndpointConfig,
    peers: PeerConnectionManager,
    chunked: ChunkedSender,
    text_max_retransmits: u16,
    shared: Arc<EndpointShared<SenderState>>,
    active: Mutex<Option<ActiveLink>>,
}

impl SenderEndpoint {
    pub fn new(config: &Config) -> Self {
        Self {
            config: config.endpoint.clone(),
            peers: PeerConnectionManager::new(config.webrtc.clone()),
            chunked: ChunkedSender::new(ChunkSettings::from(&config.transport)),
            text_max_retransmits: config.webrtc.text_max_retransmits,
            shared: Arc::new(EndpointShared::new("sender", SenderState::Idle)),
            active: Mutex::new(None),
        }
    }

    pub fn state(&self) -> SenderState {
        self.shared.state()
    }

    /// Watch state transitions
    pub fn subscribe(&self) -> watch::Receiver<SenderState> {
        self.shared.subscribe()
    }

    pub fn status(&self) -> LinkStatus {
        self.shared.supervisor().status()
    }

    /// Pair with the receiver holding `code` and start negotiating.
    /// Returns once the offer is accepted by the server.
    pub async fn connect(&self, code: &str) -> Result<(), EndpointError> {
        if !is_valid_code(code) {
            return Err(EndpointError::Rejected(SignalError::InvalidCode));
        }

        let mut active = self.active.lock().await;
        if let Some(link) = active.as_ref() {
            if !link.driver.is_finished() {
                return Err(EndpointError::InvalidState(format!("already paired with {}", link.code)));
            }
        }

        self.shared.supervisor().reset();
        self.shared.set_state(SenderState::AwaitingControlConnection);
        let (control, events) =
            match ControlConnection::connect(&self.config.signaling_url, self.config.control_connect_timeout()).await {
                Ok(connected) => connected,
                Err(e) => {
                    error!("Control connection failed: {}", e);
                    self.shared.set_state(SenderState::Failed);
                    return Err(e);
                }
            };
        let control = Arc::new(control);
        self.shared.set_signaling(true);

        self.shared.set_state(SenderState::ClaimingCode);
        let claim = control
            .request(
                |request_id| ClientMessage::ConnectWithCode { request_id, code: code.to_string(), resume_from: None },
                self.config.request_timeout(),
            )
            .await
            .and_then(|ack| ack.into_result().map_err(EndpointError::from));
        if let Err(e) = claim {
            warn!("Claim of code {} failed: {}", code, e);
            control.close();
            self.shared.set_signaling(false);
            self.shared.set_state(SenderState::Failed);
            return Err(e);
        }
        info!("Code {} claimed", code);

        let (link_tx, link_rx) = mpsc::unbounded_channel();
        let (ice_tx, ice_rx) = mpsc::unbounded_channel();
        let mut session = NegotiationSession::new();

        let offered = self.offer(&mut session, &control, code, link_tx, ice_tx).await;
        let (commands, text, deadline) = match offered {
            Ok(offered) => offered,
            Err(e) => {
                error!("Negotiation with {} failed: {}", code, e);
                session.close().await;
                control.close();
                self.shared.set_signaling(false);
                self.shared.set_state(SenderState::Failed);
                return Err(e);
            }
        };

        let client_id = control.client_id().clone();
        let (driver_tx, driver_rx) = mpsc::unbounded_channel();
        let driver = SenderDriver {
            session,
            control: Some(control),
            events: Some(events),
            commands: driver_rx,
            link_states: link_rx,
            local_ice: ice_rx,
            shared: self.shared.clone(),
            connected: false,
        };
        let driver = tokio::spawn(driver.run(deadline));

        *active = Some(ActiveLink {
            code: code.to_string(),
            client_id,
            commands,
            text,
            driver_tx,
            driver,
        });
        Ok(())
    }

    /// Build the peer connection and channels, then create and send the offer
    async fn offer(
        &self,
        session: &mut NegotiationSession,
        control: &ControlConnection,
        code: &str,
        link_tx: mpsc::UnboundedSender<LinkState>,
        ice_tx: mpsc::UnboundedSender<IceCandidate>,
    ) -> Result<(Arc<RTCDataChannel>, Arc<RTCDataChannel>, Instant), EndpointError> {
        let pc = self.peers.create_peer_connection().await?;
        session.attach(pc.clone());
        wire_peer_connection(&pc, link_tx, ice_tx);

        let commands =
            PeerConnectionManager::create_data_channel(&pc, ChannelKind::Commands.label(), Reliability::Reliable)
                .await?;
        let text = PeerConnectionManager::create_data_channel(
            &pc,
            ChannelKind::Text.label(),
            Reliability::LimitedRetransmits(self.text_max_retransmits),
        )
        .await?;
        session.add_channel(ChannelKind::Commands, commands.clone());
        session.add_channel(ChannelKind::Text, text.clone());

        let offer = PeerConnectionManager::create_offer(&pc).await?;
        let deadline = Instant::now() + self.config.negotiation_timeout();
        session.set_local_description(offer.clone());
        self.shared.set_state(SenderState::Negotiating);

        control
            .request(
                |request_id| ClientMessage::Offer { request_id, offer, code: code.to_string() },
                self.config.request_timeout(),
            )
            .await?
            .into_result()?;
        debug!("Offer for {} delivered", code);

        Ok((commands, text, deadline))
    }

    /// Wait for the peer link to connect (or the attempt to end)
    pub async fn wait_until_connected(&self, timeout: Duration) -> Result<(), EndpointError> {
        match self
            .shared
            .wait_for(timeout, |s| s == SenderState::Connected || s.is_finished())
            .await?
        {
            SenderState::Connected => Ok(()),
            other => Err(EndpointError::InvalidState(format!("pairing ended in {:?}", other))),
        }
    }

    /// Send one command on the commands channel; large payloads are chunked
    pub async fn send_command(&self, command: Command) -> Result<usize, EndpointError> {
        let channel = self.channel(ChannelKind::Commands).await?;
        let (kind, data) = command.into_parts();
        Ok(self.chunked.send_message(&*channel, kind, data).await?)
    }

    /// Send one telemetry event on the text channel
    pub async fn send_text_event(&self, event: &TextEvent) -> Result<(), EndpointError> {
        let channel = self.channel(ChannelKind::Text).await?;
        let frame = event.to_json()?;
        Ok(self.chunked.send_frame(&*channel, frame).await?)
    }

    async fn channel(&self, kind: ChannelKind) -> Result<Arc<RTCDataChannel>, EndpointError> {
        let active = self.active.lock().await;
        let link = active
            .as_ref()
            .ok_or_else(|| EndpointError::InvalidState("not paired".to_string()))?;
        Ok(match kind {
            ChannelKind::Commands => link.commands.clone(),
            ChannelKind::Text => link.text.clone(),
        })
    }

    /// Application came back to the foreground
    pub fn on_resume(&self) -> ResumeAction {
        self.shared.on_resume()
    }

    /// Re-open the control connection under a live peer link and take
    /// the pairing over under the new connection id
    pub async fn reconnect(&self) -> Result<(), EndpointError> {
        if !self.shared.supervisor().begin_reconnect() {
            return Err(EndpointError::InvalidState("pairing was closed manually".to_string()));
        }

        let mut active = self.active.lock().await;
        let Some(link) = active.as_mut().filter(|link| !link.driver.is_finished()) else {
            self.shared.supervisor().reconnect_failed(false);
            return Err(EndpointError::InvalidState("not paired".to_string()));
        };

        match self.resume_claim(&link.code, &link.client_id).await {
            Ok((control, events)) => {
                let client_id = control.client_id().clone();
                link.driver_tx
                    .send(DriverCommand::Resume { control, events })
                    .map_err(|_| EndpointError::InvalidState("pairing ended".to_string()))?;
                info!("Pairing on {} resumed (was {}, now {})", link.code, link.client_id, client_id);
                link.client_id = client_id;
                Ok(())
            }
            Err(e) => {
                self.shared.supervisor().reconnect_failed(self.shared.peer_connected());
                Err(e)
            }
        }
    }

    async fn resume_claim(
        &self,
        code: &str,
        previous: &ClientId,
    ) -> Result<(Arc<ControlConnection>, mpsc::UnboundedReceiver<ControlEvent>), EndpointError> {
        let (control, events) =
            ControlConnection::connect(&self.config.signaling_url, self.config.control_connect_timeout()).await?;
        let control = Arc::new(control);

        let result = control
            .request(
                |request_id| ClientMessage::ConnectWithCode {
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
        let Some(link) = self.active.lock().await.take() else {
            return;
        };

        let (done_tx, done_rx) = oneshot::channel();
        if link.driver_tx.send(DriverCommand::Shutdown { done: done_tx }).is_ok() {
            let _ = done_rx.await;
        }
        let _ = link.driver.await;

        self.shared.supervisor().mark_manual();
        if !self.state().is_finished() {
            self.shared.set_state(SenderState::Disconnected);
        }
        info!("Disconnected from {}", link.code);
    }

    #[cfg(test)]
    async fn client_id(&self) -> Option<ClientId> {
        self.active.lock().await.as_ref().map(|link| link.client_id.clone())
    }

    #[cfg(test)]
    async fn sever_control(&self) {
        if let Some(link) = self.active.lock().await.as_ref() {
            let _ = link.driver_tx.send(DriverCommand::SeverControl);
        }
    }
}

/// Owns the negotiation session for one pairing attempt
struct SenderDriver {
    session: NegotiationSession,
    control: Option<Arc<ControlConnection>>,
    events: Option<mpsc::UnboundedReceiver<ControlEvent>>,
    commands: mpsc::UnboundedReceiver<DriverCommand>,
    link_states: mpsc::UnboundedReceiver<LinkState>,
    local_ice: mpsc::UnboundedReceiver<IceCandidate>,
    shared: Arc<EndpointShared<SenderState>>,
    connected: bool,
}

impl SenderDriver {
    async fn run(mut self, deadline: Instant) {
        let watchdog = tokio::time::sleep_until(deadline);
        tokio::pin!(watchdog);

        loop {
            tokio::select! {
                _ = &mut watchdog, if !self.connected => {
                    warn!("Peer link not connected before the negotiation deadline");
                    self.teardown(SenderState::Failed).await;
                    break;
                }
                command = self.commands.recv() => match command {
                    Some(DriverCommand::Shutdown { done }) => {
                        self.shutdown().await;
                        let _ = done.send(());
                        break;
                    }
                    Some(DriverCommand::Resume { control, events }) => {
                        info!("Control connection restored as {}", control.client_id());
                        self.control = Some(control);
                        self.events = Some(events);
                        self.shared.set_signaling(true);
                        self.shared.supervisor().reconnected();
                    }
                    #[cfg(test)]
                    Some(DriverCommand::SeverControl) => {
                        if let Some(control) = &self.control {
                            control.sever();
                        }
                    }
                    // Endpoint dropped without a disconnect
                    None => {
                        self.teardown(SenderState::Disconnected).await;
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
            }
        }
    }

    /// Returns false when the pairing is over
    async fn on_control_event(&mut self, event: ControlEvent) -> bool {
        match event {
            ControlEvent::Message(ServerMessage::Answer { answer }) => {
                match self.session.apply_remote_description(answer).await {
                    Ok(_) => {
                        if !self.connected {
                            self.shared.set_state(SenderState::IceGathering);
                        }
                        true
                    }
                    Err(e) => {
                        error!("Failed to apply answer: {}", e);
                        self.teardown(SenderState::Failed).await;
                        false
                    }
                }
            }
            ControlEvent::Message(ServerMessage::IceCandidate { candidate }) => {
                if let Err(e) = self.session.add_remote_candidate(candidate).await {
                    warn!("{}", e);
                }
                true
            }
            ControlEvent::Message(ServerMessage::PeerDisconnected) => {
                info!("Receiver closed the pairing");
                self.shared.supervisor().mark_disconnected();
                self.teardown(SenderState::Disconnected).await;
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
                        let state = if self.connected { SenderState::Disconnected } else { SenderState::Failed };
                        self.teardown(state).await;
                        false
                    }
                }
            }
        }
    }

    async fn on_link_state(&mut self, state: LinkState) -> bool {
        self.shared.set_link_state(state);
        match state {
            LinkState::Connected => {
                self.connected = true;
                self.shared.supervisor().link_connected();
                self.shared.set_state(SenderState::Connected);
                true
            }
            LinkState::Disconnected => {
                warn!("Peer link interrupted; waiting for ICE to recover");
                true
            }
            LinkState::Failed => {
                error!("Peer link failed");
                self.teardown(SenderState::Failed).await;
                false
            }
            LinkState::Closed => {
                self.teardown(SenderState::Disconnected).await;
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
        self.teardown(SenderState::Disconnected).await;
    }

    async fn teardown(&mut self, state: SenderState) {
        self.session.close().await;
        if let Some(control) = self.control.take() {
            control.close();
        }
        self.events = None;
        self.shared.set_signaling(false);
        self.shared.set_link_state(LinkState::Closed);
        if state == SenderState::Failed {
            self.shared.supervisor().mark_disconnected();
        }
        self.shared.set_state(state);
    }
}
