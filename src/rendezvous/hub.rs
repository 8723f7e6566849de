//! Rendezvous hub
//!
//! A single task owns the pairing registry and the outbound sink of every
//! attached control connection. Connection handlers never touch the maps;
//! they forward frames to the hub, which processes them one at a time in
//! arrival order. Register/claim checks and their mutation therefore happen
//! in one logical turn.
//!
//! A socket that closes without `manual-disconnect` only takes its client
//! offline. Its codes and pair entry stay until it resumes under a new id,
//! its peer disconnects manually, or it has been offline for a full code TTL.

use super::registry::{PairingRegistry, RegistryStats};
use crate::protocol::{Ack, ClientId, ClientMessage, ServerMessage, SignalError};
use log::{debug, info, warn};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

/// Outbound half of one control connection
pub type ClientSink = mpsc::UnboundedSender<ServerMessage>;

/// Commands processed by the hub task
#[derive(Debug)]
pub enum HubCommand {
    /// A control connection came up
    Attach { client_id: ClientId, sink: ClientSink },
    /// A validated frame from an attached client
    Inbound { client_id: ClientId, message: ClientMessage },
    /// The control socket closed
    Detach { client_id: ClientId },
    /// Snapshot of registry counters
    Stats { reply: oneshot::Sender<RegistryStats> },
}

/// Registry plus connected clients; driven by [`HubHandle::spawn`]
pub struct Hub {
    registry: PairingRegistry,
    clients: HashMap<ClientId, ClientSink>,
    /// Detached clients whose state is kept, with the time they left
    offline: HashMap<ClientId, Instant>,
    offline_grace: Duration,
}

impl Hub {
    pub fn new(code_ttl: Duration) -> Self {
        Self {
            registry: PairingRegistry::new(code_ttl),
            clients: HashMap::new(),
            offline: HashMap::new(),
            offline_grace: code_ttl,
        }
    }

    pub fn registry(&self) -> &PairingRegistry {
        &self.registry
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    pub fn is_offline(&self, client_id: &ClientId) -> bool {
        self.offline.contains_key(client_id)
    }

    /// Process one command at `now`
    pub fn handle(&mut self, command: HubCommand, now: Instant) {
        match command {
            HubCommand::Attach { client_id, sink } => {
                let _ = sink.send(ServerMessage::Welcome { client_id: client_id.clone() });
                self.clients.insert(client_id.clone(), sink);
                info!("Client {} attached ({} connected)", client_id, self.clients.len());
            }
            HubCommand::Inbound { client_id, message } => {
                self.on_message(&client_id, message, now);
            }
            HubCommand::Detach { client_id } => {
                self.clients.remove(&client_id);
                // The peer is not told: the peer link may outlive this socket.
                if let Some(peer) = self.registry.peer_of(&client_id) {
                    debug!("Client {} offline; pairing with {} kept", client_id, peer);
                }
                self.offline.insert(client_id.clone(), now);
                info!("Client {} detached ({} connected)", client_id, self.clients.len());
            }
            HubCommand::Stats { reply } => {
                let _ = reply.send(self.registry.stats());
            }
        }
    }

    /// Drop expired codes and the state of clients offline past the grace
    /// period; returns how many codes went
    pub fn sweep(&mut self, now: Instant) -> usize {
        let grace = self.offline_grace;
        let gone: Vec<ClientId> = self
            .offline
            .iter()
            .filter(|(_, since)| now.saturating_duration_since(**since) > grace)
            .map(|(id, _)| id.clone())
            .collect();
        for id in gone {
            self.offline.remove(&id);
            if let Some(peer) = self.registry.disconnect(&id) {
                debug!("Client {} never came back; pairing with {} dropped", id, peer);
            }
        }

        let removed = self.registry.sweep(now);
        if removed > 0 {
            debug!("Swept {} expired pairing code(s)", removed);
        }
        removed
    }

    fn on_message(&mut self, from: &ClientId, message: ClientMessage, now: Instant) {
        debug!("{} from {}", message.kind(), from);

        match message {
            ClientMessage::RegisterPairingCode { request_id, code, resume_from } => {
                let result = match &resume_from {
                    Some(previous) => self.registry.resume_code(previous, from, &code, now),
                    None => self.registry.register_code(from, &code, now),
                };
                match result {
                    Ok(()) => {
                        if let Some(previous) = resume_from {
                            self.offline.remove(&previous);
                        }
                        info!("Code {} registered by {}", code, from);
                        self.ack(from, Ack::registered(request_id, &code));
                    }
                    Err(e) => {
                        warn!("Registration of {} by {} rejected: {}", code, from, e);
                        self.ack(from, Ack::failed(request_id, e));
                    }
                }
            }

            ClientMessage::ConnectWithCode { request_id, code, resume_from: Some(previous) } => {
                match self.registry.resume_claim(&previous, from, &code, now) {
                    Ok(claim) => {
                        self.offline.remove(&previous);
                        info!("Pair {} <-> {} resumed (was {})", claim.owner_id, claim.peer_id, previous);
                        self.ack(from, Ack::paired(request_id, claim.owner_id, claim.peer_id));
                    }
                    Err(e) => {
                        warn!("Resume of {} by {} failed: {}", code, from, e);
                        self.ack(from, Ack::failed(request_id, e));
                    }
                }
            }

            ClientMessage::ConnectWithCode { request_id, code, resume_from: None } => {
                match self.registry.claim_code(from, &code, now) {
                    Ok(claim) => {
                        info!("Code {} claimed: {} <-> {}", code, claim.owner_id, claim.peer_id);
                        self.ack(
                            from,
                            Ack::paired(request_id, claim.owner_id.clone(), claim.peer_id.clone()),
                        );
                        self.send(
                            &claim.owner_id,
                            ServerMessage::PeerConnected { peer_id: claim.peer_id },
                        );
                    }
                    Err(e) => {
                        warn!("Claim of {} by {} failed: {}", code, from, e);
                        self.ack(from, Ack::failed(request_id, e));
                    }
                }
            }

            ClientMessage::Offer { request_id, offer, code } => {
                let Some(owner) = self.registry.owner_of(&code, now) else {
                    self.ack(from, Ack::failed(request_id, SignalError::NotFound));
                    return;
                };
                if owner == *from {
                    self.ack(from, Ack::failed(request_id, SignalError::SelfPairing));
                    return;
                }
                if matches!(self.registry.peer_of(&owner), Some(peer) if peer != from) {
                    warn!("Offer for {} from {} rejected: code paired with another client", code, from);
                    self.ack(from, Ack::failed(request_id, SignalError::AlreadyPaired));
                    return;
                }
                let delivered = self.send(
                    &owner,
                    ServerMessage::Offer { offer, sender_id: from.clone() },
                );
                self.ack(from, relay_ack(request_id, delivered));
            }

            ClientMessage::Answer { request_id, answer } => {
                let Some(peer) = self.registry.peer_of(from).cloned() else {
                    self.ack(from, Ack::failed(request_id, SignalError::NotPaired));
                    return;
                };
                let delivered = self.send(&peer, ServerMessage::Answer { answer });
                self.ack(from, relay_ack(request_id, delivered));
            }

            ClientMessage::IceCandidate { candidate } => {
                let Some(peer) = self.registry.peer_of(from).cloned() else {
                    self.send(
                        from,
                        ServerMessage::error(SignalError::NotPaired, "no peer for ICE candidate"),
                    );
                    return;
                };
                if !self.send(&peer, ServerMessage::IceCandidate { candidate }) {
                    self.send(
                        from,
                        ServerMessage::error(SignalError::PeerUnavailable, "peer not connected"),
                    );
                }
            }

            ClientMessage::ManualDisconnect => {
                if let Some(peer) = self.registry.disconnect(from) {
                    self.offline.remove(&peer);
                    info!("{} disconnected manually; notifying {}", from, peer);
                    self.send(&peer, ServerMessage::PeerDisconnected);
                } else {
                    info!("{} disconnected manually (unpaired)", from);
                }
            }
        }
    }

    /// Reject a frame that failed validation
    pub fn reject(&self, client_id: &ClientId, request_id: Option<u64>, error: SignalError, reason: &str) {
        match request_id {
            Some(id) => self.ack(client_id, Ack::failed(id, error)),
            None => {
                self.send(client_id, ServerMessage::error(error, reason));
            }
        }
    }

    fn ack(&self, to: &ClientId, ack: Ack) {
        self.send(to, ServerMessage::Ack(ack));
    }

    fn send(&self, to: &ClientId, message: ServerMessage) -> bool {
        match self.clients.get(to) {
            Some(sink) => sink.send(message).is_ok(),
            None => {
                debug!("Dropping message for unknown client {}", to);
                false
            }
        }
    }
}

fn relay_ack(request_id: u64, delivered: bool) -> Ack {
    if delivered {
        Ack::ok(request_id)
    } else {
        Ack::failed(request_id, SignalError::PeerUnavailable)
    }
}

/// Cloneable handle to a running hub task
#[derive(Debug, Clone)]
pub struct HubHandle {
    tx: mpsc::UnboundedSender<HubEvent>,
}

#[derive(Debug)]
enum HubEvent {
    Command(HubCommand),
    Reject {
        client_id: ClientId,
        request_id: Option<u64>,
        error: SignalError,
        reason: String,
    },
}

impl HubHandle {
    /// Start the hub task with a periodic TTL sweep
    pub fn spawn(code_ttl: Duration, sweep_interval: Duration) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::unbounded_channel::<HubEvent>();
        let handle = tokio::spawn(async move {
            let mut hub = Hub::new(code_ttl);
            let mut sweep = tokio::time::interval(sweep_interval);
            sweep.tick().await;

            loop {
                tokio::select! {
                    event = rx.recv() => {
                        match event {
                            Some(HubEvent::Command(command)) => hub.handle(command, Instant::now()),
                            Some(HubEvent::Reject { client_id, request_id, error, reason }) => {
                                hub.reject(&client_id, request_id, error, &reason);
                            }
                            None => break,
                        }
                    }
                    _ = sweep.tick() => {
                        hub.sweep(Instant::now());
                    }
                }
            }
            info!("Rendezvous hub stopped");
        });
        (Self { tx }, handle)
    }

    pub fn attach(&self, client_id: ClientId, sink: ClientSink) {
        self.command(HubCommand::Attach { client_id, sink });
    }

    pub fn inbound(&self, client_id: ClientId, message: ClientMessage) {
        self.command(HubCommand::Inbound { client_id, message });
    }

    pub fn detach(&self, client_id: ClientId) {
        self.command(HubCommand::Detach { client_id });
    }

    pub fn reject(&self, client_id: ClientId, request_id: Option<u64>, error: SignalError, reason: String) {
        if self
            .tx
            .send(HubEvent::Reject { client_id, request_id, error, reason })
            .is_err()
        {
            warn!("Rendezvous hub is gone; rejection dropped");
        }
    }

    pub async fn stats(&self) -> Option<RegistryStats> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(HubEvent::Command(HubCommand::Stats { reply })).ok()?;
        rx.await.ok()
    }

    fn command(&self, command: HubCommand) {
        if self.tx.send(HubEvent::Command(command)).is_err() {
            warn!("Rendezvous hub is gone; command dropped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{IceCandidate, SessionDescription};

    struct TestClient {
        id: ClientId,
        rx: mpsc::UnboundedReceiver<ServerMessage>,
    }

    impl TestClient {
        fn attach(hub: &mut Hub, name: &str, now: Instant) -> Self {
            let id = ClientId::from(name);
            let (sink, mut rx) = mpsc::unbounded_channel();
            hub.handle(HubCommand::Attach { client_id: id.clone(), sink }, now);
            assert_eq!(rx.try_recv().unwrap(), ServerMessage::Welcome { client_id: id.clone() });
            Self { id, rx }
        }

        fn send(&self, hub: &mut Hub, message: ClientMessage, now: Instant) {
            hub.handle(HubCommand::Inbound { client_id: self.id.clone(), message }, now);
        }

        fn next(&mut self) -> ServerMessage {
            self.rx.try_recv().expect("expected a server message")
        }

        fn next_ack(&mut self) -> Ack {
            match self.next() {
                ServerMessage::Ack(ack) => ack,
                other => panic!("Expected Ack, got {:?}", other),
            }
        }

        fn is_idle(&mut self) -> bool {
            self.rx.try_recv().is_err()
        }
    }

    fn register(code: &str, request_id: u64) -> ClientMessage {
        ClientMessage::RegisterPairingCode { request_id, code: code.to_string(), resume_from: None }
    }

    fn claim(code: &str, request_id: u64) -> ClientMessage {
        ClientMessage::ConnectWithCode { request_id, code: code.to_string(), resume_from: None }
    }

    fn candidate(n: u32) -> IceCandidate {
        IceCandidate::new(format!("candidate:{} 1 udp 2122260223 10.0.0.{} 5000 typ host", n, n))
    }

    #[test]
    fn test_full_pairing_and_negotiation_relay() {
        let now = Instant::now();
        let mut hub = Hub::new(Duration::from_secs(300));
        let mut r = TestClient::attach(&mut hub, "R", now);
        let mut s = TestClient::attach(&mut hub, "S", now);

        r.send(&mut hub, register("482913", 1), now);
        assert_eq!(r.next_ack(), Ack::registered(1, "482913"));

        s.send(&mut hub, claim("482913", 1), now);
        assert_eq!(s.next_ack(), Ack::paired(1, r.id.clone(), s.id.clone()));
        assert_eq!(r.next(), ServerMessage::PeerConnected { peer_id: s.id.clone() });

        s.send(
            &mut hub,
            ClientMessage::Offer {
                request_id: 2,
                offer: SessionDescription::offer("offer-sdp"),
                code: "482913".to_string(),
            },
            now,
        );
        assert_eq!(s.next_ack(), Ack::ok(2));
        assert_eq!(
            r.next(),
            ServerMessage::Offer {
                offer: SessionDescription::offer("offer-sdp"),
                sender_id: s.id.clone(),
            }
        );

        r.send(
            &mut hub,
            ClientMessage::Answer { request_id: 2, answer: SessionDescription::answer("answer-sdp") },
            now,
        );
        assert_eq!(r.next_ack(), Ack::ok(2));
        assert_eq!(
            s.next(),
            ServerMessage::Answer { answer: SessionDescription::answer("answer-sdp") }
        );

        for n in 1..=2 {
            s.send(&mut hub, ClientMessage::IceCandidate { candidate: candidate(n) }, now);
            r.send(&mut hub, ClientMessage::IceCandidate { candidate: candidate(n + 10) }, now);
        }
        for n in 1..=2 {
            assert_eq!(r.next(), ServerMessage::IceCandidate { candidate: candidate(n) });
            assert_eq!(s.next(), ServerMessage::IceCandidate { candidate: candidate(n + 10) });
        }

        assert!(r.is_idle());
        assert!(s.is_idle());
        assert_eq!(hub.registry().peer_of(&r.id), Some(&s.id));
        assert_eq!(hub.registry().peer_of(&s.id), Some(&r.id));
        assert_eq!(hub.registry().stats().active_connections, 1);
    }

    #[test]
    fn test_expired_claim_is_reported_as_expired() {
        let t0 = Instant::now();
        let mut hub = Hub::new(Duration::from_secs(300));
        let mut r = TestClient::attach(&mut hub, "R", t0);
        let mut s = TestClient::attach(&mut hub, "S", t0);

        r.send(&mut hub, register("482913", 1), t0);
        r.next_ack();

        let late = t0 + Duration::from_secs(5 * 60 + 1);
        s.send(&mut hub, claim("482913", 1), late);
        assert_eq!(s.next_ack(), Ack::failed(1, SignalError::Expired));
        assert!(hub.registry().code_entry("482913").is_none());
        assert!(r.is_idle());
    }

    #[test]
    fn test_offer_for_unknown_code_is_rejected() {
        let now = Instant::now();
        let mut hub = Hub::new(Duration::from_secs(300));
        let mut s = TestClient::attach(&mut hub, "S", now);
        s.send(
            &mut hub,
            ClientMessage::Offer {
                request_id: 5,
                offer: SessionDescription::offer("v=0"),
                code: "123456".to_string(),
            },
            now,
        );
        assert_eq!(s.next_ack(), Ack::failed(5, SignalError::NotFound));
    }

    #[test]
    fn test_unpaired_answer_and_candidate_are_rejected() {
        let now = Instant::now();
        let mut hub = Hub::new(Duration::from_secs(300));
        let mut r = TestClient::attach(&mut hub, "R", now);

        r.send(
            &mut hub,
            ClientMessage::Answer { request_id: 1, answer: SessionDescription::answer("v=0") },
            now,
        );
        assert_eq!(r.next_ack(), Ack::failed(1, SignalError::NotPaired));

        r.send(&mut hub, ClientMessage::IceCandidate { candidate: candidate(1) }, now);
        match r.next() {
            ServerMessage::Error { error, .. } => assert_eq!(error, SignalError::NotPaired),
            other => panic!("Expected Error, got {:?}", other),
        }
    }

    #[test]
    fn test_manual_disconnect_notifies_peer_and_clears_state() {
        let now = Instant::now();
        let mut hub = Hub::new(Duration::from_secs(300));
        let mut r = TestClient::attach(&mut hub, "R", now);
        let mut s = TestClient::attach(&mut hub, "S", now);
        r.send(&mut hub, register("482913", 1), now);
        r.next_ack();
        s.send(&mut hub, claim("482913", 1), now);
        s.next_ack();
        r.next();

        s.send(&mut hub, ClientMessage::ManualDisconnect, now);
        assert_eq!(r.next(), ServerMessage::PeerDisconnected);
        assert!(s.is_idle());
        assert_eq!(hub.registry().stats(), RegistryStats::default());
    }

    fn paired(hub: &mut Hub, now: Instant) -> (TestClient, TestClient) {
        let mut r = TestClient::attach(hub, "R", now);
        let mut s = TestClient::attach(hub, "S", now);
        r.send(hub, register("482913", 1), now);
        r.next_ack();
        s.send(hub, claim("482913", 1), now);
        s.next_ack();
        r.next();
        (r, s)
    }

    #[test]
    fn test_detach_is_silent_and_keeps_the_pair() {
        let now = Instant::now();
        let mut hub = Hub::new(Duration::from_secs(300));
        let (r, mut s) = paired(&mut hub, now);

        hub.handle(HubCommand::Detach { client_id: r.id.clone() }, now);
        assert!(s.is_idle());
        assert_eq!(hub.client_count(), 1);
        assert!(hub.is_offline(&r.id));
        assert_eq!(hub.registry().peer_of(&s.id), Some(&r.id));
        assert_eq!(hub.registry().stats().active_connections, 1);
    }

    #[test]
    fn test_receiver_resumes_after_detach_and_disconnect_still_notifies() {
        let now = Instant::now();
        let mut hub = Hub::new(Duration::from_secs(300));
        let (r, mut s) = paired(&mut hub, now);

        hub.handle(HubCommand::Detach { client_id: r.id.clone() }, now);
        let mut r2 = TestClient::attach(&mut hub, "R2", now);
        r2.send(
            &mut hub,
            ClientMessage::RegisterPairingCode {
                request_id: 1,
                code: "482913".to_string(),
                resume_from: Some(r.id.clone()),
            },
            now,
        );
        assert!(r2.next_ack().success);
        assert!(!hub.is_offline(&r.id));
        assert_eq!(hub.registry().peer_of(&s.id), Some(&r2.id));

        s.send(&mut hub, ClientMessage::IceCandidate { candidate: candidate(7) }, now);
        assert_eq!(r2.next(), ServerMessage::IceCandidate { candidate: candidate(7) });

        r2.send(&mut hub, ClientMessage::ManualDisconnect, now);
        assert_eq!(s.next(), ServerMessage::PeerDisconnected);
        assert_eq!(hub.registry().stats(), RegistryStats::default());
    }

    #[test]
    fn test_sender_resumes_after_detach() {
        let now = Instant::now();
        let mut hub = Hub::new(Duration::from_secs(300));
        let (mut r, s) = paired(&mut hub, now);

        hub.handle(HubCommand::Detach { client_id: s.id.clone() }, now);
        let mut s2 = TestClient::attach(&mut hub, "S2", now);
        s2.send(
            &mut hub,
            ClientMessage::ConnectWithCode {
                request_id: 4,
                code: "482913".to_string(),
                resume_from: Some(s.id.clone()),
            },
            now,
        );
        assert_eq!(s2.next_ack(), Ack::paired(4, r.id.clone(), s2.id.clone()));
        // No second peer-connected: the receiver is already past that point
        assert!(r.is_idle());

        s2.send(&mut hub, ClientMessage::ManualDisconnect, now);
        assert_eq!(r.next(), ServerMessage::PeerDisconnected);
    }

    #[test]
    fn test_offline_client_is_dropped_after_grace() {
        let t0 = Instant::now();
        let mut hub = Hub::new(Duration::from_secs(300));
        let (r, mut s) = paired(&mut hub, t0);

        hub.handle(HubCommand::Detach { client_id: r.id.clone() }, t0);
        hub.sweep(t0 + Duration::from_secs(60));
        assert_eq!(hub.registry().peer_of(&s.id), Some(&r.id));

        hub.sweep(t0 + Duration::from_secs(301));
        assert!(hub.registry().peer_of(&s.id).is_none());
        assert!(!hub.is_offline(&r.id));
        assert_eq!(hub.registry().stats(), RegistryStats::default());
        assert!(s.is_idle());
    }

    #[test]
    fn test_third_party_offer_to_paired_code_is_rejected() {
        let now = Instant::now();
        let mut hub = Hub::new(Duration::from_secs(300));
        let (mut r, mut s) = paired(&mut hub, now);
        let mut intruder = TestClient::attach(&mut hub, "X", now);

        intruder.send(
            &mut hub,
            ClientMessage::Offer {
                request_id: 9,
                offer: SessionDescription::offer("v=0"),
                code: "482913".to_string(),
            },
            now,
        );
        assert_eq!(intruder.next_ack(), Ack::failed(9, SignalError::AlreadyPaired));
        assert!(r.is_idle());

        s.send(
            &mut hub,
            ClientMessage::Offer {
                request_id: 2,
                offer: SessionDescription::offer("v=0"),
                code: "482913".to_string(),
            },
            now,
        );
        assert_eq!(s.next_ack(), Ack::ok(2));
        assert!(matches!(r.next(), ServerMessage::Offer { .. }));
    }

    #[test]
    fn test_resumed_receiver_keeps_pair_with_sender() {
        let now = Instant::now();
        let mut hub = Hub::new(Duration::from_secs(300));
        let mut r = TestClient::attach(&mut hub, "R", now);
        let mut s = TestClient::attach(&mut hub, "S", now);
        r.send(&mut hub, register("482913", 1), now);
        r.next_ack();
        s.send(&mut hub, claim("482913", 1), now);
        s.next_ack();
        r.next();

        let mut r2 = TestClient::attach(&mut hub, "R2", now);
        r2.send(
            &mut hub,
            ClientMessage::RegisterPairingCode {
                request_id: 1,
                code: "482913".to_string(),
                resume_from: Some(r.id.clone()),
            },
            now,
        );
        assert!(r2.next_ack().success);

        s.send(&mut hub, ClientMessage::IceCandidate { candidate: candidate(3) }, now);
        assert_eq!(r2.next(), ServerMessage::IceCandidate { candidate: candidate(3) });
        assert!(r.is_idle());
    }

    #[test]
    fn test_reject_without_request_id_sends_error_frame() {
        let now = Instant::now();
        let mut hub = Hub::new(Duration::from_secs(300));
        let mut c = TestClient::attach(&mut hub, "C", now);
        hub.reject(&c.id, None, SignalError::Malformed, "bad frame");
        assert_eq!(c.next(), ServerMessage::error(SignalError::Malformed, "bad frame"));
        hub.reject(&c.id, Some(4), SignalError::InvalidCode, "bad code");
        assert_eq!(c.next_ack(), Ack::failed(4, SignalError::InvalidCode));
    }

    #[tokio::test]
    async fn test_spawned_hub_reports_stats() {
        let (hub, _task) = HubHandle::spawn(Duration::from_secs(300), Duration::from_secs(300));
        let (sink, mut rx) = mpsc::unbounded_channel();
        let id = ClientId::from("R");
        hub.attach(id.clone(), sink);
        hub.inbound(id, register("482913", 1));

        assert!(matches!(rx.recv().await, Some(ServerMessage::Welcome { .. })));
        assert!(matches!(rx.recv().await, Some(ServerMessage::Ack(ack)) if ack.success));
        let stats = hub.stats().await.unwrap();
        assert_eq!(stats.active_pairing_codes, 1);
        assert_eq!(stats.active_connections, 0);
    }
}
