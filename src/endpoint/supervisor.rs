//! Reconnection policy
//!
//! A control connection can drop (background suspension, network blip)
//! while the peer link stays up. The supervisor decides whether such a
//! loss tears the pairing down or only degrades it, and what to do when the
//! application comes back to the foreground.

use log::{debug, info};

/// User-facing link status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkStatus {
    Idle,
    Connected,
    /// Peer link up, control connection down
    SignalingUnavailable,
    Reconnecting,
    Disconnected,
}

/// What to do after the control connection dropped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LossDecision {
    /// Keep the peer link and pairing state, report degraded status
    Degrade,
    /// Nothing worth keeping; tear down
    Teardown,
}

/// What to do when the application resumes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResumeAction {
    Nothing,
    /// Peer link alive but signaling gone: let the user pick reconnect or abandon
    AskUser,
}

#[derive(Debug)]
pub struct ReconnectionSupervisor {
    status: LinkStatus,
    manual: bool,
}

impl Default for ReconnectionSupervisor {
    fn default() -> Self {
        Self::new()
    }
}

impl ReconnectionSupervisor {
    pub fn new() -> Self {
        Self {
            status: LinkStatus::Idle,
            manual: false,
        }
    }

    pub fn status(&self) -> LinkStatus {
        self.status
    }

    pub fn is_manual(&self) -> bool {
        self.manual
    }

    /// New pairing attempt; forget any earlier manual teardown
    pub fn reset(&mut self) {
        self.manual = false;
        self.status = LinkStatus::Idle;
    }

    /// Peer link came up with the control connection healthy
    pub fn link_connected(&mut self) {
        self.manual = false;
        self.status = LinkStatus::Connected;
    }

    /// Explicit teardown; recovery never applies afterwards
    pub fn mark_manual(&mut self) {
        self.manual = true;
        self.status = LinkStatus::Disconnected;
    }

    /// The pairing ended for any other reason
    pub fn mark_disconnected(&mut self) {
        self.status = LinkStatus::Disconnected;
    }

    pub fn on_control_lost(&mut self, peer_connected: bool) -> LossDecision {
        if self.manual || !peer_connected {
            self.status = LinkStatus::Disconnected;
            return LossDecision::Teardown;
        }
        info!("Control connection lost; peer link still up");
        self.status = LinkStatus::SignalingUnavailable;
        LossDecision::Degrade
    }

    pub fn on_resume(&self, peer_connected: bool, control_connected: bool) -> ResumeAction {
        if !self.manual && peer_connected && !control_connected {
            ResumeAction::AskUser
        } else {
            ResumeAction::Nothing
        }
    }

    /// Returns false when a reconnect is not allowed (manual teardown)
    pub fn begin_reconnect(&mut self) -> bool {
        if self.manual {
            debug!("Reconnect refused after manual disconnect");
            return false;
        }
        self.status = LinkStatus::Reconnecting;
        true
    }

    pub fn reconnected(&mut self) {
        self.status = LinkStatus::Connected;
    }

    pub fn reconnect_failed(&mut self, peer_connected: bool) {
        self.status = if peer_connected {
            LinkStatus::SignalingUnavailable
        } else {
            LinkStatus::Disconnected
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_control_loss_with_live_link_degrades() {
        let mut supervisor = ReconnectionSupervisor::new();
        supervisor.link_connected();
        assert_eq!(supervisor.on_control_lost(true), LossDecision::Degrade);
        assert_eq!(supervisor.status(), LinkStatus::SignalingUnavailable);
    }

    #[test]
    fn test_control_loss_without_link_tears_down() {
        let mut supervisor = ReconnectionSupervisor::new();
        assert_eq!(supervisor.on_control_lost(false), LossDecision::Teardown);
        assert_eq!(supervisor.status(), LinkStatus::Disconnected);
    }

    #[test]
    fn test_manual_disconnect_never_recovers() {
        let mut supervisor = ReconnectionSupervisor::new();
        supervisor.link_connected();
        supervisor.mark_manual();
        assert_eq!(supervisor.on_control_lost(true), LossDecision::Teardown);
        assert_eq!(supervisor.on_resume(true, false), ResumeAction::Nothing);
        assert!(!supervisor.begin_reconnect());
    }

    #[test]
    fn test_resume_asks_only_when_signaling_is_gone() {
        let mut supervisor = ReconnectionSupervisor::new();
        supervisor.link_connected();
        assert_eq!(supervisor.on_resume(true, true), ResumeAction::Nothing);
        assert_eq!(supervisor.on_resume(false, false), ResumeAction::Nothing);
        supervisor.on_control_lost(true);
        assert_eq!(supervisor.on_resume(true, false), ResumeAction::AskUser);
    }

    #[test]
    fn test_reconnect_cycle() {
        let mut supervisor = ReconnectionSupervisor::new();
        supervisor.link_connected();
        supervisor.on_control_lost(true);
        assert!(supervisor.begin_reconnect());
        assert_eq!(supervisor.status(), LinkStatus::Reconnecting);
        supervisor.reconnect_failed(true);
        assert_eq!(supervisor.status(), LinkStatus::SignalingUnavailable);
        assert!(supervisor.begin_reconnect());
        supervisor.reconnected();
        assert_eq!(supervisor.status(), LinkStatus::Connected);
    }
}
