//! Pairing registry
//!
//! In-memory state of the rendezvous server: live pairing codes and the
//! symmetric pair map. Every operation checks and mutates in one call, so a
//! single owner (the hub actor) gets atomic register/claim semantics without
//! any locking of its own.
//!
//! Time is passed in explicitly; the hub supplies `Instant::now()`.

use crate::protocol::{ClientId, SignalError};
use log::debug;
use serde::Serialize;
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// A live pairing code entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PairingCode {
    pub owner_id: ClientId,
    pub created_at: Instant,
    pub expires_at: Instant,
}

impl PairingCode {
    fn is_expired(&self, now: Instant) -> bool {
        now > self.expires_at
    }
}

/// Result of a successful claim
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Claim {
    pub owner_id: ClientId,
    pub peer_id: ClientId,
}

/// Registry counters reported by `/health`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryStats {
    pub active_pairing_codes: usize,
    pub active_connections: usize,
}

/// Pairing-code registry and pair map
#[derive(Debug)]
pub struct PairingRegistry {
    codes: HashMap<String, PairingCode>,
    pairs: HashMap<ClientId, ClientId>,
    ttl: Duration,
}

impl PairingRegistry {
    pub fn new(ttl: Duration) -> Self {
        Self {
            codes: HashMap::new(),
            pairs: HashMap::new(),
            ttl,
        }
    }

    /// Register `code` for `owner`.
    ///
    /// Fails with `CodeExists` while the code is live under someone else. An
    /// expired entry is replaced. Re-registering one's own code refreshes the
    /// TTL, and an owner keeps at most one code.
    pub fn register_code(
        &mut self,
        owner: &ClientId,
        code: &str,
        now: Instant,
    ) -> Result<(), SignalError> {
        if let Some(existing) = self.codes.get(code) {
            if existing.owner_id != *owner && !existing.is_expired(now) {
                return Err(SignalError::CodeExists);
            }
        }

        self.codes
            .retain(|other, entry| other == code || entry.owner_id != *owner);
        self.codes.insert(
            code.to_string(),
            PairingCode {
                owner_id: owner.clone(),
                created_at: now,
                expires_at: now + self.ttl,
            },
        );
        debug!("Registered code {} for {}", code, owner);
        Ok(())
    }

    /// Take over `code` and any pair from `previous`, the caller's earlier
    /// control connection.
    ///
    /// Works whether or not the server has already noticed the old socket
    /// closing. Fails with `CodeExists` only when the code is live under a
    /// third client.
    pub fn resume_code(
        &mut self,
        previous: &ClientId,
        owner: &ClientId,
        code: &str,
        now: Instant,
    ) -> Result<(), SignalError> {
        if let Some(entry) = self.codes.get(code) {
            let taken = entry.owner_id != *previous && entry.owner_id != *owner;
            if taken && !entry.is_expired(now) {
                return Err(SignalError::CodeExists);
            }
        }
        if self.pairs.contains_key(owner) && self.pairs.get(owner) != self.pairs.get(previous) {
            return Err(SignalError::AlreadyPaired);
        }

        self.codes.retain(|other, entry| {
            other == code || (entry.owner_id != *owner && entry.owner_id != *previous)
        });
        self.codes.insert(
            code.to_string(),
            PairingCode {
                owner_id: owner.clone(),
                created_at: now,
                expires_at: now + self.ttl,
            },
        );
        self.repoint(previous, owner);
        debug!("Code {} resumed by {} (was {})", code, owner, previous);
        Ok(())
    }

    /// Re-attach the claiming side of a pair under a new client id.
    ///
    /// `previous` must still be paired, and with the owner of `code` if that
    /// code is live.
    pub fn resume_claim(
        &mut self,
        previous: &ClientId,
        peer: &ClientId,
        code: &str,
        now: Instant,
    ) -> Result<Claim, SignalError> {
        let owner = self.pairs.get(previous).cloned().ok_or(SignalError::NotPaired)?;
        if let Some(entry) = self.codes.get(code) {
            if !entry.is_expired(now) && entry.owner_id != owner {
                return Err(SignalError::NotPaired);
            }
        }
        if previous != peer && self.pairs.contains_key(peer) {
            return Err(SignalError::AlreadyPaired);
        }

        self.repoint(previous, peer);
        debug!("Pair {} <-> {} resumed (was {})", owner, peer, previous);
        Ok(Claim {
            owner_id: owner,
            peer_id: peer.clone(),
        })
    }

    /// Move both directions of `previous`'s pair to `current`
    fn repoint(&mut self, previous: &ClientId, current: &ClientId) {
        if previous == current {
            return;
        }
        if let Some(peer) = self.pairs.remove(previous) {
            self.pairs.insert(current.clone(), peer.clone());
            self.pairs.insert(peer, current.clone());
        }
    }

    /// Claim `code` on behalf of `peer`, linking the pair on success.
    ///
    /// An expired code is removed here and reported as `Expired`, distinct
    /// from a code that was never there.
    pub fn claim_code(
        &mut self,
        peer: &ClientId,
        code: &str,
        now: Instant,
    ) -> Result<Claim, SignalError> {
        let entry = self.codes.get(code).ok_or(SignalError::NotFound)?;

        if entry.is_expired(now) {
            self.codes.remove(code);
            debug!("Code {} expired on claim", code);
            return Err(SignalError::Expired);
        }

        let owner = entry.owner_id.clone();
        if owner == *peer {
            return Err(SignalError::SelfPairing);
        }
        if self.pairs.contains_key(&owner) || self.pairs.contains_key(peer) {
            return Err(SignalError::AlreadyPaired);
        }

        self.pairs.insert(owner.clone(), peer.clone());
        self.pairs.insert(peer.clone(), owner.clone());
        Ok(Claim {
            owner_id: owner,
            peer_id: peer.clone(),
        })
    }

    /// Owner of a live code; an expired code is removed and yields `None`
    pub fn owner_of(&mut self, code: &str, now: Instant) -> Option<ClientId> {
        let entry = self.codes.get(code)?;
        if entry.is_expired(now) {
            self.codes.remove(code);
            return None;
        }
        Some(entry.owner_id.clone())
    }

    pub fn peer_of(&self, id: &ClientId) -> Option<&ClientId> {
        self.pairs.get(id)
    }

    pub fn code_entry(&self, code: &str) -> Option<&PairingCode> {
        self.codes.get(code)
    }

    /// Tear down everything tied to `id`: both pair directions and every
    /// code owned by either side. Returns the former peer.
    pub fn disconnect(&mut self, id: &ClientId) -> Option<ClientId> {
        let peer = self.pairs.remove(id);
        if let Some(ref peer) = peer {
            self.pairs.remove(peer);
        }

        let before = self.codes.len();
        self.codes.retain(|_, entry| {
            entry.owner_id != *id && Some(&entry.owner_id) != peer.as_ref()
        });
        let removed = before - self.codes.len();
        if removed > 0 {
            debug!("Removed {} code(s) on disconnect of {}", removed, id);
        }

        peer
    }

    /// Drop expired codes; returns how many were removed
    pub fn sweep(&mut self, now: Instant) -> usize {
        let before = self.codes.len();
        self.codes.retain(|_, entry| !entry.is_expired(now));
        before - self.codes.len()
    }

    pub fn stats(&self) -> RegistryStats {
        RegistryStats {
            active_pairing_codes: self.codes.len(),
            active_connections: self.pairs.len() / 2,
        }
    }
}
