//! Host-driven negotiation: the application reports connection events, the
//! negotiator returns actions (send bytes, accept, reject, show a report).

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};

use serde::{Deserialize, Serialize};

use crate::codec;
use crate::compat::{self, CompatibilityReport, Finding};
use crate::descriptor::Role;
use crate::inventory::{HostInfo, ModuleInventory, ModuleSource};
use crate::package::Package;

/// Why a connection was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RejectReason {
    /// Both sides exchanged inventories and at least one blocking finding exists.
    IncompatibleModules,
    /// The peer sent no readable inventory but local modules require it to run some.
    MissingCompatibilityData,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Accepted,
    Rejected(RejectReason),
}

/// Per-connection negotiation state. A connection with no entry is idle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationState {
    Idle,
    AwaitingRemote,
    Resolved(Verdict),
}

/// What the host keeps in the per-endpoint table after a peer disconnects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RetentionPolicy {
    #[default]
    EvictOnDisconnect,
    KeepForSession,
}

/// Everything the diagnostic UI needs to explain a rejection.
#[derive(Debug, Clone)]
pub struct Diagnostic {
    pub peer: SocketAddr,
    pub report: CompatibilityReport,
    pub local: Arc<ModuleInventory>,
    /// `None` when the peer sent nothing readable.
    pub remote: Option<Arc<ModuleInventory>>,
}

/// Action for the host application to perform.
#[derive(Debug, Clone)]
pub enum NegotiationAction {
    /// Send the encoded inventory to the peer, ahead of any other handshake payload.
    Send(SocketAddr, Vec<u8>),
    Accept(SocketAddr),
    Reject {
        peer: SocketAddr,
        reason: RejectReason,
        report: CompatibilityReport,
    },
    PresentReport(Diagnostic),
}

#[derive(Debug, thiserror::Error)]
pub enum NegotiationError {
    #[error("no connection in progress for {0}")]
    UnknownPeer(SocketAddr),
    #[error("negotiation with {0} is already resolved")]
    AlreadyResolved(SocketAddr),
}

/// Remote inventories keyed by peer endpoint. Cloning shares the same table.
#[derive(Debug, Clone, Default)]
pub struct PeerInventories {
    inner: Arc<Mutex<HashMap<SocketAddr, Arc<ModuleInventory>>>>,
}

impl PeerInventories {
    fn lock(&self) -> MutexGuard<'_, HashMap<SocketAddr, Arc<ModuleInventory>>> {
        // Entries are plain values; a panic elsewhere cannot leave one half-written.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn insert(&self, peer: SocketAddr, inventory: Arc<ModuleInventory>) {
        self.lock().insert(peer, inventory);
    }

    pub fn get(&self, peer: &SocketAddr) -> Option<Arc<ModuleInventory>> {
        self.lock().get(peer).cloned()
    }

    pub fn remove(&self, peer: &SocketAddr) -> Option<Arc<ModuleInventory>> {
        self.lock().remove(peer)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }
}

struct Connection {
    state: NegotiationState,
    local: Arc<ModuleInventory>,
    remote: Option<Arc<ModuleInventory>>,
    report: Option<CompatibilityReport>,
}

/// Negotiation coordinator for one local peer.
///
/// A host tracks every incoming connection and keeps each participant's inventory in a
/// shared [`PeerInventories`] table. A participant has a single outgoing slot holding the
/// host's inventory for the current connection attempt.
pub struct Negotiator {
    role: Role,
    host: HostInfo,
    source: Arc<dyn ModuleSource + Send + Sync>,
    retention: RetentionPolicy,
    connections: HashMap<SocketAddr, Connection>,
    peers: PeerInventories,
    host_slot: Option<(SocketAddr, Arc<ModuleInventory>)>,
}

impl Negotiator {
    pub fn new(
        role: Role,
        host: HostInfo,
        source: impl ModuleSource + Send + Sync + 'static,
    ) -> Self {
        Self {
            role,
            host,
            source: Arc::new(source),
            retention: RetentionPolicy::default(),
            connections: HashMap::new(),
            peers: PeerInventories::default(),
            host_slot: None,
        }
    }

    pub fn set_retention(&mut self, policy: RetentionPolicy) {
        self.retention = policy;
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn is_self_on_host(&self) -> bool {
        self.role == Role::Host
    }

    /// Snapshot the local modules. Rebuilt for every connection attempt.
    pub fn local_inventory(&self) -> ModuleInventory {
        ModuleInventory::local(&self.host, self.source.as_ref())
    }

    /// Whether the host of the current session runs module `id`.
    pub fn is_module_on_host(&self, id: &str) -> bool {
        match self.role {
            Role::Host => self.local_inventory().contains(id),
            Role::Participant => self
                .host_slot
                .as_ref()
                .is_some_and(|(_, inv)| inv.contains(id)),
        }
    }

    /// Handle to the host-side per-endpoint table.
    pub fn peer_inventories(&self) -> PeerInventories {
        self.peers.clone()
    }

    /// Inventory the given peer sent, if any was received and decoded.
    pub fn remote_inventory(&self, peer: &SocketAddr) -> Option<Arc<ModuleInventory>> {
        match self.role {
            Role::Host => self.peers.get(peer),
            Role::Participant => self
                .host_slot
                .as_ref()
                .filter(|(addr, _)| addr == peer)
                .map(|(_, inv)| inv.clone()),
        }
    }

    /// Participant only: the host inventory received on the current connection attempt.
    pub fn last_host_inventory(&self) -> Option<Arc<ModuleInventory>> {
        self.host_slot.as_ref().map(|(_, inv)| inv.clone())
    }

    pub fn state(&self, peer: &SocketAddr) -> NegotiationState {
        self.connections
            .get(peer)
            .map_or(NegotiationState::Idle, |c| c.state)
    }

    /// A connection to `peer` just opened. Returns the inventory message to send first, or
    /// nothing if the local inventory is too large to encode; the peer then sees us as
    /// silent.
    pub fn on_connection_started(&mut self, peer: SocketAddr) -> Vec<NegotiationAction> {
        self.reset(&peer);
        match self.role {
            Role::Participant => self.host_slot = None,
            Role::Host => {
                self.peers.remove(&peer);
            }
        }

        let local = Arc::new(self.local_inventory());
        let encoded = codec::encode(&local);
        let local_len = local.modules().len();
        self.connections.insert(
            peer,
            Connection {
                state: NegotiationState::AwaitingRemote,
                local,
                remote: None,
                report: None,
            },
        );
        match encoded {
            Ok(pkg) => {
                tracing::debug!(
                    peer = %peer,
                    role = %self.role,
                    modules = local_len,
                    "sending module inventory"
                );
                vec![NegotiationAction::Send(peer, pkg.into_bytes())]
            }
            Err(e) => {
                tracing::warn!(peer = %peer, error = %e, "cannot send module inventory");
                Vec::new()
            }
        }
    }

    /// The peer's inventory message arrived.
    ///
    /// A message that cannot be decoded is logged and leaves the connection awaiting; the
    /// peer is then treated as silent by [`on_handshake`](Self::on_handshake).
    pub fn on_message_received(
        &mut self,
        peer: SocketAddr,
        bytes: &[u8],
    ) -> Result<Vec<NegotiationAction>, NegotiationError> {
        let conn = self
            .connections
            .get(&peer)
            .ok_or(NegotiationError::UnknownPeer(peer))?;
        if let NegotiationState::Resolved(_) = conn.state {
            return Err(NegotiationError::AlreadyResolved(peer));
        }

        let mut pkg = Package::from_bytes(bytes);
        let Some(remote) = codec::decode(&mut pkg) else {
            tracing::warn!(peer = %peer, "peer sent unreadable module inventory");
            return Ok(Vec::new());
        };
        let remote = Arc::new(remote);
        match self.role {
            Role::Host => self.peers.insert(peer, remote.clone()),
            Role::Participant => self.host_slot = Some((peer, remote.clone())),
        }

        let local = conn.local.clone();
        let report = match self.role {
            Role::Host => compat::compare(&local, &remote, Role::Host),
            Role::Participant => compat::compare(&remote, &local, Role::Host),
        };
        let verdict = if report.requires_rejection() {
            Verdict::Rejected(RejectReason::IncompatibleModules)
        } else {
            if !report.is_compatible() {
                tracing::warn!(
                    peer = %peer,
                    "non-blocking module differences:\n{}",
                    report.render()
                );
            }
            Verdict::Accepted
        };
        Ok(self.resolve(peer, verdict, Some(remote), report))
    }

    /// The rest of the handshake is about to complete. Repeats the verdict if one was
    /// reached, otherwise decides for a peer that never sent a readable inventory.
    pub fn on_handshake(
        &mut self,
        peer: SocketAddr,
    ) -> Result<Vec<NegotiationAction>, NegotiationError> {
        let conn = self
            .connections
            .get(&peer)
            .ok_or(NegotiationError::UnknownPeer(peer))?;

        if let NegotiationState::Resolved(verdict) = conn.state {
            return Ok(match (verdict, &conn.report) {
                (Verdict::Rejected(reason), Some(report)) => vec![NegotiationAction::Reject {
                    peer,
                    reason,
                    report: report.clone(),
                }],
                _ => vec![NegotiationAction::Accept(peer)],
            });
        }

        // Silent peer: anything we require it to run counts as missing.
        let required_remotely = self.role.peer();
        let findings: Vec<Finding> = conn
            .local
            .modules()
            .iter()
            .filter(|m| m.is_required_on(required_remotely))
            .map(|m| match self.role {
                Role::Host => Finding::MissingModule(m.clone()),
                Role::Participant => Finding::UnexpectedModule(m.clone()),
            })
            .collect();
        tracing::debug!(peer = %peer, required = findings.len(), "peer sent no module inventory");
        let report = CompatibilityReport::new(Role::Host, findings);
        let verdict = if report.requires_rejection() {
            Verdict::Rejected(RejectReason::MissingCompatibilityData)
        } else {
            Verdict::Accepted
        };
        Ok(self.resolve(peer, verdict, None, report))
    }

    /// The connection closed. Forgets its state; the host table entry is evicted unless
    /// the retention policy keeps it.
    pub fn on_disconnected(&mut self, peer: SocketAddr) {
        self.reset(&peer);
        match self.role {
            Role::Participant => {
                if self.host_slot.as_ref().is_some_and(|(addr, _)| *addr == peer) {
                    self.host_slot = None;
                }
            }
            Role::Host => {
                if self.retention == RetentionPolicy::EvictOnDisconnect {
                    self.peers.remove(&peer);
                }
            }
        }
    }

    fn reset(&mut self, peer: &SocketAddr) {
        if self.connections.remove(peer).is_some() {
            tracing::trace!(peer = %peer, "negotiation reset");
        }
    }

    fn resolve(
        &mut self,
        peer: SocketAddr,
        verdict: Verdict,
        remote: Option<Arc<ModuleInventory>>,
        report: CompatibilityReport,
    ) -> Vec<NegotiationAction> {
        let Some(conn) = self.connections.get_mut(&peer) else {
            return Vec::new();
        };
        conn.state = NegotiationState::Resolved(verdict);
        conn.remote = remote.clone();
        conn.report = Some(report.clone());

        match verdict {
            Verdict::Accepted => {
                tracing::debug!(peer = %peer, "module check passed");
                vec![NegotiationAction::Accept(peer)]
            }
            Verdict::Rejected(reason) => {
                tracing::info!(
                    peer = %peer,
                    ?reason,
                    findings = report.findings().len(),
                    "rejecting connection"
                );
                let diagnostic = Diagnostic {
                    peer,
                    report: report.clone(),
                    local: conn.local.clone(),
                    remote,
                };
                vec![
                    NegotiationAction::Reject {
                        peer,
                        reason,
                        report,
                    },
                    NegotiationAction::PresentReport(diagnostic),
                ]
            }
        }
    }
}
