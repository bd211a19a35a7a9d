//! In-process simulated cluster used by the protocol tests.
//!
//! One `InMemoryCluster` stands in for the whole fleet: the shared metadata
//! tables, per-node voting state, follow directives, and a reachability
//! matrix for partition scenarios. `connector(node)` and
//! `command_runner(node)` yield that node's view of the world, so several
//! simulated daemons can run the real election/failover code against each
//! other, including from multiple threads.

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use perch_common::error::{ConnectError, MetadataError};
use perch_common::types::{ElectoralTerm, Lsn, NodeId};

use crate::connector::Connector;
use crate::failover::CommandRunner;
use crate::metadata::{EventKind, Session, VoteReply};
use crate::node::{NodeInfo, NodeType, RecoveryType, VotingStatus};

/// Parameters for registering a simulated node.
pub struct SimNodeSpec {
    pub node_id: NodeId,
    pub name: String,
    pub node_type: NodeType,
    pub upstream: Option<NodeId>,
    pub priority: i32,
    pub lsn: Lsn,
}

struct SimNode {
    info: NodeInfo,
    up: bool,
    recovery: RecoveryType,
    lsn: Lsn,
    voting_status: VotingStatus,
    current_term: ElectoralTerm,
    follow_directive: Option<NodeId>,
}

/// An audit event captured by the simulated metadata DB.
#[derive(Debug, Clone)]
pub struct RecordedEvent {
    pub node_id: NodeId,
    pub event: EventKind,
    pub success: bool,
    pub details: String,
}

#[derive(Default)]
struct ClusterState {
    nodes: BTreeMap<NodeId, SimNode>,
    /// Directed (from, to) pairs that cannot reach each other.
    blocked: HashSet<(NodeId, NodeId)>,
    open_sessions: BTreeMap<NodeId, usize>,
    events: Vec<RecordedEvent>,
}

impl ClusterState {
    fn resolve(&self, conninfo: &str) -> Option<NodeId> {
        self.nodes
            .values()
            .find(|n| n.info.conninfo == conninfo)
            .map(|n| n.info.node_id)
    }

    fn reachable(&self, from: NodeId, to: NodeId) -> bool {
        let node = match self.nodes.get(&to) {
            Some(n) => n,
            None => return false,
        };
        node.up && !self.blocked.contains(&(from, to))
    }
}

/// Handle to the shared simulated cluster. Cheap to clone.
#[derive(Clone, Default)]
pub struct InMemoryCluster {
    state: Arc<Mutex<ClusterState>>,
}

impl InMemoryCluster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_node(&self, spec: SimNodeSpec) {
        let recovery = if spec.node_type == NodeType::Primary {
            RecoveryType::Primary
        } else {
            RecoveryType::Standby
        };
        let info = NodeInfo {
            node_id: spec.node_id,
            node_name: spec.name,
            conninfo: format!("host=node{}", spec.node_id.0),
            node_type: spec.node_type,
            upstream_node_id: spec.upstream,
            priority: spec.priority,
            active: true,
            last_wal_receive_lsn: Lsn::INVALID,
            is_visible: false,
        };
        let mut state = self.state.lock();
        state.nodes.insert(
            spec.node_id,
            SimNode {
                info,
                up: true,
                recovery,
                lsn: spec.lsn,
                voting_status: VotingStatus::NoVote,
                current_term: ElectoralTerm(0),
                follow_directive: None,
            },
        );
    }

    pub fn conninfo(&self, node_id: NodeId) -> String {
        self.state.lock().nodes[&node_id].info.conninfo.clone()
    }

    pub fn connector(&self, from: NodeId) -> SimConnector {
        SimConnector {
            cluster: self.clone(),
            from,
        }
    }

    pub fn command_runner(&self, node_id: NodeId) -> SimCommandRunner {
        SimCommandRunner {
            cluster: self.clone(),
            node_id,
            fail_promote: Arc::new(AtomicBool::new(false)),
            fail_follow: Arc::new(AtomicBool::new(false)),
        }
    }

    // ── Fault injection ────────────────────────────────────────────────────

    pub fn kill(&self, node_id: NodeId) {
        self.state.lock().nodes.get_mut(&node_id).unwrap().up = false;
    }

    pub fn restore(&self, node_id: NodeId) {
        self.state.lock().nodes.get_mut(&node_id).unwrap().up = true;
    }

    /// Block traffic in both directions between `a` and `b`.
    pub fn partition(&self, a: NodeId, b: NodeId) {
        let mut state = self.state.lock();
        state.blocked.insert((a, b));
        state.blocked.insert((b, a));
    }

    pub fn heal_partition(&self, a: NodeId, b: NodeId) {
        let mut state = self.state.lock();
        state.blocked.remove(&(a, b));
        state.blocked.remove(&(b, a));
    }

    pub fn set_lsn(&self, node_id: NodeId, lsn: Lsn) {
        self.state.lock().nodes.get_mut(&node_id).unwrap().lsn = lsn;
    }

    // ── Inspection ─────────────────────────────────────────────────────────

    pub fn open_sessions(&self, node_id: NodeId) -> usize {
        *self
            .state
            .lock()
            .open_sessions
            .get(&node_id)
            .unwrap_or(&0)
    }

    pub fn total_open_sessions(&self) -> usize {
        self.state.lock().open_sessions.values().sum()
    }

    pub fn node_type(&self, node_id: NodeId) -> NodeType {
        self.state.lock().nodes[&node_id].info.node_type
    }

    pub fn upstream(&self, node_id: NodeId) -> Option<NodeId> {
        self.state.lock().nodes[&node_id].info.upstream_node_id
    }

    pub fn voting_status(&self, node_id: NodeId) -> VotingStatus {
        self.state.lock().nodes[&node_id].voting_status
    }

    pub fn follow_directive(&self, node_id: NodeId) -> Option<NodeId> {
        self.state.lock().nodes[&node_id].follow_directive
    }

    pub fn events(&self) -> Vec<RecordedEvent> {
        self.state.lock().events.clone()
    }

    // ── Direct state manipulation for corner-case scenarios ────────────────

    /// Force a node into VOTE_INITIATED with a fresh term, as if it had
    /// claimed candidacy out-of-band.
    pub fn force_initiate(&self, node_id: NodeId) -> ElectoralTerm {
        let mut state = self.state.lock();
        let node = state.nodes.get_mut(&node_id).unwrap();
        node.current_term = node.current_term.next();
        node.voting_status = VotingStatus::VoteInitiated;
        node.current_term
    }

    // ── Operator-command effects ───────────────────────────────────────────

    /// Effect of the promote command on `node_id`. Refuses (non-zero exit)
    /// when the node's recorded upstream is reachable and still reports
    /// itself primary, matching the guard real promote tooling applies.
    fn apply_promote(&self, node_id: NodeId) -> i32 {
        let mut state = self.state.lock();
        let upstream = state.nodes[&node_id].info.upstream_node_id;
        if let Some(upstream_id) = upstream {
            let upstream_is_primary = state
                .nodes
                .get(&upstream_id)
                .map(|n| n.up && n.recovery == RecoveryType::Primary)
                .unwrap_or(false);
            if upstream_is_primary && state.reachable(node_id, upstream_id) {
                return 1;
            }
            if let Some(old) = state.nodes.get_mut(&upstream_id) {
                old.info.active = false;
            }
        }
        let node = state.nodes.get_mut(&node_id).unwrap();
        node.recovery = RecoveryType::Primary;
        node.info.node_type = NodeType::Primary;
        node.info.upstream_node_id = None;
        0
    }

    /// Effect of the follow command: repoint `node_id` at `target`.
    fn apply_follow(&self, node_id: NodeId, target: NodeId) -> i32 {
        let mut state = self.state.lock();
        if !state.nodes.contains_key(&target) {
            return 1;
        }
        let node = state.nodes.get_mut(&node_id).unwrap();
        node.info.upstream_node_id = Some(target);
        0
    }
}

// ───────────────────────────────────────────────────────────────────────────
// Connector / Session implementations
// ───────────────────────────────────────────────────────────────────────────

/// A node's network viewpoint on the simulated cluster.
pub struct SimConnector {
    cluster: InMemoryCluster,
    from: NodeId,
}

impl Connector for SimConnector {
    fn is_available(&self, conninfo: &str) -> bool {
        let state = self.cluster.state.lock();
        match state.resolve(conninfo) {
            Some(target) => state.reachable(self.from, target),
            None => false,
        }
    }

    fn connect(&self, conninfo: &str) -> Result<Box<dyn Session>, ConnectError> {
        let mut state = self.cluster.state.lock();
        let target = state
            .resolve(conninfo)
            .ok_or_else(|| ConnectError::BadConninfo {
                conninfo: conninfo.to_string(),
                message: "no such node".into(),
            })?;
        if !state.reachable(self.from, target) {
            return Err(ConnectError::Unreachable {
                conninfo: conninfo.to_string(),
                message: "node down or partitioned".into(),
            });
        }
        *state.open_sessions.entry(target).or_insert(0) += 1;
        drop(state);
        Ok(Box::new(SimSession {
            cluster: self.cluster.clone(),
            from: self.from,
            target,
        }))
    }
}

struct SimSession {
    cluster: InMemoryCluster,
    from: NodeId,
    target: NodeId,
}

impl SimSession {
    /// Run `f` against the target node, failing like a dropped connection
    /// when the target died or was partitioned away mid-session.
    fn with_node<T>(
        &mut self,
        f: impl FnOnce(&mut SimNode) -> T,
    ) -> Result<T, MetadataError> {
        let mut state = self.cluster.state.lock();
        if !state.reachable(self.from, self.target) {
            return Err(MetadataError::SessionLost(format!(
                "{} unreachable",
                self.target
            )));
        }
        let node = state
            .nodes
            .get_mut(&self.target)
            .ok_or(MetadataError::NodeNotFound(self.target))?;
        Ok(f(node))
    }
}

impl Drop for SimSession {
    fn drop(&mut self) {
        let mut state = self.cluster.state.lock();
        if let Some(count) = state.open_sessions.get_mut(&self.target) {
            *count = count.saturating_sub(1);
        }
    }
}

impl Session for SimSession {
    fn ping(&mut self) -> bool {
        let state = self.cluster.state.lock();
        state.reachable(self.from, self.target)
    }

    fn node_record(&mut self, node_id: NodeId) -> Result<Option<NodeInfo>, MetadataError> {
        let mut state = self.cluster.state.lock();
        if !state.reachable(self.from, self.target) {
            return Err(MetadataError::SessionLost(format!(
                "{} unreachable",
                self.target
            )));
        }
        Ok(state.nodes.get_mut(&node_id).map(|n| {
            let mut info = n.info.clone();
            info.reset_transients();
            info
        }))
    }

    fn node_records(&mut self) -> Result<Vec<NodeInfo>, MetadataError> {
        let state = self.cluster.state.lock();
        if !state.reachable(self.from, self.target) {
            return Err(MetadataError::SessionLost(format!(
                "{} unreachable",
                self.target
            )));
        }
        Ok(state
            .nodes
            .values()
            .map(|n| {
                let mut info = n.info.clone();
                info.reset_transients();
                info
            })
            .collect())
    }

    fn active_sibling_records(
        &mut self,
        self_id: NodeId,
        upstream_id: NodeId,
    ) -> Result<Vec<NodeInfo>, MetadataError> {
        Ok(self
            .node_records()?
            .into_iter()
            .filter(|n| {
                n.active && n.node_id != self_id && n.upstream_node_id == Some(upstream_id)
            })
            .collect())
    }

    fn voting_status(&mut self) -> Result<VotingStatus, MetadataError> {
        self.with_node(|n| n.voting_status)
    }

    fn initiate_voting(&mut self) -> Result<ElectoralTerm, MetadataError> {
        self.with_node(|n| {
            n.current_term = n.current_term.next();
            n.voting_status = VotingStatus::VoteInitiated;
            n.current_term
        })
    }

    fn reset_voting_status(&mut self) -> Result<(), MetadataError> {
        self.with_node(|n| {
            n.voting_status = VotingStatus::NoVote;
            n.follow_directive = None;
        })
    }

    fn last_wal_receive_lsn(&mut self) -> Result<Lsn, MetadataError> {
        self.with_node(|n| n.lsn)
    }

    fn recovery_type(&mut self) -> Result<RecoveryType, MetadataError> {
        self.with_node(|n| n.recovery)
    }

    fn announce_candidature(
        &mut self,
        _candidate: &NodeInfo,
        term: ElectoralTerm,
    ) -> Result<bool, MetadataError> {
        self.with_node(|n| {
            if n.voting_status == VotingStatus::VoteInitiated && n.current_term >= term {
                false
            } else {
                n.voting_status = VotingStatus::VoteRequestReceived;
                true
            }
        })
    }

    fn request_vote(
        &mut self,
        _candidate: &NodeInfo,
        candidate_lsn: Lsn,
        _term: ElectoralTerm,
    ) -> Result<VoteReply, MetadataError> {
        self.with_node(|n| VoteReply {
            granted: n.voting_status != VotingStatus::VoteInitiated && candidate_lsn >= n.lsn,
            last_wal_receive_lsn: n.lsn,
        })
    }

    fn notify_follow_primary(&mut self, new_primary: NodeId) -> Result<(), MetadataError> {
        self.with_node(|n| {
            n.follow_directive = Some(new_primary);
        })
    }

    fn new_primary(&mut self) -> Result<Option<NodeId>, MetadataError> {
        self.with_node(|n| n.follow_directive.take())
    }

    fn record_event(
        &mut self,
        node_id: NodeId,
        event: EventKind,
        success: bool,
        details: &str,
    ) -> Result<(), MetadataError> {
        let mut state = self.cluster.state.lock();
        state.events.push(RecordedEvent {
            node_id,
            event,
            success,
            details: details.to_string(),
        });
        Ok(())
    }
}

// ───────────────────────────────────────────────────────────────────────────
// Command runner
// ───────────────────────────────────────────────────────────────────────────

/// Interprets the literal commands "promote" and "follow <id>" against the
/// simulated cluster, standing in for the operator's shell commands.
#[derive(Clone)]
pub struct SimCommandRunner {
    cluster: InMemoryCluster,
    node_id: NodeId,
    fail_promote: Arc<AtomicBool>,
    fail_follow: Arc<AtomicBool>,
}

impl SimCommandRunner {
    /// Make subsequent promote commands exit non-zero without effect.
    pub fn fail_promote(&self, fail: bool) {
        self.fail_promote.store(fail, Ordering::SeqCst);
    }

    /// Make subsequent follow commands exit non-zero without effect.
    pub fn fail_follow(&self, fail: bool) {
        self.fail_follow.store(fail, Ordering::SeqCst);
    }
}

impl CommandRunner for SimCommandRunner {
    fn run(&self, command: &str) -> i32 {
        let mut parts = command.split_whitespace();
        match parts.next() {
            Some("promote") => {
                if self.fail_promote.load(Ordering::SeqCst) {
                    return 1;
                }
                self.cluster.apply_promote(self.node_id)
            }
            Some("follow") => {
                if self.fail_follow.load(Ordering::SeqCst) {
                    return 1;
                }
                match parts.next().and_then(|s| s.parse::<i32>().ok()) {
                    Some(id) => self.cluster.apply_follow(self.node_id, NodeId(id)),
                    None => 2,
                }
            }
            _ => 127,
        }
    }
}
