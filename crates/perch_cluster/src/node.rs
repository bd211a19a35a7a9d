//! Cluster node model: the value records and state enums the monitor,
//! election, and failover machinery exchange.

use std::fmt;

use serde::{Deserialize, Serialize};

use perch_common::types::{Lsn, NodeId};

/// Role a node plays in the replication topology.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeType {
    Primary,
    Standby,
    Witness,
    Bdr,
    Unknown,
}

impl NodeType {
    /// Parse the form stored in the metadata table.
    pub fn parse(s: &str) -> NodeType {
        match s.to_ascii_lowercase().as_str() {
            "primary" => NodeType::Primary,
            "standby" => NodeType::Standby,
            "witness" => NodeType::Witness,
            "bdr" => NodeType::Bdr,
            _ => NodeType::Unknown,
        }
    }
}

impl fmt::Display for NodeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeType::Primary => write!(f, "primary"),
            NodeType::Standby => write!(f, "standby"),
            NodeType::Witness => write!(f, "witness"),
            NodeType::Bdr => write!(f, "bdr"),
            NodeType::Unknown => write!(f, "unknown"),
        }
    }
}

/// Record of a cluster member as held in the metadata DB, plus the
/// election-transient fields populated while a failover round is running.
///
/// Peer sessions are deliberately NOT part of this record: a session is a
/// separate scoped resource owned by the round that opened it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeInfo {
    pub node_id: NodeId,
    pub node_name: String,
    pub conninfo: String,
    pub node_type: NodeType,
    /// The node this one replicates from; `None` for the primary.
    pub upstream_node_id: Option<NodeId>,
    /// Higher is preferred in election tie-breaks.
    pub priority: i32,
    /// Inactive nodes are never failover candidates.
    pub active: bool,

    /// Replication position learned during the current election round.
    #[serde(default)]
    pub last_wal_receive_lsn: Lsn,
    /// Whether we reached this peer during the current election round.
    #[serde(default)]
    pub is_visible: bool,
}

impl NodeInfo {
    /// A record with election-transient fields cleared, used when entering
    /// a fresh round.
    pub fn reset_transients(&mut self) {
        self.last_wal_receive_lsn = Lsn::INVALID;
        self.is_visible = false;
    }
}

/// Reachability verdict for a node, as established by the peer connector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeStatus {
    Unknown,
    Up,
    Down,
}

/// Recovery state a live instance reports about itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryType {
    Primary,
    Standby,
}

/// Per-node voting flag persisted in the DB. Acts as a mutex between the
/// candidate and voter roles: a node that has received a vote request
/// cannot become a candidate, and a node that has initiated cannot vote
/// for another candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VotingStatus {
    #[default]
    NoVote,
    VoteRequestReceived,
    VoteInitiated,
    Unknown,
}

impl fmt::Display for VotingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VotingStatus::NoVote => write!(f, "NO VOTE"),
            VotingStatus::VoteRequestReceived => write!(f, "VOTE REQUEST RECEIVED"),
            VotingStatus::VoteInitiated => write!(f, "VOTE INITIATED"),
            VotingStatus::Unknown => write!(f, "UNKNOWN"),
        }
    }
}

/// Outcome of one election round run by a standby whose upstream is down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElectionResult {
    Won,
    Lost,
    NotCandidate,
}

impl fmt::Display for ElectionResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ElectionResult::Won => write!(f, "WON"),
            ElectionResult::Lost => write!(f, "LOST"),
            ElectionResult::NotCandidate => write!(f, "NOT CANDIDATE"),
        }
    }
}

/// Progress of the failover orchestrator. Terminal values are interpreted
/// by the monitor loop, which decides whether to switch roles, resume, or
/// retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailoverState {
    None,
    Promoted,
    PromotionFailed,
    PrimaryReappeared,
    LocalNodeFailure,
    WaitingNewPrimary,
    FollowedNewPrimary,
    FollowingOriginalPrimary,
    NoNewPrimary,
    FollowFail,
    NodeNotificationError,
    Unknown,
}

impl fmt::Display for FailoverState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FailoverState::None => "NONE",
            FailoverState::Promoted => "PROMOTED",
            FailoverState::PromotionFailed => "PROMOTION_FAILED",
            FailoverState::PrimaryReappeared => "PRIMARY_REAPPEARED",
            FailoverState::LocalNodeFailure => "LOCAL_NODE_FAILURE",
            FailoverState::WaitingNewPrimary => "WAITING_NEW_PRIMARY",
            FailoverState::FollowedNewPrimary => "FOLLOWED_NEW_PRIMARY",
            FailoverState::FollowingOriginalPrimary => "FOLLOWING_ORIGINAL_PRIMARY",
            FailoverState::NoNewPrimary => "NO_NEW_PRIMARY",
            FailoverState::FollowFail => "FOLLOW_FAIL",
            FailoverState::NodeNotificationError => "NODE_NOTIFICATION_ERROR",
            FailoverState::Unknown => "UNKNOWN",
        };
        write!(f, "{name}")
    }
}
