//! Metadata client surface: the operations the daemon performs against one
//! open session to a node's DB.
//!
//! Everything the failover protocol persists (node records, voting status,
//! follow directives, event records) lives behind this trait. The
//! vote-request / candidacy-announcement / follow-notification calls are
//! each a single round-trip against the *peer's* session.

use perch_common::error::MetadataError;
use perch_common::types::{ElectoralTerm, Lsn, NodeId};

use crate::connector::Connector;
use crate::node::{NodeInfo, RecoveryType, VotingStatus};

/// Reply to a vote request: whether the peer granted us its vote, and the
/// peer's own replication position so the candidate can learn whether
/// anyone visible is ahead.
#[derive(Debug, Clone, Copy)]
pub struct VoteReply {
    pub granted: bool,
    pub last_wal_receive_lsn: Lsn,
}

/// Tags for the operator audit trail written to the metadata DB.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Start,
    LocalDisconnect,
    LocalReconnect,
    FailoverPromote,
    FailoverAbort,
    FailoverFollow,
}

impl EventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::Start => "perchd_start",
            EventKind::LocalDisconnect => "perchd_local_disconnect",
            EventKind::LocalReconnect => "perchd_local_reconnect",
            EventKind::FailoverPromote => "perchd_failover_promote",
            EventKind::FailoverAbort => "perchd_failover_abort",
            EventKind::FailoverFollow => "perchd_failover_follow",
        }
    }
}

/// One open session to a node's DB. Operations apply to the node the
/// session is connected to. Dropping the session releases the connection;
/// every acquisition is scoped to the round that opened it.
pub trait Session: Send {
    /// Cheap liveness check on this session.
    fn ping(&mut self) -> bool;

    /// Fetch one node record; `Ok(None)` when no record exists.
    fn node_record(&mut self, node_id: NodeId) -> Result<Option<NodeInfo>, MetadataError>;

    /// Fetch every node record in the cluster metadata.
    fn node_records(&mut self) -> Result<Vec<NodeInfo>, MetadataError>;

    /// All `active = true` nodes replicating from `upstream_id`, excluding
    /// `self_id`. This is the sibling set an election runs against.
    fn active_sibling_records(
        &mut self,
        self_id: NodeId,
        upstream_id: NodeId,
    ) -> Result<Vec<NodeInfo>, MetadataError>;

    fn voting_status(&mut self) -> Result<VotingStatus, MetadataError>;

    /// Transition NO_VOTE → VOTE_INITIATED, allocating a fresh electoral
    /// term for this candidacy.
    fn initiate_voting(&mut self) -> Result<ElectoralTerm, MetadataError>;

    /// Reset the voting flag to NO_VOTE and discard any unconsumed follow
    /// directive. Called at the top of every monitoring iteration and on
    /// every non-winning election exit.
    fn reset_voting_status(&mut self) -> Result<(), MetadataError>;

    fn last_wal_receive_lsn(&mut self) -> Result<Lsn, MetadataError>;

    fn recovery_type(&mut self) -> Result<RecoveryType, MetadataError>;

    /// Tell the peer we are a candidate for `term`. Returns `false` iff the
    /// peer has itself initiated a vote with a term at least as new, in
    /// which case both candidacies are expected to yield on contact.
    fn announce_candidature(
        &mut self,
        candidate: &NodeInfo,
        term: ElectoralTerm,
    ) -> Result<bool, MetadataError>;

    /// Ask the peer for its vote for `term`.
    fn request_vote(
        &mut self,
        candidate: &NodeInfo,
        candidate_lsn: Lsn,
        term: ElectoralTerm,
    ) -> Result<VoteReply, MetadataError>;

    /// Write the follow directive into the peer's metadata; the peer's
    /// monitor loop picks it up through `new_primary`. Idempotent for a
    /// given target.
    fn notify_follow_primary(&mut self, new_primary: NodeId) -> Result<(), MetadataError>;

    /// Poll (and consume) the local follow directive set by some
    /// candidate's `notify_follow_primary`.
    fn new_primary(&mut self) -> Result<Option<NodeId>, MetadataError>;

    /// Append an audit event row. Best-effort; callers tolerate failure.
    fn record_event(
        &mut self,
        node_id: NodeId,
        event: EventKind,
        success: bool,
        details: &str,
    ) -> Result<(), MetadataError>;
}

/// Locate whichever node currently reports itself primary: scan the node
/// records visible through `local`, open a session to each candidate and
/// ask for its recovery state. Used to detect a resurrected old primary.
pub fn find_primary(
    connector: &dyn Connector,
    local: &mut dyn Session,
) -> Result<Option<(Box<dyn Session>, NodeId)>, MetadataError> {
    for record in local.node_records()? {
        if !record.active {
            continue;
        }
        let mut session = match connector.connect(&record.conninfo) {
            Ok(session) => session,
            Err(_) => continue,
        };
        match session.recovery_type() {
            Ok(RecoveryType::Primary) => return Ok(Some((session, record.node_id))),
            Ok(RecoveryType::Standby) | Err(_) => continue,
        }
    }
    Ok(None)
}
