//! Leader election among sibling standbys, run when the upstream has been
//! declared down.
//!
//! The protocol is deliberately conservative: a candidate needs a vote from
//! *every* peer it could reach (unanimity among the visible set), two
//! candidates that meet both yield, and a node that knows a peer is ahead
//! of it withholds its own vote. Decorrelation between standbys that
//! noticed the failure simultaneously comes from a short random jitter
//! before candidacy is claimed.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;

use perch_common::error::{PerchError, PerchResult};
use perch_common::types::{ElectoralTerm, NodeId};

use crate::context::DaemonContext;
use crate::metadata::Session;
use crate::node::{ElectionResult, NodeInfo, VotingStatus};

/// Everything a failover round needs from a finished election: the verdict,
/// the term the candidacy ran under, and the sibling set with the
/// visibility flags and replication positions learned during voting.
#[derive(Debug)]
pub struct ElectionOutcome {
    pub result: ElectionResult,
    pub term: Option<ElectoralTerm>,
    pub siblings: Vec<NodeInfo>,
    pub votes_for_me: u32,
    pub visible_nodes: u32,
}

impl ElectionOutcome {
    fn not_candidate(term: Option<ElectoralTerm>, siblings: Vec<NodeInfo>) -> Self {
        Self {
            result: ElectionResult::NotCandidate,
            term,
            siblings,
            votes_for_me: 0,
            visible_nodes: 1,
        }
    }
}

/// Run one election round. Peer-level failures (unreachable sibling, lost
/// vote round-trip) are absorbed: the peer is simply not counted visible.
/// Local-session failures propagate; without our own DB we have no
/// standing to elect anything.
pub fn run_election(ctx: &mut DaemonContext) -> PerchResult<ElectionOutcome> {
    let connector = Arc::clone(&ctx.connector);
    let self_id = ctx.local_node.node_id;
    let upstream_id = ctx
        .upstream_node
        .as_ref()
        .map(|u| u.node_id)
        .ok_or_else(|| PerchError::Internal("election without an upstream record".into()))?;

    // Decorrelate peers that detected the failure in the same tick.
    let jitter = Duration::from_millis(rand::thread_rng().gen_range(100..=500));
    tracing::debug!("election: sleeping {:?} before claiming candidacy", jitter);
    if ctx.signals.wait_timeout(jitter) {
        return Ok(ElectionOutcome::not_candidate(None, Vec::new()));
    }

    ctx.local_node.reset_transients();
    let mut candidate = ctx.local_node.clone();

    let local = ctx
        .local_session
        .as_deref_mut()
        .ok_or_else(|| PerchError::Internal("election without a local session".into()))?;

    metrics::counter!("perchd_elections_total").increment(1);

    // Another candidate reached our node first: we are a voter this round.
    let voting_status = local.voting_status()?;
    tracing::debug!("election: voting status is {}", voting_status);
    if voting_status == VotingStatus::VoteRequestReceived {
        tracing::info!("vote request already received, not standing as candidate");
        return Ok(ElectionOutcome::not_candidate(None, Vec::new()));
    }

    // Claim candidacy. Any vote request arriving at our node from here on
    // is rejected; a concurrent candidate is detected in the announce loop.
    let term = local.initiate_voting()?;
    tracing::debug!("election: candidacy claimed for {}", term);

    let mut siblings = local.active_sibling_records(self_id, upstream_id)?;
    for sibling in &mut siblings {
        sibling.reset_transients();
    }

    if siblings.is_empty() {
        tracing::info!("no other standbys attached to the failed upstream, winning by default");
        return Ok(ElectionOutcome {
            result: ElectionResult::Won,
            term: Some(term),
            siblings,
            votes_for_me: 1,
            visible_nodes: 1,
        });
    }

    // Announce candidacy to every sibling we can reach. A refusal means a
    // peer with an equal-or-newer candidacy exists; yielding on first
    // contact keeps two concurrent candidacies from both surviving.
    let mut peer_sessions: Vec<Option<Box<dyn Session>>> = Vec::with_capacity(siblings.len());
    let mut visible_nodes: u32 = 1; // we count ourselves
    let mut refused_by: Option<NodeId> = None;

    for sibling in &mut siblings {
        let mut session = match connector.connect(&sibling.conninfo) {
            Ok(session) => session,
            Err(e) => {
                tracing::debug!("sibling {} not reachable: {}", sibling.node_id, e);
                peer_sessions.push(None);
                continue;
            }
        };
        match session.announce_candidature(&candidate, term) {
            Ok(true) => {
                sibling.is_visible = true;
                visible_nodes += 1;
                peer_sessions.push(Some(session));
            }
            Ok(false) => {
                refused_by = Some(sibling.node_id);
                break;
            }
            Err(e) => {
                tracing::debug!(
                    "candidacy announcement to {} failed: {}",
                    sibling.node_id,
                    e
                );
                peer_sessions.push(None);
            }
        }
    }

    if let Some(peer) = refused_by {
        // Clear the sibling list along with the sessions; a withdrawn
        // candidate learns whom to follow from the winner's notification,
        // not from this round's partial view.
        drop(peer_sessions);
        drop(siblings);
        tracing::info!("{} is already a candidate, withdrawing own candidacy", peer);
        withdraw(local, term);
        metrics::counter!("perchd_elections_withdrawn_total").increment(1);
        return Ok(ElectionOutcome::not_candidate(Some(term), Vec::new()));
    }

    let own_lsn = local.last_wal_receive_lsn()?;
    candidate.last_wal_receive_lsn = own_lsn;
    tracing::debug!("election: own receive position is {}", own_lsn);

    // Collect votes from the visible set, learning each peer's replication
    // position along the way.
    let mut votes_for_me: u32 = 0;
    let mut other_node_is_ahead = false;

    for (sibling, session) in siblings.iter_mut().zip(peer_sessions.iter_mut()) {
        if !sibling.is_visible {
            continue;
        }
        let session = match session.as_deref_mut() {
            Some(session) => session,
            None => continue,
        };
        match session.request_vote(&candidate, own_lsn, term) {
            Ok(reply) => {
                if reply.granted {
                    votes_for_me += 1;
                }
                sibling.last_wal_receive_lsn = reply.last_wal_receive_lsn;
                if reply.last_wal_receive_lsn > own_lsn {
                    other_node_is_ahead = true;
                }
            }
            Err(e) => {
                tracing::debug!("vote request to {} failed: {}", sibling.node_id, e);
            }
        }
    }
    drop(peer_sessions);

    // Vote for ourselves only if nobody visible is ahead of us.
    if !other_node_is_ahead {
        votes_for_me += 1;
    }

    tracing::info!("{} of {} votes", votes_for_me, visible_nodes);

    let known_nodes = siblings.len() as u32 + 1;
    if visible_nodes * 2 <= known_nodes {
        tracing::warn!(
            "only {} of {} known nodes visible; proceeding without a majority",
            visible_nodes,
            known_nodes
        );
    }

    ctx.local_node.last_wal_receive_lsn = own_lsn;

    let result = if votes_for_me == visible_nodes {
        metrics::counter!("perchd_elections_won_total").increment(1);
        ElectionResult::Won
    } else {
        metrics::counter!("perchd_elections_lost_total").increment(1);
        withdraw(local, term);
        ElectionResult::Lost
    };

    Ok(ElectionOutcome {
        result,
        term: Some(term),
        siblings,
        votes_for_me,
        visible_nodes,
    })
}

/// Undo our VOTE_INITIATED claim on a non-winning exit so we can still
/// grant a vote to whichever candidate carries this round.
fn withdraw(local: &mut dyn Session, term: ElectoralTerm) {
    if let Err(e) = local.reset_voting_status() {
        tracing::warn!("unable to withdraw candidacy for {}: {}", term, e);
    }
}

/// Rank the failed upstream's orphaned standbys and pick the one every node
/// should converge on: highest replication position, then highest priority,
/// then lowest node ID. `local` seeds the comparison so a fully symmetric
/// tie resolves in our own favor.
///
/// All inputs must come from the same election round; positions from
/// different terms are never comparable.
pub fn poll_best_candidate<'a>(local: &'a NodeInfo, siblings: &'a [NodeInfo]) -> &'a NodeInfo {
    let mut best = local;
    for node in siblings {
        if is_better_candidate(node, best) {
            tracing::debug!("{} is now best candidate", node.node_id);
            best = node;
        }
    }
    tracing::info!("best candidate is {}", best.node_id);
    best
}

fn is_better_candidate(node: &NodeInfo, best: &NodeInfo) -> bool {
    let key = |n: &NodeInfo| (n.last_wal_receive_lsn, n.priority, std::cmp::Reverse(n.node_id));
    key(node) > key(best)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::NodeType;
    use perch_common::types::Lsn;

    fn standby(id: i32, priority: i32, lsn: u64) -> NodeInfo {
        NodeInfo {
            node_id: NodeId(id),
            node_name: format!("s{id}"),
            conninfo: format!("host=node{id}"),
            node_type: NodeType::Standby,
            upstream_node_id: Some(NodeId(1)),
            priority,
            active: true,
            last_wal_receive_lsn: Lsn(lsn),
            is_visible: true,
        }
    }

    #[test]
    fn test_best_candidate_prefers_highest_lsn_over_priority() {
        let local = standby(2, 80, 100);
        let siblings = vec![standby(3, 100, 101), standby(4, 90, 100)];
        assert_eq!(poll_best_candidate(&local, &siblings).node_id, NodeId(3));
    }

    #[test]
    fn test_best_candidate_breaks_lsn_tie_by_priority() {
        let local = standby(2, 100, 100);
        let siblings = vec![standby(3, 90, 100), standby(4, 80, 100)];
        assert_eq!(poll_best_candidate(&local, &siblings).node_id, NodeId(2));
    }

    #[test]
    fn test_best_candidate_breaks_full_tie_by_lowest_node_id() {
        let local = standby(4, 100, 100);
        let siblings = vec![standby(2, 100, 100), standby(3, 100, 100)];
        assert_eq!(poll_best_candidate(&local, &siblings).node_id, NodeId(2));
    }

    #[test]
    fn test_best_candidate_is_deterministic_across_viewpoints() {
        // Every node ranking the same records must land on the same winner.
        let nodes = [standby(2, 80, 100), standby(3, 100, 101), standby(4, 90, 100)];
        for (i, local) in nodes.iter().enumerate() {
            let siblings: Vec<NodeInfo> = nodes
                .iter()
                .enumerate()
                .filter(|(j, _)| *j != i)
                .map(|(_, n)| n.clone())
                .collect();
            assert_eq!(
                poll_best_candidate(local, &siblings).node_id,
                NodeId(3),
                "viewpoint of {}",
                local.node_id
            );
        }
    }

    #[test]
    fn test_lone_symmetric_tie_resolves_to_self() {
        let local = standby(2, 100, 100);
        assert_eq!(poll_best_candidate(&local, &[]).node_id, NodeId(2));
    }
}
