//! Peer connector: reachability probes and session establishment with a
//! bounded reconnect budget.
//!
//! `try_reconnect` deliberately never decides failover itself: it reports
//! NODE_STATUS_DOWN after its budget is spent and leaves the decision to
//! the monitor loop.

use std::time::Duration;

use perch_common::config::DaemonConfig;
use perch_common::error::ConnectError;
use perch_common::signal::SignalState;

use crate::metadata::Session;
use crate::node::NodeStatus;

/// Opens sessions to nodes addressed by opaque conninfo strings.
pub trait Connector: Send + Sync {
    /// Cheap reachability probe. Must not leave a session open.
    fn is_available(&self, conninfo: &str) -> bool;

    /// Open a session. Transient failure here is a normal signal; callers
    /// absorb it or escalate per the monitor's rules.
    fn connect(&self, conninfo: &str) -> Result<Box<dyn Session>, ConnectError>;
}

/// Bounded retry budget for `try_reconnect`.
#[derive(Debug, Clone, Copy)]
pub struct ReconnectPolicy {
    pub max_attempts: u32,
    pub interval: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            interval: Duration::from_secs(1),
        }
    }
}

impl ReconnectPolicy {
    pub fn from_config(config: &DaemonConfig) -> Self {
        Self {
            max_attempts: config.reconnect_attempts,
            interval: config.reconnect_interval(),
        }
    }
}

/// Probe the node up to `policy.max_attempts` times, opening a session as
/// soon as a probe succeeds. Returns the live session and NODE_STATUS_UP on
/// success, or NODE_STATUS_DOWN once the budget is spent.
///
/// Sleeps between attempts go through `signals` so termination requests
/// interrupt the spin.
pub fn try_reconnect(
    connector: &dyn Connector,
    conninfo: &str,
    policy: ReconnectPolicy,
    signals: &SignalState,
) -> (Option<Box<dyn Session>>, NodeStatus) {
    for attempt in 1..=policy.max_attempts {
        tracing::info!(
            "checking state of node, {} of {} attempts",
            attempt,
            policy.max_attempts
        );
        if connector.is_available(conninfo) {
            match connector.connect(conninfo) {
                Ok(session) => {
                    tracing::info!("node has recovered, reconnected");
                    return (Some(session), NodeStatus::Up);
                }
                Err(e) => {
                    // Reachable but session denied (e.g. connection slots
                    // exhausted); keep burning attempts.
                    tracing::info!("node reachable but session not established: {}", e);
                }
            }
        }
        if signals.wait_timeout(policy.interval) {
            break;
        }
    }

    tracing::warn!(
        "unable to reconnect to node after {} attempts",
        policy.max_attempts
    );
    (None, NodeStatus::Down)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::harness::{InMemoryCluster, SimNodeSpec};
    use crate::node::NodeType;
    use perch_common::types::{Lsn, NodeId};

    fn quick_policy() -> ReconnectPolicy {
        ReconnectPolicy {
            max_attempts: 3,
            interval: Duration::from_millis(1),
        }
    }

    fn two_node_cluster() -> InMemoryCluster {
        let cluster = InMemoryCluster::new();
        cluster.add_node(SimNodeSpec {
            node_id: NodeId(1),
            name: "p0".into(),
            node_type: NodeType::Primary,
            upstream: None,
            priority: 100,
            lsn: Lsn(100),
        });
        cluster.add_node(SimNodeSpec {
            node_id: NodeId(2),
            name: "s1".into(),
            node_type: NodeType::Standby,
            upstream: Some(NodeId(1)),
            priority: 100,
            lsn: Lsn(100),
        });
        cluster
    }

    #[test]
    fn test_try_reconnect_succeeds_against_live_node() {
        let cluster = two_node_cluster();
        let connector = cluster.connector(NodeId(2));
        let signals = SignalState::new();
        let (session, status) = try_reconnect(
            &connector,
            &cluster.conninfo(NodeId(1)),
            quick_policy(),
            &signals,
        );
        assert_eq!(status, NodeStatus::Up);
        assert!(session.is_some());
    }

    #[test]
    fn test_try_reconnect_declares_down_after_budget() {
        let cluster = two_node_cluster();
        cluster.kill(NodeId(1));
        let connector = cluster.connector(NodeId(2));
        let signals = SignalState::new();
        let (session, status) = try_reconnect(
            &connector,
            &cluster.conninfo(NodeId(1)),
            quick_policy(),
            &signals,
        );
        assert_eq!(status, NodeStatus::Down);
        assert!(session.is_none());
    }

    #[test]
    fn test_try_reconnect_interrupted_by_shutdown() {
        let cluster = two_node_cluster();
        cluster.kill(NodeId(1));
        let connector = cluster.connector(NodeId(2));
        let signals = SignalState::new();
        signals.request_shutdown();
        let policy = ReconnectPolicy {
            max_attempts: 100,
            interval: Duration::from_secs(1),
        };
        let start = std::time::Instant::now();
        let (_, status) = try_reconnect(&connector, &cluster.conninfo(NodeId(1)), policy, &signals);
        assert_eq!(status, NodeStatus::Down);
        assert!(start.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn test_probe_leaves_no_session_open() {
        let cluster = two_node_cluster();
        let connector = cluster.connector(NodeId(2));
        assert!(connector.is_available(&cluster.conninfo(NodeId(1))));
        assert_eq!(cluster.open_sessions(NodeId(1)), 0);
    }
}
