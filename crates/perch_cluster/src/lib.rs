//! Cluster monitoring and failover orchestration for the perch replication
//! manager: node model, peer connector, metadata session surface, the
//! leader-election protocol, the failover state machine, and the per-role
//! monitor loops that tie them together.

pub mod connector;
pub mod context;
pub mod election;
pub mod failover;
pub mod harness;
pub mod metadata;
pub mod monitor;
pub mod node;

pub use connector::{try_reconnect, Connector, ReconnectPolicy};
pub use context::DaemonContext;
pub use election::{poll_best_candidate, run_election, ElectionOutcome};
pub use failover::{
    follow_new_primary, notify_followers, promote_self, run_failover, wait_primary_notification,
    CommandRunner, ShellRunner,
};
pub use metadata::{find_primary, EventKind, Session, VoteReply};
pub use monitor::Monitor;
pub use node::{
    ElectionResult, FailoverState, NodeInfo, NodeStatus, NodeType, RecoveryType, VotingStatus,
};
