//! Failover orchestration: everything that happens between an election
//! verdict and a terminal `FailoverState`.
//!
//! The promote and follow commands are operator-supplied shell commands:
//! fire-and-forget child processes whose exit status is the only thing we
//! interpret. Once started they cannot be rolled back, so every path out of
//! here reports a terminal state the monitor loop can act on instead of an
//! error the caller might be tempted to retry.

use std::sync::Arc;
use std::time::Duration;

use perch_common::types::NodeId;

use crate::context::DaemonContext;
use crate::election::{poll_best_candidate, ElectionOutcome};
use crate::metadata::{find_primary, EventKind};
use crate::node::{ElectionResult, FailoverState, NodeInfo, RecoveryType};

/// Runs one operator command to completion and reports its exit code.
/// Output is never parsed; the command is opaque.
pub trait CommandRunner: Send + Sync {
    fn run(&self, command: &str) -> i32;
}

/// Production runner: hand the command line to the shell.
pub struct ShellRunner;

impl CommandRunner for ShellRunner {
    fn run(&self, command: &str) -> i32 {
        tracing::debug!("executing command:\n  \"{}\"", command);
        match std::process::Command::new("sh").arg("-c").arg(command).status() {
            Ok(status) => status.code().unwrap_or(-1),
            Err(e) => {
                tracing::error!("unable to execute \"{}\": {}", command, e);
                -1
            }
        }
    }
}

/// Substitute `%n` in the follow command with the new primary's node ID.
pub fn render_follow_command(template: &str, new_primary: NodeId) -> String {
    template.replace("%n", &new_primary.0.to_string())
}

/// Drive the election verdict through to a terminal failover state.
pub fn run_failover(ctx: &mut DaemonContext, outcome: &ElectionOutcome) -> FailoverState {
    let mut state = match outcome.result {
        ElectionResult::Won => {
            tracing::info!("this node won the election, promoting self and informing siblings");
            promote_self(ctx)
        }
        ElectionResult::Lost => {
            tracing::info!("election lost without unanimity, determining the best candidate");
            let best = poll_best_candidate(&ctx.local_node, &outcome.siblings);
            let best_id = best.node_id;
            let best_conninfo = best.conninfo.clone();

            if best_id == ctx.local_node.node_id {
                // Tie-break resolved in our favor even though a peer
                // withheld its vote.
                tracing::info!("this node is the best candidate, promoting self");
                promote_self(ctx)
            } else {
                tracing::info!(
                    "{} is the best candidate, notifying it and waiting to follow",
                    best_id
                );
                match ctx.connector.connect(&best_conninfo) {
                    Ok(mut session) => match session.notify_follow_primary(best_id) {
                        Ok(()) => FailoverState::WaitingNewPrimary,
                        Err(e) => {
                            tracing::error!("unable to notify candidate {}: {}", best_id, e);
                            FailoverState::NodeNotificationError
                        }
                    },
                    Err(e) => {
                        tracing::error!("unable to connect to candidate {}: {}", best_id, e);
                        FailoverState::NodeNotificationError
                    }
                }
            }
        }
        ElectionResult::NotCandidate => {
            tracing::info!("follower node awaiting notification from the candidate");
            FailoverState::WaitingNewPrimary
        }
    };

    // We have resolved to follow; wait for the winner to tell us whom.
    if state == FailoverState::WaitingNewPrimary {
        let failed_primary_id = ctx.upstream_node.as_ref().map(|u| u.node_id);
        state = match wait_primary_notification(ctx) {
            Some(id) if Some(id) == failed_primary_id => {
                // Original came back; nothing to do but resume monitoring it.
                FailoverState::FollowingOriginalPrimary
            }
            Some(id) if id == ctx.local_node.node_id => {
                // The winner declined and delegated promotion to us.
                tracing::info!("this node is the delegated promotion candidate, promoting");
                promote_self(ctx)
            }
            Some(id) => follow_new_primary(ctx, id),
            None => FailoverState::NoNewPrimary,
        };
    }

    metrics::counter!("perchd_failover_total", "state" => state.to_string()).increment(1);
    state
}

/// Promote the local node. The operator command does the actual promotion
/// (and is expected to update the cluster metadata); we classify its exit.
pub fn promote_self(ctx: &mut DaemonContext) -> FailoverState {
    let delay = ctx.config.promote_delay();
    if !delay.is_zero() {
        tracing::debug!("sleeping {:?} before promoting standby", delay);
        if ctx.signals.wait_timeout(delay) {
            return FailoverState::None;
        }
    }

    // Snapshot the failed primary for the audit trail before metadata
    // changes underneath us.
    let failed_primary = match snapshot_failed_primary(ctx) {
        Some(record) => record,
        None => {
            tracing::error!("no upstream record available, cannot promote");
            return FailoverState::PromotionFailed;
        }
    };

    let command = ctx.config.effective_promote_command().to_string();
    if command.is_empty() {
        tracing::error!("no promote command configured");
        return FailoverState::PromotionFailed;
    }

    let rc = ctx.runner.run(&command);

    // The local session should survive a promotion, but verify; a node that
    // cannot reach its own DB after promoting is in no state to lead.
    if !ctx.reconnect_local() {
        tracing::error!("unable to reconnect to local node after promote command");
        return FailoverState::LocalNodeFailure;
    }

    if rc != 0 {
        let reappeared = {
            let connector = Arc::clone(&ctx.connector);
            match ctx.local_session.as_deref_mut() {
                Some(local) => matches!(
                    find_primary(connector.as_ref(), local),
                    Ok(Some((_, primary_id))) if primary_id == failed_primary.node_id
                ),
                None => false,
            }
        };
        if reappeared {
            tracing::info!(
                "original primary {} reappeared before this standby was promoted, no action taken",
                failed_primary.node_id
            );
            ctx.emit_event(
                EventKind::FailoverAbort,
                true,
                &format!(
                    "original primary \"{}\" ({}) reappeared",
                    failed_primary.node_name, failed_primary.node_id
                ),
            );
            return FailoverState::PrimaryReappeared;
        }

        tracing::error!("promote command failed (exit code {})", rc);
        ctx.emit_event(
            EventKind::FailoverPromote,
            false,
            &format!("promote command exited with code {rc}"),
        );
        return FailoverState::PromotionFailed;
    }

    // The promote command updated the metadata; pick up our new record.
    let self_id = ctx.local_node.node_id;
    if let Some(local) = ctx.local_session.as_deref_mut() {
        match local.node_record(self_id) {
            Ok(Some(info)) => ctx.local_node = info,
            Ok(None) => tracing::warn!("own node record missing after promotion"),
            Err(e) => tracing::warn!("unable to refresh own node record: {}", e),
        }
    }

    ctx.emit_event(
        EventKind::FailoverPromote,
        true,
        &format!(
            "node {} promoted to primary; old primary {} marked as failed",
            self_id, failed_primary.node_id
        ),
    );
    FailoverState::Promoted
}

/// Poll the local follow directive once per second until the winner's
/// notification lands or the configured timeout elapses.
pub fn wait_primary_notification(ctx: &mut DaemonContext) -> Option<NodeId> {
    let timeout_secs = ctx.config.primary_notification_timeout().as_secs();
    for elapsed in 0..timeout_secs {
        if let Some(local) = ctx.local_session.as_deref_mut() {
            match local.new_primary() {
                Ok(Some(id)) => {
                    tracing::debug!("new primary is {}; elapsed: {}s", id, elapsed);
                    return Some(id);
                }
                Ok(None) => {}
                Err(e) => tracing::warn!("unable to poll for new primary: {}", e),
            }
        }
        if ctx.signals.wait_timeout(Duration::from_secs(1)) {
            return None;
        }
    }
    tracing::warn!(
        "no notification received from a new primary after {} seconds",
        timeout_secs
    );
    None
}

/// Re-attach the local node to the newly promoted primary.
pub fn follow_new_primary(ctx: &mut DaemonContext, new_primary_id: NodeId) -> FailoverState {
    // The local cache may be stale, which is acceptable: conninfo is stable
    // across a node's lifetime.
    let new_primary = match ctx
        .local_session
        .as_deref_mut()
        .and_then(|s| s.node_record(new_primary_id).ok().flatten())
    {
        Some(record) => record,
        None => {
            tracing::error!("no record for new primary {}", new_primary_id);
            return FailoverState::FollowFail;
        }
    };
    let failed_primary = ctx.upstream_node.clone();

    // The follow command restarts the local instance; let go of the session
    // before it does.
    ctx.local_session = None;

    let mut primary_session = match ctx.connector.connect(&new_primary.conninfo) {
        Ok(session) => session,
        Err(e) => {
            tracing::warn!("unable to connect to new primary {}: {}", new_primary_id, e);
            return FailoverState::FollowFail;
        }
    };
    match primary_session.recovery_type() {
        Ok(RecoveryType::Primary) => {}
        Ok(RecoveryType::Standby) => {
            tracing::warn!("new primary {} is still in recovery", new_primary_id);
            return FailoverState::FollowFail;
        }
        Err(e) => {
            tracing::warn!("unable to verify new primary {}: {}", new_primary_id, e);
            return FailoverState::FollowFail;
        }
    }

    let command = render_follow_command(&ctx.config.follow_command, new_primary_id);
    let rc = ctx.runner.run(&command);

    if rc != 0 {
        // The usual reason a follow refuses: the original primary came back
        // after the winner promoted itself. Probe it before giving up.
        if let Some(failed) = &failed_primary {
            if let Ok(mut old_session) = ctx.connector.connect(&failed.conninfo) {
                if matches!(old_session.recovery_type(), Ok(RecoveryType::Primary)) {
                    tracing::info!("original primary reappeared, no action taken");
                    return FailoverState::PrimaryReappeared;
                }
            }
        }
        tracing::error!("follow command failed (exit code {})", rc);
        return FailoverState::FollowFail;
    }

    // Refresh our own and the upstream record from the new primary's DB so
    // we hold the current versions, then reopen the local session.
    let self_id = ctx.local_node.node_id;
    match primary_session.node_record(new_primary_id) {
        Ok(Some(info)) => ctx.upstream_node = Some(info),
        _ => ctx.upstream_node = Some(new_primary),
    }
    if let Ok(Some(info)) = primary_session.node_record(self_id) {
        ctx.local_node = info;
    }

    let details = format!(
        "node {} now following new upstream node {}",
        self_id, new_primary_id
    );
    tracing::info!("{}", details);
    if ctx.config.monitoring_history {
        if let Err(e) = primary_session.record_event(self_id, EventKind::FailoverFollow, true, &details)
        {
            tracing::warn!("unable to persist event record: {}", e);
        }
    }
    drop(primary_session);

    match ctx.connector.connect(&ctx.local_node.conninfo) {
        Ok(session) => ctx.local_session = Some(session),
        Err(e) => tracing::warn!("local instance not back yet after follow: {}", e),
    }

    FailoverState::FollowedNewPrimary
}

/// Tell each former sibling which node to follow now. Best-effort:
/// unreachable peers are skipped, individual failures logged, never fatal.
pub fn notify_followers(ctx: &mut DaemonContext, siblings: &[NodeInfo], follow_node_id: NodeId) {
    for sibling in siblings {
        tracing::debug!(
            "notifying {} to follow {}",
            sibling.node_id,
            follow_node_id
        );
        let mut session = match ctx.connector.connect(&sibling.conninfo) {
            Ok(session) => session,
            Err(e) => {
                tracing::debug!("unable to reach {}: {}", sibling.node_id, e);
                continue;
            }
        };
        if let Err(e) = session.notify_follow_primary(follow_node_id) {
            tracing::warn!("unable to notify {}: {}", sibling.node_id, e);
        }
    }
}

/// The failed primary's record, preferably fresh from the metadata, falling
/// back to the cached copy.
fn snapshot_failed_primary(ctx: &mut DaemonContext) -> Option<NodeInfo> {
    let upstream_id = ctx.upstream_node.as_ref()?.node_id;
    if let Some(local) = ctx.local_session.as_deref_mut() {
        if let Ok(Some(record)) = local.node_record(upstream_id) {
            return Some(record);
        }
    }
    ctx.upstream_node.clone()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_follow_command_substitutes_node_id() {
        assert_eq!(
            render_follow_command("refollow --upstream-id %n", NodeId(7)),
            "refollow --upstream-id 7"
        );
        assert_eq!(render_follow_command("refollow", NodeId(7)), "refollow");
    }

    #[test]
    fn test_shell_runner_reports_exit_codes() {
        let runner = ShellRunner;
        assert_eq!(runner.run("true"), 0);
        assert_ne!(runner.run("false"), 0);
        assert_eq!(runner.run("exit 3"), 3);
    }
}
