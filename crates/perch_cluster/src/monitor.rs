//! Per-role monitoring loops and the top-level role dispatcher.
//!
//! One single-threaded loop drives everything: a primary monitors its own
//! reachability, a standby monitors its upstream and runs the
//! election/failover sequence when the upstream is confirmed down. After a
//! failover the dispatcher re-reads the local node type and switches mode,
//! which is how a promoted standby becomes a primary monitor.

use std::time::{Duration, Instant};

use perch_common::config::{DaemonConfig, FailoverMode};
use perch_common::error::{PerchError, PerchResult};

use crate::connector::{try_reconnect, ReconnectPolicy};
use crate::context::DaemonContext;
use crate::election::run_election;
use crate::failover::{notify_followers, run_failover};
use crate::metadata::EventKind;
use crate::node::{FailoverState, NodeStatus, NodeType};

/// How a per-role monitor handed control back to the dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MonitorVerdict {
    /// Re-read the local node type and dispatch again.
    Redispatch,
    /// Terminate monitoring (shutdown requested).
    Exit,
}

const POLL_INTERVAL: Duration = Duration::from_secs(1);

pub struct Monitor {
    pub ctx: DaemonContext,
}

impl Monitor {
    pub fn new(ctx: DaemonContext) -> Self {
        Self { ctx }
    }

    /// Top-level driver: loops until shutdown, resetting the voting flag
    /// and dispatching on the locally cached node type each iteration.
    pub fn run(&mut self) -> PerchResult<()> {
        tracing::info!(
            "starting monitoring of node \"{}\" ({})",
            self.ctx.local_node.node_name,
            self.ctx.local_node.node_id
        );

        loop {
            if self.ctx.signals.is_shutdown() {
                return Ok(());
            }
            self.ctx.reset_voting_status();

            let verdict = match self.ctx.local_node.node_type {
                NodeType::Primary => self.monitor_primary()?,
                NodeType::Standby => self.monitor_standby()?,
                NodeType::Witness | NodeType::Bdr => {
                    tracing::warn!(
                        "monitoring of {} nodes is not supported, exiting",
                        self.ctx.local_node.node_type
                    );
                    return Ok(());
                }
                NodeType::Unknown => {
                    return Err(PerchError::Internal(
                        "local node record has unknown type".into(),
                    ));
                }
            };
            if verdict == MonitorVerdict::Exit {
                return Ok(());
            }
        }
    }

    // ── Primary monitoring ─────────────────────────────────────────────────

    /// Watch our own reachability. This path never triggers failover (the
    /// standbys detect a primary outage independently and elect among
    /// themselves), so its job is reconnecting and leaving an audit trail.
    fn monitor_primary(&mut self) -> PerchResult<MonitorVerdict> {
        if !self.ctx.startup_event_logged {
            let details = format!(
                "monitoring cluster primary \"{}\" ({})",
                self.ctx.local_node.node_name, self.ctx.local_node.node_id
            );
            self.ctx.emit_event(EventKind::Start, true, &details);
            self.ctx.startup_event_logged = true;
        }

        let mut node_status = NodeStatus::Up;
        let mut outage_start: Option<Instant> = None;
        let mut status_timer = Instant::now();

        loop {
            if self.ctx.signals.is_shutdown() {
                return Ok(MonitorVerdict::Exit);
            }
            self.maybe_reload_config();

            let conninfo = self.ctx.local_node.conninfo.clone();
            let available = self.ctx.connector.is_available(&conninfo);

            if !available && node_status == NodeStatus::Up {
                tracing::warn!("unable to connect to local node");
                node_status = NodeStatus::Unknown;
                outage_start = Some(Instant::now());
                self.ctx.local_session = None;
                self.ctx
                    .emit_event(EventKind::LocalDisconnect, true, "unable to connect to local node");

                let policy = ReconnectPolicy::from_config(&self.ctx.config);
                let (session, status) = try_reconnect(
                    self.ctx.connector.as_ref(),
                    &conninfo,
                    policy,
                    &self.ctx.signals,
                );
                node_status = status;
                if status == NodeStatus::Up {
                    self.ctx.local_session = session;
                    self.emit_local_reconnect(outage_start.take());
                }
            } else if available && node_status != NodeStatus::Up {
                // Recovered after the bounded reconnect gave up.
                if self.ctx.reconnect_local() {
                    node_status = NodeStatus::Up;
                    self.emit_local_reconnect(outage_start.take());
                }
            }

            if self.status_interval_elapsed(&mut status_timer) {
                tracing::info!(
                    "monitoring primary node \"{}\" ({})",
                    self.ctx.local_node.node_name,
                    self.ctx.local_node.node_id
                );
            }

            if self.ctx.signals.wait_timeout(POLL_INTERVAL) {
                return Ok(MonitorVerdict::Exit);
            }
        }
    }

    fn emit_local_reconnect(&mut self, outage_start: Option<Instant>) {
        let elapsed = outage_start.map(|t| t.elapsed().as_secs()).unwrap_or(0);
        let details = format!("reconnected to local node after {} seconds", elapsed);
        self.ctx.emit_event(EventKind::LocalReconnect, true, &details);
        metrics::counter!("perchd_local_reconnects_total").increment(1);
    }

    // ── Standby monitoring ─────────────────────────────────────────────────

    /// Watch the upstream. On confirmed loss, run the election/failover
    /// sequence and act on its terminal state.
    fn monitor_standby(&mut self) -> PerchResult<MonitorVerdict> {
        if self.ctx.local_session.is_none() && !self.ctx.reconnect_local() {
            // Without the local DB we can't even resolve the upstream;
            // retry on the next dispatch.
            if self.ctx.signals.wait_timeout(POLL_INTERVAL) {
                return Ok(MonitorVerdict::Exit);
            }
            return Ok(MonitorVerdict::Redispatch);
        }

        let upstream_id = self.ctx.local_node.upstream_node_id.ok_or_else(|| {
            PerchError::Internal("standby node record has no upstream".into())
        })?;
        {
            let local = self
                .ctx
                .local_session
                .as_deref_mut()
                .ok_or_else(|| PerchError::Internal("local session unavailable".into()))?;
            let upstream = local.node_record(upstream_id)?.ok_or_else(|| {
                PerchError::Internal(format!("no metadata record for upstream {upstream_id}"))
            })?;
            self.ctx.upstream_node = Some(upstream);
        }

        let (upstream_name, upstream_conninfo) = {
            let upstream = self.ctx.upstream_node.as_ref().unwrap_or(&self.ctx.local_node);
            (upstream.node_name.clone(), upstream.conninfo.clone())
        };

        if !self.ctx.startup_event_logged {
            let details = format!(
                "monitoring upstream node \"{}\" ({})",
                upstream_name, upstream_id
            );
            self.ctx.emit_event(EventKind::Start, true, &details);
            self.ctx.startup_event_logged = true;
        }

        let mut upstream_status = NodeStatus::Up;
        let mut status_timer = Instant::now();

        loop {
            if self.ctx.signals.is_shutdown() {
                return Ok(MonitorVerdict::Exit);
            }
            self.maybe_reload_config();

            let available = self.ctx.connector.is_available(&upstream_conninfo);

            if !available && upstream_status == NodeStatus::Up {
                tracing::warn!("unable to connect to upstream node");
                upstream_status = NodeStatus::Unknown;

                let policy = ReconnectPolicy::from_config(&self.ctx.config);
                let (session, status) = try_reconnect(
                    self.ctx.connector.as_ref(),
                    &upstream_conninfo,
                    policy,
                    &self.ctx.signals,
                );
                drop(session);
                upstream_status = status;

                if status == NodeStatus::Up {
                    tracing::info!("reconnected to upstream node");
                } else if self.ctx.config.failover_mode == FailoverMode::Manual {
                    tracing::warn!(
                        "upstream node \"{}\" ({}) is down, but failover_mode is manual; \
                         no action will be taken",
                        upstream_name,
                        upstream_id
                    );
                } else {
                    match self.handle_upstream_failure() {
                        Ok(Some(verdict)) => return Ok(verdict),
                        Ok(None) => {
                            // Degraded: keep monitoring the dead upstream.
                        }
                        Err(e) => {
                            tracing::warn!("failover round aborted: {}", e);
                        }
                    }
                }
            } else if available && upstream_status != NodeStatus::Up {
                tracing::info!("upstream node is reachable again");
                upstream_status = NodeStatus::Up;
            }

            if self.status_interval_elapsed(&mut status_timer) {
                tracing::info!(
                    "node \"{}\" ({}) monitoring upstream node \"{}\" ({})",
                    self.ctx.local_node.node_name,
                    self.ctx.local_node.node_id,
                    upstream_name,
                    upstream_id
                );
            }

            // Local session health is checked every tick; persistent local
            // failure degrades to passive logging.
            let local_ok = self
                .ctx
                .local_session
                .as_deref_mut()
                .map(|s| s.ping())
                .unwrap_or(false);
            if !local_ok {
                tracing::warn!(
                    "connection to local node {} lost, attempting to reconnect",
                    self.ctx.local_node.node_id
                );
                if self.ctx.reconnect_local() {
                    tracing::info!("reconnected to local node");
                }
            }

            if self.ctx.signals.wait_timeout(POLL_INTERVAL) {
                return Ok(MonitorVerdict::Exit);
            }
        }
    }

    /// The upstream is confirmed down: elect, drive the failover state
    /// machine, and translate its terminal state into loop control.
    /// `Ok(None)` means "stay in the standby loop, degraded".
    fn handle_upstream_failure(&mut self) -> PerchResult<Option<MonitorVerdict>> {
        let outcome = run_election(&mut self.ctx)?;
        tracing::debug!("election result: {}", outcome.result);

        if self.ctx.signals.is_shutdown() {
            return Ok(Some(MonitorVerdict::Exit));
        }

        let state = run_failover(&mut self.ctx, &outcome);
        tracing::debug!("failover state is {}", state);

        match state {
            FailoverState::Promoted => {
                // Former siblings should now follow this node. The sibling
                // list is empty when we were promoted by delegation rather
                // than by winning outright; refetch it in that case.
                let self_id = self.ctx.local_node.node_id;
                let siblings = if outcome.siblings.is_empty() {
                    self.refetch_siblings()
                } else {
                    outcome.siblings.clone()
                };
                notify_followers(&mut self.ctx, &siblings, self_id);
                tracing::info!("switching to primary monitoring mode");
                Ok(Some(MonitorVerdict::Redispatch))
            }
            FailoverState::PrimaryReappeared => {
                // Siblings resume following the original primary.
                let siblings = if outcome.siblings.is_empty() {
                    self.refetch_siblings()
                } else {
                    outcome.siblings.clone()
                };
                if let Some(original_id) = self.ctx.upstream_node.as_ref().map(|u| u.node_id) {
                    notify_followers(&mut self.ctx, &siblings, original_id);
                }
                tracing::info!("resuming standby monitoring mode");
                Ok(Some(MonitorVerdict::Redispatch))
            }
            FailoverState::FollowedNewPrimary | FailoverState::FollowingOriginalPrimary => {
                if let Some(upstream) = self.ctx.upstream_node.as_ref() {
                    tracing::info!(
                        "resuming standby monitoring mode, following \"{}\" ({})",
                        upstream.node_name,
                        upstream.node_id
                    );
                }
                Ok(Some(MonitorVerdict::Redispatch))
            }
            FailoverState::NoNewPrimary
            | FailoverState::WaitingNewPrimary
            | FailoverState::FollowFail
            | FailoverState::NodeNotificationError => {
                // Hand control back so the next dispatch can retry the
                // whole detection/election sequence.
                Ok(Some(MonitorVerdict::Redispatch))
            }
            FailoverState::PromotionFailed | FailoverState::LocalNodeFailure => Ok(None),
            FailoverState::None | FailoverState::Unknown => Ok(None),
        }
    }

    // ── Shared helpers ─────────────────────────────────────────────────────

    /// The failed upstream's orphaned standbys, fresh from the metadata,
    /// excluding ourselves. Empty on any failure: follower notification is
    /// best-effort throughout.
    fn refetch_siblings(&mut self) -> Vec<crate::node::NodeInfo> {
        let self_id = self.ctx.local_node.node_id;
        let upstream_id = match self.ctx.upstream_node.as_ref().map(|u| u.node_id) {
            Some(id) => id,
            None => return Vec::new(),
        };
        match self.ctx.local_session.as_deref_mut() {
            Some(local) => match local.active_sibling_records(self_id, upstream_id) {
                Ok(siblings) => siblings,
                Err(e) => {
                    tracing::warn!("unable to refetch sibling records: {}", e);
                    Vec::new()
                }
            },
            None => Vec::new(),
        }
    }

    fn status_interval_elapsed(&self, timer: &mut Instant) -> bool {
        let interval = self.ctx.config.log_status_interval_secs;
        if interval == 0 {
            return false;
        }
        if timer.elapsed().as_secs() >= interval {
            *timer = Instant::now();
            return true;
        }
        false
    }

    /// SIGHUP: reread the config file at this convenient point. Identity
    /// fields never change across a reload; everything else is applied to
    /// the running daemon.
    fn maybe_reload_config(&mut self) {
        if !self.ctx.signals.take_reload() {
            return;
        }
        let path = match self.ctx.config_path.clone() {
            Some(path) => path,
            None => {
                tracing::warn!("SIGHUP received but no configuration path is known");
                return;
            }
        };
        match DaemonConfig::load(&path) {
            Ok(mut new_config) => {
                if new_config.node_id != self.ctx.config.node_id
                    || new_config.conninfo != self.ctx.config.conninfo
                {
                    tracing::warn!(
                        "node identity changed in configuration file; a restart is \
                         required for that to take effect"
                    );
                    new_config.node_id = self.ctx.config.node_id;
                    new_config.conninfo = self.ctx.config.conninfo.clone();
                }
                self.ctx.config = new_config;
                tracing::info!("configuration reloaded from {}", path.display());
            }
            Err(e) => {
                tracing::warn!(
                    "configuration reload failed, keeping current configuration: {}",
                    e
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connector::Connector;
    use crate::harness::{InMemoryCluster, SimNodeSpec};
    use perch_common::signal::SignalState;
    use perch_common::types::{Lsn, NodeId};
    use std::sync::Arc;

    fn witness_ctx(cluster: &InMemoryCluster) -> DaemonContext {
        let connector = Arc::new(cluster.connector(NodeId(9)));
        let runner = Arc::new(cluster.command_runner(NodeId(9)));
        let session = connector.connect(&cluster.conninfo(NodeId(9))).unwrap();
        let mut local_node = {
            let mut s = connector.connect(&cluster.conninfo(NodeId(9))).unwrap();
            s.node_record(NodeId(9)).unwrap().unwrap()
        };
        local_node.node_type = NodeType::Witness;
        let config = DaemonConfig {
            node_id: 9,
            conninfo: cluster.conninfo(NodeId(9)),
            ..DaemonConfig::default()
        };
        DaemonContext::new(
            config,
            connector,
            runner,
            SignalState::new(),
            local_node,
            session,
        )
    }

    #[test]
    fn test_witness_nodes_are_not_monitored() {
        let cluster = InMemoryCluster::new();
        cluster.add_node(SimNodeSpec {
            node_id: NodeId(9),
            name: "w0".into(),
            node_type: NodeType::Witness,
            upstream: None,
            priority: 0,
            lsn: Lsn::INVALID,
        });
        let mut monitor = Monitor::new(witness_ctx(&cluster));
        // Returns cleanly instead of looping.
        monitor.run().unwrap();
    }

    #[test]
    fn test_unknown_node_type_is_an_error() {
        let cluster = InMemoryCluster::new();
        cluster.add_node(SimNodeSpec {
            node_id: NodeId(9),
            name: "u0".into(),
            node_type: NodeType::Unknown,
            upstream: None,
            priority: 0,
            lsn: Lsn::INVALID,
        });
        let mut ctx = witness_ctx(&cluster);
        ctx.local_node.node_type = NodeType::Unknown;
        let mut monitor = Monitor::new(ctx);
        assert!(monitor.run().is_err());
    }

    #[test]
    fn test_shutdown_before_start_exits_immediately() {
        let cluster = InMemoryCluster::new();
        cluster.add_node(SimNodeSpec {
            node_id: NodeId(9),
            name: "p0".into(),
            node_type: NodeType::Primary,
            upstream: None,
            priority: 100,
            lsn: Lsn(10),
        });
        let mut ctx = witness_ctx(&cluster);
        ctx.local_node.node_type = NodeType::Primary;
        ctx.signals.request_shutdown();
        let mut monitor = Monitor::new(ctx);
        monitor.run().unwrap();
    }
}
