//! The daemon's single mutable context: configuration, collaborators, the
//! cached local/upstream node records, and the shared local session.
//!
//! Everything the monitor, election, and failover code touches flows
//! through one `DaemonContext` value whose lifecycle is bounded by `main`;
//! the signal flags are the only process-wide state.

use std::path::PathBuf;
use std::sync::Arc;

use perch_common::config::DaemonConfig;
use perch_common::signal::SignalState;

use crate::connector::Connector;
use crate::failover::CommandRunner;
use crate::metadata::{EventKind, Session};
use crate::node::NodeInfo;

pub struct DaemonContext {
    pub config: DaemonConfig,
    /// Where the config came from; SIGHUP rereads this path.
    pub config_path: Option<PathBuf>,
    pub connector: Arc<dyn Connector>,
    pub runner: Arc<dyn CommandRunner>,
    pub signals: SignalState,

    /// Our own record, refreshed after promotions and follows.
    pub local_node: NodeInfo,
    /// The node we replicate from; `None` while we are primary.
    pub upstream_node: Option<NodeInfo>,
    /// Session to the local instance, shared across monitor iterations and
    /// replaced atomically when a reconnect succeeds.
    pub local_session: Option<Box<dyn Session>>,

    pub startup_event_logged: bool,
}

impl DaemonContext {
    pub fn new(
        config: DaemonConfig,
        connector: Arc<dyn Connector>,
        runner: Arc<dyn CommandRunner>,
        signals: SignalState,
        local_node: NodeInfo,
        local_session: Box<dyn Session>,
    ) -> Self {
        Self {
            config,
            config_path: None,
            connector,
            runner,
            signals,
            local_node,
            upstream_node: None,
            local_session: Some(local_session),
            startup_event_logged: false,
        }
    }

    /// Best-effort reconnect of the local session. Returns whether a live
    /// session is held afterwards.
    pub fn reconnect_local(&mut self) -> bool {
        if let Some(session) = self.local_session.as_deref_mut() {
            if session.ping() {
                return true;
            }
        }
        self.local_session = None;
        match self.connector.connect(&self.config.conninfo) {
            Ok(session) => {
                self.local_session = Some(session);
                true
            }
            Err(e) => {
                tracing::warn!("reconnection to local node failed: {}", e);
                false
            }
        }
    }

    /// Reset the voting flag (and any stale follow directive) at the top of
    /// a monitoring iteration. Quietly skipped when the local session is
    /// down; the next successful reconnect runs it again.
    pub fn reset_voting_status(&mut self) {
        match self.local_session.as_deref_mut() {
            Some(session) => {
                if let Err(e) = session.reset_voting_status() {
                    tracing::warn!("unable to reset voting status: {}", e);
                }
            }
            None => tracing::debug!("voting status not reset: local session down"),
        }
    }

    /// Emit an audit event: always logged, persisted to the metadata DB when
    /// `monitoring_history` is enabled and a local session is live. A dead
    /// session downgrades to log-only rather than failing the caller.
    pub fn emit_event(&mut self, event: EventKind, success: bool, details: &str) {
        tracing::info!(event = event.as_str(), success, "{}", details);
        metrics::counter!("perchd_events_total", "event" => event.as_str()).increment(1);
        if !self.config.monitoring_history {
            return;
        }
        let node_id = self.local_node.node_id;
        if let Some(session) = self.local_session.as_deref_mut() {
            if let Err(e) = session.record_event(node_id, event, success, details) {
                tracing::warn!("unable to persist event record: {}", e);
            }
        }
    }
}
