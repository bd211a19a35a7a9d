//! PostgreSQL-backed connector and session.
//!
//! The cluster metadata (node table, voting state, follow directives,
//! events) lives in the `perch` schema installed alongside the daemon; the
//! RPC-shaped election calls are schema functions, so one SQL round-trip
//! each. The synchronous client fits the daemon's single-threaded
//! cooperative model.

use std::time::Duration;

use postgres::{Client, Config, NoTls, Row};

use perch_cluster::connector::Connector;
use perch_cluster::metadata::{Session, VoteReply};
use perch_cluster::node::{NodeInfo, NodeType, RecoveryType, VotingStatus};
use perch_cluster::EventKind;
use perch_common::error::{ConnectError, MetadataError};
use perch_common::types::{ElectoralTerm, Lsn, NodeId};

pub struct PgConnector {
    /// Bounds both connection establishment and in-flight statements.
    response_timeout: Duration,
}

impl PgConnector {
    pub fn new(response_timeout: Duration) -> Self {
        Self { response_timeout }
    }

    fn parse_config(&self, conninfo: &str) -> Result<Config, ConnectError> {
        let mut config: Config =
            conninfo
                .parse()
                .map_err(|e: postgres::Error| ConnectError::BadConninfo {
                    conninfo: conninfo.to_string(),
                    message: e.to_string(),
                })?;
        config.connect_timeout(self.response_timeout);
        Ok(config)
    }
}

impl Connector for PgConnector {
    fn is_available(&self, conninfo: &str) -> bool {
        match self.parse_config(conninfo) {
            // The probe session is dropped (closed) before returning.
            Ok(config) => config.connect(NoTls).is_ok(),
            Err(_) => false,
        }
    }

    fn connect(&self, conninfo: &str) -> Result<Box<dyn Session>, ConnectError> {
        let config = self.parse_config(conninfo)?;
        let mut client = config
            .connect(NoTls)
            .map_err(|e| ConnectError::Unreachable {
                conninfo: conninfo.to_string(),
                message: e.to_string(),
            })?;
        // Keep peer round-trips bounded; an unresponsive peer must not
        // stall the monitor loop past the configured timeout.
        let timeout_ms = self.response_timeout.as_millis();
        if let Err(e) = client.batch_execute(&format!("SET statement_timeout = {timeout_ms}")) {
            tracing::debug!("unable to set statement_timeout: {}", e);
        }
        Ok(Box::new(PgSession { client }))
    }
}

pub struct PgSession {
    client: Client,
}

fn db_err(e: postgres::Error) -> MetadataError {
    if e.is_closed() {
        MetadataError::SessionLost(e.to_string())
    } else {
        MetadataError::Query(e.to_string())
    }
}

fn val_err(e: postgres::Error) -> MetadataError {
    MetadataError::BadValue(e.to_string())
}

const NODE_COLUMNS: &str = "node_id, node_name, conninfo, node_type, \
                            upstream_node_id, priority, active";

fn node_from_row(row: &Row) -> Result<NodeInfo, MetadataError> {
    Ok(NodeInfo {
        node_id: NodeId(row.try_get::<_, i32>("node_id").map_err(val_err)?),
        node_name: row.try_get("node_name").map_err(val_err)?,
        conninfo: row.try_get("conninfo").map_err(val_err)?,
        node_type: NodeType::parse(&row.try_get::<_, String>("node_type").map_err(val_err)?),
        upstream_node_id: row
            .try_get::<_, Option<i32>>("upstream_node_id")
            .map_err(val_err)?
            .map(NodeId),
        priority: row.try_get("priority").map_err(val_err)?,
        active: row.try_get("active").map_err(val_err)?,
        last_wal_receive_lsn: Lsn::INVALID,
        is_visible: false,
    })
}

fn parse_lsn(text: &str) -> Result<Lsn, MetadataError> {
    text.parse()
        .map_err(|_| MetadataError::BadValue(format!("unparseable LSN \"{text}\"")))
}

impl Session for PgSession {
    fn ping(&mut self) -> bool {
        self.client.simple_query("SELECT 1").is_ok()
    }

    fn node_record(&mut self, node_id: NodeId) -> Result<Option<NodeInfo>, MetadataError> {
        let query = format!("SELECT {NODE_COLUMNS} FROM perch.nodes WHERE node_id = $1");
        let row = self
            .client
            .query_opt(&query, &[&node_id.0])
            .map_err(db_err)?;
        row.as_ref().map(node_from_row).transpose()
    }

    fn node_records(&mut self) -> Result<Vec<NodeInfo>, MetadataError> {
        let query = format!("SELECT {NODE_COLUMNS} FROM perch.nodes ORDER BY node_id");
        let rows = self.client.query(&query, &[]).map_err(db_err)?;
        rows.iter().map(node_from_row).collect()
    }

    fn active_sibling_records(
        &mut self,
        self_id: NodeId,
        upstream_id: NodeId,
    ) -> Result<Vec<NodeInfo>, MetadataError> {
        let query = format!(
            "SELECT {NODE_COLUMNS} FROM perch.nodes \
             WHERE active AND upstream_node_id = $1 AND node_id <> $2 \
             ORDER BY node_id"
        );
        let rows = self
            .client
            .query(&query, &[&upstream_id.0, &self_id.0])
            .map_err(db_err)?;
        rows.iter().map(node_from_row).collect()
    }

    fn voting_status(&mut self) -> Result<VotingStatus, MetadataError> {
        let row = self
            .client
            .query_one("SELECT perch.get_voting_status()", &[])
            .map_err(db_err)?;
        let code: i32 = row.try_get(0).map_err(val_err)?;
        Ok(match code {
            0 => VotingStatus::NoVote,
            1 => VotingStatus::VoteRequestReceived,
            2 => VotingStatus::VoteInitiated,
            _ => VotingStatus::Unknown,
        })
    }

    fn initiate_voting(&mut self) -> Result<ElectoralTerm, MetadataError> {
        let row = self
            .client
            .query_one("SELECT perch.set_voting_status_initiated()", &[])
            .map_err(db_err)?;
        let term: i64 = row.try_get(0).map_err(val_err)?;
        Ok(ElectoralTerm(term.max(0) as u64))
    }

    fn reset_voting_status(&mut self) -> Result<(), MetadataError> {
        self.client
            .batch_execute("SELECT perch.reset_voting_status()")
            .map_err(db_err)
    }

    fn last_wal_receive_lsn(&mut self) -> Result<Lsn, MetadataError> {
        let row = self
            .client
            .query_one(
                "SELECT coalesce(pg_catalog.pg_last_wal_receive_lsn()::text, '0/0')",
                &[],
            )
            .map_err(db_err)?;
        let text: String = row.try_get(0).map_err(val_err)?;
        parse_lsn(&text)
    }

    fn recovery_type(&mut self) -> Result<RecoveryType, MetadataError> {
        let row = self
            .client
            .query_one("SELECT pg_catalog.pg_is_in_recovery()", &[])
            .map_err(db_err)?;
        let in_recovery: bool = row.try_get(0).map_err(val_err)?;
        Ok(if in_recovery {
            RecoveryType::Standby
        } else {
            RecoveryType::Primary
        })
    }

    fn announce_candidature(
        &mut self,
        candidate: &NodeInfo,
        term: ElectoralTerm,
    ) -> Result<bool, MetadataError> {
        let row = self
            .client
            .query_one(
                "SELECT perch.announce_candidature($1, $2)",
                &[&candidate.node_id.0, &(term.0 as i64)],
            )
            .map_err(db_err)?;
        row.try_get(0).map_err(val_err)
    }

    fn request_vote(
        &mut self,
        candidate: &NodeInfo,
        candidate_lsn: Lsn,
        term: ElectoralTerm,
    ) -> Result<VoteReply, MetadataError> {
        let row = self
            .client
            .query_one(
                "SELECT granted, last_wal_receive_lsn::text AS last_wal_receive_lsn \
                 FROM perch.request_vote($1, $2::pg_lsn, $3)",
                &[
                    &candidate.node_id.0,
                    &candidate_lsn.to_string(),
                    &(term.0 as i64),
                ],
            )
            .map_err(db_err)?;
        let granted: bool = row.try_get("granted").map_err(val_err)?;
        let lsn_text: String = row.try_get("last_wal_receive_lsn").map_err(val_err)?;
        Ok(VoteReply {
            granted,
            last_wal_receive_lsn: parse_lsn(&lsn_text)?,
        })
    }

    fn notify_follow_primary(&mut self, new_primary: NodeId) -> Result<(), MetadataError> {
        self.client
            .execute("SELECT perch.notify_follow_primary($1)", &[&new_primary.0])
            .map(|_| ())
            .map_err(db_err)
    }

    fn new_primary(&mut self) -> Result<Option<NodeId>, MetadataError> {
        let row = self
            .client
            .query_one("SELECT perch.get_new_primary()", &[])
            .map_err(db_err)?;
        let id: Option<i32> = row.try_get(0).map_err(val_err)?;
        Ok(id.map(NodeId))
    }

    fn record_event(
        &mut self,
        node_id: NodeId,
        event: EventKind,
        success: bool,
        details: &str,
    ) -> Result<(), MetadataError> {
        self.client
            .execute(
                "INSERT INTO perch.events (node_id, event, successful, details) \
                 VALUES ($1, $2, $3, $4)",
                &[&node_id.0, &event.as_str(), &success, &details],
            )
            .map(|_| ())
            .map_err(db_err)
    }
}
