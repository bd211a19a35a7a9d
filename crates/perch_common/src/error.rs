use thiserror::Error;

use crate::types::NodeId;

/// Convenience alias for `Result<T, PerchError>`.
pub type PerchResult<T> = Result<T, PerchError>;

/// Top-level error type that all layer-specific errors convert into.
#[derive(Error, Debug)]
pub enum PerchError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Connection error: {0}")]
    Connect(#[from] ConnectError),

    #[error("Metadata error: {0}")]
    Metadata(#[from] MetadataError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Startup-fatal configuration problems. All of these abort the daemon
/// before monitoring starts.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("unable to read configuration file \"{path}\": {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("unable to parse configuration file \"{path}\": {message}")]
    Parse { path: String, message: String },

    #[error("\"node_id\" must be set")]
    MissingNodeId,

    #[error("\"conninfo\" must be set")]
    MissingConninfo,

    #[error(
        "either \"promote_command\" or \"service_promote_command\" must be \
         defined when failover_mode is \"automatic\""
    )]
    MissingPromoteCommand,

    #[error("\"follow_command\" must be defined when failover_mode is \"automatic\"")]
    MissingFollowCommand,

    #[error("invalid log level \"{0}\"")]
    InvalidLogLevel(String),

    #[error("unsupported log destination \"{0}\" (expected \"stderr\" or \"file\")")]
    InvalidLogDestination(String),

    #[error("\"log_file\" must be set when log_type is \"file\"")]
    MissingLogFile,

    #[error("this node is marked inactive and cannot be used as a failover target")]
    InactiveNode,

    #[error("no metadata record found for this node (ID: {0})")]
    NodeRecordMissing(NodeId),
}

/// Errors opening or probing a session to a node. Transient unreachability
/// is a normal signal in this daemon and is usually absorbed by the caller.
#[derive(Error, Debug)]
pub enum ConnectError {
    #[error("node at \"{conninfo}\" is unreachable: {message}")]
    Unreachable { conninfo: String, message: String },

    #[error("malformed conninfo \"{conninfo}\": {message}")]
    BadConninfo { conninfo: String, message: String },
}

/// Errors from metadata-table and RPC-shaped operations against one session.
#[derive(Error, Debug)]
pub enum MetadataError {
    #[error("{0} not found in metadata")]
    NodeNotFound(NodeId),

    #[error("session to node is no longer usable: {0}")]
    SessionLost(String),

    #[error("metadata query failed: {0}")]
    Query(String),

    #[error("unexpected value in metadata: {0}")]
    BadValue(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layer_errors_fold_into_top_level() {
        let e: PerchError = ConfigError::MissingFollowCommand.into();
        assert!(matches!(e, PerchError::Config(_)));

        let e: PerchError = MetadataError::NodeNotFound(NodeId(4)).into();
        assert!(e.to_string().contains("node:4"));
    }

    #[test]
    fn test_unreachable_message_names_target() {
        let e = ConnectError::Unreachable {
            conninfo: "host=db1".into(),
            message: "timeout".into(),
        };
        assert!(e.to_string().contains("host=db1"));
        assert!(e.to_string().contains("timeout"));
    }
}
