//! perchd: replication manager daemon for PostgreSQL clusters.
//!
//! Monitors the local node and its upstream; on primary failure the
//! standbys elect a replacement among themselves, the winner promotes
//! itself with the operator-supplied command, and the rest of the fleet is
//! redirected to follow it.

mod backend;
mod daemon;
mod signals;

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;

use backend::PgConnector;
use perch_cluster::{Connector, DaemonContext, Monitor, ShellRunner};
use perch_common::config::{parse_log_level, DaemonConfig, FailoverMode};
use perch_common::signal::SignalState;
use perch_common::types::NodeId;

/// Process exit codes. `SUCCESS` through `SYS_FAILURE` are part of the
/// operational contract with init scripts; `DB_CONN` signals that the
/// required startup connection to the local node failed.
mod exit_code {
    pub const SUCCESS: i32 = 0;
    pub const BAD_CONFIG: i32 = 1;
    pub const BAD_PIDFILE: i32 = 2;
    pub const SYS_FAILURE: i32 = 3;
    pub const DB_CONN: i32 = 6;
}

#[derive(Debug, Parser)]
#[command(
    name = "perchd",
    about = "Replication manager daemon for PostgreSQL clusters",
    version,
    disable_help_flag = true
)]
struct Cli {
    /// Show this help, then exit
    #[arg(short = '?', long = "help", action = clap::ArgAction::Help)]
    help: Option<bool>,

    /// Path to the configuration file
    #[arg(short = 'f', long = "config-file", value_name = "PATH")]
    config_file: PathBuf,

    /// Detach from the foreground and run as a daemon
    #[arg(short = 'd', long)]
    daemonize: bool,

    /// Write a PID file, refusing to start if one names a live process
    #[arg(short = 'p', long = "pid-file", value_name = "PATH")]
    pid_file: Option<PathBuf>,

    /// Override the configured log level (trace, debug, info, warn, error)
    #[arg(short = 'L', long = "log-level", value_name = "LEVEL")]
    log_level: Option<String>,

    /// Output verbose activity information
    #[arg(short = 'v', long)]
    verbose: bool,

    /// Legacy switch: force event-record persistence on, overriding the
    /// configuration file
    #[arg(short = 'm', long = "monitoring-history")]
    monitoring_history: bool,
}

fn main() {
    std::process::exit(run());
}

fn run() -> i32 {
    let cli = Cli::parse();

    // SAFETY: geteuid has no failure modes.
    if unsafe { libc::geteuid() } == 0 {
        eprintln!(
            "perchd: cannot be run as root\n\
             Please log in as the (unprivileged) user that owns the data directory."
        );
        return exit_code::BAD_CONFIG;
    }

    let mut config = match DaemonConfig::load(&cli.config_file) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("perchd: {e}");
            return exit_code::BAD_CONFIG;
        }
    };

    // Command-line overrides.
    if let Some(level) = &cli.log_level {
        match parse_log_level(level) {
            Ok(canonical) => config.log.log_level = canonical.to_string(),
            Err(e) => {
                eprintln!("perchd: {e}");
                return exit_code::BAD_CONFIG;
            }
        }
    }
    if cli.monitoring_history {
        config.monitoring_history = true;
    }

    if let Err(e) = perch_observability::init_tracing(&config.log, cli.verbose) {
        eprintln!("perchd: {e}");
        return exit_code::BAD_CONFIG;
    }
    if !config.metrics_listen_addr.is_empty() {
        if let Err(e) = perch_observability::init_metrics(&config.metrics_listen_addr) {
            tracing::warn!("failed to initialize metrics exporter: {}", e);
        }
    }

    // The local node must be reachable at startup; afterwards outages are
    // handled by the monitor loop.
    tracing::info!("connecting to database \"{}\"", config.conninfo);
    let connector = Arc::new(PgConnector::new(config.primary_response_timeout()));
    let mut local_session = match connector.connect(&config.conninfo) {
        Ok(session) => session,
        Err(e) => {
            tracing::error!("unable to connect to local node: {}", e);
            return exit_code::DB_CONN;
        }
    };

    // The absence of a node record means the node (or the daemon) was never
    // properly registered with the cluster.
    let local_node = match local_session.node_record(NodeId(config.node_id)) {
        Ok(Some(record)) => record,
        Ok(None) => {
            tracing::error!("no metadata record found for this node, terminating");
            tracing::info!("hint: check that this node was registered with the cluster");
            return exit_code::BAD_CONFIG;
        }
        Err(e) => {
            tracing::error!("unable to retrieve own node record: {}", e);
            return exit_code::DB_CONN;
        }
    };
    tracing::debug!(
        "node id is {}, upstream is {:?}",
        local_node.node_id,
        local_node.upstream_node_id
    );

    // An inactive node is not a failover candidate. This usually means a
    // failed primary was recloned without being re-registered.
    if !local_node.active {
        match config.failover_mode {
            FailoverMode::Automatic => {
                tracing::error!(
                    "this node is marked as inactive and cannot be used as a failover target"
                );
                tracing::info!("hint: re-register this node with the cluster");
                return exit_code::BAD_CONFIG;
            }
            FailoverMode::Manual => {
                tracing::warn!(
                    "this node is marked as inactive and will be passively monitored only"
                );
            }
        }
    }

    if cli.daemonize {
        let working_dir = cli
            .config_file
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("/"));
        if let Err(e) = daemon::daemonize(&working_dir) {
            tracing::error!("unable to daemonize: {}", e);
            return exit_code::SYS_FAILURE;
        }
    }

    if let Some(pid_file) = &cli.pid_file {
        match daemon::check_and_create_pid_file(pid_file) {
            Ok(()) => {}
            Err(e @ daemon::PidFileError::Unwritable { .. }) => {
                tracing::error!("{}", e);
                return exit_code::BAD_CONFIG;
            }
            Err(e) => {
                tracing::error!("{}", e);
                tracing::info!(
                    "hint: if perchd is no longer alive, remove the file and restart it"
                );
                return exit_code::BAD_PIDFILE;
            }
        }
    }

    let signal_state = SignalState::new();
    if let Err(e) = signals::install(&signal_state) {
        tracing::error!("unable to install signal handlers: {}", e);
        return exit_code::SYS_FAILURE;
    }

    let mut ctx = DaemonContext::new(
        config,
        connector,
        Arc::new(ShellRunner),
        signal_state,
        local_node,
        local_session,
    );
    ctx.config_path = Some(cli.config_file.clone());

    // Monitor::run returns on shutdown or when the node type leaves the
    // monitorable set; dropping the monitor closes all sessions.
    let result = Monitor::new(ctx).run();

    if let Some(pid_file) = &cli.pid_file {
        daemon::remove_pid_file(pid_file);
    }

    match result {
        Ok(()) => {
            tracing::info!("perchd terminating...");
            exit_code::SUCCESS
        }
        Err(e) => {
            tracing::error!("monitoring aborted: {}", e);
            exit_code::SYS_FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_requires_config_file() {
        assert!(Cli::try_parse_from(["perchd"]).is_err());
        let cli = Cli::try_parse_from(["perchd", "-f", "/etc/perchd.conf"]).unwrap();
        assert_eq!(cli.config_file, PathBuf::from("/etc/perchd.conf"));
        assert!(!cli.daemonize);
        assert!(cli.pid_file.is_none());
    }

    #[test]
    fn test_cli_long_and_short_forms() {
        let cli = Cli::try_parse_from([
            "perchd",
            "--config-file=/etc/perchd.conf",
            "--daemonize",
            "--pid-file=/run/perchd.pid",
            "--log-level=debug",
            "--verbose",
            "--monitoring-history",
        ])
        .unwrap();
        assert!(cli.daemonize);
        assert_eq!(cli.pid_file, Some(PathBuf::from("/run/perchd.pid")));
        assert_eq!(cli.log_level.as_deref(), Some("debug"));
        assert!(cli.verbose);
        assert!(cli.monitoring_history);

        let cli = Cli::try_parse_from([
            "perchd", "-f", "perchd.conf", "-d", "-p", "perchd.pid", "-L", "warn", "-v", "-m",
        ])
        .unwrap();
        assert!(cli.daemonize);
        assert_eq!(cli.log_level.as_deref(), Some("warn"));
    }

    #[test]
    fn test_cli_rejects_unknown_options() {
        assert!(Cli::try_parse_from(["perchd", "-f", "x.conf", "--frobnicate"]).is_err());
    }

    #[test]
    fn test_cli_help_uses_question_mark_short() {
        let err = Cli::try_parse_from(["perchd", "-?"]).unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::DisplayHelp);
        let err = Cli::try_parse_from(["perchd", "--help"]).unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::DisplayHelp);
        // The default -h short is replaced by -?.
        assert!(Cli::try_parse_from(["perchd", "-h"]).is_err());
        assert_ne!(
            Cli::try_parse_from(["perchd", "-h"]).unwrap_err().kind(),
            clap::error::ErrorKind::DisplayHelp
        );
    }
}
