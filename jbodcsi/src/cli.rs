//! Command-line interface for the `jbodcsi` node plugin.
//!
//! Every flag can also be supplied through a `JBODCSI_*` environment
//! variable, which is how the plugin is usually configured inside a
//! DaemonSet.

use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use libjbodcsi::NodeConfig;
use libjbodcsi::config::{
    DEFAULT_IDENTITY, DEFAULT_MAX_VOLUMES_PER_NODE, DEFAULT_REQUEST_TIMEOUT_SECS,
};

#[derive(Parser, Debug)]
#[command(
    name = "jbodcsi",
    version,
    about = "CSI node plugin for directly attached JBOD volumes"
)]
pub struct Cli {
    /// Emit logs as JSON lines.
    #[arg(long, env = "JBODCSI_LOG_JSON", global = true)]
    pub log_json: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the node plugin.
    Serve(ServeArgs),
    /// Query a running node plugin for its identity and topology.
    Info(InfoArgs),
}

#[derive(Args, Debug)]
pub struct ServeArgs {
    /// Node identifier; defaults to the host name.
    #[arg(long, env = "JBODCSI_NODE_ID")]
    pub node_id: Option<String>,

    /// Driver identity reported as plugin name and topology segment.
    #[arg(long, env = "JBODCSI_IDENTITY", default_value = DEFAULT_IDENTITY)]
    pub identity: String,

    #[arg(long, env = "JBODCSI_RACK", default_value = "")]
    pub rack: String,

    #[arg(long, env = "JBODCSI_ZONE", default_value = "")]
    pub zone: String,

    #[arg(long, env = "JBODCSI_REGION", default_value = "")]
    pub region: String,

    #[arg(long, env = "JBODCSI_MAX_VOLUMES", default_value_t = DEFAULT_MAX_VOLUMES_PER_NODE)]
    pub max_volumes_per_node: u64,

    /// Directory holding persisted volume records.
    #[arg(long, env = "JBODCSI_STATE_DIR", default_value = "/var/lib/jbodcsi/volumes")]
    pub state_dir: PathBuf,

    #[arg(long, env = "JBODCSI_REQUEST_TIMEOUT", default_value_t = DEFAULT_REQUEST_TIMEOUT_SECS)]
    pub request_timeout_secs: u64,

    #[arg(long, env = "JBODCSI_LISTEN", default_value = "0.0.0.0:7443")]
    pub listen: SocketAddr,

    /// PEM certificate chain presented to clients.
    #[arg(long, env = "JBODCSI_TLS_CERT")]
    pub tls_cert: PathBuf,

    /// PEM private key for `--tls-cert`.
    #[arg(long, env = "JBODCSI_TLS_KEY")]
    pub tls_key: PathBuf,
}

impl ServeArgs {
    /// Build the immutable node configuration.
    pub fn node_config(&self) -> Result<NodeConfig> {
        let node_id = match &self.node_id {
            Some(id) => id.clone(),
            None => nix::unistd::gethostname()
                .context("Failed to read host name for node id")?
                .to_string_lossy()
                .into_owned(),
        };

        let config = NodeConfig {
            node_id,
            identity: self.identity.clone(),
            rack: self.rack.clone(),
            zone: self.zone.clone(),
            region: self.region.clone(),
            max_volumes_per_node: self.max_volumes_per_node,
            state_dir: Some(self.state_dir.clone()),
            request_timeout_secs: self.request_timeout_secs,
        };
        config.validate().context("Invalid node configuration")?;
        Ok(config)
    }
}

#[derive(Args, Debug)]
pub struct InfoArgs {
    #[arg(long, env = "JBODCSI_ADDR", default_value = "127.0.0.1:7443")]
    pub addr: SocketAddr,

    /// Name that must match the server certificate.
    #[arg(long, env = "JBODCSI_SERVER_NAME", default_value = "localhost")]
    pub server_name: String,

    /// PEM CA bundle used to verify the server.
    #[arg(long, env = "JBODCSI_TLS_CA")]
    pub tls_ca: PathBuf,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(args).expect("parse")
    }

    #[test]
    fn serve_builds_node_config() {
        let cli = parse(&[
            "jbodcsi",
            "serve",
            "--node-id",
            "node-07",
            "--rack",
            "r2",
            "--zone",
            "z1",
            "--region",
            "eu-west",
            "--tls-cert",
            "/etc/jbodcsi/tls.crt",
            "--tls-key",
            "/etc/jbodcsi/tls.key",
        ]);
        let Command::Serve(args) = cli.command else {
            panic!("expected serve");
        };
        let cfg = args.node_config().unwrap();
        assert_eq!(cfg.node_id, "node-07");
        assert_eq!(cfg.rack, "r2");
        assert_eq!(cfg.identity, DEFAULT_IDENTITY);
        assert_eq!(cfg.max_volumes_per_node, 10_000);
        assert_eq!(
            cfg.state_dir.as_deref(),
            Some(std::path::Path::new("/var/lib/jbodcsi/volumes"))
        );
    }

    #[test]
    fn state_dir_flag_overrides_default() {
        let cli = parse(&[
            "jbodcsi",
            "serve",
            "--node-id",
            "n1",
            "--state-dir",
            "/srv/jbod/state",
            "--tls-cert",
            "c",
            "--tls-key",
            "k",
        ]);
        let Command::Serve(args) = cli.command else {
            panic!("expected serve");
        };
        assert_eq!(
            args.node_config().unwrap().state_dir.as_deref(),
            Some(std::path::Path::new("/srv/jbod/state"))
        );
    }

    #[test]
    fn zero_timeout_is_rejected() {
        let cli = parse(&[
            "jbodcsi",
            "serve",
            "--node-id",
            "n1",
            "--request-timeout-secs",
            "0",
            "--tls-cert",
            "c",
            "--tls-key",
            "k",
        ]);
        let Command::Serve(args) = cli.command else {
            panic!("expected serve");
        };
        assert!(args.node_config().is_err());
    }

    #[test]
    fn info_defaults() {
        let cli = parse(&["jbodcsi", "info", "--tls-ca", "/etc/jbodcsi/ca.crt"]);
        let Command::Info(args) = cli.command else {
            panic!("expected info");
        };
        assert_eq!(args.server_name, "localhost");
        assert_eq!(args.addr.port(), 7443);
    }
}
