use std::net::{IpAddr, Ipv4Addr};

use clap::Parser;
use replijob::controller::{ConfirmPolicy, NodeConfig};
use replijob::types::ids::NodeId;

#[derive(Parser, Debug)]
#[command(about, long_about = None, version)]
pub(crate) struct Args {
    /// Address to listen on.
    #[arg(short, long, default_value_t = IpAddr::V4(Ipv4Addr::new(0, 0, 0, 0)))]
    pub(crate) listen: IpAddr,
    /// (TCP) port to listen on. Further local nodes use the ports after it.
    #[arg(short, long, default_value_t = 7711)]
    pub(crate) port: u16,
    /// Identity of the (first) node, as 40 hex characters. Random if unset.
    #[arg(short = 'i', long)]
    pub(crate) node_id: Option<NodeId>,
    /// Confirmations that release a producer waiting on replication: one,
    /// majority or all.
    #[arg(short, long, default_value = "one")]
    pub(crate) confirm: ConfirmPolicy,
    /// REPLICATE used when ADDJOB doesn't give one.
    #[arg(short = 'r', long, default_value_t = 3)]
    pub(crate) default_replicate: u16,
    /// TTL in seconds used when ADDJOB doesn't give one.
    #[arg(short = 't', long, default_value_t = 86400)]
    pub(crate) default_ttl: u32,
    /// Number of nodes to run in this process, meshed together.
    #[arg(short, long, default_value_t = 1)]
    pub(crate) nodes: u16,
    /// Enables human-friendly logging.
    #[arg(short, long, default_value_t)]
    pub(crate) debug: bool,
}

impl Args {
    /// Configuration for the `n`th local node.
    pub(crate) fn node_config(&self, n: u16) -> NodeConfig {
        let node_id = match (n, self.node_id) {
            (0, Some(id)) => id,
            _ => NodeId::random(),
        };

        NodeConfig {
            confirm: self.confirm,
            default_replicate: self.default_replicate,
            default_ttl: self.default_ttl,
            ..NodeConfig::new(node_id)
        }
    }
}
