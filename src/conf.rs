//! This module defines types used to configure the engine and its parts.

use crate::{addr::ScionAddr, error::*};

/// The default port a DHT node binds to.
pub const DEFAULT_DHT_PORT: u16 = 7000;

/// Which side of a connection picks the paths packets travel over.
///
/// Only server steered path selection is supported: the seeder dials back to
/// the leecher over the paths it selected, so it is the seeder that spreads
/// concurrent leechers over disjoint paths.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PathSelectionResponsibility {
    Server,
    Client,
}

impl PathSelectionResponsibility {
    pub fn from_str(s: &str) -> Result<Self> {
        match s {
            "server" => Ok(Self::Server),
            "client" => Ok(Self::Client),
            _ => Err(Error::Config(format!(
                "unknown path selection responsibility {:?}",
                s
            ))),
        }
    }
}

/// The global configuration for the engine and all its parts.
#[derive(Clone, Debug)]
pub struct Conf {
    pub engine: EngineConf,
    pub discovery: DiscoveryConf,
}

impl Conf {
    /// Returns the configuration with reasonable defaults, except for the
    /// local address, as it is not sensible to guess that for the user.
    pub fn new(local: ScionAddr) -> Self {
        Self {
            engine: EngineConf {
                local,
                responsibility: PathSelectionResponsibility::Server,
                num_paths: 0,
                dial_back_start_port: 41000,
                print_metrics: false,
            },
            discovery: DiscoveryConf::default(),
        }
    }
}

/// Configuration related to the engine itself.
#[derive(Clone, Debug)]
pub struct EngineConf {
    /// The local path-aware endpoint sessions bind to.
    pub local: ScionAddr,

    /// Which side steers path selection. Client steered selection is
    /// rejected at session construction.
    pub responsibility: PathSelectionResponsibility,

    /// When positive, the seeder dials back over this many shortest paths
    /// instead of consulting the path deconfliction store.
    pub num_paths: usize,

    /// The first local port the seeder allocates dial back sockets from.
    pub dial_back_start_port: u16,

    /// Log per connection bandwidth summaries when a download completes.
    pub print_metrics: bool,
}

/// Configuration for dynamic peer discovery.
#[derive(Clone, Debug)]
pub struct DiscoveryConf {
    /// Whether to start a DHT node alongside each session.
    pub enable_dht: bool,

    /// The port the DHT node binds to.
    pub dht_port: u16,

    /// Additional DHT bootstrap nodes, merged with the ones from the
    /// metainfo file.
    pub dht_nodes: Vec<ScionAddr>,
}

impl Default for DiscoveryConf {
    fn default() -> Self {
        Self {
            enable_dht: false,
            dht_port: DEFAULT_DHT_PORT,
            dht_nodes: Vec::new(),
        }
    }
}
