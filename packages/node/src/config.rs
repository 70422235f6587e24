//! Node configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Configuration for one cluster node.
///
/// Timer fields are plain seconds so the struct deserialises from any
/// config format the embedding binary chooses; the engine converts to
/// `Duration` through the accessor methods.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeConfig {
    /// Cluster name; hashed into the 16-bit wire cluster id.
    pub cluster_name: String,
    /// This node's name, unique within the cluster.
    pub node_name: String,
    /// Votes this node contributes to quorum.
    pub votes: u8,
    /// Expected total votes of a fully populated cluster.
    pub expected_votes: u32,
    /// Two-node compatibility mode: quorum is pinned to 1.
    pub two_node: bool,
    /// Configuration generation; joiners must match.
    pub config_version: u32,

    /// How long to listen for an existing cluster before announcing.
    pub joinwait_timeout_secs: u64,
    /// How long a joiner waits for JOINCONF after an OK.
    pub joinconf_timeout_secs: u64,
    /// How long a joiner waits after JOINACK before giving up on the master.
    pub join_timeout_secs: u64,
    /// Period between HELLO heartbeats.
    pub hello_interval_secs: u64,
    /// Silence interval after which a peer is declared dead.
    pub deadnode_timeout_secs: u64,
    /// Maximum duration of one membership transition.
    pub transition_timeout_secs: u64,
    /// Consecutive transition restarts tolerated before giving up.
    pub transition_restarts: u32,
    /// How long to announce NEWCLUSTER before forming one.
    pub newcluster_timeout_secs: u64,
    /// Maximum number of cluster nodes; joiners beyond this are rejected.
    pub max_nodes: usize,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            cluster_name: String::new(),
            node_name: String::new(),
            votes: 1,
            expected_votes: 1,
            two_node: false,
            config_version: 1,
            joinwait_timeout_secs: 16,
            joinconf_timeout_secs: 5,
            join_timeout_secs: 30,
            hello_interval_secs: 5,
            deadnode_timeout_secs: 21,
            transition_timeout_secs: 15,
            transition_restarts: 10,
            newcluster_timeout_secs: 16,
            max_nodes: 128,
        }
    }
}

impl NodeConfig {
    #[must_use]
    pub fn joinwait_timeout(&self) -> Duration {
        Duration::from_secs(self.joinwait_timeout_secs)
    }

    #[must_use]
    pub fn joinconf_timeout(&self) -> Duration {
        Duration::from_secs(self.joinconf_timeout_secs)
    }

    #[must_use]
    pub fn join_timeout(&self) -> Duration {
        Duration::from_secs(self.join_timeout_secs)
    }

    #[must_use]
    pub fn hello_interval(&self) -> Duration {
        Duration::from_secs(self.hello_interval_secs)
    }

    #[must_use]
    pub fn deadnode_timeout(&self) -> Duration {
        Duration::from_secs(self.deadnode_timeout_secs)
    }

    #[must_use]
    pub fn transition_timeout(&self) -> Duration {
        Duration::from_secs(self.transition_timeout_secs)
    }

    #[must_use]
    pub fn newcluster_timeout(&self) -> Duration {
        Duration::from_secs(self.newcluster_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_protocol_timers() {
        let config = NodeConfig::default();
        assert_eq!(config.joinwait_timeout(), Duration::from_secs(16));
        assert_eq!(config.joinconf_timeout(), Duration::from_secs(5));
        assert_eq!(config.join_timeout(), Duration::from_secs(30));
        assert_eq!(config.hello_interval(), Duration::from_secs(5));
        assert_eq!(config.deadnode_timeout(), Duration::from_secs(21));
        assert_eq!(config.transition_timeout(), Duration::from_secs(15));
        assert_eq!(config.transition_restarts, 10);
        assert_eq!(config.max_nodes, 128);
    }

    #[test]
    fn round_trips_through_serde() {
        let config = NodeConfig {
            cluster_name: "prod".to_string(),
            node_name: "a".to_string(),
            two_node: true,
            ..NodeConfig::default()
        };
        let json = serde_json::to_string(&config).unwrap();
        let back: NodeConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.cluster_name, "prod");
        assert!(back.two_node);
    }
}
