//! Command addressing.
use std::fmt;

/// Transaction-scoped disambiguator for repeated command paths.
pub type CommandRef = u16;

/// Endpoint id within a node.
pub type EndpointId = u16;
/// Cluster id within an endpoint.
pub type ClusterId = u32;
/// Command id within a cluster.
pub type CommandId = u32;

/// Fully resolved target of one command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ConcreteCommandPath {
    /// Endpoint hosting the cluster.
    pub endpoint_id: EndpointId,
    /// Cluster on the endpoint.
    pub cluster_id: ClusterId,
    /// Command (request path) or response id (data reply path).
    pub command_id: CommandId,
}

impl ConcreteCommandPath {
    /// Build a path from its three parts.
    pub const fn new(
        endpoint_id: EndpointId,
        cluster_id: ClusterId,
        command_id: CommandId,
    ) -> Self {
        Self { endpoint_id, cluster_id, command_id }
    }

    /// Same endpoint and cluster, command id ignored.
    pub fn same_cluster(&self, other: &ConcreteCommandPath) -> bool {
        self.endpoint_id == other.endpoint_id && self.cluster_id == other.cluster_id
    }

    /// Copy of this path addressed to another command id.
    pub fn with_command(&self, command_id: CommandId) -> Self {
        Self { command_id, ..*self }
    }
}

impl fmt::Display for ConcreteCommandPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "({}, 0x{:08x}, 0x{:08x})",
            self.endpoint_id, self.cluster_id, self.command_id
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_cluster_ignores_command() {
        let a = ConcreteCommandPath::new(1, 0x6, 0x1);
        assert!(a.same_cluster(&a.with_command(0x2)));
        assert!(!a.same_cluster(&ConcreteCommandPath::new(2, 0x6, 0x1)));
    }

    #[test]
    fn display_is_hex() {
        let p = ConcreteCommandPath::new(1, 0x1234, 0x1);
        assert_eq!(p.to_string(), "(1, 0x00001234, 0x00000001)");
    }
}
