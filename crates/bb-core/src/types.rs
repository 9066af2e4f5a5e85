use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Attachment state of the P2P node inside the daemon, as reported over the
/// control plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeState {
    /// No password accepted yet (or the last start attempt failed)
    Locked,
    /// Password accepted, node is being built and published
    Starting,
    /// Node attached and serving
    Ready,
}

impl NodeState {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeState::Locked => "locked",
            NodeState::Starting => "starting",
            NodeState::Ready => "ready",
        }
    }
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NodeState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "locked" => Ok(NodeState::Locked),
            "starting" => Ok(NodeState::Starting),
            "ready" => Ok(NodeState::Ready),
            other => Err(format!("unknown node state: {other}")),
        }
    }
}
