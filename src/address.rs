// address.rs - Agent Identities and Ports
//
//! Agent identities and per-medium addressing.
//!
//! An [`AgentId`] names an agent independently of any medium. A [`Port`] is
//! an address inside one connector's namespace; an agent reachable through
//! several media carries several ports in its [`AgentAddress`].

use derive_more::Display;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;
use std::path::PathBuf;
use thiserror::Error;

/// Address parsing errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AddressError {
    #[error("Invalid agent id: {0}")]
    InvalidAgentId(String),

    #[error("Invalid port: {0}")]
    InvalidPort(String),
}

/// Logical agent identity.
///
/// Identities may be platform qualified (`"kitchen/heater"`), which lets a
/// receiving platform check that a peer only speaks for its own agents.
///
/// Every way of building one validates it, decoding included.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Display)]
#[serde(try_from = "String", into = "String")]
pub struct AgentId(String);

impl AgentId {
    /// Create an identity, rejecting empty names
    pub fn new(id: impl Into<String>) -> Result<Self, AddressError> {
        let id = id.into();
        let trimmed = id.trim();
        if trimmed.is_empty() {
            return Err(AddressError::InvalidAgentId("empty identity".to_string()));
        }
        if let Some((platform, name)) = trimmed.split_once('/') {
            if platform.is_empty() || name.is_empty() {
                return Err(AddressError::InvalidAgentId(id));
            }
        }
        Ok(Self(trimmed.to_string()))
    }

    /// Create a platform qualified identity
    pub fn qualified(platform: &str, name: &str) -> Result<Self, AddressError> {
        Self::new(format!("{platform}/{name}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The platform part, if the identity is qualified
    pub fn platform(&self) -> Option<&str> {
        self.0.split_once('/').map(|(platform, _)| platform)
    }

    /// The agent name without its platform
    pub fn name(&self) -> &str {
        self.0.split_once('/').map_or(self.0.as_str(), |(_, name)| name)
    }
}

impl AgentId {
    /// Identity from a literal known to be valid
    pub(crate) fn trusted(id: &'static str) -> Self {
        Self(id.to_string())
    }
}

impl TryFrom<String> for AgentId {
    type Error = AddressError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::new(s)
    }
}

impl TryFrom<&str> for AgentId {
    type Error = AddressError;

    fn try_from(s: &str) -> Result<Self, Self::Error> {
        Self::new(s)
    }
}

impl std::str::FromStr for AgentId {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl From<AgentId> for String {
    fn from(id: AgentId) -> Self {
        id.0
    }
}

/// Connector variants, one per medium
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectorKind {
    /// Same address space
    Local,
    /// Same host, Unix domain sockets
    Unix,
    /// Across hosts, TCP
    Platform,
    /// Low-power radio
    ZigBee,
}

impl ConnectorKind {
    pub const ALL: [ConnectorKind; 4] = [
        ConnectorKind::Local,
        ConnectorKind::Unix,
        ConnectorKind::Platform,
        ConnectorKind::ZigBee,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectorKind::Local => "local",
            ConnectorKind::Unix => "unix",
            ConnectorKind::Platform => "platform",
            ConnectorKind::ZigBee => "zigbee",
        }
    }
}

impl fmt::Display for ConnectorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 16-bit short address of a radio node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(pub u16);

impl NodeId {
    /// Radio broadcast address
    pub const BROADCAST: NodeId = NodeId(0xFFFF);

    pub fn is_broadcast(&self) -> bool {
        *self == Self::BROADCAST
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04X}", self.0)
    }
}

/// An endpoint inside one connector's namespace
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Port {
    /// In-process mailbox of an agent
    Local(AgentId),
    /// Daemon socket path of a platform on this host
    Unix(PathBuf),
    /// Listen address of a remote platform
    Platform(SocketAddr),
    /// Short address of a radio node
    ZigBee(NodeId),
}

impl Port {
    pub fn kind(&self) -> ConnectorKind {
        match self {
            Port::Local(_) => ConnectorKind::Local,
            Port::Unix(_) => ConnectorKind::Unix,
            Port::Platform(_) => ConnectorKind::Platform,
            Port::ZigBee(_) => ConnectorKind::ZigBee,
        }
    }

    /// Parse `scheme:address` (`local:agent`, `unix:/path`, `platform:host:port`,
    /// `zigbee:1A2B`)
    pub fn parse(s: &str) -> Result<Self, AddressError> {
        let (scheme, rest) = s
            .split_once(':')
            .ok_or_else(|| AddressError::InvalidPort(s.to_string()))?;
        if rest.is_empty() {
            return Err(AddressError::InvalidPort(s.to_string()));
        }

        match scheme {
            "local" => Ok(Port::Local(AgentId::new(rest)?)),
            "unix" => Ok(Port::Unix(PathBuf::from(rest))),
            "platform" => rest
                .parse()
                .map(Port::Platform)
                .map_err(|_| AddressError::InvalidPort(s.to_string())),
            "zigbee" => u16::from_str_radix(rest, 16)
                .map(|n| Port::ZigBee(NodeId(n)))
                .map_err(|_| AddressError::InvalidPort(s.to_string())),
            _ => Err(AddressError::InvalidPort(s.to_string())),
        }
    }
}

impl fmt::Display for Port {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Port::Local(id) => write!(f, "local:{id}"),
            Port::Unix(path) => write!(f, "unix:{}", path.display()),
            Port::Platform(addr) => write!(f, "platform:{addr}"),
            Port::ZigBee(node) => write!(f, "zigbee:{node}"),
        }
    }
}

/// Logical identity plus the ports it is reachable on
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentAddress {
    /// Medium independent identity
    pub id: AgentId,

    /// Reachable ports, at most one per connector is typical
    pub ports: Vec<Port>,
}

impl AgentAddress {
    pub fn new(id: AgentId) -> Self {
        Self { id, ports: vec![] }
    }

    /// Add a reachable port, ignoring duplicates
    pub fn with_port(mut self, port: Port) -> Self {
        if !self.ports.contains(&port) {
            self.ports.push(port);
        }
        self
    }

    /// An agent is online while it has at least one port
    pub fn is_online(&self) -> bool {
        !self.ports.is_empty()
    }

    pub fn port_for(&self, kind: ConnectorKind) -> Option<&Port> {
        self.ports.iter().find(|p| p.kind() == kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_agent_id_parts() {
        let id = AgentId::new("kitchen/heater").unwrap();
        assert_eq!(id.platform(), Some("kitchen"));
        assert_eq!(id.name(), "heater");

        let plain = AgentId::new("battery").unwrap();
        assert_eq!(plain.platform(), None);
        assert_eq!(plain.name(), "battery");
    }

    #[test]
    fn test_agent_id_rejects_malformed() {
        assert!(AgentId::new("  ").is_err());
        assert!(AgentId::new("/heater").is_err());
        assert!(AgentId::new("kitchen/").is_err());
    }

    #[test]
    fn test_agent_id_conversions_validate() {
        assert!(AgentId::try_from("/heater").is_err());
        assert!(AgentId::try_from(String::new()).is_err());
        assert!("kitchen/".parse::<AgentId>().is_err());
        let id: AgentId = "kitchen/heater".parse().unwrap();
        assert_eq!(AgentId::try_from("kitchen/heater").unwrap(), id);
    }

    #[test]
    fn test_agent_id_decoding_validates() {
        let id: AgentId = serde_json::from_str("\"kitchen/heater\"").unwrap();
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"kitchen/heater\"");
        assert!(serde_json::from_str::<AgentId>("\"/heater\"").is_err());
        assert!(serde_json::from_str::<AgentId>("\"  \"").is_err());
        assert!(serde_json::from_str::<Port>(r#"{"Local":"kitchen/"}"#).is_err());
    }

    #[test]
    fn test_port_parse() {
        assert_eq!(
            Port::parse("zigbee:00FE").unwrap(),
            Port::ZigBee(NodeId(0x00FE))
        );
        assert_eq!(
            Port::parse("platform:127.0.0.1:7000").unwrap(),
            Port::Platform("127.0.0.1:7000".parse().unwrap())
        );
        assert_eq!(
            Port::parse("unix:/tmp/hamas_sockets/attic").unwrap().kind(),
            ConnectorKind::Unix
        );
        assert!(Port::parse("carrier-pigeon:7").is_err());
        assert!(Port::parse("platform:not-an-address").is_err());
    }

    #[test]
    fn test_port_display_parses_back() {
        let port = Port::ZigBee(NodeId(0x1A2B));
        assert_eq!(port.to_string(), "zigbee:1A2B");
        assert_eq!(Port::parse(&port.to_string()).unwrap(), port);
    }

    #[test]
    fn test_agent_address_dedupes_ports() {
        let addr = AgentAddress::new("heater".parse().unwrap())
            .with_port(Port::ZigBee(NodeId(3)))
            .with_port(Port::ZigBee(NodeId(3)));
        assert_eq!(addr.ports.len(), 1);
        assert!(addr.is_online());
        assert!(addr.port_for(ConnectorKind::Platform).is_none());
    }
}
