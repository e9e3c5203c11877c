//! Message catalogue carried over frames

use bytes::Bytes;
use ipnet::Ipv4Net;
use rkyv::{Archive, Deserialize, Serialize};
use std::fmt;
use std::net::Ipv4Addr;

/// Protocol version advertised during authentication
pub const PROTOCOL_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Kinds of messages that can travel in a frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    Authentication,
    Authorization,
    ConfigRequest,
    Config,
    Packet,
    Fail,
}

impl MessageType {
    /// Every message kind, in default tag order
    pub const ALL: [MessageType; 6] = [
        MessageType::Authentication,
        MessageType::Authorization,
        MessageType::ConfigRequest,
        MessageType::Config,
        MessageType::Packet,
        MessageType::Fail,
    ];

    /// Tag assigned by the standard converter
    pub fn default_tag(self) -> u16 {
        match self {
            MessageType::Authentication => 0,
            MessageType::Authorization => 1,
            MessageType::ConfigRequest => 2,
            MessageType::Config => 3,
            MessageType::Packet => 4,
            MessageType::Fail => 5,
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Credentials presented by a client
#[derive(Archive, Serialize, Deserialize, Debug, Clone, PartialEq)]
#[rkyv(compare(PartialEq), derive(Debug))]
pub struct Authentication {
    /// Client software version
    pub version: String,

    /// Account name
    pub account: String,

    /// Account password
    pub password: String,
}

/// Server answer to a successful authentication
#[derive(Archive, Serialize, Deserialize, Debug, Clone, PartialEq)]
#[rkyv(compare(PartialEq), derive(Debug))]
pub struct Authorization {
    /// Server software version
    pub version: String,

    /// Server's own virtual address
    pub server_address: u32,

    /// Virtual address assigned to the client
    pub client_address: u32,
}

impl Authorization {
    pub fn server_ip(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.server_address)
    }

    pub fn client_ip(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.client_address)
    }
}

/// A destination reachable through the tunnel
#[derive(Archive, Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[rkyv(compare(PartialEq), derive(Debug))]
pub struct Route {
    /// Network address
    pub address: u32,

    /// Prefix length (0-32)
    pub prefix_len: u8,
}

impl Route {
    pub fn new(address: Ipv4Addr, prefix_len: u8) -> Self {
        Self {
            address: address.into(),
            prefix_len,
        }
    }

    /// Route to a single host
    pub fn host(address: Ipv4Addr) -> Self {
        Self::new(address, 32)
    }

    pub fn ip(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.address)
    }

    /// Convert to a CIDR, failing on prefixes longer than 32
    pub fn to_net(&self) -> Result<Ipv4Net, ipnet::PrefixLenError> {
        Ipv4Net::new(self.ip(), self.prefix_len)
    }
}

impl From<Ipv4Net> for Route {
    fn from(net: Ipv4Net) -> Self {
        Self::new(net.addr(), net.prefix_len())
    }
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.ip(), self.prefix_len)
    }
}

/// Routing configuration served to a client
#[derive(Archive, Serialize, Deserialize, Debug, Clone, PartialEq)]
#[rkyv(derive(Debug))]
pub struct Config {
    /// Routes to install, in order
    pub routes: Vec<Route>,
}

/// Failure notice sent before a peer closes the session
#[derive(Archive, Serialize, Deserialize, Debug, Clone, PartialEq)]
#[rkyv(compare(PartialEq), derive(Debug))]
pub struct Fail {
    pub code: u16,
    pub message: String,
}

/// Well-known failure codes
pub mod fail_code {
    /// Credentials rejected
    pub const UNAUTHORIZED: u16 = 401;

    /// Address pool exhausted
    pub const POOL_EXHAUSTED: u16 = 503;
}

/// A decoded protocol message
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Authentication(Authentication),
    Authorization(Authorization),
    ConfigRequest,
    Config(Config),
    /// Raw IP packet, opaque to the protocol
    Packet(Bytes),
    Fail(Fail),
}

impl Message {
    pub fn message_type(&self) -> MessageType {
        match self {
            Message::Authentication(_) => MessageType::Authentication,
            Message::Authorization(_) => MessageType::Authorization,
            Message::ConfigRequest => MessageType::ConfigRequest,
            Message::Config(_) => MessageType::Config,
            Message::Packet(_) => MessageType::Packet,
            Message::Fail(_) => MessageType::Fail,
        }
    }
}

impl From<Authentication> for Message {
    fn from(value: Authentication) -> Self {
        Message::Authentication(value)
    }
}

impl From<Authorization> for Message {
    fn from(value: Authorization) -> Self {
        Message::Authorization(value)
    }
}

impl From<Config> for Message {
    fn from(value: Config) -> Self {
        Message::Config(value)
    }
}

impl From<Fail> for Message {
    fn from(value: Fail) -> Self {
        Message::Fail(value)
    }
}
