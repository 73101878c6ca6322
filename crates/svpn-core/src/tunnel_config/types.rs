//! Tunnel engine configuration types.
//!
//! Field declaration order is the serialization order, which keeps the
//! rendered JSON canonical for a given descriptor.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Tag of the primary (proxy) outbound.
pub const PROXY_TAG: &str = "proxy";
/// Tag of the direct outbound.
pub const DIRECT_TAG: &str = "direct";
/// Tag of the block outbound.
pub const BLOCK_TAG: &str = "block";
/// Tag of the local capture inbound.
pub const TUN_TAG: &str = "tun-in";
/// Tag of the DNS-over-HTTPS server.
pub const DOH_SERVER_TAG: &str = "doh";
/// Tag of the local resolver used for bypassed names.
pub const LOCAL_SERVER_TAG: &str = "local";

/// Complete configuration handed to the tunnel engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelConfig {
    pub log: LogConfig,
    pub dns: DnsConfig,
    pub inbounds: Vec<TunInbound>,
    pub outbounds: Vec<Outbound>,
    pub route: RouteConfig,
}

impl TunnelConfig {
    /// Render the configuration as pretty-printed JSON.
    pub fn to_json_pretty(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    /// The primary proxy outbound, if present.
    pub fn primary_outbound(&self) -> Option<&VlessOutbound> {
        self.outbounds.iter().find_map(|outbound| match outbound {
            Outbound::Vless(vless) if vless.tag == PROXY_TAG => Some(vless),
            _ => None,
        })
    }

    /// Tags of all outbounds in declaration order.
    pub fn outbound_tags(&self) -> Vec<&str> {
        self.outbounds.iter().map(Outbound::tag).collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogConfig {
    pub level: String,
    pub timestamp: bool,
}

/// DNS resolution plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DnsConfig {
    pub servers: Vec<DnsServer>,
    pub rules: Vec<DnsRule>,
    #[serde(rename = "final")]
    pub final_server: String,
    pub strategy: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DnsServer {
    pub tag: String,
    pub address: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address_resolver: Option<String>,
    pub detour: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DnsRule {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub domain: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub domain_suffix: Vec<String>,
    pub server: String,
}

/// Local virtual-interface capture.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunInbound {
    #[serde(rename = "type")]
    pub kind: String,
    pub tag: String,
    pub interface_name: String,
    pub address: Vec<String>,
    pub mtu: u32,
    pub auto_route: bool,
    pub strict_route: bool,
    pub stack: String,
    pub sniff: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Outbound {
    Vless(VlessOutbound),
    Direct { tag: String },
    Block { tag: String },
}

impl Outbound {
    pub fn tag(&self) -> &str {
        match self {
            Self::Vless(vless) => &vless.tag,
            Self::Direct { tag } | Self::Block { tag } => tag,
        }
    }
}

/// Primary proxy route carrying every field extracted from the descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VlessOutbound {
    pub tag: String,
    pub server: String,
    pub server_port: u16,
    pub uuid: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flow: Option<String>,
    pub packet_encoding: String,
    pub tls: TlsConfig,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transport: Option<Transport>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TlsConfig {
    pub enabled: bool,
    pub server_name: String,
    pub insecure: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub alpn: Vec<String>,
    pub utls: UtlsConfig,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reality: Option<RealityConfig>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UtlsConfig {
    pub enabled: bool,
    pub fingerprint: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RealityConfig {
    pub enabled: bool,
    pub public_key: String,
    pub short_id: String,
}

/// V2Ray-style transport layered under TLS.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Transport {
    Ws {
        path: String,
        #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
        headers: BTreeMap<String, String>,
    },
    Grpc {
        service_name: String,
    },
    Http {
        host: Vec<String>,
        path: String,
    },
    HttpUpgrade {
        host: String,
        path: String,
    },
}

/// Routing policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteConfig {
    pub rules: Vec<RouteRule>,
    #[serde(rename = "final")]
    pub final_outbound: String,
    pub auto_detect_interface: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteRule {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub protocol: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip_is_private: Option<bool>,
    pub outbound: String,
}
