//! Descriptor → tunnel configuration compiler.
//!
//! Pure and deterministic: the same descriptor and options always produce the
//! same [`TunnelConfig`], and a failure never yields a partial configuration.

use std::collections::BTreeMap;
use std::net::IpAddr;

use super::descriptor::{Descriptor, DescriptorError};
use super::types::{
    BLOCK_TAG, DIRECT_TAG, DOH_SERVER_TAG, DnsConfig, DnsRule, DnsServer, LOCAL_SERVER_TAG,
    LogConfig, Outbound, PROXY_TAG, RealityConfig, RouteConfig, RouteRule, TUN_TAG, TlsConfig,
    TunInbound, TunnelConfig, Transport, UtlsConfig, VlessOutbound,
};

/// uTLS fingerprint used when the descriptor has no `fp` parameter.
pub const DEFAULT_FINGERPRINT: &str = "chrome";
/// ALPN list used when the descriptor has no `alpn` parameter.
pub const DEFAULT_ALPN: [&str; 2] = ["h2", "http/1.1"];
/// UDP packet encoding used when the descriptor has no `packetEncoding`.
pub const DEFAULT_PACKET_ENCODING: &str = "xudp";
/// Domain suffixes always resolved by the local resolver.
pub const BYPASS_DOMAIN_SUFFIXES: [&str; 2] = [".lan", ".local"];

/// Host-side knobs that do not come from the descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompileOptions {
    pub interface_name: String,
    pub tun_address: String,
    pub mtu: u32,
    pub doh_url: String,
    pub log_level: String,
}

impl Default for CompileOptions {
    fn default() -> Self {
        Self {
            interface_name: "svpn".to_string(),
            tun_address: "172.19.0.1/30".to_string(),
            mtu: 1400,
            doh_url: "https://1.1.1.1/dns-query".to_string(),
            log_level: "info".to_string(),
        }
    }
}

/// Compile a descriptor with default options.
pub fn compile(descriptor: &str) -> Result<TunnelConfig, DescriptorError> {
    compile_with(descriptor, &CompileOptions::default())
}

/// Compile a descriptor with explicit host-side options.
pub fn compile_with(
    descriptor: &str,
    options: &CompileOptions,
) -> Result<TunnelConfig, DescriptorError> {
    let parsed = Descriptor::parse(descriptor)?;
    let outbound = build_outbound(&parsed)?;

    Ok(TunnelConfig {
        log: LogConfig {
            level: options.log_level.clone(),
            timestamp: true,
        },
        dns: build_dns(&parsed.host, options),
        inbounds: vec![TunInbound {
            kind: "tun".to_string(),
            tag: TUN_TAG.to_string(),
            interface_name: options.interface_name.clone(),
            address: vec![options.tun_address.clone()],
            mtu: options.mtu,
            auto_route: true,
            strict_route: true,
            stack: "gvisor".to_string(),
            sniff: true,
        }],
        outbounds: vec![
            Outbound::Vless(outbound),
            Outbound::Direct {
                tag: DIRECT_TAG.to_string(),
            },
            Outbound::Block {
                tag: BLOCK_TAG.to_string(),
            },
        ],
        route: RouteConfig {
            rules: vec![
                RouteRule {
                    protocol: vec!["dns".to_string()],
                    ip_is_private: None,
                    outbound: DIRECT_TAG.to_string(),
                },
                RouteRule {
                    protocol: Vec::new(),
                    ip_is_private: Some(true),
                    outbound: DIRECT_TAG.to_string(),
                },
            ],
            final_outbound: PROXY_TAG.to_string(),
            auto_detect_interface: true,
        },
    })
}

fn build_dns(target_host: &str, options: &CompileOptions) -> DnsConfig {
    // The proxy server's own name must resolve outside the tunnel.
    let domain = if target_host.parse::<IpAddr>().is_ok() {
        Vec::new()
    } else {
        vec![target_host.to_string()]
    };

    DnsConfig {
        servers: vec![
            DnsServer {
                tag: DOH_SERVER_TAG.to_string(),
                address: options.doh_url.clone(),
                address_resolver: Some(LOCAL_SERVER_TAG.to_string()),
                detour: PROXY_TAG.to_string(),
            },
            DnsServer {
                tag: LOCAL_SERVER_TAG.to_string(),
                address: "local".to_string(),
                address_resolver: None,
                detour: DIRECT_TAG.to_string(),
            },
        ],
        rules: vec![DnsRule {
            domain,
            domain_suffix: BYPASS_DOMAIN_SUFFIXES.iter().map(|s| (*s).to_string()).collect(),
            server: LOCAL_SERVER_TAG.to_string(),
        }],
        final_server: DOH_SERVER_TAG.to_string(),
        strategy: "ipv4_only".to_string(),
    }
}

fn build_outbound(d: &Descriptor) -> Result<VlessOutbound, DescriptorError> {
    let params = &d.params;
    let server_name = params
        .sni
        .clone()
        .or_else(|| params.host.clone())
        .unwrap_or_else(|| d.host.clone());

    let reality = params.public_key.as_ref().map(|key| RealityConfig {
        enabled: true,
        public_key: key.clone(),
        short_id: params.short_id.clone().unwrap_or_default(),
    });

    let tls = TlsConfig {
        enabled: true,
        server_name: server_name.clone(),
        insecure: false,
        alpn: params.alpn.clone().unwrap_or_else(|| {
            DEFAULT_ALPN.iter().map(|s| (*s).to_string()).collect()
        }),
        utls: UtlsConfig {
            enabled: true,
            fingerprint: params
                .fingerprint
                .clone()
                .unwrap_or_else(|| DEFAULT_FINGERPRINT.to_string()),
        },
        reality,
    };

    Ok(VlessOutbound {
        tag: PROXY_TAG.to_string(),
        server: d.host.clone(),
        server_port: d.port,
        uuid: d.credential.clone(),
        flow: params.flow.clone(),
        packet_encoding: params
            .packet_encoding
            .clone()
            .unwrap_or_else(|| DEFAULT_PACKET_ENCODING.to_string()),
        tls,
        transport: build_transport(d, &server_name)?,
    })
}

fn build_transport(d: &Descriptor, server_name: &str) -> Result<Option<Transport>, DescriptorError> {
    let params = &d.params;
    let path = params
        .path
        .clone()
        .or_else(|| d.path.clone())
        .unwrap_or_else(|| "/".to_string());
    let host_header = params.host.clone().unwrap_or_else(|| server_name.to_string());

    let kind = match params.transport.as_deref() {
        Some(kind) => kind,
        None if params.path.is_some() => "ws",
        None => return Ok(None),
    };

    let transport = match kind {
        "tcp" | "raw" | "none" => return Ok(None),
        "ws" | "websocket" => Transport::Ws {
            path,
            headers: BTreeMap::from([("Host".to_string(), host_header)]),
        },
        "grpc" => Transport::Grpc {
            service_name: params.service_name.clone().unwrap_or_default(),
        },
        "http" | "h2" => Transport::Http {
            host: vec![host_header],
            path,
        },
        "httpupgrade" => Transport::HttpUpgrade {
            host: host_header,
            path,
        },
        other => return Err(DescriptorError::UnsupportedTransport(other.to_string())),
    };
    Ok(Some(transport))
}
