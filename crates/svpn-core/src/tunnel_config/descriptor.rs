//! Connection descriptor parsing.
//!
//! A descriptor is a URI of the form
//! `vless://<credential>@<host>[:<port>][/<path>]?<params>#<remark>`.
//! Parsing only extracts fields; defaults are applied by the compiler.

use url::{Host, Url};

/// Reserved scheme token identifying the tunnel protocol.
pub const SCHEME: &str = "vless";

/// Port used when the descriptor does not name one.
pub const DEFAULT_PORT: u16 = 443;

/// Descriptor validation failures. Every variant is a malformed descriptor.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DescriptorError {
    #[error("Malformed descriptor: expected scheme `{SCHEME}://`, found `{found}`")]
    WrongScheme { found: String },

    #[error("Malformed descriptor: {0}")]
    Unparsable(String),

    #[error("Malformed descriptor: missing credential identifier")]
    MissingCredential,

    #[error("Malformed descriptor: missing target host")]
    MissingHost,

    #[error("Malformed descriptor: invalid port {0}")]
    InvalidPort(String),

    #[error("Malformed descriptor: unsupported transport `{0}`")]
    UnsupportedTransport(String),
}

/// Fields extracted from a descriptor, before defaults are applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Descriptor {
    pub credential: String,
    pub host: String,
    pub port: u16,
    /// URI path component, if any beyond `/`.
    pub path: Option<String>,
    pub params: DescriptorParams,
    pub remark: Option<String>,
}

/// Named query parameters. Empty values are treated as absent.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DescriptorParams {
    pub sni: Option<String>,
    pub host: Option<String>,
    pub fingerprint: Option<String>,
    pub alpn: Option<Vec<String>>,
    pub transport: Option<String>,
    pub path: Option<String>,
    pub service_name: Option<String>,
    pub public_key: Option<String>,
    pub short_id: Option<String>,
    pub flow: Option<String>,
    pub packet_encoding: Option<String>,
}

impl Descriptor {
    /// Parse and validate a descriptor string.
    pub fn parse(input: &str) -> Result<Self, DescriptorError> {
        let input = input.trim();
        let prefix = format!("{SCHEME}://");
        let has_prefix = input
            .get(..prefix.len())
            .is_some_and(|head| head.eq_ignore_ascii_case(&prefix));
        if !has_prefix {
            let found = input
                .split_once("://")
                .map_or_else(|| "<none>".to_string(), |(scheme, _)| scheme.to_string());
            return Err(DescriptorError::WrongScheme { found });
        }

        let url = Url::parse(input).map_err(|e| match e {
            url::ParseError::InvalidPort => DescriptorError::InvalidPort(input.to_string()),
            url::ParseError::EmptyHost => DescriptorError::MissingHost,
            other => DescriptorError::Unparsable(other.to_string()),
        })?;

        let credential = url.username().to_string();
        if credential.is_empty() {
            return Err(DescriptorError::MissingCredential);
        }

        let host = match url.host() {
            Some(Host::Domain(domain)) if !domain.is_empty() => domain.to_string(),
            Some(Host::Ipv4(addr)) => addr.to_string(),
            Some(Host::Ipv6(addr)) => addr.to_string(),
            _ => return Err(DescriptorError::MissingHost),
        };

        let port = match url.port() {
            None => DEFAULT_PORT,
            Some(0) => return Err(DescriptorError::InvalidPort("0".to_string())),
            Some(port) => port,
        };

        let path = Some(url.path())
            .filter(|p| !p.is_empty() && *p != "/")
            .map(str::to_string);
        let remark = url.fragment().filter(|f| !f.is_empty()).map(str::to_string);

        Ok(Self {
            credential,
            host,
            port,
            path,
            params: DescriptorParams::from_url(&url),
            remark,
        })
    }
}

impl DescriptorParams {
    fn from_url(url: &Url) -> Self {
        let get = |key: &str| {
            url.query_pairs()
                .find(|(k, _)| k == key)
                .map(|(_, v)| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        Self {
            sni: get("sni"),
            host: get("host"),
            fingerprint: get("fp"),
            alpn: get("alpn").map(|list| {
                list.split(',')
                    .map(str::trim)
                    .filter(|p| !p.is_empty())
                    .map(str::to_string)
                    .collect()
            }),
            transport: get("type").map(|t| t.to_ascii_lowercase()),
            path: get("path"),
            service_name: get("serviceName"),
            public_key: get("pbk"),
            short_id: get("sid"),
            flow: get("flow"),
            packet_encoding: get("packetEncoding"),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn parses_full_descriptor() {
        let d = Descriptor::parse(
            "vless://0b1c@edge.example.net:8443/ws?sni=cdn.example.com&fp=firefox&alpn=h2,%20http/1.1&pbk=KEY&sid=ab12&flow=xtls-rprx-vision#Home",
        )
        .unwrap();
        assert_eq!(d.credential, "0b1c");
        assert_eq!(d.host, "edge.example.net");
        assert_eq!(d.port, 8443);
        assert_eq!(d.path.as_deref(), Some("/ws"));
        assert_eq!(d.remark.as_deref(), Some("Home"));
        assert_eq!(d.params.sni.as_deref(), Some("cdn.example.com"));
        assert_eq!(d.params.fingerprint.as_deref(), Some("firefox"));
        assert_eq!(
            d.params.alpn,
            Some(vec!["h2".to_string(), "http/1.1".to_string()])
        );
        assert_eq!(d.params.public_key.as_deref(), Some("KEY"));
        assert_eq!(d.params.short_id.as_deref(), Some("ab12"));
        assert_eq!(d.params.flow.as_deref(), Some("xtls-rprx-vision"));
    }

    #[test]
    fn port_defaults_to_443() {
        let d = Descriptor::parse("vless://id@host.example").unwrap();
        assert_eq!(d.port, DEFAULT_PORT);
        assert!(d.path.is_none());
    }

    #[test]
    fn accepts_ipv6_literal() {
        let d = Descriptor::parse("vless://id@[2001:db8::1]:443").unwrap();
        assert_eq!(d.host, "2001:db8::1");
    }

    #[test]
    fn scheme_is_case_insensitive_and_trimmed() {
        assert!(Descriptor::parse("  VLESS://id@host:443\n").is_ok());
    }

    #[test]
    fn rejects_wrong_scheme() {
        assert_eq!(
            Descriptor::parse("vmess://id@host:443").unwrap_err(),
            DescriptorError::WrongScheme {
                found: "vmess".into()
            }
        );
        assert!(matches!(
            Descriptor::parse("host:443"),
            Err(DescriptorError::WrongScheme { .. })
        ));
    }

    #[test]
    fn rejects_missing_credential_host_and_bad_port() {
        assert_eq!(
            Descriptor::parse("vless://host:443").unwrap_err(),
            DescriptorError::MissingCredential
        );
        assert!(matches!(
            Descriptor::parse("vless://id@:443"),
            Err(DescriptorError::MissingHost | DescriptorError::Unparsable(_))
        ));
        assert!(matches!(
            Descriptor::parse("vless://id@host:99999"),
            Err(DescriptorError::InvalidPort(_))
        ));
        assert!(matches!(
            Descriptor::parse("vless://id@host:0"),
            Err(DescriptorError::InvalidPort(_))
        ));
    }

    #[test]
    fn empty_params_count_as_absent() {
        let d = Descriptor::parse("vless://id@host?sni=&fp=chrome").unwrap();
        assert!(d.params.sni.is_none());
        assert_eq!(d.params.fingerprint.as_deref(), Some("chrome"));
    }
}
