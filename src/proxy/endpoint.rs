//! Proxy endpoint identity.

use serde::{Deserialize, Serialize};

/// Transport scheme spoken to the proxy
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProxyScheme {
    /// HTTP proxy
    Http,
    /// HTTP proxy reached over TLS
    Https,
    /// SOCKS5 proxy, local DNS resolution
    Socks5,
    /// SOCKS5 proxy, remote DNS resolution
    Socks5h,
}

impl ProxyScheme {
    /// URL scheme string
    pub fn as_str(&self) -> &'static str {
        match self {
            ProxyScheme::Http => "http",
            ProxyScheme::Https => "https",
            ProxyScheme::Socks5 => "socks5",
            ProxyScheme::Socks5h => "socks5h",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "http" => Some(ProxyScheme::Http),
            "https" => Some(ProxyScheme::Https),
            "socks5" => Some(ProxyScheme::Socks5),
            "socks5h" => Some(ProxyScheme::Socks5h),
            _ => None,
        }
    }
}

/// Immutable identity of a proxy: scheme, host, port
///
/// Credentials embedded in the upstream list (`user:pass@host`) are kept as
/// part of the identity so that two accounts on one host stay distinct.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ProxyEndpoint {
    scheme: ProxyScheme,
    host: String,
    port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    userinfo: Option<String>,
}

impl ProxyEndpoint {
    /// Create an endpoint without credentials
    pub fn new(scheme: ProxyScheme, host: impl Into<String>, port: u16) -> Self {
        Self {
            scheme,
            host: host.into(),
            port,
            userinfo: None,
        }
    }

    /// Transport scheme
    pub fn scheme(&self) -> ProxyScheme {
        self.scheme
    }

    /// Host name or address
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Port
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Full proxy URL including credentials, for handing to HTTP clients and tools
    pub fn url(&self) -> String {
        match &self.userinfo {
            Some(u) => format!("{}://{}@{}:{}", self.scheme.as_str(), u, self.host, self.port),
            None => self.to_string(),
        }
    }
}

/// Displays without credentials, so endpoints are safe to log
impl std::fmt::Display for ProxyEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}://{}:{}", self.scheme.as_str(), self.host, self.port)
    }
}

impl std::str::FromStr for ProxyEndpoint {
    type Err = crate::Error;

    /// Parse `scheme://[user:pass@]host:port` or bare `host:port` (HTTP)
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let invalid = || crate::Error::InvalidProxy(s.to_string());

        let with_scheme = if s.contains("://") {
            s.to_string()
        } else {
            format!("http://{}", s)
        };
        let url = url::Url::parse(&with_scheme).map_err(|_| invalid())?;

        let scheme = ProxyScheme::parse(url.scheme()).ok_or_else(invalid)?;
        let host = url
            .host_str()
            .filter(|h| !h.is_empty())
            .ok_or_else(invalid)?
            .to_string();
        let port = url.port_or_known_default().ok_or_else(invalid)?;
        let userinfo = if url.username().is_empty() {
            None
        } else {
            Some(match url.password() {
                Some(p) => format!("{}:{}", url.username(), p),
                None => url.username().to_string(),
            })
        };

        Ok(Self {
            scheme,
            host,
            port,
            userinfo,
        })
    }
}
