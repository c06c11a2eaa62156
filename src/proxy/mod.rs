//! 代理候选地址的解析与规范化

mod filter;

pub use filter::CandidateFilter;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;
use thiserror::Error;

/// 代理协议
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    #[default]
    Http,
    Socks4,
    Socks5,
}

impl Protocol {
    pub fn scheme(&self) -> &'static str {
        match self {
            Protocol::Http => "http",
            Protocol::Socks4 => "socks4",
            Protocol::Socks5 => "socks5",
        }
    }

    /// `https://` 前缀的列表条目同样按 HTTP 代理连接
    pub fn from_scheme(scheme: &str) -> Option<Self> {
        match scheme.to_ascii_lowercase().as_str() {
            "http" | "https" => Some(Protocol::Http),
            "socks4" | "socks4a" => Some(Protocol::Socks4),
            "socks5" | "socks5h" => Some(Protocol::Socks5),
            _ => None,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CandidateError {
    #[error("格式错误: {0}")]
    Malformed(String),
    #[error("不支持的协议: {0}")]
    UnknownScheme(String),
    #[error("IP 地址无效: {0}")]
    InvalidIp(String),
    #[error("端口无效: {0}")]
    InvalidPort(String),
}

/// 拆分可选的 `scheme://` 前缀，无前缀或无法识别时按 HTTP 处理
pub fn split_scheme(raw: &str) -> (Protocol, &str) {
    let raw = raw.trim();
    match raw.split_once("://") {
        Some((scheme, rest)) => (Protocol::from_scheme(scheme).unwrap_or_default(), rest),
        None => (Protocol::Http, raw),
    }
}

/// 已通过结构校验的候选代理
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ProxyCandidate {
    pub protocol: Protocol,
    pub ip: Ipv4Addr,
    pub port: u16,
}

impl ProxyCandidate {
    pub fn new(protocol: Protocol, ip: Ipv4Addr, port: u16) -> Self {
        Self { protocol, ip, port }
    }

    /// 存储主键 `ip:port`
    pub fn address(&self) -> String {
        format!("{}:{}", self.ip, self.port)
    }

    pub fn to_proxy_url(&self) -> String {
        format!("{}://{}:{}", self.protocol.scheme(), self.ip, self.port)
    }
}

impl FromStr for ProxyCandidate {
    type Err = CandidateError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let raw = raw.trim();
        let (protocol, rest) = match raw.split_once("://") {
            Some((scheme, rest)) => (
                Protocol::from_scheme(scheme)
                    .ok_or_else(|| CandidateError::UnknownScheme(scheme.to_string()))?,
                rest,
            ),
            None => (Protocol::Http, raw),
        };

        let rest = rest.trim_end_matches('/');
        let (host, port) = rest
            .split_once(':')
            .ok_or_else(|| CandidateError::Malformed(raw.to_string()))?;
        if port.contains(':') {
            return Err(CandidateError::Malformed(raw.to_string()));
        }

        let ip = host
            .parse::<Ipv4Addr>()
            .map_err(|_| CandidateError::InvalidIp(host.to_string()))?;
        if port.is_empty() || !port.bytes().all(|b| b.is_ascii_digit()) {
            return Err(CandidateError::InvalidPort(port.to_string()));
        }
        let port = match port.parse::<u16>() {
            Ok(0) | Err(_) => return Err(CandidateError::InvalidPort(port.to_string())),
            Ok(p) => p,
        };

        Ok(Self { protocol, ip, port })
    }
}

/// HTTP 代理输出 `ip:port`，其余协议保留 `scheme://` 前缀
impl fmt::Display for ProxyCandidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.protocol {
            Protocol::Http => write!(f, "{}:{}", self.ip, self.port),
            other => write!(f, "{}://{}:{}", other.scheme(), self.ip, self.port),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_plain_address() {
        let candidate: ProxyCandidate = "1.2.3.4:8080".parse().unwrap();
        assert_eq!(candidate.protocol, Protocol::Http);
        assert_eq!(candidate.port, 8080);
        assert_eq!(candidate.to_string(), "1.2.3.4:8080");
        assert_eq!(candidate.to_proxy_url(), "http://1.2.3.4:8080");
    }

    #[test]
    fn test_parse_scheme_prefixes() {
        let socks: ProxyCandidate = "socks5://5.6.7.8:1080".parse().unwrap();
        assert_eq!(socks.protocol, Protocol::Socks5);
        assert_eq!(socks.address(), "5.6.7.8:1080");
        assert_eq!(socks.to_string(), "socks5://5.6.7.8:1080");

        let https: ProxyCandidate = "https://9.9.9.9:443".parse().unwrap();
        assert_eq!(https.protocol, Protocol::Http);
        assert_eq!(https.to_string(), "9.9.9.9:443");
    }

    #[test]
    fn test_reject_bad_ports() {
        assert!(matches!(
            "1.2.3.4:http".parse::<ProxyCandidate>(),
            Err(CandidateError::InvalidPort(_))
        ));
        assert!(matches!(
            "1.2.3.4:70000".parse::<ProxyCandidate>(),
            Err(CandidateError::InvalidPort(_))
        ));
        assert!(matches!(
            "1.2.3.4:0".parse::<ProxyCandidate>(),
            Err(CandidateError::InvalidPort(_))
        ));
        assert!(matches!(
            "1.2.3.4".parse::<ProxyCandidate>(),
            Err(CandidateError::Malformed(_))
        ));
    }

    #[test]
    fn test_reject_bad_hosts() {
        assert!("example.com:8080".parse::<ProxyCandidate>().is_err());
        assert!("1.2.3:8080".parse::<ProxyCandidate>().is_err());
        assert!("ftp://1.2.3.4:21".parse::<ProxyCandidate>().is_err());
    }

    #[test]
    fn test_split_scheme() {
        assert_eq!(split_scheme("1.2.3.4:80"), (Protocol::Http, "1.2.3.4:80"));
        assert_eq!(
            split_scheme("socks4://1.2.3.4:80"),
            (Protocol::Socks4, "1.2.3.4:80")
        );
    }
}
