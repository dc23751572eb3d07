// Connection URL parsing.
//
// Client URLs name the proxy cluster and the native backend in one string:
//
// ```text
// jdbc:ojp[host1:port1,host2:port2]_postgresql://db.internal:5432/app
// ```
//
// The bracketed list is consumed to build the endpoint set; the remainder
// is forwarded verbatim to the server as the native URL.

use serde::{Deserialize, Serialize};

use crate::config::DEFAULT_PORT;
use crate::error::{OjpError, Result};

const URL_PREFIX: &str = "jdbc:ojp[";

/// One proxy server address.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EndpointAddr {
    pub host: String,
    pub port: u16,
}

impl EndpointAddr {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl std::fmt::Display for EndpointAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Parsed client URL: the proxy endpoints plus the native URL forwarded
/// to whichever server handles the connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OjpUrl {
    pub endpoints: Vec<EndpointAddr>,
    pub native_url: String,
}

impl OjpUrl {
    pub fn parse(url: &str) -> Result<Self> {
        let rest = url
            .strip_prefix(URL_PREFIX)
            .ok_or_else(|| OjpError::Config(format!("not an ojp URL: {url}")))?;
        let (list, tail) = rest
            .split_once(']')
            .ok_or_else(|| OjpError::Config(format!("unterminated endpoint list: {url}")))?;

        let mut endpoints = Vec::new();
        for part in list.split(',') {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }
            let endpoint = match part.rsplit_once(':') {
                Some((host, port)) => {
                    let port = port
                        .parse::<u16>()
                        .map_err(|_| OjpError::Config(format!("invalid port in {part}")))?;
                    EndpointAddr::new(host, port)
                }
                None => EndpointAddr::new(part, DEFAULT_PORT),
            };
            endpoints.push(endpoint);
        }
        if endpoints.is_empty() {
            return Err(OjpError::Config(format!("no endpoints in URL: {url}")));
        }

        let native_tail = tail
            .strip_prefix('_')
            .ok_or_else(|| OjpError::Config(format!("missing native scheme separator: {url}")))?;
        if native_tail.is_empty() {
            return Err(OjpError::Config(format!("missing native URL: {url}")));
        }

        Ok(Self {
            endpoints,
            native_url: format!("jdbc:{native_tail}"),
        })
    }
}
