use crate::Error;
use std::fmt;
use std::str::FromStr;
use url::Url;

/// One broker node's endpoint.
///
/// Identity is the URI string the coordinator announced; the connection
/// parameters are derived from it once at construction.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Site {
    uri: String,
    hostname: String,
    port: u16,
    secure: bool,
}

impl Site {
    /// Parse a `ws://`, `wss://`, `http://` or `https://` site URI.
    pub fn parse(uri: &str) -> Result<Self, Error> {
        let url = Url::parse(uri).map_err(|e| Error::invalid_site(format!("{uri}: {e}")))?;

        let secure = match url.scheme() {
            "wss" | "https" => true,
            "ws" | "http" => false,
            other => {
                return Err(Error::invalid_site(format!(
                    "{uri}: unsupported scheme '{other}'"
                )))
            }
        };

        let host = url
            .host_str()
            .filter(|host| !host.is_empty())
            .ok_or_else(|| Error::invalid_site(format!("{uri}: missing host")))?;
        // IPv6 literals keep their brackets in `host_str`.
        let hostname = host
            .strip_prefix('[')
            .and_then(|inner| inner.strip_suffix(']'))
            .unwrap_or(host);
        let port = url
            .port_or_known_default()
            .ok_or_else(|| Error::invalid_site(format!("{uri}: missing port")))?;

        Ok(Self {
            uri: uri.to_string(),
            hostname: hostname.to_string(),
            port,
            secure,
        })
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn secure(&self) -> bool {
        self.secure
    }
}

impl FromStr for Site {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for Site {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.uri)
    }
}
