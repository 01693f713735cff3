//! Pool identity derived from a request's absolute target.

use std::fmt;

use url::Url;

use super::error::PoolError;
use super::settings::ConnectionPoolSettings;

/// Identifies one logical host pool: endpoint plus the settings it runs with.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PoolKey {
    scheme: String,
    host: String,
    port: u16,
    settings: u64,
}

impl PoolKey {
    /// Build a key from its parts.
    pub fn new(scheme: &str, host: &str, port: u16, settings: &ConnectionPoolSettings) -> Self {
        Self {
            scheme: scheme.to_ascii_lowercase(),
            host: host.to_ascii_lowercase(),
            port,
            settings: settings.fingerprint(),
        }
    }

    /// Derive the key for an absolute `http`/`https` URI.
    ///
    /// Relative targets and other schemes are usage errors; nothing is
    /// connected to decide that.
    pub fn from_uri(uri: &str, settings: &ConnectionPoolSettings) -> Result<Self, PoolError> {
        let (scheme, host, port) = endpoint_of(uri)?;
        Ok(Self::new(&scheme, &host, port, settings))
    }

    /// `http` or `https`.
    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    /// Host name (lower-cased).
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Port, defaulted from the scheme when the URI had none.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Fingerprint of the settings the pool was built with.
    pub fn settings_fingerprint(&self) -> u64 {
        self.settings
    }

    /// Whether the key targets a TLS endpoint.
    pub fn is_secure(&self) -> bool {
        self.scheme == "https"
    }
}

impl fmt::Display for PoolKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}:{}", self.scheme, self.host, self.port)
    }
}

/// Split an absolute URI into (scheme, host, port).
pub(crate) fn endpoint_of(uri: &str) -> Result<(String, String, u16), PoolError> {
    let url = Url::parse(uri).map_err(|err| match err {
        url::ParseError::RelativeUrlWithoutBase => {
            PoolError::Usage(format!("request target `{uri}` is not an absolute URI"))
        }
        other => PoolError::Usage(format!("request target `{uri}` is invalid: {other}")),
    })?;

    let scheme = url.scheme();
    if scheme != "http" && scheme != "https" {
        return Err(PoolError::Usage(format!(
            "unsupported scheme `{scheme}` in `{uri}`"
        )));
    }

    let host = url
        .host_str()
        .filter(|h| !h.is_empty())
        .ok_or_else(|| PoolError::Usage(format!("request target `{uri}` has no host")))?;
    let port = url
        .port_or_known_default()
        .ok_or_else(|| PoolError::Usage(format!("request target `{uri}` has no port")))?;

    Ok((scheme.to_string(), host.to_string(), port))
}
