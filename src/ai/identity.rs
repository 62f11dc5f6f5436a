use super::{ChatError, ChatResult};
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, warn};

/// Identity used when the network lookup fails. Every client whose lookup
/// fails shares this one rate-limit bucket.
pub const FALLBACK_IDENTITY: &str = "unknown";

const LOOKUP_TIMEOUT: Duration = Duration::from_secs(10);

/// Resolves the key that buckets rate-limit counters.
#[async_trait]
pub trait IdentityResolver: Send + Sync {
    /// Never fails; falls back to [`FALLBACK_IDENTITY`].
    async fn resolve(&self) -> String;
}

/// Looks up the public IP through an ipify-style JSON endpoint.
pub struct IpLookupResolver {
    client: Client,
    url: String,
}

#[derive(Deserialize)]
struct IpResponse {
    ip: String,
}

impl IpLookupResolver {
    pub fn new(url: impl Into<String>) -> ChatResult<Self> {
        let client = Client::builder()
            .timeout(LOOKUP_TIMEOUT)
            .build()
            .map_err(ChatError::from)?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }

    async fn lookup(&self) -> ChatResult<String> {
        let response = self.client.get(&self.url).send().await?.error_for_status()?;
        let body: IpResponse = response.json().await?;
        let ip = body.ip.trim();
        if ip.is_empty() {
            return Err(ChatError::Transport("identity lookup returned no ip".into()));
        }
        Ok(ip.to_string())
    }
}

#[async_trait]
impl IdentityResolver for IpLookupResolver {
    async fn resolve(&self) -> String {
        match self.lookup().await {
            Ok(ip) => {
                debug!("resolved network identity");
                ip
            }
            Err(err) => {
                warn!(%err, "identity lookup failed, using shared fallback identity");
                FALLBACK_IDENTITY.to_string()
            }
        }
    }
}

/// Fixed identity, for hosts that already know who the user is.
#[derive(Clone, Debug)]
pub struct StaticIdentity(pub String);

impl StaticIdentity {
    pub fn new(identity: impl Into<String>) -> Self {
        Self(identity.into())
    }
}

#[async_trait]
impl IdentityResolver for StaticIdentity {
    async fn resolve(&self) -> String {
        self.0.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn static_identity_resolves_to_itself() {
        assert_eq!(StaticIdentity::new("203.0.113.7").resolve().await, "203.0.113.7");
    }

    #[tokio::test]
    async fn failed_lookup_falls_back() {
        // nothing listens on port 9 of the loopback interface
        let resolver = IpLookupResolver::new("http://127.0.0.1:9/?format=json").unwrap();
        assert_eq!(resolver.resolve().await, FALLBACK_IDENTITY);
    }
}
