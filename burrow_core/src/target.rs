use crate::error::{CoreError, CoreErrorKind};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};

/// Identifies the remote endpoint a tunnel leads to. Doubles as the
/// deduplication key in the broker's tunnel table.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TunnelDestination {
    pub project: String,
    pub zone: String,
    pub instance: String,
    pub port: u16,
}

impl TunnelDestination {
    pub fn new(project: &str, zone: &str, instance: &str, port: u16) -> Self {
        Self {
            project: project.to_owned(),
            zone: zone.to_owned(),
            instance: instance.to_owned(),
            port,
        }
    }
}

impl Display for TunnelDestination {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}/{}/{}:{}",
            self.project, self.zone, self.instance, self.port
        )
    }
}

/// Resolved relay address for one connection attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayEndpoint {
    pub host: String,
    pub port: u16,
    pub secure: bool,
}

impl RelayEndpoint {
    pub fn new(host: &str, port: u16, secure: bool) -> Self {
        Self {
            host: host.to_owned(),
            port,
            secure,
        }
    }
}

impl Display for RelayEndpoint {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Supplies the bearer credential presented during the relay handshake.
/// Called once per connect and once per reconnect; refreshing the
/// credential is the provider's responsibility.
#[async_trait]
pub trait CredentialSource: Send + Sync {
    async fn token(&self) -> Result<String, CoreError>;
}

/// Resolves a destination to the relay endpoint serving it. Called once
/// per connection attempt.
#[async_trait]
pub trait TargetResolver: Send + Sync {
    async fn resolve(&self, destination: &TunnelDestination) -> Result<RelayEndpoint, CoreError>;
}

/// Fixed bearer token supplied through configuration.
pub struct StaticCredential {
    token: String,
}

impl StaticCredential {
    pub fn new(token: &str) -> Result<Self, CoreError> {
        if token.is_empty() {
            return Err(CoreError::new(
                CoreErrorKind::CredentialError,
                "access token must not be empty",
            ));
        }
        Ok(Self {
            token: token.to_owned(),
        })
    }
}

#[async_trait]
impl CredentialSource for StaticCredential {
    async fn token(&self) -> Result<String, CoreError> {
        Ok(self.token.clone())
    }
}

/// Resolves every destination to one fixed relay endpoint.
pub struct StaticResolver {
    endpoint: RelayEndpoint,
}

impl StaticResolver {
    pub fn new(endpoint: RelayEndpoint) -> Self {
        Self { endpoint }
    }
}

#[async_trait]
impl TargetResolver for StaticResolver {
    async fn resolve(&self, _destination: &TunnelDestination) -> Result<RelayEndpoint, CoreError> {
        Ok(self.endpoint.clone())
    }
}
