//! Authentication collaborator interface.

use async_trait::async_trait;
use bytes::Bytes;
use std::net::SocketAddr;

/// Credentials presented in the CONNECT packet, plus the transport-level
/// remote address when the listener can provide one.
#[derive(Debug, Clone)]
pub struct ClientCredentials {
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<Bytes>,
    pub remote_addr: Option<SocketAddr>,
}

/// Outcome of authentication. The identity id keys session state and QoS 2
/// delivery state, so it must be stable across reconnects of the same device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub id: String,
    pub authenticated: bool,
}

impl Identity {
    pub fn authenticated(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            authenticated: true,
        }
    }

    pub fn rejected(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            authenticated: false,
        }
    }
}

#[async_trait]
pub trait AuthenticationProvider: Send + Sync {
    /// Resolve the credentials to an identity. Returning an identity with
    /// `authenticated == false` refuses the connection with CONNACK
    /// `NotAuthorized`; an `Err` refuses it with `ServerUnavailable`.
    async fn authenticate(&self, credentials: &ClientCredentials) -> anyhow::Result<Identity>;
}

/// Provider that accepts every client, keyed by its client id. Useful for
/// embedded deployments and tests where the listener already gates access.
#[derive(Debug, Clone, Default)]
pub struct AcceptAllAuthenticator;

#[async_trait]
impl AuthenticationProvider for AcceptAllAuthenticator {
    async fn authenticate(&self, credentials: &ClientCredentials) -> anyhow::Result<Identity> {
        Ok(Identity::authenticated(credentials.client_id.clone()))
    }
}
