//! Client Error Types
//!
//! Errors surfaced to callers of region operations. Transport and server
//! errors are folded into this taxonomy; retries and hops stay invisible
//! unless the retry budget runs out.

use cache_codec::{CodecError, ServerError};
use cache_network::TransportError;
use cache_types::{BucketId, ServerLocation};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ClientError {
    /// No connection freed up within the free connection timeout
    #[error("Pool exhausted: {pool}: {message}")]
    PoolExhausted { pool: String, message: String },

    #[error("Pool '{pool}' is closed")]
    PoolClosed { pool: String },

    /// Server unreachable, connection reset, or server shutting down
    #[error("Connection failure: {message} (server: {server:?})")]
    ConnectionFailure {
        message: String,
        server: Option<ServerLocation>,
    },

    #[error("Not primary or rebalancing: {message}")]
    NotPrimaryOrRebalancing {
        message: String,
        bucket: Option<BucketId>,
    },

    /// Error raised by server-side code
    #[error("Server error: {class}: {message}")]
    ServerSide { class: String, message: String },

    #[error("Authentication failed: {message}")]
    Authentication { message: String },

    #[error("Not authorized: {message}")]
    Authorization { message: String },

    #[error("Timeout: {operation} exceeded {timeout_ms}ms")]
    Timeout { operation: String, timeout_ms: u64 },

    /// Misuse of the client, such as creating a pool name twice
    #[error("Illegal state: {message}")]
    IllegalState { message: String },

    #[error("Configuration error: {message}")]
    Configuration { message: String },

    #[error("Codec error: {message}")]
    Codec { message: String },

    #[error("No servers available: {message}")]
    NoServersAvailable { message: String },
}

pub type Result<T> = std::result::Result<T, ClientError>;

impl ClientError {
    pub fn connection_failure(message: impl Into<String>, server: Option<&ServerLocation>) -> Self {
        Self::ConnectionFailure {
            message: message.into(),
            server: server.cloned(),
        }
    }

    pub fn illegal_state(message: impl Into<String>) -> Self {
        Self::IllegalState {
            message: message.into(),
        }
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    pub fn server_side(class: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ServerSide {
            class: class.into(),
            message: message.into(),
        }
    }

    /// Convert an error raised while acquiring from `pool`
    pub fn from_acquire(pool: &str, error: TransportError) -> Self {
        match error {
            TransportError::Closed { .. } => Self::PoolClosed {
                pool: pool.to_string(),
            },
            TransportError::ResourceExhausted { message, .. } => Self::PoolExhausted {
                pool: pool.to_string(),
                message,
            },
            other => other.into(),
        }
    }

    /// Convert an error reported by `server` for a request
    pub fn from_server(error: ServerError, server: Option<&ServerLocation>) -> Self {
        match error {
            ServerError::NotPrimary { bucket } => Self::NotPrimaryOrRebalancing {
                message: format!("{} is not primary", describe(server)),
                bucket,
            },
            ServerError::Rebalancing => Self::NotPrimaryOrRebalancing {
                message: format!("{} is rebalancing", describe(server)),
                bucket: None,
            },
            ServerError::ServerShuttingDown => {
                Self::connection_failure("server is shutting down", server)
            }
            ServerError::RegionNotFound { region } => {
                Self::server_side("RegionNotFound", format!("region '{}' does not exist", region))
            }
            ServerError::AuthenticationRequired => Self::Authentication {
                message: "authentication required".into(),
            },
            ServerError::AuthenticationFailed { message } => Self::Authentication { message },
            ServerError::NotAuthorized { message } => Self::Authorization { message },
            ServerError::Application { class, message } => Self::ServerSide { class, message },
        }
    }

    /// Server the error was observed against, when known
    pub fn server(&self) -> Option<&ServerLocation> {
        match self {
            ClientError::ConnectionFailure { server, .. } => server.as_ref(),
            _ => None,
        }
    }

    /// Whether retrying on another server or after a metadata refresh may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ClientError::ConnectionFailure { .. }
                | ClientError::NotPrimaryOrRebalancing { .. }
                | ClientError::Timeout { .. }
        )
    }

    pub fn category(&self) -> &'static str {
        match self {
            ClientError::PoolExhausted { .. } => "pool_exhausted",
            ClientError::PoolClosed { .. } => "pool_closed",
            ClientError::ConnectionFailure { .. } => "connection_failure",
            ClientError::NotPrimaryOrRebalancing { .. } => "not_primary",
            ClientError::ServerSide { .. } => "server_side",
            ClientError::Authentication { .. } => "authentication",
            ClientError::Authorization { .. } => "authorization",
            ClientError::Timeout { .. } => "timeout",
            ClientError::IllegalState { .. } => "illegal_state",
            ClientError::Configuration { .. } => "configuration",
            ClientError::Codec { .. } => "codec",
            ClientError::NoServersAvailable { .. } => "no_servers",
        }
    }
}

fn describe(server: Option<&ServerLocation>) -> String {
    server
        .map(|s| s.to_string())
        .unwrap_or_else(|| "server".to_string())
}

impl From<TransportError> for ClientError {
    fn from(error: TransportError) -> Self {
        match error {
            TransportError::Timeout {
                operation,
                timeout_ms,
            } => ClientError::Timeout {
                operation,
                timeout_ms,
            },
            TransportError::Security { message } => ClientError::Authentication { message },
            TransportError::Configuration { message, .. } => ClientError::Configuration { message },
            TransportError::IllegalState { message } => ClientError::IllegalState { message },
            TransportError::NoServersAvailable { message } => {
                ClientError::NoServersAvailable { message }
            }
            TransportError::ResourceExhausted { resource, message } => ClientError::PoolExhausted {
                pool: resource,
                message,
            },
            TransportError::Protocol { message, .. } => ClientError::Codec { message },
            ref other @ TransportError::Connection { .. } => {
                ClientError::connection_failure(other.to_string(), other.remote())
            }
            other => ClientError::connection_failure(other.to_string(), None),
        }
    }
}

impl From<CodecError> for ClientError {
    fn from(error: CodecError) -> Self {
        ClientError::Codec {
            message: error.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_errors_map_onto_the_client_taxonomy() {
        let server = ServerLocation::new("a", 40404);
        let refused: ClientError = TransportError::connection("refused", Some(&server)).into();
        assert_eq!(refused.category(), "connection_failure");
        assert_eq!(refused.server(), Some(&server));
        assert!(refused.is_retryable());

        let timeout: ClientError = TransportError::timeout("get", 10).into();
        assert!(matches!(timeout, ClientError::Timeout { timeout_ms: 10, .. }));

        let security: ClientError = TransportError::security("bad password").into();
        assert_eq!(security.category(), "authentication");
        assert!(!security.is_retryable());
    }

    #[test]
    fn acquire_errors_name_the_pool() {
        let closed = ClientError::from_acquire("orders", TransportError::closed("pool 'orders'"));
        assert_eq!(
            closed,
            ClientError::PoolClosed {
                pool: "orders".into()
            }
        );
        let exhausted = ClientError::from_acquire(
            "orders",
            TransportError::resource_exhausted("pool 'orders'", "no connection freed"),
        );
        assert_eq!(exhausted.category(), "pool_exhausted");
        assert!(!exhausted.is_retryable());
    }

    #[test]
    fn server_errors_map_onto_the_client_taxonomy() {
        let bucket = Some(BucketId::new(3));
        let error = ClientError::from_server(ServerError::NotPrimary { bucket }, None);
        assert!(matches!(error, ClientError::NotPrimaryOrRebalancing { bucket: Some(b), .. } if b.get() == 3));
        assert!(error.is_retryable());

        let denied = ClientError::from_server(
            ServerError::NotAuthorized {
                message: "put".into(),
            },
            None,
        );
        assert_eq!(denied.category(), "authorization");
        assert!(!denied.is_retryable());
    }
}
