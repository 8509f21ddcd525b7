//! Error types for the registrar controller
//!
//! Errors fall into three families that drive how the reconciler reacts:
//! control plane faults (retried), registrar faults (retried, then counted as
//! a failed sync), and local faults such as serialization or address
//! resolution (never retried).

use thiserror::Error;

/// Main error type for registrar operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API call failed
    #[error("control plane unavailable [{context}]: {source}")]
    Kube {
        /// Operation being attempted (e.g. "get-service", "list-nodes")
        context: String,
        /// The underlying kube-rs error
        #[source]
        source: kube::Error,
    },

    /// Kubernetes client could not be built or authenticated
    #[error("control plane client configuration error: {0}")]
    ClientConfig(String),

    /// Registration payload could not be encoded
    #[error("serialization error for {service}: {message}")]
    Serialization {
        /// Service whose payload failed to encode
        service: String,
        /// Description of what failed
        message: String,
    },

    /// Registrar call failed at the transport level or returned non-2xx
    #[error("registrar unreachable at {url}: {message}")]
    RegistrarUnreachable {
        /// Endpoint that was called
        url: String,
        /// HTTP status if a response was received
        status: Option<u16>,
        /// Description of what failed
        message: String,
    },

    /// No listener address could be resolved from the node set
    #[error("address resolution failed: {0}")]
    AddressResolution(String),

    /// Invalid configuration
    #[error("configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Wrap a kube error with the operation that produced it
    pub fn kube(context: impl Into<String>, source: kube::Error) -> Self {
        Self::Kube {
            context: context.into(),
            source,
        }
    }

    /// Create a client configuration error
    pub fn client_config(msg: impl Into<String>) -> Self {
        Self::ClientConfig(msg.into())
    }

    /// Create a serialization error for a service
    pub fn serialization(service: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Serialization {
            service: service.into(),
            message: msg.into(),
        }
    }

    /// Create a transport-level registrar error (no response received)
    pub fn registrar_transport(url: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::RegistrarUnreachable {
            url: url.into(),
            status: None,
            message: msg.into(),
        }
    }

    /// Create a registrar error for a non-2xx response
    pub fn registrar_status(url: impl Into<String>, status: u16, body: impl Into<String>) -> Self {
        let body = body.into();
        let message = if body.is_empty() {
            format!("status {status}")
        } else {
            format!("status {status}: {body}")
        };
        Self::RegistrarUnreachable {
            url: url.into(),
            status: Some(status),
            message,
        }
    }

    /// Create an address resolution error
    pub fn address_resolution(msg: impl Into<String>) -> Self {
        Self::AddressResolution(msg.into())
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Check if this error is retryable
    ///
    /// Kubernetes 4xx responses (forbidden, not found, invalid) need a fix on
    /// the cluster side, so retrying them only delays the failure. Every
    /// non-2xx registrar response is treated as transient.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube { source, .. } => !matches!(
                source,
                kube::Error::Api(ae) if (400..500).contains(&ae.code)
            ),
            Error::ClientConfig(_) => true,
            Error::Serialization { .. } => false,
            Error::RegistrarUnreachable { .. } => true,
            Error::AddressResolution(_) => false,
            Error::Config(_) => false,
        }
    }

    /// HTTP status returned by the registrar, if any
    pub fn registrar_status_code(&self) -> Option<u16> {
        match self {
            Error::RegistrarUnreachable { status, .. } => *status,
            _ => None,
        }
    }
}
