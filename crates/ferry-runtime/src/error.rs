use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// A worker-side procedure failed; carries the stringified remote error.
    #[error("remote procedure `{name}` failed: {details}")]
    Remote { name: String, details: String },
    #[error("channel closed during {operation}")]
    ChannelClosed { operation: &'static str },
    #[error("worker handshake failed: {details}")]
    Handshake { details: String },
    #[error("worker thread spawn failed: {source}")]
    WorkerSpawn {
        #[source]
        source: std::io::Error,
    },
    /// The pool was resized or closed while this call was in flight.
    #[error("pool reset while call in flight")]
    PoolReset,
    #[error("{operation} failed: {details}")]
    Operation {
        operation: &'static str,
        details: String,
    },
}

impl Error {
    pub fn remote(name: impl Into<String>, details: impl Into<String>) -> Self {
        Self::Remote {
            name: name.into(),
            details: details.into(),
        }
    }

    pub fn channel_closed(operation: &'static str) -> Self {
        Self::ChannelClosed { operation }
    }

    pub fn handshake(details: impl Into<String>) -> Self {
        Self::Handshake {
            details: details.into(),
        }
    }

    pub fn worker_spawn(source: std::io::Error) -> Self {
        Self::WorkerSpawn { source }
    }

    pub fn operation(operation: &'static str, details: impl Into<String>) -> Self {
        Self::Operation {
            operation,
            details: details.into(),
        }
    }
}
