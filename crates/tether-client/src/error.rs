// Error taxonomy for the engine. Transport-level failures keep their own
// type; everything the engine adds on top is a distinct variant so callers
// can tell "could not confirm receipt" from "could not disposition".
use tether_transport::TransportError;
use uuid::Uuid;

pub type Result<T> = std::result::Result<T, ClientError>;

#[derive(thiserror::Error, Debug)]
pub enum ClientError {
    #[error("flow receiver container {0} is not bound")]
    NotBound(Uuid),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("failed to {action} a message")]
    Settlement {
        action: &'static str,
        #[source]
        source: TransportError,
    },
    #[error("message belongs to stale flow generation {0}")]
    StaleGeneration(u64),
    #[error("unsupported configuration: {0}")]
    IllegalConfiguration(String),
    #[error("publisher {0} is not running")]
    NotRunning(Uuid),
    /// Send or commit failed under a transaction. `rollback_error` carries a
    /// subsequent rollback failure as a suppressed cause; `source` is always
    /// the original failure.
    #[error("publish failed, transaction rolled back")]
    Rollback {
        #[source]
        source: TransportError,
        rollback_error: Option<TransportError>,
    },
    #[error("publish confirmation dropped before resolution")]
    ConfirmDropped,
}
