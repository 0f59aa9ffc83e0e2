//! Error taxonomy shared by the pool, codec and dispatcher.

use std::time::Duration;

/// Failures surfaced by the internal layers.
///
/// The public command methods on [`crate::MemcachedClient`] never propagate
/// these; they log and return the operation's nothing-happened value. The
/// taxonomy exists so the dispatcher and the health monitor can react to
/// specific kinds (quarantine on `NoValidObject`, connection removal on
/// `Framing`/`ProtocolMismatch`/`Transport`/`Timeout`).
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Borrow timed out with the pool at its ceiling and nothing idle.
    #[error("pool exhausted for {key} after {timeout:?}")]
    PoolExhausted { key: String, timeout: Option<Duration> },

    /// The pool could not produce an object that passed validation before
    /// the borrow deadline.
    #[error("no valid pooled object for {key}")]
    NoValidObject { key: String },

    /// The factory failed to create a new pooled object.
    #[error("failed to create pooled object for {key}: {reason}")]
    CreateFailed { key: String, reason: anyhow::Error },

    /// A connect, write or response deadline elapsed.
    #[error("{what} timed out after {timeout:?}")]
    Timeout { what: &'static str, timeout: Option<Duration> },

    /// The awaiting task was cancelled while an attempt was in flight.
    #[error("operation interrupted")]
    Interrupted,

    /// Malformed response framing. Fatal for the connection.
    #[error("framing error: {0}")]
    Framing(String),

    /// A response opcode did not match the non-quiet head of the in-flight
    /// queue. Fatal for the connection.
    #[error("protocol mismatch: expected opcode {expected:#04x}, got {actual:#04x}")]
    ProtocolMismatch { expected: u8, actual: u8 },

    /// Socket-level read/write failure. The connection is removed.
    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),

    /// Reserved opcode families (SASL) and other unimplemented surfaces.
    #[error("unsupported operation: {0}")]
    Unsupported(&'static str),

    /// The consistent-hash ring is empty; no server owns the key.
    #[error("no server available for key")]
    NoServer,

    /// The pool entry or the whole pool has been destroyed.
    #[error("pool destroyed")]
    Destroyed,
}

impl Error {
    /// Kinds after which the dispatcher must discard the connection instead
    /// of returning it to the pool.
    pub(crate) fn poisons_connection(&self) -> bool {
        matches!(
            self,
            Error::Timeout { .. }
                | Error::Interrupted
                | Error::Framing(_)
                | Error::ProtocolMismatch { .. }
                | Error::Transport(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;
