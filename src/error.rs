//! The error taxonomy carried across the RPC boundary.
//!
//! Every variant here corresponds to one row of the error table in the
//! design document; the client and the server both raise and match on
//! [`BridgeError`] rather than on transport-local error types, so a
//! `remote_raised` reply can round-trip a server-side failure without
//! leaking an implementation-specific exception type onto the wire.

use serde::{Deserialize, Serialize};

/// The closed set of error tags that may cross the RPC boundary.
///
/// Kept separate from [`BridgeError`] because `remote_raised` needs a
/// `Serialize`/`Deserialize` tag + message pair that survives the trip
/// through [`crate::rpc`], while `BridgeError` itself also carries
/// variants (`Timeout`, `Closed`) that never need to be wrapped a second
/// time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorTag {
    UnknownConvention,
    LoadFailed,
    AttributeMissing,
    TypeUnsupported,
    TypeConflict,
    MemsyncSyntax,
    MemsyncResolve,
    Remote,
}

/// The crate-wide error type.
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("unknown dll type {0:?}")]
    UnknownConvention(String),

    #[error("failed to load library {0:?}")]
    LoadFailed(String),

    #[error("routine {routine:?} not found in library {library:?}")]
    AttributeMissing { library: String, routine: String },

    #[error("unsupported type description: {0}")]
    TypeUnsupported(String),

    #[error("struct {name:?} redeclared with a different shape")]
    TypeConflict { name: String },

    #[error("{0}")]
    MemsyncSyntax(String),

    #[error("memsync path could not be resolved: {0}")]
    MemsyncResolve(String),

    #[error("RPC call to {method:?} timed out after {elapsed_ms}ms")]
    TransportTimeout { method: String, elapsed_ms: u64 },

    #[error("peer closed the connection")]
    TransportClosed,

    #[error("remote side raised {tag:?}: {message}")]
    RemoteRaised { tag: ErrorTag, message: String },

    #[error("no reachable peer")]
    Unreachable,

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("wire encoding failed: {0}")]
    Encoding(#[from] bincode::Error),
}

impl BridgeError {
    /// Tag + message pair suitable for shipping as a `remote_raised` reply.
    pub fn to_wire(&self) -> (ErrorTag, String) {
        let tag = match self {
            Self::UnknownConvention(_) => ErrorTag::UnknownConvention,
            Self::LoadFailed(_) => ErrorTag::LoadFailed,
            Self::AttributeMissing { .. } => ErrorTag::AttributeMissing,
            Self::TypeUnsupported(_) => ErrorTag::TypeUnsupported,
            Self::TypeConflict { .. } => ErrorTag::TypeConflict,
            Self::MemsyncSyntax(_) => ErrorTag::MemsyncSyntax,
            Self::MemsyncResolve(_) => ErrorTag::MemsyncResolve,
            Self::RemoteRaised { tag, .. } => *tag,
            _ => ErrorTag::Remote,
        };
        (tag, self.to_string())
    }
}
