#![doc = include_str!("../README.md")]

pub mod callback;
pub mod config;
pub mod error;
pub mod marshal;
pub mod memsync;
pub mod path;
pub mod registry;
pub mod rpc;
pub mod server;
pub mod session;
pub mod types;
pub mod value;

pub use callback::{CallbackHandle, CallbackId};
pub use config::{Arch, SessionConfig};
pub use error::{BridgeError, ErrorTag};
pub use registry::LibraryKind;
pub use session::{default_session, set_default_session, LibraryHandle, Routine, Session};
pub use types::{Decl, Fundamental, StructDecl, TypeDesc};
pub use value::Arg;
