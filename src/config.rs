//! Session configuration.
//!
//! A typed struct (`id`, `arch`, `interpreter_version`, `log_level`,
//! `log_write`, `timeout_start`, `timeout_stop`) in place of an ambient
//! kwargs-style config dict, so every knob a session needs is documented
//! and defaulted in one place.

use std::time::Duration;

/// Target architecture of the guest interpreter / DLL.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arch {
    X86,
    X86_64,
}

impl Default for Arch {
    fn default() -> Self {
        Self::X86_64
    }
}

/// Session configuration. All fields have defaults; callers override only
/// what they need via struct update syntax (`SessionConfig { id: Some(..), ..Default::default() }`).
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Explicit session id. Generated (8 lowercase hex chars) when `None`.
    pub id: Option<String>,
    pub arch: Arch,
    /// Version string of the guest Python/interpreter environment, carried
    /// through to the launcher command line unchanged (provisioning the
    /// interpreter itself is someone else's job).
    pub interpreter_version: String,
    pub log_level: u8,
    pub log_write: bool,
    pub timeout_start: Duration,
    pub timeout_stop: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            id: None,
            arch: Arch::default(),
            interpreter_version: "3.11".to_string(),
            log_level: 0,
            log_write: false,
            timeout_start: Duration::from_secs(30),
            timeout_stop: Duration::from_secs(10),
        }
    }
}

/// Generates an 8 lowercase hex character session id.
///
/// Rust rendering of `pycrosscall/lib.py::generate_session_id`
/// (`get_randhashstr(8)`).
pub fn generate_session_id() -> String {
    use rand::Rng;
    let value: u32 = rand::thread_rng().gen();
    format!("{value:08x}")
}
