//! Library and routine registry (component E).
//!
//! Tracks which libraries a session has loaded and which routines have been
//! attached with declared types, on both sides of the bridge: the client
//! registry remembers what the caller declared so repeat calls don't resend
//! `set_types`' payload, and the guest registry remembers it so repeat
//! dispatch doesn't re-resolve the symbol. Loading the same library twice is
//! a no-op (idempotent); re-attaching a routine's types replaces the
//! previous binding atomically rather than erroring, matching how ctypes
//! lets a caller redeclare `argtypes`/`restype` on the same function object.

use std::collections::HashMap;
use std::sync::RwLock;

use crate::error::BridgeError;
use crate::memsync::Directive;
use crate::types::{CallingConvention, TypeDesc};

/// Which ctypes-style loader semantics a library was opened with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum LibraryKind {
    /// `cdecl` calling convention, errno left alone by the bridge.
    Cdll,
    /// `stdcall` calling convention (`WinDLL` in ctypes terms).
    Windll,
    /// `stdcall` with COM/HRESULT error-checking (`OleDLL` in ctypes terms).
    Oledll,
}

impl LibraryKind {
    pub fn convention(self) -> CallingConvention {
        match self {
            Self::Cdll => CallingConvention::Cdecl,
            Self::Windll => CallingConvention::Stdcall,
            Self::Oledll => CallingConvention::Oledll,
        }
    }

    pub fn from_str(s: &str) -> Result<Self, BridgeError> {
        match s {
            "cdll" => Ok(Self::Cdll),
            "windll" => Ok(Self::Windll),
            "oledll" => Ok(Self::Oledll),
            other => Err(BridgeError::UnknownConvention(other.to_string())),
        }
    }
}

/// A routine attached with declared argument/return types and memsync
/// directives.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct RoutineBinding {
    pub library: String,
    pub name: String,
    pub argument_types: Vec<TypeDesc>,
    pub return_type: TypeDesc,
    pub memsync: Vec<Directive>,
}

#[derive(Debug, Default)]
struct RegistryState {
    libraries: HashMap<String, LibraryKind>,
    routines: HashMap<(String, String), RoutineBinding>,
}

/// Thread-safe library/routine registry, shared by a session (client side)
/// or a server (guest side).
#[derive(Default)]
pub struct Registry {
    state: RwLock<RegistryState>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records that `name` has been loaded as `kind`. Idempotent: loading
    /// the same name with the same kind again is a no-op. Loading the same
    /// name with a *different* kind is a `load_failed` — the library handle
    /// already carries calling-convention semantics that can't change out
    /// from under attached routines.
    pub fn load_library(&self, name: &str, kind: LibraryKind) -> Result<(), BridgeError> {
        let mut state = self.state.write().expect("registry lock poisoned");
        match state.libraries.get(name) {
            Some(existing) if *existing != kind => Err(BridgeError::LoadFailed(format!(
                "{name} already loaded as a different library kind"
            ))),
            Some(_) => Ok(()),
            None => {
                state.libraries.insert(name.to_string(), kind);
                Ok(())
            }
        }
    }

    pub fn library_kind(&self, name: &str) -> Option<LibraryKind> {
        self.state.read().expect("registry lock poisoned").libraries.get(name).copied()
    }

    /// Attaches (or re-attaches) a routine's declared types. The library
    /// must already be loaded.
    pub fn attach_routine(&self, binding: RoutineBinding) -> Result<(), BridgeError> {
        let mut state = self.state.write().expect("registry lock poisoned");
        if !state.libraries.contains_key(&binding.library) {
            return Err(BridgeError::AttributeMissing {
                library: binding.library.clone(),
                routine: binding.name.clone(),
            });
        }
        state
            .routines
            .insert((binding.library.clone(), binding.name.clone()), binding);
        Ok(())
    }

    pub fn routine(&self, library: &str, name: &str) -> Result<RoutineBinding, BridgeError> {
        self.state
            .read()
            .expect("registry lock poisoned")
            .routines
            .get(&(library.to_string(), name.to_string()))
            .cloned()
            .ok_or_else(|| BridgeError::AttributeMissing {
                library: library.to_string(),
                routine: name.to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loading_the_same_library_twice_is_a_no_op() {
        let registry = Registry::new();
        registry.load_library("demo.dll", LibraryKind::Cdll).unwrap();
        registry.load_library("demo.dll", LibraryKind::Cdll).unwrap();
        assert_eq!(registry.library_kind("demo.dll"), Some(LibraryKind::Cdll));
    }

    #[test]
    fn reloading_with_a_different_kind_fails() {
        let registry = Registry::new();
        registry.load_library("demo.dll", LibraryKind::Cdll).unwrap();
        let err = registry.load_library("demo.dll", LibraryKind::Windll).unwrap_err();
        assert!(matches!(err, BridgeError::LoadFailed(_)));
    }

    #[test]
    fn attaching_before_loading_fails_with_attribute_missing() {
        let registry = Registry::new();
        let binding = RoutineBinding {
            library: "demo.dll".to_string(),
            name: "add".to_string(),
            argument_types: vec![],
            return_type: TypeDesc::Fundamental {
                name: "c_int32".to_string(),
                pointer_depth: 0,
                array_shape: vec![],
            },
            memsync: vec![],
        };
        let err = registry.attach_routine(binding).unwrap_err();
        assert!(matches!(err, BridgeError::AttributeMissing { .. }));
    }

    #[test]
    fn reattaching_a_routine_replaces_the_binding() {
        let registry = Registry::new();
        registry.load_library("demo.dll", LibraryKind::Cdll).unwrap();
        let make = |ret_name: &str| RoutineBinding {
            library: "demo.dll".to_string(),
            name: "add".to_string(),
            argument_types: vec![],
            return_type: TypeDesc::Fundamental {
                name: ret_name.to_string(),
                pointer_depth: 0,
                array_shape: vec![],
            },
            memsync: vec![],
        };
        registry.attach_routine(make("c_int16")).unwrap();
        registry.attach_routine(make("c_int32")).unwrap();
        let binding = registry.routine("demo.dll", "add").unwrap();
        assert_eq!(
            binding.return_type,
            TypeDesc::Fundamental {
                name: "c_int32".to_string(),
                pointer_depth: 0,
                array_shape: vec![],
            }
        );
    }

    #[test]
    fn unknown_library_kind_string_is_rejected() {
        let err = LibraryKind::from_str("fancydll").unwrap_err();
        assert!(matches!(err, BridgeError::UnknownConvention(_)));
    }
}
