//! Native invocation: resolving a loaded DLL's exported symbol and actually
//! calling it, guest-side.
//!
//! Loading is [`libloading`] (the same crate the rest of the Rust FFI
//! ecosystem reaches for — see `examples/other_examples/0b9d63c5_...rs` for
//! the same load/sym/close shape this is grounded on). Invocation goes
//! through `libffi`'s raw bindings directly rather than its typed `middle`
//! layer: every argument has already been marshaled down to a raw
//! little-endian byte buffer of exactly its native size
//! ([`crate::marshal::pack`]), and the return value's size is only known at
//! runtime, so `ffi_call`'s pointer-in/pointer-out shape is the one that
//! fits without forcing a reconstruction into typed Rust values first.
//!
//! [`NativeArg`] distinguishes an argument whose bytes *are* its ABI value
//! from one whose bytes are a referent `ffi_call` must be pointed at —
//! pointer-typed and by-reference-struct arguments need that second level
//! of indirection, since libffi always dereferences `avalues[i]` exactly
//! once to get the value it hands to the callee.

use std::collections::HashMap;
use std::ffi::c_void;
use std::mem::MaybeUninit;

use libffi::raw as ffi;
use libloading::Library;

use crate::error::BridgeError;
use crate::types::{CallingConvention, Fundamental, NativeType};

/// Loaded libraries, keyed by the name they were declared under.
#[derive(Default)]
pub struct NativeLibraries {
    loaded: HashMap<String, Library>,
}

impl NativeLibraries {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn load(&mut self, name: &str) -> Result<(), BridgeError> {
        if self.loaded.contains_key(name) {
            return Ok(());
        }
        // SAFETY: loading an arbitrary DLL runs its initializers; the
        // caller is trusted to name a library it intends to execute.
        let library = unsafe { Library::new(name) }.map_err(|e| BridgeError::LoadFailed(e.to_string()))?;
        self.loaded.insert(name.to_string(), library);
        Ok(())
    }

    fn symbol(&self, library: &str, routine: &str) -> Result<*const c_void, BridgeError> {
        let lib = self.loaded.get(library).ok_or_else(|| BridgeError::AttributeMissing {
            library: library.to_string(),
            routine: routine.to_string(),
        })?;
        // SAFETY: the resulting pointer is used only for an immediate
        // `ffi_call` below, never retained past this function.
        unsafe {
            lib.get::<*const c_void>(routine.as_bytes())
                .map(|sym| *sym)
                .map_err(|_| BridgeError::AttributeMissing {
                    library: library.to_string(),
                    routine: routine.to_string(),
                })
        }
    }

    /// Resolves `routine` in `library` and invokes it with `args` (each
    /// entry already sized to its declared native type), returning the raw
    /// return-value bytes. A [`NativeArg::Ref`] entry's bytes are mutated in
    /// place by the call when the routine writes through that argument's
    /// pointer — the caller reads them back out of the same `NativeArg` it
    /// passed in.
    pub fn call(
        &self,
        library: &str,
        routine: &str,
        convention: CallingConvention,
        argument_types: &[NativeType],
        return_type: &NativeType,
        args: &[NativeArg],
    ) -> Result<Vec<u8>, BridgeError> {
        let symbol = self.symbol(library, routine)?;
        if convention != CallingConvention::Cdecl {
            tracing::debug!(?convention, "non-cdecl convention requested; guest ABI selection is host-default only");
        }
        // SAFETY: `cif` is fully initialized by `ffi_prep_cif` before use,
        // `symbol` was just resolved from a loaded library, and each
        // `args[i]` is guaranteed by the marshaler to be exactly
        // `argument_types[i]`'s native size (or, for `NativeArg::Ref`, the
        // size of the referent it points at).
        unsafe { invoke(symbol, argument_types, return_type, args) }
    }
}

/// One resolved call argument, as `ffi_call` needs to see it.
///
/// A C argument's value and the bytes libffi must be pointed at are the
/// same thing only for scalars. A pointer-typed argument's *value* is an
/// address; when that address is itself the content the caller wants read
/// or written (a buffer, a by-reference struct), `avalues[i]` must point at
/// a pointer-sized cell holding that address, not at the content directly —
/// `ffi_call` always dereferences `avalues[i]` exactly once.
pub enum NativeArg {
    /// These bytes are the exact ABI value for the slot: a scalar, or a
    /// pointer value already known by address (including a null pointer).
    Value(Vec<u8>),
    /// These bytes are the referent of a pointer-typed or by-reference
    /// struct slot; libffi needs the address of this buffer, not its
    /// content read directly as the pointer value.
    Ref(Vec<u8>),
}

unsafe fn invoke(
    symbol: *const c_void,
    argument_types: &[NativeType],
    return_type: &NativeType,
    args: &[NativeArg],
) -> Result<Vec<u8>, BridgeError> {
    let mut arg_ffi_types: Vec<*mut ffi::ffi_type> = argument_types.iter().map(|t| ffi_type_for(t)).collect();
    let return_ffi_type = ffi_type_for(return_type);

    let mut cif: MaybeUninit<ffi::ffi_cif> = MaybeUninit::zeroed();
    let status = ffi::ffi_prep_cif(
        cif.as_mut_ptr(),
        ffi::ffi_abi_FFI_DEFAULT_ABI,
        arg_ffi_types.len() as u32,
        return_ffi_type,
        arg_ffi_types.as_mut_ptr(),
    );
    if status != ffi::ffi_status_FFI_OK {
        return Err(BridgeError::TypeUnsupported("libffi rejected the call signature".to_string()));
    }

    // `Ref` arguments need a second level of indirection: a pointer-sized
    // cell holding the referent's address, since `ffi_call` reads the
    // pointer *value* straight out of `avalues[i]`. `ref_cells` must outlive
    // the `ffi_call` below, and must not reallocate once `arg_ptrs` below
    // has taken addresses into it — reserving capacity up front guarantees
    // that.
    let mut ref_cells: Vec<*const c_void> = Vec::with_capacity(args.len());
    for arg in args {
        if let NativeArg::Ref(bytes) = arg {
            ref_cells.push(bytes.as_ptr() as *const c_void);
        }
    }

    let mut arg_ptrs: Vec<*mut c_void> = Vec::with_capacity(args.len());
    let mut ref_idx = 0usize;
    for arg in args {
        match arg {
            NativeArg::Value(bytes) => arg_ptrs.push(bytes.as_ptr() as *mut c_void),
            NativeArg::Ref(_) => {
                arg_ptrs.push(&mut ref_cells[ref_idx] as *mut *const c_void as *mut c_void);
                ref_idx += 1;
            }
        }
    }

    let result_size = return_type.layout().size.max(std::mem::size_of::<u64>());
    let mut result_buf = vec![0u8; result_size];

    let entry_point: extern "C" fn() = std::mem::transmute(symbol);
    ffi::ffi_call(
        cif.as_mut_ptr(),
        Some(entry_point),
        result_buf.as_mut_ptr() as *mut c_void,
        arg_ptrs.as_mut_ptr(),
    );

    result_buf.truncate(return_type.layout().size);
    Ok(result_buf)
}

/// Maps a marshaled native type to the `libffi` type descriptor libffi
/// needs to generate the call. Pointer-typed slots of any base type are
/// always pointer-sized, regardless of what they point to.
fn ffi_type_for(native: &NativeType) -> *mut ffi::ffi_type {
    unsafe {
        if native.pointer_depth() > 0 {
            return std::ptr::addr_of_mut!(ffi::ffi_type_pointer);
        }
        match native {
            NativeType::Fundamental { fundamental, .. } => match fundamental {
                Fundamental::I8 | Fundamental::Char | Fundamental::Bool => std::ptr::addr_of_mut!(ffi::ffi_type_sint8),
                Fundamental::U8 => std::ptr::addr_of_mut!(ffi::ffi_type_uint8),
                Fundamental::I16 => std::ptr::addr_of_mut!(ffi::ffi_type_sint16),
                Fundamental::U16 | Fundamental::WChar => std::ptr::addr_of_mut!(ffi::ffi_type_uint16),
                Fundamental::I32 => std::ptr::addr_of_mut!(ffi::ffi_type_sint32),
                Fundamental::U32 => std::ptr::addr_of_mut!(ffi::ffi_type_uint32),
                Fundamental::I64 | Fundamental::SSizeT => std::ptr::addr_of_mut!(ffi::ffi_type_sint64),
                Fundamental::U64 | Fundamental::SizeT => std::ptr::addr_of_mut!(ffi::ffi_type_uint64),
                Fundamental::F32 => std::ptr::addr_of_mut!(ffi::ffi_type_float),
                Fundamental::F64 => std::ptr::addr_of_mut!(ffi::ffi_type_double),
                Fundamental::VoidP => std::ptr::addr_of_mut!(ffi::ffi_type_pointer),
            },
            NativeType::Struct { .. } => std::ptr::addr_of_mut!(ffi::ffi_type_pointer),
            NativeType::Function { .. } => std::ptr::addr_of_mut!(ffi::ffi_type_pointer),
        }
    }
}
