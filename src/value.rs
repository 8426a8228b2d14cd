//! Wire-level value representation (component C, data half).
//!
//! [`Arg`] is what callers hand to [`crate::session::Routine::call`] and get
//! back as a return value — the Rust analogue of a ctypes Python value.
//! [`PackedValue`]/[`MemBlock`]/[`CallPayload`] are what actually crosses the
//! RPC channel once [`crate::marshal`] has packed an `Arg` tree against its
//! [`crate::types::NativeType`].

use std::cell::RefCell;
use std::rc::Rc;

use serde::{Deserialize, Serialize};

use crate::types::TypeDesc;

/// A call argument or return value.
///
/// Pointer-typed slots (`c_void_p`, `c_char*`, any `Decl::Pointer`) are
/// represented by [`Arg::Bytes`] (the pointee content the caller wants
/// written into a fresh guest-side buffer) or [`Arg::Null`]; the marshaler
/// is responsible for allocating the memblock and wiring the pointer slot
/// to it.
#[derive(Debug, Clone, PartialEq)]
pub enum Arg {
    I8(i8),
    U8(u8),
    I16(i16),
    U16(u16),
    I32(i32),
    U32(u32),
    I64(i64),
    U64(u64),
    F32(f32),
    F64(f64),
    Bool(bool),
    Char(u8),
    WChar(u16),
    /// A pointer value taken by address rather than by pointee (e.g. a
    /// callback trampoline address, or a raw `c_void_p` the caller already
    /// holds).
    Address(u64),
    /// Pointee bytes for a pointer-typed slot; the marshaler allocates a
    /// memblock for these and writes the memblock's address into the slot.
    /// Use [`Arg::Shared`] instead when the same buffer is passed through
    /// more than one argument slot and the aliasing must survive the call.
    Bytes(Vec<u8>),
    /// Pointee bytes shared by identity. Two `Arg::Shared` values wrapping
    /// the same `Rc` pack to the same [`MemBlockId`]: the marshaler's
    /// per-call memoization table is keyed on `Rc::as_ptr`, breaking cycles
    /// and preserving aliasing the way a plain `Bytes` clone would not.
    Shared(Rc<RefCell<Vec<u8>>>),
    /// A null pointer.
    Null,
    /// Struct field values, in declaration order.
    Struct(Vec<Arg>),
    /// Array element values.
    Array(Vec<Arg>),
}

/// Identifies one memory block within a single call's payload. Stable only
/// for the lifetime of the call (or, for `inout`/write-back, the round
/// trip); never a cross-call identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MemBlockId(pub u64);

/// A pointer-reachable buffer carried alongside the scalar argument tree.
///
/// Memblocks exist because the wire format cannot embed self-referential or
/// pointer-aliased data inline: every pointer slot's value is a
/// [`MemBlockId`] reference, and the actual bytes travel once per distinct
/// identity in `memblocks`, breaking cycles and preserving aliasing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemBlock {
    pub id: MemBlockId,
    pub bytes: Vec<u8>,
}

/// A packed argument or return value as it travels over the wire: the
/// slot's own scalar bytes (little-endian; pointer-sized if the slot is a
/// pointer), plus the memblock it points into, if any.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PackedValue {
    pub scalar: Vec<u8>,
    pub points_to: Option<MemBlockId>,
}

/// A fully packed call: the routine to invoke, its declared argument types
/// (sent alongside the payload so the guest need not remember a prior
/// `set_types` call if the session was re-established), and every memblock
/// reachable from the argument tree.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallPayload {
    pub library: String,
    pub routine: String,
    pub argument_types: Vec<TypeDesc>,
    pub return_type: TypeDesc,
    pub args: Vec<PackedValue>,
    pub memblocks: Vec<MemBlock>,
    pub memsync: Vec<crate::memsync::Directive>,
}

/// The reply to a call: the packed return value plus whatever memblocks
/// changed (write-back for `out`/`inout` memsync directives).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallReply {
    pub retval: PackedValue,
    pub memblocks: Vec<MemBlock>,
}
