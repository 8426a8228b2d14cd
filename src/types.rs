//! Type-description codec (component B).
//!
//! [`Decl`] is what a caller declares client-side (the Rust analogue of a
//! ctypes type object: `c_int16`, `POINTER(c_int16)`, a struct built from
//! `_fields_`, a callback type). [`encode`] turns a `Decl` into the portable
//! [`TypeDesc`] tree that crosses the wire. [`decode`] turns a `TypeDesc`
//! back into a [`NativeType`] with the size/alignment/offsets the marshaler
//! and the guest-side invoker need, memoizing struct shapes in a
//! [`TypeRegistry`] so the same portable name always yields the same
//! synthesized type within a session, with a conflicting redeclaration
//! failing fast instead of silently reinterpreting old data under a new
//! layout.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::config::Arch;
use crate::error::BridgeError;

/// The closed set of fundamental C types this bridge understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Fundamental {
    I8,
    U8,
    I16,
    U16,
    I32,
    U32,
    I64,
    U64,
    F32,
    F64,
    Char,
    WChar,
    VoidP,
    Bool,
    SizeT,
    SSizeT,
}

impl Fundamental {
    pub fn wire_name(self) -> &'static str {
        match self {
            Self::I8 => "c_int8",
            Self::U8 => "c_uint8",
            Self::I16 => "c_int16",
            Self::U16 => "c_uint16",
            Self::I32 => "c_int32",
            Self::U32 => "c_uint32",
            Self::I64 => "c_int64",
            Self::U64 => "c_uint64",
            Self::F32 => "c_float",
            Self::F64 => "c_double",
            Self::Char => "c_char",
            Self::WChar => "c_wchar",
            Self::VoidP => "c_void_p",
            Self::Bool => "c_bool",
            Self::SizeT => "c_size_t",
            Self::SSizeT => "c_ssize_t",
        }
    }

    pub fn from_wire_name(name: &str) -> Option<Self> {
        Some(match name {
            "c_int8" => Self::I8,
            "c_uint8" => Self::U8,
            "c_int16" => Self::I16,
            "c_uint16" => Self::U16,
            "c_int32" => Self::I32,
            "c_uint32" => Self::U32,
            "c_int64" => Self::I64,
            "c_uint64" => Self::U64,
            "c_float" => Self::F32,
            "c_double" => Self::F64,
            "c_char" => Self::Char,
            "c_wchar" => Self::WChar,
            "c_void_p" => Self::VoidP,
            "c_bool" => Self::Bool,
            "c_size_t" => Self::SizeT,
            "c_ssize_t" => Self::SSizeT,
            _ => return None,
        })
    }

    /// Natural size in bytes, pointer-sized types resolved for `arch`.
    pub fn size(self, arch: Arch) -> usize {
        let ptr = match arch {
            Arch::X86 => 4,
            Arch::X86_64 => 8,
        };
        match self {
            Self::I8 | Self::U8 | Self::Char | Self::Bool => 1,
            Self::I16 | Self::U16 | Self::WChar => 2,
            Self::I32 | Self::U32 | Self::F32 => 4,
            Self::I64 | Self::U64 | Self::F64 => 8,
            Self::VoidP | Self::SizeT | Self::SSizeT => ptr,
        }
    }
}

/// Calling convention, shared by library handles, routine function-pointer
/// types, and callback types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CallingConvention {
    Cdecl,
    Stdcall,
    /// stdcall with COM/HRESULT error semantics.
    Oledll,
}

/// `use_errno` / `use_last_error` flags carried by callback and routine
/// function-pointer types.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunctionFlags {
    pub use_errno: bool,
    pub use_last_error: bool,
}

/// A client-declared type. The Rust analogue of a ctypes type object.
#[derive(Debug, Clone, PartialEq)]
pub enum Decl {
    Fundamental(Fundamental),
    Pointer(Box<Decl>),
    Array(Box<Decl>, usize),
    Struct(StructDecl),
    Function(FunctionDecl),
    /// A composite the caller cannot express in terms of the above.
    /// Encodes successfully (to [`TypeDesc::Opaque`]) but any attempt to
    /// actually use it in a call fails with `type_unsupported`.
    Opaque(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct StructDecl {
    pub name: String,
    pub fields: Vec<(String, Decl)>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FunctionDecl {
    pub convention: CallingConvention,
    pub return_type: Box<Decl>,
    pub argument_types: Vec<Decl>,
    pub flags: FunctionFlags,
}

/// The portable, wire-shaped type description that crosses the RPC channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TypeDesc {
    Fundamental {
        name: String,
        pointer_depth: u8,
        array_shape: Vec<usize>,
    },
    Struct {
        name: String,
        fields: Vec<(String, TypeDesc)>,
        pointer_depth: u8,
        array_shape: Vec<usize>,
    },
    Function {
        convention: CallingConvention,
        return_type: Box<TypeDesc>,
        argument_types: Vec<TypeDesc>,
        flags: FunctionFlags,
    },
    Opaque {
        name: String,
    },
}

/// Unwraps `Decl::Pointer`/`Decl::Array` wrappers, returning the base decl
/// plus the accumulated pointer depth and array shape (outermost dimension
/// first, matching declaration order).
fn peel(mut decl: &Decl) -> (&Decl, u8, Vec<usize>) {
    let mut pointer_depth = 0u8;
    let mut array_shape = Vec::new();
    loop {
        match decl {
            Decl::Pointer(inner) => {
                pointer_depth += 1;
                decl = inner;
            }
            Decl::Array(inner, len) => {
                array_shape.push(*len);
                decl = inner;
            }
            _ => break,
        }
    }
    (decl, pointer_depth, array_shape)
}

/// Encodes a client-declared type into the portable tree (client → payload).
pub fn encode(decl: &Decl) -> TypeDesc {
    let (base, pointer_depth, array_shape) = peel(decl);
    match base {
        Decl::Fundamental(f) => TypeDesc::Fundamental {
            name: f.wire_name().to_string(),
            pointer_depth,
            array_shape,
        },
        Decl::Struct(s) => TypeDesc::Struct {
            name: s.name.clone(),
            fields: s
                .fields
                .iter()
                .map(|(name, field)| (name.clone(), encode(field)))
                .collect(),
            pointer_depth,
            array_shape,
        },
        Decl::Function(f) => TypeDesc::Function {
            convention: f.convention,
            return_type: Box::new(encode(&f.return_type)),
            argument_types: f.argument_types.iter().map(encode).collect(),
            flags: f.flags,
        },
        Decl::Opaque(name) => TypeDesc::Opaque { name: name.clone() },
        Decl::Pointer(_) | Decl::Array(_, _) => unreachable!("peeled by `peel`"),
    }
}

/// A reconstructed native type, carrying the layout the marshaler needs.
#[derive(Debug, Clone, PartialEq)]
pub enum NativeType {
    Fundamental {
        fundamental: Fundamental,
        pointer_depth: u8,
        array_shape: Vec<usize>,
        layout: Layout,
    },
    Struct {
        name: String,
        fields: Vec<(String, NativeType)>,
        pointer_depth: u8,
        array_shape: Vec<usize>,
        layout: Layout,
    },
    Function {
        convention: CallingConvention,
        return_type: Box<NativeType>,
        argument_types: Vec<NativeType>,
        flags: FunctionFlags,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Layout {
    pub size: usize,
    pub align: usize,
}

impl NativeType {
    pub fn layout(&self) -> Layout {
        match self {
            Self::Fundamental { layout, .. } | Self::Struct { layout, .. } => *layout,
            Self::Function { .. } => Layout {
                size: std::mem::size_of::<usize>(),
                align: std::mem::size_of::<usize>(),
            },
        }
    }

    pub fn pointer_depth(&self) -> u8 {
        match self {
            Self::Fundamental { pointer_depth, .. } | Self::Struct { pointer_depth, .. } => {
                *pointer_depth
            }
            Self::Function { .. } => 0,
        }
    }
}

fn pointer_size(arch: Arch) -> usize {
    match arch {
        Arch::X86 => 4,
        Arch::X86_64 => 8,
    }
}

fn array_layout(element: Layout, array_shape: &[usize]) -> Layout {
    let count: usize = array_shape.iter().product::<usize>().max(if array_shape.is_empty() { 1 } else { 0 });
    let count = if array_shape.is_empty() { 1 } else { count.max(array_shape.iter().product()) };
    Layout {
        size: element.size * count,
        align: element.align,
    }
}

/// Computes natural-alignment struct layout (field offsets not retained
/// beyond construction time; callers needing per-field offsets recompute
/// them identically via [`struct_field_offsets`]).
fn struct_layout(fields: &[(String, NativeType)]) -> Layout {
    let mut offset = 0usize;
    let mut max_align = 1usize;
    for (_, field) in fields {
        let l = field.layout();
        max_align = max_align.max(l.align);
        offset = align_up(offset, l.align) + l.size;
    }
    Layout {
        size: align_up(offset, max_align),
        align: max_align,
    }
}

/// Field byte offsets for a struct, in declaration order.
pub fn struct_field_offsets(fields: &[(String, NativeType)]) -> Vec<usize> {
    let mut offset = 0usize;
    let mut offsets = Vec::with_capacity(fields.len());
    for (_, field) in fields {
        let l = field.layout();
        offset = align_up(offset, l.align);
        offsets.push(offset);
        offset += l.size;
    }
    offsets
}

fn align_up(offset: usize, align: usize) -> usize {
    if align == 0 {
        return offset;
    }
    (offset + align - 1) / align * align
}

/// Memoizes struct shapes so the same portable name always produces the
/// same synthesized native type within a session, and rejects a
/// conflicting redeclaration with `type_conflict`.
#[derive(Debug, Default)]
pub struct TypeRegistry {
    structs: HashMap<String, Vec<(String, TypeDesc)>>,
}

impl TypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decodes a portable type description into a native type, synthesizing
    /// and memoizing struct types as needed (payload → foreign type).
    pub fn decode(&mut self, desc: &TypeDesc, arch: Arch) -> Result<NativeType, BridgeError> {
        match desc {
            TypeDesc::Fundamental {
                name,
                pointer_depth,
                array_shape,
            } => {
                let fundamental = Fundamental::from_wire_name(name)
                    .ok_or_else(|| BridgeError::TypeUnsupported(name.clone()))?;
                let base_layout = if *pointer_depth > 0 {
                    Layout {
                        size: pointer_size(arch),
                        align: pointer_size(arch),
                    }
                } else {
                    Layout {
                        size: fundamental.size(arch),
                        align: fundamental.size(arch),
                    }
                };
                let layout = array_layout(base_layout, array_shape);
                Ok(NativeType::Fundamental {
                    fundamental,
                    pointer_depth: *pointer_depth,
                    array_shape: array_shape.clone(),
                    layout,
                })
            }
            TypeDesc::Struct {
                name,
                fields,
                pointer_depth,
                array_shape,
            } => {
                if let Some(existing) = self.structs.get(name) {
                    if existing != fields {
                        return Err(BridgeError::TypeConflict { name: name.clone() });
                    }
                } else {
                    self.structs.insert(name.clone(), fields.clone());
                }

                let native_fields = fields
                    .iter()
                    .map(|(fname, fdesc)| Ok((fname.clone(), self.decode(fdesc, arch)?)))
                    .collect::<Result<Vec<_>, BridgeError>>()?;

                let base_layout = if *pointer_depth > 0 {
                    Layout {
                        size: pointer_size(arch),
                        align: pointer_size(arch),
                    }
                } else {
                    struct_layout(&native_fields)
                };
                let layout = array_layout(base_layout, array_shape);

                Ok(NativeType::Struct {
                    name: name.clone(),
                    fields: native_fields,
                    pointer_depth: *pointer_depth,
                    array_shape: array_shape.clone(),
                    layout,
                })
            }
            TypeDesc::Function {
                convention,
                return_type,
                argument_types,
                flags,
            } => Ok(NativeType::Function {
                convention: *convention,
                return_type: Box::new(self.decode(return_type, arch)?),
                argument_types: argument_types
                    .iter()
                    .map(|t| self.decode(t, arch))
                    .collect::<Result<_, _>>()?,
                flags: *flags,
            }),
            TypeDesc::Opaque { name } => Err(BridgeError::TypeUnsupported(name.clone())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_scalar() {
        let desc = encode(&Decl::Fundamental(Fundamental::I16));
        assert_eq!(
            desc,
            TypeDesc::Fundamental {
                name: "c_int16".to_string(),
                pointer_depth: 0,
                array_shape: vec![],
            }
        );
    }

    #[test]
    fn char_pointer_is_not_void_pointer() {
        let char_ptr = encode(&Decl::Pointer(Box::new(Decl::Fundamental(Fundamental::Char))));
        let void_ptr = encode(&Decl::Fundamental(Fundamental::VoidP));
        assert_ne!(char_ptr, void_ptr);
        match char_ptr {
            TypeDesc::Fundamental { name, pointer_depth, .. } => {
                assert_eq!(name, "c_char");
                assert_eq!(pointer_depth, 1);
            }
            _ => panic!("expected fundamental"),
        }
    }

    #[test]
    fn pointer_depth_three_round_trips() {
        let decl = Decl::Pointer(Box::new(Decl::Pointer(Box::new(Decl::Pointer(Box::new(
            Decl::Fundamental(Fundamental::I32),
        ))))));
        let desc = encode(&decl);
        match &desc {
            TypeDesc::Fundamental { pointer_depth, .. } => assert_eq!(*pointer_depth, 3),
            _ => panic!("expected fundamental"),
        }
        let mut registry = TypeRegistry::new();
        let native = registry.decode(&desc, Arch::X86_64).unwrap();
        assert_eq!(native.pointer_depth(), 3);
        assert_eq!(native.layout().size, 8);
    }

    #[test]
    fn struct_field_order_is_preserved() {
        let point = Decl::Struct(StructDecl {
            name: "Point".to_string(),
            fields: vec![
                ("x".to_string(), Decl::Fundamental(Fundamental::I32)),
                ("y".to_string(), Decl::Fundamental(Fundamental::I32)),
            ],
        });
        let desc = encode(&point);
        let mut registry = TypeRegistry::new();
        let native = registry.decode(&desc, Arch::X86_64).unwrap();
        match native {
            NativeType::Struct { fields, layout, .. } => {
                assert_eq!(fields[0].0, "x");
                assert_eq!(fields[1].0, "y");
                assert_eq!(layout.size, 8);
                assert_eq!(struct_field_offsets(&fields), vec![0, 4]);
            }
            _ => panic!("expected struct"),
        }
    }

    #[test]
    fn struct_redeclaration_with_same_shape_is_reused() {
        let mut registry = TypeRegistry::new();
        let a = TypeDesc::Struct {
            name: "Point".to_string(),
            fields: vec![("x".to_string(), TypeDesc::Fundamental {
                name: "c_int32".to_string(),
                pointer_depth: 0,
                array_shape: vec![],
            })],
            pointer_depth: 0,
            array_shape: vec![],
        };
        assert!(registry.decode(&a, Arch::X86_64).is_ok());
        assert!(registry.decode(&a, Arch::X86_64).is_ok());
    }

    #[test]
    fn struct_redeclaration_with_different_shape_conflicts() {
        let mut registry = TypeRegistry::new();
        let a = TypeDesc::Struct {
            name: "Point".to_string(),
            fields: vec![("x".to_string(), TypeDesc::Fundamental {
                name: "c_int32".to_string(),
                pointer_depth: 0,
                array_shape: vec![],
            })],
            pointer_depth: 0,
            array_shape: vec![],
        };
        let b = TypeDesc::Struct {
            name: "Point".to_string(),
            fields: vec![("x".to_string(), TypeDesc::Fundamental {
                name: "c_int64".to_string(),
                pointer_depth: 0,
                array_shape: vec![],
            })],
            pointer_depth: 0,
            array_shape: vec![],
        };
        assert!(registry.decode(&a, Arch::X86_64).is_ok());
        let err = registry.decode(&b, Arch::X86_64).unwrap_err();
        assert!(matches!(err, BridgeError::TypeConflict { .. }));
    }

    #[test]
    fn opaque_type_fails_on_use() {
        let desc = encode(&Decl::Opaque("COM_interface_ptr".to_string()));
        let mut registry = TypeRegistry::new();
        let err = registry.decode(&desc, Arch::X86_64).unwrap_err();
        assert!(matches!(err, BridgeError::TypeUnsupported(_)));
    }

    #[test]
    fn zero_sized_trailing_array_has_zero_size() {
        let desc = TypeDesc::Fundamental {
            name: "c_uint8".to_string(),
            pointer_depth: 0,
            array_shape: vec![0],
        };
        let mut registry = TypeRegistry::new();
        let native = registry.decode(&desc, Arch::X86_64).unwrap();
        assert_eq!(native.layout().size, 0);
    }
}
