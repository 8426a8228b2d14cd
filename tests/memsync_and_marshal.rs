use winbridge::config::Arch;
use winbridge::marshal::{self, PackCtx};
use winbridge::memsync::{self, Direction, Length, PathSegment, RawValue};
use winbridge::types::{self, Decl, Fundamental, StructDecl, TypeRegistry};
use winbridge::value::Arg;

#[test]
fn non_list_memsync_attribute_is_rejected_with_the_exact_message() {
    let raw = RawValue::Map(vec![("pointer".to_string(), RawValue::Int(0))]);
    let err = memsync::parse_all(&raw).unwrap_err();
    assert_eq!(err.to_string(), "memsync attribute must be a list");
}

#[test]
fn length_driven_buffer_round_trips_through_pack_and_unpack() {
    // A routine declared as `fill(buf: c_uint8*, len: c_int32)` where the
    // buffer's real size is given by the sibling `len` argument.
    let directive_raw = RawValue::List(vec![RawValue::Map(vec![
        ("pointer".to_string(), RawValue::List(vec![RawValue::Int(0)])),
        ("length".to_string(), RawValue::List(vec![RawValue::Int(1)])),
        ("type".to_string(), RawValue::Str("c_uint8".to_string())),
        ("direction".to_string(), RawValue::Str("inout".to_string())),
    ])]);
    let directives = memsync::parse_all(&directive_raw).unwrap();
    assert_eq!(directives[0].direction, Direction::InOut);

    let buf_ty = types::encode(&Decl::Pointer(Box::new(Decl::Fundamental(Fundamental::U8))));
    let mut registry = TypeRegistry::new();
    let native_buf = registry.decode(&buf_ty, Arch::X86_64).unwrap();

    let args = vec![Arg::Bytes(vec![1, 2, 3, 4]), Arg::I32(4)];
    let length =
        memsync::resolve_length(&directives[0].length, &args, directives[0].element, None, Arch::X86_64).unwrap();
    assert_eq!(length, 4);

    let mut ctx = PackCtx::new();
    let packed = marshal::pack(&native_buf, &args[0], &mut ctx).unwrap();
    let blocks = ctx.into_memblocks();
    let back = marshal::unpack(&native_buf, &packed, &blocks).unwrap();
    assert_eq!(back, Arg::Bytes(vec![1, 2, 3, 4]));
}

#[test]
fn null_terminated_buffer_resolves_without_a_declared_length_argument() {
    let directive_raw = RawValue::List(vec![RawValue::Map(vec![
        ("pointer".to_string(), RawValue::List(vec![RawValue::Int(0)])),
        ("length".to_string(), RawValue::Str("null_terminated".to_string())),
        ("type".to_string(), RawValue::Str("c_char".to_string())),
        ("direction".to_string(), RawValue::Str("in".to_string())),
    ])]);
    let directives = memsync::parse_all(&directive_raw).unwrap();
    assert!(matches!(directives[0].length, Length::NullTerminated));
    assert!(matches!(directives[0].pointer_path[0], PathSegment::Arg(0)));

    let bytes = b"hello\0garbage-after-terminator".to_vec();
    let n =
        memsync::resolve_length(&Length::NullTerminated, &[], directives[0].element, Some(&bytes), Arch::X86_64).unwrap();
    assert_eq!(n, 5);
}

#[test]
fn struct_with_scalar_fields_round_trips_through_pack_and_unpack() {
    let point3 = Decl::Struct(StructDecl {
        name: "Point3".to_string(),
        fields: vec![
            ("x".to_string(), Decl::Fundamental(Fundamental::F64)),
            ("y".to_string(), Decl::Fundamental(Fundamental::F64)),
            ("z".to_string(), Decl::Fundamental(Fundamental::F64)),
        ],
    });
    let desc = types::encode(&point3);
    let mut registry = TypeRegistry::new();
    let native = registry.decode(&desc, Arch::X86_64).unwrap();

    let value = Arg::Struct(vec![Arg::F64(1.5), Arg::F64(-2.25), Arg::F64(0.0)]);
    let mut ctx = PackCtx::new();
    let packed = marshal::pack(&native, &value, &mut ctx).unwrap();
    assert_eq!(packed.scalar.len(), 24);
    let back = marshal::unpack(&native, &packed, &[]).unwrap();
    assert_eq!(back, value);
}
