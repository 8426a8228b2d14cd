//! Guest-side dispatcher (component G, guest half).
//!
//! [`Server`] is what actually runs under the Windows compatibility
//! runtime: it is the [`crate::rpc::Handler`] installed on the forward
//! channel, resolving `load_library`/`attach_routine`/`call` requests
//! against [`native::NativeLibraries`] and the shared [`Registry`]/
//! [`TypeRegistry`], and it owns the reverse channel used to turn a native
//! routine's callback-pointer invocation into a `callback_invoke` request
//! back to the host.

pub mod native;

use std::sync::Mutex;
use std::time::Duration;

use libffi::middle::{Cif, Closure, Type};

use crate::callback::CallbackId;
use crate::config::Arch;
use crate::error::BridgeError;
use crate::marshal::{self, PackCtx};
use crate::memsync::{Direction, PathSegment};
use crate::registry::{LibraryKind, Registry, RoutineBinding};
use crate::rpc::Channel;
use crate::types::{Fundamental, NativeType, TypeRegistry};
use crate::value::{Arg, CallPayload, CallReply, MemBlock};

/// What crosses the reverse channel for one `callback_invoke` round trip:
/// the callback id and each argument's raw native-sized bytes, read
/// straight out of the pointers libffi's closure dispatcher hands the
/// trampoline. `pub(crate)` so the session side's reverse-channel dispatch
/// loop can decode the same wire shape.
#[derive(Debug, serde::Serialize, serde::Deserialize)]
pub(crate) struct CallbackInvokeRequest {
    pub(crate) id: CallbackId,
    pub(crate) args: Vec<Vec<u8>>,
}

/// Requests the forward channel's handler recognizes.
#[derive(Debug, serde::Serialize, serde::Deserialize)]
pub enum Request {
    LoadLibrary { name: String, kind: LibraryKind },
    AttachRoutine(RoutineBinding),
    Call(CallPayload),
}

#[derive(Debug, serde::Serialize, serde::Deserialize)]
pub enum Reply {
    Ack,
    Call(CallReply),
    Err { tag: crate::error::ErrorTag, message: String },
}

struct TrampolineState {
    reverse: Mutex<Option<Channel>>,
}

/// One registered callback trampoline: a real C-callable function pointer
/// that forwards every invocation to the host over the reverse channel.
/// Kept alive for as long as the `Server` is, since the native routine
/// that was handed this pointer may call it at any point until it returns.
pub struct Trampoline {
    _closure: Closure<'static>,
    pub code_ptr: *const std::ffi::c_void,
}

// SAFETY: the underlying libffi closure is heap-allocated and only
// accessed through the function pointer handed to native code; the state
// it captures (`TrampolineState`) is `Send + Sync` on its own merits.
unsafe impl Send for Trampoline {}
unsafe impl Sync for Trampoline {}

pub struct Server {
    arch: Arch,
    registry: Registry,
    types: Mutex<TypeRegistry>,
    native: Mutex<native::NativeLibraries>,
    reverse: TrampolineState,
    timeout: Duration,
}

impl Server {
    pub fn new(arch: Arch, reverse: Channel, timeout: Duration) -> Self {
        Self {
            arch,
            registry: Registry::new(),
            types: Mutex::new(TypeRegistry::new()),
            native: Mutex::new(native::NativeLibraries::new()),
            reverse: TrampolineState { reverse: Mutex::new(Some(reverse)) },
            timeout,
        }
    }

    /// Handles one forward-channel request. Installed as the
    /// [`crate::rpc::Handler`] for the forward [`Channel`].
    pub fn handle(&self, _method: &str, body: Vec<u8>) -> Vec<u8> {
        let request: Request = match bincode::deserialize(&body) {
            Ok(r) => r,
            Err(e) => {
                let (tag, message) = BridgeError::Encoding(e).to_wire();
                return bincode::serialize(&Reply::Err { tag, message }).expect("Reply always encodes");
            }
        };
        let reply = match self.dispatch(request) {
            Ok(reply) => reply,
            Err(err) => {
                let (tag, message) = err.to_wire();
                Reply::Err { tag, message }
            }
        };
        bincode::serialize(&reply).expect("Reply always encodes")
    }

    fn dispatch(&self, request: Request) -> Result<Reply, BridgeError> {
        match request {
            Request::LoadLibrary { name, kind } => {
                self.registry.load_library(&name, kind)?;
                self.native.lock().expect("native lock poisoned").load(&name)?;
                Ok(Reply::Ack)
            }
            Request::AttachRoutine(binding) => {
                self.registry.attach_routine(binding)?;
                Ok(Reply::Ack)
            }
            Request::Call(payload) => Ok(Reply::Call(self.call(payload)?)),
        }
    }

    fn call(&self, payload: CallPayload) -> Result<CallReply, BridgeError> {
        let mut types = self.types.lock().expect("type registry lock poisoned");
        let argument_native: Vec<NativeType> = payload
            .argument_types
            .iter()
            .map(|t| types.decode(t, self.arch))
            .collect::<Result<_, _>>()?;
        let return_native = types.decode(&payload.return_type, self.arch)?;
        drop(types);

        self.registry.routine(&payload.library, &payload.routine)?;
        let convention = self
            .registry
            .library_kind(&payload.library)
            .ok_or_else(|| BridgeError::AttributeMissing {
                library: payload.library.clone(),
                routine: payload.routine.clone(),
            })?
            .convention();

        let mut args: Vec<Arg> = payload
            .args
            .iter()
            .zip(&argument_native)
            .map(|(packed, native)| marshal::unpack(native, packed, &payload.memblocks))
            .collect::<Result<_, _>>()?;

        // `out`/`inout` directives size (and, for a null pointer slot,
        // allocate) the buffer a routine writes through before the call
        // ever reaches libffi, so a routine never writes through a null
        // pointer just because the caller didn't pre-size its buffer.
        apply_memsync_allocation(&mut args, &payload.memsync, self.arch)?;

        let arg_slots: Vec<native::NativeArg> = args
            .iter()
            .zip(&argument_native)
            .map(|(arg, native)| arg_slot(native, arg))
            .collect::<Result<_, _>>()?;

        let native = self.native.lock().expect("native lock poisoned");
        let retval_bytes = native.call(
            &payload.library,
            &payload.routine,
            convention,
            &argument_native,
            &return_native,
            &arg_slots,
        )?;
        drop(native);

        // Echo every by-reference argument buffer back so
        // `marshal::write_back` on the caller's side has something to apply
        // to its `Arg::Shared` buffers; ids are reused from the incoming
        // memblock table since the caller only ever looks one up by the id
        // it already knows.
        let mut memblocks: Vec<MemBlock> = payload
            .args
            .iter()
            .zip(&arg_slots)
            .filter_map(|(packed, slot)| match (packed.points_to, slot) {
                (Some(id), native::NativeArg::Ref(bytes)) => Some(MemBlock { id, bytes: bytes.clone() }),
                _ => None,
            })
            .collect();

        let next_id = payload.memblocks.iter().map(|b| b.id.0 + 1).max().unwrap_or(0);
        let mut ctx = PackCtx::starting_at(next_id);
        let retval_arg = marshal::unpack(
            &return_native,
            &crate::value::PackedValue { scalar: retval_bytes, points_to: None },
            &payload.memblocks,
        )?;
        let retval = marshal::pack(&return_native, &retval_arg, &mut ctx)?;
        memblocks.extend(ctx.into_memblocks());
        Ok(CallReply { retval, memblocks })
    }

    /// Builds a callback trampoline for `id`. Native code that calls the
    /// returned function pointer blocks this thread until the host's
    /// `callback_invoke` reply arrives.
    pub fn make_trampoline(
        &self,
        id: CallbackId,
        argument_native: Vec<NativeType>,
        return_native: NativeType,
    ) -> Trampoline {
        let arg_sizes: Vec<usize> = argument_native.iter().map(|t| t.layout().size).collect();
        let return_size = return_native.layout().size;
        let cif = Cif::new(
            argument_native.iter().map(middle_type_for).collect::<Vec<_>>(),
            middle_type_for(&return_native),
        );
        let reverse_state: *const TrampolineState = &self.reverse;
        let timeout = self.timeout;
        // SAFETY: `reverse_state` outlives the closure: the closure is only
        // ever called through `code_ptr`, which native code holds only
        // while this `Server` (and thus `self.reverse`) is alive.
        let closure = unsafe {
            Closure::new(cif, move |_cif, result: &mut [u8], args: &[*const std::ffi::c_void]| {
                let args: Vec<Vec<u8>> = args
                    .iter()
                    .zip(&arg_sizes)
                    .map(|(ptr, size)| std::slice::from_raw_parts(*ptr as *const u8, *size).to_vec())
                    .collect();
                let body = bincode::serialize(&CallbackInvokeRequest { id, args })
                    .expect("callback request always encodes");
                let reverse = (*reverse_state).reverse.lock().expect("reverse channel lock poisoned");
                if let Some(channel) = reverse.as_ref() {
                    if let Ok(reply) = channel.call("callback_invoke", body, timeout) {
                        let len = reply.len().min(result.len()).min(return_size);
                        result[..len].copy_from_slice(&reply[..len]);
                    }
                }
            })
        };
        let code_ptr = closure.code_ptr().as_raw_ptr();
        // SAFETY: the closure borrows nothing with a shorter lifetime than
        // `'static` other than `reverse_state`, which is valid for as long
        // as `self` (and therefore this `Trampoline`) is.
        Trampoline { _closure: unsafe { std::mem::transmute(closure) }, code_ptr }
    }
}

/// Maps a native type to the `libffi::middle::Type` its calling convention
/// needs. Structs are treated as opaque pointers, matching
/// [`native::NativeLibraries`]'s own by-reference-only struct handling.
fn middle_type_for(native: &NativeType) -> Type {
    if native.pointer_depth() > 0 {
        return Type::pointer();
    }
    match native {
        NativeType::Fundamental { fundamental, .. } => match fundamental {
            Fundamental::I8 | Fundamental::Char | Fundamental::Bool => Type::i8(),
            Fundamental::U8 => Type::u8(),
            Fundamental::I16 => Type::i16(),
            Fundamental::U16 | Fundamental::WChar => Type::u16(),
            Fundamental::I32 => Type::i32(),
            Fundamental::U32 => Type::u32(),
            Fundamental::I64 | Fundamental::SSizeT => Type::i64(),
            Fundamental::U64 | Fundamental::SizeT => Type::u64(),
            Fundamental::F32 => Type::f32(),
            Fundamental::F64 => Type::f64(),
            Fundamental::VoidP => Type::pointer(),
        },
        NativeType::Struct { .. } | NativeType::Function { .. } => Type::pointer(),
    }
}

/// Resolves one unpacked argument to the form [`native::invoke`] needs:
/// [`native::NativeArg::Ref`] for anything libffi must dereference an extra
/// time (pointer-typed args carrying real pointee content, and structs,
/// which are always ffi-passed by reference), [`native::NativeArg::Value`]
/// for everything whose packed bytes already *are* the ABI value.
fn arg_slot(native: &NativeType, arg: &Arg) -> Result<native::NativeArg, BridgeError> {
    if matches!(native, NativeType::Struct { .. }) {
        let mut ctx = PackCtx::new();
        let packed = marshal::pack(native, arg, &mut ctx)?;
        return Ok(native::NativeArg::Ref(packed.scalar));
    }
    if native.pointer_depth() > 0 || matches!(native, NativeType::Function { .. }) {
        return match arg {
            Arg::Null => Ok(native::NativeArg::Value(vec![0u8; native.layout().size.max(1)])),
            Arg::Address(addr) => Ok(native::NativeArg::Value(addr.to_le_bytes().to_vec())),
            Arg::Bytes(bytes) => Ok(native::NativeArg::Ref(bytes.clone())),
            Arg::Shared(shared) => Ok(native::NativeArg::Ref(shared.borrow().clone())),
            other => Err(BridgeError::TypeUnsupported(format!(
                "{other:?} cannot be passed as a pointer-typed argument"
            ))),
        };
    }
    let mut ctx = PackCtx::new();
    let packed = marshal::pack(native, arg, &mut ctx)?;
    Ok(native::NativeArg::Value(packed.scalar))
}

/// Applies `out`/`inout` memsync directives to the unpacked argument tree
/// before the native call: resolves each directive's length, then either
/// allocates a fresh zeroed buffer for a null pointer slot or grows an
/// undersized existing buffer, so the routine always writes into memory
/// sized for what it is declared to produce.
fn apply_memsync_allocation(
    args: &mut [Arg],
    directives: &[crate::memsync::Directive],
    arch: Arch,
) -> Result<(), BridgeError> {
    for directive in directives {
        if directive.direction == Direction::In {
            continue;
        }
        let index = match directive.pointer_path.first() {
            Some(PathSegment::Arg(i)) => *i,
            _ => {
                return Err(BridgeError::MemsyncResolve(
                    "memsync pointer path must start with an argument index".to_string(),
                ))
            }
        };
        let existing_bytes = match args.get(index) {
            Some(Arg::Bytes(bytes)) => Some(bytes.clone()),
            Some(Arg::Shared(shared)) => Some(shared.borrow().clone()),
            _ => None,
        };
        let width = directive.element.size(arch).max(1);
        let length =
            crate::memsync::resolve_length(&directive.length, args, directive.element, existing_bytes.as_deref(), arch)?;
        let required = length * width;

        match args.get_mut(index) {
            Some(slot @ Arg::Null) => *slot = Arg::Bytes(vec![0u8; required]),
            Some(Arg::Bytes(bytes)) => {
                if bytes.len() < required {
                    bytes.resize(required, 0);
                }
            }
            Some(Arg::Shared(shared)) => {
                let mut buf = shared.borrow_mut();
                if buf.len() < required {
                    buf.resize(required, 0);
                }
            }
            Some(other) => {
                return Err(BridgeError::TypeUnsupported(format!(
                    "memsync directive targets argument {index}, which is not a pointer buffer ({other:?})"
                )))
            }
            None => {
                return Err(BridgeError::MemsyncResolve(format!("argument index {index} out of range")))
            }
        }
    }
    Ok(())
}
