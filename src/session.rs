//! Host-side session lifecycle (component G, host half).
//!
//! A [`Session`] goes through two stages: stage 1 is entirely
//! local — generate or accept an id, open the reverse RPC endpoint the
//! guest will dial back into for callback invocations, and install the
//! terminate hook (a [`Drop`] impl stands in for an atexit-style shutdown
//! hook, the idiomatic Rust equivalent of "run this when the owner goes out
//! of scope"). Stage 2, [`Session::connect_guest`], opens the forward
//! channel and polls the guest's status until it reports `up` or
//! `timeout_start` elapses.

use std::net::{SocketAddr, TcpListener};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::{Duration, Instant};

use tracing::{info, info_span, warn};

use crate::callback::{CallbackFactory, CallbackHandle, CallbackId};
use crate::config::{generate_session_id, Arch, SessionConfig};
use crate::error::BridgeError;
use crate::marshal::{self, PackCtx};
use crate::memsync::{self, Directive, RawValue};
use crate::registry::{LibraryKind, Registry, RoutineBinding};
use crate::rpc::Channel;
use crate::server::{CallbackInvokeRequest, Reply, Request};
use crate::types::{Decl, NativeType, TypeRegistry, encode};
use crate::value::{Arg, CallPayload, CallReply, PackedValue};

/// A session's two lifecycle stages, tracked only for `terminate()`
/// idempotency and diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Local,
    Connected,
    Terminated,
}

struct Inner {
    id: String,
    config: SessionConfig,
    registry: Registry,
    types: Mutex<TypeRegistry>,
    callbacks: Arc<CallbackFactory>,
    reverse_addr: SocketAddr,
    forward: OnceLock<Channel>,
    forward_lock: Mutex<()>,
    stage: Mutex<Stage>,
}

/// A host-side bridge session.
pub struct Session {
    inner: Arc<Inner>,
}

impl Session {
    /// Stage 1: local setup only. No guest process is contacted.
    pub fn new(mut config: SessionConfig) -> Result<Self, BridgeError> {
        let id = config.id.take().unwrap_or_else(generate_session_id);
        let span = info_span!("session", id = %id);
        let _enter = span.enter();
        info!(arch = ?config.arch, "session stage 1: local setup");

        let reverse_listener = TcpListener::bind("127.0.0.1:0")?;
        let reverse_addr = reverse_listener.local_addr()?;

        let inner = Arc::new(Inner {
            id,
            config,
            registry: Registry::new(),
            types: Mutex::new(TypeRegistry::new()),
            callbacks: Arc::new(CallbackFactory::new()),
            reverse_addr,
            forward: OnceLock::new(),
            forward_lock: Mutex::new(()),
            stage: Mutex::new(Stage::Local),
        });

        let accept_inner = inner.clone();
        std::thread::spawn(move || accept_reverse_connections(accept_inner, reverse_listener));

        Ok(Self { inner })
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn arch(&self) -> Arch {
        self.inner.config.arch
    }

    /// The local address the guest should dial for the reverse channel.
    pub fn reverse_addr(&self) -> std::io::Result<SocketAddr> {
        Ok(self.inner.reverse_addr)
    }

    /// Stage 2: connects the forward channel to `addr` and polls for
    /// `server_status=up`, failing with `transport_timeout` if the guest
    /// does not come up within `timeout_start`.
    pub fn connect_guest(&self, addr: SocketAddr) -> Result<(), BridgeError> {
        // The host side only issues calls on the forward channel; it never
        // receives requests on it, so the handler is a no-op.
        let noop_handler: crate::rpc::Handler = Arc::new(|_method, _body| Vec::new());
        let channel = Channel::connect_with_timeout(addr, self.inner.config.timeout_start, noop_handler)?;

        let deadline = Instant::now() + self.inner.config.timeout_start;
        loop {
            match channel.call("status", Vec::new(), Duration::from_millis(200)) {
                Ok(body) if body == b"up" => break,
                _ => {
                    if Instant::now() >= deadline {
                        return Err(BridgeError::TransportTimeout {
                            method: "status".to_string(),
                            elapsed_ms: self.inner.config.timeout_start.as_millis() as u64,
                        });
                    }
                    std::thread::sleep(Duration::from_millis(10));
                }
            }
        }

        self.inner
            .forward
            .set(channel)
            .map_err(|_| BridgeError::Unreachable)?;
        *self.inner.stage.lock().expect("stage lock poisoned") = Stage::Connected;
        info!(id = %self.inner.id, "session stage 2: guest connected");
        Ok(())
    }

    fn forward(&self) -> Result<&Channel, BridgeError> {
        self.inner.forward.get().ok_or(BridgeError::Unreachable)
    }

    fn request(&self, request: Request) -> Result<Reply, BridgeError> {
        let forward = self.forward()?;
        let body = bincode::serialize(&request)?;
        // Concurrent forward calls are serialized through this lock rather
        // than allowed to race on the channel.
        let _guard = self.inner.forward_lock.lock().expect("forward lock poisoned");
        let reply_body = forward.call("call", body, self.inner.config.timeout_stop)?;
        let reply: Reply = bincode::deserialize(&reply_body)?;
        if let Reply::Err { tag, message } = &reply {
            return Err(BridgeError::RemoteRaised { tag: *tag, message: message.clone() });
        }
        Ok(reply)
    }

    pub fn load_library(&self, name: &str, kind: LibraryKind) -> Result<LibraryHandle, BridgeError> {
        self.inner.registry.load_library(name, kind)?;
        self.request(Request::LoadLibrary { name: name.to_string(), kind })?;
        Ok(LibraryHandle { session: self.inner.clone(), name: name.to_string(), kind })
    }

    pub fn register_callback<F>(&self, argument_types: &[Decl], return_type: &Decl, f: F) -> CallbackHandle
    where
        F: Fn(&[Arg]) -> Result<Arg, BridgeError> + Send + Sync + 'static,
    {
        self.inner.callbacks.register(argument_types, return_type, f)
    }

    pub fn forget_callback(&self, id: CallbackId) {
        self.inner.callbacks.forget(id);
    }

    /// Idempotent shutdown: closes the forward channel and marks the
    /// session terminated. Safe to call more than once.
    pub fn terminate(&self) {
        let mut stage = self.inner.stage.lock().expect("stage lock poisoned");
        if *stage == Stage::Terminated {
            return;
        }
        info!(id = %self.inner.id, "session terminate");
        *stage = Stage::Terminated;
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.terminate();
    }
}

/// Accepts guest connections on the reverse listener for the lifetime of
/// the session, handing each one to its own [`Channel`] so a
/// `callback_invoke` request can arrive on any of them. The channel handle
/// returned by [`Channel::from_stream`] is dropped immediately: its reader
/// and per-request worker threads hold their own `Arc` into the channel's
/// shared state, so the connection stays open without this loop needing to
/// keep the handle around.
fn accept_reverse_connections(inner: Arc<Inner>, listener: TcpListener) {
    for incoming in listener.incoming() {
        let stream = match incoming {
            Ok(stream) => stream,
            Err(err) => {
                warn!(error = %err, "reverse listener accept failed");
                continue;
            }
        };
        let handler_inner = inner.clone();
        let handler: crate::rpc::Handler = Arc::new(move |method, body| {
            if method == "callback_invoke" {
                dispatch_callback_invoke(&handler_inner, body)
            } else {
                Vec::new()
            }
        });
        let _ = Channel::from_stream(stream, handler);
    }
}

/// Decodes a [`CallbackInvokeRequest`], invokes the registered callback, and
/// returns the marshaled return-value bytes the guest's trampoline is
/// waiting on. Any failure (unknown callback, decode error, closure error)
/// yields an empty reply; the trampoline leaves its result buffer
/// zero-filled in that case rather than blocking forever.
fn dispatch_callback_invoke(inner: &Arc<Inner>, body: Vec<u8>) -> Vec<u8> {
    let request: CallbackInvokeRequest = match bincode::deserialize(&body) {
        Ok(r) => r,
        Err(err) => {
            warn!(error = %err, "malformed callback_invoke request");
            return Vec::new();
        }
    };
    let Some((argument_descs, return_desc)) = inner.callbacks.signature(request.id) else {
        warn!(id = request.id.0, "callback_invoke for unknown or forgotten callback");
        return Vec::new();
    };

    let arch = inner.config.arch;
    let result = (|| -> Result<Vec<u8>, BridgeError> {
        let mut types = inner.types.lock().expect("type registry lock poisoned");
        let argument_native: Vec<NativeType> =
            argument_descs.iter().map(|d| types.decode(d, arch)).collect::<Result<_, _>>()?;
        let return_native = types.decode(&return_desc, arch)?;
        drop(types);

        if request.args.len() != argument_native.len() {
            return Err(BridgeError::TypeUnsupported(format!(
                "callback_invoke supplied {} arguments, signature declares {}",
                request.args.len(),
                argument_native.len()
            )));
        }

        let args: Vec<Arg> = request
            .args
            .iter()
            .zip(&argument_native)
            .map(|(bytes, native)| {
                marshal::unpack(native, &PackedValue { scalar: bytes.clone(), points_to: None }, &[])
            })
            .collect::<Result<_, _>>()?;

        let retval_arg = inner.callbacks.invoke(request.id, &args)?;
        let retval = marshal::pack(&return_native, &retval_arg, &mut PackCtx::new())?;
        Ok(retval.scalar)
    })();

    match result {
        Ok(bytes) => bytes,
        Err(err) => {
            warn!(error = %err, "callback_invoke dispatch failed");
            Vec::new()
        }
    }
}

/// A loaded library, scoped to the session that loaded it.
pub struct LibraryHandle {
    session: Arc<Inner>,
    name: String,
    kind: LibraryKind,
}

impl LibraryHandle {
    pub fn routine(&self, name: &str) -> Routine {
        Routine {
            session: self.session.clone(),
            library: self.name.clone(),
            library_kind: self.kind,
            routine: name.to_string(),
            argument_types: Vec::new(),
            return_type: Decl::Fundamental(crate::types::Fundamental::I32),
            memsync: Vec::new(),
        }
    }
}

/// A routine attached to a loaded library, with its declared types.
pub struct Routine {
    session: Arc<Inner>,
    library: String,
    library_kind: LibraryKind,
    routine: String,
    argument_types: Vec<Decl>,
    return_type: Decl,
    memsync: Vec<Directive>,
}

impl Routine {
    /// Declares (or re-declares) this routine's argument and return types.
    /// Re-declaring replaces the previous binding atomically (component E).
    pub fn set_types(&mut self, argument_types: Vec<Decl>, return_type: Decl) -> Result<(), BridgeError> {
        self.argument_types = argument_types;
        self.return_type = return_type;
        self.sync_binding()
    }

    /// Parses a raw `memsync` attribute (component D's dynamically declared
    /// shape, not a fixed Rust struct literal) and attaches the resulting
    /// directives to this routine's binding.
    pub fn set_memsync(&mut self, raw: RawValue) -> Result<(), BridgeError> {
        self.memsync = memsync::parse_all(&raw)?;
        self.sync_binding()
    }

    fn sync_binding(&self) -> Result<(), BridgeError> {
        let binding = RoutineBinding {
            library: self.library.clone(),
            name: self.routine.clone(),
            argument_types: self.argument_types.iter().map(encode).collect(),
            return_type: encode(&self.return_type),
            memsync: self.memsync.clone(),
        };
        self.session.registry.attach_routine(binding.clone())?;
        let request = Request::AttachRoutine(binding);
        let body = bincode::serialize(&request)?;
        let forward = self.session.forward.get().ok_or(BridgeError::Unreachable)?;
        let reply_body = {
            let _guard = self.session.forward_lock.lock().expect("forward lock poisoned");
            forward.call("call", body, self.session.config.timeout_stop)?
        };
        let reply: Reply = bincode::deserialize(&reply_body)?;
        if let Reply::Err { tag, message } = reply {
            return Err(BridgeError::RemoteRaised { tag, message });
        }
        Ok(())
    }

    /// Marshals `args` against the declared types, calls the routine over
    /// the forward channel, and unmarshals the reply.
    pub fn call(&self, args: &[Arg]) -> Result<Arg, BridgeError> {
        let mut types = self.session.types.lock().expect("type registry lock poisoned");
        let arch = self.session.config.arch;
        let argument_native: Vec<NativeType> = self
            .argument_types
            .iter()
            .map(|d| types.decode(&encode(d), arch))
            .collect::<Result<_, _>>()?;
        let return_native = types.decode(&encode(&self.return_type), arch)?;
        drop(types);

        if args.len() != argument_native.len() {
            return Err(BridgeError::TypeUnsupported(format!(
                "routine {:?} declared {} arguments, called with {}",
                self.routine,
                argument_native.len(),
                args.len()
            )));
        }

        let mut ctx = PackCtx::new();
        let packed_args = args
            .iter()
            .zip(&argument_native)
            .map(|(a, t)| marshal::pack(t, a, &mut ctx))
            .collect::<Result<Vec<_>, _>>()?;
        let ids = ctx.ids();
        let memblocks = ctx.into_memblocks();

        let payload = CallPayload {
            library: self.library.clone(),
            routine: self.routine.clone(),
            argument_types: self.argument_types.iter().map(encode).collect(),
            return_type: encode(&self.return_type),
            args: packed_args,
            memblocks,
            memsync: self.memsync.clone(),
        };

        let body = bincode::serialize(&Request::Call(payload))?;
        let reply_body = {
            let _guard = self.session.forward_lock.lock().expect("forward lock poisoned");
            let forward = self.session.forward.get().ok_or(BridgeError::Unreachable)?;
            forward.call("call", body, self.session.config.timeout_stop)?
        };
        let reply: Reply = bincode::deserialize(&reply_body)?;
        let CallReply { retval, memblocks } = match reply {
            Reply::Call(call_reply) => call_reply,
            Reply::Err { tag, message } => return Err(BridgeError::RemoteRaised { tag, message }),
            Reply::Ack => return Err(BridgeError::Unreachable),
        };

        marshal::write_back(args, &memblocks, &ids);
        marshal::unpack(&return_native, &retval, &memblocks)
    }

    pub fn library_kind(&self) -> LibraryKind {
        self.library_kind
    }
}

/// The process-wide default session slot, mirroring the implicit
/// module-level session most ctypes-bridge libraries keep so callers don't
/// have to thread a `Session` through every call site.
static DEFAULT_SESSION: OnceLock<Mutex<Option<Arc<Session>>>> = OnceLock::new();

pub fn default_session() -> Arc<Session> {
    let slot = DEFAULT_SESSION.get_or_init(|| Mutex::new(None));
    let mut guard = slot.lock().expect("default session lock poisoned");
    if let Some(session) = guard.as_ref() {
        return session.clone();
    }
    let session = Arc::new(Session::new(SessionConfig::default()).expect("default session setup cannot fail locally"));
    *guard = Some(session.clone());
    session
}

pub fn set_default_session(session: Arc<Session>) {
    let slot = DEFAULT_SESSION.get_or_init(|| Mutex::new(None));
    *slot.lock().expect("default session lock poisoned") = Some(session);
}
