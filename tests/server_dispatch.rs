use std::net::TcpListener;
use std::sync::Arc;
use std::time::Duration;

use winbridge::config::Arch;
use winbridge::error::ErrorTag;
use winbridge::registry::{LibraryKind, RoutineBinding};
use winbridge::rpc::Channel;
use winbridge::server::{Reply, Request, Server};
use winbridge::types::TypeDesc;

fn stub_reverse_channel() -> Channel {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    std::thread::spawn(move || {
        let (stream, _) = listener.accept().unwrap();
        let noop: winbridge::rpc::Handler = Arc::new(|_, _| Vec::new());
        let _keep_alive = Channel::from_stream(stream, noop);
        std::thread::sleep(Duration::from_millis(500));
    });
    let noop: winbridge::rpc::Handler = Arc::new(|_, _| Vec::new());
    Channel::connect_with_timeout(addr, Duration::from_secs(2), noop).unwrap()
}

fn dispatch(server: &Server, request: Request) -> Reply {
    let body = bincode::serialize(&request).unwrap();
    let reply_body = server.handle("call", body);
    bincode::deserialize(&reply_body).unwrap()
}

#[test]
fn attaching_a_routine_before_loading_its_library_is_attribute_missing() {
    let server = Server::new(Arch::X86_64, stub_reverse_channel(), Duration::from_secs(1));
    let reply = dispatch(
        &server,
        Request::AttachRoutine(RoutineBinding {
            library: "demo.dll".to_string(),
            name: "add".to_string(),
            argument_types: vec![],
            return_type: TypeDesc::Fundamental {
                name: "c_int32".to_string(),
                pointer_depth: 0,
                array_shape: vec![],
            },
            memsync: vec![],
        }),
    );
    match reply {
        Reply::Err { tag, .. } => assert_eq!(tag, ErrorTag::AttributeMissing),
        other => panic!("expected Err, got {other:?}"),
    }
}

#[test]
fn loading_a_library_that_does_not_exist_is_load_failed() {
    let server = Server::new(Arch::X86_64, stub_reverse_channel(), Duration::from_secs(1));
    let reply = dispatch(
        &server,
        Request::LoadLibrary {
            name: "definitely-not-a-real-library-on-this-system.dll".to_string(),
            kind: LibraryKind::Cdll,
        },
    );
    match reply {
        Reply::Err { tag, .. } => assert_eq!(tag, ErrorTag::LoadFailed),
        other => panic!("expected Err, got {other:?}"),
    }
}
