use std::net::TcpListener;
use std::sync::Arc;
use std::time::Duration;

use winbridge::rpc::Channel;

#[test]
fn request_reaches_the_peer_and_the_reply_comes_back() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();

    let server_thread = std::thread::spawn(move || {
        let (stream, _) = listener.accept().unwrap();
        let handler: winbridge::rpc::Handler = Arc::new(|method, body| {
            assert_eq!(method, "echo");
            body
        });
        let _server_channel = Channel::from_stream(stream, handler);
        // Keep the channel (and its reader thread) alive long enough for
        // the client to get its reply.
        std::thread::sleep(Duration::from_millis(300));
    });

    let noop: winbridge::rpc::Handler = Arc::new(|_, _| Vec::new());
    let client = Channel::connect_with_timeout(addr, Duration::from_secs(2), noop).unwrap();
    let reply = client.call("echo", vec![1, 2, 3], Duration::from_secs(1)).unwrap();
    assert_eq!(reply, vec![1, 2, 3]);

    server_thread.join().unwrap();
}

#[test]
fn call_times_out_when_no_one_answers() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();

    let server_thread = std::thread::spawn(move || {
        let (stream, _) = listener.accept().unwrap();
        // Never reply; just hold the connection open.
        let handler: winbridge::rpc::Handler = Arc::new(|_, _| {
            std::thread::sleep(Duration::from_secs(5));
            Vec::new()
        });
        let _server_channel = Channel::from_stream(stream, handler);
        std::thread::sleep(Duration::from_millis(500));
    });

    let noop: winbridge::rpc::Handler = Arc::new(|_, _| Vec::new());
    let client = Channel::connect_with_timeout(addr, Duration::from_secs(2), noop).unwrap();
    let err = client.call("slow", vec![], Duration::from_millis(100)).unwrap_err();
    assert!(matches!(err, winbridge::BridgeError::TransportTimeout { .. }));

    server_thread.join().unwrap();
}

#[test]
fn call_reports_closed_once_the_peer_drops_the_connection() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();

    let server_thread = std::thread::spawn(move || {
        let (stream, _) = listener.accept().unwrap();
        drop(stream);
    });

    let noop: winbridge::rpc::Handler = Arc::new(|_, _| Vec::new());
    let client = Channel::connect_with_timeout(addr, Duration::from_secs(2), noop).unwrap();
    server_thread.join().unwrap();
    // Give the reader thread a moment to observe the close.
    std::thread::sleep(Duration::from_millis(200));
    let err = client.call("anything", vec![], Duration::from_secs(1)).unwrap_err();
    assert!(matches!(
        err,
        winbridge::BridgeError::TransportClosed | winbridge::BridgeError::Io(_)
    ));
}
