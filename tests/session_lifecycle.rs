use winbridge::{Arch, Session, SessionConfig};

#[test]
fn stage_one_needs_no_guest_and_assigns_an_id() {
    let session = Session::new(SessionConfig::default()).unwrap();
    assert_eq!(session.id().len(), 8);
    assert!(session.id().chars().all(|c| c.is_ascii_hexdigit()));
    assert_eq!(session.arch(), Arch::X86_64);
}

#[test]
fn explicit_id_is_honored() {
    let session = Session::new(SessionConfig {
        id: Some("deadbeef".to_string()),
        ..Default::default()
    })
    .unwrap();
    assert_eq!(session.id(), "deadbeef");
}

#[test]
fn reverse_endpoint_is_bound_and_reachable() {
    let session = Session::new(SessionConfig::default()).unwrap();
    let addr = session.reverse_addr().unwrap();
    assert!(addr.port() > 0);
    std::net::TcpStream::connect(addr).expect("reverse endpoint accepts a connection");
}

#[test]
fn terminate_is_idempotent() {
    let session = Session::new(SessionConfig::default()).unwrap();
    session.terminate();
    session.terminate();
}
