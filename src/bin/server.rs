//! Guest-side launcher entry point.
//!
//! Started under the compatibility runtime with the command line a
//! [`winbridge::Session`] stage 2 expects to be able to reach: a forward
//! port to accept a connection on, and the host's reverse port to dial back
//! into for callback invocations.

use std::net::{SocketAddr, TcpListener};
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing_subscriber::EnvFilter;
use winbridge::config::Arch;
use winbridge::rpc::Channel;
use winbridge::server::Server;

#[derive(Parser, Debug)]
#[command(name = "winbridge-server")]
struct Cli {
    #[arg(long)]
    id: String,

    #[arg(long)]
    port_socket_wine: u16,

    #[arg(long)]
    port_socket_unix: u16,

    #[arg(long, default_value_t = 0)]
    log_level: u8,

    #[arg(long, default_value_t = false)]
    log_write: bool,

    #[arg(long, default_value_t = 30)]
    timeout_start: u64,

    #[arg(long, value_enum, default_value = "x86-64")]
    arch: CliArch,
}

#[derive(Clone, Debug, clap::ValueEnum)]
enum CliArch {
    X86,
    #[value(name = "x86-64")]
    X86_64,
}

fn main() -> Result<(), winbridge::BridgeError> {
    let cli = Cli::parse();

    let filter = if cli.log_level == 0 {
        EnvFilter::new("warn")
    } else {
        EnvFilter::new(format!("winbridge={}", tracing_level(cli.log_level)))
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    tracing::info!(id = %cli.id, "guest launcher starting");

    let arch = match cli.arch {
        CliArch::X86 => Arch::X86,
        CliArch::X86_64 => Arch::X86_64,
    };

    let reverse_addr: SocketAddr = ([127, 0, 0, 1], cli.port_socket_unix).into();
    let noop_handler: winbridge::rpc::Handler = Arc::new(|_method, _body| Vec::new());
    let reverse = Channel::connect_with_timeout(reverse_addr, Duration::from_secs(cli.timeout_start), noop_handler)?;

    let server = Arc::new(Server::new(arch, reverse, Duration::from_secs(10)));
    let forward_listener = TcpListener::bind(("127.0.0.1", cli.port_socket_wine))?;
    tracing::info!(port = cli.port_socket_wine, "listening for the forward channel");

    let (stream, peer) = forward_listener.accept()?;
    tracing::info!(%peer, "forward channel accepted");

    let dispatch_server = server.clone();
    let handler: winbridge::rpc::Handler = Arc::new(move |method, body| {
        if method == "status" {
            return b"up".to_vec();
        }
        dispatch_server.handle(method, body)
    });
    let _forward = Channel::from_stream(stream, handler);

    // Stage 2 is now up; block forever servicing requests on worker
    // threads spawned by the channel's reader loop.
    loop {
        std::thread::sleep(Duration::from_secs(3600));
    }
}

fn tracing_level(level: u8) -> &'static str {
    match level {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    }
}
