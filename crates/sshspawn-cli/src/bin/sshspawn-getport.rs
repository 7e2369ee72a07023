//! Remote port helper
//!
//! Installed on every candidate host. Binds an ephemeral TCP port, releases
//! it, and prints `<address> <port>` on one line for the spawner to parse.

use std::net::{IpAddr, Ipv4Addr, SocketAddr, TcpListener, UdpSocket};
use std::process::ExitCode;

use anyhow::Context as _;
use clap::Parser;

#[derive(Debug, Parser)]
#[command(name = "sshspawn-getport", version, about = "Print a reachable address and a free TCP port")]
struct Args {
    /// Address to report instead of the primary outbound interface
    #[arg(long)]
    ip: Option<IpAddr>,
}

/// Ask the kernel for a free port. The listener closes on return.
fn free_port() -> anyhow::Result<u16> {
    let listener = TcpListener::bind(SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)))
        .context("binding an ephemeral port")?;
    Ok(listener.local_addr()?.port())
}

/// Source address the kernel would route external traffic from.
/// Connecting a UDP socket sends nothing.
fn outbound_address() -> Option<IpAddr> {
    let socket = UdpSocket::bind(SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0))).ok()?;
    socket.connect(SocketAddr::from((Ipv4Addr::new(192, 0, 2, 1), 9))).ok()?;
    let ip = socket.local_addr().ok()?.ip();
    (!ip.is_unspecified()).then_some(ip)
}

fn report(address: IpAddr, port: u16) -> String {
    format!("{address} {port}")
}

fn main() -> ExitCode {
    let args = Args::parse();
    let address = args
        .ip
        .or_else(outbound_address)
        .unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST));

    match free_port() {
        Ok(port) => {
            println!("{}", report(address, port));
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("sshspawn-getport: {e:#}");
            ExitCode::FAILURE
        }
    }
}
