use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    num::NonZeroUsize,
};

use clap::{Args, Parser, Subcommand};

use crate::relay::{DEFAULT_OUTBOUND_CAPACITY, RelayConfig};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the relay, accepting WebSocket connections.
    Serve(ServeArgs),
    /// Connect to a relay and chat from the terminal.
    Client(ClientArgs),
}

#[derive(Args, Debug, Clone)]
pub struct ServeArgs {
    /// Interface the relay binds to.
    #[arg(long, default_value_t = IpAddr::V4(Ipv4Addr::UNSPECIFIED))]
    pub host: IpAddr,

    /// Port to listen on. Use 0 for an ephemeral port.
    #[arg(long, env = "PORT", default_value_t = 5000)]
    pub port: u16,

    /// Frames buffered per client before further deliveries to it are skipped.
    #[arg(long, default_value_t = NonZeroUsize::new(DEFAULT_OUTBOUND_CAPACITY).unwrap_or(NonZeroUsize::MIN))]
    pub outbound_capacity: NonZeroUsize,
}

impl ServeArgs {
    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }

    pub fn relay_config(&self) -> RelayConfig {
        RelayConfig {
            outbound_capacity: self.outbound_capacity,
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct ClientArgs {
    /// Display name announced to the relay.
    #[arg(long)]
    pub name: String,

    /// WebSocket URL of the relay.
    #[arg(long, default_value = "ws://127.0.0.1:5000/")]
    pub server: String,
}
