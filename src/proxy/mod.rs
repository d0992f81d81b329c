//! Forwarding HTTP proxy that feeds the capture queue.

pub mod handler;
pub mod pump;
pub mod request;
pub mod server;

pub use handler::{ConnectionOutcome, ProxyContext, handle_connection};
pub use pump::{Pump, PumpEvent, RelayStats, Side};
pub use request::{Destination, forward_head};
pub use server::ProxyServer;
