// Server module entry
// Accept/dispatch loop, connection records and stop signalling

pub mod connection;
mod registry;
pub mod signal;

// `loop` is a keyword, so the module is named server_loop
#[path = "loop.rs"]
pub mod server_loop;

pub use connection::Connection;
pub use server_loop::{ConnectionCounter, Server, ServerPhase};
pub use signal::{start_signal_handler, StopHandle};
