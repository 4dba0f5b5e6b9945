//! Daemon runtime: socket server and the event loop that wires every
//! service together.

pub mod event_loop;
pub mod socket;

pub use event_loop::Daemon;
pub use socket::{ConnectionRegistry, SocketServerHandle, start_socket_server};
