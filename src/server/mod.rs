//! HTTP/WebSocket server module
//!
//! Accepts TCP connections, serves static files for plain HTTP requests and
//! upgrades requests on the socket path to WebSocket connections.

mod gate;
mod handler;
#[allow(dead_code)]
mod registry;
mod static_files;
mod websocket;

#[allow(unused_imports)]
pub use gate::*;
#[allow(unused_imports)]
pub use handler::*;
#[allow(unused_imports)]
pub use registry::*;
#[allow(unused_imports)]
pub use static_files::*;
pub use websocket::*;
