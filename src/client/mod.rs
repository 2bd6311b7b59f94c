//! WebSocket client module
//!
//! Auto-reconnecting client: a backoff policy, observable connection state,
//! a pure state machine and the socket manager driving it.

#[allow(dead_code)]
mod machine;
mod manager;
mod policy;
#[allow(dead_code)]
mod store;
mod transport;

#[allow(unused_imports)]
pub use machine::*;
pub use manager::*;
#[allow(unused_imports)]
pub use policy::*;
#[allow(unused_imports)]
pub use store::*;
#[allow(unused_imports)]
pub use transport::*;
