//! Request/response RPC over the message bus, keyed by the agent id.

pub mod dispatcher;
pub mod envelope;
pub mod guard;
pub mod transport;

pub use dispatcher::{process_exit, Dispatcher};
pub use transport::{NatsTransport, Transport};
