//! A scriptable in-process transport, used by the tests and demos

mod transport;
pub use transport::{FakeController, FakeTransport, TransportCall};
