// store

mod session_store;

pub use session_store::*;

// transport

mod realtime_transport;

pub use realtime_transport::*;
