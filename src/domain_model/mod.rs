mod envelope;
mod realtime;
mod session;

pub use envelope::*;
pub use realtime::*;
pub use session::*;
