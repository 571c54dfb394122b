mod session_store_file;
mod session_store_memory;
mod ws_connector;

pub use session_store_file::*;
pub use session_store_memory::*;
pub use ws_connector::*;
