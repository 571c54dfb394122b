//! Session ownership and the token lifecycle: credentials on every call,
//! one shared refresh per wave of authorization failures.

mod session_handle;
mod token_manager;

pub use session_handle::*;
pub use token_manager::*;
