//! Cross-cutting policies around one async service call: cache, retry,
//! debounce or throttle, and cancellation.

mod cache;
mod controller;
mod options;

pub use cache::*;
pub use controller::*;
pub use options::*;
