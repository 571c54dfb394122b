mod api_client;
mod error;

pub use api_client::*;
pub use error::*;
