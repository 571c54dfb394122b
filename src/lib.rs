pub mod logger;
pub mod settings;

pub mod auth;
pub mod domain_model;
pub mod domain_port;
pub mod http;
pub mod infra;
pub mod realtime;
pub mod request;
