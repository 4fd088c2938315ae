pub mod api;
pub mod config;
pub mod coordinator;
pub mod dedup;
pub mod endpoint;
pub mod feed;
pub mod model;
pub mod prometheus;
pub mod publisher;
pub mod router;
pub mod server;
pub mod time;
pub mod validator;
