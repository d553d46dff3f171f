pub mod app;
pub mod config;
pub mod connection;
pub mod labels;
pub mod messages;
pub mod sensor;
pub mod services;
pub mod sink;
