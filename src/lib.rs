pub mod activity;
pub mod auth;
pub mod client;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod event;
pub mod node;
pub mod protocol;
pub mod retry;
pub mod shipper;
pub mod shutdown;
pub mod store;
pub mod worker;
