pub mod aggregator;
pub mod api;
pub mod config;
pub mod contracts;
pub mod error;
pub mod metadata;
pub mod models;
pub mod price;
pub mod protocols;
pub mod rpc;
pub mod store;
pub mod updater;
