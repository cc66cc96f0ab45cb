//! Contains modules that interact with JM's app api.

pub mod client;
pub mod crypto;
pub mod download;
pub mod endpoints;
pub mod hosts;
pub mod models;
pub mod request;
pub mod search;
