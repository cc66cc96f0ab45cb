#![warn(clippy::pedantic)]

pub mod api;
pub mod config;
pub mod deserializers;
pub mod errors;
pub mod logging;
pub mod package;
pub mod paths;
pub mod pipeline;
pub mod queue;
pub mod scramble;
