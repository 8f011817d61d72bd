pub mod api;
pub mod clock;
pub mod config;
pub mod engine;
pub mod entities;
pub mod error;
pub mod external;
pub mod geo;
pub mod search;
pub mod server;
pub mod store;

pub mod simulation;
