#![forbid(unsafe_code)]

pub mod backends;
pub mod cli;
pub mod error;
pub mod extract;
pub mod middleware;
pub mod routes;
pub mod server;
