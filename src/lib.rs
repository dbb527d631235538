//! Hosting envoy: a websocket RPC gateway that lets remote agents act on a
//! local conductor, signing through a keystore shim that forwards their
//! signature requests back to them.

pub mod activation;
pub mod backend;
pub mod bootstrap;
pub mod cli;
pub mod config;
pub mod envoy;
pub mod error;
pub mod rpc;
pub mod service_log;
pub mod settings;
pub mod shim;
pub mod wormhole;

pub use config::Config;
pub use error::{Error, Result};
