#![cfg_attr(doc, doc = include_str!("../README.md"))]

pub mod backoff;
pub mod config;
pub mod connection;
pub mod credential;
pub mod error;
pub mod message;
pub mod state;
pub mod transport;

pub use connection::ConnectionManager;
pub use message::{CloseFrame, Frame, Payload};
pub use state::{ConnectionState, Snapshot};

use crate::error::Error;

pub type Result<T> = std::result::Result<T, Error>;
