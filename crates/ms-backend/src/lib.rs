//! ms-backend: streaming decoder and HTTP client for the messages API.
//!
//! Bytes from a response body flow through the line framer ([`sse`]), the
//! event classifier ([`event`]) and the payload dispatcher ([`dispatch`]),
//! which reassembles tool-use input ([`accumulator`]) and yields one
//! [`ms_protocol::Envelope`] per meaningful event.

pub mod accumulator;
pub mod client;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod event;
pub mod mock;
pub mod session;
pub mod sse;

pub use client::{ClientError, MessagesClient};
pub use config::{ClientConfig, ConfigError};
pub use error::StreamError;
pub use mock::{MockConfig, MockFrame};
pub use session::{decode_response, decode_sse, SessionStats};
