//! # termbridge Protocol Library
//!
//! This crate defines the small wire protocol spoken between the session
//! host (`daemon`) and the multiplexer client (`client`).
//!
//! ## Overview
//!
//! One channel (a WebSocket) carries exactly one terminal session:
//!
//! - **Channel parameters**: `sessionId`, `cwd`, `cols`, `rows`, sent in the
//!   query string of the upgrade request
//! - **Client messages**: `input` and `resize`
//! - **Server messages**: `connected`, `output`, `exit` and `error`
//! - **Output decoding**: PTY bytes are turned into text without splitting
//!   multi-byte characters across `output` messages
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │        JSON messages (type-tagged)      │  ClientMessage / ServerMessage
//! ├─────────────────────────────────────────┤
//! │       WebSocket text frames             │  raw text falls back to input
//! ├─────────────────────────────────────────┤
//! │   Upgrade query string (ChannelParams)  │
//! └─────────────────────────────────────────┘
//! ```
//!
//! ## Example Usage
//!
//! ```rust
//! use protocol::{ChannelParams, ClientFrame, ClientMessage, Geometry};
//!
//! let params = ChannelParams::new("tab-session-1")
//!     .with_cwd("/tmp")
//!     .with_geometry(Geometry::new(120, 40).unwrap());
//! let query = params.to_query();
//! assert_eq!(ChannelParams::from_query(&query), params);
//!
//! let frame = ClientFrame::parse(r#"{"type":"resize","cols":100,"rows":30}"#);
//! assert!(matches!(
//!     frame,
//!     ClientFrame::Message(ClientMessage::Resize { cols: 100, rows: 30 })
//! ));
//! ```
//!
//! ## Modules
//!
//! - [`messages`]: Wire message definitions and frame parsing
//! - [`params`]: Channel establishment parameters
//! - [`decoder`]: Incremental UTF-8 decoding of PTY output
//! - [`error`]: Error types

pub mod decoder;
pub mod error;
pub mod messages;
pub mod params;

pub use decoder::Utf8StreamDecoder;
pub use error::{ProtocolError, Result};
pub use messages::{ClientFrame, ClientMessage, Geometry, ServerMessage};
pub use params::ChannelParams;
