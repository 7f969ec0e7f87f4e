//! # drivelink
//!
//! Host-side transport stack for the RPC protocol spoken by a small
//! embedded motor-control device.
//!
//! Two layers, composed leaf-first:
//!
//! - **Framing codec** ([`protocol::framer`]): turns an unreliable byte
//!   stream into a datagram link. Each packet carries a sync byte, a
//!   length, a CRC-8 over the header, and a CRC-16 trailer over the
//!   payload.
//! - **Endpoint engine** ([`engine`]): multiplexes endpoint-addressed
//!   request/response operations over a packet link, matching replies
//!   to in-flight requests by sequence number. Replies may arrive out
//!   of order; cancellation and timeouts are caller-driven.
//!
//! Byte-stream links (UART) stack the framer underneath the engine via
//! [`EndpointProtocol::over_stream`]; links that already carry whole
//! datagrams (USB bulk) implement the [`transport`] traits directly and
//! bypass the framer.
//!
//! ## Example
//!
//! ```ignore
//! use bytes::{Bytes, BytesMut};
//! use drivelink::{EndpointProtocol, EngineConfig};
//!
//! #[tokio::main]
//! async fn main() -> drivelink::Result<()> {
//!     let (read, write) = open_serial_link();
//!     let (proto, stopped) = EndpointProtocol::over_stream(read, write, EngineConfig::default());
//!
//!     let reply = proto
//!         .invoke(0x0001, Bytes::from_static(&[0xDE, 0xAD]), BytesMut::with_capacity(64))
//!         .await?
//!         .finish()
//!         .await?;
//!     println!("device answered {:02x?}", &reply[..]);
//!
//!     stopped.wait().await;
//!     Ok(())
//! }
//! ```

pub mod engine;
pub mod error;
pub mod protocol;
pub mod transport;

pub use engine::{EndpointProtocol, EngineConfig, Invocation, OpHandle, Stopped};
pub use error::{DrivelinkError, Result};
