//! An MSRP (Message Session Relay Protocol, RFC 4975) endpoint library.
//!
//! Many logical message sessions share a small number of framed TCP or TLS
//! connections. Inbound bytes run through an incremental frame decoder
//! that can deliver SEND bodies to the application before the terminating
//! delimiter arrives; outbound messages are chunked and interleaved by a
//! fair scheduler so a short message never waits behind a bulk transfer.
//!
//! ```rust,no_run
//! use msrp::{Connection, ConnectionOptions, Message, Method};
//! use msrp::session::SessionHandler;
//! use msrp::transfer::{ChunkSink, OutgoingHandler};
//!
//! struct Quiet;
//! impl SessionHandler for Quiet {}
//!
//! struct OneShot(&'static [u8]);
//! impl OutgoingHandler for OneShot {
//!     fn on_data_required(&mut self, _required: Option<u64>, sink: &mut ChunkSink<'_>) {
//!         sink.write_slice(self.0);
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> msrp::Result<()> {
//!     let options = ConnectionOptions {
//!         targets: vec!["192.0.2.7:2855".parse().unwrap()],
//!         ..Default::default()
//!     };
//!
//!     let connection = Connection::answer(options);
//!     let session = connection.session("msrp:client.example.com/s1".parse()?, Box::new(Quiet));
//!
//!     let mut template = Message::new(Method::Send);
//!     template.set_content_type("text/plain");
//!     template.set_header("Content-Length", "6");
//!     session.stream(template, Box::new(OneShot(b"hello\n")));
//!
//!     Ok(())
//! }
//! ```

pub mod codec;
pub mod connection;
mod demux;
pub mod egress;
pub mod error;
pub mod headers;
pub mod message;
mod scheduler;
pub mod session;
pub mod transfer;
pub mod uri;

pub use codec::{BufferState, MessageBuffer, ParseMode};
pub use connection::{Connection, ConnectionEvent, ConnectionOptions, TlsConfig};
pub use error::{Error, ParseError, Result};
pub use headers::{ByteRange, ContentType, FailureReport, StatusHeader};
pub use message::{Message, Method, MsgStatus};
pub use session::{IncomingHandle, OutgoingHandle, SessionHandle, SessionHandler};
pub use transfer::{ChunkSink, IncomingHandler, OutgoingHandler, SuccessReportMode};
pub use uri::{Path, Uri};
