//! The per-connection SMTP protocol engine.
//!
//! A connection moves through four coarse states: awaiting a command
//! line, streaming a DATA payload, upgrading the transport (STARTTLS),
//! and closed. Rather than tracking these in a flag that every callback
//! must consult, the driver in [`connection`] encodes them as sequential
//! `async` control flow: while the payload is being drained no command
//! can be dispatched, and while the handshake is in flight nothing is
//! read from the old transport, because the code that would do either is
//! simply not running.

pub mod auth;
pub mod command;
pub mod connection;
pub mod parser;
pub mod session;
pub mod status;
pub mod stream;

pub use command::AddressRecord;
pub use connection::{Connection, ConnectionConfig};
pub use parser::BodyStream;
pub use session::{AuthUser, Credentials, Envelope, Session};
pub use status::Status;
pub use stream::SmtpStream;
