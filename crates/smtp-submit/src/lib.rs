//! Client-side SMTP (RFC 5321) submission engine: line reassembly,
//! multiline reply parsing, the eight-stage submission state machine,
//! EHLO extension dispatch, and one-shot completion handles.

pub mod client;
pub mod extension;
pub mod tls;
pub mod transport;
pub mod types;

pub use client::*;
pub use extension::*;
pub use tls::TlsOptions;
pub use transport::*;
pub use types::*;

pub use mail_headers::{Header, HeaderMap};
