use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Progression of the submission dialog with the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProtocolStage {
    /// Waiting for the server greeting.
    #[default]
    Greeting,
    /// Waiting for the server to respond to the client's EHLO.
    HelloResponse,
    /// Waiting for the server to finish listing the options it supports.
    Options,
    /// Idle; the next message may be submitted.
    ReadyToSend,
    /// Waiting for the server to accept the sender address.
    DeclaringSender,
    /// Waiting for the server to accept the recipient addresses.
    DeclaringRecipients,
    /// Waiting for the go-ahead to transmit headers and body.
    SendingData,
    /// Waiting for the final verdict on the transmitted message.
    AwaitingSendResponse,
}

/// State shared between the protocol engine and any extensions.
#[derive(Debug, Clone, Default)]
pub struct MessageContext {
    pub protocol_stage: ProtocolStage,
}

/// One parsed reply line from the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    /// The 3-digit status code.
    pub code: u16,
    /// Whether the server marked this line as the final one of the
    /// current reply (`SP` separator rather than `-`).
    pub last: bool,
    /// The human-readable remainder of the line, CRLF excluded.
    pub text: String,
}

#[derive(Serialize, Deserialize, Copy, Clone, Debug, PartialEq)]
pub struct ClientTimeouts {
    #[serde(
        default = "ClientTimeouts::default_connect_timeout",
        with = "humantime_serde"
    )]
    pub connect_timeout: Duration,

    /// Budget for completing the TLS handshake once the socket is up.
    /// Exceeding it is reported as a connect failure.
    #[serde(
        default = "ClientTimeouts::default_tls_handshake_timeout",
        with = "humantime_serde"
    )]
    pub tls_handshake_timeout: Duration,
}

impl Default for ClientTimeouts {
    fn default() -> Self {
        Self {
            connect_timeout: Self::default_connect_timeout(),
            tls_handshake_timeout: Self::default_tls_handshake_timeout(),
        }
    }
}

impl ClientTimeouts {
    fn default_connect_timeout() -> Duration {
        Duration::from_secs(60)
    }
    fn default_tls_handshake_timeout() -> Duration {
        Duration::from_secs(1)
    }

    pub fn short_timeouts() -> Self {
        let short = Duration::from_secs(1);
        Self {
            connect_timeout: short,
            tls_handshake_timeout: short,
        }
    }
}
