use crate::transport::Connection;
use crate::types::{MessageContext, Reply};
use std::sync::Arc;

/// Hooks through which a registered SMTP extension plugs into the
/// protocol engine. Every method has a default, so an implementation
/// only overrides what it needs.
///
/// Handlers are shared between the caller and the engine and are invoked
/// with the engine lock held: they must not call back into the client,
/// and should use interior mutability for any state of their own.
pub trait Extension: Send + Sync {
    /// The server advertised this extension in its EHLO reply; `params`
    /// is whatever followed the keyword (empty if nothing did).
    fn configure(&self, _params: &str) {}

    /// A new connection attempt is starting.
    fn reset(&self) {}

    /// Rewrite an outbound command line. The line excludes the trailing
    /// CRLF. Supported extensions are chained in the order the server
    /// advertised them, each seeing the previous one's output.
    fn modify_message(&self, _context: &MessageContext, line: String) -> String {
        line
    }

    /// Whether the extension wants to run an auxiliary sub-stage at the
    /// stage recorded in `context`. Consulted on every stage transition;
    /// the first supported extension to return true takes control of the
    /// dialog until it completes.
    fn needs_extra_stage(&self, _context: &MessageContext) -> bool {
        false
    }

    /// The extension now controls the dialog. It may send data and must
    /// eventually call [`ExtensionStage::complete`], either here or from
    /// a later [`Extension::handle_reply`].
    fn go_ahead(&self, _stage: &mut ExtensionStage) {}

    /// A reply arrived while this extension controls the dialog. Return
    /// false if the reply is unrecoverable, which tears the session down.
    fn handle_reply(
        &self,
        _context: &MessageContext,
        _reply: &Reply,
        _stage: &mut ExtensionStage,
    ) -> bool {
        false
    }
}

pub type ExtensionRef = Arc<dyn Extension>;

/// Controller handed to the active extension while it runs a sub-stage.
/// Payloads are written verbatim: the extension supplies its own line
/// terminators, and nothing passes through the modify pipeline.
pub struct ExtensionStage<'a> {
    connection: Option<&'a dyn Connection>,
    completion: Option<bool>,
}

impl<'a> ExtensionStage<'a> {
    pub(crate) fn new(connection: Option<&'a dyn Connection>) -> Self {
        Self {
            connection,
            completion: None,
        }
    }

    pub fn send(&mut self, payload: &[u8]) {
        if let Some(connection) = self.connection {
            connection.send(payload);
        }
    }

    /// End the sub-stage. `success = false` fails the current mail
    /// transaction softly; the session itself stays up.
    pub fn complete(&mut self, success: bool) {
        debug_assert!(self.completion.is_none(), "sub-stage completed twice");
        self.completion = Some(success);
    }

    pub(crate) fn take_completion(&mut self) -> Option<bool> {
        self.completion.take()
    }
}
