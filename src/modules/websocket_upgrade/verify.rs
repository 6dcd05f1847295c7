//! Client verification hooks.

use std::fmt;
use std::sync::Arc;

use tracing::warn;

use super::request::UpgradeRequest;

/// What the verification hook gets to see.
#[derive(Debug, Clone)]
pub struct ClientInfo {
    /// `Origin` (or `Sec-WebSocket-Origin` for version 8 clients).
    pub origin: Option<String>,
    /// Whether the request arrived over TLS.
    pub secure: bool,
    /// The full request.
    pub request: UpgradeRequest,
}

/// Outcome of an asynchronous verification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    /// Continue the handshake.
    Accept,
    /// Abort the handshake.
    Reject {
        /// Status code, 401 when unset.
        code: Option<u16>,
        /// Reason phrase override.
        message: Option<String>,
        /// Extra response headers.
        headers: Vec<(String, String)>,
    },
}

type Completion = Box<dyn FnOnce(Verdict) + Send>;

/// One-shot answer channel for an asynchronous verification.
///
/// Dropping it unanswered rejects the client with 401.
pub struct VerifyResponder {
    completion: Option<Completion>,
}

impl fmt::Debug for VerifyResponder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VerifyResponder")
            .field("answered", &self.completion.is_none())
            .finish()
    }
}

impl VerifyResponder {
    pub(crate) fn new<F>(completion: F) -> Self
    where
        F: FnOnce(Verdict) + Send + 'static,
    {
        Self {
            completion: Some(Box::new(completion)),
        }
    }

    /// Continue the handshake.
    pub fn accept(self) {
        self.finish(Verdict::Accept);
    }

    /// Abort the handshake with `code` (401 when `None`).
    pub fn reject(self, code: Option<u16>, message: Option<String>, headers: Vec<(String, String)>) {
        self.finish(Verdict::Reject {
            code,
            message,
            headers,
        });
    }

    /// Answer in the `(verified, code, message, headers)` form.
    pub fn respond(
        self,
        verified: bool,
        code: Option<u16>,
        message: Option<String>,
        headers: Vec<(String, String)>,
    ) {
        if verified {
            self.accept();
        } else {
            self.reject(code, message, headers);
        }
    }

    fn finish(mut self, verdict: Verdict) {
        if let Some(completion) = self.completion.take() {
            completion(verdict);
        }
    }
}

impl Drop for VerifyResponder {
    fn drop(&mut self) {
        if let Some(completion) = self.completion.take() {
            warn!("Verification responder dropped without an answer, rejecting");
            completion(Verdict::Reject {
                code: None,
                message: None,
                headers: Vec::new(),
            });
        }
    }
}

/// Synchronous verifier: `true` lets the client in.
pub type SyncVerifier = Arc<dyn Fn(&ClientInfo) -> bool + Send + Sync>;

/// Asynchronous verifier: answers through the responder, now or later.
pub type AsyncVerifier = Arc<dyn Fn(ClientInfo, VerifyResponder) + Send + Sync>;

/// Hook deciding whether a client may upgrade.
#[derive(Clone)]
pub enum VerifyClient {
    /// Decide inline.
    Sync(SyncVerifier),
    /// Decide through a [`VerifyResponder`].
    Async(AsyncVerifier),
}

impl VerifyClient {
    /// Wrap a synchronous verifier.
    pub fn sync<F>(verify: F) -> Self
    where
        F: Fn(&ClientInfo) -> bool + Send + Sync + 'static,
    {
        Self::Sync(Arc::new(verify))
    }

    /// Wrap an asynchronous verifier.
    pub fn with_responder<F>(verify: F) -> Self
    where
        F: Fn(ClientInfo, VerifyResponder) + Send + Sync + 'static,
    {
        Self::Async(Arc::new(verify))
    }
}

impl fmt::Debug for VerifyClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sync(_) => f.write_str("VerifyClient::Sync"),
            Self::Async(_) => f.write_str("VerifyClient::Async"),
        }
    }
}
