//! Envelopes
//!
//! A request travelling between connections, the connection manager and
//! routers, together with the channel its answer goes back on.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crossbeam::channel::{self, Receiver, Sender};

use crate::error::CradleError;
use crate::protocol::{Request, Response};

/// Shared flag set when nobody is waiting for the answer any more
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Reply side of an envelope.
///
/// Answers exactly once; dropping it unanswered sends an `Error` response.
pub struct Reply {
    sender: Option<Sender<Response>>,
}

impl Reply {
    fn send(mut self, response: Response) {
        if let Some(sender) = self.sender.take() {
            // The receiver is gone when the caller timed out
            let _ = sender.send(response);
        }
    }
}

impl Drop for Reply {
    fn drop(&mut self) {
        if let Some(sender) = self.sender.take() {
            tracing::warn!("Request dropped without a reply");
            let _ = sender.send(Response::error("request dropped without a reply"));
        }
    }
}

/// Request + reply channel + cancel token
pub struct Envelope {
    pub request: Request,
    pub cancel: CancelToken,
    reply: Reply,
}

impl Envelope {
    /// Wrap `request`; the receiver yields exactly one response.
    pub fn new(request: Request) -> (Self, Receiver<Response>) {
        let (sender, receiver) = channel::bounded(1);
        let envelope = Self {
            request,
            cancel: CancelToken::new(),
            reply: Reply {
                sender: Some(sender),
            },
        };
        (envelope, receiver)
    }

    /// Same as [`Envelope::new`] but sharing an existing cancel token
    pub fn with_cancel(request: Request, cancel: CancelToken) -> (Self, Receiver<Response>) {
        let (mut envelope, receiver) = Self::new(request);
        envelope.cancel = cancel;
        (envelope, receiver)
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn respond(self, response: Response) {
        self.reply.send(response);
    }

    pub fn fail(self, err: &CradleError) {
        tracing::trace!("Request for {:?} failed: {}", String::from_utf8_lossy(&self.request.key), err);
        self.reply.send(Response::from_error(err));
    }
}

impl std::fmt::Debug for Envelope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Envelope")
            .field("request", &self.request)
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}
