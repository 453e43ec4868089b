//! Per-request execution context.
//!
//! A [`ReqContext`] carries the request's cancellation token, the caller's
//! identity (for the policy gate), and a privileged flag used by internal
//! maintenance work that must bypass policy checks. The privileged flag is
//! explicit state, never inferred from the shape of the cancellation channel.

use tokio_util::sync::CancellationToken;

/// Identity of the calling client as extracted by the RPC layer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallerInfo {
    /// Remote network address of the caller.
    pub remote_addr: String,
    /// Authenticated username of the caller.
    pub username: String,
}

impl CallerInfo {
    /// Creates caller info from an address and username.
    pub fn new(remote_addr: impl Into<String>, username: impl Into<String>) -> Self {
        Self {
            remote_addr: remote_addr.into(),
            username: username.into(),
        }
    }
}

/// Context threaded through one request.
///
/// Cloning is cheap: the cancellation token is shared, so a clone observes
/// (and can trigger) the same cancellation as the original.
#[derive(Debug, Clone)]
pub struct ReqContext {
    cancel: CancellationToken,
    caller: Option<CallerInfo>,
    privileged: bool,
}

impl ReqContext {
    /// Creates a context for a client request.
    pub fn new(caller: Option<CallerInfo>) -> Self {
        Self {
            cancel: CancellationToken::new(),
            caller,
            privileged: false,
        }
    }

    /// Creates a context bound to an externally owned cancellation token.
    pub fn with_token(caller: Option<CallerInfo>, cancel: CancellationToken) -> Self {
        Self {
            cancel,
            caller,
            privileged: false,
        }
    }

    /// Creates a privileged context for internal maintenance work.
    ///
    /// Privileged requests skip the policy gate entirely.
    pub fn internal() -> Self {
        Self {
            cancel: CancellationToken::new(),
            caller: None,
            privileged: true,
        }
    }

    /// Derives a child context: cancelling the child does not cancel the
    /// parent, but cancelling the parent cancels the child.
    pub fn child(&self) -> Self {
        Self {
            cancel: self.cancel.child_token(),
            caller: self.caller.clone(),
            privileged: self.privileged,
        }
    }

    /// The caller identity, if the request arrived over the wire.
    pub fn caller(&self) -> Option<&CallerInfo> {
        self.caller.as_ref()
    }

    /// Whether this request bypasses the policy gate.
    pub fn privileged(&self) -> bool {
        self.privileged
    }

    /// The request's cancellation token.
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Cancels the request.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Returns true once the request has been cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves when the request is cancelled.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await;
    }
}
