//! Pending calls and invocation tokens shared by the call containers.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll};

use futures_util::future::{self, BoxFuture, FutureExt, Shared};
use thiserror::Error;
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use watchstore_types::OperationError;

/// Why a call did not produce a response.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CallError {
    /// Rejected up front because a previous call is still in flight. Carries no result.
    #[error("call suppressed: a previous call is still in flight")]
    Suppressed,
    #[error("client has no operation engine configured")]
    NotConfigured,
    /// Calls run on a Tokio runtime and none was entered on the calling thread.
    #[error("no Tokio runtime is available to run the call")]
    NoRuntime,
    /// The call ran and failed; the error has also been published to the container.
    #[error(transparent)]
    Operation(#[from] OperationError),
    #[error("call task ended without settling: {0}")]
    Aborted(String),
}

impl CallError {
    /// Whether the call was never issued.
    pub fn is_suppressed(&self) -> bool {
        matches!(self, CallError::Suppressed)
    }
}

/// The runtime calls are spawned onto, or [`CallError::NoRuntime`] outside of one.
pub(crate) fn current_runtime() -> Result<Handle, CallError> {
    Handle::try_current().map_err(|_| CallError::NoRuntime)
}

/// Handle to an issued call.
///
/// The call is driven by a Tokio task, so it settles and updates its container
/// whether or not the handle is awaited. Clones await the same outcome.
pub struct PendingCall<T> {
    outcome: Shared<BoxFuture<'static, Result<T, CallError>>>,
}

impl<T> Clone for PendingCall<T> {
    fn clone(&self) -> Self {
        Self {
            outcome: self.outcome.clone(),
        }
    }
}

impl<T> PendingCall<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Spawn `work` onto `runtime`.
    pub(crate) fn spawn_on<F>(runtime: &Handle, work: F) -> Self
    where
        F: Future<Output = Result<T, CallError>> + Send + 'static,
    {
        let (settle, call) = Self::deferred();
        settle.run_on(runtime, work);
        call
    }

    /// A handle whose work is supplied later through the returned [`Settle`].
    ///
    /// Lets a container record the handle before the work starts.
    pub(crate) fn deferred() -> (Settle<T>, Self) {
        let (sender, receiver) = oneshot::channel();
        let outcome = async move {
            match receiver.await {
                Ok(outcome) => outcome,
                Err(closed) => Err(CallError::Aborted(closed.to_string())),
            }
        }
        .boxed()
        .shared();
        (Settle { sender }, Self { outcome })
    }

    /// A call that was refused before being issued.
    pub(crate) fn rejected(error: CallError) -> Self {
        Self {
            outcome: future::ready(Err(error)).boxed().shared(),
        }
    }

    /// The outcome if the call has already settled.
    pub fn peek(&self) -> Option<Result<T, CallError>> {
        self.outcome.peek().cloned()
    }

    /// Whether both handles refer to the same issued call.
    pub fn same_call(&self, other: &Self) -> bool {
        self.outcome.ptr_eq(&other.outcome)
    }

    /// Wait for settlement, ignoring the outcome.
    pub async fn settled(self) {
        let _ = self.outcome.await;
    }
}

impl<T> Future for PendingCall<T>
where
    T: Clone,
{
    type Output = Result<T, CallError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.get_mut().outcome).poll(cx)
    }
}

impl<T> fmt::Debug for PendingCall<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingCall").finish_non_exhaustive()
    }
}

/// Completes a [`PendingCall`] created with [`PendingCall::deferred`].
///
/// Dropping it without running anything settles the call as aborted.
pub(crate) struct Settle<T> {
    sender: oneshot::Sender<Result<T, CallError>>,
}

impl<T: Send + 'static> Settle<T> {
    pub(crate) fn run_on<F>(self, runtime: &Handle, work: F)
    where
        F: Future<Output = Result<T, CallError>> + Send + 'static,
    {
        runtime.spawn(async move {
            let _ = self.sender.send(work.await);
        });
    }
}

/// Token identifying one issued call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallToken(u64);

/// Issues call tokens and remembers which one is the most recent.
#[derive(Debug, Default)]
pub(crate) struct CallSequence {
    issued: AtomicU64,
    latest: AtomicU64,
}

impl CallSequence {
    /// A token no other call of this sequence has received.
    pub(crate) fn issue(&self) -> CallToken {
        CallToken(self.issued.fetch_add(1, Ordering::SeqCst) + 1)
    }

    pub(crate) fn mark_latest(&self, token: CallToken) {
        self.latest.store(token.0, Ordering::SeqCst);
    }

    pub(crate) fn is_latest(&self, token: CallToken) -> bool {
        self.latest.load(Ordering::SeqCst) == token.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn clones_share_one_outcome() {
        let runtime = current_runtime().expect("runtime");
        let call = PendingCall::spawn_on(&runtime, async { Ok::<_, CallError>(7) });
        let clone = call.clone();
        assert!(clone.same_call(&call));
        assert_eq!(call.await, Ok(7));
        assert_eq!(clone.peek(), Some(Ok(7)));
    }

    #[test]
    fn runtime_is_required_to_issue_calls() {
        assert_eq!(current_runtime().err(), Some(CallError::NoRuntime));
        let runtime = tokio::runtime::Builder::new_current_thread().build().expect("runtime");
        let _entered = runtime.enter();
        assert!(current_runtime().is_ok());
    }

    #[tokio::test]
    async fn dropped_settle_aborts_the_call() {
        let (settle, call) = PendingCall::<u8>::deferred();
        let other = PendingCall::<u8>::rejected(CallError::Suppressed);
        assert!(!call.same_call(&other));
        drop(settle);
        assert!(matches!(call.await, Err(CallError::Aborted(_))));
    }

    #[tokio::test]
    async fn rejected_calls_settle_immediately() {
        let call: PendingCall<u8> = PendingCall::rejected(CallError::Suppressed);
        assert_eq!(call.peek(), None, "shared futures only record outcomes once polled");
        let outcome = call.await;
        assert!(outcome.unwrap_err().is_suppressed());
    }

    #[tokio::test]
    async fn panicking_work_is_reported_as_aborted() {
        let runtime = current_runtime().expect("runtime");
        let call: PendingCall<u8> = PendingCall::spawn_on(&runtime, async {
            let outcome: Result<u8, CallError> = Err(CallError::Suppressed);
            if outcome.is_err() {
                panic!("boom");
            }
            outcome
        });
        assert!(matches!(call.await, Err(CallError::Aborted(_))));
    }

    #[test]
    fn only_the_latest_token_is_current() {
        let sequence = CallSequence::default();
        let first = sequence.issue();
        sequence.mark_latest(first);
        let second = sequence.issue();
        sequence.mark_latest(second);
        assert_ne!(first, second);
        assert!(!sequence.is_latest(first));
        assert!(sequence.is_latest(second));
    }
}
