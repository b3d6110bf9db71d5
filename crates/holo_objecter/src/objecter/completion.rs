//! At-most-once continuations.
//!
//! A `Completion` is consumed by `complete`, so the type system rules out a
//! second invocation. The engine never runs continuations under its lock: it
//! queues them as `Deferred` closures and runs them after releasing it.

use std::fmt;

use tokio::sync::oneshot;

use super::error::ObjecterError;
use super::types::{Epoch, SubOpOutput};

/// Closure queued while the router lock is held and run after release.
pub(crate) type Deferred = Box<dyn FnOnce() + Send + 'static>;

/// Waiter parked until a map epoch is reached (or the router shuts down).
pub(crate) type MapWaiter = Box<dyn FnOnce(Result<Epoch, ObjecterError>) + Send + 'static>;

/// Successful terminal state of an object request.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct OpOutcome {
    pub result: i32,
    pub outputs: Vec<SubOpOutput>,
    /// Object version reported by the storage node.
    pub version: u64,
    /// Map epoch the storage node replied with.
    pub reply_epoch: Epoch,
}

pub type OpResult = Result<OpOutcome, ObjecterError>;

/// Caller continuation: a boxed callback or a oneshot channel.
pub enum Completion<T> {
    Callback(Box<dyn FnOnce(Result<T, ObjecterError>) + Send + 'static>),
    Channel(oneshot::Sender<Result<T, ObjecterError>>),
}

impl<T: Send + 'static> Completion<T> {
    pub fn callback<F>(f: F) -> Self
    where
        F: FnOnce(Result<T, ObjecterError>) + Send + 'static,
    {
        Completion::Callback(Box::new(f))
    }

    /// Channel-backed completion plus the receiving end. A dropped sender
    /// (request cancelled) surfaces as a receive error.
    pub fn channel() -> (Self, oneshot::Receiver<Result<T, ObjecterError>>) {
        let (tx, rx) = oneshot::channel();
        (Completion::Channel(tx), rx)
    }

    pub fn complete(self, result: Result<T, ObjecterError>) {
        match self {
            Completion::Callback(f) => f(result),
            Completion::Channel(tx) => {
                // Receiver may have given up waiting.
                let _ = tx.send(result);
            }
        }
    }

    pub(crate) fn deferred(self, result: Result<T, ObjecterError>) -> Deferred {
        Box::new(move || self.complete(result))
    }
}

impl<T> fmt::Debug for Completion<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Completion::Callback(_) => f.write_str("Completion::Callback"),
            Completion::Channel(_) => f.write_str("Completion::Channel"),
        }
    }
}

/// Await a channel completion, mapping a dropped sender to `Cancelled`.
pub(crate) async fn recv_completion<T>(
    rx: oneshot::Receiver<Result<T, ObjecterError>>,
) -> Result<T, ObjecterError> {
    match rx.await {
        Ok(result) => result,
        Err(_) => Err(ObjecterError::Cancelled),
    }
}

pub(crate) fn run_deferred(deferred: Vec<Deferred>) {
    for f in deferred {
        f();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[test]
    fn callback_runs_once_with_result() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let completion = Completion::<u32>::callback(move |r| sink.lock().unwrap().push(r));
        let deferred = completion.deferred(Ok(7));
        assert!(seen.lock().unwrap().is_empty(), "deferred must not run eagerly");
        run_deferred(vec![deferred]);
        assert_eq!(*seen.lock().unwrap(), vec![Ok(7)]);
    }

    #[tokio::test]
    async fn dropped_channel_reads_as_cancelled() {
        let (completion, rx) = Completion::<u32>::channel();
        drop(completion);
        assert_eq!(recv_completion(rx).await, Err(ObjecterError::Cancelled));
    }

    #[tokio::test]
    async fn channel_delivers_error() {
        let (completion, rx) = Completion::<u32>::channel();
        completion.complete(Err(ObjecterError::OpTimeout));
        assert_eq!(recv_completion(rx).await, Err(ObjecterError::OpTimeout));
    }
}
