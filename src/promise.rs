//! Single shot awaitable whose fulfillment is driven externally
//!
//! The event side of a streaming query takes these out of the shared state
//! and settles them after the lock is released; the awaiting side parks on
//! [Expect::wait].
use tokio::sync::oneshot;

/// The settling half. Fulfilling consumes the handle, so a promise can be
/// settled at most once
pub(crate) struct Promise<T> {
    tx: oneshot::Sender<T>,
}

/// The awaiting half
pub(crate) struct Expect<T> {
    rx: oneshot::Receiver<T>,
}

/// The promise was dropped without being fulfilled
#[derive(Debug, PartialEq, Eq)]
pub(crate) struct Dropped;

/// Create a connected promise/expect pair
pub(crate) fn promise<T>() -> (Promise<T>, Expect<T>) {
    let (tx, rx) = oneshot::channel();
    (Promise { tx }, Expect { rx })
}

impl<T> Promise<T> {
    /// Settle the promise. A receiver that already went away is fine,
    /// the value is discarded
    pub(crate) fn fulfill(self, value: T) {
        let _ = self.tx.send(value);
    }
}

impl<T> Expect<T> {
    /// Wait for the value. Settling before the wait starts is fine, the
    /// value is buffered
    pub(crate) async fn wait(self) -> Result<T, Dropped> {
        self.rx.await.map_err(|_| Dropped)
    }
}
