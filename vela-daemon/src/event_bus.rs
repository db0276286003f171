//! Named-channel publish/subscribe fabric (spec §4.1).
//!
//! Grounded on the original `events/event.py` / `events/event_manager.py`
//! (per-channel ordered handler list, isolated failure scope, `use_log`
//! recursion guard) and on the generic `EventBus<T>` wrapper pattern from
//! the pack (`storage-hub`'s `actors-framework::event_bus`). Handlers run
//! in attach order, sequentially, inside `publish` (I6): a failing handler
//! is caught and logged, the rest still run, and the publisher never
//! observes the failure (P5).

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::error;

type BoxFuture<'a> = Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + 'a>>;
type Handler<T> = Arc<dyn Fn(T) -> BoxFuture<'static> + Send + Sync>;

/// A single named publication channel carrying payloads of type `T`.
pub struct Channel<T> {
    name: &'static str,
    handlers: Mutex<Vec<Handler<T>>>,
    /// When false, handler failures are printed to stderr instead of logged,
    /// breaking the recursion where a failing log handler would itself
    /// publish a log message (spec §4.1 "Recursion guard").
    use_log: bool,
}

impl<T: Clone + Send + 'static> Channel<T> {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            handlers: Mutex::new(Vec::new()),
            use_log: true,
        }
    }

    /// A channel whose handler failures must never re-enter the logging
    /// subsystem (used for the log fan-out channel itself).
    pub fn without_log_recursion(name: &'static str) -> Self {
        Self {
            name,
            handlers: Mutex::new(Vec::new()),
            use_log: false,
        }
    }

    /// Appends `handler` to this channel. Duplicate attaches fire
    /// duplicate times (not idempotent-by-identity), matching the original.
    pub async fn attach<F, Fut>(&self, handler: F)
    where
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let boxed: Handler<T> = Arc::new(move |payload| Box::pin(handler(payload)));
        self.handlers.lock().await.push(boxed);
    }

    /// Appends `handler`, returning a token that can later be passed to
    /// `detach`. Plain closures compare unequal to each other by identity,
    /// so detachment is keyed on this token rather than the closure itself.
    pub async fn attach_tracked<F, Fut>(&self, handler: F) -> HandlerToken
    where
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let boxed: Handler<T> = Arc::new(move |payload| Box::pin(handler(payload)));
        let token = HandlerToken(Arc::as_ptr(&boxed) as *const () as usize);
        self.handlers.lock().await.push(boxed);
        token
    }

    /// Removes one occurrence of the handler identified by `token`.
    /// Absence is silent (spec §4.1).
    pub async fn detach(&self, token: HandlerToken) {
        let mut handlers = self.handlers.lock().await;
        if let Some(idx) = handlers
            .iter()
            .position(|h| Arc::as_ptr(h) as *const () as usize == token.0)
        {
            handlers.remove(idx);
        }
    }

    /// Invokes every currently-attached handler in attach order with the
    /// same payload, cloned per handler. A handler failure is caught,
    /// logged (or routed to stderr per `use_log`), and does not prevent
    /// the remaining handlers from running, nor does it propagate to the
    /// caller (I6, P5).
    pub async fn publish(&self, payload: T) {
        // Snapshot the handler list so a handler that attaches/detaches
        // during its own run doesn't shift indices out from under us.
        let handlers: Vec<Handler<T>> = self.handlers.lock().await.clone();
        for handler in handlers {
            if let Err(e) = handler(payload.clone()).await {
                self.log_handler_failure(&e);
            }
        }
    }

    fn log_handler_failure(&self, err: &anyhow::Error) {
        if self.use_log {
            error!(channel = self.name, error = %err, "event handler failed");
        } else {
            eprintln!("events.{}: handler failed: {err:#}", self.name);
        }
    }

    #[cfg(test)]
    async fn handler_count(&self) -> usize {
        self.handlers.lock().await.len()
    }
}

/// Opaque handle returned by `attach_tracked`, used to `detach` later.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandlerToken(usize);

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn handlers_fire_in_attach_order() {
        let channel: Channel<i32> = Channel::new("test");
        let order = Arc::new(Mutex::new(Vec::new()));

        let o1 = order.clone();
        channel
            .attach(move |v| {
                let o1 = o1.clone();
                async move {
                    o1.lock().await.push((1, v));
                    Ok(())
                }
            })
            .await;

        let o2 = order.clone();
        channel
            .attach(move |v| {
                let o2 = o2.clone();
                async move {
                    o2.lock().await.push((2, v));
                    Ok(())
                }
            })
            .await;

        channel.publish(42).await;

        let recorded = order.lock().await;
        assert_eq!(*recorded, vec![(1, 42), (2, 42)]);
    }

    #[tokio::test]
    async fn failing_handler_does_not_suppress_others() {
        let channel: Channel<i32> = Channel::new("test");
        let hit = Arc::new(AtomicUsize::new(0));

        channel
            .attach(|_| async { anyhow::bail!("boom") })
            .await;

        let hit2 = hit.clone();
        channel
            .attach(move |_| {
                let hit2 = hit2.clone();
                async move {
                    hit2.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            })
            .await;

        channel.publish(1).await;
        assert_eq!(hit.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn attach_then_detach_leaves_channel_unchanged() {
        let channel: Channel<i32> = Channel::new("test");
        assert_eq!(channel.handler_count().await, 0);

        let token = channel.attach_tracked(|_| async { Ok(()) }).await;
        assert_eq!(channel.handler_count().await, 1);

        channel.detach(token).await;
        assert_eq!(channel.handler_count().await, 0);
    }

    #[tokio::test]
    async fn detach_of_unknown_token_is_silent() {
        let channel: Channel<i32> = Channel::new("test");
        channel.detach(HandlerToken(0xdead)).await;
        assert_eq!(channel.handler_count().await, 0);
    }

    #[tokio::test]
    async fn duplicate_attach_fires_duplicate_times() {
        let channel: Channel<i32> = Channel::new("test");
        let count = Arc::new(AtomicUsize::new(0));

        for _ in 0..2 {
            let count = count.clone();
            channel
                .attach(move |_| {
                    let count = count.clone();
                    async move {
                        count.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    }
                })
                .await;
        }

        channel.publish(1).await;
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }
}
