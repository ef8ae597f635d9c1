//! Change notification.
//!
//! Every commit that lands in this party's store produces one
//! [`ChangeEvent`]. Observers are called synchronously in registration order;
//! a failing observer is logged and never affects the commit or the other
//! observers. Async consumers can take a broadcast receiver instead.

use std::sync::{Arc, RwLock};

use tokio::sync::broadcast;
use tracing::{info, warn};

use concord_types::ChangeEvent;

const EVENT_BUFFER: usize = 256;

pub trait ChangeObserver: Send + Sync {
    fn on_change(&self, event: &ChangeEvent) -> anyhow::Result<()>;
}

/// Logs each change at info level.
pub struct TracingObserver;

impl ChangeObserver for TracingObserver {
    fn on_change(&self, event: &ChangeEvent) -> anyhow::Result<()> {
        info!(
            "Thread {}: {} produced {} record(s), consumed {}",
            event.thread_id,
            event.command,
            event.produced.len(),
            event.consumed.len()
        );
        Ok(())
    }
}

/// Does nothing.
pub struct NullObserver;

impl ChangeObserver for NullObserver {
    fn on_change(&self, _event: &ChangeEvent) -> anyhow::Result<()> {
        Ok(())
    }
}

#[derive(Clone)]
pub struct Notifier {
    inner: Arc<NotifierInner>,
}

struct NotifierInner {
    observers: RwLock<Vec<Arc<dyn ChangeObserver>>>,
    events: broadcast::Sender<ChangeEvent>,
}

impl Notifier {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        Self {
            inner: Arc::new(NotifierInner {
                observers: RwLock::new(Vec::new()),
                events,
            }),
        }
    }

    pub fn register(&self, observer: Arc<dyn ChangeObserver>) {
        match self.inner.observers.write() {
            Ok(mut observers) => observers.push(observer),
            Err(e) => warn!("Observer list poisoned, registration dropped: {}", e),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChangeEvent> {
        self.inner.events.subscribe()
    }

    pub fn publish(&self, event: ChangeEvent) {
        let observers = match self.inner.observers.read() {
            Ok(observers) => observers.clone(),
            Err(e) => {
                warn!("Observer list poisoned: {}", e);
                Vec::new()
            }
        };

        for observer in &observers {
            if let Err(e) = observer.on_change(&event) {
                warn!("Observer failed on {} for thread {}: {:#}", event.command, event.thread_id, e);
            }
        }

        // No receivers is fine
        let _ = self.inner.events.send(event);
    }
}

impl Default for Notifier {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use concord_types::{Command, ThreadId};

    struct Failing;

    impl ChangeObserver for Failing {
        fn on_change(&self, _event: &ChangeEvent) -> anyhow::Result<()> {
            anyhow::bail!("observer is broken")
        }
    }

    #[derive(Default)]
    struct Counting(AtomicUsize);

    impl ChangeObserver for Counting {
        fn on_change(&self, _event: &ChangeEvent) -> anyhow::Result<()> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn event() -> ChangeEvent {
        ChangeEvent {
            command: Command::SendMessage,
            thread_id: ThreadId::new(),
            transition_id: None,
            produced: vec![],
            consumed: vec![],
        }
    }

    #[tokio::test]
    async fn failing_observer_does_not_stop_the_others() {
        let notifier = Notifier::new();
        let counting = Arc::new(Counting::default());
        notifier.register(Arc::new(Failing));
        notifier.register(counting.clone());
        notifier.register(Arc::new(NullObserver));
        let mut rx = notifier.subscribe();

        notifier.publish(event());

        assert_eq!(counting.0.load(Ordering::SeqCst), 1);
        assert_eq!(rx.recv().await.unwrap().command, Command::SendMessage);
    }
}
