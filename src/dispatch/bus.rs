//! Gossip dispatch bus
//!
//! Decoded gossip messages are published once and fanned out to every
//! listener registered at publish time. Publishing only enqueues; a single
//! dispatch thread drains the queue and invokes listeners, which keeps
//! per-listener delivery in publish order and keeps listener work off the
//! connection workers.
use std::collections::BTreeMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{mpsc as std_mpsc, Arc, Mutex, RwLock};
use std::thread;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::codec::GossipMessage;
use crate::error::{MemberError, Result};

/// Receives every gossip message published after it subscribed.
pub trait GossipListener: Send + Sync {
    fn on_gossip(&self, message: &GossipMessage) -> anyhow::Result<()>;
}

impl<F> GossipListener for F
where
    F: Fn(&GossipMessage) -> anyhow::Result<()> + Send + Sync,
{
    fn on_gossip(&self, message: &GossipMessage) -> anyhow::Result<()> {
        self(message)
    }
}

/// Handle returned by [`GossipBus::subscribe`]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct SubscriptionId(u64);

impl std::fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

type ListenerMap = BTreeMap<SubscriptionId, Arc<dyn GossipListener>>;

// One published message plus the listeners registered when it was published
struct Delivery {
    message: Arc<GossipMessage>,
    listeners: Vec<(SubscriptionId, Arc<dyn GossipListener>)>,
}

struct Dispatcher {
    handle: thread::JoinHandle<()>,
    done_rx: std_mpsc::Receiver<()>,
}

#[derive(Debug, Default)]
struct BusStats {
    published: AtomicU64,
    delivered: AtomicU64,
    listener_failures: AtomicU64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct FrozenBusStats {
    pub published: u64,
    pub delivered: u64,
    pub listener_failures: u64,
}

pub struct GossipBus {
    listeners: RwLock<ListenerMap>,
    next_id: AtomicU64,
    queue: Mutex<Option<mpsc::UnboundedSender<Delivery>>>,
    dispatcher: Mutex<Option<Dispatcher>>,
    stats: Arc<BusStats>,
}

impl std::fmt::Debug for GossipBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GossipBus")
            .field("subscribers", &self.subscriber_count())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl GossipBus {
    /// Create the bus and start its dispatch thread
    pub fn start() -> Result<Self> {
        let (tx, rx) = mpsc::unbounded_channel::<Delivery>();
        let (done_tx, done_rx) = std_mpsc::sync_channel(1);
        let stats = Arc::new(BusStats::default());
        let thread_stats = Arc::clone(&stats);

        let handle = thread::Builder::new()
            .name("gossip-dispatch".to_string())
            .spawn(move || {
                dispatch_loop(rx, &thread_stats);
                let _ = done_tx.send(());
            })?;
        debug!("Gossip dispatch thread started");

        Ok(Self {
            listeners: RwLock::new(BTreeMap::new()),
            next_id: AtomicU64::new(1),
            queue: Mutex::new(Some(tx)),
            dispatcher: Mutex::new(Some(Dispatcher { handle, done_rx })),
            stats,
        })
    }

    pub fn subscribe<L>(&self, listener: L) -> Result<SubscriptionId>
    where
        L: GossipListener + 'static,
    {
        self.subscribe_arc(Arc::new(listener))
    }

    pub fn subscribe_arc(&self, listener: Arc<dyn GossipListener>) -> Result<SubscriptionId> {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.listeners
            .write()
            .map_err(|e| MemberError::Concurrency(format!("Listener lock poisoned: {}", e)))?
            .insert(id, listener);
        debug!("Registered gossip listener {}", id);
        Ok(id)
    }

    /// Remove a listener. Messages already queued for it are still delivered.
    pub fn unsubscribe(&self, id: SubscriptionId) -> Result<bool> {
        let removed = self
            .listeners
            .write()
            .map_err(|e| MemberError::Concurrency(format!("Listener lock poisoned: {}", e)))?
            .remove(&id)
            .is_some();
        Ok(removed)
    }

    pub fn subscriber_count(&self) -> usize {
        self.listeners.read().map(|l| l.len()).unwrap_or(0)
    }

    /// Enqueue `message` for every currently registered listener.
    pub fn publish(&self, message: GossipMessage) -> Result<()> {
        let listeners: Vec<_> = self
            .listeners
            .read()
            .map_err(|e| MemberError::Concurrency(format!("Listener lock poisoned: {}", e)))?
            .iter()
            .map(|(id, listener)| (*id, Arc::clone(listener)))
            .collect();

        let queue = self
            .queue
            .lock()
            .map_err(|e| MemberError::Concurrency(format!("Bus queue lock poisoned: {}", e)))?;
        let tx = queue
            .as_ref()
            .ok_or_else(|| MemberError::Interrupted("gossip bus is closed".to_string()))?;

        self.stats.published.fetch_add(1, Ordering::Relaxed);
        if listeners.is_empty() {
            return Ok(());
        }
        tx.send(Delivery {
            message: Arc::new(message),
            listeners,
        })
        .map_err(|_| MemberError::Interrupted("gossip dispatch thread has exited".to_string()))
    }

    pub fn is_closed(&self) -> bool {
        self.queue.lock().map(|q| q.is_none()).unwrap_or(true)
    }

    pub fn stats(&self) -> FrozenBusStats {
        FrozenBusStats {
            published: self.stats.published.load(Ordering::Relaxed),
            delivered: self.stats.delivered.load(Ordering::Relaxed),
            listener_failures: self.stats.listener_failures.load(Ordering::Relaxed),
        }
    }

    /// Stop accepting publishes, drain what is queued, and join the
    /// dispatch thread. Gives up after `timeout`, leaving the thread
    /// detached. Calling it again is a no-op.
    pub fn close(&self, timeout: Duration) -> Result<()> {
        let sender = self
            .queue
            .lock()
            .map_err(|e| MemberError::Concurrency(format!("Bus queue lock poisoned: {}", e)))?
            .take();
        drop(sender);

        let dispatcher = self
            .dispatcher
            .lock()
            .map_err(|e| MemberError::Concurrency(format!("Bus dispatcher lock poisoned: {}", e)))?
            .take();
        let Some(dispatcher) = dispatcher else {
            return Ok(());
        };

        match dispatcher.done_rx.recv_timeout(timeout) {
            Ok(()) | Err(std_mpsc::RecvTimeoutError::Disconnected) => {
                dispatcher.handle.join().map_err(|_| {
                    MemberError::Concurrency("gossip dispatch thread panicked".to_string())
                })?;
                info!("Gossip bus closed");
                Ok(())
            }
            Err(std_mpsc::RecvTimeoutError::Timeout) => {
                warn!("Gossip dispatch thread still busy after {:?}, detaching", timeout);
                Err(MemberError::Interrupted(format!(
                    "gossip bus did not drain within {:?}",
                    timeout
                )))
            }
        }
    }
}

fn dispatch_loop(mut rx: mpsc::UnboundedReceiver<Delivery>, stats: &BusStats) {
    while let Some(delivery) = rx.blocking_recv() {
        for (id, listener) in delivery.listeners {
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
                listener.on_gossip(&delivery.message)
            }));
            match outcome {
                Ok(Ok(())) => {
                    stats.delivered.fetch_add(1, Ordering::Relaxed);
                }
                Ok(Err(e)) => {
                    stats.listener_failures.fetch_add(1, Ordering::Relaxed);
                    warn!("Gossip listener {} failed: {:#}", id, e);
                }
                Err(_) => {
                    stats.listener_failures.fetch_add(1, Ordering::Relaxed);
                    error!("Gossip listener {} panicked", id);
                }
            }
        }
    }
    debug!("Gossip dispatch queue drained");
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc::channel;

    use super::*;

    const WAIT: Duration = Duration::from_secs(2);

    fn message(n: u32) -> GossipMessage {
        GossipMessage {
            ip: "127.0.0.1".to_string(),
            clock: vec![n],
            ..GossipMessage::default()
        }
    }

    #[test]
    fn test_fan_out_to_all_listeners() {
        let bus = GossipBus::start().unwrap();
        let (tx, rx) = channel();
        for listener in 0..3 {
            let tx = tx.clone();
            bus.subscribe(move |m: &GossipMessage| -> anyhow::Result<()> {
                tx.send((listener, m.clock[0]))?;
                Ok(())
            })
            .unwrap();
        }

        bus.publish(message(1)).unwrap();
        bus.close(WAIT).unwrap();

        let mut received: Vec<_> = rx.try_iter().collect();
        received.sort();
        assert_eq!(received, vec![(0, 1), (1, 1), (2, 1)]);
        assert_eq!(bus.stats().delivered, 3);
    }

    #[test]
    fn test_late_subscriber_misses_earlier_publish() {
        let bus = GossipBus::start().unwrap();
        let (tx, rx) = channel();
        let early = tx.clone();
        bus.subscribe(move |m: &GossipMessage| -> anyhow::Result<()> {
            early.send(("early", m.clock[0]))?;
            Ok(())
        })
        .unwrap();

        bus.publish(message(1)).unwrap();
        bus.subscribe(move |m: &GossipMessage| -> anyhow::Result<()> {
            tx.send(("late", m.clock[0]))?;
            Ok(())
        })
        .unwrap();
        bus.publish(message(2)).unwrap();
        bus.close(WAIT).unwrap();

        let received: Vec<_> = rx.try_iter().collect();
        assert!(received.contains(&("early", 1)));
        assert!(received.contains(&("early", 2)));
        assert!(received.contains(&("late", 2)));
        assert!(!received.contains(&("late", 1)));
    }

    #[test]
    fn test_per_listener_order() {
        let bus = GossipBus::start().unwrap();
        let (tx, rx) = channel();
        bus.subscribe(move |m: &GossipMessage| -> anyhow::Result<()> {
            tx.send(m.clock[0])?;
            Ok(())
        })
        .unwrap();

        for n in 0..100 {
            bus.publish(message(n)).unwrap();
        }
        bus.close(WAIT).unwrap();

        let received: Vec<u32> = rx.try_iter().collect();
        assert_eq!(received, (0..100).collect::<Vec<_>>());
    }

    #[test]
    fn test_subscribe_while_publishing() {
        const COUNT: u32 = 2000;
        let bus = GossipBus::start().unwrap();
        let (early_tx, early_rx) = channel();
        bus.subscribe(move |m: &GossipMessage| -> anyhow::Result<()> {
            early_tx.send(m.clock[0])?;
            Ok(())
        })
        .unwrap();

        let (late_tx, late_rx) = channel();
        let started = std::sync::Barrier::new(2);
        thread::scope(|scope| {
            scope.spawn(|| {
                started.wait();
                for n in 0..COUNT {
                    bus.publish(message(n)).unwrap();
                }
            });
            scope.spawn(|| {
                started.wait();
                while bus.stats().published < u64::from(COUNT / 4) {
                    thread::yield_now();
                }
                bus.subscribe(move |m: &GossipMessage| -> anyhow::Result<()> {
                    late_tx.send(m.clock[0])?;
                    Ok(())
                })
                .unwrap();
            });
        });
        bus.close(WAIT).unwrap();

        assert_eq!(bus.stats().published, u64::from(COUNT));
        assert_eq!(early_rx.try_iter().collect::<Vec<_>>(), (0..COUNT).collect::<Vec<_>>());

        // whatever the late listener saw is an unbroken run ending at the last message
        let late: Vec<u32> = late_rx.try_iter().collect();
        let first = late.first().copied().unwrap_or(COUNT);
        assert!(first >= COUNT / 4);
        assert_eq!(late, (first..COUNT).collect::<Vec<_>>());
    }

    #[test]
    fn test_failing_listener_isolated() {
        let bus = GossipBus::start().unwrap();
        let (tx, rx) = channel();
        bus.subscribe(|_: &GossipMessage| -> anyhow::Result<()> {
            anyhow::bail!("listener rejected message")
        })
        .unwrap();
        bus.subscribe(|_: &GossipMessage| -> anyhow::Result<()> {
            panic!("listener blew up")
        })
        .unwrap();
        bus.subscribe(move |m: &GossipMessage| -> anyhow::Result<()> {
            tx.send(m.clock[0])?;
            Ok(())
        })
        .unwrap();

        bus.publish(message(1)).unwrap();
        bus.publish(message(2)).unwrap();
        bus.close(WAIT).unwrap();

        assert_eq!(rx.try_iter().collect::<Vec<_>>(), vec![1, 2]);
        let stats = bus.stats();
        assert_eq!(stats.listener_failures, 4);
        assert_eq!(stats.delivered, 2);
    }

    #[test]
    fn test_unsubscribe() {
        let bus = GossipBus::start().unwrap();
        let id = bus.subscribe(|_: &GossipMessage| -> anyhow::Result<()> { Ok(()) }).unwrap();
        assert_eq!(bus.subscriber_count(), 1);
        assert!(bus.unsubscribe(id).unwrap());
        assert!(!bus.unsubscribe(id).unwrap());
        assert_eq!(bus.subscriber_count(), 0);
        bus.close(WAIT).unwrap();
    }

    #[test]
    fn test_publish_after_close_fails() {
        let bus = GossipBus::start().unwrap();
        bus.close(WAIT).unwrap();
        assert!(bus.is_closed());
        assert!(matches!(
            bus.publish(message(1)),
            Err(MemberError::Interrupted(_))
        ));
        // second close is a no-op
        assert!(bus.close(WAIT).is_ok());
    }

    #[test]
    fn test_slow_listener_close_times_out() {
        let bus = GossipBus::start().unwrap();
        bus.subscribe(|_: &GossipMessage| -> anyhow::Result<()> {
            thread::sleep(Duration::from_millis(500));
            Ok(())
        })
        .unwrap();
        bus.publish(message(1)).unwrap();
        assert!(matches!(
            bus.close(Duration::from_millis(20)),
            Err(MemberError::Interrupted(_))
        ));
    }
}
