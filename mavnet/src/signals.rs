//! # In-process signals
//!
//! A minimal typed publish/subscribe primitive that lets loosely coupled
//! parts of an application react to network events without importing each
//! other. Subscriptions are scoped: dropping the [`SignalSubscription`]
//! guard unsubscribes the handler.

use std::sync::{Arc, Mutex};

use crate::protocol::dialect::messages::GpsRtcmData;

type Callback<T> = Arc<dyn Fn(&T) + Send + Sync>;

struct Subscribers<T> {
    next_id: u64,
    entries: Vec<(u64, Callback<T>)>,
}

/// A typed signal with scoped subscriptions.
pub struct Signal<T> {
    inner: Arc<Mutex<Subscribers<T>>>,
}

impl<T> Signal<T> {
    /// Creates a signal with no subscribers.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Subscribers {
                next_id: 0,
                entries: Vec::new(),
            })),
        }
    }

    /// Subscribes a handler; the subscription lasts until the returned guard
    /// is dropped.
    #[must_use]
    pub fn subscribe(&self, handler: impl Fn(&T) + Send + Sync + 'static) -> SignalSubscription<T> {
        let mut inner = self.inner.lock().expect("poisoned signal mutex");
        let id = inner.next_id;
        inner.next_id += 1;
        inner.entries.push((id, Arc::new(handler)));
        SignalSubscription {
            inner: self.inner.clone(),
            id,
        }
    }

    /// Delivers an event to every live subscriber.
    pub fn emit(&self, event: &T) {
        let callbacks: Vec<Callback<T>> = {
            let inner = self.inner.lock().expect("poisoned signal mutex");
            inner.entries.iter().map(|(_, cb)| cb.clone()).collect()
        };
        for callback in callbacks {
            callback(event);
        }
    }

    /// Number of live subscribers.
    pub fn receiver_count(&self) -> usize {
        self.inner.lock().expect("poisoned signal mutex").entries.len()
    }
}

impl<T> Clone for Signal<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> Default for Signal<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Guard that keeps a signal subscription alive.
pub struct SignalSubscription<T> {
    inner: Arc<Mutex<Subscribers<T>>>,
    id: u64,
}

impl<T> Drop for SignalSubscription<T> {
    fn drop(&mut self) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.entries.retain(|(id, _)| *id != self.id);
        }
    }
}

/// Event emitted when a network has encoded an RTK correction packet into
/// MAVLink fragments.
#[derive(Clone, Debug)]
pub struct RtkFragmentsEvent {
    /// Identifier of the network that produced the fragments.
    pub sender: String,
    /// The encoded fragment batch, in transmission order.
    pub messages: Vec<GpsRtcmData>,
}

/// The set of signals a network emits during its lifetime.
#[derive(Clone, Default)]
pub struct SignalHub {
    /// Emitted on every encoded RTK correction packet batch.
    pub rtk_fragments: Signal<RtkFragmentsEvent>,
}

impl SignalHub {
    /// Creates a hub with no subscribers.
    pub fn new() -> Self {
        Self::default()
    }
}

#[cfg(test)]
mod signal_tests {
    use super::*;

    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn emit_reaches_live_subscribers_only() {
        let signal: Signal<u32> = Signal::new();
        let hits = Arc::new(AtomicUsize::new(0));

        let subscription = {
            let hits = hits.clone();
            signal.subscribe(move |value| {
                hits.fetch_add(*value as usize, Ordering::SeqCst);
            })
        };

        signal.emit(&2);
        assert_eq!(hits.load(Ordering::SeqCst), 2);
        assert_eq!(signal.receiver_count(), 1);

        drop(subscription);
        signal.emit(&3);
        assert_eq!(hits.load(Ordering::SeqCst), 2);
        assert_eq!(signal.receiver_count(), 0);
    }

    #[test]
    fn multiple_subscribers_all_fire() {
        let signal: Signal<()> = Signal::new();
        let hits = Arc::new(AtomicUsize::new(0));

        let _subs: Vec<_> = (0..3)
            .map(|_| {
                let hits = hits.clone();
                signal.subscribe(move |_| {
                    hits.fetch_add(1, Ordering::SeqCst);
                })
            })
            .collect();

        signal.emit(&());
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }
}
