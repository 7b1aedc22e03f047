//! `Store<T>`: a subscribable single-slot value holder.
//!
//! Listeners receive the current value as soon as they subscribe and every value
//! published afterward. A store created with [`Store::readable`] runs its start hook
//! when the first listener arrives and the stop handle returned by that hook when
//! the last listener leaves, so upstream resources only live while someone is
//! listening.
//!
//! Delivery is snapshot based and the internal lock is never held while a listener
//! runs. Values published while a notification round is in progress (for example by
//! a listener) are queued and delivered after the round, in publish order, so every
//! listener observes the same monotonically advancing sequence.

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::trace;

/// An owned one-shot closure that removes a subscription when called.
pub type Unsubscribe = Box<dyn FnOnce() + Send + Sync>;

/// Closure type for store listeners.
pub type ListenerFn<T> = dyn Fn(&T) + Send + Sync;

type StartFn<T> = dyn Fn(Setter<T>) -> Option<Unsubscribe> + Send + Sync;

/// Read side shared by every exported container.
pub trait Readable<T> {
    /// The current value, without activating the store.
    fn get(&self) -> T;

    /// Register `listener`; it is called immediately with the current value.
    fn subscribe<F>(&self, listener: F) -> Unsubscribe
    where
        F: Fn(&T) + Send + Sync + 'static;
}

struct Delivery<T> {
    listeners: Vec<Arc<ListenerFn<T>>>,
    value: T,
}

struct State<T> {
    value: T,
    listeners: Vec<(u64, Arc<ListenerFn<T>>)>,
    next_id: u64,
    stop: Option<Unsubscribe>,
    pending: VecDeque<Delivery<T>>,
    delivering: bool,
    // Set while the start hook runs. Values published meanwhile become the value the
    // first listener is handed, instead of separate notifications.
    starting: bool,
}

struct Shared<T> {
    state: Mutex<State<T>>,
    start: Option<Box<StartFn<T>>>,
}

/// Subscribable single-slot value holder. Cloning yields another handle to the same slot.
pub struct Store<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for Store<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T: Clone + Send + Sync + 'static> Store<T> {
    /// A plain store with no start hook.
    pub fn new(value: T) -> Self {
        Self::build(value, None)
    }

    /// A store whose `start` hook runs when the first listener subscribes.
    ///
    /// The hook receives a [`Setter`] for publishing values and may return a stop
    /// handle that runs when the last listener unsubscribes. The hook runs again for
    /// the next first listener.
    pub fn readable<S>(value: T, start: S) -> Self
    where
        S: Fn(Setter<T>) -> Option<Unsubscribe> + Send + Sync + 'static,
    {
        Self::build(value, Some(Box::new(start)))
    }

    fn build(value: T, start: Option<Box<StartFn<T>>>) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State {
                    value,
                    listeners: Vec::new(),
                    next_id: 1,
                    stop: None,
                    pending: VecDeque::new(),
                    delivering: false,
                    starting: false,
                }),
                start,
            }),
        }
    }

    pub fn get(&self) -> T {
        self.shared.state.lock().value.clone()
    }

    /// Replace the value and notify every listener.
    pub fn set(&self, value: T) {
        self.shared.publish(value);
    }

    /// Replace the value with `f(current)` and notify every listener.
    pub fn update<F>(&self, f: F)
    where
        F: FnOnce(&T) -> T,
    {
        self.shared.update_if(|current| Some(f(current)));
    }

    /// Publish `value` unless `same(current, value)` holds. Returns whether listeners were notified.
    pub fn publish_if_changed<F>(&self, value: T, same: F) -> bool
    where
        F: FnOnce(&T, &T) -> bool,
    {
        self.shared.publish_if_changed(value, same)
    }

    /// Publish `value` unless it equals the current value.
    pub fn publish_if_ne(&self, value: T) -> bool
    where
        T: PartialEq,
    {
        self.shared.publish_if_changed(value, |current, next| current == next)
    }

    /// Compute the next value from the current one while holding the store lock.
    ///
    /// `f` returning `None` leaves the store untouched and notifies nobody. The
    /// decision and the transition are atomic with respect to every other publish on
    /// this store. `f` must not call back into the same store.
    pub fn update_if<F>(&self, f: F) -> bool
    where
        F: FnOnce(&T) -> Option<T>,
    {
        self.shared.update_if(f)
    }

    /// A publishing handle that does not keep the store alive.
    pub fn setter(&self) -> Setter<T> {
        Setter {
            shared: Arc::downgrade(&self.shared),
        }
    }

    /// Register `listener` and call it with the current value.
    pub fn subscribe<F>(&self, listener: F) -> Unsubscribe
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let listener: Arc<ListenerFn<T>> = Arc::new(listener);
        let (listener_id, first) = {
            let mut state = self.shared.state.lock();
            let listener_id = state.next_id;
            state.next_id += 1;
            state.listeners.push((listener_id, Arc::clone(&listener)));
            (listener_id, state.listeners.len() == 1)
        };

        if first && let Some(start) = &self.shared.start {
            trace!(listener_id, "store activated");
            self.shared.state.lock().starting = true;
            let stop = start(self.setter());
            let mut state = self.shared.state.lock();
            state.starting = false;
            if state.listeners.is_empty() {
                // The only listener left while the hook was running.
                drop(state);
                if let Some(stop) = stop {
                    stop();
                }
            } else {
                state.stop = stop;
            }
        }

        {
            let mut state = self.shared.state.lock();
            let value = state.value.clone();
            state.pending.push_back(Delivery {
                listeners: vec![listener],
                value,
            });
        }
        self.shared.drain();

        let shared = Arc::clone(&self.shared);
        Box::new(move || shared.remove_listener(listener_id))
    }

    pub fn listener_count(&self) -> usize {
        self.shared.state.lock().listeners.len()
    }

    /// Whether anyone is listening, i.e. whether the start hook's resources are live.
    pub fn is_active(&self) -> bool {
        self.listener_count() > 0
    }
}

impl<T: Clone + Send + Sync + 'static> Readable<T> for Store<T> {
    fn get(&self) -> T {
        Store::get(self)
    }

    fn subscribe<F>(&self, listener: F) -> Unsubscribe
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        Store::subscribe(self, listener)
    }
}

impl<T: fmt::Debug> fmt::Debug for Store<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.shared.state.lock();
        f.debug_struct("Store")
            .field("value", &state.value)
            .field("listeners", &state.listeners.len())
            .finish()
    }
}

/// Weak publishing handle handed to start hooks and upstream callbacks.
///
/// Publishing through a setter whose store has been dropped is a no-op.
pub struct Setter<T> {
    shared: Weak<Shared<T>>,
}

impl<T> Clone for Setter<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Weak::clone(&self.shared),
        }
    }
}

impl<T: Clone + Send + Sync + 'static> Setter<T> {
    /// The current value, or `None` once the store is gone.
    pub fn get(&self) -> Option<T> {
        self.shared.upgrade().map(|shared| shared.state.lock().value.clone())
    }

    pub fn set(&self, value: T) {
        if let Some(shared) = self.shared.upgrade() {
            shared.publish(value);
        }
    }

    pub fn publish_if_changed<F>(&self, value: T, same: F) -> bool
    where
        F: FnOnce(&T, &T) -> bool,
    {
        self.shared
            .upgrade()
            .is_some_and(|shared| shared.publish_if_changed(value, same))
    }

    pub fn publish_if_ne(&self, value: T) -> bool
    where
        T: PartialEq,
    {
        self.publish_if_changed(value, |current, next| current == next)
    }

    pub fn update_if<F>(&self, f: F) -> bool
    where
        F: FnOnce(&T) -> Option<T>,
    {
        self.shared.upgrade().is_some_and(|shared| shared.update_if(f))
    }
}

impl<T: Clone + Send + Sync + 'static> Shared<T> {
    fn publish(&self, value: T) {
        self.update_if(|_| Some(value));
    }

    fn publish_if_changed<F>(&self, value: T, same: F) -> bool
    where
        F: FnOnce(&T, &T) -> bool,
    {
        self.update_if(|current| if same(current, &value) { None } else { Some(value) })
    }

    fn update_if<F>(&self, f: F) -> bool
    where
        F: FnOnce(&T) -> Option<T>,
    {
        {
            let mut state = self.state.lock();
            let Some(next) = f(&state.value) else {
                return false;
            };
            if state.starting {
                state.value = next;
                return true;
            }
            state.value = next.clone();
            let listeners = state.listeners.iter().map(|(_, listener)| Arc::clone(listener)).collect();
            state.pending.push_back(Delivery { listeners, value: next });
        }
        self.drain();
        true
    }

    /// Deliver queued values. Only one caller drains at a time; others return at once
    /// and their values are delivered by the active drainer.
    fn drain(&self) {
        {
            let mut state = self.state.lock();
            if state.delivering {
                return;
            }
            state.delivering = true;
        }
        let _guard = DeliveryGuard { shared: self };
        loop {
            let delivery = {
                let mut state = self.state.lock();
                match state.pending.pop_front() {
                    Some(delivery) => delivery,
                    None => return,
                }
            };
            for listener in delivery.listeners {
                listener(&delivery.value);
            }
        }
    }

    fn remove_listener(&self, listener_id: u64) {
        let stop = {
            let mut state = self.state.lock();
            let before = state.listeners.len();
            state.listeners.retain(|(id, _)| *id != listener_id);
            if before != state.listeners.len() && state.listeners.is_empty() {
                state.stop.take()
            } else {
                None
            }
        };
        if let Some(stop) = stop {
            trace!(listener_id, "store deactivated");
            stop();
        }
    }
}

/// Clears the delivering flag even when a listener panics, so later publishes are
/// not stuck behind a dead drainer.
struct DeliveryGuard<'a, T> {
    shared: &'a Shared<T>,
}

impl<T> Drop for DeliveryGuard<'_, T> {
    fn drop(&mut self) {
        let mut state = self.shared.state.lock();
        state.delivering = false;
        if std::thread::panicking() {
            state.pending.clear();
        }
    }
}
