//! Subscribable: an abstraction that keeps an unordered set of callbacks and
//! notifies every one of them with the same value (spec.md §3
//! "Subscription", §4.1 "Subscribable"). Order of iteration is never
//! observable, so no caller should depend on it.

use parking_lot::Mutex;
use tokio::sync::mpsc;

type Callback<T> = Box<dyn Fn(T) + Send + Sync>;

pub struct Subscribers<T> {
    callbacks: Mutex<Vec<Callback<T>>>,
}

impl<T: Clone + Send + 'static> Default for Subscribers<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone + Send + 'static> Subscribers<T> {
    pub fn new() -> Self {
        Subscribers {
            callbacks: Mutex::new(Vec::new()),
        }
    }

    /// `subscribe(fn)`: appends a direct callable.
    pub fn subscribe<F>(&self, callback: F)
    where
        F: Fn(T) + Send + Sync + 'static,
    {
        self.callbacks.lock().push(Box::new(callback));
    }

    /// `subscribe_abstraction(abstr, event)`: appends a shim that, when
    /// invoked, enqueues the wrapped event on `abstr`'s own queue, preserving
    /// that abstraction's serial per-instance ordering.
    pub fn subscribe_abstraction<E, F>(&self, sender: mpsc::UnboundedSender<E>, wrap: F)
    where
        E: Send + 'static,
        F: Fn(T) -> E + Send + Sync + 'static,
    {
        self.subscribe(move |value: T| {
            let _ = sender.send(wrap(value));
        });
    }

    /// Fires every callback with the same value. Order is unspecified.
    pub fn notify(&self, value: T) {
        let callbacks = self.callbacks.lock();
        for callback in callbacks.iter() {
            callback(value.clone());
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.callbacks.lock().len()
    }
}
