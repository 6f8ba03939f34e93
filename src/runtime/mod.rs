//! The abstraction runtime: a per-abstraction serial event queue plus the
//! subscribe/register glue every higher layer is built out of.
//!
//! Every concrete abstraction (`link`, `pfd`, `beb`, `erb`, `consensus`,
//! `election`, `voting`) owns one [`EventQueue`]/[`EventLoop`] pair. The
//! queue side is cheaply cloneable and handed out as the abstraction's
//! public API (`propose`, `trigger_event`, ...); the loop side is moved into
//! exactly one spawned task that drains it serially, so handlers of the same
//! abstraction never race each other — matching the "happens-before or
//! happens-after" contract in spec.md §4.1.
//!
//! Unlike the original Python (`event_flag, args, kwargs` tuples dispatched
//! by string name against an `event_handler_map`), every concrete
//! abstraction below defines its own small `enum` of event kinds and matches
//! on it exhaustively. This is the tagged-dispatch redesign spec.md §9
//! suggests in place of string-keyed lookup.

pub mod registrable;
pub mod subscribable;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// The sending half of an abstraction's event queue. Cheaply cloneable;
/// every collaborator that needs to post an event to this abstraction holds
/// one of these.
#[derive(Clone)]
pub struct EventQueue<E> {
    sender: mpsc::UnboundedSender<E>,
    alive: Arc<AtomicBool>,
}

impl<E> EventQueue<E> {
    /// Enqueues an event. Silently dropped if the worker has already shut
    /// down and its receiver is gone — spec.md §5 "no in-flight event is
    /// abandoned; queued events are dropped" after `stop()`.
    pub fn trigger(&self, event: E) {
        let _ = self.sender.send(event);
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    pub fn stop(&self) {
        self.alive.store(false, Ordering::Release);
    }

    /// A raw sender handle equivalent to `trigger`, for handing to another
    /// abstraction's `Subscribers::subscribe_abstraction` so it can forward
    /// notifications into this queue directly.
    pub fn sender_handle(&self) -> mpsc::UnboundedSender<E> {
        self.sender.clone()
    }
}

/// The receiving half, consumed by exactly one spawned worker task.
pub struct EventLoop<E> {
    receiver: mpsc::UnboundedReceiver<E>,
    alive: Arc<AtomicBool>,
    tick: Duration,
}

/// Builds a fresh queue/loop pair. The queue starts alive immediately:
/// `start()` in this implementation spawns the worker, there is no
/// separate "constructed but not yet alive" state to model.
pub fn channel<E: Send + 'static>(tick: Duration) -> (EventQueue<E>, EventLoop<E>) {
    let (sender, receiver) = mpsc::unbounded_channel();
    let alive = Arc::new(AtomicBool::new(true));
    (
        EventQueue {
            sender,
            alive: alive.clone(),
        },
        EventLoop {
            receiver,
            alive,
            tick,
        },
    )
}

impl<E: Send + 'static> EventLoop<E> {
    /// Spawns the single worker task for this abstraction. `handle` is
    /// invoked serially, once per dequeued event, only while the queue is
    /// alive; the current call always runs to completion even if `stop()`
    /// is observed on the next iteration (spec.md §5 "Cancellation /
    /// timeout").
    pub fn spawn<F, Fut>(mut self, mut handle: F) -> JoinHandle<()>
    where
        F: FnMut(E) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = ()> + Send,
    {
        tokio::spawn(async move {
            loop {
                if !self.alive.load(Ordering::Acquire) {
                    break;
                }
                match tokio::time::timeout(self.tick, self.receiver.recv()).await {
                    Ok(Some(event)) => {
                        if self.alive.load(Ordering::Acquire) {
                            handle(event).await;
                        }
                    }
                    Ok(None) => break,
                    Err(_elapsed) => continue,
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    #[tokio::test]
    async fn events_are_handled_serially_in_order() {
        let (queue, event_loop) = channel::<String>(Duration::from_millis(50));
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let seen2 = seen.clone();
        let handle = event_loop.spawn(move |event: String| {
            let seen = seen2.clone();
            async move {
                seen.lock().unwrap().push(event);
            }
        });

        queue.trigger("task0".to_string());
        queue.trigger("task1".to_string());
        queue.trigger("task2".to_string());

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(*seen.lock().unwrap(), vec!["task0", "task1", "task2"]);

        queue.stop();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn events_after_stop_are_dropped_silently() {
        let (queue, event_loop) = channel::<u32>(Duration::from_millis(20));
        let count = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let count2 = count.clone();
        let handle = event_loop.spawn(move |_event: u32| {
            let count = count2.clone();
            async move {
                count.fetch_add(1, Ordering::SeqCst);
            }
        });

        queue.stop();
        queue.trigger(1);
        queue.trigger(2);

        tokio::time::sleep(Duration::from_millis(60)).await;
        handle.await.unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }
}
