//! The four-queue event channel feeding each worker.
//!
//! Each class is a multi-producer single-consumer FIFO with a loosely
//! synchronized depth counter: the counter is authoritative about "there is
//! (or will be) an item", not about the item being visible yet. Consumers
//! treat "counted but not dequeued" as progress and come back next round.
//!
//! The priority queue additionally carries a mutex/condvar pair so it can
//! be serviced while the worker is otherwise parked during a pause.

use std::sync::atomic::{AtomicUsize, Ordering};

use crossbeam_queue::SegQueue;
use parking_lot::{Condvar, Mutex};

use crate::event::{Event, QueueKind};

pub(crate) struct EventQueues {
    queues: [SegQueue<Event>; 4],
    depths: [AtomicUsize; 4],
    /// Guards priority enqueue signaling; the queue itself is lock-free.
    pub(crate) prio_lock: Mutex<()>,
    pub(crate) prio_cond: Condvar,
}

impl EventQueues {
    pub(crate) fn new() -> Self {
        Self {
            queues: [
                SegQueue::new(),
                SegQueue::new(),
                SegQueue::new(),
                SegQueue::new(),
            ],
            depths: [
                AtomicUsize::new(0),
                AtomicUsize::new(0),
                AtomicUsize::new(0),
                AtomicUsize::new(0),
            ],
            prio_lock: Mutex::new(()),
            prio_cond: Condvar::new(),
        }
    }

    /// Enqueue into the event's class. Priority events are signaled under
    /// the lock so a parked worker is guaranteed to observe them.
    pub(crate) fn push(&self, event: Event) {
        let kind = event.class();
        match kind {
            QueueKind::Priority => {
                let _guard = self.prio_lock.lock();
                self.depths[kind as usize].fetch_add(1, Ordering::Release);
                self.queues[kind as usize].push(event);
                self.prio_cond.notify_one();
            }
            _ => {
                self.depths[kind as usize].fetch_add(1, Ordering::Release);
                self.queues[kind as usize].push(event);
            }
        }
    }

    /// The depth counter observed at entry to a dispatch round; used as
    /// that round's processing quota.
    pub(crate) fn depth(&self, kind: QueueKind) -> usize {
        self.depths[kind as usize].load(Ordering::Acquire)
    }

    /// Strictly dequeue one item, accounting for it.
    pub(crate) fn try_pop(&self, kind: QueueKind) -> Option<Event> {
        let event = self.queues[kind as usize].pop()?;
        self.depths[kind as usize].fetch_sub(1, Ordering::Release);
        Some(event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::QUEUE_KINDS;

    #[test]
    fn test_fifo_within_class() {
        let queues = EventQueues::new();
        let seen = std::sync::Arc::new(Mutex::new(Vec::new()));
        for i in 0..10 {
            let seen = seen.clone();
            queues.push(Event::Task(Box::new(move || seen.lock().push(i))));
        }
        assert_eq!(queues.depth(QueueKind::Task), 10);

        while let Some(event) = queues.try_pop(QueueKind::Task) {
            match event {
                Event::Task(task) => task(),
                _ => unreachable!(),
            }
        }
        assert_eq!(*seen.lock(), (0..10).collect::<Vec<_>>());
        assert_eq!(queues.depth(QueueKind::Task), 0);
    }

    #[test]
    fn test_classes_are_independent() {
        let queues = EventQueues::new();
        queues.push(Event::Pause);
        queues.push(Event::Task(Box::new(|| {})));

        assert_eq!(queues.depth(QueueKind::Priority), 1);
        assert_eq!(queues.depth(QueueKind::Task), 1);
        assert_eq!(queues.depth(QueueKind::Normal), 0);

        assert!(queues.try_pop(QueueKind::Normal).is_none());
        assert!(queues.try_pop(QueueKind::Priority).is_some());
        assert!(queues.try_pop(QueueKind::Task).is_some());
        for kind in QUEUE_KINDS {
            assert_eq!(queues.depth(kind), 0);
        }
    }

    #[test]
    fn test_multi_producer_counts() {
        let queues = std::sync::Arc::new(EventQueues::new());
        let mut threads = Vec::new();
        for _ in 0..4 {
            let queues = queues.clone();
            threads.push(std::thread::spawn(move || {
                for _ in 0..250 {
                    queues.push(Event::Task(Box::new(|| {})));
                }
            }));
        }
        for t in threads {
            t.join().unwrap();
        }
        assert_eq!(queues.depth(QueueKind::Task), 1000);
        let mut drained = 0;
        while queues.try_pop(QueueKind::Task).is_some() {
            drained += 1;
        }
        assert_eq!(drained, 1000);
    }
}
