// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Bounded producer/consumer queue feeding the display thread.
//!
//! Push blocks while the queue is at capacity, pop blocks while it is
//! empty; a stop signal wakes both sides so shutdown never hangs on a
//! sleeping thread.

use std::collections::VecDeque;
use std::sync::Condvar;
use std::sync::Mutex;

struct State<T> {
    items: VecDeque<T>,
    stopped: bool,
}

pub(crate) struct TaskQueue<T> {
    state: Mutex<State<T>>,
    reader: Condvar,
    writer: Condvar,
    capacity: usize,
}

impl<T> TaskQueue<T> {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(State { items: VecDeque::new(), stopped: false }),
            reader: Condvar::new(),
            writer: Condvar::new(),
            capacity,
        }
    }

    /// Enqueues `item`, blocking while the queue is full. Returns false if
    /// the queue was stopped, in which case the item is dropped.
    pub(crate) fn push(&self, item: T) -> bool {
        let mut state = self.state.lock().unwrap();
        while state.items.len() >= self.capacity && !state.stopped {
            state = self.writer.wait(state).unwrap();
        }
        if state.stopped {
            return false;
        }
        state.items.push_back(item);
        self.reader.notify_one();
        true
    }

    /// Dequeues the oldest item, blocking while the queue is empty.
    /// Returns `None` once the queue is stopped.
    pub(crate) fn pop(&self) -> Option<T> {
        let mut state = self.state.lock().unwrap();
        loop {
            if state.stopped {
                return None;
            }
            if let Some(item) = state.items.pop_front() {
                self.writer.notify_one();
                return Some(item);
            }
            state = self.reader.wait(state).unwrap();
        }
    }

    /// Stops the queue: wakes every waiter and discards pending items.
    pub(crate) fn stop(&self) {
        let mut state = self.state.lock().unwrap();
        state.stopped = true;
        state.items.clear();
        self.reader.notify_all();
        self.writer.notify_all();
    }

    /// Reopens a stopped queue.
    pub(crate) fn restart(&self) {
        self.state.lock().unwrap().stopped = false;
    }

    pub(crate) fn len(&self) -> usize {
        self.state.lock().unwrap().items.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn fifo_order() {
        let queue = TaskQueue::new(4);
        assert!(queue.push(1));
        assert!(queue.push(2));
        assert!(queue.push(3));
        assert_eq!(queue.pop(), Some(1));
        assert_eq!(queue.pop(), Some(2));
        assert_eq!(queue.pop(), Some(3));
        assert_eq!(queue.len(), 0);
    }

    #[test]
    fn stop_wakes_blocked_pop() {
        let queue = Arc::new(TaskQueue::<u32>::new(2));
        let consumer = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || queue.pop())
        };
        // Give the consumer time to block on the empty queue.
        thread::sleep(Duration::from_millis(20));
        queue.stop();
        assert_eq!(consumer.join().unwrap(), None);
    }

    #[test]
    fn push_blocks_at_capacity_until_pop() {
        let queue = Arc::new(TaskQueue::new(1));
        assert!(queue.push(1));
        let producer = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || queue.push(2))
        };
        thread::sleep(Duration::from_millis(20));
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.pop(), Some(1));
        assert!(producer.join().unwrap());
        assert_eq!(queue.pop(), Some(2));
    }

    #[test]
    fn stopped_queue_rejects_pushes() {
        let queue = TaskQueue::new(2);
        queue.stop();
        assert!(!queue.push(1));
        assert_eq!(queue.pop(), None);
        queue.restart();
        assert!(queue.push(1));
        assert_eq!(queue.pop(), Some(1));
    }
}
