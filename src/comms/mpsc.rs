//! Unbounded lock-free queue for multi-producer, single-consumer scenarios.
//!
//! This module provides `FunnelQueue`, a linked-list queue that lets any
//! number of producer threads hand items over to one consumer thread without
//! locking. Producers publish in two steps (swap the write end, then link the
//! predecessor), so the consumer can briefly observe an empty queue while a
//! push is mid-flight and simply retries on its next pass. Ideal for feeding
//! submissions into a single dispatch thread.

use std::cell::UnsafeCell;
use std::ptr;
use std::sync::atomic::AtomicPtr;
use std::sync::atomic::Ordering::{AcqRel, Acquire, Release};

use crate::TimerError;

struct Node<T> {
    next: AtomicPtr<Node<T>>,
    value: Option<T>,
}

impl<T> Node<T> {
    fn boxed(value: Option<T>) -> *mut Node<T> {
        Box::into_raw(Box::new(Node {
            next: AtomicPtr::new(ptr::null_mut()),
            value,
        }))
    }
}

/// An unbounded lock-free queue for multi-producer, single-consumer (MPSC) scenarios.
#[derive(Debug)]
pub struct FunnelQueue<T> {
    /// Most recently pushed node; producers race to swap themselves in here.
    write: AtomicPtr<Node<T>>,
    /// Consumer cursor, always pointing at the last consumed (stub) node.
    /// Only the single consumer thread may touch this.
    read: UnsafeCell<*mut Node<T>>,
}

impl<T> Default for FunnelQueue<T> {
    /// Creates a new empty `FunnelQueue`.
    fn default() -> Self {
        FunnelQueue::new()
    }
}

impl<T> FunnelQueue<T> {
    /// Creates a new empty `FunnelQueue`.
    ///
    /// The queue starts with a single valueless stub node that both ends
    /// point at; the stub migrates forward as items are consumed.
    pub fn new() -> Self {
        let stub = Node::<T>::boxed(None);
        Self {
            write: AtomicPtr::new(stub),
            read: UnsafeCell::new(stub),
        }
    }

    /// Pushes an item onto the queue. Never blocks and never fails; safe to
    /// call from any thread.
    pub fn push(&self, value: T) {
        let node = Node::boxed(Some(value));

        // Two-step publish: claim the write end, then link the predecessor.
        // Between the two steps the new node is not yet reachable from the
        // read end, which the consumer reports as empty.
        let prev = self.write.swap(node, AcqRel);

        // `prev` cannot have been freed: the consumer only frees a node after
        // observing its `next`, and we are the only thread that writes it.
        unsafe { (*prev).next.store(node, Release) };
    }

    /// Pops the oldest available item.
    ///
    /// Fails with `NoPendingItems` when the queue is empty or a concurrent
    /// push has not finished publishing yet. Must only ever be called from
    /// the one consumer thread.
    pub fn pop(&self) -> Result<T, TimerError> {
        unsafe {
            let read = *self.read.get();
            let next = (*read).next.load(Acquire);
            if next.is_null() {
                return Err(TimerError::NoPendingItems);
            }

            // Advance past the old stub and free it; `next` becomes the new
            // stub once its value is taken out.
            *self.read.get() = next;
            drop(Box::from_raw(read));

            match (*next).value.take() {
                Some(value) => Ok(value),
                // Every node except the initial stub carries a value, and the
                // stub is never linked behind another node.
                None => Err(TimerError::NoPendingItems),
            }
        }
    }
}

impl<T> Drop for FunnelQueue<T> {
    fn drop(&mut self) {
        // Exclusive access here, so walk the chain from the read end and free
        // every node, stub included. Unconsumed values drop with their nodes.
        unsafe {
            let mut node = *self.read.get();
            while !node.is_null() {
                let next = (*node).next.load(Acquire);
                drop(Box::from_raw(node));
                node = next;
            }
        }
    }
}

// Any thread may push, exactly one thread may pop; the read cursor is only
// ever dereferenced by that consumer.
unsafe impl<T: Send> Send for FunnelQueue<T> {}
unsafe impl<T: Send> Sync for FunnelQueue<T> {}

#[cfg(test)]
mod funnel_tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn sequential_push_pop() {
        let queue = FunnelQueue::<i32>::default();

        // popping an empty queue should complain
        assert_eq!(queue.pop().unwrap_err(), TimerError::NoPendingItems);

        queue.push(42);
        queue.push(1337);
        queue.push(-7);

        // drained oldest-first
        assert_eq!(queue.pop().unwrap(), 42);
        assert_eq!(queue.pop().unwrap(), 1337);
        assert_eq!(queue.pop().unwrap(), -7);

        // and now it's empty again
        assert_eq!(queue.pop().unwrap_err(), TimerError::NoPendingItems);
    }

    #[test]
    fn interleaved_push_pop() {
        let queue = FunnelQueue::<usize>::new();
        for round in 0..100 {
            queue.push(round * 2);
            queue.push(round * 2 + 1);
            assert_eq!(queue.pop().unwrap(), round * 2);
            assert_eq!(queue.pop().unwrap(), round * 2 + 1);
        }
        assert_eq!(queue.pop().unwrap_err(), TimerError::NoPendingItems);
    }

    #[test]
    fn single_producer_fifo_across_threads() {
        const COUNT: usize = 10_000;
        let queue = Arc::new(FunnelQueue::<usize>::new());
        let prod = Arc::clone(&queue);

        let producer = thread::spawn(move || {
            for i in 0..COUNT {
                prod.push(i);
            }
        });

        // single consumer on this thread; order must hold per producer
        let mut expected = 0;
        while expected < COUNT {
            match queue.pop() {
                Ok(v) => {
                    assert_eq!(v, expected);
                    expected += 1;
                }
                Err(TimerError::NoPendingItems) => thread::yield_now(),
                Err(e) => panic!("unexpected pop error: {e:?}"),
            }
        }

        producer.join().unwrap();
        assert_eq!(queue.pop().unwrap_err(), TimerError::NoPendingItems);
    }

    #[test]
    fn drop_frees_queued_values() {
        let marker = Arc::new(());
        let queue = FunnelQueue::new();
        for _ in 0..10 {
            queue.push(Arc::clone(&marker));
        }
        // pop a couple so the stub has migrated before the drop
        queue.pop().unwrap();
        queue.pop().unwrap();

        drop(queue);
        assert_eq!(Arc::strong_count(&marker), 1, "queued values leaked");
    }
}

#[cfg(test)]
mod funnel_stress_tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::{Arc, Barrier};
    use std::thread;

    #[derive(Debug, Clone, PartialEq, Eq, Hash)]
    struct StressPayload {
        id: u64,
        data: Vec<u8>,
        checksum: u64,
    }

    impl StressPayload {
        fn new(id: u64, size: usize) -> Self {
            let data: Vec<u8> = (0..size)
                .map(|i| (id as u8).wrapping_add(i as u8))
                .collect();
            let checksum = data.iter().map(|&b| b as u64).sum::<u64>().wrapping_add(id);
            Self { id, data, checksum }
        }

        fn verify(&self) -> bool {
            let expected = self
                .data
                .iter()
                .map(|&b| b as u64)
                .sum::<u64>()
                .wrapping_add(self.id);
            self.checksum == expected
        }
    }

    /// Many producers hammer one queue while the consumer validates every
    /// payload. The final assertions ensure nothing is lost, duplicated, or
    /// corrupted on the way through.
    #[test]
    fn many_producers_no_loss_no_duplicates() {
        const NUM_PRODUCERS: u64 = 4;
        const MESSAGES_PER_PRODUCER: u64 = 10_000;
        const TOTAL: u64 = NUM_PRODUCERS * MESSAGES_PER_PRODUCER;

        let queue = Arc::new(FunnelQueue::<StressPayload>::new());
        let barrier = Arc::new(Barrier::new(NUM_PRODUCERS as usize));
        let mut producers = vec![];

        for p in 0..NUM_PRODUCERS {
            let prod_queue = Arc::clone(&queue);
            let prod_barrier = Arc::clone(&barrier);
            producers.push(thread::spawn(move || {
                prod_barrier.wait();
                for i in 0..MESSAGES_PER_PRODUCER {
                    let id = p * MESSAGES_PER_PRODUCER + i;
                    prod_queue.push(StressPayload::new(id, 8 + (id % 64) as usize));
                }
            }));
        }

        let mut received = HashSet::new();
        while received.len() < TOTAL as usize {
            match queue.pop() {
                Ok(payload) => {
                    assert!(payload.verify(), "Payload {} corrupted!", payload.id);
                    assert!(received.insert(payload.id), "Duplicate payload received!");
                }
                Err(TimerError::NoPendingItems) => thread::yield_now(),
                Err(e) => panic!("Unexpected consumer error: {:?}", e),
            }
        }

        for producer in producers {
            producer.join().expect("Producer panicked");
        }

        println!("\n=== Funnel Contention Test Results ===");
        println!("Messages sent:     {}", TOTAL);
        println!("Verified receives: {}", received.len());

        assert_eq!(received.len() as u64, TOTAL, "Lost payloads in the funnel!");
        assert_eq!(queue.pop().unwrap_err(), TimerError::NoPendingItems);
    }

    /// Per-producer FIFO must hold even when producers interleave: each
    /// producer tags its items with a sequence number and the consumer checks
    /// the sequence never goes backwards within one producer's stream.
    #[test]
    fn per_producer_order_holds_under_contention() {
        const NUM_PRODUCERS: usize = 3;
        const MESSAGES_PER_PRODUCER: u64 = 5_000;

        let queue = Arc::new(FunnelQueue::<(usize, u64)>::new());
        let barrier = Arc::new(Barrier::new(NUM_PRODUCERS));
        let mut producers = vec![];

        for p in 0..NUM_PRODUCERS {
            let prod_queue = Arc::clone(&queue);
            let prod_barrier = Arc::clone(&barrier);
            producers.push(thread::spawn(move || {
                prod_barrier.wait();
                for seq in 0..MESSAGES_PER_PRODUCER {
                    prod_queue.push((p, seq));
                }
            }));
        }

        let mut next_expected = [0u64; NUM_PRODUCERS];
        let mut total = 0u64;
        while total < NUM_PRODUCERS as u64 * MESSAGES_PER_PRODUCER {
            match queue.pop() {
                Ok((p, seq)) => {
                    assert_eq!(
                        seq, next_expected[p],
                        "Producer {p} stream reordered: expected {}, got {seq}",
                        next_expected[p]
                    );
                    next_expected[p] += 1;
                    total += 1;
                }
                Err(TimerError::NoPendingItems) => thread::yield_now(),
                Err(e) => panic!("Unexpected consumer error: {:?}", e),
            }
        }

        for producer in producers {
            producer.join().expect("Producer panicked");
        }
    }
}
