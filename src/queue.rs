//! Lock-free multi-producer single-consumer queue of outbound packets.
//!
//! Vyukov-style intrusive MPSC: the link node lives inside [`Pkt`], so an
//! enqueue is two atomic stores and never allocates. Enqueue is wait-free;
//! dequeue is non-blocking and may transiently report empty while a
//! producer is mid-push, which the send worker absorbs by polling again.
//! FIFO order holds per producer; no global order across producers.
//!
//! Ownership transfers through the queue: the producer gives up its
//! `Box<Pkt>` on push and the consumer re-materialises it on pop.

use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};
use std::sync::Arc;

use crate::pkt::Pkt;

/// Intrusive queue hook embedded in every [`Pkt`].
#[derive(Debug)]
pub struct QueueLink {
    next: AtomicPtr<Pkt>,
}

impl QueueLink {
    pub(crate) fn new() -> Self {
        Self {
            next: AtomicPtr::new(ptr::null_mut()),
        }
    }
}

struct Inner {
    /// Producers swap themselves in here.
    head: AtomicPtr<Pkt>,
    /// Permanent stub node; the consumer parks on it when the queue drains.
    stub: *mut Pkt,
}

// SAFETY: `head` is atomic and `stub` is only dereferenced under the
// single-consumer/producer protocols documented on push/pop.
unsafe impl Send for Inner {}
unsafe impl Sync for Inner {}

impl Drop for Inner {
    fn drop(&mut self) {
        // The consumer drained all real nodes in its own Drop; only the
        // stub allocation remains.
        unsafe { drop(Box::from_raw(self.stub)) };
    }
}

/// Producer handle. Clone one per producing thread.
#[derive(Clone)]
pub struct Producer {
    inner: Arc<Inner>,
}

/// Consumer handle; exactly one exists per queue.
pub struct Consumer {
    inner: Arc<Inner>,
    tail: *mut Pkt,
}

// SAFETY: the raw `tail` pointer is owned exclusively by this handle and
// the handle is not Sync, so moving it to the consumer thread is sound.
unsafe impl Send for Consumer {}

/// Create an empty queue.
pub fn pkt_queue() -> (Producer, Consumer) {
    let stub = Box::into_raw(Box::new(Pkt::stub()));
    let inner = Arc::new(Inner {
        head: AtomicPtr::new(stub),
        stub,
    });
    (
        Producer {
            inner: inner.clone(),
        },
        Consumer { inner, tail: stub },
    )
}

fn push_node(inner: &Inner, node: *mut Pkt) {
    // SAFETY: `node` is a live allocation owned by this call until the
    // final store publishes it to the consumer.
    unsafe { (*node).link.next.store(ptr::null_mut(), Ordering::Relaxed) };
    let prev = inner.head.swap(node, Ordering::AcqRel);
    // Between the swap and this store the chain is briefly broken; pop
    // observes that as a transient empty.
    // SAFETY: `prev` is either the stub or a node not yet handed to the
    // consumer (its `next` is still null), so it is valid to link through.
    unsafe { (*prev).link.next.store(node, Ordering::Release) };
}

impl Producer {
    /// Wait-free enqueue. The packet's embedded link is the queue node.
    pub fn push(&self, pkt: Box<Pkt>) {
        push_node(&self.inner, Box::into_raw(pkt));
    }
}

impl Consumer {
    /// Non-blocking dequeue; `None` when empty (or while a producer is
    /// mid-push, which resolves on the next call).
    pub fn pop(&mut self) -> Option<Box<Pkt>> {
        unsafe {
            let mut tail = self.tail;
            let mut next = (*tail).link.next.load(Ordering::Acquire);

            if tail == self.inner.stub {
                if next.is_null() {
                    return None;
                }
                // Skip past the stub to the first real node.
                self.tail = next;
                tail = next;
                next = (*tail).link.next.load(Ordering::Acquire);
            }

            if !next.is_null() {
                self.tail = next;
                return Some(Box::from_raw(tail));
            }

            let head = self.inner.head.load(Ordering::Acquire);
            if tail != head {
                // A producer swapped head but has not linked yet.
                return None;
            }

            // `tail` is the last node: re-insert the stub behind it so the
            // tail node can be released.
            push_node(&self.inner, self.inner.stub);
            next = (*tail).link.next.load(Ordering::Acquire);
            if !next.is_null() {
                self.tail = next;
                return Some(Box::from_raw(tail));
            }
            None
        }
    }
}

impl Drop for Consumer {
    fn drop(&mut self) {
        // Teardown runs after producers have quiesced, so pop drains
        // every remaining node.
        while self.pop().is_some() {}
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pkt::Layer;

    fn tagged(producer: u16, seq: u32) -> Box<Pkt> {
        let mut bytes = producer.to_be_bytes().to_vec();
        bytes.extend_from_slice(&seq.to_be_bytes());
        Box::new(Pkt::from_layers(vec![Layer::Raw(bytes)]))
    }

    fn read_tag(pkt: &Pkt) -> (u16, u32) {
        let raw = pkt.raw().unwrap();
        (
            u16::from_be_bytes([raw[0], raw[1]]),
            u32::from_be_bytes([raw[2], raw[3], raw[4], raw[5]]),
        )
    }

    #[test]
    fn test_empty_pop_returns_none() {
        let (_tx, mut rx) = pkt_queue();
        assert!(rx.pop().is_none());
        assert!(rx.pop().is_none(), "repeated pops on empty stay empty");
    }

    #[test]
    fn test_single_thread_fifo() {
        let (tx, mut rx) = pkt_queue();
        for seq in 0..100u32 {
            tx.push(tagged(0, seq));
        }
        for seq in 0..100u32 {
            let pkt = rx.pop().expect("queue must hold 100 packets");
            assert_eq!(read_tag(&pkt), (0, seq), "FIFO order violated");
        }
        assert!(rx.pop().is_none());
    }

    #[test]
    fn test_interleaved_push_pop() {
        let (tx, mut rx) = pkt_queue();
        tx.push(tagged(0, 0));
        assert_eq!(read_tag(&rx.pop().unwrap()), (0, 0));
        assert!(rx.pop().is_none());
        tx.push(tagged(0, 1));
        tx.push(tagged(0, 2));
        assert_eq!(read_tag(&rx.pop().unwrap()), (0, 1));
        tx.push(tagged(0, 3));
        assert_eq!(read_tag(&rx.pop().unwrap()), (0, 2));
        assert_eq!(read_tag(&rx.pop().unwrap()), (0, 3));
        assert!(rx.pop().is_none());
    }

    #[test]
    fn test_probe_flag_survives_transfer() {
        let (tx, mut rx) = pkt_queue();
        let mut pkt = tagged(0, 7);
        pkt.probe = true;
        tx.push(pkt);
        assert!(rx.pop().unwrap().probe);
    }

    #[test]
    fn test_multi_producer_loses_nothing_keeps_per_producer_fifo() {
        // N producers x M inserts: no loss, per-producer
        // FIFO.
        const PRODUCERS: u16 = 4;
        const PER_PRODUCER: u32 = 1000;

        let (tx, mut rx) = pkt_queue();
        let mut handles = Vec::new();
        for p in 0..PRODUCERS {
            let tx = tx.clone();
            handles.push(std::thread::spawn(move || {
                for seq in 0..PER_PRODUCER {
                    tx.push(tagged(p, seq));
                }
            }));
        }

        let mut next_expected = [0u32; PRODUCERS as usize];
        let mut received = 0u32;
        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(10);
        while received < u32::from(PRODUCERS) * PER_PRODUCER {
            match rx.pop() {
                Some(pkt) => {
                    let (p, seq) = read_tag(&pkt);
                    assert_eq!(
                        seq, next_expected[p as usize],
                        "per-producer FIFO violated for producer {p}"
                    );
                    next_expected[p as usize] += 1;
                    received += 1;
                }
                None => {
                    assert!(std::time::Instant::now() < deadline, "queue lost packets");
                    std::hint::spin_loop();
                }
            }
        }
        for h in handles {
            h.join().unwrap();
        }
        assert!(rx.pop().is_none());
    }

    #[test]
    fn test_consumer_drop_frees_pending() {
        // Dropping a non-empty queue must not leak or double-free; run
        // under the normal test harness this exercises the Drop chain.
        let (tx, rx) = pkt_queue();
        for seq in 0..32u32 {
            tx.push(tagged(0, seq));
        }
        drop(rx);
        drop(tx);
    }
}
