//! One downstream client connection (§3 "Client Session", §4.2).
//!
//! A session owns its bounded outbound queue directly rather than handing
//! the receiving half to a channel consumer elsewhere — `add_data` (the
//! producer side, called from [`crate::engine::Engine::broadcast`]) and
//! `next_chunk` (the consumer side, called from the session's own write
//! loop) both need to observe and mutate the same queue length, which is
//! exactly the `Client.add_data` / `Client.flush` pairing in
//! `examples/original_source/rtl_mus.py`.

use std::collections::VecDeque;
use std::net::IpAddr;
use std::sync::Mutex as StdMutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use tokio::sync::Notify;

use crate::config::CacheFullBehaviour;
use crate::engine::{Chunk, OUTBOUND_QUEUE_CAPACITY};

/// A live downstream connection's identity and outbound buffer.
pub struct Session {
    pub ident: u64,
    pub address: IpAddr,
    pub port: u16,
    pub admitted_at: Instant,

    outbound: StdMutex<VecDeque<Chunk>>,
    outbound_ready: Notify,
    closing: AtomicBool,
}

impl Session {
    #[must_use]
    pub fn new(ident: u64, address: IpAddr, port: u16) -> Self {
        Self {
            ident,
            address,
            port,
            admitted_at: Instant::now(),
            outbound: StdMutex::new(VecDeque::with_capacity(OUTBOUND_QUEUE_CAPACITY)),
            outbound_ready: Notify::new(),
            closing: AtomicBool::new(false),
        }
    }

    /// §4.2 "Outbound enqueue": applies `cache_full_behaviour` when the
    /// queue is already at [`OUTBOUND_QUEUE_CAPACITY`]. Returns `true` when
    /// the session should now be dropped (`DROP_CLIENT`), in which case the
    /// queue was left untouched — the caller tears the connection down
    /// instead.
    pub fn add_data(&self, data: Chunk, behaviour: CacheFullBehaviour) -> bool {
        let mut queue = self.outbound.lock().unwrap_or_else(|e| e.into_inner());
        if queue.len() < OUTBOUND_QUEUE_CAPACITY {
            queue.push_back(data);
            drop(queue);
            self.outbound_ready.notify_one();
            return false;
        }

        match behaviour {
            CacheFullBehaviour::DropSamples => {
                // Matches `Client.add_data` in the original: the clearing
                // branch empties the queue and does not enqueue the buffer
                // that triggered it, leaving the queue empty afterward.
                tracing::error!(ident = self.ident, "client cache full, emptying queue");
                queue.clear();
                false
            }
            CacheFullBehaviour::DropClient => {
                tracing::error!(ident = self.ident, "client cache full, dropping client");
                true
            }
            CacheFullBehaviour::Ignore => {
                // Drop the single new buffer, keep the rest of the queue.
                false
            }
        }
    }

    /// Pops the next outbound chunk, waiting if the queue is empty. Returns
    /// `None` once the session has been marked closing and the queue has
    /// drained.
    pub async fn next_chunk(&self) -> Option<Chunk> {
        loop {
            {
                let mut queue = self.outbound.lock().unwrap_or_else(|e| e.into_inner());
                if let Some(chunk) = queue.pop_front() {
                    return Some(chunk);
                }
                if self.closing.load(Ordering::Acquire) {
                    return None;
                }
            }
            self.outbound_ready.notified().await;
        }
    }

    /// Signals the write loop to exit once the outbound queue is empty, and
    /// wakes it immediately in case it is already parked waiting on data.
    pub fn mark_closing(&self) {
        self.closing.store(true, Ordering::Release);
        self.outbound_ready.notify_one();
    }

    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(byte: u8) -> Chunk {
        Chunk::from(vec![byte; 4])
    }

    #[test]
    fn enqueue_then_dequeue_preserves_order() {
        let session = Session::new(0, IpAddr::from([127, 0, 0, 1]), 9999);
        assert!(!session.add_data(chunk(1), CacheFullBehaviour::DropSamples));
        assert!(!session.add_data(chunk(2), CacheFullBehaviour::DropSamples));

        let queue = session.outbound.lock().unwrap();
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.front().unwrap()[0], 1);
    }

    #[test]
    fn drop_samples_empties_the_queue_and_drops_the_triggering_buffer() {
        let session = Session::new(0, IpAddr::from([127, 0, 0, 1]), 9999);
        for i in 0..OUTBOUND_QUEUE_CAPACITY {
            assert!(!session.add_data(chunk(i as u8), CacheFullBehaviour::DropSamples));
        }
        let dropped = session.add_data(chunk(200), CacheFullBehaviour::DropSamples);
        assert!(!dropped);

        let queue = session.outbound.lock().unwrap();
        assert!(queue.is_empty());
    }

    #[test]
    fn drop_client_reports_true_without_mutating_the_queue() {
        let session = Session::new(0, IpAddr::from([127, 0, 0, 1]), 9999);
        for i in 0..OUTBOUND_QUEUE_CAPACITY {
            assert!(!session.add_data(chunk(i as u8), CacheFullBehaviour::DropClient));
        }
        let dropped = session.add_data(chunk(200), CacheFullBehaviour::DropClient);
        assert!(dropped);
        assert_eq!(session.outbound.lock().unwrap().len(), OUTBOUND_QUEUE_CAPACITY);
    }

    #[test]
    fn ignore_drops_only_the_new_buffer() {
        let session = Session::new(0, IpAddr::from([127, 0, 0, 1]), 9999);
        for i in 0..OUTBOUND_QUEUE_CAPACITY {
            assert!(!session.add_data(chunk(i as u8), CacheFullBehaviour::Ignore));
        }
        let dropped = session.add_data(chunk(200), CacheFullBehaviour::Ignore);
        assert!(!dropped);
        let queue = session.outbound.lock().unwrap();
        assert_eq!(queue.len(), OUTBOUND_QUEUE_CAPACITY);
        assert_eq!(queue.back().unwrap()[0], (OUTBOUND_QUEUE_CAPACITY - 1) as u8);
    }

    #[tokio::test]
    async fn next_chunk_waits_then_returns_none_after_closing_drains() {
        let session = Session::new(0, IpAddr::from([127, 0, 0, 1]), 9999);
        session.add_data(chunk(9), CacheFullBehaviour::DropSamples);
        assert_eq!(session.next_chunk().await.unwrap()[0], 9);

        session.mark_closing();
        assert!(session.next_chunk().await.is_none());
    }
}
