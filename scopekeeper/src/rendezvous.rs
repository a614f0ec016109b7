//! The long-poll bridge between host events and client polls.
//!
//! Two FIFOs: messages nobody has asked for yet, and clients waiting for a message.  Every
//! operation keeps at most one of them non-empty, so an arriving message either satisfies the
//! oldest waiter or is queued, and an arriving poll either takes the oldest message or waits.

use std::collections::VecDeque;
use std::time::Instant;

#[derive(Debug)]
pub struct Rendezvous<M, W> {
    pending: VecDeque<M>,
    waiting: VecDeque<(W, Instant)>,
    capacity: usize,
    dropped: u64,
}

impl<M, W: PartialEq> Rendezvous<M, W> {
    /// `capacity` bounds the pending queue; when full the oldest message is dropped.
    pub fn new(capacity: usize) -> Self {
        Rendezvous {
            pending: VecDeque::new(),
            waiting: VecDeque::new(),
            capacity: capacity.max(1),
            dropped: 0,
        }
    }

    /// A message arrived from the host.  Returns the waiter it should go to, if any.
    pub fn on_host_event(&mut self, message: M) -> Option<(W, M)> {
        if let Some((waiter, _)) = self.waiting.pop_front() {
            return Some((waiter, message));
        }
        if self.pending.len() >= self.capacity {
            self.pending.pop_front();
            self.dropped += 1;
            logwise::warn_sync!(
                "pending queue full ({capacity}), dropped the oldest message ({dropped} so far)",
                capacity = logwise::privacy::LogIt(&self.capacity),
                dropped = logwise::privacy::LogIt(&self.dropped)
            );
        }
        self.pending.push_back(message);
        None
    }

    /// A client asked for a message.  Returns one immediately if any is queued, otherwise
    /// parks `waiter` until `deadline`.
    pub fn on_client_poll(&mut self, waiter: W, deadline: Instant) -> Option<M> {
        if let Some(message) = self.pending.pop_front() {
            return Some(message);
        }
        self.waiting.push_back((waiter, deadline));
        None
    }

    /// Puts back a message whose waiter vanished before it could be answered.
    ///
    /// The message keeps its place at the head of the line: it goes to the next waiter, or to the
    /// front of the pending queue.
    pub fn requeue_front(&mut self, message: M) -> Option<(W, M)> {
        if let Some((waiter, _)) = self.waiting.pop_front() {
            return Some((waiter, message));
        }
        self.pending.push_front(message);
        if self.pending.len() > self.capacity {
            self.pending.pop_back();
            self.dropped += 1;
        }
        None
    }

    /// Removes and returns every waiter whose deadline is at or before `now`, oldest first.
    pub fn expire(&mut self, now: Instant) -> Vec<W> {
        let mut expired = Vec::new();
        let mut kept = VecDeque::with_capacity(self.waiting.len());
        for (waiter, deadline) in self.waiting.drain(..) {
            if deadline <= now {
                expired.push(waiter);
            } else {
                kept.push_back((waiter, deadline));
            }
        }
        self.waiting = kept;
        expired
    }

    /// Forgets a waiter that disconnected.  Returns whether it was waiting.
    pub fn remove_waiter(&mut self, waiter: &W) -> bool {
        let before = self.waiting.len();
        self.waiting.retain(|(w, _)| w != waiter);
        before != self.waiting.len()
    }

    pub fn is_waiting(&self, waiter: &W) -> bool {
        self.waiting.iter().any(|(w, _)| w == waiter)
    }

    /// Discards every pending message.  Returns how many there were.
    pub fn flush_pending(&mut self) -> usize {
        let n = self.pending.len();
        self.pending.clear();
        n
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn waiting_len(&self) -> usize {
        self.waiting.len()
    }

    /// Total messages lost to the capacity bound.
    #[cfg(test)]
    fn dropped(&self) -> u64 {
        self.dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn later(secs: u64) -> Instant {
        Instant::now() + Duration::from_secs(secs)
    }

    #[test]
    fn event_waits_for_poll() {
        let mut r: Rendezvous<&str, u32> = Rendezvous::new(10);
        assert_eq!(r.on_host_event("a"), None);
        assert_eq!(r.pending_len(), 1);
        assert_eq!(r.on_client_poll(1, later(30)), Some("a"));
        assert_eq!(r.pending_len(), 0);
        assert_eq!(r.waiting_len(), 0);
    }

    #[test]
    fn poll_waits_for_event() {
        let mut r: Rendezvous<&str, u32> = Rendezvous::new(10);
        assert_eq!(r.on_client_poll(7, later(30)), None);
        assert!(r.is_waiting(&7));
        assert_eq!(r.on_host_event("a"), Some((7, "a")));
        assert!(!r.is_waiting(&7));
    }

    #[test]
    fn fifo_both_ways() {
        let mut r: Rendezvous<u32, u32> = Rendezvous::new(10);
        for w in 1..=3 {
            r.on_client_poll(w, later(30));
        }
        let delivered: Vec<_> = (10..13).map(|m| r.on_host_event(m).unwrap()).collect();
        assert_eq!(delivered, vec![(1, 10), (2, 11), (3, 12)]);

        for m in 20..23 {
            r.on_host_event(m);
        }
        let got: Vec<_> = (1..=3)
            .map(|w| r.on_client_poll(w, later(30)).unwrap())
            .collect();
        assert_eq!(got, vec![20, 21, 22]);
    }

    #[test]
    fn never_both_non_empty() {
        let mut r: Rendezvous<u64, u64> = Rendezvous::new(1000);
        // small LCG for a reproducible interleaving
        let mut seed: u64 = 0x2545_f491;
        for i in 0..5000u64 {
            seed = seed.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            match (seed >> 33) % 4 {
                0 | 1 => {
                    r.on_host_event(i);
                }
                2 => {
                    r.on_client_poll(i, later(30));
                }
                _ => {
                    r.remove_waiter(&i.saturating_sub(1));
                }
            }
            assert!(r.pending_len() == 0 || r.waiting_len() == 0, "step {i}");
        }
    }

    #[test]
    fn expiry_is_deterministic() {
        let mut r: Rendezvous<&str, u32> = Rendezvous::new(10);
        let now = Instant::now();
        r.on_client_poll(1, now + Duration::from_secs(5));
        r.on_client_poll(2, now + Duration::from_secs(1));
        r.on_client_poll(3, now + Duration::from_secs(9));
        assert!(r.expire(now).is_empty());
        assert_eq!(r.expire(now + Duration::from_secs(5)), vec![1, 2]);
        assert!(!r.is_waiting(&1));
        assert!(!r.is_waiting(&2));
        assert_eq!(r.on_host_event("x"), Some((3, "x")));
    }

    #[test]
    fn disconnect_removes_silently() {
        let mut r: Rendezvous<&str, u32> = Rendezvous::new(10);
        r.on_client_poll(1, later(30));
        assert!(r.remove_waiter(&1));
        assert!(!r.remove_waiter(&1));
        assert_eq!(r.on_host_event("a"), None);
        assert_eq!(r.pending_len(), 1);
    }

    #[test]
    fn overflow_drops_oldest() {
        let mut r: Rendezvous<u32, u32> = Rendezvous::new(3);
        for m in 0..5 {
            r.on_host_event(m);
        }
        assert_eq!(r.pending_len(), 3);
        assert_eq!(r.dropped(), 2);
        assert_eq!(r.on_client_poll(1, later(30)), Some(2));
    }

    #[test]
    fn requeue_keeps_order() {
        let mut r: Rendezvous<u32, u32> = Rendezvous::new(10);
        r.on_host_event(2);
        assert_eq!(r.requeue_front(1), None);
        assert_eq!(r.on_client_poll(9, later(30)), Some(1));
        assert_eq!(r.on_client_poll(9, later(30)), Some(2));

        r.on_client_poll(5, later(30));
        assert_eq!(r.requeue_front(3), Some((5, 3)));
        assert_eq!(r.flush_pending(), 0);
    }
}
