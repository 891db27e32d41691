//! Pending input for the child
//!
//! Bytes reach the pty from two sources: the consumer's `write` calls and, when
//! a coprocess is attached, the coprocess's output. Each source has its own
//! FIFO lane. Draining alternates between lanes one quantum at a time, so a
//! chatty coprocess cannot starve typed input and vice versa, while bytes
//! within a lane keep their enqueue order.

use std::collections::VecDeque;
use std::io;

/// Source of pending bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lane {
    User,
    Coprocess,
}

impl Lane {
    fn other(self) -> Self {
        match self {
            Lane::User => Lane::Coprocess,
            Lane::Coprocess => Lane::User,
        }
    }
}

/// Two-lane, fixed-quantum round-robin write buffer
#[derive(Debug)]
pub struct WriteQueue {
    user: VecDeque<u8>,
    coprocess: VecDeque<u8>,
    turn: Lane,
    quantum: usize,
    limit: usize,
}

impl WriteQueue {
    /// `quantum` bounds one contiguous write from a lane; `limit` is the
    /// size above which [`WriteQueue::has_room`] reports false.
    pub fn new(quantum: usize, limit: usize) -> Self {
        Self {
            user: VecDeque::new(),
            coprocess: VecDeque::new(),
            turn: Lane::User,
            quantum: quantum.max(1),
            limit,
        }
    }

    pub fn push(&mut self, lane: Lane, data: &[u8]) {
        self.lane_mut(lane).extend(data);
    }

    pub fn len(&self) -> usize {
        self.user.len() + self.coprocess.len()
    }

    pub fn is_empty(&self) -> bool {
        self.user.is_empty() && self.coprocess.is_empty()
    }

    /// Whether more coprocess output should be accepted.
    ///
    /// User writes are never refused; this only throttles reads from the
    /// coprocess while the child is not keeping up.
    pub fn has_room(&self) -> bool {
        self.len() < self.limit
    }

    pub fn clear_lane(&mut self, lane: Lane) {
        self.lane_mut(lane).clear();
    }

    pub fn clear(&mut self) {
        self.user.clear();
        self.coprocess.clear();
    }

    /// The next bytes to hand to the descriptor, at most one quantum from one lane
    pub fn next_chunk(&self) -> Option<(Lane, &[u8])> {
        let lane = if self.lane(self.turn).is_empty() {
            self.turn.other()
        } else {
            self.turn
        };
        let (front, _) = self.lane(lane).as_slices();
        if front.is_empty() {
            return None;
        }
        Some((lane, &front[..front.len().min(self.quantum)]))
    }

    /// Drop `n` delivered bytes from the front of `lane` and pass the turn
    pub fn consume(&mut self, lane: Lane, n: usize) {
        let buf = self.lane_mut(lane);
        let n = n.min(buf.len());
        buf.drain(..n);
        self.turn = lane.other();
    }

    /// Write chunks through `write` until the queue empties or the sink is full
    ///
    /// `WouldBlock` and short writes end the pass with the remainder kept;
    /// `Interrupted` is retried. Any other error is returned.
    pub fn drain_with<F>(&mut self, mut write: F) -> io::Result<usize>
    where
        F: FnMut(&[u8]) -> io::Result<usize>,
    {
        let mut total = 0;
        while let Some((lane, chunk)) = self.next_chunk() {
            let requested = chunk.len();
            match write(chunk) {
                Ok(0) => break,
                Ok(n) => {
                    self.consume(lane, n);
                    total += n;
                    if n < requested {
                        break;
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(e),
            }
        }
        Ok(total)
    }

    fn lane(&self, lane: Lane) -> &VecDeque<u8> {
        match lane {
            Lane::User => &self.user,
            Lane::Coprocess => &self.coprocess,
        }
    }

    fn lane_mut(&mut self, lane: Lane) -> &mut VecDeque<u8> {
        match lane {
            Lane::User => &mut self.user,
            Lane::Coprocess => &mut self.coprocess,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    /// A sink that accepts `capacity` bytes per pass and records which lane
    /// each accepted byte came from
    struct Sink {
        accepted: Vec<u8>,
        capacity: usize,
    }

    impl Sink {
        fn new(capacity: usize) -> Self {
            Self {
                accepted: Vec::new(),
                capacity,
            }
        }

        fn write(&mut self, chunk: &[u8]) -> io::Result<usize> {
            if self.capacity == 0 {
                return Err(io::ErrorKind::WouldBlock.into());
            }
            let n = chunk.len().min(self.capacity);
            self.capacity -= n;
            self.accepted.extend_from_slice(&chunk[..n]);
            Ok(n)
        }
    }

    #[test]
    fn test_user_writes_keep_order() {
        let mut queue = WriteQueue::new(4, 1024);
        queue.push(Lane::User, b"hello ");
        queue.push(Lane::User, b"world");

        let mut sink = Sink::new(usize::MAX);
        let n = queue.drain_with(|c| sink.write(c)).unwrap();
        assert_eq!(n, 11);
        assert_eq!(sink.accepted, b"hello world");
        assert!(queue.is_empty());
    }

    #[test]
    fn test_lanes_alternate_by_quantum() {
        let mut queue = WriteQueue::new(2, 1024);
        queue.push(Lane::User, b"aaaa");
        queue.push(Lane::Coprocess, b"bbbb");

        let mut sink = Sink::new(usize::MAX);
        queue.drain_with(|c| sink.write(c)).unwrap();
        assert_eq!(sink.accepted, b"aabbaabb");
    }

    #[test]
    fn test_partial_write_keeps_remainder() {
        let mut queue = WriteQueue::new(8, 1024);
        queue.push(Lane::User, b"abcdefgh");

        let mut sink = Sink::new(3);
        assert_eq!(queue.drain_with(|c| sink.write(c)).unwrap(), 3);
        assert_eq!(queue.len(), 5);

        sink.capacity = usize::MAX;
        queue.drain_with(|c| sink.write(c)).unwrap();
        assert_eq!(sink.accepted, b"abcdefgh");
    }

    #[test]
    fn test_would_block_ends_pass_without_error() {
        let mut queue = WriteQueue::new(8, 1024);
        queue.push(Lane::User, b"data");
        let mut sink = Sink::new(0);
        assert_eq!(queue.drain_with(|c| sink.write(c)).unwrap(), 0);
        assert_eq!(queue.len(), 4);
    }

    #[test]
    fn test_hard_error_is_returned() {
        let mut queue = WriteQueue::new(8, 1024);
        queue.push(Lane::User, b"data");
        let err = queue
            .drain_with(|_| Err(io::Error::from_raw_os_error(libc::EIO)))
            .unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::EIO));
        assert_eq!(queue.len(), 4);
    }

    #[test]
    fn test_has_room_tracks_limit() {
        let mut queue = WriteQueue::new(8, 4);
        assert!(queue.has_room());
        queue.push(Lane::Coprocess, b"abcd");
        assert!(!queue.has_room());
        queue.clear_lane(Lane::Coprocess);
        assert!(queue.has_room());
    }

    fn split(accepted: &[u8]) -> (Vec<u8>, Vec<u8>) {
        // User bytes are lowercase, coprocess bytes uppercase.
        accepted.iter().partition(|b| b.is_ascii_lowercase())
    }

    proptest! {
        #[test]
        fn prop_each_lane_delivers_in_enqueue_order(
            user in prop::collection::vec(prop::collection::vec(b'a'..=b'z', 0..40), 0..10),
            copro in prop::collection::vec(prop::collection::vec(b'A'..=b'Z', 0..40), 0..10),
            quantum in 1usize..16,
            capacities in prop::collection::vec(0usize..50, 1..20),
        ) {
            let mut queue = WriteQueue::new(quantum, usize::MAX);
            for chunk in &user {
                queue.push(Lane::User, chunk);
            }
            for chunk in &copro {
                queue.push(Lane::Coprocess, chunk);
            }

            let mut sink = Sink::new(0);
            for capacity in capacities.iter().copied().chain(std::iter::once(usize::MAX)) {
                sink.capacity = capacity;
                queue.drain_with(|c| sink.write(c)).unwrap();
            }

            let (got_user, got_copro) = split(&sink.accepted);
            prop_assert_eq!(got_user, user.concat());
            prop_assert_eq!(got_copro, copro.concat());
            prop_assert!(queue.is_empty());
        }

        #[test]
        fn prop_neither_lane_waits_more_than_one_quantum(
            user_len in 1usize..200,
            copro_len in 1usize..200,
            quantum in 1usize..16,
        ) {
            let mut queue = WriteQueue::new(quantum, usize::MAX);
            queue.push(Lane::User, &vec![b'u'; user_len]);
            queue.push(Lane::Coprocess, &vec![b'C'; copro_len]);

            let mut sink = Sink::new(usize::MAX);
            queue.drain_with(|c| sink.write(c)).unwrap();

            // Until the shorter lane empties, no run from one lane exceeds a quantum.
            let shorter = if user_len <= copro_len { b'u' } else { b'C' };
            let both_busy = sink
                .accepted
                .iter()
                .rposition(|&b| b == shorter)
                .map_or(0, |i| i + 1);
            let mut run = 0;
            let mut last = None;
            for &b in sink.accepted.iter().take(both_busy) {
                if Some(b) == last {
                    run += 1;
                } else {
                    run = 1;
                    last = Some(b);
                }
                prop_assert!(run <= quantum);
            }
        }
    }
}
