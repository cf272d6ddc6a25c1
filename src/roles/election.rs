use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha20Rng;
use std::collections::HashSet;
use std::time::{Duration, Instant};

/// Produces randomized election timeouts inside the configured window.
/// Seeded, so a replica's timeout sequence is reproducible under test.
#[derive(Debug)]
pub struct ElectionSchedule {
    rng: ChaCha20Rng,
    window: (Duration, Duration),
}

impl ElectionSchedule {
    pub fn new(window: (Duration, Duration), seed: u64) -> Self {
        assert!(window.1 >= window.0);
        Self {
            rng: ChaCha20Rng::seed_from_u64(seed),
            window,
        }
    }

    pub fn next_timeout(&mut self) -> Duration {
        let (min, max) = self.window;
        if max == min {
            return min;
        }
        let spread = (max - min).as_millis() as u64;
        min + Duration::from_millis(self.rng.gen_range(0..=spread))
    }
}

#[derive(Debug, Clone)]
pub struct ElectionTimer {
    timeout: Duration,
    deadline: Instant,
}

impl ElectionTimer {
    pub fn new(now: Instant, timeout: Duration) -> Self {
        Self {
            timeout,
            deadline: now + timeout,
        }
    }

    pub fn reset(&mut self, now: Instant, timeout: Duration) {
        self.timeout = timeout;
        self.deadline = now + timeout;
    }

    pub fn expired(&self, now: Instant) -> bool {
        now >= self.deadline
    }

    pub fn remaining(&self, now: Instant) -> Duration {
        self.deadline.saturating_duration_since(now)
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }
}

/// Grant/reject bookkeeping for one candidacy. A voter flipping its answer
/// moves between the sets; it is never counted twice.
#[derive(Debug)]
pub struct CandidateTally {
    term: u64,
    granted: HashSet<String>,
    rejected: HashSet<String>,
}

impl CandidateTally {
    pub fn new(term: u64) -> Self {
        Self {
            term,
            granted: HashSet::new(),
            rejected: HashSet::new(),
        }
    }

    pub fn term(&self) -> u64 {
        self.term
    }

    pub fn record(&mut self, voter: String, granted: bool) {
        if granted {
            self.rejected.remove(&voter);
            self.granted.insert(voter);
        } else {
            self.granted.remove(&voter);
            self.rejected.insert(voter);
        }
    }

    pub fn granted(&self) -> usize {
        self.granted.len()
    }

    pub fn rejected(&self) -> usize {
        self.rejected.len()
    }

    pub fn reached(&self, quorum: usize) -> bool {
        self.granted.len() >= quorum
    }
}
