//! Subscriber-set pooling and simulation thread ownership

use std::thread::{self, ThreadId};

use crate::net::transport::Recipients;

/// Upper bound on idle sets kept around between marker lifetimes
const MAX_POOLED_SETS: usize = 256;

/// Recycles the subscriber sets of retired markers so that marker churn does
/// not keep reallocating hash tables.
#[derive(Debug, Default)]
pub(crate) struct SubscriberPool {
    free: Vec<Recipients>,
    /// Sets handed back off the simulation thread, reclaimed on the next tick
    deferred: Vec<Recipients>,
}

impl SubscriberPool {
    pub(crate) fn acquire(&mut self) -> Recipients {
        self.free.pop().unwrap_or_default()
    }

    pub(crate) fn release(&mut self, mut set: Recipients) {
        set.clear();
        if self.free.len() < MAX_POOLED_SETS && set.capacity() > 0 {
            self.free.push(set);
        }
    }

    /// Park a set until the owning thread can reclaim it
    pub(crate) fn defer(&mut self, set: Recipients) {
        if set.capacity() > 0 {
            self.deferred.push(set);
        }
    }

    /// Move every deferred set into the free list. Returns how many were
    /// reclaimed.
    pub(crate) fn reclaim_deferred(&mut self) -> usize {
        let deferred = std::mem::take(&mut self.deferred);
        let count = deferred.len();
        for set in deferred {
            self.release(set);
        }
        count
    }

    pub(crate) fn idle(&self) -> usize {
        self.free.len()
    }

    pub(crate) fn deferred(&self) -> usize {
        self.deferred.len()
    }
}

/// Records which thread runs the simulation.
///
/// Registry state has a single owner; pooled resources are only recycled on
/// that thread. Returns from any other thread are deferred to the next tick.
#[derive(Debug, Clone, Copy)]
pub struct SimThread {
    owner: ThreadId,
}

impl SimThread {
    /// Bind to the calling thread
    pub fn current() -> Self {
        Self {
            owner: thread::current().id(),
        }
    }

    /// Move ownership to the calling thread (used when the simulation loop
    /// starts on its own thread)
    pub fn rebind(&mut self) {
        self.owner = thread::current().id();
    }

    pub fn is_current(&self) -> bool {
        thread::current().id() == self.owner
    }
}
