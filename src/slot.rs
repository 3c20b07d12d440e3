//! Wait slots and the scratch-buffer pool.
//!
//! Both tables are plain data guarded by the service's locks; nothing
//! in here blocks or signals. The wait table tracks in-flight calls by
//! transaction id, and the scratch pool recycles the buffers the
//! dispatch thread copies inbound commands into.

use crate::message::MAX_PAYLOAD_SIZE;

/// Most calls that may wait for a response at once, per side.
pub const MAX_WAITING: usize = 8;

/// Scratch buffers in the pool. One more than [`MAX_WAITING`] so the
/// dispatch thread can always stage one inbound command even when every
/// blocked caller is reentrantly executing one.
pub const SCRATCH_POOL_SIZE: usize = MAX_WAITING + 1;

/// Why a waiting caller was woken.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallOutcome {
    /// The matching response arrived; the slot holds its payload.
    Response,
    /// The context is shutting down; no response will come.
    Shutdown,
}

/// One in-flight call.
#[derive(Debug)]
pub struct WaitSlot {
    pub xid: u32,
    pub in_use: bool,
    pub outcome: Option<CallOutcome>,
    pub resp: Vec<u8>,
}

/// Fixed table of [`MAX_WAITING`] wait slots plus the xid counter.
///
/// Claiming a slot and assigning its xid happen under one lock
/// acquisition in the service, so a recycled slot can never match a
/// stale response: a claimed slot carries xid 0 until assignment, and
/// xid 0 is never allocated.
#[derive(Debug)]
pub struct WaitTable {
    slots: Vec<WaitSlot>,
    next_xid: u32,
}

impl WaitTable {
    pub fn new() -> Self {
        let slots = (0..MAX_WAITING)
            .map(|_| WaitSlot {
                xid: 0,
                in_use: false,
                outcome: None,
                resp: Vec::new(),
            })
            .collect();
        Self { slots, next_xid: 1 }
    }

    /// Allocate the next transaction id, skipping the reserved 0.
    pub fn alloc_xid(&mut self) -> u32 {
        let xid = self.next_xid;
        self.next_xid = match self.next_xid.wrapping_add(1) {
            0 => 1,
            n => n,
        };
        xid
    }

    /// Claim a free slot, resetting it for a new call.
    pub fn claim(&mut self) -> Option<usize> {
        let idx = self.slots.iter().position(|s| !s.in_use)?;
        let slot = &mut self.slots[idx];
        slot.in_use = true;
        slot.xid = 0;
        slot.outcome = None;
        slot.resp.clear();
        Some(idx)
    }

    /// Return a slot to the free set.
    pub fn release(&mut self, idx: usize) {
        self.slots[idx].in_use = false;
    }

    /// Find the in-use slot waiting on `xid`.
    pub fn find_by_xid(&self, xid: u32) -> Option<usize> {
        self.slots
            .iter()
            .position(|s| s.in_use && s.xid == xid)
    }

    /// Mark every still-waiting call as shut down, returning the slots
    /// whose waiters need waking.
    pub fn force_wake(&mut self) -> Vec<usize> {
        let mut woken = Vec::new();
        for (idx, slot) in self.slots.iter_mut().enumerate() {
            if slot.in_use && slot.outcome.is_none() {
                slot.outcome = Some(CallOutcome::Shutdown);
                woken.push(idx);
            }
        }
        woken
    }

    pub fn slot(&self, idx: usize) -> &WaitSlot {
        &self.slots[idx]
    }

    pub fn slot_mut(&mut self, idx: usize) -> &mut WaitSlot {
        &mut self.slots[idx]
    }

    /// Number of calls currently holding a slot.
    pub fn in_use(&self) -> usize {
        self.slots.iter().filter(|s| s.in_use).count()
    }
}

/// Free-list pool of scratch buffers for inbound command payloads.
#[derive(Debug)]
pub struct ScratchPool {
    free: Vec<Vec<u8>>,
}

impl ScratchPool {
    pub fn new() -> Self {
        let free = (0..SCRATCH_POOL_SIZE)
            .map(|_| Vec::with_capacity(MAX_PAYLOAD_SIZE))
            .collect();
        Self { free }
    }

    pub fn take(&mut self) -> Option<Vec<u8>> {
        self.free.pop()
    }

    pub fn give(&mut self, mut buf: Vec<u8>) {
        buf.clear();
        self.free.push(buf);
    }

    pub fn free_count(&self) -> usize {
        self.free.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_claim_until_exhausted() {
        let mut table = WaitTable::new();
        let mut claimed = Vec::new();
        for _ in 0..MAX_WAITING {
            claimed.push(table.claim().unwrap());
        }
        assert_eq!(table.claim(), None);
        assert_eq!(table.in_use(), MAX_WAITING);
        table.release(claimed[3]);
        assert_eq!(table.claim(), Some(claimed[3]));
    }

    #[test]
    fn test_find_by_xid() {
        let mut table = WaitTable::new();
        let idx = table.claim().unwrap();
        let xid = table.alloc_xid();
        table.slot_mut(idx).xid = xid;
        assert_eq!(table.find_by_xid(xid), Some(idx));
        assert_eq!(table.find_by_xid(xid + 1), None);
        table.release(idx);
        assert_eq!(table.find_by_xid(xid), None);
    }

    #[test]
    fn test_xid_never_zero() {
        let mut table = WaitTable::new();
        table.next_xid = u32::MAX;
        assert_eq!(table.alloc_xid(), u32::MAX);
        assert_eq!(table.alloc_xid(), 1);
    }

    #[test]
    fn test_force_wake_marks_pending_only() {
        let mut table = WaitTable::new();
        let a = table.claim().unwrap();
        let b = table.claim().unwrap();
        table.slot_mut(a).outcome = Some(CallOutcome::Response);
        let woken = table.force_wake();
        assert_eq!(woken, vec![b]);
        assert_eq!(table.slot(a).outcome, Some(CallOutcome::Response));
        assert_eq!(table.slot(b).outcome, Some(CallOutcome::Shutdown));
    }

    #[test]
    fn test_scratch_pool_counts() {
        let mut pool = ScratchPool::new();
        assert_eq!(pool.free_count(), SCRATCH_POOL_SIZE);
        let mut bufs = Vec::new();
        for _ in 0..SCRATCH_POOL_SIZE {
            bufs.push(pool.take().unwrap());
        }
        assert!(pool.take().is_none());
        let mut buf = bufs.pop().unwrap();
        buf.extend_from_slice(b"leftover");
        pool.give(buf);
        assert_eq!(pool.free_count(), 1);
        let buf = pool.take().unwrap();
        assert!(buf.is_empty());
        assert!(buf.capacity() >= MAX_PAYLOAD_SIZE);
    }
}
