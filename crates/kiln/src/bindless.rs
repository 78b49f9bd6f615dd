use std::{
    cmp::Reverse,
    collections::BinaryHeap,
    sync::{
        Mutex, PoisonError,
        atomic::{AtomicU32, Ordering},
    },
};

use crossbeam_channel::{Receiver, Sender};

///Allocator for indices into one bindless descriptor array.
///
/// Freed indices are recycled before the high-water mark grows, smallest index first. Freeing never blocks, it only
/// pushes to a lock-free queue. Allocation collects that queue into an ordered free list.
pub struct BindlessAllocator {
    free_tx: Sender<u32>,
    free_rx: Receiver<u32>,
    recycled: Mutex<BinaryHeap<Reverse<u32>>>,
    //biggest index that was handed out until now, +1
    head: AtomicU32,
    max: u32,
}

impl BindlessAllocator {
    pub fn new(max: u32) -> Self {
        let (free_tx, free_rx) = crossbeam_channel::unbounded();
        BindlessAllocator {
            free_tx,
            free_rx,
            recycled: Mutex::new(BinaryHeap::new()),
            head: AtomicU32::new(0),
            max,
        }
    }

    ///Returns the smallest free index, or `None` if all `max` indices are in use.
    pub fn allocate(&self) -> Option<u32> {
        {
            let mut recycled = self.recycled.lock().unwrap_or_else(PoisonError::into_inner);
            recycled.extend(self.free_rx.try_iter().map(Reverse));
            if let Some(Reverse(index)) = recycled.pop() {
                #[cfg(feature = "logging")]
                log::trace!("Reusing bindless index {}", index);
                return Some(index);
            }
        }

        let mut head = self.head.load(Ordering::Relaxed);
        loop {
            if head >= self.max {
                #[cfg(feature = "logging")]
                log::error!("Reached max bindless index {}", self.max);
                return None;
            }
            match self.head.compare_exchange_weak(
                head,
                head + 1,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => {
                    #[cfg(feature = "logging")]
                    log::trace!("Allocating new bindless index {}", head);
                    return Some(head);
                }
                Err(current) => head = current,
            }
        }
    }

    ///Returns `index` to the pool. Only called by deferred reclamation once no frame in flight can reference the
    /// index anymore.
    pub(crate) fn free(&self, index: u32) {
        debug_assert!(index < self.head.load(Ordering::Relaxed));
        //Can't fail, self owns the receiver.
        let _ = self.free_tx.send(index);
    }

    ///Number of indices handed out at least once.
    pub fn high_water_mark(&self) -> u32 {
        self.head.load(Ordering::Relaxed)
    }

    pub fn capacity(&self) -> u32 {
        self.max
    }

    ///Number of indices waiting for reuse.
    pub fn free_count(&self) -> usize {
        let recycled = self.recycled.lock().unwrap_or_else(PoisonError::into_inner).len();
        recycled + self.free_rx.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use static_assertions::assert_impl_all;

    #[test]
    fn allocator_is_send_sync() {
        assert_impl_all!(BindlessAllocator: Send, Sync);
    }

    #[test]
    fn prefers_recycled_indices() {
        let alloc = BindlessAllocator::new(8);
        assert_eq!(alloc.allocate(), Some(0));
        assert_eq!(alloc.allocate(), Some(1));
        assert_eq!(alloc.allocate(), Some(2));
        alloc.free(1);
        assert_eq!(alloc.allocate(), Some(1));
        assert_eq!(alloc.allocate(), Some(3));
        assert_eq!(alloc.high_water_mark(), 4);
    }

    #[test]
    fn smallest_free_index_comes_first() {
        let alloc = BindlessAllocator::new(8);
        for expected in 0..6 {
            assert_eq!(alloc.allocate(), Some(expected));
        }
        alloc.free(4);
        alloc.free(1);
        alloc.free(3);
        assert_eq!(alloc.free_count(), 3);
        assert_eq!(alloc.allocate(), Some(1));
        //frees that arrive later still sort in
        alloc.free(0);
        assert_eq!(alloc.allocate(), Some(0));
        assert_eq!(alloc.allocate(), Some(3));
        assert_eq!(alloc.allocate(), Some(4));
        assert_eq!(alloc.allocate(), Some(6));
        assert_eq!(alloc.free_count(), 0);
    }

    #[test]
    fn exhaustion_returns_none() {
        let alloc = BindlessAllocator::new(2);
        assert!(alloc.allocate().is_some());
        assert!(alloc.allocate().is_some());
        assert_eq!(alloc.allocate(), None);
        alloc.free(0);
        assert_eq!(alloc.allocate(), Some(0));
        assert_eq!(alloc.allocate(), None);
    }

    #[test]
    fn concurrent_allocation_hands_out_unique_indices() {
        let alloc = std::sync::Arc::new(BindlessAllocator::new(4096));
        let threads: Vec<_> = (0..4)
            .map(|_| {
                let alloc = alloc.clone();
                std::thread::spawn(move || {
                    (0..256).filter_map(|_| alloc.allocate()).collect::<Vec<_>>()
                })
            })
            .collect();
        let mut all: Vec<u32> = threads
            .into_iter()
            .flat_map(|t| t.join().unwrap())
            .collect();
        all.sort_unstable();
        all.dedup();
        assert_eq!(all.len(), 1024);
        assert_eq!(alloc.high_water_mark(), 1024);
    }
}
