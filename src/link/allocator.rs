//! Callback ID allocation.

use std::collections::HashSet;

use crate::error::TransactionError;
use crate::types::CallbackId;

/// Hands out callback IDs in a cyclic `1..=255` range.
///
/// An ID stays reserved until [`release`](Self::release) is called for it,
/// and reserved IDs are skipped when the cycle wraps around.
#[derive(Debug)]
pub struct CallbackIdAllocator {
    last: u8,
    reserved: HashSet<CallbackId>,
}

impl Default for CallbackIdAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl CallbackIdAllocator {
    /// Creates an allocator whose first ID is 1.
    #[must_use]
    pub fn new() -> Self {
        Self {
            last: 0,
            reserved: HashSet::new(),
        }
    }

    /// Reserves the next free callback ID.
    ///
    /// # Errors
    ///
    /// Returns `TransactionError::Exhausted` if every ID is reserved.
    pub fn next(&mut self) -> Result<CallbackId, TransactionError> {
        let mut candidate = self.last;
        for _ in CallbackId::MIN..=CallbackId::MAX {
            candidate = if candidate == CallbackId::MAX {
                CallbackId::MIN
            } else {
                candidate + 1
            };
            let Some(id) = CallbackId::new(candidate) else {
                continue;
            };
            if self.reserved.insert(id) {
                self.last = candidate;
                return Ok(id);
            }
        }
        Err(TransactionError::Exhausted)
    }

    /// Returns an ID to the pool.
    pub fn release(&mut self, id: CallbackId) {
        self.reserved.remove(&id);
    }

    /// Returns every ID to the pool. The cycle position is kept.
    pub fn release_all(&mut self) {
        self.reserved.clear();
    }

    /// Returns true if the ID is currently reserved.
    #[must_use]
    pub fn is_reserved(&self, id: CallbackId) -> bool {
        self.reserved.contains(&id)
    }

    /// Returns the number of reserved IDs.
    #[must_use]
    pub fn in_use(&self) -> usize {
        self.reserved.len()
    }
}
