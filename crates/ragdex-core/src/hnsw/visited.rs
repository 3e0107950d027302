//! Per-thread reusable visited marks for graph traversal.
//!
//! Marks are epoch stamps: clearing bumps the epoch instead of zeroing the
//! array, so a query pays nothing proportional to the graph size to reset.

use std::cell::RefCell;

const MIN_CAPACITY: usize = 1024;
const POOL_LIMIT: usize = 4;

thread_local! {
    static POOL: RefCell<Vec<EpochMarks>> = const { RefCell::new(Vec::new()) };
}

struct EpochMarks {
    stamps: Vec<u32>,
    epoch: u32,
}

impl EpochMarks {
    fn with_capacity(capacity: usize) -> Self {
        Self {
            stamps: vec![0; capacity.max(MIN_CAPACITY)],
            epoch: 1,
        }
    }

    fn reset(&mut self) {
        self.epoch = self.epoch.wrapping_add(1);
        if self.epoch == 0 {
            self.stamps.fill(0);
            self.epoch = 1;
        }
    }
}

/// Visited set borrowed from the thread-local pool; returned on drop.
pub struct Visited {
    marks: Option<EpochMarks>,
}

impl Visited {
    pub fn new(capacity: usize) -> Self {
        let mut marks = POOL.with(|pool| {
            let mut pool = pool.borrow_mut();
            pool.iter()
                .position(|m| m.stamps.len() >= capacity)
                .map(|idx| pool.swap_remove(idx))
        })
        .unwrap_or_else(|| EpochMarks::with_capacity(capacity));
        marks.reset();
        Self { marks: Some(marks) }
    }

    /// Mark `slot`; returns false when it was already marked.
    #[inline]
    pub fn visit(&mut self, slot: usize) -> bool {
        let Some(m) = self.marks.as_mut() else {
            return false;
        };
        if slot >= m.stamps.len() {
            let len = slot
                .saturating_add(1)
                .checked_next_power_of_two()
                .unwrap_or(slot + 1);
            m.stamps.resize(len, 0);
        }
        if m.stamps[slot] == m.epoch {
            return false;
        }
        m.stamps[slot] = m.epoch;
        true
    }
}

impl Drop for Visited {
    fn drop(&mut self) {
        if let Some(marks) = self.marks.take() {
            POOL.with(|pool| {
                let mut pool = pool.borrow_mut();
                if pool.len() < POOL_LIMIT {
                    pool.push(marks);
                }
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_visit_marks_once() {
        let mut visited = Visited::new(16);
        assert!(visited.visit(3));
        assert!(!visited.visit(3));
        assert!(visited.visit(4));
    }

    #[test]
    fn test_reused_set_starts_clear() {
        {
            let mut visited = Visited::new(100);
            visited.visit(42);
        }
        let mut visited = Visited::new(100);
        assert!(visited.visit(42));
    }

    #[test]
    fn test_grows_for_large_slots() {
        let mut visited = Visited::new(16);
        assert!(visited.visit(5000));
        assert!(!visited.visit(5000));
        assert!(visited.visit(5001));
    }
}
