use chrono::{DateTime, Utc};
use std::collections::VecDeque;

/// Bounded FIFO with parallel insertion times and a lifetime append counter.
///
/// `total_added` only ever grows, even across `clear` and eviction, so callers
/// can diff two reads of it to learn how many records arrived in between.
#[derive(Debug, Clone)]
pub struct RingBuffer<T> {
    items: VecDeque<T>,
    times: VecDeque<DateTime<Utc>>,
    sizes: VecDeque<u64>,
    capacity: usize,
    total_added: u64,
    bytes: u64,
}

impl<T> RingBuffer<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            items: VecDeque::new(),
            times: VecDeque::new(),
            sizes: VecDeque::new(),
            capacity: capacity.max(1),
            total_added: 0,
            bytes: 0,
        }
    }

    /// Append one record. Returns how many old records were evicted to make room.
    pub fn push(&mut self, item: T, size: u64, at: DateTime<Utc>) -> usize {
        self.items.push_back(item);
        self.times.push_back(at);
        self.sizes.push_back(size);
        self.bytes += size;
        self.total_added += 1;
        self.trim_to(self.capacity)
    }

    fn trim_to(&mut self, cap: usize) -> usize {
        let over = self.items.len().saturating_sub(cap);
        self.evict_oldest(over)
    }

    /// Drop up to `n` of the oldest records.
    pub fn evict_oldest(&mut self, n: usize) -> usize {
        let n = n.min(self.items.len());
        for _ in 0..n {
            self.items.pop_front();
            self.times.pop_front();
            if let Some(size) = self.sizes.pop_front() {
                self.bytes = self.bytes.saturating_sub(size);
            }
        }
        n
    }

    pub fn set_capacity(&mut self, capacity: usize) -> usize {
        self.capacity = capacity.max(1);
        self.trim_to(self.capacity)
    }

    pub fn clear(&mut self) {
        self.items.clear();
        self.times.clear();
        self.sizes.clear();
        self.bytes = 0;
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn total_added(&self) -> u64 {
        self.total_added
    }

    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    pub fn newest_time(&self) -> Option<DateTime<Utc>> {
        self.times.back().copied()
    }

    /// Newest-first iterator over `(record, inserted_at)`.
    pub fn iter_newest(&self) -> impl Iterator<Item = (&T, &DateTime<Utc>)> {
        self.items.iter().rev().zip(self.times.iter().rev())
    }

    /// The counter reading as of `t`: records inserted after `t` are not counted.
    pub fn total_at(&self, t: DateTime<Utc>) -> u64 {
        let idx = self.times.partition_point(|at| *at <= t);
        let after = (self.times.len() - idx) as u64;
        self.total_added.saturating_sub(after)
    }

    /// Records appended after the counter reading `since_total`, newest first.
    ///
    /// Records that were already evicted are skipped silently.
    pub fn added_since(&self, since_total: u64) -> impl Iterator<Item = &T> {
        let new = self.total_added.saturating_sub(since_total);
        let take = (new.min(self.items.len() as u64)) as usize;
        self.items.iter().rev().take(take)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fill(rb: &mut RingBuffer<u32>, n: u32) {
        for i in 0..n {
            rb.push(i, 10, Utc::now());
        }
    }

    #[test]
    fn test_total_at_timestamp() {
        let base = Utc::now();
        let mut rb = RingBuffer::new(2);
        for i in 0..4u32 {
            rb.push(i, 1, base + chrono::Duration::seconds(i as i64));
        }
        // Only the last two are retained; earlier ones count as already seen.
        assert_eq!(rb.total_at(base + chrono::Duration::seconds(2)), 3);
        assert_eq!(rb.total_at(base + chrono::Duration::seconds(10)), 4);
        assert_eq!(rb.total_at(base - chrono::Duration::seconds(10)), 2);
    }

    #[test]
    fn test_cap_and_oldest_first_eviction() {
        let mut rb = RingBuffer::new(3);
        fill(&mut rb, 5);
        assert_eq!(rb.len(), 3);
        let items: Vec<u32> = rb.iter_newest().map(|(v, _)| *v).collect();
        assert_eq!(items, vec![4, 3, 2]);
        assert_eq!(rb.total_added(), 5);
        assert_eq!(rb.bytes(), 30);
    }

    #[test]
    fn test_total_added_survives_clear() {
        let mut rb = RingBuffer::new(10);
        fill(&mut rb, 4);
        rb.clear();
        assert!(rb.is_empty());
        assert_eq!(rb.total_added(), 4);
        assert_eq!(rb.bytes(), 0);
        rb.push(9, 1, Utc::now());
        assert_eq!(rb.total_added(), 5);
    }

    #[test]
    fn test_added_since_returns_only_new_records() {
        let mut rb = RingBuffer::new(10);
        fill(&mut rb, 3);
        let mark = rb.total_added();
        rb.push(100, 1, Utc::now());
        rb.push(101, 1, Utc::now());
        let new: Vec<u32> = rb.added_since(mark).copied().collect();
        assert_eq!(new, vec![101, 100]);
    }

    #[test]
    fn test_added_since_clamps_to_retained() {
        let mut rb = RingBuffer::new(2);
        fill(&mut rb, 6);
        assert_eq!(rb.added_since(0).count(), 2);
    }

    #[test]
    fn test_shrinking_capacity_trims() {
        let mut rb = RingBuffer::new(4);
        fill(&mut rb, 4);
        assert_eq!(rb.set_capacity(2), 2);
        assert_eq!(rb.len(), 2);
        assert_eq!(rb.bytes(), 20);
    }
}
