//! Reference-counted string interner.
//!
//! `acquire` hands out one canonical [`Rc<str>`] per distinct byte string,
//! so equal channel names can be compared and hashed by pointer identity
//! while any registration holds them. The refcount here is the pool's own
//! bookkeeping, not the `Rc` strong count: an entry is unlinked when its
//! acquisitions have all been released, and outstanding `Rc` clones simply
//! keep the allocation alive until they drop.

use std::hash::Hasher;
use std::rc::Rc;

use twox_hash::XxHash64;

/// Arbitrary "large enough" prime.
pub const NBUCKETS: usize = 2063;

/// XXH64 of `bytes`, reduced to a bucket index.
pub fn bucket_of(bytes: &[u8]) -> usize {
    let mut hasher = XxHash64::with_seed(0);
    hasher.write(bytes);
    (hasher.finish() % NBUCKETS as u64) as usize
}

#[derive(Debug)]
struct PoolEntry {
    text: Rc<str>,
    refcount: usize,
}

/// Chained hashtable of interned strings with a fixed bucket count.
#[derive(Debug)]
pub struct StringPool {
    buckets: Vec<Vec<PoolEntry>>,
}

impl Default for StringPool {
    fn default() -> Self {
        Self::new()
    }
}

impl StringPool {
    pub fn new() -> Self {
        let mut buckets = Vec::with_capacity(NBUCKETS);
        buckets.resize_with(NBUCKETS, Vec::new);
        Self { buckets }
    }

    /// Canonical form of `text`, allocated on first sight. Each call counts
    /// one reference that must be paired with a [`release`](Self::release).
    pub fn acquire(&mut self, text: &str) -> Rc<str> {
        let bucket = &mut self.buckets[bucket_of(text.as_bytes())];
        if let Some(entry) = bucket.iter_mut().find(|e| &*e.text == text) {
            entry.refcount += 1;
            return entry.text.clone();
        }
        let canonical: Rc<str> = Rc::from(text);
        bucket.push(PoolEntry {
            text: canonical.clone(),
            refcount: 1,
        });
        canonical
    }

    /// Give back one reference; the entry is unlinked when the last one
    /// goes. Matching is by pointer identity, so only canonical strings
    /// handed out by [`acquire`](Self::acquire) are accepted.
    pub fn release(&mut self, canonical: &Rc<str>) {
        let bucket = &mut self.buckets[bucket_of(canonical.as_bytes())];
        if let Some(pos) = bucket.iter().position(|e| Rc::ptr_eq(&e.text, canonical)) {
            bucket[pos].refcount -= 1;
            if bucket[pos].refcount == 0 {
                bucket.swap_remove(pos);
            }
        }
    }

    /// Current reference count for `text`, zero when not interned.
    pub fn refcount(&self, text: &str) -> usize {
        self.buckets[bucket_of(text.as_bytes())]
            .iter()
            .find(|e| &*e.text == text)
            .map_or(0, |e| e.refcount)
    }

    /// Number of live entries across all buckets.
    pub fn len(&self) -> usize {
        self.buckets.iter().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn equal_inputs_share_one_canonical_pointer() {
        let mut pool = StringPool::new();
        let a = pool.acquire("room");
        let b = pool.acquire("room");
        assert!(Rc::ptr_eq(&a, &b));
        assert_eq!(pool.refcount("room"), 2);
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn distinct_inputs_get_distinct_entries() {
        let mut pool = StringPool::new();
        let a = pool.acquire("alpha");
        let b = pool.acquire("beta");
        assert!(!Rc::ptr_eq(&a, &b));
        assert_eq!(pool.len(), 2);
    }

    #[test]
    fn release_unlinks_at_zero() {
        let mut pool = StringPool::new();
        let a = pool.acquire("room");
        let b = pool.acquire("room");
        pool.release(&a);
        assert_eq!(pool.refcount("room"), 1);
        pool.release(&b);
        assert_eq!(pool.refcount("room"), 0);
        assert!(pool.is_empty());

        // a fresh acquisition is a fresh entry, not the old pointer
        let c = pool.acquire("room");
        assert!(!Rc::ptr_eq(&a, &c));
        assert_eq!(pool.refcount("room"), 1);
    }

    #[test]
    fn release_of_a_foreign_rc_is_a_no_op() {
        let mut pool = StringPool::new();
        pool.acquire("room");
        let foreign: Rc<str> = Rc::from("room");
        pool.release(&foreign);
        assert_eq!(pool.refcount("room"), 1);
    }

    #[test]
    fn outstanding_clones_survive_unlinking() {
        let mut pool = StringPool::new();
        let a = pool.acquire("room");
        pool.release(&a);
        assert_eq!(&*a, "room");
    }
}
