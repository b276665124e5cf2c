//! Bounded set of resident pages keyed by file offset.
//!
//! Recency is tracked by an [`LruCache`] used without an entry limit; the
//! budget is a byte count enforced by [`Cache::purge`]. The header page
//! (address 0) and pages with coupled cursors are never eviction victims.

use std::sync::Arc;

use lru::LruCache;

use crate::error::{Error, Result};
use crate::page::Page;

pub struct Cache {
    pages: LruCache<u64, Arc<Page>>,
    capacity: usize,
    page_size: usize,
}

impl Cache {
    pub fn new(capacity: usize, page_size: usize) -> Self {
        Self {
            pages: LruCache::unbounded(),
            capacity,
            page_size,
        }
    }

    /// Looks a page up and marks it as recently used.
    pub fn get(&mut self, address: u64) -> Option<Arc<Page>> {
        self.pages.get(&address).cloned()
    }

    /// Looks a page up without touching its recency.
    pub fn peek(&self, address: u64) -> Option<Arc<Page>> {
        self.pages.peek(&address).cloned()
    }

    /// Inserts a page. Re-inserting the same object is a no-op; a different
    /// object under an occupied address is a caller bug.
    pub fn put(&mut self, page: Arc<Page>) -> Result<()> {
        if let Some(existing) = self.pages.peek(&page.address()) {
            if Arc::ptr_eq(existing, &page) {
                return Ok(());
            }
            return Err(Error::InvalidParameter(
                "cache already holds a different page at this address",
            ));
        }
        self.pages.put(page.address(), page);
        Ok(())
    }

    /// Unlinks a page without flushing it.
    pub fn del(&mut self, address: u64) -> Option<Arc<Page>> {
        self.pages.pop(&address)
    }

    pub fn contains(&self, address: u64) -> bool {
        self.pages.contains(&address)
    }

    pub fn allocated_elements(&self) -> usize {
        self.pages.len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn is_full(&self) -> bool {
        self.allocated_elements() * self.page_size > self.capacity
    }

    /// Addresses in least-recently-used-first order.
    fn lru_order(&self) -> Vec<u64> {
        let mut addresses: Vec<u64> = self.pages.iter().map(|(addr, _)| *addr).collect();
        addresses.reverse();
        addresses
    }

    fn is_evictable(page: &Arc<Page>) -> bool {
        page.address() != 0 && page.cursor_count() == 0
    }

    /// Evicts pages, least recently used first, until memory usage is back
    /// under the byte budget or no evictable page remains. Every evicted
    /// page is handed to `evict` (which typically flushes it).
    pub fn purge<F>(&mut self, mut evict: F) -> Result<()>
    where
        F: FnMut(Arc<Page>) -> Result<()>,
    {
        if !self.is_full() {
            return Ok(());
        }
        for address in self.lru_order() {
            if !self.is_full() {
                break;
            }
            let evictable = self
                .pages
                .peek(&address)
                .map(Self::is_evictable)
                .unwrap_or(false);
            if !evictable {
                continue;
            }
            if let Some(page) = self.pages.pop(&address) {
                evict(page)?;
            }
        }
        Ok(())
    }

    /// Evicts every page for which `predicate` returns true. The predicate
    /// may flush the page as a side effect before deciding.
    pub fn purge_if<F>(&mut self, mut predicate: F) -> Result<()>
    where
        F: FnMut(&Arc<Page>) -> Result<bool>,
    {
        for address in self.lru_order() {
            let Some(page) = self.pages.peek(&address).cloned() else {
                continue;
            };
            if predicate(&page)? {
                self.pages.pop(&address);
            }
        }
        Ok(())
    }

}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page::PageKind;

    fn page(address: u64) -> Arc<Page> {
        let p = Arc::new(Page::new(address, 4096));
        p.set_kind(PageKind::Blob);
        p
    }

    #[test]
    fn put_get_del() {
        let mut cache = Cache::new(4096 * 4, 4096);
        let p = page(4096);
        cache.put(p.clone()).unwrap();
        assert!(Arc::ptr_eq(&cache.get(4096).unwrap(), &p));
        cache.del(4096);
        assert!(cache.get(4096).is_none());
    }

    #[test]
    fn put_of_a_different_object_fails() {
        let mut cache = Cache::new(4096 * 4, 4096);
        cache.put(page(4096)).unwrap();
        assert!(cache.put(page(4096)).is_err());
    }

    #[test]
    fn purge_respects_the_byte_budget() {
        let mut cache = Cache::new(4096 * 2, 4096);
        for i in 1..=4 {
            cache.put(page(i * 4096)).unwrap();
        }
        assert!(cache.is_full());
        let mut evicted = Vec::new();
        cache
            .purge(|p| {
                evicted.push(p.address());
                Ok(())
            })
            .unwrap();
        assert!(!cache.is_full());
        // Oldest pages go first.
        assert_eq!(evicted, vec![4096, 8192]);
    }

    #[test]
    fn purge_skips_the_header_page() {
        let mut cache = Cache::new(4096, 4096);
        cache.put(page(0)).unwrap();
        cache.put(page(4096)).unwrap();
        cache.purge(|_| Ok(())).unwrap();
        assert!(cache.contains(0));
        assert!(!cache.contains(4096));
    }

    #[test]
    fn get_refreshes_recency() {
        let mut cache = Cache::new(4096, 4096);
        cache.put(page(4096)).unwrap();
        cache.put(page(8192)).unwrap();
        cache.put(page(12288)).unwrap();
        // Touch the oldest page; the middle one becomes the victim.
        cache.get(4096);
        let mut evicted = Vec::new();
        cache
            .purge(|p| {
                evicted.push(p.address());
                Ok(())
            })
            .unwrap();
        assert_eq!(evicted.first(), Some(&8192));
        assert!(cache.contains(4096));
    }

    #[test]
    fn purge_if_evicts_matching_pages() {
        let mut cache = Cache::new(4096 * 8, 4096);
        for i in 1..=4 {
            cache.put(page(i * 4096)).unwrap();
        }
        cache.purge_if(|p| Ok(p.address() > 8192)).unwrap();
        assert_eq!(cache.allocated_elements(), 2);
        assert!(cache.contains(4096));
        assert!(cache.contains(8192));
    }
}
