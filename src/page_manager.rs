//! The page manager: allocation, fetch, caching, freelisting and
//! reclamation of fixed-size pages against a block device, plus the
//! persisted checkpoint of its own state.

use std::sync::Arc;

use bitflags::bitflags;
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::cache::Cache;
use crate::changeset::{Changeset, LsnManager};
use crate::config::EnvConfig;
use crate::device::SharedDevice;
use crate::error::{Error, Result};
use crate::freelist::{self, FreeMap, RECORD_MAX_LEN};
use crate::header::HeaderPage;
use crate::page::{Page, PageKind, PAGE_HDR_LEN};

bitflags! {
    /// Per-call flags recognized by [`PageManager::fetch`] and
    /// [`PageManager::alloc`].
    #[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
    pub struct PageFlags: u32 {
        /// Do not enroll the page into the changeset.
        const READ_ONLY = 1 << 0;
        /// The page is a blob continuation page without a persisted header.
        const NO_HEADER = 1 << 1;
        /// Only consult the cache; never touch the device.
        const ONLY_FROM_CACHE = 1 << 2;
        /// Zero the page contents after allocation.
        const CLEAR_WITH_ZERO = 1 << 3;
        /// Always extend the device instead of reusing a free page.
        const IGNORE_FREELIST = 1 << 4;
        /// Suppress the state checkpoint that caching a page may trigger.
        const DISABLE_STORE_STATE = 1 << 5;
    }
}

/// Counters exposed for diagnostics and tests.
#[derive(Clone, Copy, Debug, Default)]
pub struct PageManagerMetrics {
    pub pages_fetched: u64,
    pub index_pages: u64,
    pub blob_pages: u64,
    pub state_pages: u64,
    pub freelist_hits: u64,
    pub freelist_misses: u64,
}

/// Upper bound on state-page chain walks; a longer chain is a cycle.
const MAX_CHAIN_LEN: usize = 1 << 16;

struct PmState {
    config: EnvConfig,
    device: SharedDevice,
    changeset: Arc<Changeset>,
    lsn: Arc<LsnManager>,
    header: Option<Arc<HeaderPage>>,
    cache: Cache,
    free_pages: FreeMap,
    needs_flush: bool,
    state_page: Option<Arc<Page>>,
    last_blob_page: Option<Arc<Page>>,
    last_blob_page_id: u64,
    metrics: PageManagerMetrics,
}

pub struct PageManager {
    state: Mutex<PmState>,
}

impl PageManager {
    pub fn new(
        config: EnvConfig,
        device: SharedDevice,
        changeset: Arc<Changeset>,
        lsn: Arc<LsnManager>,
    ) -> Self {
        let cache = Cache::new(config.cache_capacity, config.page_size as usize);
        Self {
            state: Mutex::new(PmState {
                config,
                device,
                changeset,
                lsn,
                header: None,
                cache,
                free_pages: FreeMap::new(),
                needs_flush: false,
                state_page: None,
                last_blob_page: None,
                last_blob_page_id: 0,
                metrics: PageManagerMetrics::default(),
            }),
        }
    }

    pub fn page_size(&self) -> u64 {
        self.state.lock().config.page_size as u64
    }

    /// Registers the header page (address 0) with the cache and wires the
    /// accessor used by state checkpoints.
    pub fn set_header(&self, header: Arc<HeaderPage>) -> Result<()> {
        let mut state = self.state.lock();
        state.cache.put(header.page().clone())?;
        state.header = Some(header);
        Ok(())
    }

    /// Rebuilds the in-memory freelist from the persisted state-page chain.
    pub fn initialize(&self, address: u64) -> Result<()> {
        initialize_locked(&mut self.state.lock(), address)
    }

    pub fn fetch(&self, db: Option<u16>, address: u64, flags: PageFlags) -> Result<Arc<Page>> {
        fetch_locked(&mut self.state.lock(), db, address, flags)
    }

    pub fn alloc(&self, db: Option<u16>, kind: PageKind, flags: PageFlags) -> Result<Arc<Page>> {
        alloc_locked(&mut self.state.lock(), db, kind, flags)
    }

    /// Allocates `num_pages` physically contiguous blob pages; every page
    /// after the first is headerless.
    pub fn alloc_blob_run(&self, num_pages: usize) -> Result<Arc<Page>> {
        alloc_blob_run_locked(&mut self.state.lock(), num_pages)
    }

    /// Returns a page (run) to the freelist. The page contents are left
    /// untouched; reclamation happens lazily.
    pub fn del(&self, page: &Page, page_count: usize) -> Result<()> {
        debug_assert!(page_count > 0);
        let mut state = self.state.lock();
        if state.config.in_memory {
            return Ok(());
        }
        let page_size = state.config.page_size as u64;
        debug_assert_eq!(page.address() % page_size, 0);
        state.needs_flush = true;
        freelist::insert_run(&mut state.free_pages, page_size, page.address(), page_count);
        // No checkpoint here; freeing alone is not a loggable boundary.
        Ok(())
    }

    /// Persists the freelist into the state-page chain and returns the
    /// address of the chain head (0 when there is nothing to store).
    pub fn store_state(&self) -> Result<u64> {
        store_state_locked(&mut self.state.lock())
    }

    /// Checkpoints if recovery is enabled (or `force` is set) and records
    /// the resulting chain head in the header page.
    pub fn maybe_store_state(&self, force: bool) -> Result<()> {
        maybe_store_state(&mut self.state.lock(), force)
    }

    /// Writes every dirty page back without evicting anything.
    pub fn flush_all(&self) -> Result<()> {
        flush_all_locked(&mut self.state.lock())
    }

    /// Ends a mutating boundary: with recovery enabled, checkpoints the
    /// freelist state and flushes the changeset under a fresh LSN.
    pub fn commit_boundary(&self) -> Result<()> {
        let mut state = self.state.lock();
        if !state.config.enable_recovery {
            return Ok(());
        }
        maybe_store_state(&mut state, false)?;
        let lsn = state.lsn.next();
        state.changeset.flush(lsn)
    }

    /// Evicts clean, uncoupled pages until the cache is back under its
    /// byte budget. No-op for in-memory environments.
    pub fn purge_cache(&self) -> Result<()> {
        let mut state = self.state.lock();
        if state.config.in_memory || !state.cache.is_full() {
            return Ok(());
        }
        let PmState {
            cache,
            device,
            last_blob_page,
            last_blob_page_id,
            ..
        } = &mut *state;
        cache.purge(|page| {
            if let Some(blob_page) = last_blob_page.as_ref() {
                if Arc::ptr_eq(blob_page, &page) {
                    *last_blob_page_id = page.address();
                    *last_blob_page = None;
                }
            }
            let mut device = device.lock();
            page.flush(device.as_mut())
        })
    }

    /// Truncates trailing free pages off the file and checkpoints the
    /// shrunken freelist.
    pub fn reclaim_space(&self) -> Result<()> {
        reclaim_locked(&mut self.state.lock())
    }

    /// Flushes and evicts every page owned by `db`.
    pub fn close_database(&self, db: u16) -> Result<()> {
        let mut state = self.state.lock();
        if let Some(blob_page) = state.last_blob_page.take() {
            state.last_blob_page_id = blob_page.address();
        }
        let PmState { cache, device, .. } = &mut *state;
        cache.purge_if(|page| {
            if page.db() == Some(db) && page.address() != 0 {
                debug_assert_eq!(page.cursor_count(), 0);
                let mut device = device.lock();
                page.flush(device.as_mut())?;
                Ok(true)
            } else {
                Ok(false)
            }
        })?;
        state.changeset.clear();
        Ok(())
    }

    /// Final checkpoint, reclaim and flush. The manager is unusable for
    /// mutations afterwards.
    pub fn close(&self) -> Result<()> {
        let mut state = self.state.lock();
        if !state.config.in_memory && !state.config.read_only {
            maybe_store_state(&mut state, true)?;
        }
        let try_reclaim =
            !state.config.in_memory && !state.config.read_only && !state.config.disable_reclaim;
        if try_reclaim {
            reclaim_locked(&mut state)?;
            if state.config.enable_recovery {
                let lsn = state.lsn.next();
                state.changeset.flush(lsn)?;
            }
        }
        flush_all_locked(&mut state)?;
        state.state_page = None;
        state.last_blob_page = None;
        Ok(())
    }

    /// The page small blobs are appended to, refetched by its latched id
    /// if it was evicted in the meantime.
    pub fn last_blob_page(&self) -> Result<Option<Arc<Page>>> {
        let mut state = self.state.lock();
        if let Some(page) = &state.last_blob_page {
            return Ok(Some(page.clone()));
        }
        if state.last_blob_page_id != 0 {
            let id = state.last_blob_page_id;
            return fetch_locked(&mut state, None, id, PageFlags::empty()).map(Some);
        }
        Ok(None)
    }

    pub fn set_last_blob_page(&self, page: Option<Arc<Page>>) {
        let mut state = self.state.lock();
        state.last_blob_page_id = 0;
        state.last_blob_page = page;
    }

    pub fn metrics(&self) -> PageManagerMetrics {
        self.state.lock().metrics
    }

    /// True when `address` lies inside any free run.
    pub fn is_page_free(&self, address: u64) -> bool {
        let state = self.state.lock();
        let page_size = state.config.page_size as u64;
        state
            .free_pages
            .range(..=address)
            .next_back()
            .map_or(false, |(&start, &count)| {
                address < start + u64::from(count) * page_size
            })
    }

    pub fn free_page_count(&self) -> usize {
        let state = self.state.lock();
        state
            .free_pages
            .values()
            .map(|&count| count as usize)
            .sum()
    }

    /// Cache probe that does not touch the device or recency.
    pub fn cached_page(&self, address: u64) -> Option<Arc<Page>> {
        self.state.lock().cache.peek(address)
    }

    pub fn cache_usage(&self) -> (usize, usize) {
        let state = self.state.lock();
        (state.cache.allocated_elements(), state.cache.capacity())
    }
}

fn fetch_locked(
    state: &mut PmState,
    db: Option<u16>,
    address: u64,
    flags: PageFlags,
) -> Result<Arc<Page>> {
    if let Some(page) = state.cache.get(address) {
        if flags.contains(PageFlags::NO_HEADER) {
            page.set_without_header(true);
        }
        if !flags.contains(PageFlags::READ_ONLY) && state.config.enable_recovery {
            state.changeset.put(&page);
        }
        return Ok(page);
    }
    // The state page is owned by the manager, not by the cache; keep the
    // one-object-per-address invariant anyway.
    if let Some(state_page) = &state.state_page {
        if state_page.address() == address {
            return Ok(state_page.clone());
        }
    }
    if flags.contains(PageFlags::ONLY_FROM_CACHE) || state.config.in_memory {
        return Err(Error::KeyNotFound);
    }

    let page = Arc::new(Page::new(address, state.config.page_size as usize));
    if flags.contains(PageFlags::NO_HEADER) {
        page.set_without_header(true);
    }
    page.set_db(db);
    {
        let mut device = state.device.lock();
        page.read_from(device.as_mut())?;
    }
    store_page_in_cache(state, &page, flags)?;
    if !flags.contains(PageFlags::READ_ONLY) && state.config.enable_recovery {
        state.changeset.put(&page);
    }
    state.metrics.pages_fetched += 1;
    Ok(page)
}

fn alloc_locked(
    state: &mut PmState,
    db: Option<u16>,
    kind: PageKind,
    flags: PageFlags,
) -> Result<Arc<Page>> {
    let page_size = state.config.page_size as u64;
    let mut page = None;

    if !flags.contains(PageFlags::IGNORE_FREELIST) && !state.free_pages.is_empty() {
        let (address, count) = {
            let (&address, &count) = state.free_pages.iter().next().expect("non-empty map");
            (address, count)
        };
        state.free_pages.remove(&address);
        if count > 1 {
            state.free_pages.insert(address + page_size, count - 1);
        }
        state.needs_flush = true;
        state.metrics.freelist_hits += 1;
        debug_assert_eq!(address % page_size, 0);

        page = Some(match state.cache.get(address) {
            Some(cached) => cached,
            None => {
                let fresh = Arc::new(Page::new(address, page_size as usize));
                let mut device = state.device.lock();
                fresh.read_from(device.as_mut())?;
                drop(device);
                fresh
            }
        });
    }

    let page = match page {
        Some(page) => page,
        None => {
            state.metrics.freelist_misses += 1;
            let address = {
                let mut device = state.device.lock();
                device.alloc_page(page_size)?
            };
            Arc::new(Page::new(address, page_size as usize))
        }
    };

    if flags.contains(PageFlags::CLEAR_WITH_ZERO) {
        page.data_mut().fill(0);
    }
    // A reused free page may have been a headerless blob tail.
    page.set_without_header(false);
    page.set_kind(kind);
    page.set_dirty(true);
    page.set_db(db);

    if state.config.enable_recovery {
        state.changeset.put(&page);
    }
    store_page_in_cache(state, &page, flags)?;

    match kind {
        PageKind::Index | PageKind::Leaf => state.metrics.index_pages += 1,
        PageKind::Blob => state.metrics.blob_pages += 1,
        PageKind::PageManagerState => state.metrics.state_pages += 1,
        PageKind::Header => {}
    }
    Ok(page)
}

fn alloc_blob_run_locked(state: &mut PmState, num_pages: usize) -> Result<Arc<Page>> {
    if num_pages == 1 {
        return alloc_locked(state, None, PageKind::Blob, PageFlags::empty());
    }
    let page_size = state.config.page_size as u64;

    let found = state
        .free_pages
        .iter()
        .find(|&(_, &count)| count as usize >= num_pages)
        .map(|(&address, &count)| (address, count));
    if let Some((address, count)) = found {
        let mut first = None;
        for i in 0..num_pages {
            let page = fetch_locked(
                state,
                None,
                address + i as u64 * page_size,
                PageFlags::empty(),
            )?;
            page.set_kind(PageKind::Blob);
            page.set_without_header(i != 0);
            page.set_dirty(true);
            if i == 0 {
                first = Some(page);
            }
        }
        if count as usize > num_pages {
            state
                .free_pages
                .insert(address + num_pages as u64 * page_size, count - num_pages as u32);
        }
        state.free_pages.remove(&address);
        state.needs_flush = true;
        state.metrics.freelist_hits += 1;
        return Ok(first.expect("first page of the run"));
    }

    // No run found: extend the device. Disable the state checkpoint so the
    // manager cannot allocate overflow pages in the middle of our run.
    state.metrics.freelist_misses += 1;
    let flags = PageFlags::IGNORE_FREELIST | PageFlags::DISABLE_STORE_STATE;
    let mut first = None;
    for i in 0..num_pages {
        let page = alloc_locked(state, None, PageKind::Blob, flags)?;
        if i == 0 {
            first = Some(page);
        } else {
            page.set_without_header(true);
        }
    }
    maybe_store_state(state, false)?;
    Ok(first.expect("first page of the run"))
}

fn store_page_in_cache(state: &mut PmState, page: &Arc<Page>, flags: PageFlags) -> Result<()> {
    state.cache.put(page.clone())?;
    if !flags.contains(PageFlags::DISABLE_STORE_STATE) && !flags.contains(PageFlags::READ_ONLY) {
        maybe_store_state(state, false)?;
    }
    Ok(())
}

fn maybe_store_state(state: &mut PmState, force: bool) -> Result<()> {
    if !(force || state.config.enable_recovery) {
        return Ok(());
    }
    let blobid = store_state_locked(state)?;
    if let Some(header) = state.header.clone() {
        if blobid != header.page_manager_blobid() {
            header.set_page_manager_blobid(blobid);
            if state.config.enable_recovery {
                state.changeset.put(header.page());
            }
        }
    }
    Ok(())
}

fn read_overflow(page: &Page, is_head: bool) -> u64 {
    let data = page.data();
    let payload = &data[PAGE_HDR_LEN..];
    let base = if is_head { 8 } else { 0 };
    u64::from_le_bytes(payload[base..base + 8].try_into().unwrap())
}

fn store_state_locked(state: &mut PmState) -> Result<u64> {
    if !state.needs_flush {
        return Ok(state.state_page.as_ref().map_or(0, |p| p.address()));
    }
    state.needs_flush = false;

    if state.state_page.is_none() && state.free_pages.is_empty() {
        return Ok(0);
    }

    let page_size = state.config.page_size as u64;
    if state.state_page.is_none() {
        let address = {
            let mut device = state.device.lock();
            device.alloc_page(page_size)?
        };
        let page = Arc::new(Page::new(address, page_size as usize));
        page.set_kind(PageKind::PageManagerState);
        state.state_page = Some(page);
        state.metrics.state_pages += 1;
    }
    let head = state.state_page.clone().expect("state page exists");
    if state.config.enable_recovery {
        state.changeset.put(&head);
    }
    head.set_dirty(true);

    // Fold the entire previous overflow chain back into the free map before
    // overwriting it; shrinking the chain must not leak its pages.
    let mut chain = Vec::new();
    let mut next = read_overflow(&head, true);
    while next != 0 {
        if chain.len() > MAX_CHAIN_LEN {
            return Err(Error::Corruption("state page chain cycle"));
        }
        chain.push(next);
        let page = fetch_locked(state, None, next, PageFlags::DISABLE_STORE_STATE)?;
        next = read_overflow(&page, false);
    }
    for address in chain {
        freelist::insert_run(&mut state.free_pages, page_size, address, 1);
    }

    let runs = freelist::coalesce(&state.free_pages, page_size);
    debug!(runs = runs.len(), "checkpointing page-manager state");

    let payload_len = state.config.page_size as usize - PAGE_HDR_LEN;
    let mut page = head.clone();
    let mut index = 0;
    loop {
        let is_head = Arc::ptr_eq(&page, &head);
        let base = if is_head { 8 } else { 0 };
        let mut counter = 0u32;
        {
            let mut data = page.data_mut();
            let payload = &mut data[PAGE_HDR_LEN..];
            if is_head {
                payload[0..8].copy_from_slice(&state.last_blob_page_id.to_le_bytes());
            }
            let mut pos = base + 12;
            while index < runs.len() && pos + RECORD_MAX_LEN <= payload_len {
                pos += freelist::write_record(&mut payload[pos..], page_size, runs[index]);
                counter += 1;
                index += 1;
            }
            payload[base + 8..base + 12].copy_from_slice(&counter.to_le_bytes());
        }
        page.set_dirty(true);

        if index >= runs.len() {
            let mut data = page.data_mut();
            let payload = &mut data[PAGE_HDR_LEN..];
            payload[base..base + 8].fill(0);
            break;
        }
        let next = alloc_locked(
            state,
            None,
            PageKind::PageManagerState,
            PageFlags::IGNORE_FREELIST
                | PageFlags::DISABLE_STORE_STATE
                | PageFlags::CLEAR_WITH_ZERO,
        )?;
        {
            let mut data = page.data_mut();
            let payload = &mut data[PAGE_HDR_LEN..];
            payload[base..base + 8].copy_from_slice(&next.address().to_le_bytes());
        }
        page = next;
    }
    Ok(head.address())
}

fn initialize_locked(state: &mut PmState, address: u64) -> Result<()> {
    state.free_pages.clear();
    let page_size = state.config.page_size as u64;

    let head = Arc::new(Page::new(address, page_size as usize));
    {
        let mut device = state.device.lock();
        head.read_from(device.as_mut())?;
    }
    if head.kind() != PageKind::PageManagerState {
        return Err(Error::Corruption("state page has the wrong type"));
    }
    state.state_page = Some(head.clone());
    {
        let data = head.data();
        let payload = &data[PAGE_HDR_LEN..];
        state.last_blob_page_id = u64::from_le_bytes(payload[0..8].try_into().unwrap());
    }

    let mut page = head;
    let mut is_head = true;
    let mut hops = 0;
    loop {
        let (overflow, runs) = {
            let data = page.data();
            let payload = &data[PAGE_HDR_LEN..];
            let base = if is_head { 8 } else { 0 };
            let overflow = u64::from_le_bytes(payload[base..base + 8].try_into().unwrap());
            let counter = u32::from_le_bytes(payload[base + 8..base + 12].try_into().unwrap());
            let mut pos = base + 12;
            let mut runs = Vec::with_capacity(counter as usize);
            for _ in 0..counter {
                let (run, used) = freelist::read_record(&payload[pos..], page_size)?;
                runs.push(run);
                pos += used;
            }
            (overflow, runs)
        };
        for run in runs {
            state.free_pages.insert(run.address, run.run_length);
        }
        if overflow == 0 {
            break;
        }
        hops += 1;
        if hops > MAX_CHAIN_LEN {
            return Err(Error::Corruption("state page chain cycle"));
        }
        page = fetch_locked(state, None, overflow, PageFlags::DISABLE_STORE_STATE)?;
        if page.kind() != PageKind::PageManagerState {
            return Err(Error::Corruption("state chain page has the wrong type"));
        }
        is_head = false;
    }
    debug!(
        entries = state.free_pages.len(),
        last_blob_page = state.last_blob_page_id,
        "restored page-manager state"
    );
    Ok(())
}

fn reclaim_locked(state: &mut PmState) -> Result<()> {
    if state.config.in_memory || state.config.disable_reclaim {
        return Ok(());
    }
    if let Some(blob_page) = state.last_blob_page.take() {
        state.last_blob_page_id = blob_page.address();
    }

    let page_size = state.config.page_size as u64;
    let mut file_size = state.device.lock().len();
    let mut truncated = false;

    loop {
        let tail = state
            .free_pages
            .range(..file_size)
            .next_back()
            .map(|(&address, &count)| (address, count));
        let Some((address, count)) = tail else { break };
        if address + u64::from(count) * page_size != file_size {
            break;
        }
        let last = file_size - page_size;
        if let Some(page) = state.cache.peek(last) {
            if page.cursor_count() > 0 {
                break;
            }
            state.cache.del(last);
        }
        if count > 1 {
            state.free_pages.insert(address, count - 1);
        } else {
            state.free_pages.remove(&address);
        }
        file_size -= page_size;
        truncated = true;
    }

    if truncated {
        state.needs_flush = true;
        let len_before_checkpoint = state.device.lock().len();
        maybe_store_state(state, true)?;
        let mut device = state.device.lock();
        if device.len() == len_before_checkpoint {
            debug!(file_size, "reclaiming trailing free pages");
            device.truncate(file_size)?;
        } else {
            // The checkpoint allocated fresh state pages at the old tail;
            // truncating now would cut them off.
            warn!("skipping truncation: checkpoint extended the file");
        }
    }
    Ok(())
}

fn flush_all_locked(state: &mut PmState) -> Result<()> {
    let PmState {
        cache,
        device,
        state_page,
        ..
    } = &mut *state;
    cache.purge_if(|page| {
        let mut device = device.lock();
        page.flush(device.as_mut())?;
        Ok(false)
    })?;
    if let Some(page) = state_page {
        let mut device = device.lock();
        page.flush(device.as_mut())?;
    }
    let mut device = device.lock();
    device.sync()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{shared, FileDevice};
    use tempfile::NamedTempFile;

    fn manager(config: EnvConfig) -> (PageManager, NamedTempFile) {
        let tmp = NamedTempFile::new().expect("temp file");
        let device = shared(Box::new(FileDevice::open(tmp.path()).expect("device")));
        let changeset = Arc::new(Changeset::new(device.clone()));
        let lsn = Arc::new(LsnManager::new(1));
        (PageManager::new(config, device, changeset, lsn), tmp)
    }

    #[test]
    fn alloc_extends_the_device() {
        let (pm, _tmp) = manager(EnvConfig::default());
        let a = pm.alloc(None, PageKind::Blob, PageFlags::empty()).unwrap();
        let b = pm.alloc(None, PageKind::Blob, PageFlags::empty()).unwrap();
        assert_eq!(a.address(), 0);
        assert_eq!(b.address(), 4096);
        assert!(b.dirty());
    }

    #[test]
    fn del_then_alloc_reuses_the_page() {
        let (pm, _tmp) = manager(EnvConfig::default());
        let _keep = pm.alloc(None, PageKind::Blob, PageFlags::empty()).unwrap();
        let freed = pm.alloc(None, PageKind::Blob, PageFlags::empty()).unwrap();
        let address = freed.address();
        pm.del(&freed, 1).unwrap();
        drop(freed);
        assert!(pm.is_page_free(address));
        let again = pm.alloc(None, PageKind::Leaf, PageFlags::empty()).unwrap();
        assert_eq!(again.address(), address);
        assert!(!pm.is_page_free(address));
        assert_eq!(again.kind(), PageKind::Leaf);
    }

    #[test]
    fn alloc_from_a_run_keeps_the_residue() {
        let (pm, _tmp) = manager(EnvConfig::default());
        let first = pm.alloc(None, PageKind::Blob, PageFlags::empty()).unwrap();
        for _ in 0..3 {
            pm.alloc(None, PageKind::Blob, PageFlags::empty()).unwrap();
        }
        pm.del(&first, 3).unwrap();
        let reused = pm.alloc(None, PageKind::Blob, PageFlags::empty()).unwrap();
        assert_eq!(reused.address(), first.address());
        assert_eq!(pm.free_page_count(), 2);
        assert!(pm.is_page_free(first.address() + 4096));
    }

    #[test]
    fn ignore_freelist_skips_free_pages() {
        let (pm, _tmp) = manager(EnvConfig::default());
        let page = pm.alloc(None, PageKind::Blob, PageFlags::empty()).unwrap();
        pm.del(&page, 1).unwrap();
        let fresh = pm
            .alloc(None, PageKind::Blob, PageFlags::IGNORE_FREELIST)
            .unwrap();
        assert_ne!(fresh.address(), page.address());
        assert!(pm.is_page_free(page.address()));
    }

    #[test]
    fn store_state_roundtrip() {
        let (pm, _tmp) = manager(EnvConfig::default());
        let mut freed = Vec::new();
        for _ in 0..8 {
            let page = pm.alloc(None, PageKind::Blob, PageFlags::empty()).unwrap();
            freed.push(page);
        }
        for page in freed.iter().skip(4) {
            pm.del(page, 1).unwrap();
        }
        let state_address = pm.store_state().unwrap();
        assert_ne!(state_address, 0);
        pm.flush_all().unwrap();

        // A second manager over the same device sees the persisted state.
        let device = pm.state.lock().device.clone();
        let changeset = Arc::new(Changeset::new(device.clone()));
        let lsn = Arc::new(LsnManager::new(1));
        let pm2 = PageManager::new(EnvConfig::default(), device, changeset, lsn);
        pm2.initialize(state_address).unwrap();
        for page in freed.iter().skip(4) {
            assert!(pm2.is_page_free(page.address()));
        }
        for page in freed.iter().take(4) {
            assert!(!pm2.is_page_free(page.address()));
        }
    }

    #[test]
    fn store_state_without_changes_returns_current_address() {
        let (pm, _tmp) = manager(EnvConfig::default());
        assert_eq!(pm.store_state().unwrap(), 0);
        let page = pm.alloc(None, PageKind::Blob, PageFlags::empty()).unwrap();
        pm.del(&page, 1).unwrap();
        let first = pm.store_state().unwrap();
        let second = pm.store_state().unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn fetch_only_from_cache_misses_cleanly() {
        let (pm, _tmp) = manager(EnvConfig::default());
        let page = pm.alloc(None, PageKind::Blob, PageFlags::empty()).unwrap();
        let address = page.address();
        assert!(pm
            .fetch(None, address, PageFlags::ONLY_FROM_CACHE)
            .is_ok());
        assert!(matches!(
            pm.fetch(None, address + 4096 * 10, PageFlags::ONLY_FROM_CACHE),
            Err(Error::KeyNotFound)
        ));
    }

    #[test]
    fn last_blob_page_is_latched_by_id() {
        let (pm, _tmp) = manager(EnvConfig::default());
        let page = pm.alloc(None, PageKind::Blob, PageFlags::empty()).unwrap();
        pm.set_last_blob_page(Some(page.clone()));
        assert!(pm.last_blob_page().unwrap().is_some());
        pm.set_last_blob_page(None);
        assert!(pm.last_blob_page().unwrap().is_none());
    }
}
