//! The blob store: out-of-line records, extended-key spill blobs and the
//! duplicate tables that back keys with multiple records.
//!
//! A blob is addressed by the absolute file offset of its 16-byte header
//! `[alloc_size: u64 LE][size: u64 LE]`, followed by the data. Small blobs
//! are bump-allocated into the tail of the *last blob page*; anything
//! larger gets its own run of pages, where every page after the first is
//! headerless raw data.

use std::sync::Arc;

use tracing::debug;

use crate::btree::node::{record_is_inline, RECORD_EMPTY, RECORD_SMALL, RECORD_TINY};
use crate::error::{Error, Result};
use crate::page::{Page, PageKind, PAGE_HDR_LEN};
use crate::page_manager::{PageFlags, PageManager};

/// Per-page bookkeeping in front of the first blob: `[used: u32][reserved]`.
const BLOB_PAGE_HDR: usize = 8;
/// `[alloc_size: u64][size: u64]` in front of every blob.
const BLOB_HDR: usize = 16;

/// Tombstone for a bump-allocated blob that was freed in place.
const DEAD_BLOB: u64 = u64::MAX;

fn payload_len(page_size: u64) -> usize {
    page_size as usize - PAGE_HDR_LEN
}

/// Usable bytes for blob data in a fresh blob page.
fn first_page_capacity(page_size: u64) -> usize {
    payload_len(page_size) - BLOB_PAGE_HDR
}

fn read_used(page: &Page) -> usize {
    let data = page.data();
    let payload = &data[PAGE_HDR_LEN..];
    u32::from_le_bytes(payload[0..4].try_into().unwrap()) as usize
}

fn write_used(page: &Page, used: usize) {
    let mut data = page.data_mut();
    let payload = &mut data[PAGE_HDR_LEN..];
    payload[0..4].copy_from_slice(&(used as u32).to_le_bytes());
}

/// Copies `data` to the absolute file offset `start`, which must lie inside
/// an allocated blob run beginning at the page `run_start`.
fn stream_write(pm: &PageManager, run_start: u64, start: u64, data: &[u8]) -> Result<()> {
    let page_size = pm.page_size();
    let mut offset = start;
    let mut remaining = data;
    while !remaining.is_empty() {
        let page_address = offset - offset % page_size;
        let flags = if page_address == run_start {
            PageFlags::empty()
        } else {
            PageFlags::NO_HEADER
        };
        let page = pm.fetch(None, page_address, flags)?;
        let in_page = (offset % page_size) as usize;
        let chunk = remaining.len().min(page_size as usize - in_page);
        page.data_mut()[in_page..in_page + chunk].copy_from_slice(&remaining[..chunk]);
        page.set_dirty(true);
        remaining = &remaining[chunk..];
        offset += chunk as u64;
    }
    Ok(())
}

fn stream_read(pm: &PageManager, run_start: u64, start: u64, len: usize) -> Result<Vec<u8>> {
    let page_size = pm.page_size();
    let mut out = Vec::with_capacity(len);
    let mut offset = start;
    while out.len() < len {
        let page_address = offset - offset % page_size;
        let flags = if page_address == run_start {
            PageFlags::READ_ONLY
        } else {
            PageFlags::NO_HEADER | PageFlags::READ_ONLY
        };
        let page = pm.fetch(None, page_address, flags)?;
        let in_page = (offset % page_size) as usize;
        let chunk = (len - out.len()).min(page_size as usize - in_page);
        out.extend_from_slice(&page.data()[in_page..in_page + chunk]);
        offset += chunk as u64;
    }
    Ok(out)
}

fn blob_header(pm: &PageManager, blob_id: u64) -> Result<(u64, u64, u64)> {
    let page_size = pm.page_size();
    let run_start = blob_id - blob_id % page_size;
    let header = stream_read(pm, run_start, blob_id, BLOB_HDR)?;
    let alloc_size = u64::from_le_bytes(header[0..8].try_into().unwrap());
    let size = u64::from_le_bytes(header[8..16].try_into().unwrap());
    Ok((run_start, alloc_size, size))
}

/// Allocates a blob holding `data` and returns its id.
pub fn allocate(pm: &PageManager, data: &[u8]) -> Result<u64> {
    let page_size = pm.page_size();
    let need = BLOB_HDR + data.len();

    if need <= first_page_capacity(page_size) {
        // Try to append to the last blob page.
        if let Some(page) = pm.last_blob_page()? {
            if page.kind() == PageKind::Blob && !page.without_header() {
                let used = read_used(&page).max(BLOB_PAGE_HDR);
                if payload_len(page_size) - used >= need {
                    let blob_id = page.address() + (PAGE_HDR_LEN + used) as u64;
                    write_blob_at(pm, page.address(), blob_id, data.len() as u64, data)?;
                    write_used(&page, used + need);
                    page.set_dirty(true);
                    pm.set_last_blob_page(Some(page));
                    return Ok(blob_id);
                }
            }
        }
        let page = pm.alloc_blob_run(1)?;
        page.data_mut()[PAGE_HDR_LEN..].fill(0);
        write_used(&page, BLOB_PAGE_HDR + need);
        let blob_id = page.address() + (PAGE_HDR_LEN + BLOB_PAGE_HDR) as u64;
        write_blob_at(pm, page.address(), blob_id, data.len() as u64, data)?;
        pm.set_last_blob_page(Some(page));
        return Ok(blob_id);
    }

    let num_pages = 1 + need
        .saturating_sub(first_page_capacity(page_size))
        .div_ceil(page_size as usize);
    debug!(size = data.len(), num_pages, "allocating multi-page blob");
    let page = pm.alloc_blob_run(num_pages)?;
    // The first page is completely claimed; no bump allocation after it.
    write_used(&page, payload_len(page_size));
    let blob_id = page.address() + (PAGE_HDR_LEN + BLOB_PAGE_HDR) as u64;
    write_blob_at(pm, page.address(), blob_id, data.len() as u64, data)?;
    Ok(blob_id)
}

fn write_blob_at(
    pm: &PageManager,
    run_start: u64,
    blob_id: u64,
    size: u64,
    data: &[u8],
) -> Result<()> {
    let mut header = [0u8; BLOB_HDR];
    header[0..8].copy_from_slice(&(data.len() as u64).to_le_bytes());
    header[8..16].copy_from_slice(&size.to_le_bytes());
    stream_write(pm, run_start, blob_id, &header)?;
    stream_write(pm, run_start, blob_id + BLOB_HDR as u64, data)
}

/// Reads the blob's current contents.
pub fn read(pm: &PageManager, blob_id: u64) -> Result<Vec<u8>> {
    let (run_start, _alloc_size, size) = blob_header(pm, blob_id)?;
    if size == DEAD_BLOB {
        return Err(Error::Corruption("stale blob id"));
    }
    stream_read(pm, run_start, blob_id + BLOB_HDR as u64, size as usize)
}

/// Releases a blob. A blob that owns its whole page run returns the pages
/// to the freelist; a bump-allocated blob is only tombstoned, its page is
/// reclaimed when the page itself becomes free.
pub fn free(pm: &PageManager, blob_id: u64) -> Result<()> {
    let page_size = pm.page_size();
    let (run_start, alloc_size, _size) = blob_header(pm, blob_id)?;
    let first_blob_offset = (PAGE_HDR_LEN + BLOB_PAGE_HDR) as u64;

    let end = blob_id + (BLOB_HDR as u64) + alloc_size;
    let num_pages = end
        .saturating_sub(run_start)
        .div_ceil(page_size) as usize;
    let page = pm.fetch(None, run_start, PageFlags::empty())?;

    let owns_run = blob_id - run_start == first_blob_offset
        && (num_pages > 1
            || read_used(&page) == BLOB_PAGE_HDR + BLOB_HDR + alloc_size as usize);
    if owns_run {
        if let Some(last) = pm.last_blob_page()? {
            if Arc::ptr_eq(&last, &page) {
                pm.set_last_blob_page(None);
            }
        }
        debug!(blob_id, num_pages, "freeing blob run");
        return pm.del(&page, num_pages);
    }

    let mut tombstone = [0u8; 8];
    tombstone.copy_from_slice(&DEAD_BLOB.to_le_bytes());
    stream_write(pm, run_start, blob_id + 8, &tombstone)
}

/// Rewrites a blob, in place when the new data fits the old allocation.
/// Returns the (possibly new) blob id.
pub fn overwrite(pm: &PageManager, blob_id: u64, data: &[u8]) -> Result<u64> {
    let (run_start, alloc_size, size) = blob_header(pm, blob_id)?;
    if size == DEAD_BLOB {
        return Err(Error::Corruption("stale blob id"));
    }
    if data.len() as u64 <= alloc_size {
        let mut header = [0u8; 8];
        header.copy_from_slice(&(data.len() as u64).to_le_bytes());
        stream_write(pm, run_start, blob_id + 8, &header)?;
        stream_write(pm, run_start, blob_id + BLOB_HDR as u64, data)?;
        return Ok(blob_id);
    }
    free(pm, blob_id)?;
    allocate(pm, data)
}

// --- duplicate tables ----------------------------------------------------

/// One record inside a duplicate table; same representation bits as a leaf
/// slot.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct DupeEntry {
    pub flags: u8,
    pub rid: u64,
}

const DUPE_ENTRY_LEN: usize = 9;

/// Placement of a fresh duplicate, indices 0-based.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DupePosition {
    First,
    Before(u32),
    After(u32),
    Last,
}

fn encode_table(entries: &[DupeEntry]) -> Vec<u8> {
    let mut out = vec![0u8; 8 + entries.len() * DUPE_ENTRY_LEN];
    out[0..4].copy_from_slice(&(entries.len() as u32).to_le_bytes());
    for (i, entry) in entries.iter().enumerate() {
        let off = 8 + i * DUPE_ENTRY_LEN;
        out[off] = entry.flags;
        out[off + 1..off + 9].copy_from_slice(&entry.rid.to_le_bytes());
    }
    out
}

fn decode_table(raw: &[u8]) -> Result<Vec<DupeEntry>> {
    if raw.len() < 8 {
        return Err(Error::Corruption("duplicate table truncated"));
    }
    let count = u32::from_le_bytes(raw[0..4].try_into().unwrap()) as usize;
    if raw.len() < 8 + count * DUPE_ENTRY_LEN {
        return Err(Error::Corruption("duplicate table truncated"));
    }
    let mut entries = Vec::with_capacity(count);
    for i in 0..count {
        let off = 8 + i * DUPE_ENTRY_LEN;
        entries.push(DupeEntry {
            flags: raw[off],
            rid: u64::from_le_bytes(raw[off + 1..off + 9].try_into().unwrap()),
        });
    }
    Ok(entries)
}

fn read_table(pm: &PageManager, table_id: u64) -> Result<Vec<DupeEntry>> {
    decode_table(&read(pm, table_id)?)
}

fn write_table(pm: &PageManager, table_id: u64, entries: &[DupeEntry]) -> Result<u64> {
    let encoded = encode_table(entries);
    if table_id == 0 {
        // Over-allocate so a table can grow in place for a while.
        let padded = 8 + (entries.len().next_power_of_two().max(8)) * DUPE_ENTRY_LEN;
        let mut raw = encoded;
        raw.resize(padded.max(raw.len()), 0);
        raw[0..4].copy_from_slice(&(entries.len() as u32).to_le_bytes());
        return allocate(pm, &raw);
    }
    overwrite(pm, table_id, &encoded)
}

/// Inserts into a duplicate table, creating it when `table_id` is 0. When
/// the table is fresh, `entries` carries the pre-existing record first and
/// the new one last; otherwise only the new record. Returns the table id
/// and the 0-based index of the inserted record.
pub fn duplicate_insert(
    pm: &PageManager,
    table_id: u64,
    entries: &[DupeEntry],
    position: DupePosition,
) -> Result<(u64, u32)> {
    let mut table = if table_id == 0 {
        Vec::new()
    } else {
        read_table(pm, table_id)?
    };
    let (existing, fresh) = match entries {
        [existing, fresh] if table_id == 0 => (Some(existing), fresh),
        [fresh] => (None, fresh),
        _ => return Err(Error::InvalidParameter("bad duplicate entry count")),
    };
    if let Some(existing) = existing {
        table.push(*existing);
    }
    let index = match position {
        DupePosition::First => 0,
        DupePosition::Before(at) => (at as usize).min(table.len()),
        DupePosition::After(at) => (at as usize + 1).min(table.len()),
        DupePosition::Last => table.len(),
    };
    table.insert(index, *fresh);
    let new_id = write_table(pm, table_id, &table)?;
    Ok((new_id, index as u32))
}

/// Erases one duplicate (`Some(index)`) or the whole table (`None`),
/// freeing the record blobs of the erased entries. Returns the surviving
/// table id, 0 when the table is gone.
pub fn duplicate_erase(pm: &PageManager, table_id: u64, which: Option<u32>) -> Result<u64> {
    let mut table = read_table(pm, table_id)?;
    match which {
        None => {
            for entry in &table {
                free_entry_record(pm, entry)?;
            }
            free(pm, table_id)?;
            Ok(0)
        }
        Some(index) => {
            let index = index as usize;
            if index >= table.len() {
                return Err(Error::InvalidParameter("duplicate index out of range"));
            }
            let removed = table.remove(index);
            free_entry_record(pm, &removed)?;
            if table.is_empty() {
                free(pm, table_id)?;
                return Ok(0);
            }
            write_table(pm, table_id, &table)
        }
    }
}

fn free_entry_record(pm: &PageManager, entry: &DupeEntry) -> Result<()> {
    if !record_is_inline(entry.flags) && entry.rid != 0 {
        free(pm, entry.rid)?;
    }
    Ok(())
}

pub fn duplicate_get(pm: &PageManager, table_id: u64, index: u32) -> Result<DupeEntry> {
    let table = read_table(pm, table_id)?;
    table
        .get(index as usize)
        .copied()
        .ok_or(Error::InvalidParameter("duplicate index out of range"))
}

pub fn duplicate_set(
    pm: &PageManager,
    table_id: u64,
    index: u32,
    entry: DupeEntry,
) -> Result<u64> {
    let mut table = read_table(pm, table_id)?;
    let slot = table
        .get_mut(index as usize)
        .ok_or(Error::InvalidParameter("duplicate index out of range"))?;
    *slot = entry;
    write_table(pm, table_id, &table)
}

pub fn duplicate_count(pm: &PageManager, table_id: u64) -> Result<u32> {
    Ok(read_table(pm, table_id)?.len() as u32)
}

/// Materializes a record from its representation bits and `rid` field.
pub fn read_record(pm: &PageManager, flags: u8, rid: u64) -> Result<Vec<u8>> {
    if flags & RECORD_EMPTY != 0 {
        return Ok(Vec::new());
    }
    let bytes = rid.to_le_bytes();
    if flags & RECORD_TINY != 0 {
        let len = bytes[7] as usize;
        return Ok(bytes[..len.min(7)].to_vec());
    }
    if flags & RECORD_SMALL != 0 {
        return Ok(bytes.to_vec());
    }
    read(pm, rid)
}
