//! The header page at address 0: file identity, the page-manager state
//! pointer, and the database descriptor table.

use std::sync::Arc;

use crate::error::{Error, Result};
use crate::page::{Page, PAGE_HDR_LEN};

pub const HEADER_MAGIC: [u8; 4] = *b"SABL";
pub const FORMAT_VERSION: u16 = 1;

pub const MAX_DATABASES: usize = 16;

const MAGIC_OFFSET: usize = 0;
const VERSION_OFFSET: usize = 4;
const PAGE_SIZE_OFFSET: usize = 8;
const PM_BLOBID_OFFSET: usize = 12;
const LSN_OFFSET: usize = 20;
const DESC_OFFSET: usize = 28;
const DESC_LEN: usize = 16;

const DESC_FLAG_DUPLICATES: u32 = 1;

/// One database slot in the header page. `name == 0` marks a free slot.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct DbDescriptor {
    pub name: u16,
    pub key_size: u16,
    pub flags: u32,
    pub root: u64,
}

impl DbDescriptor {
    pub fn duplicates(&self) -> bool {
        self.flags & DESC_FLAG_DUPLICATES != 0
    }

    pub fn set_duplicates(&mut self, enabled: bool) {
        if enabled {
            self.flags |= DESC_FLAG_DUPLICATES;
        } else {
            self.flags &= !DESC_FLAG_DUPLICATES;
        }
    }
}

/// Typed accessor over the header page. The page itself lives in the
/// cache (pinned by address 0 never being an eviction victim).
pub struct HeaderPage {
    page: Arc<Page>,
}

impl HeaderPage {
    pub fn new(page: Arc<Page>) -> Self {
        Self { page }
    }

    pub fn page(&self) -> &Arc<Page> {
        &self.page
    }

    /// Initializes a fresh header page.
    pub fn format(&self, page_size: u32) {
        let mut data = self.page.data_mut();
        let payload = &mut data[PAGE_HDR_LEN..];
        payload[MAGIC_OFFSET..MAGIC_OFFSET + 4].copy_from_slice(&HEADER_MAGIC);
        payload[VERSION_OFFSET..VERSION_OFFSET + 2]
            .copy_from_slice(&FORMAT_VERSION.to_le_bytes());
        payload[PAGE_SIZE_OFFSET..PAGE_SIZE_OFFSET + 4]
            .copy_from_slice(&page_size.to_le_bytes());
        drop(data);
        self.page.set_dirty(true);
    }

    pub fn validate(&self) -> Result<()> {
        let data = self.page.data();
        let payload = &data[PAGE_HDR_LEN..];
        if payload[MAGIC_OFFSET..MAGIC_OFFSET + 4] != HEADER_MAGIC {
            return Err(Error::Corruption("bad header magic"));
        }
        let version = u16::from_le_bytes(
            payload[VERSION_OFFSET..VERSION_OFFSET + 2]
                .try_into()
                .unwrap(),
        );
        if version != FORMAT_VERSION {
            return Err(Error::Corruption("unsupported format version"));
        }
        Ok(())
    }

    pub fn page_size(&self) -> u32 {
        let data = self.page.data();
        let payload = &data[PAGE_HDR_LEN..];
        u32::from_le_bytes(
            payload[PAGE_SIZE_OFFSET..PAGE_SIZE_OFFSET + 4]
                .try_into()
                .unwrap(),
        )
    }

    pub fn page_manager_blobid(&self) -> u64 {
        let data = self.page.data();
        let payload = &data[PAGE_HDR_LEN..];
        u64::from_le_bytes(
            payload[PM_BLOBID_OFFSET..PM_BLOBID_OFFSET + 8]
                .try_into()
                .unwrap(),
        )
    }

    pub fn set_page_manager_blobid(&self, blobid: u64) {
        let mut data = self.page.data_mut();
        let payload = &mut data[PAGE_HDR_LEN..];
        payload[PM_BLOBID_OFFSET..PM_BLOBID_OFFSET + 8].copy_from_slice(&blobid.to_le_bytes());
        drop(data);
        self.page.set_dirty(true);
    }

    pub fn lsn(&self) -> u64 {
        let data = self.page.data();
        let payload = &data[PAGE_HDR_LEN..];
        u64::from_le_bytes(payload[LSN_OFFSET..LSN_OFFSET + 8].try_into().unwrap())
    }

    pub fn set_lsn(&self, lsn: u64) {
        let mut data = self.page.data_mut();
        let payload = &mut data[PAGE_HDR_LEN..];
        payload[LSN_OFFSET..LSN_OFFSET + 8].copy_from_slice(&lsn.to_le_bytes());
        drop(data);
        self.page.set_dirty(true);
    }

    pub fn descriptor(&self, slot: usize) -> DbDescriptor {
        debug_assert!(slot < MAX_DATABASES);
        let data = self.page.data();
        let desc = &data[PAGE_HDR_LEN + DESC_OFFSET + slot * DESC_LEN..];
        DbDescriptor {
            name: u16::from_le_bytes(desc[0..2].try_into().unwrap()),
            key_size: u16::from_le_bytes(desc[2..4].try_into().unwrap()),
            flags: u32::from_le_bytes(desc[4..8].try_into().unwrap()),
            root: u64::from_le_bytes(desc[8..16].try_into().unwrap()),
        }
    }

    pub fn set_descriptor(&self, slot: usize, descriptor: &DbDescriptor) {
        debug_assert!(slot < MAX_DATABASES);
        let mut data = self.page.data_mut();
        let desc = &mut data[PAGE_HDR_LEN + DESC_OFFSET + slot * DESC_LEN..];
        desc[0..2].copy_from_slice(&descriptor.name.to_le_bytes());
        desc[2..4].copy_from_slice(&descriptor.key_size.to_le_bytes());
        desc[4..8].copy_from_slice(&descriptor.flags.to_le_bytes());
        desc[8..16].copy_from_slice(&descriptor.root.to_le_bytes());
        drop(data);
        self.page.set_dirty(true);
    }

    pub fn find_db(&self, name: u16) -> Option<(usize, DbDescriptor)> {
        (0..MAX_DATABASES)
            .map(|slot| (slot, self.descriptor(slot)))
            .find(|(_, desc)| desc.name == name)
    }

    pub fn free_slot(&self) -> Option<usize> {
        (0..MAX_DATABASES).find(|&slot| self.descriptor(slot).name == 0)
    }
}
