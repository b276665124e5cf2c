//! The free-page map and its on-disk record encoding.
//!
//! Free space is an ordered map from page address to run length. Run
//! lengths fit in 4 bits (1..15); a longer logical run is stored as several
//! contiguous entries. On disk each run becomes one record:
//!
//! ```text
//! [ (run_length << 4) | n ]  [ n bytes, little-endian, address / page_size ]
//! ```
//!
//! where `n` is the minimal number of bytes needed for the page number
//! (0 <= n <= 8; zero encodes page number 0). This is a fixed-width
//! little-endian integer whose length is carried in the header nibble, not
//! a continuation varint.

use std::collections::BTreeMap;

use crate::error::{Error, Result};

/// Address -> run length in pages.
pub type FreeMap = BTreeMap<u64, u32>;

pub const MAX_RUN_LENGTH: u32 = 15;

/// Worst-case encoded size of one record: header byte plus 8 id bytes.
pub const RECORD_MAX_LEN: usize = 9;

/// A contiguous run of free pages, ready for encoding.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct FreeRun {
    pub address: u64,
    pub run_length: u32,
}

/// Encodes `value` in as few little-endian bytes as possible; returns the
/// byte count.
pub fn encode_page_number(dst: &mut [u8], mut value: u64) -> usize {
    let mut n = 0;
    while value != 0 {
        dst[n] = value as u8;
        value >>= 8;
        n += 1;
    }
    n
}

/// Decodes a little-endian integer of exactly `src.len()` bytes.
pub fn decode_page_number(src: &[u8]) -> u64 {
    src.iter()
        .rev()
        .fold(0u64, |acc, &byte| (acc << 8) | u64::from(byte))
}

/// Writes one freelist record; returns the number of bytes written.
pub fn write_record(dst: &mut [u8], page_size: u64, run: FreeRun) -> usize {
    debug_assert!(run.run_length >= 1 && run.run_length <= MAX_RUN_LENGTH);
    debug_assert_eq!(run.address % page_size, 0);
    let n = encode_page_number(&mut dst[1..], run.address / page_size);
    dst[0] = ((run.run_length as u8) << 4) | n as u8;
    n + 1
}

/// Reads one freelist record; returns the run and the bytes consumed.
pub fn read_record(src: &[u8], page_size: u64) -> Result<(FreeRun, usize)> {
    if src.is_empty() {
        return Err(Error::Corruption("truncated freelist record"));
    }
    let run_length = u32::from(src[0] >> 4);
    let n = usize::from(src[0] & 0x0f);
    if run_length == 0 {
        return Err(Error::Corruption("freelist record with zero run length"));
    }
    if n > 8 || src.len() < 1 + n {
        return Err(Error::Corruption("freelist record id out of bounds"));
    }
    let page_number = decode_page_number(&src[1..1 + n]);
    let address = page_number
        .checked_mul(page_size)
        .ok_or(Error::Corruption("freelist record address overflow"))?;
    Ok((
        FreeRun {
            address,
            run_length,
        },
        1 + n,
    ))
}

/// Collapses the map into encodable runs: adjacent entries are merged
/// opportunistically, then chopped into chunks of at most 15 pages.
pub fn coalesce(map: &FreeMap, page_size: u64) -> Vec<FreeRun> {
    let mut runs = Vec::new();
    let mut current: Option<(u64, u64)> = None; // (start, length in pages)

    let flush = |start: u64, mut length: u64, runs: &mut Vec<FreeRun>| {
        let mut address = start;
        while length > u64::from(MAX_RUN_LENGTH) {
            runs.push(FreeRun {
                address,
                run_length: MAX_RUN_LENGTH,
            });
            address += u64::from(MAX_RUN_LENGTH) * page_size;
            length -= u64::from(MAX_RUN_LENGTH);
        }
        if length > 0 {
            runs.push(FreeRun {
                address,
                run_length: length as u32,
            });
        }
    };

    for (&address, &count) in map {
        match current {
            Some((start, length)) if start + length * page_size == address => {
                current = Some((start, length + u64::from(count)));
            }
            Some((start, length)) => {
                flush(start, length, &mut runs);
                current = Some((address, u64::from(count)));
            }
            None => current = Some((address, u64::from(count))),
        }
    }
    if let Some((start, length)) = current {
        flush(start, length, &mut runs);
    }
    runs
}

/// Inserts a freed run, splitting it into map entries of at most 15 pages.
pub fn insert_run(map: &mut FreeMap, page_size: u64, address: u64, count: usize) {
    let mut address = address;
    let mut remaining = count as u64;
    while remaining > u64::from(MAX_RUN_LENGTH) {
        map.insert(address, MAX_RUN_LENGTH);
        address += u64::from(MAX_RUN_LENGTH) * page_size;
        remaining -= u64::from(MAX_RUN_LENGTH);
    }
    if remaining > 0 {
        map.insert(address, remaining as u32);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAGE_SIZE: u64 = 4096;

    #[test]
    fn page_number_codec_is_minimal() {
        let mut buf = [0u8; 8];
        assert_eq!(encode_page_number(&mut buf, 0), 0);
        assert_eq!(encode_page_number(&mut buf, 1), 1);
        assert_eq!(buf[0], 1);
        assert_eq!(encode_page_number(&mut buf, 0x1234), 2);
        assert_eq!(&buf[..2], &[0x34, 0x12]);
        assert_eq!(decode_page_number(&[0x34, 0x12]), 0x1234);
        assert_eq!(encode_page_number(&mut buf, u64::MAX), 8);
        assert_eq!(decode_page_number(&buf), u64::MAX);
    }

    #[test]
    fn record_roundtrip() {
        let mut buf = [0u8; RECORD_MAX_LEN];
        let run = FreeRun {
            address: 123 * PAGE_SIZE,
            run_length: 7,
        };
        let written = write_record(&mut buf, PAGE_SIZE, run);
        assert_eq!(written, 2);
        assert_eq!(buf[0], (7 << 4) | 1);
        let (decoded, consumed) = read_record(&buf, PAGE_SIZE).unwrap();
        assert_eq!(consumed, written);
        assert_eq!(decoded, run);
    }

    #[test]
    fn rejects_zero_run_length() {
        let buf = [0x01u8, 0x05];
        assert!(read_record(&buf, PAGE_SIZE).is_err());
    }

    #[test]
    fn coalesce_merges_adjacent_entries() {
        let mut map = FreeMap::new();
        map.insert(PAGE_SIZE, 2);
        map.insert(3 * PAGE_SIZE, 1);
        map.insert(10 * PAGE_SIZE, 1);
        let runs = coalesce(&map, PAGE_SIZE);
        assert_eq!(
            runs,
            vec![
                FreeRun {
                    address: PAGE_SIZE,
                    run_length: 3
                },
                FreeRun {
                    address: 10 * PAGE_SIZE,
                    run_length: 1
                },
            ]
        );
    }

    #[test]
    fn coalesce_chops_long_runs() {
        let mut map = FreeMap::new();
        for k in 0..20u64 {
            map.insert((1 + k) * PAGE_SIZE, 1);
        }
        let runs = coalesce(&map, PAGE_SIZE);
        assert_eq!(runs.len(), 2);
        assert_eq!(runs[0].run_length, 15);
        assert_eq!(runs[1].run_length, 5);
        assert_eq!(runs[1].address, 16 * PAGE_SIZE);
    }

    #[test]
    fn insert_run_splits_at_fifteen() {
        let mut map = FreeMap::new();
        insert_run(&mut map, PAGE_SIZE, PAGE_SIZE, 17);
        assert_eq!(map.get(&PAGE_SIZE), Some(&15));
        assert_eq!(map.get(&(16 * PAGE_SIZE)), Some(&2));
    }
}
