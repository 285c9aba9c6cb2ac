//! Builds the initial allocation bitset for a freshly opened export.
//!
//! Walking the exact physical extent map (`FIEMAP`) is a filesystem
//! detail this crate deliberately stays abstract over: `ExtentSource` is
//! the seam a real implementation would plug a `FIEMAP` walker into.
//! The fallback here uses `fstat`'s block count, which is enough to
//! answer the one question the write path needs before its first write
//! to any given block: "might this already be allocated?" A `false`
//! answer is always safe — it just costs an extra zero-check on the
//! first write to that block instead of skipping straight to marking it
//! allocated.

use crate::bitset::Bitset;
use std::fs::File;
use std::os::unix::fs::MetadataExt;

/// A source of "this byte range is physically allocated" facts about an
/// open file.
pub trait ExtentSource {
    /// Return the allocated byte ranges of `file`, whose length is
    /// `size`.
    fn extents(&self, file: &File, size: u64) -> std::io::Result<Vec<(u64, u64)>>;
}

/// Conservative fallback: if the file has at least as many blocks on
/// disk as its logical size implies (`st_blocks * 512 >= size`), there
/// can be no holes, so the whole file is reported allocated. Otherwise
/// nothing is reported allocated and the write path discovers
/// allocation opportunistically.
pub struct StatFallbackExtentSource;

impl ExtentSource for StatFallbackExtentSource {
    fn extents(&self, file: &File, size: u64) -> std::io::Result<Vec<(u64, u64)>> {
        let meta = file.metadata()?;
        let physical_bytes = meta.blocks() * 512;
        if physical_bytes >= size {
            Ok(vec![(0, size)])
        } else {
            Ok(vec![])
        }
    }
}

/// Build an allocation bitset at `resolution`-byte granularity for
/// `file`, using `source` to learn which ranges already exist on disk.
pub fn build_allocation_bitset(
    file: &File,
    size: u64,
    resolution: u64,
    source: &dyn ExtentSource,
) -> std::io::Result<Bitset> {
    let bitset = Bitset::new(size, resolution);
    for (off, len) in source.extents(file, size)? {
        bitset.set_range(off, len);
    }
    Ok(bitset)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dense_file_is_fully_allocated() {
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        let data = vec![1u8; 8192];
        std::io::Write::write_all(tmp.as_file_mut(), &data).unwrap();
        let bitset = build_allocation_bitset(tmp.as_file(), 8192, 4096, &StatFallbackExtentSource).unwrap();
        assert!(bitset.is_set_at(0));
        assert!(bitset.is_set_at(4096));
    }

    #[test]
    fn sparse_file_starts_unallocated() {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        tmp.as_file().set_len(1 << 20).unwrap();
        let bitset = build_allocation_bitset(tmp.as_file(), 1 << 20, 4096, &StatFallbackExtentSource).unwrap();
        assert!(bitset.is_clear_at(0));
    }
}
