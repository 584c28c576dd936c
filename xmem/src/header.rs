//! On-disk stream header layout.

use static_assertions::const_assert_eq;
use zerocopy::byteorder::{I64, U32, U64};
use zerocopy::{AsBytes, FromBytes, FromZeroes, LittleEndian, Unaligned};

/// Magic tag identifying a stream file, ASCII `"TPST"` read little-endian.
pub const MAGIC: u32 = 0x5453_5354;

/// The only header version this crate writes or accepts.
pub const VERSION: u32 = 2;

/// Stream implementation kind, recorded in the header for diagnostic
/// purposes; this crate only ever writes [`StreamKind::File`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum StreamKind {
    File = 0,
}

/// Fixed-size header written at the start of every stream file.
///
/// Field order and sizes match the wire format exactly; this struct is
/// transmuted directly to and from the first `size_of::<StreamHeader>()`
/// bytes of the file, so it must never be reordered without bumping
/// [`VERSION`].
#[derive(Debug, Clone, Copy, AsBytes, FromBytes, FromZeroes, Unaligned)]
#[repr(C)]
pub struct StreamHeader {
    pub magic: U32<LittleEndian>,
    pub version: U32<LittleEndian>,
    pub kind: U32<LittleEndian>,
    pub header_length: U32<LittleEndian>,
    pub item_size: U64<LittleEndian>,
    pub os_block_size: U64<LittleEndian>,
    pub block_size: U64<LittleEndian>,
    pub logical_eof: I64<LittleEndian>,
}

const_assert_eq!(std::mem::size_of::<StreamHeader>(), 48);

impl StreamHeader {
    pub fn new(item_size: u64, os_block_size: u64, block_size: u64) -> Self {
        StreamHeader {
            magic: U32::new(MAGIC),
            version: U32::new(VERSION),
            kind: U32::new(StreamKind::File as u32),
            header_length: U32::new(std::mem::size_of::<StreamHeader>() as u32),
            item_size: U64::new(item_size),
            os_block_size: U64::new(os_block_size),
            block_size: U64::new(block_size),
            logical_eof: I64::new(0),
        }
    }

    /// Validates this header against the caller's expectations for a stream
    /// it is about to use as `item_size`/`os_block_size`. Returns `Ok(())`
    /// if the header is self-consistent and matches.
    pub fn validate(&self, expected_item_size: u64, expected_os_block_size: u64) -> Result<(), String> {
        if self.magic.get() != MAGIC {
            return Err(format!("bad magic: {:#x}", self.magic.get()));
        }
        if self.version.get() != VERSION {
            return Err(format!("unsupported version: {}", self.version.get()));
        }
        if self.header_length.get() as usize != std::mem::size_of::<StreamHeader>() {
            return Err(format!(
                "bad header length: {} (expected {})",
                self.header_length.get(),
                std::mem::size_of::<StreamHeader>()
            ));
        }
        if self.item_size.get() != expected_item_size {
            return Err(format!(
                "item size mismatch: stream has {}, caller expects {}",
                self.item_size.get(),
                expected_item_size
            ));
        }
        if self.os_block_size.get() != expected_os_block_size {
            return Err(format!(
                "OS block size mismatch: stream has {}, host has {}",
                self.os_block_size.get(),
                expected_os_block_size
            ));
        }
        if self.logical_eof.get() < 0 {
            return Err(format!("negative logical EOF: {}", self.logical_eof.get()));
        }
        Ok(())
    }

    pub fn data_start(&self) -> u64 {
        let block_size = self.block_size.get().max(1);
        let header_length = self.header_length.get() as u64;
        (header_length + block_size - 1) / block_size * block_size
    }

    pub fn logical_eof(&self) -> u64 {
        self.logical_eof.get() as u64
    }

    pub fn set_logical_eof(&mut self, n: u64) {
        self.logical_eof.set(n as i64);
    }

    pub fn item_size(&self) -> u64 {
        self.item_size.get()
    }

    pub fn block_size(&self) -> u64 {
        self.block_size.get()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_round_trips_through_bytes() {
        let h = StreamHeader::new(24, 4096, 4096);
        let bytes = h.as_bytes().to_vec();
        let h2 = StreamHeader::read_from(bytes.as_slice()).unwrap();
        assert_eq!(h2.magic.get(), MAGIC);
        assert_eq!(h2.item_size.get(), 24);
        h2.validate(24, 4096).unwrap();
    }

    #[test]
    fn rejects_item_size_mismatch() {
        let h = StreamHeader::new(24, 4096, 4096);
        assert!(h.validate(4, 4096).is_err());
    }

    #[test]
    fn data_start_is_block_aligned() {
        let h = StreamHeader::new(8, 4096, 4096);
        assert_eq!(h.data_start() % 4096, 0);
        assert!(h.data_start() >= h.header_length.get() as u64);
    }
}
