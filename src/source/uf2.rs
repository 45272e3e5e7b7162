//! UF2 record layout.
//!
//! Every 512 byte record carries 256 bytes of payload destined for `target_addr`,
//! so a UF2 file is twice the size of the image.
//! Only sequential files are supported: the records must follow each other in address order without gaps.

use zerocopy::byteorder::little_endian::U32;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

#[derive(Clone, Debug, IntoBytes, FromBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct Uf2Record {
    pub magic_start0: U32,
    pub magic_start1: U32,
    pub flags: U32,
    pub target_addr: U32,
    pub payload_size: U32,
    pub block_no: U32,
    pub num_blocks: U32,
    /// File size or family ID, depending on `flags`.
    pub file_size: U32,
    pub data: [u8; 476],
    pub magic_end: U32,
}

const _: () = assert!(core::mem::size_of::<Uf2Record>() == Uf2Record::SIZE);

impl Uf2Record {
    pub const SIZE: usize = 512;
    /// Payload bytes per record. Records declaring another size are rejected.
    pub const PAYLOAD_SIZE: usize = 256;

    pub const MAGIC_START0: u32 = 0x0A32_4655;
    pub const MAGIC_START1: u32 = 0x9E5D_5157;
    pub const MAGIC_END: u32 = 0x0AB1_6F30;

    pub fn has_valid_magic(&self) -> bool {
        self.magic_start0.get() == Self::MAGIC_START0
            && self.magic_start1.get() == Self::MAGIC_START1
            && self.magic_end.get() == Self::MAGIC_END
    }

    pub fn payload(&self) -> &[u8] {
        &self.data[..Self::PAYLOAD_SIZE]
    }

    /// Record `block_no` out of `num_blocks`, holding `payload` for `target_addr`.
    #[cfg(test)]
    pub fn build(target_addr: u32, block_no: u32, num_blocks: u32, payload: &[u8]) -> Self {
        use zerocopy::FromZeros;

        let mut record = Self::new_zeroed();
        record.magic_start0.set(Self::MAGIC_START0);
        record.magic_start1.set(Self::MAGIC_START1);
        record.flags.set(0x0000_2000);
        record.target_addr.set(target_addr);
        record.payload_size.set(Self::PAYLOAD_SIZE as u32);
        record.block_no.set(block_no);
        record.num_blocks.set(num_blocks);
        record.file_size.set(0xE48B_FF56);
        record.data[..payload.len()].copy_from_slice(payload);
        record.magic_end.set(Self::MAGIC_END);
        record
    }
}
