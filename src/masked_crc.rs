use std::fmt::{self, Debug};

/// A CRC-32C (Castagnoli) checksum after the TFRecord masking transform. Storing CRCs of data
/// that itself contains CRCs is fragile, so TFRecord rotates and offsets each one.
#[derive(Copy, Clone, PartialEq, Eq, Hash)]
pub struct MaskedCrc(pub u32);

// Hex is easier to compare against other tooling's output.
impl Debug for MaskedCrc {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "MaskedCrc({:#010x?})", self.0)
    }
}

const CRC_MASK_DELTA: u32 = 0xa282ead8;

fn mask(crc: u32) -> MaskedCrc {
    MaskedCrc(((crc >> 15) | (crc << 17)).wrapping_add(CRC_MASK_DELTA))
}

impl MaskedCrc {
    /// Computes a masked CRC-32C checksum for the given data.
    pub fn compute(bytes: &[u8]) -> Self {
        mask(crc::crc32::checksum_castagnoli(bytes))
    }
}
