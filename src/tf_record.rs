//! TFRecord framing: a little-endian length, a masked CRC of that length, the payload, and a
//! masked CRC of the payload.

use std::io::{self, Read, Write};

use byteorder::{ByteOrder, LittleEndian, WriteBytesExt};

use crate::masked_crc::MaskedCrc;
use crate::reader::ReadError;

/// Length of the record header: `u64` length followed by its `u32` masked CRC.
pub const HEADER_LENGTH: usize = 12;

/// Length of the record footer: the `u32` masked CRC of the payload.
pub const FOOTER_LENGTH: usize = 4;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TfRecord {
    pub data: Vec<u8>,
    pub data_crc: MaskedCrc,
}

impl TfRecord {
    /// Wraps a payload, computing its checksum.
    pub fn from_data(data: Vec<u8>) -> Self {
        let data_crc = MaskedCrc::compute(&data);
        Self { data, data_crc }
    }

    /// Total number of bytes this record occupies on the wire.
    pub fn encoded_len(&self) -> usize {
        HEADER_LENGTH + self.data.len() + FOOTER_LENGTH
    }

    /// Writes the framed record. The whole record is assembled first so that the underlying
    /// writer sees a single `write_all`.
    pub fn write<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        let mut buf = Vec::with_capacity(self.encoded_len());
        let len = self.data.len() as u64;
        buf.write_u64::<LittleEndian>(len)?;
        let len_crc = MaskedCrc::compute(&buf[..8]);
        buf.write_u32::<LittleEndian>(len_crc.0)?;
        buf.extend_from_slice(&self.data);
        buf.write_u32::<LittleEndian>(self.data_crc.0)?;
        writer.write_all(&buf)
    }

    /// Reads one record, validating both checksums. Returns `Ok(None)` on a clean end of stream
    /// (no bytes at all before EOF).
    pub fn read<R: Read>(reader: &mut R) -> Result<Option<Self>, ReadError> {
        let mut header = [0u8; HEADER_LENGTH];
        match read_fully(reader, &mut header)? {
            0 => return Ok(None),
            HEADER_LENGTH => (),
            _ => return Err(ReadError::Truncated),
        }

        let len_crc_expected = MaskedCrc(LittleEndian::read_u32(&header[8..]));
        let len_crc_actual = MaskedCrc::compute(&header[..8]);
        if len_crc_expected != len_crc_actual {
            return Err(ReadError::BadLengthCrc {
                expected: len_crc_expected,
                actual: len_crc_actual,
            });
        }
        let len = LittleEndian::read_u64(&header[..8]);

        // `take` keeps a corrupt-but-checksummed length from driving a huge allocation up front.
        let mut data = Vec::new();
        reader.by_ref().take(len).read_to_end(&mut data)?;
        if data.len() as u64 != len {
            return Err(ReadError::Truncated);
        }

        let mut footer = [0u8; FOOTER_LENGTH];
        if read_fully(reader, &mut footer)? != FOOTER_LENGTH {
            return Err(ReadError::Truncated);
        }
        let data_crc = MaskedCrc(LittleEndian::read_u32(&footer));
        let actual = MaskedCrc::compute(&data);
        if data_crc != actual {
            return Err(ReadError::BadDataCrc {
                expected: data_crc,
                actual,
            });
        }
        Ok(Some(Self { data, data_crc }))
    }
}

/// Like `read_exact`, but reports how many bytes were read before EOF instead of failing.
fn read_fully<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}
