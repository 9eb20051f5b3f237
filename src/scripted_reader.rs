//! A `Read` implementation that hands out its input in caller-chosen chunks, for testing code
//! that must cope with short reads.

use std::collections::VecDeque;
use std::io::{self, Read};

pub struct ScriptedReader {
    chunks: VecDeque<Vec<u8>>,
}

impl ScriptedReader {
    pub fn new(chunks: Vec<Vec<u8>>) -> Self {
        Self {
            chunks: chunks.into(),
        }
    }
}

impl Read for ScriptedReader {
    /// Returns bytes from at most one chunk per call. An empty chunk is reported as an
    /// `Interrupted` error so callers' retry loops get exercised too.
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let chunk = match self.chunks.front_mut() {
            None => return Ok(0),
            Some(chunk) => chunk,
        };
        if chunk.is_empty() {
            self.chunks.pop_front();
            return Err(io::Error::from(io::ErrorKind::Interrupted));
        }
        let n = buf.len().min(chunk.len());
        buf[..n].copy_from_slice(&chunk[..n]);
        chunk.drain(..n);
        if chunk.is_empty() {
            self.chunks.pop_front();
        }
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunks_and_interrupts() {
        let mut reader = ScriptedReader::new(vec![b"abc".to_vec(), vec![], b"de".to_vec()]);
        let mut buf = [0u8; 2];
        assert_eq!(reader.read(&mut buf).unwrap(), 2);
        assert_eq!(&buf, b"ab");
        assert_eq!(reader.read(&mut buf).unwrap(), 1);
        assert_eq!(&buf[..1], b"c");
        assert_eq!(
            reader.read(&mut buf).unwrap_err().kind(),
            io::ErrorKind::Interrupted
        );
        let mut rest = Vec::new();
        reader.read_to_end(&mut rest).unwrap();
        assert_eq!(rest, b"de");
    }
}
