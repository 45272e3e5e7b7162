use std::vec::Vec;

use embedded_io::ErrorKind;
use embedded_io_async::{ErrorType, Read, Seek, SeekFrom};

/// File on removable storage, with injectable transient failures.
pub struct MockFile {
    data: Vec<u8>,
    position: u64,
    pub fail_seeks: usize,
    pub fail_reads: usize,
}

impl MockFile {
    pub fn new(data: Vec<u8>) -> Self {
        MockFile {
            data,
            position: 0,
            fail_seeks: 0,
            fail_reads: 0,
        }
    }
}

fn take(counter: &mut usize) -> bool {
    if *counter > 0 {
        *counter -= 1;
        true
    } else {
        false
    }
}

impl ErrorType for MockFile {
    type Error = ErrorKind;
}

impl Read for MockFile {
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize, Self::Error> {
        if take(&mut self.fail_reads) {
            return Err(ErrorKind::Other);
        }

        let start = (self.position as usize).min(self.data.len());
        let len = buf.len().min(self.data.len() - start);
        buf[..len].copy_from_slice(&self.data[start..start + len]);
        self.position += len as u64;
        Ok(len)
    }
}

impl Seek for MockFile {
    async fn seek(&mut self, pos: SeekFrom) -> Result<u64, Self::Error> {
        if take(&mut self.fail_seeks) {
            return Err(ErrorKind::Other);
        }

        let position = match pos {
            SeekFrom::Start(offset) => Some(offset),
            SeekFrom::End(offset) => (self.data.len() as u64).checked_add_signed(offset),
            SeekFrom::Current(offset) => self.position.checked_add_signed(offset),
        };
        self.position = position.ok_or(ErrorKind::InvalidInput)?;
        Ok(self.position)
    }
}
