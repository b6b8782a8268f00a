//! Byte-stream plumbing shared by the transport engine and the compression
//! registry.
//!
//! # Design
//! Response bodies and (de)compressed payloads always land in a [`Sink`]: a
//! seekable, truncatable byte store. Callers may bring their own (a `File`, a
//! `Cursor<Vec<u8>>`, a `&mut` to either); otherwise [`scratch`] hands out a
//! spooled temporary file that stays in memory up to 256 KiB, spills to disk
//! beyond that, and is deleted when dropped.

use std::fs::File;
use std::io::{self, Cursor, Read, Seek, SeekFrom, Write};

use tempfile::SpooledTempFile;

const CHUNK_SIZE: usize = 32 * 1024;
const SPOOL_LIMIT: usize = 256 * 1024;

/// A readable, writable, seekable byte store that can be emptied in place.
pub trait Sink: Read + Write + Seek {
    /// Discard all content and rewind to offset 0.
    fn truncate(&mut self) -> io::Result<()>;

    /// Total length in bytes. Leaves the position at the end of the stream.
    fn size(&mut self) -> io::Result<u64> {
        self.seek(SeekFrom::End(0))
    }
}

impl Sink for File {
    fn truncate(&mut self) -> io::Result<()> {
        self.set_len(0)?;
        self.rewind()
    }
}

impl Sink for Cursor<Vec<u8>> {
    fn truncate(&mut self) -> io::Result<()> {
        self.get_mut().clear();
        self.set_position(0);
        Ok(())
    }
}

impl Sink for SpooledTempFile {
    fn truncate(&mut self) -> io::Result<()> {
        self.set_len(0)?;
        self.rewind()
    }
}

impl<S: Sink + ?Sized> Sink for &mut S {
    fn truncate(&mut self) -> io::Result<()> {
        (**self).truncate()
    }
}

/// Allocate a disposable sink owned by the caller.
pub fn scratch() -> SpooledTempFile {
    tempfile::spooled_tempfile(SPOOL_LIMIT)
}

/// Copy `source` into `destination` in 32 KiB chunks, flush, and rewind the
/// destination to offset 0. Returns the number of bytes copied.
pub fn transfer<R, W>(source: &mut R, destination: &mut W) -> io::Result<u64>
where
    R: Read + ?Sized,
    W: Write + Seek + ?Sized,
{
    let mut buffer = vec![0u8; CHUNK_SIZE];
    let mut total = 0u64;
    loop {
        let read = match source.read(&mut buffer) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        destination.write_all(&buffer[..read])?;
        total += read as u64;
    }
    destination.flush()?;
    destination.rewind()?;
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transfer_counts_and_rewinds() {
        let data: Vec<u8> = (0..100_000u32).map(|i| (i % 251) as u8).collect();
        let mut sink = Cursor::new(Vec::new());
        let copied = transfer(&mut data.as_slice(), &mut sink).unwrap();
        assert_eq!(copied, data.len() as u64);
        assert_eq!(sink.position(), 0);
        assert_eq!(sink.get_ref(), &data);
    }

    #[test]
    fn transfer_of_empty_source() {
        let mut sink = Cursor::new(Vec::new());
        assert_eq!(transfer(&mut io::empty(), &mut sink).unwrap(), 0);
        assert!(sink.get_ref().is_empty());
    }

    #[test]
    fn scratch_spills_past_the_spool_limit() {
        let data = vec![7u8; SPOOL_LIMIT + 1];
        let mut sink = scratch();
        transfer(&mut data.as_slice(), &mut sink).unwrap();
        assert!(sink.is_rolled());
        let mut back = Vec::new();
        sink.read_to_end(&mut back).unwrap();
        assert_eq!(back, data);
    }

    #[test]
    fn truncate_empties_every_sink() {
        let mut cursor = Cursor::new(b"abc".to_vec());
        cursor.seek(SeekFrom::End(0)).unwrap();
        Sink::truncate(&mut cursor).unwrap();
        assert_eq!(cursor.position(), 0);
        assert_eq!(Sink::size(&mut cursor).unwrap(), 0);

        let mut spooled = scratch();
        spooled.write_all(b"abc").unwrap();
        Sink::truncate(&mut spooled).unwrap();
        assert_eq!(Sink::size(&mut spooled).unwrap(), 0);

        let mut file = tempfile::tempfile().unwrap();
        file.write_all(b"abc").unwrap();
        let mut borrowed = &mut file;
        Sink::truncate(&mut borrowed).unwrap();
        assert_eq!(Sink::size(&mut file).unwrap(), 0);
    }
}
