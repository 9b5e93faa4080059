//! Intel HEX record writer (spec §4.8 "A1 Intel-HEX Writer").
//!
//! Buffers up to [`HexWriter::DEFAULT_RECORD_LEN`] bytes per data record.
//! On [`HexWriter::set_address`], flushes the buffer and, if the target
//! address's high 16 bits differ from the currently emitted extended
//! linear base, writes an Extended Linear Address record before resuming.
//! [`HexWriter::close`] flushes any remainder and appends the End Of File
//! record.
//!
//! Structurally this mirrors the teacher's `vexfile` crate (a struct plus
//! free `read`/`write` functions, `Read`/`Write` blanket extension traits,
//! and `*_file` convenience wrappers over `BufReader`/`BufWriter`); the
//! record format itself is rewritten after the original implementation's
//! `IhxWriter` class.

use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;

/// Intel HEX record type byte.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum RecordType {
    Data = 0x00,
    EndOfFile = 0x01,
    ExtendedLinearAddress = 0x04,
}

#[derive(thiserror::Error, Debug)]
pub enum HexError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("SetAddress called with address {0:#x} below the current write position {1:#x}")]
    NonMonotonicAddress(u32, u32),
    #[error("writer already closed")]
    AlreadyClosed,
}

type Result<T> = std::result::Result<T, HexError>;

fn checksum(length: u8, addr: u16, rec_type: RecordType, data: &[u8]) -> u8 {
    let mut sum: u32 = length as u32;
    sum += (addr >> 8) as u32;
    sum += (addr & 0xFF) as u32;
    sum += rec_type as u32;
    for &b in data {
        sum += b as u32;
    }
    (0x100u32.wrapping_sub(sum & 0xFF) & 0xFF) as u8
}

fn write_record<W: Write>(
    w: &mut W,
    addr: u16,
    rec_type: RecordType,
    data: &[u8],
) -> Result<()> {
    let length = data.len() as u8;
    let cksum = checksum(length, addr, rec_type, data);
    write!(w, ":{:02X}{:04X}{:02X}", length, addr, rec_type as u8)?;
    for &b in data {
        write!(w, "{:02X}", b)?;
    }
    writeln!(w, "{:02X}", cksum)?;
    Ok(())
}

/// Streaming Intel HEX writer over any [`Write`] sink.
pub struct HexWriter<W: Write> {
    inner: W,
    max_data_len: usize,
    buf: Vec<u8>,
    buf_addr: u32,
    ext_base: u32,
    has_ext_base: bool,
    closed: bool,
}

impl<W: Write> HexWriter<W> {
    pub const DEFAULT_RECORD_LEN: usize = 16;

    pub fn new(inner: W) -> Self {
        Self::with_record_len(inner, Self::DEFAULT_RECORD_LEN)
    }

    pub fn with_record_len(inner: W, max_data_len: usize) -> Self {
        HexWriter {
            inner,
            max_data_len: max_data_len.clamp(1, 255),
            buf: Vec::new(),
            buf_addr: 0,
            ext_base: 0,
            has_ext_base: false,
            closed: false,
        }
    }

    /// Moves the write cursor to `addr`, flushing any buffered bytes at
    /// the old position first. Rejects addresses below the current
    /// cursor (spec §4.8 "rejects non-monotonic SetAddress calls").
    pub fn set_address(&mut self, addr: u32) -> Result<()> {
        self.ensure_open()?;
        if !self.buf.is_empty() && addr < self.buf_addr {
            return Err(HexError::NonMonotonicAddress(addr, self.buf_addr));
        }
        self.flush_buffer()?;
        if addr < self.buf_addr {
            return Err(HexError::NonMonotonicAddress(addr, self.buf_addr));
        }
        self.buf_addr = addr;
        self.maybe_emit_extended_address()?;
        Ok(())
    }

    /// Appends a single byte at the current cursor, flushing a full
    /// record first if the buffer has reached its configured capacity.
    pub fn write_byte(&mut self, byte: u8) -> Result<()> {
        self.ensure_open()?;
        if self.buf.len() == self.max_data_len {
            self.flush_buffer()?;
        }
        self.buf.push(byte);
        Ok(())
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) -> Result<()> {
        for &b in bytes {
            self.write_byte(b)?;
        }
        Ok(())
    }

    fn maybe_emit_extended_address(&mut self) -> Result<()> {
        let high = self.buf_addr >> 16;
        if !self.has_ext_base || high != self.ext_base {
            write_record(
                &mut self.inner,
                0,
                RecordType::ExtendedLinearAddress,
                &[(high >> 8) as u8, (high & 0xFF) as u8],
            )?;
            self.ext_base = high;
            self.has_ext_base = true;
        }
        Ok(())
    }

    fn flush_buffer(&mut self) -> Result<()> {
        if self.buf.is_empty() {
            return Ok(());
        }
        let low16 = (self.buf_addr & 0xFFFF) as u16;
        write_record(&mut self.inner, low16, RecordType::Data, &self.buf)?;
        self.buf_addr += self.buf.len() as u32;
        self.buf.clear();
        Ok(())
    }

    /// Flushes any remainder and writes the End Of File record. Further
    /// writes fail with [`HexError::AlreadyClosed`].
    pub fn close(&mut self) -> Result<()> {
        self.ensure_open()?;
        self.flush_buffer()?;
        write_record(&mut self.inner, 0, RecordType::EndOfFile, &[])?;
        self.closed = true;
        self.inner.flush()?;
        Ok(())
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed {
            Err(HexError::AlreadyClosed)
        } else {
            Ok(())
        }
    }
}

impl<W: Write> Drop for HexWriter<W> {
    fn drop(&mut self) {
        if !self.closed {
            let _ = self.close();
        }
    }
}

/// One contiguous block of bytes destined for an absolute target address;
/// the shape `stasm`'s code emitter hands to [`write_image`].
#[derive(Debug)]
pub struct Segment {
    pub address: u32,
    pub data: Vec<u8>,
}

/// Writes a full set of segments, in increasing address order, as a
/// single Intel HEX stream and closes it.
pub fn write_image<W: Write>(inner: W, segments: &[Segment]) -> Result<()> {
    let mut writer = HexWriter::new(inner);
    let mut ordered: Vec<&Segment> = segments.iter().collect();
    ordered.sort_by_key(|s| s.address);
    for seg in ordered {
        writer.set_address(seg.address)?;
        writer.write_bytes(&seg.data)?;
    }
    writer.close()
}

pub fn write_image_file<P: AsRef<Path>>(path: P, segments: &[Segment]) -> Result<()> {
    write_image(BufWriter::new(File::create(path)?), segments)
}

#[cfg(test)]
mod test {
    use super::*;

    fn lines(bytes: &[u8]) -> Vec<String> {
        String::from_utf8(bytes.to_vec())
            .unwrap()
            .lines()
            .map(String::from)
            .collect()
    }

    #[test]
    fn single_short_record_checksum() {
        let mut buf = Vec::new();
        {
            let mut w = HexWriter::new(&mut buf);
            w.set_address(0).unwrap();
            w.write_bytes(&[0x02, 0x00, 0x02, 0x36, 0x78]).unwrap();
            w.close().unwrap();
        }
        let out = lines(&buf);
        assert_eq!(out[0], ":020000040000FA");
        assert_eq!(out[1], ":05000000020002367849");
        assert_eq!(out[2], ":00000001FF");
    }

    #[test]
    fn extended_linear_address_emitted_once_per_bank() {
        let mut buf = Vec::new();
        {
            let mut w = HexWriter::new(&mut buf);
            w.set_address(0x1_0000).unwrap();
            w.write_byte(0xAA).unwrap();
            w.close().unwrap();
        }
        let out = lines(&buf);
        assert_eq!(out[0], ":020000040001F9");
    }

    #[test]
    fn record_splits_at_configured_length() {
        let mut buf = Vec::new();
        {
            let mut w = HexWriter::with_record_len(&mut buf, 4);
            w.set_address(0).unwrap();
            w.write_bytes(&[1, 2, 3, 4, 5, 6]).unwrap();
            w.close().unwrap();
        }
        let out = lines(&buf);
        // extended addr + two data records (4 bytes, then 2) + EOF
        assert_eq!(out.len(), 4);
        assert!(out[1].starts_with(":04000000"));
        assert!(out[2].starts_with(":0200040005"));
    }

    #[test]
    fn non_monotonic_set_address_is_rejected() {
        let mut buf = Vec::new();
        let mut w = HexWriter::new(&mut buf);
        w.set_address(10).unwrap();
        w.write_byte(1).unwrap();
        assert!(w.set_address(5).is_err());
    }
}
