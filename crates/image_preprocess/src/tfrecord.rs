//! TFRecord shard framing.
//!
//! Each record is `u64 len | u32 masked_crc(len) | data | u32 masked_crc(data)`,
//! all little-endian, with CRC32C checksums.

use crate::types::{PreprocessError, PreprocessResult};
use bytes::Bytes;
use std::fs::File;
use std::io::{BufReader, BufWriter, ErrorKind, Read, Write};
use std::path::{Path, PathBuf};

const MASK_DELTA: u32 = 0xa282_ead8;
const HEADER_LEN: usize = 12;
/// Upper bound on a single record; anything larger is treated as corruption.
pub const MAX_RECORD_BYTES: u64 = 1 << 30;

pub fn masked_crc32c(data: &[u8]) -> u32 {
    let crc = crc32c::crc32c(data);
    ((crc >> 15) | (crc << 17)).wrapping_add(MASK_DELTA)
}

pub struct RecordReader<R> {
    inner: R,
    path: PathBuf,
    records: u64,
}

impl RecordReader<BufReader<File>> {
    pub fn open(path: &Path) -> PreprocessResult<Self> {
        let file = File::open(path).map_err(|source| PreprocessError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(Self::new(BufReader::new(file), path))
    }
}

impl<R: Read> RecordReader<R> {
    pub fn new(inner: R, path: &Path) -> Self {
        Self {
            inner,
            path: path.to_path_buf(),
            records: 0,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn records_read(&self) -> u64 {
        self.records
    }

    /// Next record payload, or `None` at a clean end of file.
    pub fn read_record(&mut self) -> PreprocessResult<Option<Bytes>> {
        let mut header = [0u8; HEADER_LEN];
        match self.read_full(&mut header)? {
            0 => return Ok(None),
            HEADER_LEN => {}
            n => return Err(self.corrupt(format!("truncated header ({n} of {HEADER_LEN} bytes)"))),
        }
        let mut len_bytes = [0u8; 8];
        len_bytes.copy_from_slice(&header[..8]);
        let mut crc_bytes = [0u8; 4];
        crc_bytes.copy_from_slice(&header[8..]);
        if masked_crc32c(&len_bytes) != u32::from_le_bytes(crc_bytes) {
            return Err(self.corrupt("length checksum mismatch".to_string()));
        }
        let len = u64::from_le_bytes(len_bytes);
        if len > MAX_RECORD_BYTES {
            return Err(self.corrupt(format!("record length {len} exceeds limit")));
        }

        let mut data = vec![0u8; len as usize];
        if self.read_full(&mut data)? != data.len() {
            return Err(self.corrupt("truncated payload".to_string()));
        }
        let mut footer = [0u8; 4];
        if self.read_full(&mut footer)? != footer.len() {
            return Err(self.corrupt("truncated payload checksum".to_string()));
        }
        if masked_crc32c(&data) != u32::from_le_bytes(footer) {
            return Err(self.corrupt("payload checksum mismatch".to_string()));
        }
        self.records += 1;
        Ok(Some(Bytes::from(data)))
    }

    fn read_full(&mut self, buf: &mut [u8]) -> PreprocessResult<usize> {
        let mut filled = 0;
        while filled < buf.len() {
            match self.inner.read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(source) => {
                    return Err(PreprocessError::Io {
                        path: self.path.clone(),
                        source,
                    })
                }
            }
        }
        Ok(filled)
    }

    fn corrupt(&self, msg: String) -> PreprocessError {
        PreprocessError::CorruptRecord {
            path: self.path.clone(),
            records: self.records,
            msg,
        }
    }
}

impl<R: Read> Iterator for RecordReader<R> {
    type Item = PreprocessResult<Bytes>;

    fn next(&mut self) -> Option<Self::Item> {
        self.read_record().transpose()
    }
}

pub struct RecordWriter<W: Write> {
    inner: W,
    path: PathBuf,
    records: u64,
}

impl RecordWriter<BufWriter<File>> {
    pub fn create(path: &Path) -> PreprocessResult<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|source| PreprocessError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        let file = File::create(path).map_err(|source| PreprocessError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(Self::new(BufWriter::new(file), path))
    }
}

impl<W: Write> RecordWriter<W> {
    pub fn new(inner: W, path: &Path) -> Self {
        Self {
            inner,
            path: path.to_path_buf(),
            records: 0,
        }
    }

    pub fn write_record(&mut self, data: &[u8]) -> PreprocessResult<()> {
        let len = (data.len() as u64).to_le_bytes();
        let mut frame = Vec::with_capacity(HEADER_LEN + data.len() + 4);
        frame.extend_from_slice(&len);
        frame.extend_from_slice(&masked_crc32c(&len).to_le_bytes());
        frame.extend_from_slice(data);
        frame.extend_from_slice(&masked_crc32c(data).to_le_bytes());
        self.inner.write_all(&frame).map_err(|source| self.io(source))?;
        self.records += 1;
        Ok(())
    }

    pub fn records_written(&self) -> u64 {
        self.records
    }

    pub fn flush(&mut self) -> PreprocessResult<()> {
        self.inner.flush().map_err(|source| self.io(source))
    }

    /// Flushes and returns the underlying writer.
    pub fn finish(mut self) -> PreprocessResult<W> {
        self.flush()?;
        Ok(self.inner)
    }

    fn io(&self, source: std::io::Error) -> PreprocessError {
        PreprocessError::Io {
            path: self.path.clone(),
            source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn framed(records: &[&[u8]]) -> Vec<u8> {
        let mut w = RecordWriter::new(Vec::new(), Path::new("mem"));
        for r in records {
            w.write_record(r).unwrap();
        }
        w.finish().unwrap()
    }

    #[test]
    fn known_checksum() {
        // crc32c("") == 0, so the masked value is just the delta.
        assert_eq!(masked_crc32c(b""), MASK_DELTA);
    }

    #[test]
    fn reads_back_every_record() {
        let buf = framed(&[b"alpha", b"", b"gamma"]);
        let reader = RecordReader::new(Cursor::new(buf), Path::new("mem"));
        let got: Vec<Bytes> = reader.collect::<PreprocessResult<_>>().unwrap();
        assert_eq!(
            got,
            vec![
                Bytes::from_static(b"alpha"),
                Bytes::new(),
                Bytes::from_static(b"gamma")
            ]
        );
    }

    #[test]
    fn detects_flipped_payload_bit() {
        let mut buf = framed(&[b"payload"]);
        buf[HEADER_LEN + 2] ^= 0x01;
        let mut reader = RecordReader::new(Cursor::new(buf), Path::new("mem"));
        assert!(matches!(
            reader.read_record(),
            Err(PreprocessError::CorruptRecord { .. })
        ));
    }

    #[test]
    fn detects_truncation() {
        let buf = framed(&[b"payload"]);
        let cut = buf[..buf.len() - 3].to_vec();
        let mut reader = RecordReader::new(Cursor::new(cut), Path::new("mem"));
        assert!(reader.read_record().is_err());

        let mut reader = RecordReader::new(Cursor::new(vec![1u8, 2, 3]), Path::new("mem"));
        assert!(reader.read_record().is_err());
    }

    #[test]
    fn empty_input_is_clean_eof() {
        let mut reader = RecordReader::new(Cursor::new(Vec::new()), Path::new("mem"));
        assert!(reader.read_record().unwrap().is_none());
        assert_eq!(reader.records_read(), 0);
    }
}
