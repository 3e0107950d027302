//! `vectors.bin` binary format
//!
//! # File Structure
//!
//! ```text
//! Offset   Size    Type        Description
//! ─────────────────────────────────────────────
//! 0x00     8       [u8; 8]     Magic: "RAGDXV01"
//! 0x08     4       u32 LE      N: Number of records
//! 0x0C     4       u32 LE      D: Dimensions
//! 0x10     ...     records     N × { id_len: u16 LE, id: [u8; id_len],
//!                                    vector: [f32 LE; D] }
//! ```
//!
//! # Example
//!
//! ```ignore
//! let mut writer = VectorFileWriter::create("vectors.bin", 768)?;
//! writer.write_record("chunk-id", &embedding)?;
//! writer.finish()?;
//! ```

use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::Path;

use thiserror::Error;

/// Magic bytes identifying a vector file: "RAGDXV01"
pub const MAGIC: [u8; 8] = *b"RAGDXV01";

/// Header size in bytes: 8 (magic) + 4 (count) + 4 (dims) = 16
pub const HEADER_SIZE: usize = 16;

#[derive(Error, Debug)]
pub enum FormatError {
    #[error("Invalid magic bytes: expected RAGDXV01")]
    InvalidMagic,

    #[error("Dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("Record id too long: {0} bytes")]
    IdTooLong(usize),

    #[error("Record id is not valid UTF-8")]
    InvalidId,

    #[error("Trailing bytes after {0} records")]
    TrailingData(u32),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Parsed vector file header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VectorFileHeader {
    pub count: u32,
    pub dimensions: u32,
}

impl VectorFileHeader {
    /// Parse header from raw bytes (first 16 bytes of file)
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, FormatError> {
        if bytes.len() < HEADER_SIZE {
            return Err(FormatError::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "File too small for header",
            )));
        }
        if bytes[0..8] != MAGIC {
            return Err(FormatError::InvalidMagic);
        }

        let mut count = [0u8; 4];
        let mut dimensions = [0u8; 4];
        count.copy_from_slice(&bytes[8..12]);
        dimensions.copy_from_slice(&bytes[12..16]);
        Ok(Self {
            count: u32::from_le_bytes(count),
            dimensions: u32::from_le_bytes(dimensions),
        })
    }

    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0..8].copy_from_slice(&MAGIC);
        buf[8..12].copy_from_slice(&self.count.to_le_bytes());
        buf[12..16].copy_from_slice(&self.dimensions.to_le_bytes());
        buf
    }
}

/// Streaming writer; the record count is patched into the header on finish.
pub struct VectorFileWriter {
    writer: BufWriter<File>,
    dimensions: usize,
    count: u32,
}

impl VectorFileWriter {
    pub fn create<P: AsRef<Path>>(path: P, dimensions: usize) -> Result<Self, FormatError> {
        let file = File::create(path)?;
        let mut writer = BufWriter::new(file);
        let header = VectorFileHeader {
            count: 0,
            dimensions: dimensions as u32,
        };
        writer.write_all(&header.to_bytes())?;
        Ok(Self {
            writer,
            dimensions,
            count: 0,
        })
    }

    pub fn write_record(&mut self, id: &str, vector: &[f32]) -> Result<(), FormatError> {
        if vector.len() != self.dimensions {
            return Err(FormatError::DimensionMismatch {
                expected: self.dimensions,
                actual: vector.len(),
            });
        }
        let id_len = u16::try_from(id.len()).map_err(|_| FormatError::IdTooLong(id.len()))?;
        self.writer.write_all(&id_len.to_le_bytes())?;
        self.writer.write_all(id.as_bytes())?;
        for &val in vector {
            self.writer.write_all(&val.to_le_bytes())?;
        }
        self.count += 1;
        Ok(())
    }

    /// Patch the header count and fsync. Returns the number of records.
    pub fn finish(mut self) -> Result<u32, FormatError> {
        self.writer.flush()?;
        let file = self.writer.get_mut();
        file.seek(SeekFrom::Start(8))?;
        file.write_all(&self.count.to_le_bytes())?;
        file.sync_all()?;
        Ok(self.count)
    }
}

/// Read every record of a vector file.
pub fn read_vector_file<P: AsRef<Path>>(
    path: P,
) -> Result<(VectorFileHeader, Vec<(String, Vec<f32>)>), FormatError> {
    let mut reader = BufReader::new(File::open(path)?);
    read_vectors(&mut reader)
}

pub fn read_vectors<R: Read>(
    reader: &mut R,
) -> Result<(VectorFileHeader, Vec<(String, Vec<f32>)>), FormatError> {
    let mut header_bytes = [0u8; HEADER_SIZE];
    reader.read_exact(&mut header_bytes)?;
    let header = VectorFileHeader::from_bytes(&header_bytes)?;
    let dim = header.dimensions as usize;

    let mut records = Vec::with_capacity((header.count as usize).min(1 << 20));
    let mut len_buf = [0u8; 2];
    let mut val_buf = [0u8; 4];
    for _ in 0..header.count {
        reader.read_exact(&mut len_buf)?;
        let mut id = vec![0u8; u16::from_le_bytes(len_buf) as usize];
        reader.read_exact(&mut id)?;
        let id = String::from_utf8(id).map_err(|_| FormatError::InvalidId)?;

        let mut vector = Vec::with_capacity(dim);
        for _ in 0..dim {
            reader.read_exact(&mut val_buf)?;
            vector.push(f32::from_le_bytes(val_buf));
        }
        records.push((id, vector));
    }

    let mut probe = [0u8; 1];
    if reader.read(&mut probe)? != 0 {
        return Err(FormatError::TrailingData(header.count));
    }
    Ok((header, records))
}
