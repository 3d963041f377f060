//! Persistence of a compiled program: the used prefix of the code store
//! and string pool behind a small checksummed header.
//!
//! Layout, all little-endian:
//! ```text
//! magic "MCBI" | version u16 | code_len u16 | str_len u16
//! | code bytes | pool bytes | checksum u32
//! ```

use mcbcore::codestore::CodeStore;
use mcbcore::strpool::StringPool;
use mcbcore::system::System;
use std::io::{self, Write};

const MAGIC: &[u8; 4] = b"MCBI";
const VERSION: u16 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageError {
    InvalidFileFormat,
    UnexpectedEof,
    BadChecksum,
    TooLarge,
}

impl std::fmt::Display for ImageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ImageError::InvalidFileFormat => write!(f, "Invalid image format"),
            ImageError::UnexpectedEof => write!(f, "Unexpected end of image"),
            ImageError::BadChecksum => write!(f, "Image checksum mismatch"),
            ImageError::TooLarge => write!(f, "Image larger than the configured memories"),
        }
    }
}

impl std::error::Error for ImageError {}

fn checksum(code: &[u8], pool: &[u8]) -> u32 {
    let mut sum = 0u32;
    for byte in code.iter().chain(pool.iter()) {
        sum = sum.wrapping_add(*byte as u32);
    }
    sum
}

pub fn save(sys: &System, out: &mut dyn Write) -> io::Result<()> {
    let code = sys.code.as_bytes();
    let pool = sys.strings.as_bytes();
    out.write_all(MAGIC)?;
    out.write_all(&VERSION.to_le_bytes())?;
    out.write_all(&(code.len() as u16).to_le_bytes())?;
    out.write_all(&(pool.len() as u16).to_le_bytes())?;
    out.write_all(code)?;
    out.write_all(pool)?;
    out.write_all(&checksum(code, pool).to_le_bytes())
}

/// Rebuild the code store and string pool from a saved image.
pub fn load(bytes: &[u8]) -> Result<(CodeStore, StringPool), ImageError> {
    if bytes.len() < 10 {
        return Err(ImageError::UnexpectedEof);
    }
    if &bytes[0..4] != MAGIC {
        return Err(ImageError::InvalidFileFormat);
    }
    let version = u16::from_le_bytes([bytes[4], bytes[5]]);
    if version != VERSION {
        return Err(ImageError::InvalidFileFormat);
    }
    let code_len = u16::from_le_bytes([bytes[6], bytes[7]]) as usize;
    let str_len = u16::from_le_bytes([bytes[8], bytes[9]]) as usize;
    let expected = 10 + code_len + str_len + 4;
    if bytes.len() < expected {
        return Err(ImageError::UnexpectedEof);
    }
    let code = &bytes[10..10 + code_len];
    let pool = &bytes[10 + code_len..10 + code_len + str_len];
    let stored = u32::from_le_bytes([
        bytes[expected - 4],
        bytes[expected - 3],
        bytes[expected - 2],
        bytes[expected - 1],
    ]);
    if stored != checksum(code, pool) {
        return Err(ImageError::BadChecksum);
    }
    let code = CodeStore::from_bytes(code.to_vec()).map_err(|_| ImageError::TooLarge)?;
    let pool = StringPool::from_bytes(pool.to_vec()).map_err(|_| ImageError::TooLarge)?;
    Ok((code, pool))
}
