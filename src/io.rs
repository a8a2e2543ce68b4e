//! Seekable byte sources the container stack is built from.
//!
//! Every parser consumes a [`ByteSource`]: a seekable view over some region
//! of bytes. Sources compose: a RomFS file inside an encrypted NCA section
//! inside an XCI partition is a [`SliceSource`] over a [`CtrSource`] over a
//! [`SliceSource`] over a [`StreamSource`], and each layer can be cloned
//! into an independent cursor over the same underlying handle.

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::Path;
use std::sync::{Arc, Mutex};

use aes::Aes128;
use cipher::{KeyIvInit, StreamCipher};

use crate::crypto::{ctr_iv, AesKey, AES_BLOCK_SIZE};

/// Aligns `value` down to a power-of-two boundary.
pub const fn align_down(value: u64, align: u64) -> u64 {
    value & !(align - 1)
}

/// Aligns `value` up to a power-of-two boundary.
pub const fn align_up(value: u64, align: u64) -> u64 {
    (value + align - 1) & !(align - 1)
}

/// A seekable, cloneable view over a region of bytes.
///
/// Reads past the logical end are short; seeks are never range-checked
/// (subsequent reads clamp instead). Cloning yields an independent cursor
/// rewound to offset 0, sharing the underlying handle but owning its own
/// cipher state where applicable.
pub trait ByteSource: Read + Seek + Send {
    /// Logical size of the region this source exposes.
    fn size(&self) -> u64;

    /// Creates an independent cursor over the same bytes.
    fn clone_source(&self) -> Box<dyn ByteSource>;
}

/// Resolves a seek target against a cursor and region size.
///
/// Out-of-range targets past the end are allowed; targets before the start
/// are rejected like any other seekable stream.
fn resolve_seek(pos: u64, size: u64, target: SeekFrom) -> io::Result<u64> {
    let new_pos = match target {
        SeekFrom::Start(off) => off as i64,
        SeekFrom::Current(off) => pos as i64 + off,
        SeekFrom::End(off) => size as i64 + off,
    };
    if new_pos < 0 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "seek before start of source",
        ));
    }
    Ok(new_pos as u64)
}

/// Reads until `buf` is full or the source is exhausted.
pub(crate) fn read_to_fill<R: Read + ?Sized>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..])? {
            0 => break,
            n => filled += n,
        }
    }
    Ok(filled)
}

/// Opens a file-backed source.
pub fn open<P: AsRef<Path>>(path: P) -> io::Result<StreamSource<File>> {
    StreamSource::new(File::open(path)?)
}

/// A source backed by a shared `Read + Seek` handle.
///
/// The handle is shared across clones behind a mutex; each clone keeps its
/// own cursor, so concurrent reads racing through the one OS handle cannot
/// corrupt each other's position. The size is captured at construction via
/// seek-to-end.
pub struct StreamSource<R: Read + Seek + Send> {
    inner: Arc<Mutex<R>>,
    size: u64,
    pos: u64,
}

impl<R: Read + Seek + Send> StreamSource<R> {
    pub fn new(mut inner: R) -> io::Result<Self> {
        let size = inner.seek(SeekFrom::End(0))?;
        Ok(Self {
            inner: Arc::new(Mutex::new(inner)),
            size,
            pos: 0,
        })
    }
}

impl<R: Read + Seek + Send> Clone for StreamSource<R> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            size: self.size,
            pos: 0,
        }
    }
}

impl<R: Read + Seek + Send> Read for StreamSource<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let pos = self.pos.min(self.size);
        let len = (buf.len() as u64).min(self.size - pos) as usize;
        if len == 0 {
            return Ok(0);
        }

        let mut inner = self.inner.lock().unwrap();
        inner.seek(SeekFrom::Start(pos))?;
        let read = inner.read(&mut buf[..len]).map_err(|e| {
            tracing::warn!(pos, len, "read from backing stream failed: {e}");
            e
        })?;
        self.pos = pos + read as u64;
        Ok(read)
    }
}

impl<R: Read + Seek + Send> Seek for StreamSource<R> {
    fn seek(&mut self, target: SeekFrom) -> io::Result<u64> {
        self.pos = resolve_seek(self.pos, self.size, target)?;
        Ok(self.pos)
    }
}

impl<R: Read + Seek + Send + 'static> ByteSource for StreamSource<R> {
    fn size(&self) -> u64 {
        self.size
    }

    fn clone_source(&self) -> Box<dyn ByteSource> {
        Box::new(self.clone())
    }
}

/// A fixed window `[offset, offset + size)` over an inner source.
pub struct SliceSource {
    base: Box<dyn ByteSource>,
    offset: u64,
    size: u64,
    pos: u64,
}

impl SliceSource {
    pub fn new(base: Box<dyn ByteSource>, size: u64, offset: u64) -> Self {
        Self {
            base,
            offset,
            size,
            pos: 0,
        }
    }
}

impl Read for SliceSource {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let pos = self.pos.min(self.size);
        let len = (buf.len() as u64).min(self.size - pos) as usize;
        if len == 0 {
            return Ok(0);
        }

        self.base.seek(SeekFrom::Start(self.offset + pos))?;
        let read = self.base.read(&mut buf[..len])?;
        self.pos = pos + read as u64;
        Ok(read)
    }
}

impl Seek for SliceSource {
    fn seek(&mut self, target: SeekFrom) -> io::Result<u64> {
        self.pos = resolve_seek(self.pos, self.size, target)?;
        Ok(self.pos)
    }
}

impl ByteSource for SliceSource {
    fn size(&self) -> u64 {
        self.size
    }

    fn clone_source(&self) -> Box<dyn ByteSource> {
        Box::new(Self {
            base: self.base.clone_source(),
            offset: self.offset,
            size: self.size,
            pos: 0,
        })
    }
}

/// An AES-128-CTR decrypted window over an inner source.
///
/// Logical offset 0 maps to `offset` in the inner source, and the block
/// counter for a read at physical position `p` is `p / 16` combined with the
/// fixed nonce in the IV's high half. Unaligned reads fetch the enclosing
/// 16-byte blocks and return the requested window. Each clone carries its
/// own cipher material, so no lock is shared between cursors.
pub struct CtrSource {
    base: Box<dyn ByteSource>,
    key: AesKey,
    nonce: u64,
    offset: u64,
    size: u64,
    pos: u64,
}

impl CtrSource {
    pub fn new(base: Box<dyn ByteSource>, key: AesKey, nonce: u64, size: u64, offset: u64) -> Self {
        Self {
            base,
            key,
            nonce,
            offset,
            size,
            pos: 0,
        }
    }
}

impl Read for CtrSource {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let pos = self.pos.min(self.size);
        let len = (buf.len() as u64).min(self.size - pos) as usize;
        if len == 0 {
            return Ok(0);
        }

        let aligned = align_down(pos, AES_BLOCK_SIZE as u64);
        let lead = (pos - aligned) as usize;
        let span = align_up((lead + len) as u64, AES_BLOCK_SIZE as u64) as usize;

        let mut block = vec![0u8; span];
        self.base.seek(SeekFrom::Start(self.offset + aligned))?;
        let got = read_to_fill(&mut self.base, &mut block)?;

        let counter = (self.offset + aligned) / AES_BLOCK_SIZE as u64;
        let iv = ctr_iv(self.nonce, counter);
        let mut cipher = ctr::Ctr128BE::<Aes128>::new(&self.key.into(), &iv.into());
        cipher.apply_keystream(&mut block[..got]);

        let avail = got.saturating_sub(lead).min(len);
        buf[..avail].copy_from_slice(&block[lead..lead + avail]);
        self.pos = pos + avail as u64;
        Ok(avail)
    }
}

impl Seek for CtrSource {
    fn seek(&mut self, target: SeekFrom) -> io::Result<u64> {
        self.pos = resolve_seek(self.pos, self.size, target)?;
        Ok(self.pos)
    }
}

impl ByteSource for CtrSource {
    fn size(&self) -> u64 {
        self.size
    }

    fn clone_source(&self) -> Box<dyn ByteSource> {
        Box::new(Self {
            base: self.base.clone_source(),
            key: self.key,
            nonce: self.nonce,
            offset: self.offset,
            size: self.size,
            pos: 0,
        })
    }
}
