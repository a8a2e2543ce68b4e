//! # Nintendo PFS0 (PartitionFS0) format
//!
//! The Partition File System is a flat archive format: a header, a file
//! entry table, a string table with NUL-terminated names, then raw file
//! data. NSP files distributed for installation are plain PFS0 images.
//!
//! PFS0 images usually nest further containers, like the NCA files holding
//! actual content, plus tickets and metadata.

use std::io::{Read, Seek, SeekFrom};

use binrw::prelude::*;

use crate::error::Result;
use crate::io::{ByteSource, SliceSource};

#[derive(BinRead, Debug, Clone, Default)]
#[br(little, magic = b"PFS0")]
/// PFS0 header located at the start of the archive.
///
/// # Format Layout
/// - 0x00: Magic "PFS0" (validated by binrw)
/// - 0x04: Number of files (4 bytes)
/// - 0x08: String table size (4 bytes)
/// - 0x0C: Reserved (4 bytes)
pub struct Pfs0Header {
    pub num_files: u32,
    pub string_table_size: u32,
    _reserved: u32,
}

#[derive(BinRead, Debug)]
#[br(little)]
/// On-disk file entry record, 0x18 bytes.
///
/// `offset` is relative to the start of the file data region, which begins
/// after the header, all entries and the string table.
struct RawFileEntry {
    offset: u64,
    size: u64,
    name_offset: u32,
    _reserved: u32,
}

/// A file within the archive, with its name resolved from the string table.
#[derive(Debug, Clone)]
pub struct PfsEntry {
    pub offset: u64,
    pub size: u64,
    pub name: String,
}

/// PFS0 parser over a byte source.
pub struct Pfs0 {
    base: Box<dyn ByteSource>,
    header: Pfs0Header,
    data_offset: u64,
    entries: Vec<PfsEntry>,
}

impl Pfs0 {
    pub const HEADER_SIZE: u64 = 0x10;
    pub const ENTRY_SIZE: u64 = 0x18;

    pub fn new(base: Box<dyn ByteSource>) -> Self {
        Self {
            base,
            header: Pfs0Header::default(),
            data_offset: 0,
            entries: Vec::new(),
        }
    }

    /// Parses the header, entry table and string table.
    ///
    /// Re-parsing an already parsed archive rebuilds the entry list from
    /// scratch and is observationally idempotent.
    pub fn parse(&mut self) -> Result<()> {
        self.base.seek(SeekFrom::Start(0))?;
        let header: Pfs0Header = self.base.read_le()?;

        let raw = (0..header.num_files)
            .map(|_| self.base.read_le::<RawFileEntry>())
            .collect::<std::result::Result<Vec<_>, _>>()?;

        let mut names = vec![0u8; header.string_table_size as usize];
        self.base.read_exact(&mut names)?;

        self.data_offset = Self::HEADER_SIZE
            + u64::from(header.num_files) * Self::ENTRY_SIZE
            + u64::from(header.string_table_size);

        self.entries = raw
            .into_iter()
            .map(|entry| {
                Ok(PfsEntry {
                    offset: entry.offset,
                    size: entry.size,
                    name: super::name_at(&names, entry.name_offset as usize, "Pfs0")?,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        self.header = header;

        tracing::trace!(files = self.entries.len(), "parsed PFS0");
        Ok(())
    }

    pub fn num_entries(&self) -> u32 {
        self.header.num_files
    }

    pub fn entries(&self) -> &[PfsEntry] {
        &self.entries
    }

    /// Offset of the file data region within the archive.
    pub fn data_offset(&self) -> u64 {
        self.data_offset
    }

    /// Opens an entry as a view over the backing source.
    pub fn open(&self, entry: &PfsEntry) -> Box<dyn ByteSource> {
        Box::new(SliceSource::new(
            self.base.clone_source(),
            entry.size,
            self.data_offset + entry.offset,
        ))
    }

    pub fn clone_base(&self) -> Box<dyn ByteSource> {
        self.base.clone_source()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::formats::fixtures::{build_pfs0, mem_source};
    use std::io::Read;

    #[test]
    fn test_pfs0_enumerate_and_read() {
        let image = build_pfs0(&[("a.txt", b"AAA"), ("b.bin", &[0x00, 0x01, 0x02, 0x03])]);
        let mut pfs = Pfs0::new(mem_source(image));
        pfs.parse().unwrap();

        assert_eq!(pfs.num_entries(), 2);
        let entries = pfs.entries().to_vec();
        assert_eq!(entries[0].name, "a.txt");
        assert_eq!(entries[1].name, "b.bin");

        let mut buf = [0u8; 3];
        pfs.open(&entries[0]).read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"AAA");

        let mut buf = [0u8; 4];
        pfs.open(&entries[1]).read_exact(&mut buf).unwrap();
        assert_eq!(buf, [0x00, 0x01, 0x02, 0x03]);
    }

    #[test]
    fn test_pfs0_entry_sizes_cover_source() {
        let image = build_pfs0(&[("x", &[0xAA; 0x20]), ("y", &[0xBB; 0x11])]);
        let total = image.len() as u64;
        let mut pfs = Pfs0::new(mem_source(image));
        pfs.parse().unwrap();

        let sum: u64 = pfs.entries().iter().map(|e| e.size).sum();
        assert_eq!(pfs.data_offset() + sum, total);
    }

    #[test]
    fn test_pfs0_bad_magic() {
        let mut pfs = Pfs0::new(mem_source(vec![0u8; 0x40]));
        assert!(pfs.parse().is_err());
    }

    #[test]
    fn test_pfs0_reparse_is_idempotent() {
        let image = build_pfs0(&[("f", b"data")]);
        let mut pfs = Pfs0::new(mem_source(image));
        pfs.parse().unwrap();
        pfs.parse().unwrap();
        assert_eq!(pfs.entries().len(), 1);
        assert_eq!(pfs.entries()[0].name, "f");
    }
}
