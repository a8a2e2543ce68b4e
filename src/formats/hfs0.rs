//! The Nintendo Hashed filesystem (HFS0) is used on Switch game cards.
//!
//! The layout is the PFS0 layout with a fatter entry record: each entry
//! additionally carries the size of its hashed region and a SHA-256 over it.
//! Hashes are carried through but not verified here.
//!
//! Game card images (see [xci](crate::formats::xci)) hold a root HFS0 whose
//! entries are the named partitions.

use std::io::{Seek, SeekFrom};

use binrw::prelude::*;

use crate::error::Result;
use crate::io::{ByteSource, SliceSource};

/// HFS0 header, followed inline by the entry table and string table.
///
/// The string table is 00-padded so that raw file data starts on a media
/// unit boundary.
#[derive(BinRead, Debug)]
#[br(little, magic = b"HFS0")]
pub struct Hfs0Header {
    pub num_files: u32,
    pub string_table_size: u32,
    _reserved: u32,
    #[br(count = num_files)]
    pub file_entries: Vec<RawHfsEntry>,
    #[br(count = string_table_size)]
    pub string_table: Vec<u8>,
}

/// On-disk file entry record, 0x40 bytes.
#[derive(BinRead, Debug, Clone)]
#[br(little)]
pub struct RawHfsEntry {
    /// Offset of the file in the data region.
    pub offset: u64,
    pub size: u64,
    /// Offset of the filename in the string table.
    pub name_offset: u32,
    /// Size of the hashed region of the file (for NCAs this is usually 0x200).
    pub hashed_size: u32,
    _reserved: u64,
    /// SHA-256 over the first `hashed_size` bytes of file data.
    pub sha256: [u8; 0x20],
}

/// A file within the archive, with its name resolved from the string table.
#[derive(Debug, Clone)]
pub struct HfsEntry {
    pub offset: u64,
    pub size: u64,
    pub hashed_size: u32,
    pub sha256: [u8; 0x20],
    pub name: String,
}

/// HFS0 parser over a byte source.
pub struct Hfs0 {
    base: Box<dyn ByteSource>,
    data_offset: u64,
    entries: Vec<HfsEntry>,
}

impl Hfs0 {
    pub const HEADER_SIZE: u64 = 0x10;
    pub const ENTRY_SIZE: u64 = 0x40;

    pub fn new(base: Box<dyn ByteSource>) -> Self {
        Self {
            base,
            data_offset: 0,
            entries: Vec::new(),
        }
    }

    pub fn parse(&mut self) -> Result<()> {
        self.base.seek(SeekFrom::Start(0))?;
        let header: Hfs0Header = self.base.read_le()?;

        self.data_offset = Self::HEADER_SIZE
            + u64::from(header.num_files) * Self::ENTRY_SIZE
            + u64::from(header.string_table_size);

        self.entries = header
            .file_entries
            .iter()
            .map(|entry| {
                Ok(HfsEntry {
                    offset: entry.offset,
                    size: entry.size,
                    hashed_size: entry.hashed_size,
                    sha256: entry.sha256,
                    name: super::name_at(&header.string_table, entry.name_offset as usize, "Hfs0")?,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        tracing::trace!(files = self.entries.len(), "parsed HFS0");
        Ok(())
    }

    pub fn num_entries(&self) -> u32 {
        self.entries.len() as u32
    }

    pub fn entries(&self) -> &[HfsEntry] {
        &self.entries
    }

    pub fn data_offset(&self) -> u64 {
        self.data_offset
    }

    /// Opens an entry as a view over the backing source.
    pub fn open(&self, entry: &HfsEntry) -> Box<dyn ByteSource> {
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
    use crate::formats::fixtures::{build_hfs0, mem_source};
    use std::io::Read;

    #[test]
    fn test_hfs0_enumerate_and_read() {
        let image = build_hfs0(&[("secure", &[0xD0; 0x30]), ("logo", b"logo data")]);
        let mut hfs = Hfs0::new(mem_source(image));
        hfs.parse().unwrap();

        assert_eq!(hfs.num_entries(), 2);
        assert_eq!(hfs.entries()[0].name, "secure");
        assert_eq!(hfs.entries()[1].name, "logo");

        let entry = hfs.entries()[1].clone();
        let mut data = vec![0u8; entry.size as usize];
        hfs.open(&entry).read_exact(&mut data).unwrap();
        assert_eq!(data, b"logo data");
    }

    #[test]
    fn test_hfs0_bad_magic() {
        let mut hfs = Hfs0::new(mem_source(b"PFS0\x00\x00\x00\x00".to_vec()));
        assert!(hfs.parse().is_err());
    }
}
