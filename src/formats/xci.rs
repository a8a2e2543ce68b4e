//! The XCI format is the raw image of a Nintendo Switch game card.
//!
//! The cards physically resemble SD cards, and are coated with a bittering
//! agent to discourage consumption. The image starts with a 0x200-byte
//! header (magic `HEAD` after a 0x100-byte signature) pointing at a root
//! HFS0, whose entries are the named partitions: `update`, `normal`,
//! `secure` and `logo`.

use std::io::{Seek, SeekFrom};

use binrw::prelude::*;

use crate::error::Result;
use crate::io::{ByteSource, SliceSource};

use super::hfs0::{Hfs0, Hfs0Header};

/// Size of the eMMC chip on the game card.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CartType {
    Gb1,
    Gb2,
    Gb4,
    Gb8,
    Gb16,
    Gb32,
}

impl CartType {
    pub fn from_raw(raw: u8) -> Option<Self> {
        match raw {
            0xFA => Some(Self::Gb1),
            0xF8 => Some(Self::Gb2),
            0xF0 => Some(Self::Gb4),
            0xE0 => Some(Self::Gb8),
            0xE1 => Some(Self::Gb16),
            0xE2 => Some(Self::Gb32),
            _ => None,
        }
    }
}

/// The four named partitions a card image can hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionKind {
    Update,
    Normal,
    Secure,
    Logo,
}

impl PartitionKind {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Update => "update",
            Self::Normal => "normal",
            Self::Secure => "secure",
            Self::Logo => "logo",
        }
    }

    fn from_name(name: &str) -> Option<Self> {
        match name {
            "update" => Some(Self::Update),
            "normal" => Some(Self::Normal),
            "secure" => Some(Self::Secure),
            "logo" => Some(Self::Logo),
            _ => None,
        }
    }
}

#[derive(BinRead, Debug)]
#[br(little)]
/// XCI header, 0x200 bytes.
pub struct XciHeader {
    pub signature: [u8; 0x100],
    #[br(magic = b"HEAD")]
    pub secure_start: u32,
    pub backup_start: u32,
    pub keys_idx: u8,
    pub cart_type: u8,
    pub header_version: u8,
    pub flags: u8,
    pub package_id: u64,
    pub valid_end: u64,
    pub iv: [u8; 0x10],
    /// Offset of the root HFS0 partition table.
    pub hfs_offset: u64,
    pub hfs_size: u64,
    pub header_hash: [u8; 0x20],
    pub initial_data_hash: [u8; 0x20],
    pub security_mode: u32,
    pub t1_key_idx: u32,
    pub key_idx: u32,
    pub normal_end: u32,
    pub encrypted_gc_info: [u8; 0x70],
}

/// A named partition wrapping an HFS0 view into the card image.
pub struct XciPartition {
    pub kind: PartitionKind,
    hfs: Hfs0,
}

impl XciPartition {
    pub fn name(&self) -> &'static str {
        self.kind.name()
    }

    pub fn hfs(&self) -> &Hfs0 {
        &self.hfs
    }

    pub fn hfs_mut(&mut self) -> &mut Hfs0 {
        &mut self.hfs
    }

    pub fn clone_base(&self) -> Box<dyn ByteSource> {
        self.hfs.clone_base()
    }
}

/// XCI parser over a byte source.
pub struct Xci {
    base: Box<dyn ByteSource>,
    header: Option<XciHeader>,
    partitions: Vec<XciPartition>,
}

impl Xci {
    pub fn new(base: Box<dyn ByteSource>) -> Self {
        Self {
            base,
            header: None,
            partitions: Vec::new(),
        }
    }

    /// Parses the card header and the root HFS0 partition table.
    ///
    /// The root table is walked directly rather than through the HFS parser:
    /// its entry offsets are relative to a data region that sits inside the
    /// card image, so the partition views are sliced out of the card base.
    pub fn parse(&mut self) -> Result<()> {
        self.base.seek(SeekFrom::Start(0))?;
        let header: XciHeader = self.base.read_le()?;

        self.base.seek(SeekFrom::Start(header.hfs_offset))?;
        let root: Hfs0Header = self.base.read_le()?;

        let strings_offset = header.hfs_offset
            + Hfs0::HEADER_SIZE
            + u64::from(root.num_files) * Hfs0::ENTRY_SIZE;
        let data_offset = strings_offset + u64::from(root.string_table_size);

        self.partitions.clear();
        for entry in &root.file_entries {
            let name = super::name_at(&root.string_table, entry.name_offset as usize, "Xci")?;
            let Some(kind) = PartitionKind::from_name(&name) else {
                tracing::warn!(name = %name, "ignoring unknown partition in card image");
                continue;
            };

            let view = SliceSource::new(
                self.base.clone_source(),
                entry.size,
                entry.offset + data_offset,
            );
            self.partitions.push(XciPartition {
                kind,
                hfs: Hfs0::new(Box::new(view)),
            });
        }

        tracing::trace!(partitions = self.partitions.len(), "parsed XCI");
        self.header = Some(header);
        Ok(())
    }

    pub fn header(&self) -> Option<&XciHeader> {
        self.header.as_ref()
    }

    pub fn cart_type(&self) -> Option<CartType> {
        self.header.as_ref().and_then(|h| CartType::from_raw(h.cart_type))
    }

    pub fn num_partitions(&self) -> usize {
        self.partitions.len()
    }

    pub fn partitions(&self) -> &[XciPartition] {
        &self.partitions
    }

    pub fn partitions_mut(&mut self) -> &mut [XciPartition] {
        &mut self.partitions
    }

    pub fn clone_base(&self) -> Box<dyn ByteSource> {
        self.base.clone_source()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::formats::fixtures::{build_hfs0, build_xci, mem_source};
    use std::io::Read;

    #[test]
    fn test_xci_partitions() {
        let secure = build_hfs0(&[("content.bin", b"secure payload")]);
        let image = build_xci(&[("secure", secure), ("logo", build_hfs0(&[]))]);

        let mut xci = Xci::new(mem_source(image));
        xci.parse().unwrap();

        assert_eq!(xci.num_partitions(), 2);
        assert_eq!(xci.partitions()[0].kind, PartitionKind::Secure);
        assert_eq!(xci.partitions()[1].kind, PartitionKind::Logo);
        assert_eq!(xci.cart_type(), Some(CartType::Gb1));

        // The partition view parses as a standalone HFS0.
        let partition = &mut xci.partitions_mut()[0];
        partition.hfs_mut().parse().unwrap();
        let entry = partition.hfs().entries()[0].clone();
        assert_eq!(entry.name, "content.bin");

        let mut data = vec![0u8; entry.size as usize];
        partition
            .hfs()
            .open(&entry)
            .read_exact(&mut data)
            .unwrap();
        assert_eq!(data, b"secure payload");
    }

    #[test]
    fn test_xci_ignores_unknown_partitions() {
        let image = build_xci(&[("bogus", build_hfs0(&[])), ("normal", build_hfs0(&[]))]);
        let mut xci = Xci::new(mem_source(image));
        xci.parse().unwrap();

        assert_eq!(xci.num_partitions(), 1);
        assert_eq!(xci.partitions()[0].name(), "normal");
    }

    #[test]
    fn test_xci_bad_magic() {
        let mut xci = Xci::new(mem_source(vec![0u8; 0x400]));
        assert!(xci.parse().is_err());
    }
}
