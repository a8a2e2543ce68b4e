//! Nintendo Content Archive (NCA) parser.
//!
//! The first 0xC00 bytes are AES-XTS encrypted with sector size 0x200 and a
//! non-standard tweak (the sector index is stored big-endian): a 0x400-byte
//! fixed header plus one 0x200-byte header per section slot. Only "NCA3"
//! archives are accepted; older variants fail the magic check.
//!
//! Section payloads are AES-CTR encrypted with a body key that comes either
//! from the title key registry (when the archive carries a rights ID) or
//! from the header's key area unwrapped with a derived key area key.

use std::io::{Cursor, Read, Seek, SeekFrom};
use std::sync::Arc;

use binrw::prelude::*;

use crate::crypto::{self, AesKey};
use crate::error::{Error, Result};
use crate::io::{ByteSource, CtrSource, SliceSource};
use crate::keys::{Keys, RightsId};

use super::pfs0::Pfs0;
use super::romfs::RomFs;

/// Size of a media unit; section offsets are given in these blocks.
pub const MEDIA_SIZE: u64 = 0x200;
/// Size of the encrypted header region.
pub const HEADER_SIZE: usize = 0xC00;
/// Size of the fixed header preceding the section headers.
pub const FIXED_HEADER_SIZE: usize = 0x400;

const MAX_SECTIONS: usize = 4;

#[derive(BinRead, Debug, Clone, Copy, PartialEq, Eq)]
#[br(little, repr = u8)]
/// Where the content was distributed from.
pub enum DistributionType {
    /// Downloaded from a CDN, such as the eShop.
    Download = 0x00,
    /// Read from a game card.
    GameCard = 0x01,
}

#[derive(BinRead, Debug, Clone, Copy, PartialEq, Eq)]
#[br(little, repr = u8)]
/// The type of content stored in the NCA.
pub enum ContentType {
    Program = 0x00,
    Meta = 0x01,
    Control = 0x02,
    Manual = 0x03,
    Data = 0x04,
    PublicData = 0x05,
}

/// Filesystem type byte of a section header.
pub mod fs_type {
    pub const ROMFS: u8 = 0;
    pub const PFS: u8 = 1;
}

/// Hash type byte of a section header.
pub mod hash_type {
    pub const HIERARCHICAL_SHA256: u8 = 2;
    pub const HIERARCHICAL_INTEGRITY: u8 = 3;
}

/// Encryption type byte of a section header.
pub mod encryption_type {
    pub const NONE: u8 = 1;
    pub const AES_CTR_OLD: u8 = 2;
    pub const AES_CTR: u8 = 3;
    pub const AES_CTR_EX: u8 = 4;
}

#[derive(BinRead, Debug, Clone, Copy, Default)]
#[br(little)]
/// Section slot in the fixed header; offsets are in media units.
pub struct FsEntry {
    pub media_start_offset: u32,
    pub media_end_offset: u32,
    _reserved: u64,
}

impl FsEntry {
    pub fn start_offset(&self) -> u64 {
        u64::from(self.media_start_offset) * MEDIA_SIZE
    }

    pub fn end_offset(&self) -> u64 {
        u64::from(self.media_end_offset) * MEDIA_SIZE
    }
}

#[derive(BinRead, Debug)]
#[br(little)]
/// Fixed NCA header, 0x400 bytes post-decryption.
pub struct NcaHeader {
    pub fixed_key_sig: [u8; 0x100],
    pub npdm_key_sig: [u8; 0x100],
    pub magic: [u8; 4],
    pub distribution_type: DistributionType,
    pub content_type: ContentType,
    pub crypto_type: u8,
    pub kaek_idx: u8,
    pub size: u64,
    pub title_id: u64,
    _reserved1: u32,
    pub sdk_ver: u32,
    pub crypto_gen: u8,
    pub sig_gen: u8,
    _reserved2: [u8; 0xE],
    pub rights_id: RightsId,
    pub fs_entries: [FsEntry; 4],
    pub section_hashes: [[u8; 0x20]; 4],
    pub key_area: [[u8; 0x10]; 4],
    _reserved3: [u8; 0xC0],
}

#[derive(BinRead, Debug)]
#[br(little)]
/// Per-section header, 0x200 bytes post-decryption.
///
/// The superblock region is a union of [`PfsSuperblock`] and
/// [`RomFsSuperblock`]; which one applies follows from `fs_type`/`hash_type`.
pub struct FsHeader {
    pub version: u16,
    pub fs_type: u8,
    pub hash_type: u8,
    pub encryption_type: u8,
    _reserved1: [u8; 3],
    superblock: [u8; 0x138],
    pub nonce: u64,
    _reserved2: [u8; 0xB8],
}

impl FsHeader {
    pub fn pfs_superblock(&self) -> Result<PfsSuperblock> {
        Ok(Cursor::new(&self.superblock[..]).read_le()?)
    }

    pub fn romfs_superblock(&self) -> Result<RomFsSuperblock> {
        Ok(Cursor::new(&self.superblock[..]).read_le()?)
    }
}

#[derive(BinRead, Debug)]
#[br(little)]
/// Hierarchical-SHA256 superblock of a PFS section.
pub struct PfsSuperblock {
    pub master_hash: [u8; 0x20],
    pub block_size: u32,
    pub always_2: u32,
    pub hash_table_offset: u64,
    pub hash_table_size: u64,
    pub pfs_offset: u64,
    pub pfs_size: u64,
    _reserved: [u8; 0xF0],
}

#[derive(BinRead, Debug, Clone, Copy)]
#[br(little)]
pub struct IvfcLevelHeader {
    pub offset: u64,
    pub size: u64,
    pub block_size: u32,
    _reserved: u32,
}

#[derive(BinRead, Debug)]
#[br(little)]
/// Hierarchical-integrity (IVFC) superblock of a RomFS section.
pub struct RomFsSuperblock {
    pub magic: u32,
    pub id: u32,
    pub master_hash_size: u32,
    pub num_levels: u32,
    pub level_headers: [IvfcLevelHeader; 6],
    _reserved1: [u8; 0x20],
    pub master_hash: [u8; 0x20],
    _reserved2: [u8; 0x58],
}

impl RomFsSuperblock {
    pub const IVFC_MAX_LEVELS: usize = 6;
}

/// Kind of the inner filesystem of a section.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SectionKind {
    Pfs,
    RomFs,
}

/// Parser embedded in a section, tagged by the section kind.
pub enum SectionContent {
    Pfs(Pfs0),
    RomFs(RomFs),
}

/// A single decrypted section of an NCA.
pub struct NcaSection {
    content: SectionContent,
    /// NCA-relative offset of the section.
    pub offset: u64,
    pub size: u64,
}

impl NcaSection {
    pub fn kind(&self) -> SectionKind {
        match self.content {
            SectionContent::Pfs(_) => SectionKind::Pfs,
            SectionContent::RomFs(_) => SectionKind::RomFs,
        }
    }

    pub fn content(&self) -> &SectionContent {
        &self.content
    }

    pub fn content_mut(&mut self) -> &mut SectionContent {
        &mut self.content
    }

    /// Clones the section's decrypted view.
    pub fn clone_base(&self) -> Box<dyn ByteSource> {
        match &self.content {
            SectionContent::Pfs(pfs) => pfs.clone_base(),
            SectionContent::RomFs(romfs) => romfs.clone_base(),
        }
    }
}

/// NCA parser over a byte source.
pub struct Nca {
    base: Box<dyn ByteSource>,
    keys: Arc<Keys>,
    header: Option<NcaHeader>,
    sections: Vec<NcaSection>,
}

impl Nca {
    pub fn new(base: Box<dyn ByteSource>, keys: Arc<Keys>) -> Self {
        Self {
            base,
            keys,
            header: None,
            sections: Vec::new(),
        }
    }

    /// Checks whether a decrypted probe of the header region carries an NCA
    /// magic. `data` must hold at least the first 0x400 raw bytes.
    pub fn matches(data: &[u8], keys: &Keys) -> bool {
        let Ok(header_key) = keys.keyset().header_key() else {
            return false;
        };
        if data.len() < FIXED_HEADER_SIZE {
            return false;
        }

        let mut buf = [0u8; FIXED_HEADER_SIZE];
        buf.copy_from_slice(&data[..FIXED_HEADER_SIZE]);
        let xts = crypto::header_cipher(&header_key);
        crypto::decrypt_header_area(&xts, &mut buf, 0);
        &buf[0x200..0x204] == b"NCA3"
    }

    /// Decrypts and parses the header, derives the body key and constructs
    /// the sections.
    pub fn parse(&mut self) -> Result<()> {
        let (header, fs_headers) = self.decrypt_header()?;

        let crypto_type = header.crypto_type.max(header.crypto_gen);
        // Generations 0 and 1 both select master key 0; the index is clamped
        // to the key array bounds.
        let crypto_type = crypto_type.saturating_sub(1).min(0x0F);

        let body_key = if header.rights_id != [0u8; 0x10] {
            self.decrypt_titlekey(&header, crypto_type)?
        } else {
            self.decrypt_keyarea(&header, crypto_type)?
        };

        let mut sections = Vec::new();
        for (idx, entry) in header.fs_entries.iter().enumerate() {
            if entry.media_start_offset == 0 {
                continue;
            }
            match self.make_section(entry, &fs_headers[idx], &body_key) {
                Ok(section) => sections.push(section),
                Err(Error::UnsupportedEncryption(scheme)) => {
                    tracing::warn!(section = idx, scheme, "skipping encrypted section");
                }
                Err(e) => return Err(e),
            }
        }

        self.sections = sections;
        self.header = Some(header);
        Ok(())
    }

    fn decrypt_header(&mut self) -> Result<(NcaHeader, Vec<FsHeader>)> {
        let header_key = self.keys.keyset().header_key()?;
        let xts = crypto::header_cipher(&header_key);

        let mut raw = vec![0u8; HEADER_SIZE];
        self.base.seek(SeekFrom::Start(0))?;
        self.base
            .read_exact(&mut raw)
            .map_err(|_| Error::TruncatedHeader("Nca"))?;

        crypto::decrypt_header_area(&xts, &mut raw[..FIXED_HEADER_SIZE], 0);
        if &raw[0x200..0x204] != b"NCA3" {
            return Err(Error::BadMagic("Nca"));
        }

        // Section headers continue the sector run of the fixed header.
        crypto::decrypt_header_area(&xts, &mut raw[FIXED_HEADER_SIZE..], 2);

        let header: NcaHeader = Cursor::new(&raw[..FIXED_HEADER_SIZE]).read_le()?;
        let fs_headers = raw[FIXED_HEADER_SIZE..]
            .chunks_exact(crypto::XTS_SECTOR_SIZE)
            .map(|chunk| Cursor::new(chunk).read_le::<FsHeader>())
            .collect::<std::result::Result<Vec<_>, _>>()?;
        debug_assert_eq!(fs_headers.len(), MAX_SECTIONS);

        Ok((header, fs_headers))
    }

    fn decrypt_titlekey(&self, header: &NcaHeader, crypto_type: u8) -> Result<AesKey> {
        let title_key = self.keys.title_key(&header.rights_id).map_err(|e| {
            tracing::error!(
                rights_id = %hex::encode(header.rights_id),
                "title key missing"
            );
            e
        })?;
        let titlekek = self.keys.keyset().titlekek(crypto_type)?;

        let mut body_key = title_key;
        crypto::decrypt_ecb(&titlekek, &mut body_key);
        Ok(body_key)
    }

    fn decrypt_keyarea(&self, header: &NcaHeader, crypto_type: u8) -> Result<AesKey> {
        let keyset = self.keys.keyset();
        let master_key = keyset.master_key(crypto_type)?;
        let kaek_source = keyset.get_kaek(header.kaek_idx as usize)?;
        let kek_seed = keyset
            .aes_kek_generation_source
            .ok_or(Error::MissingKey("aes_kek_generation_source"))?;
        let key_seed = keyset
            .aes_key_generation_source
            .ok_or(Error::MissingKey("aes_key_generation_source"))?;

        let area_key = crypto::gen_aes_kek(&kaek_source, &master_key, &kek_seed, &key_seed);
        let mut key_area = header.key_area;
        for key in key_area.iter_mut() {
            crypto::decrypt_ecb(&area_key, key);
        }
        Ok(key_area[2])
    }

    fn make_section(
        &self,
        entry: &FsEntry,
        fs_header: &FsHeader,
        body_key: &AesKey,
    ) -> Result<NcaSection> {
        let section_offset = entry.start_offset();
        let section_size = entry.end_offset() - section_offset;

        let kind = if fs_header.fs_type == fs_type::PFS
            && fs_header.hash_type == hash_type::HIERARCHICAL_SHA256
        {
            SectionKind::Pfs
        } else {
            SectionKind::RomFs
        };

        let (inner_offset, inner_size) = match kind {
            SectionKind::Pfs => {
                let superblock = fs_header.pfs_superblock()?;
                (superblock.pfs_offset, superblock.pfs_size)
            }
            SectionKind::RomFs => {
                let superblock = fs_header.romfs_superblock()?;
                let level = superblock.level_headers[RomFsSuperblock::IVFC_MAX_LEVELS - 1];
                (level.offset, level.size)
            }
        };

        // The region offset stays NCA-relative: the base source may itself
        // already be offset and decrypted by an outer container.
        let region_offset = section_offset + inner_offset;
        let source: Box<dyn ByteSource> = match fs_header.encryption_type {
            encryption_type::NONE => Box::new(SliceSource::new(
                self.base.clone_source(),
                inner_size,
                region_offset,
            )),
            encryption_type::AES_CTR => Box::new(CtrSource::new(
                self.base.clone_source(),
                *body_key,
                fs_header.nonce.swap_bytes(),
                inner_size,
                region_offset,
            )),
            scheme => return Err(Error::UnsupportedEncryption(scheme)),
        };

        let content = match kind {
            SectionKind::Pfs => SectionContent::Pfs(Pfs0::new(source)),
            SectionKind::RomFs => SectionContent::RomFs(RomFs::new(source)),
        };

        Ok(NcaSection {
            content,
            offset: section_offset,
            size: section_size,
        })
    }

    pub fn header(&self) -> Option<&NcaHeader> {
        self.header.as_ref()
    }

    pub fn content_type(&self) -> Option<ContentType> {
        self.header.as_ref().map(|h| h.content_type)
    }

    pub fn distribution_type(&self) -> Option<DistributionType> {
        self.header.as_ref().map(|h| h.distribution_type)
    }

    pub fn title_id(&self) -> Option<u64> {
        self.header.as_ref().map(|h| h.title_id)
    }

    pub fn rights_id(&self) -> Option<&RightsId> {
        self.header.as_ref().map(|h| &h.rights_id)
    }

    /// SDK version as `major.minor.micro.bugfix` bytes.
    pub fn sdk_version(&self) -> Option<[u8; 4]> {
        self.header.as_ref().map(|h| {
            [
                (h.sdk_ver >> 24) as u8,
                (h.sdk_ver >> 16) as u8,
                (h.sdk_ver >> 8) as u8,
                h.sdk_ver as u8,
            ]
        })
    }

    pub fn num_sections(&self) -> usize {
        self.sections.len()
    }

    pub fn sections(&self) -> &[NcaSection] {
        &self.sections
    }

    pub fn sections_mut(&mut self) -> &mut [NcaSection] {
        &mut self.sections
    }

    pub fn clone_base(&self) -> Box<dyn ByteSource> {
        self.base.clone_source()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::formats::fixtures::{build_nca3, build_pfs0, mem_source, NcaOptions};
    use crate::keys::{KeySet, TitleKeySet};
    use std::io::Read;

    fn test_keyset() -> KeySet {
        let mut set = KeySet::default();
        set.set_key("header_key", &"07".repeat(32));
        set.set_key("master_key_00", &"10".repeat(16));
        set.set_key("titlekek_00", &"20".repeat(16));
        set.set_key("aes_kek_generation_source", &"30".repeat(16));
        set.set_key("aes_key_generation_source", &"40".repeat(16));
        set.set_key("key_area_key_application_source", &"50".repeat(16));
        set.set_key("key_area_key_ocean_source", &"51".repeat(16));
        set.set_key("key_area_key_system_source", &"52".repeat(16));
        set
    }

    #[test]
    fn test_nca_with_title_key() {
        let keyset = test_keyset();
        let rights_id: RightsId = [0xAA; 16];
        let title_key: AesKey = [0x66; 16];

        let mut titles = TitleKeySet::default();
        titles.set_key(rights_id, title_key);
        let keys = Arc::new(Keys::with_title_keys(keyset.clone(), titles));

        // The body key is the title key unwrapped with the generation's kek.
        let mut body_key = title_key;
        crypto::decrypt_ecb(&keyset.titlekeks[0].unwrap(), &mut body_key);

        let inner = build_pfs0(&[("flag.bin", b"title key path works")]);
        let image = build_nca3(&NcaOptions {
            header_key: keyset.header_key.unwrap(),
            rights_id,
            key_area_kek: None,
            body_key,
            pfs_section: true,
            encrypted: true,
            nonce: 0x0123456789ABCDEF,
            payload: &inner,
        });

        let mut nca = Nca::new(mem_source(image), Arc::clone(&keys));
        nca.parse().unwrap();

        assert_eq!(nca.num_sections(), 1);
        assert_eq!(nca.sections()[0].kind(), SectionKind::Pfs);

        let SectionContent::Pfs(pfs) = nca.sections_mut()[0].content_mut() else {
            panic!("expected a PFS section");
        };
        pfs.parse().unwrap();
        let entry = pfs.entries()[0].clone();
        assert_eq!(entry.name, "flag.bin");

        let mut data = vec![0u8; entry.size as usize];
        pfs.open(&entry).read_exact(&mut data).unwrap();
        assert_eq!(data, b"title key path works");
    }

    #[test]
    fn test_nca_key_area_path() {
        let keyset = test_keyset();
        let keys = Arc::new(Keys::new(keyset.clone()));

        let area_kek = crypto::gen_aes_kek(
            &keyset.key_area_key_application_source.unwrap(),
            &keyset.master_keys[0].unwrap(),
            &keyset.aes_kek_generation_source.unwrap(),
            &keyset.aes_key_generation_source.unwrap(),
        );
        let body_key: AesKey = [0x44; 16];

        let inner = build_pfs0(&[("a.txt", b"AAA")]);
        let image = build_nca3(&NcaOptions {
            header_key: keyset.header_key.unwrap(),
            rights_id: [0u8; 16],
            key_area_kek: Some(area_kek),
            body_key,
            pfs_section: true,
            encrypted: true,
            nonce: 7,
            payload: &inner,
        });

        let mut nca = Nca::new(mem_source(image), keys);
        nca.parse().unwrap();
        assert_eq!(nca.num_sections(), 1);

        let SectionContent::Pfs(pfs) = nca.sections_mut()[0].content_mut() else {
            panic!("expected a PFS section");
        };
        pfs.parse().unwrap();
        assert_eq!(pfs.entries()[0].name, "a.txt");
    }

    #[test]
    fn test_nca_missing_title_key_fails() {
        let keyset = test_keyset();
        let keys = Arc::new(Keys::new(keyset.clone()));

        let inner = build_pfs0(&[("a.txt", b"AAA")]);
        let image = build_nca3(&NcaOptions {
            header_key: keyset.header_key.unwrap(),
            rights_id: [0xBB; 16],
            key_area_kek: None,
            body_key: [0u8; 16],
            pfs_section: true,
            encrypted: true,
            nonce: 0,
            payload: &inner,
        });

        let mut nca = Nca::new(mem_source(image), keys);
        assert!(matches!(nca.parse(), Err(Error::MissingTitleKey(_))));
    }

    #[test]
    fn test_nca_match_probe() {
        let keyset = test_keyset();
        let keys = Keys::new(keyset.clone());

        let inner = build_pfs0(&[("a.txt", b"AAA")]);
        let image = build_nca3(&NcaOptions {
            header_key: keyset.header_key.unwrap(),
            rights_id: [0u8; 16],
            key_area_kek: Some([0x01; 16]),
            body_key: [0x02; 16],
            pfs_section: true,
            encrypted: false,
            nonce: 0,
            payload: &inner,
        });

        assert!(Nca::matches(&image[..0x400], &keys));
        assert!(!Nca::matches(&vec![0u8; 0x400], &keys));

        // Without a header key there is nothing to probe with.
        let empty = Keys::new(KeySet::default());
        assert!(!Nca::matches(&image[..0x400], &empty));
    }

    #[test]
    fn test_nca_rejects_pre_nca3_magic() {
        let keyset = test_keyset();
        let keys = Arc::new(Keys::new(keyset.clone()));

        // A correctly encrypted header whose magic is the older "NCA2".
        let mut image = vec![0u8; HEADER_SIZE];
        image[0x200..0x204].copy_from_slice(b"NCA2");
        let xts = crypto::header_cipher(&keyset.header_key.unwrap());
        xts.encrypt_area(&mut image, crypto::XTS_SECTOR_SIZE, 0, crypto::nintendo_tweak);

        assert!(!Nca::matches(&image[..0x400], &keys));

        let mut nca = Nca::new(mem_source(image), keys);
        assert!(matches!(nca.parse(), Err(Error::BadMagic("Nca"))));
    }
}
