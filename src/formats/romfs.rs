//! Nintendo read-only hierarchical filesystem (RomFS).
//!
//! RomFS has no ASCII magic; a header whose `header_size` field is 0x50
//! identifies it. Directory and file metadata live in packed variable-length
//! meta tables, and two hash tables of u32 bucket heads give O(1) path
//! lookup: `hash(parent_meta_offset, name)` selects a bucket, whose chain is
//! walked through each record's `next` link.
//!
//! Entries are materialized into flat arenas indexed by position; parent and
//! child links are arena indices, and a meta-offset map bridges hash-table
//! hits back to arena entries.

use std::collections::HashMap;
use std::io::{Read, Seek, SeekFrom};

use binrw::prelude::*;

use crate::error::{Error, Result};
use crate::io::{align_up, ByteSource, SliceSource};

/// Sentinel marking empty hash buckets and absent sibling/child links.
pub const INVALID_ENTRY: u32 = u32::MAX;

const DIR_META_SIZE: usize = 0x18;
const FILE_META_SIZE: usize = 0x20;

#[derive(BinRead, Debug, Clone, Default)]
#[br(little)]
/// RomFS header, 0x50 bytes of u64 fields.
pub struct RomFsHeader {
    pub header_size: u64,
    pub dir_hash_tbl_off: u64,
    pub dir_hash_tbl_size: u64,
    pub dir_meta_tbl_off: u64,
    pub dir_meta_tbl_size: u64,
    pub file_hash_tbl_off: u64,
    pub file_hash_tbl_size: u64,
    pub file_meta_tbl_off: u64,
    pub file_meta_tbl_size: u64,
    pub file_data_off: u64,
}

impl RomFsHeader {
    /// Expected `header_size` value; doubles as the format's magic.
    pub const SIZE: u64 = 0x50;
}

/// A directory in the arena.
#[derive(Debug)]
pub struct RomFsDir {
    /// Offset of this directory's record in the dir meta table.
    pub meta_off: u32,
    /// Arena index of the parent; `None` for the root.
    pub parent: Option<usize>,
    pub name: String,
    /// Arena indices of child directories, populated by `parse_dir`.
    pub children: Vec<usize>,
    /// Arena indices of contained files, populated by `parse_dir`.
    pub files: Vec<usize>,
    parsed: bool,
}

/// A file in the arena.
#[derive(Debug)]
pub struct RomFsFile {
    pub meta_off: u32,
    pub parent: Option<usize>,
    pub name: String,
    /// Offset of the data within the file data region.
    pub offset: u64,
    pub size: u64,
}

/// Decoded directory meta record.
struct DirMeta {
    parent_off: u32,
    sibling_off: u32,
    child_off: u32,
    file_off: u32,
    next: u32,
    name: String,
}

/// Decoded file meta record.
struct FileMeta {
    parent_off: u32,
    sibling_off: u32,
    data_off: u64,
    data_size: u64,
    next: u32,
    name: String,
}

/// RomFS parser over a byte source.
pub struct RomFs {
    base: Box<dyn ByteSource>,
    header: RomFsHeader,

    dir_hash_tbl: Vec<u32>,
    file_hash_tbl: Vec<u32>,
    dir_meta_tbl: Vec<u8>,
    file_meta_tbl: Vec<u8>,

    dirs: Vec<RomFsDir>,
    files: Vec<RomFsFile>,
    dir_lookup: HashMap<u32, usize>,

    tables_read: bool,
}

impl RomFs {
    pub fn new(base: Box<dyn ByteSource>) -> Self {
        Self {
            base,
            header: RomFsHeader::default(),
            dir_hash_tbl: Vec::new(),
            file_hash_tbl: Vec::new(),
            dir_meta_tbl: Vec::new(),
            file_meta_tbl: Vec::new(),
            dirs: Vec::new(),
            files: Vec::new(),
            dir_lookup: HashMap::new(),
            tables_read: false,
        }
    }

    /// Parses the root directory level.
    pub fn parse(&mut self) -> Result<()> {
        let root = self.ensure_root()?;
        self.parse_dir(root, false)
    }

    /// Parses the whole directory tree recursively.
    pub fn parse_full(&mut self) -> Result<()> {
        let root = self.ensure_root()?;
        self.parse_dir(root, true)
    }

    /// Fast path: linearly scans the meta tables into flat lists.
    ///
    /// Parent/child linkage and the lookup map are left unpopulated, so path
    /// search is unavailable; callers that only enumerate use this.
    pub fn parse_fast(&mut self) -> Result<()> {
        self.read_tables()?;

        let mut offset = 0usize;
        while offset + DIR_META_SIZE <= self.dir_meta_tbl.len() {
            let meta = self.dir_meta_at(offset as u32)?;
            let advance = DIR_META_SIZE + align_up(meta.name.len() as u64, 4) as usize;
            self.dirs.push(RomFsDir {
                meta_off: offset as u32,
                parent: None,
                name: meta.name,
                children: Vec::new(),
                files: Vec::new(),
                parsed: false,
            });
            offset += advance;
        }

        let mut offset = 0usize;
        while offset + FILE_META_SIZE <= self.file_meta_tbl.len() {
            let meta = self.file_meta_at(offset as u32)?;
            let advance = FILE_META_SIZE + align_up(meta.name.len() as u64, 4) as usize;
            self.files.push(RomFsFile {
                meta_off: offset as u32,
                parent: None,
                name: meta.name,
                offset: meta.data_off,
                size: meta.data_size,
            });
            offset += advance;
        }

        tracing::trace!(
            dirs = self.dirs.len(),
            files = self.files.len(),
            "flat-scanned RomFS meta tables"
        );
        Ok(())
    }

    /// Parses one directory level: the children and files of `dir`.
    ///
    /// Runs at most once per directory; re-entering a parsed directory is a
    /// no-op, which keeps concurrent path views over a shared parser safe.
    pub fn parse_dir(&mut self, dir: usize, recursive: bool) -> Result<()> {
        if self.dirs[dir].parsed {
            if recursive {
                let children = self.dirs[dir].children.clone();
                for child in children {
                    self.parse_dir(child, true)?;
                }
            }
            return Ok(());
        }

        let meta = self.dir_meta_at(self.dirs[dir].meta_off)?;

        if meta.child_off != INVALID_ENTRY {
            let mut off = meta.child_off;
            loop {
                let child_meta = self.dir_meta_at(off)?;
                let idx = self.dirs.len();
                self.dirs.push(RomFsDir {
                    meta_off: off,
                    parent: Some(dir),
                    name: child_meta.name,
                    children: Vec::new(),
                    files: Vec::new(),
                    parsed: false,
                });
                self.dirs[dir].children.push(idx);
                self.dir_lookup.insert(off, idx);

                if recursive {
                    self.parse_dir(idx, true)?;
                }
                if child_meta.sibling_off == INVALID_ENTRY {
                    break;
                }
                off = child_meta.sibling_off;
            }
        }

        if meta.file_off != INVALID_ENTRY {
            let mut off = meta.file_off;
            loop {
                let file_meta = self.file_meta_at(off)?;
                let idx = self.files.len();
                self.files.push(RomFsFile {
                    meta_off: off,
                    parent: Some(dir),
                    name: file_meta.name,
                    offset: file_meta.data_off,
                    size: file_meta.data_size,
                });
                self.dirs[dir].files.push(idx);

                if file_meta.sibling_off == INVALID_ENTRY {
                    break;
                }
                off = file_meta.sibling_off;
            }
        }

        self.dirs[dir].parsed = true;
        Ok(())
    }

    /// Finds a directory by absolute path through the hash table.
    ///
    /// Intermediate components must have been materialized by `parse_dir`.
    pub fn find_dir(&self, path: &str) -> Option<usize> {
        if self.dirs.is_empty() {
            return None;
        }

        let mut cur = 0usize;
        for name in path.split('/').filter(|c| !c.is_empty()) {
            let parent_off = self.dirs[cur].meta_off;
            let bucket =
                calc_path_hash(parent_off, name) as usize % self.dir_hash_tbl.len().max(1);

            let mut off = *self.dir_hash_tbl.get(bucket)?;
            let target = loop {
                if off == INVALID_ENTRY {
                    return None;
                }
                let meta = self.dir_meta_at(off).ok()?;
                if meta.parent_off == parent_off && meta.name == name {
                    break off;
                }
                off = meta.next;
            };
            cur = *self.dir_lookup.get(&target)?;
        }
        Some(cur)
    }

    /// Finds a file by absolute path: hash-resolves the parent directory,
    /// then scans its file list.
    pub fn find_file(&self, path: &str) -> Option<&RomFsFile> {
        let (dir_path, name) = path.rsplit_once('/').unwrap_or(("", path));
        let dir = self.find_dir(dir_path)?;
        self.dirs[dir]
            .files
            .iter()
            .map(|&idx| &self.files[idx])
            .find(|file| file.name == name)
    }

    pub fn dir_count(&self) -> usize {
        self.dirs.len()
    }

    pub fn file_count(&self) -> usize {
        self.files.len()
    }

    pub fn dirs(&self) -> &[RomFsDir] {
        &self.dirs
    }

    pub fn files(&self) -> &[RomFsFile] {
        &self.files
    }

    pub fn header(&self) -> &RomFsHeader {
        &self.header
    }

    /// Reconstructs the absolute path of a file by walking parent links.
    pub fn file_path(&self, file: &RomFsFile) -> String {
        let mut path = format!("/{}", file.name);
        let mut parent = file.parent;
        while let Some(idx) = parent {
            let dir = &self.dirs[idx];
            if !dir.name.is_empty() {
                path.insert_str(0, &format!("/{}", dir.name));
            }
            parent = dir.parent;
        }
        path
    }

    /// Opens a file as a view over the backing source.
    pub fn open(&self, file: &RomFsFile) -> Box<dyn ByteSource> {
        Box::new(SliceSource::new(
            self.base.clone_source(),
            file.size,
            self.header.file_data_off + file.offset,
        ))
    }

    pub fn clone_base(&self) -> Box<dyn ByteSource> {
        self.base.clone_source()
    }

    /// Reads the header, hash tables and meta tables.
    fn read_tables(&mut self) -> Result<()> {
        if self.tables_read {
            return Ok(());
        }

        self.base.seek(SeekFrom::Start(0))?;
        let header: RomFsHeader = self.base.read_le()?;
        if header.header_size != RomFsHeader::SIZE {
            return Err(Error::BadMagic("RomFs"));
        }

        self.dir_hash_tbl = self.read_hash_table(header.dir_hash_tbl_off, header.dir_hash_tbl_size)?;
        self.file_hash_tbl =
            self.read_hash_table(header.file_hash_tbl_off, header.file_hash_tbl_size)?;

        self.dir_meta_tbl = vec![0u8; header.dir_meta_tbl_size as usize];
        self.base.seek(SeekFrom::Start(header.dir_meta_tbl_off))?;
        self.base.read_exact(&mut self.dir_meta_tbl)?;

        self.file_meta_tbl = vec![0u8; header.file_meta_tbl_size as usize];
        self.base.seek(SeekFrom::Start(header.file_meta_tbl_off))?;
        self.base.read_exact(&mut self.file_meta_tbl)?;

        // The format carries no entry counts; the hash tables hold at least
        // one bucket per entry, which bounds the arenas.
        self.dirs.reserve(self.dir_hash_tbl.len());
        self.files.reserve(self.file_hash_tbl.len());

        self.header = header;
        self.tables_read = true;
        Ok(())
    }

    fn read_hash_table(&mut self, offset: u64, size: u64) -> Result<Vec<u32>> {
        self.base.seek(SeekFrom::Start(offset))?;
        let mut raw = vec![0u8; size as usize];
        self.base.read_exact(&mut raw)?;
        Ok(raw
            .chunks_exact(4)
            .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect())
    }

    fn ensure_root(&mut self) -> Result<usize> {
        self.read_tables()?;
        if self.dirs.is_empty() {
            let meta = self.dir_meta_at(0)?;
            self.dirs.push(RomFsDir {
                meta_off: 0,
                parent: None,
                name: meta.name,
                children: Vec::new(),
                files: Vec::new(),
                parsed: false,
            });
            self.dir_lookup.insert(0, 0);
        }
        Ok(0)
    }

    fn dir_meta_at(&self, off: u32) -> Result<DirMeta> {
        let off = off as usize;
        let tbl = &self.dir_meta_tbl;
        if off + DIR_META_SIZE > tbl.len() {
            return Err(table_error("dir meta offset out of bounds", off));
        }
        let name_len = read_u32(tbl, off + 0x14) as usize;
        Ok(DirMeta {
            parent_off: read_u32(tbl, off),
            sibling_off: read_u32(tbl, off + 0x4),
            child_off: read_u32(tbl, off + 0x8),
            file_off: read_u32(tbl, off + 0xC),
            next: read_u32(tbl, off + 0x10),
            name: read_name(tbl, off + DIR_META_SIZE, name_len)?,
        })
    }

    fn file_meta_at(&self, off: u32) -> Result<FileMeta> {
        let off = off as usize;
        let tbl = &self.file_meta_tbl;
        if off + FILE_META_SIZE > tbl.len() {
            return Err(table_error("file meta offset out of bounds", off));
        }
        let name_len = read_u32(tbl, off + 0x1C) as usize;
        Ok(FileMeta {
            parent_off: read_u32(tbl, off),
            sibling_off: read_u32(tbl, off + 0x4),
            data_off: read_u64(tbl, off + 0x8),
            data_size: read_u64(tbl, off + 0x10),
            next: read_u32(tbl, off + 0x18),
            name: read_name(tbl, off + FILE_META_SIZE, name_len)?,
        })
    }
}

/// Path hash over `(parent meta offset, component name)`.
pub(crate) fn calc_path_hash(parent_offset: u32, name: &str) -> u32 {
    let mut hash = parent_offset ^ 123456789;
    for &c in name.as_bytes() {
        hash = hash.rotate_right(5);
        hash ^= u32::from(c);
    }
    hash
}

fn read_u32(tbl: &[u8], off: usize) -> u32 {
    u32::from_le_bytes(tbl[off..off + 4].try_into().unwrap())
}

fn read_u64(tbl: &[u8], off: usize) -> u64 {
    u64::from_le_bytes(tbl[off..off + 8].try_into().unwrap())
}

fn read_name(tbl: &[u8], off: usize, len: usize) -> Result<String> {
    let bytes = tbl
        .get(off..off + len)
        .ok_or_else(|| table_error("entry name out of bounds", off))?;
    String::from_utf8(bytes.to_vec())
        .map_err(|e| Error::InconsistentTable("RomFs", e.to_string()))
}

fn table_error(what: &str, off: usize) -> Error {
    Error::InconsistentTable("RomFs", format!("{what} ({off:#x})"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::formats::fixtures::{build_romfs, mem_source};
    use std::io::Read;

    fn sample() -> RomFs {
        let image = build_romfs(&[
            ("/a/b/c.bin", &[0xC3; 0x40]),
            ("/a/top.txt", b"top"),
            ("/readme.txt", b"read me"),
        ]);
        RomFs::new(mem_source(image))
    }

    #[test]
    fn test_find_file_via_hash_table() {
        let mut romfs = sample();
        romfs.parse_full().unwrap();

        let file = romfs.find_file("/a/b/c.bin").expect("hash lookup failed");
        assert_eq!(file.size, 0x40);
        assert_eq!(romfs.file_path(file), "/a/b/c.bin");

        assert!(romfs.find_file("/a/b/missing").is_none());
        assert!(romfs.find_dir("/nope").is_none());

        let a = romfs.find_dir("/a").unwrap();
        let names: Vec<_> = romfs.dirs()[a]
            .children
            .iter()
            .map(|&idx| romfs.dirs()[idx].name.as_str())
            .collect();
        assert_eq!(names, ["b"]);
    }

    #[test]
    fn test_open_reads_file_data() {
        let mut romfs = sample();
        romfs.parse_full().unwrap();

        let file = romfs.find_file("/readme.txt").unwrap();
        let mut data = vec![0u8; file.size as usize];
        romfs.open(file).read_exact(&mut data).unwrap();
        assert_eq!(data, b"read me");
    }

    #[test]
    fn test_on_demand_parses_one_level() {
        let mut romfs = sample();
        romfs.parse().unwrap();

        // Root level only: "a" is visible, "b" below it is not yet.
        let a = romfs.find_dir("/a").unwrap();
        assert!(romfs.find_dir("/a/b").is_none());

        romfs.parse_dir(a, false).unwrap();
        assert!(romfs.find_dir("/a/b").is_some());
    }

    #[test]
    fn test_parse_dir_runs_once() {
        let mut romfs = sample();
        romfs.parse().unwrap();
        let before = romfs.dir_count();

        // Double-entry on the already-parsed root must not duplicate entries.
        romfs.parse_dir(0, false).unwrap();
        romfs.parse_dir(0, false).unwrap();
        assert_eq!(romfs.dir_count(), before);
    }

    #[test]
    fn test_parse_fast_flat_lists() {
        let mut romfs = sample();
        romfs.parse_fast().unwrap();

        // Root + a + b, and all three files, without linkage.
        assert_eq!(romfs.dir_count(), 3);
        assert_eq!(romfs.file_count(), 3);
        assert!(romfs.dirs().iter().all(|d| d.children.is_empty()));
    }

    #[test]
    fn test_file_ranges_disjoint_and_bounded() {
        let image = build_romfs(&[
            ("/x.bin", &[1; 0x31]),
            ("/y.bin", &[2; 0x17]),
            ("/z/w.bin", &[3; 0x100]),
        ]);
        let total = image.len() as u64;
        let mut romfs = RomFs::new(mem_source(image));
        romfs.parse_full().unwrap();

        let data_region = total - romfs.header().file_data_off;
        let mut ranges: Vec<(u64, u64)> = romfs
            .files()
            .iter()
            .map(|f| (f.offset, f.offset + f.size))
            .collect();
        ranges.sort();
        for window in ranges.windows(2) {
            assert!(window[0].1 <= window[1].0, "overlapping file ranges");
        }
        assert!(ranges.iter().all(|&(_, end)| end <= data_region));
    }

    #[test]
    fn test_not_a_romfs() {
        let mut romfs = RomFs::new(mem_source(vec![0u8; 0x100]));
        assert!(matches!(romfs.parse(), Err(Error::BadMagic("RomFs"))));
    }
}
