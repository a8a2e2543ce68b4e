//! Uniform container interface over the format parsers.
//!
//! A [`Container`] exposes what the virtual filesystem needs: parse once,
//! then enumerate files as `(name, byte source, try-as-container)` triples
//! and sub-containers as `(name, container)` pairs. Only RomFS has real
//! sub-directories; the other formats are flat and project their structure
//! as files (NCA sections, XCI partitions).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::error::Result;
use crate::formats::nca::SectionKind;
use crate::formats::{Hfs0, Nca, Pfs0, RomFs, Xci};
use crate::io::ByteSource;
use crate::keys::Keys;

/// File extensions worth probing as nested containers when enumerating a
/// RomFS. Everything else inside a RomFS is game data.
const EXTENSION_WHITELIST: [&str; 6] = ["nca", "nsp", "pfs", "romfs", "hfs", "xci"];

static SEARCH_ALL: AtomicBool = AtomicBool::new(false);

/// Probes every RomFS file as a container, regardless of extension.
pub fn set_search_all_containers(enable: bool) {
    SEARCH_ALL.store(enable, Ordering::Relaxed);
}

fn should_try_container(name: &str) -> bool {
    if SEARCH_ALL.load(Ordering::Relaxed) {
        return true;
    }
    let ext = name.rsplit('.').next().unwrap_or("");
    EXTENSION_WHITELIST.contains(&ext)
}

/// A file produced by a container enumeration.
pub struct ContainerFile {
    pub name: String,
    pub source: Box<dyn ByteSource>,
    /// Whether the consumer should speculatively probe this file as a
    /// nested container.
    pub try_container: bool,
}

/// A sub-container produced by a container enumeration.
pub struct ContainerDir {
    pub name: String,
    pub container: Box<dyn Container>,
}

/// Capability set the virtual filesystem drives containers through.
pub trait Container: Send {
    fn parse(&mut self) -> Result<()>;

    /// Short format name: "Pfs", "Hfs", "RomFs", "Nca" or "Xci".
    fn name(&self) -> &'static str;

    fn read_files(&mut self) -> Vec<ContainerFile> {
        Vec::new()
    }

    fn read_folders(&mut self) -> Vec<ContainerDir> {
        Vec::new()
    }
}

pub struct PfsContainer {
    inner: Pfs0,
}

impl PfsContainer {
    pub fn new(base: Box<dyn ByteSource>) -> Self {
        Self {
            inner: Pfs0::new(base),
        }
    }
}

impl Container for PfsContainer {
    fn parse(&mut self) -> Result<()> {
        self.inner.parse()
    }

    fn name(&self) -> &'static str {
        "Pfs"
    }

    fn read_files(&mut self) -> Vec<ContainerFile> {
        self.inner
            .entries()
            .iter()
            .map(|entry| ContainerFile {
                name: entry.name.clone(),
                source: self.inner.open(entry),
                try_container: true,
            })
            .collect()
    }
}

pub struct HfsContainer {
    inner: Hfs0,
}

impl HfsContainer {
    pub fn new(base: Box<dyn ByteSource>) -> Self {
        Self {
            inner: Hfs0::new(base),
        }
    }
}

impl Container for HfsContainer {
    fn parse(&mut self) -> Result<()> {
        self.inner.parse()
    }

    fn name(&self) -> &'static str {
        "Hfs"
    }

    fn read_files(&mut self) -> Vec<ContainerFile> {
        self.inner
            .entries()
            .iter()
            .map(|entry| ContainerFile {
                name: entry.name.clone(),
                source: self.inner.open(entry),
                try_container: true,
            })
            .collect()
    }
}

/// RomFS adapter; one instance is a view onto a single directory.
///
/// Sub-directory views created by [`read_folders`](Container::read_folders)
/// share the parser, and the parser's per-directory once-flag keeps
/// `parse_dir` from running more than once per directory even when several
/// views race.
pub struct RomFsContainer {
    romfs: Arc<Mutex<RomFs>>,
    path: String,
}

impl RomFsContainer {
    pub fn new(base: Box<dyn ByteSource>) -> Self {
        Self {
            romfs: Arc::new(Mutex::new(RomFs::new(base))),
            path: String::from("/"),
        }
    }

    fn subdir_view(&self, name: &str) -> Self {
        Self {
            romfs: Arc::clone(&self.romfs),
            path: format!("{}{}/", self.path, name),
        }
    }
}

impl Container for RomFsContainer {
    fn parse(&mut self) -> Result<()> {
        self.romfs.lock().unwrap().parse()
    }

    fn name(&self) -> &'static str {
        "RomFs"
    }

    fn read_files(&mut self) -> Vec<ContainerFile> {
        let mut romfs = self.romfs.lock().unwrap();
        let Some(dir) = romfs.find_dir(&self.path) else {
            return Vec::new();
        };
        if let Err(e) = romfs.parse_dir(dir, false) {
            tracing::warn!(path = %self.path, "failed to parse RomFS directory: {e}");
            return Vec::new();
        }

        romfs.dirs()[dir]
            .files
            .clone()
            .into_iter()
            .map(|idx| {
                let file = &romfs.files()[idx];
                ContainerFile {
                    name: file.name.clone(),
                    source: romfs.open(file),
                    try_container: should_try_container(&file.name),
                }
            })
            .collect()
    }

    fn read_folders(&mut self) -> Vec<ContainerDir> {
        let names = {
            let mut romfs = self.romfs.lock().unwrap();
            let Some(dir) = romfs.find_dir(&self.path) else {
                return Vec::new();
            };
            if let Err(e) = romfs.parse_dir(dir, false) {
                tracing::warn!(path = %self.path, "failed to parse RomFS directory: {e}");
                return Vec::new();
            }
            romfs.dirs()[dir]
                .children
                .iter()
                .map(|&idx| romfs.dirs()[idx].name.clone())
                .collect::<Vec<_>>()
        };

        names
            .into_iter()
            .map(|name| ContainerDir {
                container: Box::new(self.subdir_view(&name)),
                name,
            })
            .collect()
    }
}

pub struct NcaContainer {
    inner: Nca,
}

impl NcaContainer {
    pub fn new(base: Box<dyn ByteSource>, keys: Arc<Keys>) -> Self {
        Self {
            inner: Nca::new(base, keys),
        }
    }
}

impl Container for NcaContainer {
    fn parse(&mut self) -> Result<()> {
        self.inner.parse()
    }

    fn name(&self) -> &'static str {
        "Nca"
    }

    fn read_files(&mut self) -> Vec<ContainerFile> {
        self.inner
            .sections()
            .iter()
            .enumerate()
            .map(|(idx, section)| {
                let ext = match section.kind() {
                    SectionKind::Pfs => "nsp",
                    SectionKind::RomFs => "romfs",
                };
                ContainerFile {
                    name: format!("section {idx}.{ext}"),
                    source: section.clone_base(),
                    try_container: true,
                }
            })
            .collect()
    }
}

pub struct XciContainer {
    inner: Xci,
}

impl XciContainer {
    pub fn new(base: Box<dyn ByteSource>) -> Self {
        Self {
            inner: Xci::new(base),
        }
    }
}

impl Container for XciContainer {
    fn parse(&mut self) -> Result<()> {
        self.inner.parse()
    }

    fn name(&self) -> &'static str {
        "Xci"
    }

    fn read_files(&mut self) -> Vec<ContainerFile> {
        self.inner
            .partitions()
            .iter()
            .map(|partition| ContainerFile {
                name: format!("{}.hfs", partition.name()),
                source: partition.clone_base(),
                try_container: true,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::formats::fixtures::{build_pfs0, build_romfs, mem_source};

    #[test]
    fn test_extension_whitelist() {
        assert!(should_try_container("content.nca"));
        assert!(should_try_container("update.nsp"));
        assert!(should_try_container("a.b.xci"));
        assert!(!should_try_container("model.bin"));
        assert!(!should_try_container("texture"));

        set_search_all_containers(true);
        assert!(should_try_container("model.bin"));
        set_search_all_containers(false);
    }

    #[test]
    fn test_pfs_container_files() {
        let image = build_pfs0(&[("a.txt", b"AAA"), ("b.nca", b"not really")]);
        let mut container = PfsContainer::new(mem_source(image));
        container.parse().unwrap();

        let files = container.read_files();
        assert_eq!(files.len(), 2);
        assert_eq!(files[0].name, "a.txt");
        // PFS entries are always probed.
        assert!(files.iter().all(|f| f.try_container));
    }

    #[test]
    fn test_romfs_container_views() {
        let image = build_romfs(&[("/dir/inner.bin", b"x"), ("/top.nca", b"y")]);
        let mut container = RomFsContainer::new(mem_source(image));
        container.parse().unwrap();

        let files = container.read_files();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].name, "top.nca");
        assert!(files[0].try_container);

        let mut folders = container.read_folders();
        assert_eq!(folders.len(), 1);
        assert_eq!(folders[0].name, "dir");

        // The sub-view enumerates its own directory; extension filtering
        // applies to RomFS payloads.
        let inner_files = folders[0].container.read_files();
        assert_eq!(inner_files.len(), 1);
        assert_eq!(inner_files[0].name, "inner.bin");
        assert!(!inner_files[0].try_container);
    }
}
