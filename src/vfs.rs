//! Lazy virtual filesystem over a container stack.
//!
//! Opening a host file probes it for a recognized format and mounts it as
//! the root folder. Folders are processed on first traversal: their
//! container enumerates entries, and every entry flagged for probing is
//! speculatively opened as a nested container: success promotes it to a
//! sub-folder, failure leaves it as a plain file. Processed nodes are
//! registered in path-indexed maps so FUSE-style hosts get cheap lookups.

use std::collections::HashMap;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use crate::containers::{
    Container, HfsContainer, NcaContainer, PfsContainer, RomFsContainer, XciContainer,
};
use crate::error::{Error, Result};
use crate::formats::{self, Format, PROBE_SIZE};
use crate::io::{read_to_fill, ByteSource};
use crate::keys::{Keys, RightsId};

/// Minimum size of a ticket file.
const TIK_SIZE: u64 = 0x2C0;
/// Rights ID position inside a ticket.
const TIK_RIGHTS_ID_OFFSET: usize = 0x2A0;
/// Title key position inside a ticket.
const TIK_TITLE_KEY_OFFSET: usize = 0x180;

/// Node kind reported by [`FileSystem::stat`] and `readdir`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stat {
    Dir,
    File { size: u64 },
    NotFound,
}

/// A leaf file; reads go through the stacked byte source that backs it.
pub struct VfsFile {
    name: String,
    size: u64,
    source: Mutex<Box<dyn ByteSource>>,
}

impl VfsFile {
    fn new(name: String, source: Box<dyn ByteSource>) -> Self {
        Self {
            name,
            size: source.size(),
            source: Mutex::new(source),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// Reads up to `buf.len()` bytes at `offset`; reads past end are short.
    pub fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        let mut source = self.source.lock().unwrap();
        source.seek(SeekFrom::Start(offset))?;
        read_to_fill(&mut *source, buf)
    }

    /// Probes this file for a recognized container format and, on success,
    /// mounts it as a folder named after the file stem.
    ///
    /// The probe runs on a fresh clone so the file's own cursor is
    /// untouched. A parse failure is not fatal: the entry stays a raw file.
    fn make_container(&self, keys: &Arc<Keys>) -> Option<Arc<VfsFolder>> {
        let mut probe = [0u8; PROBE_SIZE];
        {
            let source = self.source.lock().unwrap();
            let mut cursor = source.clone_source();
            if read_to_fill(&mut cursor, &mut probe).is_err() {
                return None;
            }
        }

        let format = formats::detect(&probe, keys)?;
        let base = self.source.lock().unwrap().clone_source();
        let mut container: Box<dyn Container> = match format {
            Format::Pfs => Box::new(PfsContainer::new(base)),
            Format::Hfs => Box::new(HfsContainer::new(base)),
            Format::RomFs => Box::new(RomFsContainer::new(base)),
            Format::Nca => Box::new(NcaContainer::new(base, Arc::clone(keys))),
            Format::Xci => Box::new(XciContainer::new(base)),
        };

        if let Err(e) = container.parse() {
            tracing::warn!(name = %self.name, format = container.name(), "parse failed: {e}");
            return None;
        }

        if format == Format::Pfs {
            load_ticket_keys(container.as_mut(), keys);
        }

        let stem = match self.name.rfind('.') {
            Some(pos) => self.name[..pos].to_string(),
            None => self.name.clone(),
        };
        Some(Arc::new(VfsFolder::with_container(stem, container)))
    }
}

/// Installation tickets ride along inside PFS containers; pulling their
/// title keys before sibling NCAs parse lets rights-protected content mount
/// without a pre-populated title key database.
fn load_ticket_keys(container: &mut dyn Container, keys: &Arc<Keys>) {
    for entry in container.read_files() {
        let mut source = entry.source;
        if !entry.name.ends_with(".tik") || source.size() < TIK_SIZE {
            continue;
        }

        let mut ticket = [0u8; TIK_SIZE as usize];
        if source.read_exact(&mut ticket).is_err() {
            tracing::warn!(name = %entry.name, "failed to read ticket");
            continue;
        }

        let mut rights_id = RightsId::default();
        rights_id.copy_from_slice(&ticket[TIK_RIGHTS_ID_OFFSET..TIK_RIGHTS_ID_OFFSET + 0x10]);
        let mut key = [0u8; 0x10];
        key.copy_from_slice(&ticket[TIK_TITLE_KEY_OFFSET..TIK_TITLE_KEY_OFFSET + 0x10]);

        tracing::info!(
            ticket = %entry.name,
            rights_id = %hex::encode(rights_id),
            "loading title key from ticket"
        );
        keys.set_title_key(rights_id, key);
    }
}

struct FolderState {
    processed: bool,
    container: Option<Box<dyn Container>>,
    children: Vec<Arc<VfsFolder>>,
    files: Vec<Arc<VfsFile>>,
}

/// A folder in the tree, lazily processed on first traversal.
pub struct VfsFolder {
    name: String,
    state: Mutex<FolderState>,
}

impl VfsFolder {
    fn with_container(name: String, container: Box<dyn Container>) -> Self {
        Self {
            name,
            state: Mutex::new(FolderState {
                processed: false,
                container: Some(container),
                children: Vec::new(),
                files: Vec::new(),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_processed(&self) -> bool {
        self.state.lock().unwrap().processed
    }

    /// Short format name of the backing container.
    pub fn container_name(&self) -> Option<&'static str> {
        self.state
            .lock()
            .unwrap()
            .container
            .as_ref()
            .map(|c| c.name())
    }

    pub fn children(&self) -> Vec<Arc<VfsFolder>> {
        self.state.lock().unwrap().children.clone()
    }

    pub fn files(&self) -> Vec<Arc<VfsFile>> {
        self.state.lock().unwrap().files.clone()
    }

    /// Enumerates the backing container into children and files.
    ///
    /// Guarded by the folder lock and idempotent: the body runs exactly
    /// once, double entry is a no-op, and after it returns the child lists
    /// are immutable.
    fn process(&self, keep_raw: bool, keys: &Arc<Keys>) {
        let mut guard = self.state.lock().unwrap();
        if guard.processed {
            return;
        }

        let state = &mut *guard;
        if let Some(container) = state.container.as_mut() {
            for entry in container.read_files() {
                let file = Arc::new(VfsFile::new(entry.name, entry.source));

                let mut keep_file = keep_raw;
                if entry.try_container {
                    match file.make_container(keys) {
                        Some(folder) => state.children.push(folder),
                        None => keep_file = true,
                    }
                }
                if !entry.try_container || keep_file {
                    state.files.push(file);
                }
            }

            for dir in container.read_folders() {
                state
                    .children
                    .push(Arc::new(VfsFolder::with_container(dir.name, dir.container)));
            }
        }

        state.processed = true;
    }
}

/// The virtual filesystem: a lazily processed tree plus path-indexed maps.
pub struct FileSystem {
    keys: Arc<Keys>,
    keep_raw: AtomicBool,
    files: RwLock<HashMap<String, Arc<VfsFile>>>,
    folders: RwLock<HashMap<String, Arc<VfsFolder>>>,
}

impl FileSystem {
    /// Mounts a host file as the filesystem root.
    ///
    /// Fails when the file cannot be opened or its format is not
    /// recognized; everything past the root degrades gracefully instead.
    pub fn new<P: AsRef<Path>>(path: P, keys: Arc<Keys>) -> Result<Self> {
        let base = crate::io::open(path.as_ref()).map_err(|e| {
            tracing::error!(path = %path.as_ref().display(), "cannot open container: {e}");
            e
        })?;
        Self::from_source(Box::new(base), keys)
    }

    /// Mounts an already-opened byte source as the filesystem root.
    pub fn from_source(source: Box<dyn ByteSource>, keys: Arc<Keys>) -> Result<Self> {
        let root_file = VfsFile::new(String::new(), source);
        let root = root_file
            .make_container(&keys)
            .ok_or(Error::BadMagic("container"))?;

        let fs = Self {
            keys,
            keep_raw: AtomicBool::new(false),
            files: RwLock::new(HashMap::new()),
            folders: RwLock::new(HashMap::new()),
        };
        fs.add_folder("/".to_string(), root);
        Ok(fs)
    }

    /// Keeps container-typed entries as raw files alongside their mounted
    /// folder instead of replacing them.
    pub fn set_keep_raw(&self, keep: bool) {
        self.keep_raw.store(keep, Ordering::Relaxed);
    }

    fn add_folder(&self, path: String, node: Arc<VfsFolder>) {
        self.folders.write().unwrap().entry(path).or_insert(node);
    }

    fn add_file(&self, path: String, node: Arc<VfsFile>) {
        self.files.write().unwrap().entry(path).or_insert(node);
    }

    /// Cached folder lookup; never triggers processing.
    pub fn get_folder(&self, path: &str) -> Option<Arc<VfsFolder>> {
        self.folders
            .read()
            .unwrap()
            .get(&normalize_path(path))
            .cloned()
    }

    /// Cached file lookup; never triggers processing.
    pub fn get_file(&self, path: &str) -> Option<Arc<VfsFile>> {
        self.files
            .read()
            .unwrap()
            .get(&normalize_path(path))
            .cloned()
    }

    /// Ensures the folder at `path` has been processed and registers its
    /// children in the path maps.
    pub fn process_dir(&self, path: &str) -> Option<Arc<VfsFolder>> {
        let norm = normalize_path(path);
        let folder = self.get_folder(&norm)?;
        folder.process(self.keep_raw.load(Ordering::Relaxed), &self.keys);

        // Registration is re-run even for an already-processed folder: a
        // caller that observes the processed flag must also find the full
        // child list in the maps.
        for child in folder.children() {
            self.add_folder(join_path(&norm, child.name()), child);
        }
        for file in folder.files() {
            self.add_file(join_path(&norm, file.name()), file);
        }
        Some(folder)
    }

    /// Walks to a folder component by component, processing along the way.
    pub fn find_folder(&self, path: &str) -> Option<Arc<VfsFolder>> {
        let norm = normalize_path(path);
        let mut cur_path = String::from("/");
        let mut cur = self.process_dir(&cur_path)?;

        for comp in norm.split('/').filter(|c| !c.is_empty()) {
            cur_path = join_path(&cur_path, comp);
            cur = self.process_dir(&cur_path)?;
        }
        Some(cur)
    }

    /// Resolves a file, processing its parent folders as needed.
    pub fn find_file(&self, path: &str) -> Option<Arc<VfsFile>> {
        let norm = normalize_path(path);
        if let Some(file) = self.get_file(&norm) {
            return Some(file);
        }
        let (dir, _) = norm.rsplit_once('/')?;
        self.find_folder(if dir.is_empty() { "/" } else { dir })?;
        self.get_file(&norm)
    }

    /// Pure map lookup, FUSE `getattr` style: reports only what previous
    /// traversals have registered.
    pub fn stat(&self, path: &str) -> Stat {
        if self.get_folder(path).is_some() {
            Stat::Dir
        } else if let Some(file) = self.get_file(path) {
            Stat::File { size: file.size() }
        } else {
            Stat::NotFound
        }
    }

    /// Lists a directory, processing it first.
    pub fn readdir(&self, path: &str) -> Option<Vec<(String, Stat)>> {
        let dir = self.process_dir(path)?;
        let mut out = Vec::new();
        for child in dir.children() {
            out.push((child.name().to_string(), Stat::Dir));
        }
        for file in dir.files() {
            out.push((
                file.name().to_string(),
                Stat::File { size: file.size() },
            ));
        }
        Some(out)
    }

    /// Reads from a file at `offset`, resolving it first.
    pub fn read(&self, path: &str, buf: &mut [u8], offset: u64) -> Result<usize> {
        let file = self
            .find_file(path)
            .ok_or_else(|| Error::NotFound(path.to_string()))?;
        Ok(file.read_at(buf, offset)?)
    }

    /// Depth-limited walk; callbacks returning `true` abort the walk.
    ///
    /// Folders are processed lazily as the walk descends. Returns whether
    /// the walk was stopped.
    pub fn walk(
        &self,
        location: &str,
        depth: usize,
        on_folder: &mut dyn FnMut(&str) -> bool,
        on_file: &mut dyn FnMut(&str) -> bool,
    ) -> bool {
        if depth == 0 {
            return false;
        }

        let norm = normalize_path(location);
        let Some(dir) = self.process_dir(&norm) else {
            return true;
        };

        for child in dir.children() {
            let path = join_path(&norm, child.name());
            self.process_dir(&path);

            if on_folder(&path) {
                return true;
            }
            if self.walk(&path, depth - 1, on_folder, on_file) {
                return true;
            }
        }

        for file in dir.files() {
            if on_file(&join_path(&norm, file.name())) {
                return true;
            }
        }
        false
    }
}

/// Normalizes to an absolute, `/`-separated path: backslashes are
/// separators, `.` and empty components collapse, the root is `/`.
pub(crate) fn normalize_path(path: &str) -> String {
    let mut out = String::from("/");
    for comp in path.split(['/', '\\']) {
        if comp.is_empty() || comp == "." {
            continue;
        }
        if out.len() > 1 {
            out.push('/');
        }
        out.push_str(comp);
    }
    out
}

fn join_path(base: &str, name: &str) -> String {
    if base == "/" {
        format!("/{name}")
    } else {
        format!("{base}/{name}")
    }
}
