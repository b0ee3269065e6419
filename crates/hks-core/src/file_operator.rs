//! File I/O seam. The keystores talk to storage only through [`FileOperator`], so the same
//! engine runs over the host file system or over an in-memory tree in tests.

use std::{
    collections::{BTreeMap, BTreeSet},
    fs::{self, OpenOptions},
    io::{self, Read, Seek, SeekFrom, Write},
    path::{Component, Path, PathBuf},
};

use fs2::FileExt;
use parking_lot::{Mutex, RwLock};
use tracing::debug;

use crate::{
    error::{HksError, HksResult},
    fs_utils,
};

pub trait FileOperator: Send + Sync {
    /// Read up to `buf.len()` bytes starting at `offset`. A missing file reads as 0 bytes.
    fn read(&self, dir: &Path, name: &str, offset: u64, buf: &mut [u8]) -> HksResult<usize>;
    /// Create or truncate the file, then write `data` at `offset`. The file ends up `0600`.
    fn write(&self, dir: &Path, name: &str, offset: u64, data: &[u8]) -> HksResult<()>;
    /// Remove a file. Missing is success; a directory is an error.
    fn remove(&self, dir: &Path, name: &str) -> HksResult<()>;
    fn exists(&self, dir: &Path, name: &str) -> HksResult<bool>;
    /// Length in bytes. Missing and empty files both report 0.
    fn size(&self, dir: &Path, name: &str) -> HksResult<u64>;
    /// Regular files directly inside `dir`. An unreadable or missing directory yields nothing.
    fn list_dir(&self, dir: &Path) -> DirEntries;
    fn make_dir(&self, dir: &Path) -> HksResult<()>;
    fn dir_exists(&self, dir: &Path) -> bool;
    /// Remove an empty directory.
    fn remove_dir(&self, dir: &Path) -> HksResult<()>;
    /// Remove a directory tree. A missing tree is success.
    fn remove_dir_all(&self, dir: &Path) -> HksResult<()>;

    /// Read the whole file. Callers check existence first; a missing file reads as empty.
    fn read_to_vec(&self, dir: &Path, name: &str) -> HksResult<Vec<u8>> {
        let size = usize::try_from(self.size(dir, name)?)
            .map_err(|_| HksError::FileSizeFail(dir.join(name).display().to_string()))?;
        let mut buf = Vec::new();
        buf.try_reserve_exact(size)
            .map_err(|_| HksError::MallocFail(size))?;
        buf.resize(size, 0);
        let read = self.read(dir, name, 0, &mut buf)?;
        buf.truncate(read);
        Ok(buf)
    }
}

/// Reject names that could escape the directory they are resolved against.
pub fn check_path(dir: &Path, name: &str) -> HksResult<PathBuf> {
    if dir.components().any(|c| matches!(c, Component::ParentDir)) {
        return Err(HksError::invalid(format!(
            "directory {} contains a parent reference",
            dir.display()
        )));
    }
    if name.is_empty() || name == "." || name == ".." || name.contains('/') || name.contains('\0')
    {
        return Err(HksError::invalid(format!("illegal file name {name:?}")));
    }
    Ok(dir.join(name))
}

fn check_dir(dir: &Path) -> HksResult<()> {
    if dir.components().any(|c| matches!(c, Component::ParentDir)) {
        return Err(HksError::invalid(format!(
            "directory {} contains a parent reference",
            dir.display()
        )));
    }
    Ok(())
}

enum EntriesInner {
    Empty,
    Fs(fs::ReadDir),
    Listed(std::vec::IntoIter<String>),
}

/// Single-pass iterator over regular-file names in one directory.
pub struct DirEntries {
    inner: EntriesInner,
}

impl DirEntries {
    pub fn empty() -> Self {
        Self {
            inner: EntriesInner::Empty,
        }
    }

    fn from_names(names: Vec<String>) -> Self {
        Self {
            inner: EntriesInner::Listed(names.into_iter()),
        }
    }
}

impl Iterator for DirEntries {
    type Item = String;

    fn next(&mut self) -> Option<String> {
        match &mut self.inner {
            EntriesInner::Empty => None,
            EntriesInner::Listed(names) => names.next(),
            EntriesInner::Fs(read_dir) => loop {
                let entry = match read_dir.next()? {
                    Ok(entry) => entry,
                    Err(err) => {
                        debug!(error = %err, "skipping unreadable directory entry");
                        continue;
                    }
                };
                let is_file = entry.file_type().map(|t| t.is_file()).unwrap_or(false);
                if !is_file {
                    continue;
                }
                match entry.file_name().into_string() {
                    Ok(name) => return Some(name),
                    Err(raw) => {
                        debug!(name = ?raw, "skipping non UTF-8 file name");
                        continue;
                    }
                }
            },
        }
    }
}

/// Host file system adapter with owner-only permissions and advisory locks around each call.
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalFileOperator;

impl LocalFileOperator {
    pub fn new() -> Self {
        Self
    }
}

impl FileOperator for LocalFileOperator {
    fn read(&self, dir: &Path, name: &str, offset: u64, buf: &mut [u8]) -> HksResult<usize> {
        let path = check_path(dir, name)?;
        let mut file = match fs::File::open(&path) {
            Ok(file) => file,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(0),
            Err(err) => return Err(HksError::open_file(&path, err)),
        };
        FileExt::lock_shared(&file).map_err(|e| HksError::read_file(&path, e))?;
        let result = read_at(&mut file, offset, buf);
        FileExt::unlock(&file).map_err(|e| HksError::read_file(&path, e))?;
        result.map_err(|e| HksError::read_file(&path, e))
    }

    fn write(&self, dir: &Path, name: &str, offset: u64, data: &[u8]) -> HksResult<()> {
        let path = check_path(dir, name)?;
        let mut options = OpenOptions::new();
        options.create(true).write(true).truncate(true);
        let mut file =
            fs_utils::open_secure(&path, &mut options).map_err(|e| HksError::open_file(&path, e))?;
        FileExt::lock_exclusive(&file).map_err(|e| HksError::write_file(&path, e))?;
        let result = (|| {
            file.seek(SeekFrom::Start(offset))?;
            file.write_all(data)?;
            file.sync_all()
        })();
        FileExt::unlock(&file).map_err(|e| HksError::write_file(&path, e))?;
        result.map_err(|e| HksError::write_file(&path, e))
    }

    fn remove(&self, dir: &Path, name: &str) -> HksResult<()> {
        let path = check_path(dir, name)?;
        match fs::symlink_metadata(&path) {
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(err) => return Err(HksError::remove_file(&path, err)),
            Ok(meta) if meta.is_dir() => {
                return Err(HksError::remove_file(&path, "target is a directory"));
            }
            Ok(_) => {}
        }
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(HksError::remove_file(&path, err)),
        }
    }

    fn exists(&self, dir: &Path, name: &str) -> HksResult<bool> {
        let path = check_path(dir, name)?;
        Ok(path.is_file())
    }

    fn size(&self, dir: &Path, name: &str) -> HksResult<u64> {
        let path = check_path(dir, name)?;
        match fs::metadata(&path) {
            Ok(meta) => Ok(meta.len()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(0),
            Err(err) => Err(HksError::FileSizeFail(format!("{}: {err}", path.display()))),
        }
    }

    fn list_dir(&self, dir: &Path) -> DirEntries {
        if check_dir(dir).is_err() {
            return DirEntries::empty();
        }
        match fs::read_dir(dir) {
            Ok(read_dir) => DirEntries {
                inner: EntriesInner::Fs(read_dir),
            },
            Err(err) => {
                debug!(dir = %dir.display(), error = %err, "directory not listable");
                DirEntries::empty()
            }
        }
    }

    fn make_dir(&self, dir: &Path) -> HksResult<()> {
        check_dir(dir)?;
        fs_utils::ensure_secure_dir(dir)
    }

    fn dir_exists(&self, dir: &Path) -> bool {
        dir.is_dir()
    }

    fn remove_dir(&self, dir: &Path) -> HksResult<()> {
        check_dir(dir)?;
        fs::remove_dir(dir).map_err(|e| HksError::remove_file(dir, e))
    }

    fn remove_dir_all(&self, dir: &Path) -> HksResult<()> {
        check_dir(dir)?;
        match fs::remove_dir_all(dir) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(HksError::remove_file(dir, err)),
        }
    }
}

fn read_at(file: &mut fs::File, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
    file.seek(SeekFrom::Start(offset))?;
    let mut filled = 0;
    while filled < buf.len() {
        match file.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err),
        }
    }
    Ok(filled)
}

#[derive(Default)]
struct MemoryTree {
    files: BTreeMap<PathBuf, Vec<u8>>,
    dirs: BTreeSet<PathBuf>,
}

impl MemoryTree {
    fn add_dir_chain(&mut self, dir: &Path) {
        for ancestor in dir.ancestors() {
            if ancestor.as_os_str().is_empty() {
                break;
            }
            self.dirs.insert(ancestor.to_path_buf());
        }
    }
}

/// In-memory file tree for tests. Writes below a registered prefix can be made to fail.
#[derive(Default)]
pub struct MemoryFileOperator {
    tree: RwLock<MemoryTree>,
    failing_prefixes: Mutex<Vec<PathBuf>>,
}

impl MemoryFileOperator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every later write (file or directory) below `prefix` fail.
    pub fn fail_writes_under(&self, prefix: impl Into<PathBuf>) {
        self.failing_prefixes.lock().push(prefix.into());
    }

    pub fn clear_failures(&self) {
        self.failing_prefixes.lock().clear();
    }

    /// Raw contents at an absolute path, bypassing every check.
    pub fn raw(&self, path: &Path) -> Option<Vec<u8>> {
        self.tree.read().files.get(path).cloned()
    }

    pub fn file_count(&self) -> usize {
        self.tree.read().files.len()
    }

    fn write_blocked(&self, path: &Path) -> bool {
        self.failing_prefixes
            .lock()
            .iter()
            .any(|prefix| path.starts_with(prefix))
    }
}

impl FileOperator for MemoryFileOperator {
    fn read(&self, dir: &Path, name: &str, offset: u64, buf: &mut [u8]) -> HksResult<usize> {
        let path = check_path(dir, name)?;
        let tree = self.tree.read();
        let Some(data) = tree.files.get(&path) else {
            return Ok(0);
        };
        let start = usize::try_from(offset).unwrap_or(usize::MAX).min(data.len());
        let count = buf.len().min(data.len() - start);
        buf[..count].copy_from_slice(&data[start..start + count]);
        Ok(count)
    }

    fn write(&self, dir: &Path, name: &str, offset: u64, data: &[u8]) -> HksResult<()> {
        let path = check_path(dir, name)?;
        if self.write_blocked(&path) {
            return Err(HksError::write_file(&path, "injected write failure"));
        }
        let mut tree = self.tree.write();
        if !tree.dirs.contains(dir) {
            return Err(HksError::open_file(&path, "parent directory missing"));
        }
        if tree.dirs.contains(&path) {
            return Err(HksError::open_file(&path, "target is a directory"));
        }
        let offset = usize::try_from(offset).map_err(|e| HksError::write_file(&path, e))?;
        let mut contents = vec![0u8; offset];
        contents.extend_from_slice(data);
        tree.files.insert(path, contents);
        Ok(())
    }

    fn remove(&self, dir: &Path, name: &str) -> HksResult<()> {
        let path = check_path(dir, name)?;
        let mut tree = self.tree.write();
        if tree.dirs.contains(&path) {
            return Err(HksError::remove_file(&path, "target is a directory"));
        }
        tree.files.remove(&path);
        Ok(())
    }

    fn exists(&self, dir: &Path, name: &str) -> HksResult<bool> {
        let path = check_path(dir, name)?;
        Ok(self.tree.read().files.contains_key(&path))
    }

    fn size(&self, dir: &Path, name: &str) -> HksResult<u64> {
        let path = check_path(dir, name)?;
        Ok(self
            .tree
            .read()
            .files
            .get(&path)
            .map_or(0, |data| data.len() as u64))
    }

    fn list_dir(&self, dir: &Path) -> DirEntries {
        let tree = self.tree.read();
        let names = tree
            .files
            .keys()
            .filter(|path| path.parent() == Some(dir))
            .filter_map(|path| path.file_name()?.to_str().map(str::to_owned))
            .collect();
        DirEntries::from_names(names)
    }

    fn make_dir(&self, dir: &Path) -> HksResult<()> {
        check_dir(dir)?;
        if self.write_blocked(dir) {
            return Err(HksError::make_dir(dir, "injected mkdir failure"));
        }
        let mut tree = self.tree.write();
        if tree.files.contains_key(dir) {
            return Err(HksError::make_dir(dir, "exists and is not a directory"));
        }
        tree.add_dir_chain(dir);
        Ok(())
    }

    fn dir_exists(&self, dir: &Path) -> bool {
        self.tree.read().dirs.contains(dir)
    }

    fn remove_dir(&self, dir: &Path) -> HksResult<()> {
        check_dir(dir)?;
        let mut tree = self.tree.write();
        let occupied = tree.files.keys().any(|p| p.parent() == Some(dir))
            || tree.dirs.iter().any(|p| p.parent() == Some(dir));
        if occupied {
            return Err(HksError::remove_file(dir, "directory not empty"));
        }
        if !tree.dirs.remove(dir) {
            return Err(HksError::remove_file(dir, "no such directory"));
        }
        Ok(())
    }

    fn remove_dir_all(&self, dir: &Path) -> HksResult<()> {
        check_dir(dir)?;
        let mut tree = self.tree.write();
        tree.files.retain(|path, _| !path.starts_with(dir));
        tree.dirs.retain(|path| !path.starts_with(dir));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn exercise(ops: &dyn FileOperator, root: &Path) {
        let dir = root.join("proc").join("key");
        ops.make_dir(&dir).expect("mkdir");
        ops.make_dir(&dir).expect("mkdir again");

        assert_eq!(ops.size(&dir, "a").expect("size"), 0);
        assert!(!ops.exists(&dir, "a").expect("exists"));
        let mut buf = [0u8; 4];
        assert_eq!(ops.read(&dir, "a", 0, &mut buf).expect("read missing"), 0);

        ops.write(&dir, "a", 0, b"hello").expect("write");
        ops.write(&dir, "b", 0, b"").expect("write empty");
        assert!(ops.exists(&dir, "b").expect("exists"));
        assert_eq!(ops.size(&dir, "b").expect("size"), 0);
        assert_eq!(ops.size(&dir, "a").expect("size"), 5);
        assert_eq!(ops.read_to_vec(&dir, "a").expect("read"), b"hello");
        assert_eq!(ops.read(&dir, "a", 3, &mut buf).expect("read tail"), 2);
        assert_eq!(&buf[..2], b"lo");

        // rewrite truncates
        ops.write(&dir, "a", 0, b"hi").expect("rewrite");
        assert_eq!(ops.read_to_vec(&dir, "a").expect("read"), b"hi");

        ops.make_dir(&dir.join("sub")).expect("subdir");
        let mut names: Vec<String> = ops.list_dir(&dir).collect();
        names.sort();
        assert_eq!(names, vec!["a".to_string(), "b".to_string()]);
        assert_eq!(ops.list_dir(&root.join("missing")).count(), 0);

        assert!(matches!(
            ops.remove(&dir, "sub"),
            Err(HksError::RemoveFileFail { .. })
        ));
        ops.remove(&dir, "a").expect("remove");
        ops.remove(&dir, "a").expect("remove missing");
        assert!(!ops.exists(&dir, "a").expect("exists"));

        ops.remove_dir_all(&root.join("proc")).expect("rmtree");
        assert!(!ops.dir_exists(&dir));
        ops.remove_dir_all(&root.join("proc")).expect("rmtree missing");
    }

    #[test]
    fn local_operator_contract() {
        let tmp = TempDir::new().expect("tempdir");
        exercise(&LocalFileOperator::new(), tmp.path());
    }

    #[test]
    fn memory_operator_contract() {
        exercise(&MemoryFileOperator::new(), Path::new("/mem"));
    }

    #[test]
    fn traversal_is_rejected() {
        let ops = LocalFileOperator::new();
        let mut buf = [0u8; 1];
        assert!(matches!(
            ops.read(Path::new("/tmp/../etc"), "passwd", 0, &mut buf),
            Err(HksError::InvalidArgument(_))
        ));
        assert!(matches!(
            ops.write(Path::new("/tmp"), "../x", 0, b"x"),
            Err(HksError::InvalidArgument(_))
        ));
        assert!(matches!(
            ops.remove(Path::new("/tmp"), ".."),
            Err(HksError::InvalidArgument(_))
        ));
    }

    #[test]
    fn injected_failures_only_hit_prefix() {
        let ops = MemoryFileOperator::new();
        ops.make_dir(Path::new("/main/p")).expect("mkdir");
        ops.make_dir(Path::new("/bak/p")).expect("mkdir");
        ops.fail_writes_under("/bak");
        ops.write(Path::new("/main/p"), "k", 0, b"1").expect("main write");
        assert!(matches!(
            ops.write(Path::new("/bak/p"), "k", 0, b"1"),
            Err(HksError::WriteFileFail { .. })
        ));
        ops.clear_failures();
        ops.write(Path::new("/bak/p"), "k", 0, b"1").expect("bak write");
    }
}
