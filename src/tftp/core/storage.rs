use std::{
    fs::{self, File, OpenOptions},
    io::{self, Read, Write},
    path::{Component, Path, PathBuf},
};

/// File access and policy checks a server session relies on.
///
/// Sessions never touch the filesystem directly, so alternative backends
/// (in-memory, read-only images) only need to implement this trait.
pub trait Storage: Send + Sync {
    /// Maps a requested filename to a path. The result is not yet checked.
    fn resolve(&self, filename: &str) -> PathBuf;
    /// Whether `path` stays inside the served directory.
    fn is_within_root(&self, path: &Path) -> bool;
    fn exists(&self, path: &Path) -> bool;
    /// Whether `bytes` more bytes fit next to `path`.
    fn has_space(&self, path: &Path, bytes: u64) -> bool;
    /// Opens an existing regular file, returning it with its length.
    fn open_read(&self, path: &Path) -> io::Result<(Box<dyn Read + Send>, u64)>;
    /// Creates a file that must not already exist.
    fn create(&self, path: &Path) -> io::Result<Box<dyn Write + Send>>;
    fn delete(&self, path: &Path) -> io::Result<()>;
}

/// [`Storage`] backed by a directory on the local filesystem.
#[derive(Debug, Clone)]
pub struct LocalStorage {
    root: PathBuf,
}

impl LocalStorage {
    pub fn new(root: impl AsRef<Path>) -> io::Result<Self> {
        let root = fs::canonicalize(root)?;
        if !root.is_dir() {
            return Err(io::Error::new(
                io::ErrorKind::NotADirectory,
                format!("{} is not a directory", root.display()),
            ));
        }
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl Storage for LocalStorage {
    fn resolve(&self, filename: &str) -> PathBuf {
        let requested = Path::new(filename);
        if requested.is_absolute() {
            normalize(requested)
        } else {
            normalize(&self.root.join(requested))
        }
    }

    fn is_within_root(&self, path: &Path) -> bool {
        path.starts_with(&self.root) && path != self.root
    }

    fn exists(&self, path: &Path) -> bool {
        path.symlink_metadata().is_ok()
    }

    fn has_space(&self, path: &Path, bytes: u64) -> bool {
        let dir = path.parent().unwrap_or(&self.root);
        match available_space(dir) {
            Ok(Some(free)) => bytes <= free,
            Ok(None) => true,
            Err(e) => {
                log::warn!("Cannot query free space of {}: {}", dir.display(), e);
                false
            }
        }
    }

    fn open_read(&self, path: &Path) -> io::Result<(Box<dyn Read + Send>, u64)> {
        let file = File::open(path)?;
        let metadata = file.metadata()?;
        if !metadata.is_file() {
            return Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                format!("{} is not a regular file", path.display()),
            ));
        }
        Ok((Box::new(file), metadata.len()))
    }

    fn create(&self, path: &Path) -> io::Result<Box<dyn Write + Send>> {
        let file = OpenOptions::new().write(true).create_new(true).open(path)?;
        Ok(Box::new(file))
    }

    fn delete(&self, path: &Path) -> io::Result<()> {
        fs::remove_file(path)
    }
}

/// Resolves `.` and `..` without touching the filesystem.
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::ParentDir => {
                out.pop();
            }
            Component::CurDir => {}
            other => out.push(other),
        }
    }
    out
}

/// Bytes available to unprivileged users on the filesystem holding `dir`.
#[cfg(unix)]
fn available_space(dir: &Path) -> io::Result<Option<u64>> {
    let stat = nix::sys::statvfs::statvfs(dir).map_err(io::Error::from)?;
    Ok(Some(
        (stat.blocks_available() as u64).saturating_mul(stat.fragment_size() as u64),
    ))
}

#[cfg(not(unix))]
fn available_space(_dir: &Path) -> io::Result<Option<u64>> {
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_confinement() {
        let dir = tempfile::tempdir().unwrap();
        let storage = LocalStorage::new(dir.path()).unwrap();
        let root = storage.root().to_path_buf();

        let inside = storage.resolve("boot/../kernel.img");
        assert_eq!(inside, root.join("kernel.img"));
        assert!(storage.is_within_root(&inside));

        let escape = storage.resolve("../../etc/passwd");
        assert!(!storage.is_within_root(&escape));

        assert!(!storage.is_within_root(&storage.resolve("/etc/passwd")));
        assert!(storage.is_within_root(&storage.resolve(&root.join("a.txt").to_string_lossy())));
        assert!(!storage.is_within_root(&storage.resolve(".")));
    }

    #[test]
    fn test_create_refuses_existing() {
        let dir = tempfile::tempdir().unwrap();
        let storage = LocalStorage::new(dir.path()).unwrap();
        let path = storage.resolve("exists.bin");

        let mut file = storage.create(&path).unwrap();
        file.write_all(b"first").unwrap();
        drop(file);

        let err = storage.create(&path).err().unwrap();
        assert_eq!(err.kind(), io::ErrorKind::AlreadyExists);

        let (mut reader, len) = storage.open_read(&path).unwrap();
        assert_eq!(len, 5);
        let mut content = String::new();
        reader.read_to_string(&mut content).unwrap();
        assert_eq!(content, "first");

        storage.delete(&path).unwrap();
        assert!(!storage.exists(&path));
    }

    #[test]
    fn test_open_read_rejects_directory() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join("sub")).unwrap();
        let storage = LocalStorage::new(dir.path()).unwrap();
        let err = storage.open_read(&storage.resolve("sub")).err().unwrap();
        assert_eq!(err.kind(), io::ErrorKind::PermissionDenied);
    }

    #[test]
    #[cfg(unix)]
    fn test_has_space() {
        let dir = tempfile::tempdir().unwrap();
        let storage = LocalStorage::new(dir.path()).unwrap();
        let path = storage.resolve("upload.bin");
        assert!(storage.has_space(&path, 1));
        assert!(!storage.has_space(&path, u64::MAX));
    }
}
