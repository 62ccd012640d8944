//! Local file archive of a replica server
//!
//! Every storage root holds `filedir/` with the stored files, `tempdir/`
//! for uploads in progress and `atticdir/` for quarantined files. Lookups
//! scan all roots.

use std::path::{Path, PathBuf};
use sysinfo::Disks;

use crate::error::{Error, Result};

const FILE_DIR: &str = "filedir";
const TEMP_DIR: &str = "tempdir";
const ATTIC_DIR: &str = "atticdir";

/// Source of free disk space figures
pub trait SpaceProbe: Send + Sync {
    /// Free bytes on the filesystem holding `path`, if known
    fn free_bytes(&self, path: &Path) -> Option<u64>;
}

/// Free space from the mounted disks list
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemSpaceProbe;

impl SpaceProbe for SystemSpaceProbe {
    fn free_bytes(&self, path: &Path) -> Option<u64> {
        let path = std::fs::canonicalize(path).ok()?;
        let disks = Disks::new_with_refreshed_list();

        // The disk with the longest mount point containing the path
        disks
            .list()
            .iter()
            .filter(|disk| path.starts_with(disk.mount_point()))
            .max_by_key(|disk| disk.mount_point().as_os_str().len())
            .map(|disk| disk.available_space())
    }
}

/// A probe reporting the same figure for every path
#[derive(Debug, Clone, Copy)]
pub struct FixedSpaceProbe(pub u64);

impl SpaceProbe for FixedSpaceProbe {
    fn free_bytes(&self, _path: &Path) -> Option<u64> {
        Some(self.0)
    }
}

/// One storage root and its directories
#[derive(Debug, Clone)]
pub struct StorageRoot {
    pub root: PathBuf,
    pub file_dir: PathBuf,
    pub temp_dir: PathBuf,
    pub attic_dir: PathBuf,
}

impl StorageRoot {
    fn create(root: &Path) -> Result<Self> {
        let dirs = Self {
            root: root.to_path_buf(),
            file_dir: root.join(FILE_DIR),
            temp_dir: root.join(TEMP_DIR),
            attic_dir: root.join(ATTIC_DIR),
        };
        std::fs::create_dir_all(&dirs.file_dir)?;
        std::fs::create_dir_all(&dirs.temp_dir)?;
        std::fs::create_dir_all(&dirs.attic_dir)?;
        Ok(dirs)
    }
}

/// The files held by one replica server
pub struct Archive {
    roots: Vec<StorageRoot>,
    min_space_left: u64,
    probe: Box<dyn SpaceProbe>,
}

impl Archive {
    /// Open (and create) the storage roots
    pub fn open(roots: &[PathBuf], min_space_left: u64, probe: Box<dyn SpaceProbe>) -> Result<Self> {
        if roots.is_empty() {
            return Err(Error::Config("at least one storage root is required".into()));
        }
        if min_space_left == 0 {
            return Err(Error::Config("min_space_left must be positive".into()));
        }

        let roots = roots
            .iter()
            .map(|root| StorageRoot::create(root))
            .collect::<Result<Vec<_>>>()?;

        for root in &roots {
            tracing::info!("Storage root {} ready", root.root.display());
        }

        Ok(Self {
            roots,
            min_space_left,
            probe,
        })
    }

    pub fn roots(&self) -> &[StorageRoot] {
        &self.roots
    }

    pub fn min_space_left(&self) -> u64 {
        self.min_space_left
    }

    fn free_bytes(&self, root: &StorageRoot) -> u64 {
        match self.probe.free_bytes(&root.root) {
            Some(bytes) => bytes,
            None => {
                tracing::warn!("Could not determine free space of {}", root.root.display());
                0
            }
        }
    }

    /// Whether some root has more free space than the floor
    pub fn has_enough_space(&self) -> bool {
        self.roots
            .iter()
            .any(|root| self.free_bytes(root) > self.min_space_left)
    }

    /// Locate a stored file
    pub fn lookup(&self, filename: &str) -> Option<PathBuf> {
        if validate_filename(filename).is_err() {
            return None;
        }
        self.roots
            .iter()
            .map(|root| root.file_dir.join(filename))
            .find(|path| path.is_file())
    }

    /// All stored files, sorted by name
    pub async fn list_files(&self) -> Result<Vec<(String, PathBuf)>> {
        let mut files = Vec::new();
        for root in &self.roots {
            let mut entries = tokio::fs::read_dir(&root.file_dir).await?;
            while let Some(entry) = entries.next_entry().await? {
                if !entry.file_type().await?.is_file() {
                    continue;
                }
                if let Some(name) = entry.file_name().to_str() {
                    files.push((name.to_string(), entry.path()));
                }
            }
        }
        files.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(files)
    }

    /// Store a new file.
    ///
    /// The content is written into the temp dir of the root with the most
    /// free space and renamed into its file dir. Existing names are refused.
    pub async fn store(&self, filename: &str, content: &[u8]) -> Result<PathBuf> {
        validate_filename(filename)?;
        if self.lookup(filename).is_some() {
            return Err(Error::FileExists(filename.to_string()));
        }

        let needed = content.len() as u64 + self.min_space_left;
        let root = self
            .roots
            .iter()
            .map(|root| (root, self.free_bytes(root)))
            .filter(|(_, free)| *free > needed)
            .max_by_key(|(_, free)| *free)
            .map(|(root, _)| root)
            .ok_or_else(|| {
                Error::ResourceExhausted(format!(
                    "no storage root can hold {} bytes above the {} byte floor",
                    content.len(),
                    self.min_space_left
                ))
            })?;

        let temp_path = root.temp_dir.join(filename);
        let final_path = root.file_dir.join(filename);

        if let Err(e) = tokio::fs::write(&temp_path, content).await {
            let _ = tokio::fs::remove_file(&temp_path).await;
            return Err(e.into());
        }
        tokio::fs::rename(&temp_path, &final_path).await?;

        tracing::debug!("Stored {} ({} bytes) in {}", filename, content.len(), root.root.display());
        Ok(final_path)
    }

    /// Move a stored file into the attic of its root
    pub async fn move_to_attic(&self, filename: &str) -> Result<PathBuf> {
        let source = self
            .lookup(filename)
            .ok_or_else(|| Error::FileNotFound(filename.to_string()))?;
        let root = self
            .roots
            .iter()
            .find(|root| source.starts_with(&root.file_dir))
            .ok_or_else(|| Error::Internal(format!("{} is outside every storage root", source.display())))?;

        let mut target = root.attic_dir.join(filename);
        if tokio::fs::try_exists(&target).await? {
            target = root.attic_dir.join(format!(
                "{}.{}",
                filename,
                chrono::Utc::now().format("%Y%m%d%H%M%S%3f")
            ));
        }

        tokio::fs::rename(&source, &target).await?;
        tracing::info!("Moved {} to attic {}", filename, target.display());
        Ok(target)
    }
}

/// Reject names that would escape the storage directories
pub fn validate_filename(filename: &str) -> Result<()> {
    if filename.is_empty()
        || filename == "."
        || filename == ".."
        || filename.contains('/')
        || filename.contains('\\')
        || filename.contains('\0')
    {
        return Err(Error::Validation(format!("invalid filename '{}'", filename)));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn archive(dir: &Path, free: u64) -> Archive {
        Archive::open(
            &[dir.join("a"), dir.join("b")],
            1024,
            Box::new(FixedSpaceProbe(free)),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_store_lookup_and_attic() {
        let dir = tempdir().unwrap();
        let archive = archive(dir.path(), 1 << 30);
        assert!(archive.has_enough_space());

        let path = archive.store("x.warc", b"hello").await.unwrap();
        assert!(path.ends_with("filedir/x.warc"));
        assert_eq!(archive.lookup("x.warc"), Some(path.clone()));

        let err = archive.store("x.warc", b"other").await.unwrap_err();
        assert!(matches!(err, Error::FileExists(_)));

        let attic = archive.move_to_attic("x.warc").await.unwrap();
        assert!(archive.lookup("x.warc").is_none());
        assert_eq!(tokio::fs::read(&attic).await.unwrap(), b"hello");

        // A second quarantine of the same name does not overwrite the first
        archive.store("x.warc", b"again").await.unwrap();
        let second = archive.move_to_attic("x.warc").await.unwrap();
        assert_ne!(attic, second);
    }

    #[tokio::test]
    async fn test_list_files_across_roots() {
        let dir = tempdir().unwrap();
        let archive = archive(dir.path(), 1 << 30);
        tokio::fs::write(dir.path().join("b/filedir/2.warc"), b"2").await.unwrap();
        tokio::fs::write(dir.path().join("a/filedir/1.warc"), b"1").await.unwrap();

        let names: Vec<String> = archive.list_files().await.unwrap().into_iter().map(|f| f.0).collect();
        assert_eq!(names, vec!["1.warc", "2.warc"]);
        assert!(archive.lookup("2.warc").is_some());
    }

    #[tokio::test]
    async fn test_space_floor() {
        let dir = tempdir().unwrap();
        let archive = archive(dir.path(), 1000);
        assert!(!archive.has_enough_space());
        let err = archive.store("x.warc", b"hello").await.unwrap_err();
        assert!(matches!(err, Error::ResourceExhausted(_)));
    }

    #[test]
    fn test_invalid_filenames() {
        assert!(validate_filename("../etc/passwd").is_err());
        assert!(validate_filename("").is_err());
        assert!(validate_filename("ok-name.warc").is_ok());
    }

    #[test]
    fn test_zero_floor_rejected() {
        let dir = tempdir().unwrap();
        let result = Archive::open(&[dir.path().to_path_buf()], 0, Box::new(FixedSpaceProbe(1)));
        assert!(matches!(result, Err(Error::Config(_))));
    }
}
