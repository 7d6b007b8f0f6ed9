use std::fs::File;
use std::io::{self, ErrorKind};
use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tokio::fs;

const HASH_SUFFIX: &str = "sha256";

#[derive(thiserror::Error, Debug)]
pub enum StorageError {
    #[error("object {0} not found")]
    NotFound(String),
    #[error("invalid object key {0:?}")]
    InvalidKey(String),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Content-addressed blob store holding binaries and testcase data
#[async_trait]
pub trait Storage: Send + Sync {
    async fn upload(&self, local_path: &Path, key: &str) -> Result<(), StorageError>;

    async fn download(&self, key: &str, local_path: &Path) -> Result<(), StorageError>;

    /// Hex SHA-256 of the stored object, as recorded at upload time
    async fn get_hash(&self, key: &str) -> Result<String, StorageError>;
}

/// Hex SHA-256 digest of a file's contents, computed on the blocking pool
pub async fn hash_file(path: &Path) -> io::Result<String> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || hash_file_blocking(&path))
        .await
        .map_err(io::Error::other)?
}

fn hash_file_blocking(path: &Path) -> io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    io::copy(&mut file, &mut hasher)?;
    Ok(format!("{:x}", hasher.finalize()))
}

/// Storage on the local file system
///
/// Every object lives at `<root>/<key>` with its digest next to it in
/// `<root>/<key>.sha256`.
pub struct LocalStorage {
    root: PathBuf,
}

impl LocalStorage {
    pub fn new(root: impl Into<PathBuf>) -> io::Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    fn object_path(&self, key: &str) -> Result<PathBuf, StorageError> {
        let relative = Path::new(key);
        let valid = !key.is_empty()
            && relative
                .components()
                .all(|c| matches!(c, Component::Normal(_)));
        if !valid {
            return Err(StorageError::InvalidKey(key.to_string()));
        }
        Ok(self.root.join(relative))
    }

    fn hash_path(object_path: &Path) -> PathBuf {
        let mut name = object_path.as_os_str().to_os_string();
        name.push(".");
        name.push(HASH_SUFFIX);
        PathBuf::from(name)
    }
}

fn not_found(key: &str) -> impl FnOnce(io::Error) -> StorageError + '_ {
    move |e| match e.kind() {
        ErrorKind::NotFound => StorageError::NotFound(key.to_string()),
        _ => StorageError::Io(e),
    }
}

#[async_trait]
impl Storage for LocalStorage {
    async fn upload(&self, local_path: &Path, key: &str) -> Result<(), StorageError> {
        let object_path = self.object_path(key)?;
        if let Some(parent) = object_path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let hash = hash_file(local_path).await?;
        fs::copy(local_path, &object_path).await?;
        fs::write(Self::hash_path(&object_path), &hash).await?;

        log::debug!("Stored {} as {key} ({hash})", local_path.display());
        Ok(())
    }

    async fn download(&self, key: &str, local_path: &Path) -> Result<(), StorageError> {
        let object_path = self.object_path(key)?;
        fs::copy(&object_path, local_path)
            .await
            .map_err(not_found(key))?;
        Ok(())
    }

    async fn get_hash(&self, key: &str) -> Result<String, StorageError> {
        let object_path = self.object_path(key)?;
        let hash_path = Self::hash_path(&object_path);

        match fs::read_to_string(&hash_path).await {
            Ok(hash) => Ok(hash.trim().to_string()),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                // Objects placed by other means get their digest cached lazily
                let hash = hash_file(&object_path).await.map_err(not_found(key))?;
                fs::write(&hash_path, &hash).await?;
                Ok(hash)
            }
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    // sha256("hello\n")
    const HELLO_HASH: &str = "5891b5b522d5df086d0ff0b110fbd9d21bb4fc7163af34d08286a2e846f6be03";

    #[tokio::test]
    async fn test_hash_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.txt");
        std::fs::write(&path, "hello\n").unwrap();
        assert_eq!(hash_file(&path).await.unwrap(), HELLO_HASH);

        let missing = hash_file(&dir.path().join("missing.txt")).await;
        assert_eq!(missing.unwrap_err().kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_upload_download_and_hash() {
        let dir = tempfile::tempdir().unwrap();
        let storage = LocalStorage::new(dir.path().join("blobs")).unwrap();

        let source = dir.path().join("answer.txt");
        std::fs::write(&source, "hello\n").unwrap();
        storage.upload(&source, "problems/1/0.out").await.unwrap();

        assert_eq!(storage.get_hash("problems/1/0.out").await.unwrap(), HELLO_HASH);

        let target = dir.path().join("copy.txt");
        storage.download("problems/1/0.out", &target).await.unwrap();
        assert_eq!(std::fs::read_to_string(&target).unwrap(), "hello\n");
    }

    #[tokio::test]
    async fn test_missing_objects_are_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let storage = LocalStorage::new(dir.path()).unwrap();

        assert!(matches!(
            storage.download("nope", &dir.path().join("x")).await,
            Err(StorageError::NotFound(key)) if key == "nope"
        ));
        assert!(matches!(
            storage.get_hash("nope").await,
            Err(StorageError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_hash_computed_lazily_for_foreign_objects() {
        let dir = tempfile::tempdir().unwrap();
        let storage = LocalStorage::new(dir.path()).unwrap();
        std::fs::write(dir.path().join("raw"), "hello\n").unwrap();

        assert_eq!(storage.get_hash("raw").await.unwrap(), HELLO_HASH);
        assert!(dir.path().join("raw.sha256").exists());
    }

    #[tokio::test]
    async fn test_rejects_escaping_keys() {
        let dir = tempfile::tempdir().unwrap();
        let storage = LocalStorage::new(dir.path()).unwrap();
        assert!(matches!(
            storage.get_hash("../etc/passwd").await,
            Err(StorageError::InvalidKey(_))
        ));
        assert!(matches!(
            storage.get_hash("").await,
            Err(StorageError::InvalidKey(_))
        ));
    }
}
