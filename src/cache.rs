use crate::{util::Sha256, Error, Path, PathBuf};
use anyhow::Context as _;
use bytes::Bytes;
use std::io::Write as _;

/// Content addressed store for verified payload bytes.
///
/// Keys are the sha-256 of the content, so an entry can only ever be the
/// bytes it claims to be. Implementations must only be handed bytes that
/// already passed verification, the fetcher enforces this.
pub trait ContentCache: Send + Sync {
    /// Bytes previously stored under this digest, or `None` when absent
    fn get(&self, key: &Sha256) -> Option<Bytes>;

    /// Stores verified bytes under their digest
    fn put(&self, key: &Sha256, contents: &[u8]) -> Result<(), Error>;
}

/// On disk store laid out as `<root>/objects/<shard>/<digest>`.
///
/// Writes land in a temp file in the destination directory and are renamed
/// into place, so a crash mid `put` never leaves a partial entry at a final
/// path. Reads re-verify the digest and discard entries that fail, reporting
/// them as absent so the caller re-fetches.
pub struct DiskCache {
    root: PathBuf,
}

impl DiskCache {
    pub fn new(root: PathBuf) -> anyhow::Result<Self> {
        std::fs::create_dir_all(root.join("objects"))
            .with_context(|| format!("unable to create cache directory '{root}'"))?;

        Ok(Self { root })
    }

    #[inline]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn object_path(&self, key: &Sha256) -> PathBuf {
        let mut pb = self.root.join("objects");
        pb.push(key.shard());
        pb.push(key.to_string());
        pb
    }
}

impl ContentCache for DiskCache {
    fn get(&self, key: &Sha256) -> Option<Bytes> {
        let path = self.object_path(key);
        let contents = std::fs::read(&path).ok()?;

        let actual = Sha256::digest(&contents);
        if actual != *key {
            tracing::warn!(
                object = %path,
                %actual,
                "cache entry failed verification, discarding",
            );
            let _ = std::fs::remove_file(&path);
            return None;
        }

        Some(contents.into())
    }

    fn put(&self, key: &Sha256, contents: &[u8]) -> Result<(), Error> {
        let path = self.object_path(key);
        if path.exists() {
            return Ok(());
        }

        let dir = path.parent().with_context(|| format!("object path '{path}' has no parent"))?;
        std::fs::create_dir_all(dir)
            .with_context(|| format!("unable to create object directory '{dir}'"))?;

        let mut tmp = tempfile::NamedTempFile::new_in(dir)
            .with_context(|| format!("unable to create temp file in '{dir}'"))?;
        tmp.write_all(contents)
            .with_context(|| format!("unable to write object '{key}'"))?;
        tmp.persist(&path)
            .with_context(|| format!("unable to publish object '{key}'"))?;

        Ok(())
    }
}

/// In memory store used by tests and short lived embedders
#[derive(Default)]
pub struct MemoryCache {
    objects: parking_lot::Mutex<std::collections::BTreeMap<Sha256, Bytes>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.objects.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.lock().is_empty()
    }
}

impl ContentCache for MemoryCache {
    fn get(&self, key: &Sha256) -> Option<Bytes> {
        self.objects.lock().get(key).cloned()
    }

    fn put(&self, key: &Sha256, contents: &[u8]) -> Result<(), Error> {
        self.objects
            .lock()
            .insert(*key, Bytes::copy_from_slice(contents));
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn disk_roundtrip() {
        let td = tempfile::tempdir().unwrap();
        let cache = DiskCache::new(
            crate::PathBuf::from_path_buf(td.path().to_owned()).unwrap(),
        )
        .unwrap();

        let contents = b"some payload bytes";
        let key = Sha256::digest(contents);

        assert!(cache.get(&key).is_none());
        cache.put(&key, contents).unwrap();
        assert_eq!(cache.get(&key).unwrap().as_ref(), contents);
    }

    #[test]
    fn discards_corrupt_entries() {
        let td = tempfile::tempdir().unwrap();
        let cache = DiskCache::new(
            crate::PathBuf::from_path_buf(td.path().to_owned()).unwrap(),
        )
        .unwrap();

        let key = Sha256::digest(b"the real contents");
        let path = cache.object_path(&key);

        // Poison the entry behind the cache's back
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, b"not the real contents").unwrap();

        assert!(cache.get(&key).is_none());
        assert!(!path.exists());
    }

    #[test]
    fn put_is_idempotent() {
        let cache = MemoryCache::new();
        let contents = b"abc";
        let key = Sha256::digest(contents);

        cache.put(&key, contents).unwrap();
        cache.put(&key, contents).unwrap();

        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get(&key).unwrap().as_ref(), contents);
    }
}
