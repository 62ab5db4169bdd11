//! One storage tier: a directory of shard files written atomically

use crate::error::{Result, WeftError};
use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

const EXTENSION: &str = "bin";

/// A directory of `<key>.bin` shard files
pub struct ShardTier {
    name: &'static str,
    dir: PathBuf,
}

impl ShardTier {
    /// Open (creating if needed) the `shards` directory under `root`
    pub fn open(name: &'static str, root: &Path) -> Result<Self> {
        let dir = root.join("shards");
        fs::create_dir_all(&dir).map_err(|e| WeftError::Io {
            source: e,
            context: format!("Failed to create {} shard directory: {}", name, dir.display()),
        })?;
        Ok(Self { name, dir })
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.{}", key, EXTENSION))
    }

    /// Write through a temp file, fsync, then rename over the target so a
    /// crash never leaves a half-written shard behind
    pub fn write(&self, key: &str, data: &[u8]) -> Result<()> {
        let final_path = self.path_for(key);
        let temp_path = self.dir.join(format!("{}.{}.tmp", key, EXTENSION));

        let mut file = fs::File::create(&temp_path).map_err(|e| WeftError::Io {
            source: e,
            context: format!("Failed to create temp shard file: {}", temp_path.display()),
        })?;
        file.write_all(data).map_err(|e| WeftError::Io {
            source: e,
            context: format!("Failed to write shard data: {}", temp_path.display()),
        })?;
        file.sync_all().map_err(|e| WeftError::Io {
            source: e,
            context: format!("Failed to sync shard file: {}", temp_path.display()),
        })?;
        drop(file);

        fs::rename(&temp_path, &final_path).map_err(|e| WeftError::Io {
            source: e,
            context: format!(
                "Failed to rename temp shard to final location: {} -> {}",
                temp_path.display(),
                final_path.display()
            ),
        })?;
        Ok(())
    }

    /// Read a shard, `None` when absent
    pub fn read(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let path = self.path_for(key);
        let mut file = match fs::File::open(&path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(WeftError::Io {
                    source: e,
                    context: format!("Failed to open shard file: {}", path.display()),
                })
            }
        };
        let mut data = Vec::new();
        file.read_to_end(&mut data).map_err(|e| WeftError::Io {
            source: e,
            context: format!("Failed to read shard data: {}", path.display()),
        })?;
        Ok(Some(data))
    }

    /// Read at most `len` leading bytes of a shard
    pub fn read_prefix(&self, key: &str, len: usize) -> Result<Option<Vec<u8>>> {
        let path = self.path_for(key);
        let file = match fs::File::open(&path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(WeftError::Io {
                    source: e,
                    context: format!("Failed to open shard file: {}", path.display()),
                })
            }
        };
        let mut data = Vec::with_capacity(len);
        file.take(len as u64)
            .read_to_end(&mut data)
            .map_err(|e| WeftError::Io {
                source: e,
                context: format!("Failed to read shard header: {}", path.display()),
            })?;
        Ok(Some(data))
    }

    pub fn delete(&self, key: &str) -> Result<bool> {
        let path = self.path_for(key);
        match fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(WeftError::Io {
                source: e,
                context: format!("Failed to delete shard: {}", path.display()),
            }),
        }
    }

    /// Keys of every shard in this tier with their on-disk size. Leftover
    /// temp files are ignored.
    pub fn list(&self) -> Result<Vec<(String, u64)>> {
        let entries = fs::read_dir(&self.dir).map_err(|e| WeftError::Io {
            source: e,
            context: format!("Failed to read shard directory: {}", self.dir.display()),
        })?;

        let mut shards = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(EXTENSION) {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            if stem.contains('.') {
                continue;
            }
            let size = entry.metadata().map(|m| m.len()).unwrap_or(0);
            shards.push((stem.to_string(), size));
        }
        shards.sort();
        Ok(shards)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_write_read_delete() {
        let temp = TempDir::new().unwrap();
        let tier = ShardTier::open("cache", temp.path()).unwrap();

        assert!(tier.read("abc").unwrap().is_none());
        tier.write("abc", b"payload").unwrap();
        assert_eq!(tier.read("abc").unwrap().unwrap(), b"payload");

        tier.write("abc", b"newer").unwrap();
        assert_eq!(tier.read("abc").unwrap().unwrap(), b"newer");
        assert!(!tier.dir().join("abc.bin.tmp").exists());

        assert!(tier.delete("abc").unwrap());
        assert!(!tier.delete("abc").unwrap());
    }

    #[test]
    fn test_list_ignores_temp_files() {
        let temp = TempDir::new().unwrap();
        let tier = ShardTier::open("cache", temp.path()).unwrap();
        tier.write("one", b"1").unwrap();
        tier.write("two", b"22").unwrap();
        std::fs::write(tier.dir().join("three.bin.tmp"), b"partial").unwrap();

        assert_eq!(
            tier.list().unwrap(),
            vec![("one".to_string(), 1), ("two".to_string(), 2)]
        );
    }
}
