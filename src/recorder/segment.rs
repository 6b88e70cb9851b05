use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::{debug, info};

/// One open segment file. Writes go straight to disk: for fragmented
/// output every appended part is immediately durable, so a crash leaves a
/// truncated but playable file.
pub struct SegmentFile {
    path: PathBuf,
    file: File,
}

impl SegmentFile {
    /// Create the file (and its parent directories) and write the header,
    /// which for fragmented output is the init segment.
    pub fn create(path: &Path, header: &[u8]) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("create {}", parent.display()))?;
            }
        }
        let mut file =
            File::create(path).with_context(|| format!("create {}", path.display()))?;
        if !header.is_empty() {
            file.write_all(header)
                .with_context(|| format!("write header to {}", path.display()))?;
        }
        info!("[recorder] segment {} opened", path.display());
        Ok(Self {
            path: path.to_path_buf(),
            file,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&mut self, data: &[u8]) -> Result<()> {
        self.file
            .write_all(data)
            .with_context(|| format!("write to {}", self.path.display()))?;
        debug!(
            "[recorder] segment {} +{} bytes",
            self.path.display(),
            data.len()
        );
        Ok(())
    }

    /// Take the underlying file, for writers that marshal everything at
    /// close time.
    pub fn into_file(self) -> (PathBuf, File) {
        (self.path, self.file)
    }

    pub fn finalize(mut self) -> Result<PathBuf> {
        self.file
            .flush()
            .with_context(|| format!("flush {}", self.path.display()))?;
        info!("[recorder] segment {} closed", self.path.display());
        Ok(self.path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_append_finalize() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a/b/seg.mp4");

        let mut seg = SegmentFile::create(&path, b"HEAD").unwrap();
        seg.append(b"PART1").unwrap();
        seg.append(b"PART2").unwrap();
        let finished = seg.finalize().unwrap();

        assert_eq!(finished, path);
        assert_eq!(fs::read(&path).unwrap(), b"HEADPART1PART2");
    }
}
