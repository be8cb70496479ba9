use crate::job::Info;
use anyhow::{bail, Context, Result};
use derivative::Derivative;
use memmap::MmapMut;
use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};

#[derive(Derivative)]
#[derivative(Debug)]
struct Slot {
    path: PathBuf,
    offset: u64,
    length: u64,
    #[derivative(Debug = "ignore")]
    map: Option<MmapMut>,
}

/// The torrent's files laid end to end, addressed by absolute byte offset.
#[derive(Debug)]
pub struct Storage {
    slots: Vec<Slot>,
    total: u64,
    existing: bool,
}

/// Maps `path` at `length` bytes. Also tells whether the file already held data.
fn map_file(path: &Path, length: u64) -> Result<(Option<MmapMut>, bool)> {
    let existed = fs::metadata(path).map(|m| m.len() > 0).unwrap_or(false);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory {}", parent.display()))?;
    }
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .open(path)
        .with_context(|| format!("Failed to open {} as RW", path.display()))?;
    file.set_len(length)
        .with_context(|| format!("Failed to size {}", path.display()))?;
    if length == 0 {
        return Ok((None, existed));
    }
    let map = unsafe { MmapMut::map_mut(&file).with_context(|| "Failed to mmap")? };
    Ok((Some(map), existed))
}

impl Storage {
    /// Creates (or reopens) every file of `info` under `root`.
    pub fn create(root: &Path, info: &Info) -> Result<Self> {
        let mut slots = Vec::new();
        let mut offset = 0;
        let mut existing = false;
        for (relative, length) in info.layout() {
            let path = root.join(relative);
            let (map, existed) = map_file(&path, length)?;
            existing |= existed;
            slots.push(Slot {
                path,
                offset,
                length,
                map,
            });
            offset += length;
        }
        log::debug!("Opened {} file(s), {} bytes", slots.len(), offset);
        Ok(Storage {
            slots,
            total: offset,
            existing,
        })
    }

    pub fn total(&self) -> u64 {
        self.total
    }

    /// Whether any file was non-empty before it was opened, i.e. there may be
    /// pieces worth rechecking.
    pub fn has_existing_data(&self) -> bool {
        self.existing
    }

    fn check_range(&self, offset: u64, len: usize) -> Result<()> {
        match offset.checked_add(len as u64) {
            Some(end) if end <= self.total => Ok(()),
            _ => bail!(
                "Range {}+{} is outside of the torrent ({} bytes)",
                offset,
                len,
                self.total
            ),
        }
    }

    pub fn write(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        self.check_range(offset, data.len())?;
        let end = offset + data.len() as u64;
        for slot in &mut self.slots {
            let slot_end = slot.offset + slot.length;
            if slot.length == 0 || slot_end <= offset || slot.offset >= end {
                continue;
            }
            let start = offset.max(slot.offset);
            let stop = end.min(slot_end);
            let src = &data[(start - offset) as usize..(stop - offset) as usize];
            let map = slot
                .map
                .as_mut()
                .with_context(|| format!("{} is not mapped", slot.path.display()))?;
            let at = (start - slot.offset) as usize;
            map[at..at + src.len()].copy_from_slice(src);
        }
        Ok(())
    }

    pub fn read(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        self.check_range(offset, buf.len())?;
        let end = offset + buf.len() as u64;
        for slot in &self.slots {
            let slot_end = slot.offset + slot.length;
            if slot.length == 0 || slot_end <= offset || slot.offset >= end {
                continue;
            }
            let start = offset.max(slot.offset);
            let stop = end.min(slot_end);
            let map = slot
                .map
                .as_ref()
                .with_context(|| format!("{} is not mapped", slot.path.display()))?;
            let at = (start - slot.offset) as usize;
            let len = (stop - start) as usize;
            buf[(start - offset) as usize..(stop - offset) as usize]
                .copy_from_slice(&map[at..at + len]);
        }
        Ok(())
    }

    pub fn flush(&self) -> Result<()> {
        for slot in &self.slots {
            if let Some(map) = &slot.map {
                map.flush()
                    .with_context(|| format!("Failed to flush {}", slot.path.display()))?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_files() -> Info {
        let mut raw = b"d5:filesld6:lengthi10e4:pathl5:a.bineed6:lengthi0e4:pathl5:e.bineed6:lengthi6e4:pathl5:b.bineee4:name3:dir12:piece lengthi8e6:pieces40:".to_vec();
        raw.extend_from_slice(&[1u8; 40]);
        raw.push(b'e');
        Info::from_bytes(&raw).unwrap()
    }

    #[test]
    fn writes_span_file_boundaries() {
        let dir = tempfile::tempdir().unwrap();
        let mut storage = Storage::create(dir.path(), &two_files()).unwrap();
        assert_eq!(storage.total(), 16);
        assert!(!storage.has_existing_data());

        storage.write(8, b"ABCDEFGH").unwrap();
        storage.flush().unwrap();

        let a = std::fs::read(dir.path().join("dir/a.bin")).unwrap();
        let b = std::fs::read(dir.path().join("dir/b.bin")).unwrap();
        assert_eq!(&a[8..], b"AB");
        assert_eq!(b, b"CDEFGH");
        assert!(dir.path().join("dir/e.bin").exists());

        let mut back = [0u8; 4];
        storage.read(9, &mut back).unwrap();
        assert_eq!(&back, b"BCDE");
        drop(storage);

        let reopened = Storage::create(dir.path(), &two_files()).unwrap();
        assert!(reopened.has_existing_data());
        let mut back = [0u8; 8];
        reopened.read(8, &mut back).unwrap();
        assert_eq!(&back, b"ABCDEFGH");
    }

    #[test]
    fn out_of_range_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut storage = Storage::create(dir.path(), &two_files()).unwrap();
        assert!(storage.write(15, b"xy").is_err());
        let mut buf = [0u8; 1];
        assert!(storage.read(16, &mut buf).is_err());
    }
}
