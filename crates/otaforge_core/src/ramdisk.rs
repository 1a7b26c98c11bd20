use crate::compression::{self, CompressedFormat};
use crate::error::{PatchError, Result};
use cpio::NewcBuilder;
use cpio::newc::Reader as CpioReader;
use std::io::{Cursor, Read};

pub const S_IFMT: u32 = 0o170000;
pub const S_IFDIR: u32 = 0o040000;
pub const S_IFREG: u32 = 0o100000;
pub const S_IFLNK: u32 = 0o120000;

const CPIO_TRAILER: &str = "TRAILER!!!";

// Fixed inode base so that repeated saves of the same entry list are
// bitwise identical.
const INO_BASE: u32 = 300000;

/// A single member of a cpio archive. `content` holds the symlink target for
/// symlinks and is empty for directories.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RamdiskEntry {
    pub name: String,
    pub mode: u32,
    pub content: Vec<u8>,
}

impl RamdiskEntry {
    pub fn new_file(name: impl Into<String>, perms: u32, content: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            mode: S_IFREG | perms,
            content,
        }
    }

    pub fn new_directory(name: impl Into<String>, perms: u32) -> Self {
        Self {
            name: name.into(),
            mode: S_IFDIR | perms,
            content: Vec::new(),
        }
    }

    pub fn new_symlink(name: impl Into<String>, target: &[u8]) -> Self {
        Self {
            name: name.into(),
            mode: S_IFLNK | 0o777,
            content: target.to_vec(),
        }
    }

    pub fn is_file(&self) -> bool {
        self.mode & S_IFMT == S_IFREG
    }

    pub fn is_dir(&self) -> bool {
        self.mode & S_IFMT == S_IFDIR
    }
}

/// Decompress a ramdisk section and parse the newc cpio archive inside it.
/// Returns the entries together with the compression variant, which `save`
/// must reuse to keep repacked images consistent with the original.
pub fn load(data: &[u8], raw_if_unknown: bool) -> Result<(Vec<RamdiskEntry>, CompressedFormat)> {
    // An uncompressed ramdisk starts directly with the newc magic.
    let (raw, format) = if data.starts_with(b"070701") {
        (data.to_vec(), CompressedFormat::Raw)
    } else {
        compression::decompress(data, raw_if_unknown)?
    };
    let mut entries = Vec::new();
    let mut cursor = Cursor::new(raw.as_slice());

    loop {
        let mut reader = CpioReader::new(cursor)
            .map_err(|e| PatchError::Corrupt(format!("cpio header: {e}")))?;

        let name = reader.entry().name().to_string();
        if name == CPIO_TRAILER {
            break;
        }

        let mode = reader.entry().mode();
        let mut content = Vec::new();
        reader
            .read_to_end(&mut content)
            .map_err(|e| PatchError::Corrupt(format!("cpio entry {name}: {e}")))?;

        entries.push(RamdiskEntry {
            name,
            mode,
            content,
        });

        cursor = reader
            .finish()
            .map_err(|e| PatchError::Corrupt(format!("cpio padding: {e}")))?;
    }

    Ok((entries, format))
}

/// Serialize entries as a newc cpio archive and recompress. Entries are
/// sorted by name and all varying header fields (inodes, timestamps, owners)
/// are fixed so the output is bitwise stable.
pub fn save(entries: &[RamdiskEntry], format: CompressedFormat) -> Result<Vec<u8>> {
    let mut sorted: Vec<&RamdiskEntry> = entries.iter().collect();
    sorted.sort_by(|a, b| a.name.cmp(&b.name));

    for pair in sorted.windows(2) {
        if pair[0].name == pair[1].name {
            return Err(PatchError::InvalidRamdisk(format!(
                "duplicate entry name: {}",
                pair[0].name
            )));
        }
    }

    let mut archive = Vec::new();
    let mut writer = Cursor::new(&mut archive);

    for (i, entry) in sorted.iter().enumerate() {
        if entry.name.contains('\0') {
            return Err(PatchError::InvalidRamdisk(format!(
                "entry name contains NUL: {:?}",
                entry.name
            )));
        }

        let builder = NewcBuilder::new(&entry.name)
            .ino(INO_BASE + i as u32)
            .mode(entry.mode)
            .uid(0)
            .gid(0)
            .nlink(1)
            .mtime(0);
        let mut entry_writer = builder.write(&mut writer, entry.content.len() as u32);
        std::io::Write::write_all(&mut entry_writer, &entry.content)?;
        entry_writer.finish()?;
    }

    cpio::newc::trailer(&mut writer)?;
    drop(writer);

    compression::compress(format, &archive)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_entries() -> Vec<RamdiskEntry> {
        vec![
            RamdiskEntry::new_directory("overlay.d", 0o750),
            RamdiskEntry::new_file("init", 0o750, b"#!/system/bin/sh\n".to_vec()),
            RamdiskEntry::new_file(
                "system/etc/hosts",
                0o644,
                b"127.0.0.1 localhost\n".to_vec(),
            ),
        ]
    }

    #[test]
    fn test_load_save_round_trip() {
        let saved = save(&sample_entries(), CompressedFormat::Gzip).unwrap();
        let (loaded, format) = load(&saved, false).unwrap();

        assert_eq!(format, CompressedFormat::Gzip);
        assert_eq!(loaded.len(), 3);
        // Entries come back sorted by name.
        assert_eq!(loaded[0].name, "init");
        assert_eq!(loaded[1].name, "overlay.d");
        assert_eq!(loaded[2].name, "system/etc/hosts");
        assert_eq!(loaded[0].content, b"#!/system/bin/sh\n");
        assert!(loaded[1].is_dir());
    }

    #[test]
    fn test_save_is_reproducible() {
        let entries = sample_entries();
        let a = save(&entries, CompressedFormat::Lz4Legacy).unwrap();
        let b = save(&entries, CompressedFormat::Lz4Legacy).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_save_round_trips_unmodified() {
        let saved = save(&sample_entries(), CompressedFormat::Gzip).unwrap();
        let (loaded, format) = load(&saved, false).unwrap();
        let resaved = save(&loaded, format).unwrap();
        assert_eq!(saved, resaved);
    }

    #[test]
    fn test_duplicate_names_rejected() {
        let entries = vec![
            RamdiskEntry::new_file("init", 0o750, b"a".to_vec()),
            RamdiskEntry::new_file("init", 0o750, b"b".to_vec()),
        ];
        let result = save(&entries, CompressedFormat::Gzip);
        assert!(matches!(result, Err(PatchError::InvalidRamdisk(_))));
    }

    #[test]
    fn test_truncated_archive_is_corrupt() {
        let saved = save(&sample_entries(), CompressedFormat::Raw).unwrap();
        let result = load(&saved[..saved.len() / 2], true);
        assert!(result.is_err());
    }

    #[test]
    fn test_symlink_round_trip() {
        let entries = vec![RamdiskEntry::new_symlink("sdcard", b"/storage/self/primary")];
        let saved = save(&entries, CompressedFormat::Raw).unwrap();
        let (loaded, _) = load(&saved, false).unwrap();
        assert_eq!(loaded[0].mode & S_IFMT, S_IFLNK);
        assert_eq!(loaded[0].content, b"/storage/self/primary");
    }
}
