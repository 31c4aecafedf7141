//! Raw disk information and the kernel mount table.

use std::fs;
use std::path::{Path, PathBuf};

use crate::storage::StorageError;

/// Unit of the sysfs `size` attribute, independent of the device's sector size.
const SYSFS_SECTOR_BYTES: u64 = 512;

/// Filesystem types the card may be formatted with.
pub const FAT_FILESYSTEMS: &[&str] = &["vfat", "msdos", "fat", "exfat"];

/// Geometry of a block device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiskInfo {
    /// Number of logical sectors.
    pub block_count: u64,
    /// Logical sector size in bytes.
    pub sector_size: u32,
}

impl DiskInfo {
    /// Capacity in bytes.
    pub const fn size_bytes(&self) -> u64 {
        self.block_count * self.sector_size as u64
    }

    /// Capacity in whole mebibytes.
    pub const fn size_mb(&self) -> u64 {
        self.size_bytes() >> 20
    }
}

fn read_number(path: &Path) -> Result<u64, String> {
    let text = fs::read_to_string(path).map_err(|err| format!("{}: {err}", path.display()))?;
    text.trim()
        .parse()
        .map_err(|err| format!("{}: {err}", path.display()))
}

/// Read the geometry of `drive` from sysfs.
///
/// Partitions have no `queue` directory of their own, so the sector size is
/// taken from the parent device when missing, then defaults to 512 bytes.
pub fn probe(sysfs_root: &Path, drive: &str) -> Result<DiskInfo, StorageError> {
    let device = sysfs_root.join(drive);
    if !device.is_dir() {
        return Err(StorageError::DiskProbe {
            drive: drive.to_owned(),
            detail: format!("{} not found", device.display()),
        });
    }

    let sectors = read_number(&device.join("size")).map_err(|detail| StorageError::DiskProbe {
        drive: drive.to_owned(),
        detail,
    })?;

    let sector_size = read_number(&device.join("queue/logical_block_size"))
        .or_else(|_| read_number(&device.join("../queue/logical_block_size")))
        .ok()
        .and_then(|size| u32::try_from(size).ok())
        .filter(|size| *size > 0)
        .unwrap_or(512);

    Ok(DiskInfo {
        block_count: sectors * SYSFS_SECTOR_BYTES / u64::from(sector_size),
        sector_size,
    })
}

/// One line of the mount table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountEntry {
    /// Mounted device.
    pub source: String,
    /// Directory the device is mounted on.
    pub target: PathBuf,
    /// Filesystem type.
    pub fstype: String,
    /// Comma separated mount options.
    pub options: String,
}

impl MountEntry {
    /// Whether the filesystem is one of the FAT family.
    pub fn is_fat(&self) -> bool {
        FAT_FILESYSTEMS.contains(&self.fstype.as_str())
    }

    /// Whether the filesystem is mounted read-only.
    pub fn is_read_only(&self) -> bool {
        self.options.split(',').any(|opt| opt == "ro")
    }
}

// The kernel escapes space, tab, newline and backslash as `\ooo`.
fn unescape(field: &str) -> String {
    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while let Some(&byte) = bytes.get(i) {
        if byte == b'\\' {
            let code = bytes
                .get(i + 1..i + 4)
                .and_then(|digits| std::str::from_utf8(digits).ok())
                .and_then(|digits| u8::from_str_radix(digits, 8).ok());
            if let Some(code) = code {
                out.push(code);
                i += 4;
                continue;
            }
        }
        out.push(byte);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Parse a `/proc/self/mounts`-style table, skipping malformed lines.
pub fn parse_mounts(content: &str) -> Vec<MountEntry> {
    content
        .lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let source = fields.next()?;
            let target = fields.next()?;
            let fstype = fields.next()?;
            let options = fields.next().unwrap_or_default();
            Some(MountEntry {
                source: unescape(source),
                target: PathBuf::from(unescape(target)),
                fstype: fstype.to_owned(),
                options: options.to_owned(),
            })
        })
        .collect()
}

/// Find the filesystem mounted on `mount_point`.
///
/// When several mounts are stacked on the same directory the last one is
/// the visible one.
pub fn find_mount(table: &Path, mount_point: &Path) -> Result<Option<MountEntry>, StorageError> {
    let content = fs::read_to_string(table).map_err(|source| StorageError::Io {
        path: table.to_path_buf(),
        source,
    })?;
    let target = fs::canonicalize(mount_point).unwrap_or_else(|_| mount_point.to_path_buf());

    Ok(parse_mounts(&content)
        .into_iter()
        .filter(|entry| entry.target == target)
        .last())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write(path: &Path, content: &str) {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).expect("create sysfs dirs");
        }
        fs::write(path, content).expect("write sysfs attribute");
    }

    #[test]
    fn test_probe_reads_geometry() {
        let root = tempfile::tempdir().expect("tempdir");
        write(&root.path().join("mmcblk0/size"), "62333952\n");
        write(
            &root.path().join("mmcblk0/queue/logical_block_size"),
            "512\n",
        );

        let info = probe(root.path(), "mmcblk0").expect("probe should succeed");
        assert_eq!(info.block_count, 62_333_952);
        assert_eq!(info.sector_size, 512);
        assert_eq!(info.size_mb(), 30_436);
    }

    #[test]
    fn test_probe_partition_uses_parent_sector_size() {
        let root = tempfile::tempdir().expect("tempdir");
        let disk = root.path().join("mmcblk0");
        write(&disk.join("queue/logical_block_size"), "4096\n");
        write(&disk.join("mmcblk0p1/size"), "8192\n");

        let info = probe(&disk, "mmcblk0p1").expect("probe should succeed");
        assert_eq!(info.sector_size, 4096);
        assert_eq!(info.block_count, 1024);
        assert_eq!(info.size_bytes(), 8192 * 512);
    }

    #[test]
    fn test_probe_missing_device() {
        let root = tempfile::tempdir().expect("tempdir");
        assert!(matches!(
            probe(root.path(), "sdz"),
            Err(StorageError::DiskProbe { .. })
        ));
    }

    #[test]
    fn test_probe_garbage_size() {
        let root = tempfile::tempdir().expect("tempdir");
        write(&root.path().join("sda/size"), "lots\n");
        assert!(matches!(
            probe(root.path(), "sda"),
            Err(StorageError::DiskProbe { .. })
        ));
    }

    #[test]
    fn test_parse_mounts_unescapes_fields() {
        let table = "\
/dev/root / ext4 rw,relatime 0 0
/dev/mmcblk0p1 /media/SD\\040card vfat rw,relatime,fmask=0022 0 0
broken
";
        let entries = parse_mounts(table);
        assert_eq!(entries.len(), 2);

        let card = &entries[1];
        assert_eq!(card.source, "/dev/mmcblk0p1");
        assert_eq!(card.target, PathBuf::from("/media/SD card"));
        assert!(card.is_fat());
        assert!(!card.is_read_only());
        assert!(!entries[0].is_fat());
    }

    #[test]
    fn test_find_mount_prefers_last_entry() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mount_point = fs::canonicalize(dir.path()).expect("canonical tempdir");
        let table_path = dir.path().join("mounts");
        let table = format!(
            "tmpfs {0} tmpfs rw 0 0\n/dev/sdb1 {0} vfat ro 0 0\n/dev/sda1 /boot vfat rw 0 0\n",
            mount_point.display()
        );
        fs::write(&table_path, table).expect("write table");

        let entry = find_mount(&table_path, &mount_point)
            .expect("table readable")
            .expect("mount point listed");
        assert_eq!(entry.source, "/dev/sdb1");
        assert!(entry.is_read_only());

        let other = dir.path().join("elsewhere");
        assert_eq!(find_mount(&table_path, &other).expect("readable"), None);
    }
}
