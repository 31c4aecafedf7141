//! SD card volume: mount handling, directory listing and frame files.

use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Seek, SeekFrom, Write};
use std::path::{Component, Path, PathBuf};

use rustix::mount::{self, MountFlags, UnmountFlags};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::config::StorageConfig;
use crate::disk;

/// Error type for volume operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Disk geometry could not be read.
    #[error("Unable to probe disk '{drive}': {detail}")]
    DiskProbe {
        /// Block device name.
        drive: String,
        /// What went wrong.
        detail: String,
    },
    /// Mount point is missing or not a directory.
    #[error("Mount point {0} is not a directory")]
    NotADirectory(PathBuf),
    /// Mount requested on a mounted volume.
    #[error("Volume {0} is already mounted")]
    AlreadyMounted(PathBuf),
    /// Operation requires a mounted volume.
    #[error("Volume {0} is not mounted")]
    NotMounted(PathBuf),
    /// The card could not be mounted.
    #[error("Unable to mount {device} on {target}: {source}")]
    Mount {
        /// Device node of the card.
        device: PathBuf,
        /// Mount point.
        target: PathBuf,
        /// Underlying error.
        #[source]
        source: io::Error,
    },
    /// The card could not be detached.
    #[error("Unable to unmount {target}: {source}")]
    Unmount {
        /// Mount point.
        target: PathBuf,
        /// Underlying error.
        #[source]
        source: io::Error,
    },
    /// Path escapes the volume.
    #[error("Invalid path '{0}'")]
    InvalidPath(PathBuf),
    /// Fewer bytes than expected reached the file.
    #[error("Short write to {path}: {written} of {expected} bytes")]
    ShortWrite {
        /// File being written.
        path: PathBuf,
        /// Bytes actually written.
        written: u64,
        /// Bytes that should have been written.
        expected: u64,
    },
    /// I/O error on a path.
    #[error("I/O error on {path}: {source}")]
    Io {
        /// Path the operation was on.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: io::Error,
    },
}

/// Result type for volume operations.
pub type Result<T> = std::result::Result<T, StorageError>;

fn io_err(path: &Path) -> impl FnOnce(io::Error) -> StorageError + '_ {
    move |source| StorageError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Kind of a directory entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    /// Regular file (or anything that is not a directory).
    File,
    /// Directory.
    Dir,
}

/// One entry of a directory listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    /// File name.
    pub name: String,
    /// File or directory.
    pub kind: EntryKind,
    /// Size in bytes (0 for directories).
    pub size: u64,
}

impl fmt::Display for DirEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            EntryKind::Dir => write!(f, "[DIR ] {}", self.name),
            EntryKind::File => write!(f, "[FILE] {} (size = {})", self.name, self.size),
        }
    }
}

/// Kernel operations that attach and detach the card's filesystem.
pub trait Mounter: fmt::Debug {
    /// Mount the filesystem on `source` at `target`.
    fn attach(&mut self, source: &Path, target: &Path, fstype: &str) -> io::Result<()>;

    /// Detach the filesystem mounted at `target`.
    fn detach(&mut self, target: &Path) -> io::Result<()>;

    /// Flush every dirty block of the filesystem holding `target`.
    fn sync(&mut self, target: &Path) -> io::Result<()>;
}

/// `mount(2)`, `umount2(2)` and `syncfs(2)` on the running kernel.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemMounter;

impl Mounter for SystemMounter {
    fn attach(&mut self, source: &Path, target: &Path, fstype: &str) -> io::Result<()> {
        mount::mount(source, target, fstype, MountFlags::empty(), "")?;
        Ok(())
    }

    fn detach(&mut self, target: &Path) -> io::Result<()> {
        mount::unmount(target, UnmountFlags::empty())?;
        Ok(())
    }

    fn sync(&mut self, target: &Path) -> io::Result<()> {
        let dir = File::open(target)?;
        rustix::fs::syncfs(&dir)?;
        Ok(())
    }
}

/// How a mounted volume got attached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MountMode {
    /// The host had already mounted the card; unmounting leaves it attached.
    Adopted,
    /// This process mounted the card and detaches it on unmount.
    Attached,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum MountState {
    Unmounted,
    Mounted { mode: MountMode, fstype: String },
}

/// The card's filesystem, attached at a fixed mount point.
#[derive(Debug)]
pub struct Volume {
    drive: String,
    device: PathBuf,
    fstype: String,
    mount_point: PathBuf,
    mount_table: PathBuf,
    sysfs_root: PathBuf,
    frame_prefix: String,
    mounter: Box<dyn Mounter>,
    state: MountState,
}

impl Volume {
    /// Create an unmounted volume handle using the system mounter.
    pub fn new(config: &StorageConfig) -> Self {
        Self::with_mounter(config, Box::new(SystemMounter))
    }

    /// Create an unmounted volume handle with a custom mounter.
    pub fn with_mounter(config: &StorageConfig, mounter: Box<dyn Mounter>) -> Self {
        Self {
            drive: config.drive.clone(),
            device: config.device_dir.join(&config.drive),
            fstype: config.fstype.clone(),
            mount_point: config.mount_point.clone(),
            mount_table: config.mount_table.clone(),
            sysfs_root: config.sysfs_root.clone(),
            frame_prefix: config.frame_prefix.clone(),
            mounter,
            state: MountState::Unmounted,
        }
    }

    /// Probe the disk, mount the volume and check it survives a remount.
    ///
    /// Disk probe failures are only logged: the volume may still be usable.
    pub fn init(config: &StorageConfig) -> Result<Self> {
        Self::new(config).bring_up()
    }

    /// [`Volume::init`] with a custom mounter.
    pub fn init_with(config: &StorageConfig, mounter: Box<dyn Mounter>) -> Result<Self> {
        Self::with_mounter(config, mounter).bring_up()
    }

    fn bring_up(mut self) -> Result<Self> {
        match disk::probe(&self.sysfs_root, &self.drive) {
            Ok(info) => {
                info!("Block count {}", info.block_count);
                info!("Sector size {}", info.sector_size);
                info!("Memory Size(MB) {}", info.size_mb());
            }
            Err(err) => error!("Storage init ERROR! {err}"),
        }

        self.mount().inspect_err(|_| error!("Error mounting disk"))?;
        info!("Disk mounted");

        self.unmount()
            .inspect_err(|_| error!("Error unmounting disk"))?;
        self.mount()
            .inspect_err(|_| error!("Error remounting disk"))?;

        Ok(self)
    }

    /// Block device name of the card.
    pub fn drive(&self) -> &str {
        &self.drive
    }

    /// Device node mounted when the host has not mounted the card.
    pub fn device(&self) -> &Path {
        &self.device
    }

    /// Directory the volume is attached to.
    pub fn mount_point(&self) -> &Path {
        &self.mount_point
    }

    /// Whether the volume is mounted.
    pub const fn is_mounted(&self) -> bool {
        matches!(self.state, MountState::Mounted { .. })
    }

    /// How the volume was mounted, if it is.
    pub const fn mode(&self) -> Option<MountMode> {
        match self.state {
            MountState::Mounted { mode, .. } => Some(mode),
            MountState::Unmounted => None,
        }
    }

    /// Filesystem type of the mounted volume.
    pub fn fstype(&self) -> Option<&str> {
        match &self.state {
            MountState::Mounted { fstype, .. } => Some(fstype),
            MountState::Unmounted => None,
        }
    }

    /// Attach the volume.
    ///
    /// A card the mount table already lists on the mount point is adopted
    /// as is. Otherwise the card's device node is mounted there.
    pub fn mount(&mut self) -> Result<()> {
        if self.is_mounted() {
            return Err(StorageError::AlreadyMounted(self.mount_point.clone()));
        }
        if !self.mount_point.is_dir() {
            return Err(StorageError::NotADirectory(self.mount_point.clone()));
        }

        let existing = disk::find_mount(&self.mount_table, &self.mount_point)
            .inspect_err(|err| warn!("Unable to read mount table: {err}"))
            .ok()
            .flatten();

        self.state = match existing {
            Some(entry) => {
                debug!(
                    "{} mounted from {} ({}, {})",
                    entry.target.display(),
                    entry.source,
                    entry.fstype,
                    entry.options
                );
                if !entry.is_fat() {
                    warn!(
                        "{} holds a {} filesystem, expected FAT",
                        self.mount_point.display(),
                        entry.fstype
                    );
                }
                if entry.is_read_only() {
                    warn!("{} is mounted read-only", self.mount_point.display());
                }
                MountState::Mounted {
                    mode: MountMode::Adopted,
                    fstype: entry.fstype,
                }
            }
            None => {
                info!(
                    "Mounting {} on {} ({})",
                    self.device.display(),
                    self.mount_point.display(),
                    self.fstype
                );
                self.mounter
                    .attach(&self.device, &self.mount_point, &self.fstype)
                    .map_err(|source| StorageError::Mount {
                        device: self.device.clone(),
                        target: self.mount_point.clone(),
                        source,
                    })?;
                MountState::Mounted {
                    mode: MountMode::Attached,
                    fstype: self.fstype.clone(),
                }
            }
        };
        Ok(())
    }

    /// Flush the volume and detach it.
    pub fn unmount(&mut self) -> Result<()> {
        let Some(mode) = self.mode() else {
            error!("Error unmounting the disk");
            return Err(StorageError::NotMounted(self.mount_point.clone()));
        };

        self.mounter
            .sync(&self.mount_point)
            .map_err(io_err(&self.mount_point))?;

        match mode {
            MountMode::Attached => {
                self.mounter
                    .detach(&self.mount_point)
                    .map_err(|source| StorageError::Unmount {
                        target: self.mount_point.clone(),
                        source,
                    })?;
            }
            MountMode::Adopted => debug!(
                "{} belongs to the host, leaving it attached",
                self.mount_point.display()
            ),
        }

        self.state = MountState::Unmounted;
        Ok(())
    }

    fn ensure_mounted(&self) -> Result<()> {
        if self.is_mounted() {
            Ok(())
        } else {
            Err(StorageError::NotMounted(self.mount_point.clone()))
        }
    }

    /// Resolve a path relative to the mount point, refusing to leave it.
    pub fn resolve(&self, relative: &Path) -> Result<PathBuf> {
        let escapes = relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
        if escapes {
            return Err(StorageError::InvalidPath(relative.to_path_buf()));
        }
        Ok(self.mount_point.join(relative))
    }

    /// List a directory of the volume, sorted by name.
    pub fn list_dir(&self, relative: Option<&Path>) -> Result<Vec<DirEntry>> {
        self.ensure_mounted()?;
        let dir = match relative {
            Some(path) => self.resolve(path)?,
            None => self.mount_point.clone(),
        };

        let mut entries = Vec::new();
        for entry in fs::read_dir(&dir).map_err(io_err(&dir))? {
            let entry = entry.map_err(io_err(&dir))?;
            let metadata = entry.metadata().map_err(io_err(&entry.path()))?;
            let kind = if metadata.is_dir() {
                EntryKind::Dir
            } else {
                EntryKind::File
            };
            entries.push(DirEntry {
                name: entry.file_name().to_string_lossy().into_owned(),
                kind,
                size: if kind == EntryKind::Dir { 0 } else { metadata.len() },
            });
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    /// Path of the file frame `num` is saved to.
    pub fn frame_path(&self, num: u32) -> PathBuf {
        self.mount_point
            .join(format!("{}{num}", self.frame_prefix))
    }

    /// Save a frame payload: create, truncate, seek, write, sync, close.
    pub fn write_frame(&self, num: u32, payload: &[u8]) -> Result<PathBuf> {
        self.ensure_mounted()?;
        let path = self.frame_path(num);
        let len = payload.len() as u64;

        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&path)
            .inspect_err(|_| error!("Failed to create file {}", path.display()))
            .map_err(io_err(&path))?;

        file.set_len(len)
            .inspect_err(|_| error!("Failed to truncate file"))
            .map_err(io_err(&path))?;
        file.seek(SeekFrom::Start(0))
            .inspect_err(|_| error!("Failed to seek to start"))
            .map_err(io_err(&path))?;

        info!("writing file: size: {len}");
        file.write_all(payload)
            .inspect_err(|_| error!("Cannot write file"))
            .map_err(io_err(&path))?;

        let written = file.stream_position().map_err(io_err(&path))?;
        if written != len {
            return Err(StorageError::ShortWrite {
                path,
                written,
                expected: len,
            });
        }

        file.sync_all().map_err(io_err(&path))?;
        Ok(path)
    }
}

/// Settings for a card directory under `root` that the mount table lists
/// as host-mounted.
#[cfg(test)]
pub(crate) fn host_mounted_config(root: &Path) -> StorageConfig {
    let card = root.join("card");
    fs::create_dir_all(&card).expect("create card dir");
    let target = fs::canonicalize(&card).expect("canonical card dir");
    let table = root.join("mounts");
    fs::write(
        &table,
        format!("/dev/mmcblk0p1 {} vfat rw,relatime 0 0\n", target.display()),
    )
    .expect("write mount table");

    let mut config = StorageConfig::with_mount_point(card);
    config.sysfs_root = root.join("sys");
    config.mount_table = table;
    config
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    /// Records mounter calls; attach fails when `refuse_attach` is set.
    #[derive(Debug, Default, Clone)]
    struct RecordingMounter {
        calls: Rc<RefCell<Vec<String>>>,
        refuse_attach: bool,
    }

    impl RecordingMounter {
        fn calls(&self) -> Vec<String> {
            self.calls.borrow().clone()
        }
    }

    impl Mounter for RecordingMounter {
        fn attach(&mut self, source: &Path, target: &Path, fstype: &str) -> io::Result<()> {
            if self.refuse_attach {
                return Err(io::Error::from_raw_os_error(1));
            }
            self.calls.borrow_mut().push(format!(
                "attach {} {} {fstype}",
                source.display(),
                target.display()
            ));
            Ok(())
        }

        fn detach(&mut self, target: &Path) -> io::Result<()> {
            self.calls
                .borrow_mut()
                .push(format!("detach {}", target.display()));
            Ok(())
        }

        fn sync(&mut self, target: &Path) -> io::Result<()> {
            self.calls
                .borrow_mut()
                .push(format!("sync {}", target.display()));
            Ok(())
        }
    }

    fn bare_config(dir: &Path) -> StorageConfig {
        let mut config = StorageConfig::with_mount_point(dir);
        config.sysfs_root = dir.join("no-sysfs");
        config.mount_table = dir.join("no-mounts");
        config
    }

    fn mounted(root: &Path) -> Volume {
        Volume::init(&host_mounted_config(root)).expect("init should succeed")
    }

    #[test]
    fn test_init_adopts_host_mount() {
        let dir = tempfile::tempdir().expect("tempdir");
        let volume = mounted(dir.path());
        assert!(volume.is_mounted());
        assert_eq!(volume.mode(), Some(MountMode::Adopted));
        assert_eq!(volume.fstype(), Some("vfat"));
        assert_eq!(volume.drive(), "mmcblk0");
    }

    #[test]
    fn test_init_attaches_unmounted_card() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mounter = RecordingMounter::default();
        let volume = Volume::init_with(&bare_config(dir.path()), Box::new(mounter.clone()))
            .expect("init should succeed");

        assert_eq!(volume.mode(), Some(MountMode::Attached));
        assert_eq!(volume.device(), Path::new("/dev/mmcblk0"));
        let mount_point = dir.path().display();
        assert_eq!(
            mounter.calls(),
            vec![
                format!("attach /dev/mmcblk0 {mount_point} vfat"),
                format!("sync {mount_point}"),
                format!("detach {mount_point}"),
                format!("attach /dev/mmcblk0 {mount_point} vfat"),
            ]
        );
    }

    #[test]
    fn test_init_fails_when_card_cannot_be_mounted() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mounter = RecordingMounter {
            refuse_attach: true,
            ..RecordingMounter::default()
        };
        let err = Volume::init_with(&bare_config(dir.path()), Box::new(mounter))
            .expect_err("plain directory is not a card");
        assert!(matches!(err, StorageError::Mount { .. }));
    }

    #[test]
    fn test_init_fails_without_mount_point() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = bare_config(&dir.path().join("missing"));
        assert!(matches!(
            Volume::init_with(&config, Box::new(RecordingMounter::default())),
            Err(StorageError::NotADirectory(_))
        ));
    }

    #[test]
    fn test_adopted_unmount_leaves_host_mount() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = host_mounted_config(dir.path());
        let mounter = RecordingMounter::default();
        let mut volume = Volume::init_with(&config, Box::new(mounter.clone())).expect("init");

        volume.unmount().expect("unmount should succeed");
        assert!(!volume.is_mounted());
        assert_eq!(volume.mode(), None);
        assert!(mounter.calls().iter().all(|call| call.starts_with("sync ")));
    }

    #[test]
    fn test_mount_state_transitions() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut volume = Volume::new(&host_mounted_config(dir.path()));
        assert!(!volume.is_mounted());
        assert!(matches!(
            volume.unmount(),
            Err(StorageError::NotMounted(_))
        ));

        volume.mount().expect("mount should succeed");
        assert!(matches!(
            volume.mount(),
            Err(StorageError::AlreadyMounted(_))
        ));

        volume.unmount().expect("unmount should succeed");
        assert!(matches!(
            volume.list_dir(None),
            Err(StorageError::NotMounted(_))
        ));
        assert!(matches!(
            volume.write_frame(1, b"data"),
            Err(StorageError::NotMounted(_))
        ));
    }

    #[test]
    fn test_mount_reads_fstype_from_table() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = host_mounted_config(dir.path());
        let target = fs::canonicalize(&config.mount_point).expect("canonical");
        fs::write(
            &config.mount_table,
            format!("/dev/sda1 {} ext4 ro 0 0\n", target.display()),
        )
        .expect("write table");

        let volume = Volume::init(&config).expect("init should succeed");
        assert_eq!(volume.fstype(), Some("ext4"));
        assert_eq!(volume.mode(), Some(MountMode::Adopted));
    }

    #[test]
    fn test_write_frame_truncates_previous_content() {
        let dir = tempfile::tempdir().expect("tempdir");
        let volume = mounted(dir.path());

        fs::write(volume.frame_path(2), vec![0xAA; 1024]).expect("seed old frame");
        let path = volume
            .write_frame(2, &[1, 2, 3, 4])
            .expect("write should succeed");

        assert_eq!(path, dir.path().join("card/frame-2"));
        assert_eq!(fs::read(&path).expect("read back"), vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_write_empty_frame() {
        let dir = tempfile::tempdir().expect("tempdir");
        let volume = mounted(dir.path());
        let path = volume.write_frame(0, &[]).expect("write should succeed");
        assert_eq!(fs::metadata(path).expect("metadata").len(), 0);
    }

    #[test]
    fn test_list_dir_formats_entries() {
        let dir = tempfile::tempdir().expect("tempdir");
        let volume = mounted(dir.path());
        volume.write_frame(7, &[0; 16]).expect("write frame");
        fs::create_dir(volume.mount_point().join("DCIM")).expect("mkdir");

        let entries = volume.list_dir(None).expect("list should succeed");
        let lines: Vec<String> = entries.iter().map(ToString::to_string).collect();
        assert_eq!(lines, vec!["[DIR ] DCIM", "[FILE] frame-7 (size = 16)"]);

        let empty = volume
            .list_dir(Some(Path::new("DCIM")))
            .expect("list subdir");
        assert!(empty.is_empty());
    }

    #[test]
    fn test_list_dir_rejects_escaping_paths() {
        let dir = tempfile::tempdir().expect("tempdir");
        let volume = mounted(dir.path());
        assert!(matches!(
            volume.list_dir(Some(Path::new("../etc"))),
            Err(StorageError::InvalidPath(_))
        ));
        assert!(matches!(
            volume.list_dir(Some(Path::new("/etc"))),
            Err(StorageError::InvalidPath(_))
        ));
        assert!(matches!(
            volume.list_dir(Some(Path::new("nope"))),
            Err(StorageError::Io { .. })
        ));
    }
}
