use crate::allocator;
use anyhow::{bail, Context, Result};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

pub const AUTO: &str = "auto";
const CONTROL_DIR: &str = "iPod_Control";
const PROBE_FILE: &str = ".podsync_write_test";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilesystemType {
    Fat32,
    HfsPlus,
    ExFat,
    Unknown,
}

impl FilesystemType {
    fn from_mount_type(fs_type: &str) -> Self {
        match fs_type {
            "vfat" | "msdos" | "fat" | "fat32" => FilesystemType::Fat32,
            "hfsplus" | "hfs" => FilesystemType::HfsPlus,
            "exfat" => FilesystemType::ExFat,
            _ => FilesystemType::Unknown,
        }
    }
}

impl fmt::Display for FilesystemType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            FilesystemType::Fat32 => "FAT32",
            FilesystemType::HfsPlus => "HFS+",
            FilesystemType::ExFat => "exFAT",
            FilesystemType::Unknown => "Unknown",
        })
    }
}

/// A validated, writable device root.
#[derive(Debug, Clone)]
pub struct MountPoint {
    pub path: PathBuf,
    pub filesystem: FilesystemType,
}

impl MountPoint {
    pub fn has_control_dir(&self) -> bool {
        self.path.join(CONTROL_DIR).is_dir()
    }

    /// Creates the music bucket directories if missing.
    pub fn ensure_layout(&self, num_buckets: u32) -> Result<()> {
        allocator::ensure_layout(&self.path, num_buckets).with_context(|| {
            format!(
                "Failed to create iPod directory structure under {}",
                self.path.display()
            )
        })
    }
}

fn candidate_roots() -> Vec<PathBuf> {
    let mut roots = Vec::new();
    if let Ok(user) = std::env::var("USER") {
        roots.push(PathBuf::from("/media").join(&user));
        roots.push(PathBuf::from("/run/media").join(&user));
    }
    roots.extend(["/media", "/mnt", "/Volumes"].map(PathBuf::from));
    roots
}

/// First child of `roots` that contains an `iPod_Control` directory.
fn find_device(roots: &[PathBuf]) -> Option<PathBuf> {
    for root in roots {
        let Ok(entries) = fs::read_dir(root) else {
            continue;
        };
        let mut children: Vec<PathBuf> = entries.flatten().map(|e| e.path()).collect();
        children.sort();
        if let Some(found) = children.into_iter().find(|c| c.join(CONTROL_DIR).is_dir()) {
            return Some(found);
        }
    }
    None
}

fn check_writable(path: &Path) -> Result<()> {
    let probe = path.join(PROBE_FILE);
    fs::write(&probe, b"")
        .with_context(|| format!("Mount point {} is not writable", path.display()))?;
    if let Err(e) = fs::remove_file(&probe) {
        warn!("Failed to remove {}: {}", probe.display(), e);
    }
    Ok(())
}

/// Looks `path` up in `/proc/mounts`, taking the longest matching mount.
pub fn detect_filesystem(path: &Path) -> FilesystemType {
    let Ok(mounts) = fs::read_to_string("/proc/mounts") else {
        return FilesystemType::Unknown;
    };
    let path = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());

    mounts
        .lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let _device = fields.next()?;
            let target = fields.next()?.replace("\\040", " ");
            let fs_type = fields.next()?;
            Some((PathBuf::from(target), fs_type.to_string()))
        })
        .filter(|(target, _)| path.starts_with(target))
        .max_by_key(|(target, _)| target.as_os_str().len())
        .map(|(_, fs_type)| FilesystemType::from_mount_type(&fs_type))
        .unwrap_or(FilesystemType::Unknown)
}

/// Resolves `"auto"` or an explicit path to a usable device root.
pub fn resolve_mount_point(arg: &str) -> Result<MountPoint> {
    let path = if arg == AUTO {
        let found = find_device(&candidate_roots())
            .context("No iPod found (looked for iPod_Control under /media, /run/media, /mnt and /Volumes)")?;
        info!("Found iPod at {}", found.display());
        found
    } else {
        PathBuf::from(arg)
    };

    if !path.exists() {
        bail!("Mount point {} does not exist", path.display());
    }
    if !path.is_dir() {
        bail!("Mount point {} is not a directory", path.display());
    }
    check_writable(&path)?;

    let filesystem = detect_filesystem(&path);
    debug!("Mount point {} ({})", path.display(), filesystem);
    Ok(MountPoint { path, filesystem })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_directory_resolves() {
        let dir = tempfile::tempdir().unwrap();
        let mount = resolve_mount_point(dir.path().to_str().unwrap()).unwrap();
        assert_eq!(mount.path, dir.path());
        assert!(!mount.has_control_dir());
        assert!(!dir.path().join(PROBE_FILE).exists());

        mount.ensure_layout(50).unwrap();
        assert!(mount.has_control_dir());
    }

    #[test]
    fn missing_or_file_paths_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        assert!(resolve_mount_point(dir.path().join("gone").to_str().unwrap()).is_err());
        let file = dir.path().join("file");
        fs::write(&file, b"x").unwrap();
        assert!(resolve_mount_point(file.to_str().unwrap()).is_err());
    }

    #[test]
    fn device_scan_finds_control_dir() {
        let root = tempfile::tempdir().unwrap();
        fs::create_dir_all(root.path().join("USB STICK")).unwrap();
        fs::create_dir_all(root.path().join("IPOD/iPod_Control")).unwrap();
        let roots = vec![root.path().join("absent"), root.path().to_path_buf()];
        assert_eq!(find_device(&roots), Some(root.path().join("IPOD")));
    }

    #[test]
    fn mount_types_map_to_filesystems() {
        assert_eq!(FilesystemType::from_mount_type("vfat"), FilesystemType::Fat32);
        assert_eq!(FilesystemType::from_mount_type("hfsplus"), FilesystemType::HfsPlus);
        assert_eq!(FilesystemType::from_mount_type("ext4"), FilesystemType::Unknown);
        assert_eq!(FilesystemType::HfsPlus.to_string(), "HFS+");
    }
}
