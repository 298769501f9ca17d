//! On-device file naming.
//!
//! Media files live under `iPod_Control/Music/Fxx/` with four-letter names
//! (`ABCD.mp3`). The four letters are a base-26 encoding of a counter, and the
//! counter also picks the bucket directory so files spread evenly across
//! `F00`..`F49`.

use crate::error::AllocError;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

pub const MUSIC_DIR: &str = "iPod_Control/Music";
pub const DEFAULT_BUCKETS: u32 = 50;
/// Number of distinct four-letter codes (26^4).
pub const CODE_SPACE: u32 = 26 * 26 * 26 * 26;
/// Legacy firmware limit on the device-relative path.
pub const MAX_DEVICE_PATH_LEN: usize = 56;

const FILES_PER_BUCKET_RUN: u32 = 100;
const MAX_TRIES: u32 = 5;
const DEFAULT_EXTENSION: &str = ".mp3";

/// A freshly allocated target location on the device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllocatedPath {
    pub bucket: u32,
    pub code: String,
    pub extension: String,
    /// Absolute path under the mount point.
    pub absolute: PathBuf,
    /// Path as stored in the database, e.g. `/iPod_Control/Music/F00/AAAB.mp3`.
    pub device_relative: String,
}

pub fn bucket_name(bucket: u32) -> String {
    format!("F{:02}", bucket)
}

pub fn music_root(mount_point: &Path) -> PathBuf {
    mount_point.join(MUSIC_DIR)
}

/// Encodes `value mod 26^4` as four uppercase letters, most significant first.
pub fn encode_code(value: u32) -> String {
    let mut n = value % CODE_SPACE;
    let mut letters = [b'A'; 4];
    for slot in letters.iter_mut().rev() {
        *slot = b'A' + (n % 26) as u8;
        n /= 26;
    }
    letters.iter().map(|&b| b as char).collect()
}

/// Decodes the first four characters of a file name back into a counter.
/// Returns `None` unless they are all `A`-`Z`.
pub fn decode_code(name: &str) -> Option<u32> {
    let prefix = name.as_bytes().get(..4)?;
    prefix.iter().try_fold(0u32, |acc, &b| {
        b.is_ascii_uppercase().then(|| acc * 26 + u32::from(b - b'A'))
    })
}

/// Normalizes a source file's extension into something the device firmware
/// will accept: a dot followed by 1-4 lowercase ASCII alphanumerics.
fn device_extension(original_filename: &str) -> String {
    let ext = Path::new(original_filename)
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("");

    let cleaned: String = ext
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .map(|c| c.to_ascii_lowercase())
        .collect();

    if cleaned.is_empty() || cleaned.len() > 4 {
        DEFAULT_EXTENSION.to_string()
    } else {
        format!(".{}", cleaned)
    }
}

/// Hands out unique device file names for one library session.
#[derive(Debug, Clone)]
pub struct PathAllocator {
    counter: u32,
    num_buckets: u32,
}

impl Default for PathAllocator {
    fn default() -> Self {
        Self::new(DEFAULT_BUCKETS)
    }
}

impl PathAllocator {
    pub fn new(num_buckets: u32) -> Self {
        Self {
            counter: 1,
            num_buckets: num_buckets.max(1),
        }
    }

    pub fn counter(&self) -> u32 {
        self.counter
    }

    pub fn num_buckets(&self) -> u32 {
        self.num_buckets
    }

    /// Seeds the counter past every code already present on the device.
    /// Every `Fxx` directory is scanned, not just the configured buckets.
    /// Unreadable directories are skipped.
    pub fn initialize(&mut self, mount_point: &Path) {
        let mut max_seen: Option<u32> = None;

        let buckets = fs::read_dir(music_root(mount_point))
            .into_iter()
            .flatten()
            .flatten()
            .filter(|e| e.file_name().to_str().is_some_and(is_bucket_dir_name))
            .map(|e| e.path());
        for dir in buckets {
            let Ok(entries) = fs::read_dir(&dir) else {
                continue;
            };
            for entry in entries.flatten() {
                let name = entry.file_name();
                let Some(name) = name.to_str() else { continue };
                if let Some(value) = decode_code(name) {
                    max_seen = Some(max_seen.map_or(value, |m| m.max(value)));
                }
            }
        }

        self.counter = max_seen.map_or(1, |m| m + 1);
        debug!("Initialized iPod file counter to {}", self.counter);
    }

    /// Allocates the next free device path for `original_filename`.
    ///
    /// Never returns a path that already exists on disk; gives up after a few
    /// occupied slots instead of overwriting.
    pub fn allocate(
        &mut self,
        mount_point: &Path,
        original_filename: &str,
    ) -> Result<AllocatedPath, AllocError> {
        let extension = device_extension(original_filename);
        let mut last = PathBuf::new();

        for _ in 0..MAX_TRIES {
            if self.counter >= CODE_SPACE {
                return Err(AllocError::CodeSpaceExhausted(CODE_SPACE));
            }

            let value = self.counter;
            self.counter += 1;

            let bucket = (value / FILES_PER_BUCKET_RUN) % self.num_buckets;
            let code = encode_code(value);
            let device_relative = format!(
                "/{}/{}/{}{}",
                MUSIC_DIR,
                bucket_name(bucket),
                code,
                extension
            );
            if device_relative.len() > MAX_DEVICE_PATH_LEN {
                return Err(AllocError::PathTooLong(device_relative));
            }

            let absolute = music_root(mount_point)
                .join(bucket_name(bucket))
                .join(format!("{}{}", code, extension));

            if absolute.exists() {
                warn!("Device file {} already exists, skipping code", absolute.display());
                last = absolute;
                continue;
            }

            debug!("Allocated device path {} (counter: {})", device_relative, value);
            return Ok(AllocatedPath {
                bucket,
                code,
                extension,
                absolute,
                device_relative,
            });
        }

        Err(AllocError::Collision {
            tries: MAX_TRIES,
            last,
        })
    }
}

fn is_bucket_dir_name(name: &str) -> bool {
    matches!(name.as_bytes(), [b'F', a, b] if a.is_ascii_digit() && b.is_ascii_digit())
}

/// Creates `iPod_Control/Music/F00..` on the device. Individual bucket
/// failures are logged and skipped; failing to create the music root is an
/// error.
pub fn ensure_layout(mount_point: &Path, num_buckets: u32) -> std::io::Result<()> {
    let root = music_root(mount_point);
    fs::create_dir_all(&root)?;

    for bucket in 0..num_buckets {
        let dir = root.join(bucket_name(bucket));
        if let Err(e) = fs::create_dir_all(&dir) {
            warn!("Failed to create directory {}: {}", dir.display(), e);
        }
    }

    debug!("iPod directory structure ensured (F00-F{:02})", num_buckets.saturating_sub(1));
    Ok(())
}
