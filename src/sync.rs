//! Copying host media onto the device and indexing it.
//!
//! A [`SyncSession`] drives every file through probe, duplicate check,
//! allocation, copy, build and index. Failures of a single file are counted
//! and logged; the batch keeps going. Nothing is written to the database file
//! here, the caller saves once the batch is done.

use crate::allocator::PathAllocator;
use crate::config::SyncConfig;
use crate::db::Database;
use crate::error::SyncError;
use crate::metadata::{LoftyProbe, MetadataProbe, TypeResolution};
use crate::models::{MediaType, SyncStats};
use crate::track_builder::{stored_identity, TrackBuilder};
use chrono::Local;
use std::fs;
use std::io;
use std::ops::{Deref, DerefMut};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};
use walkdir::{DirEntry, WalkDir};

pub const SUPPORTED_EXTENSIONS: [&str; 8] = ["mp3", "m4a", "m4b", "aac", "wav", "aiff", "m4p", "mp4"];

/// Shared flag checked between files. Clones observe the same flag.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Sets `cancel` on the first Ctrl-C (or SIGTERM on unix). The signals are
/// registered before this returns and awaited on a helper thread with its own
/// single-threaded runtime.
pub fn install_interrupt_handler(cancel: &CancelToken) -> io::Result<()> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    let signals = {
        let _context = runtime.enter();
        ShutdownSignals::register()?
    };
    let cancel = cancel.clone();

    std::thread::Builder::new()
        .name("podsync-interrupt".to_string())
        .spawn(move || {
            runtime.block_on(async {
                if signals.recv().await {
                    info!("Interrupted, finishing the current file");
                    cancel.cancel();
                }
            });
        })?;
    Ok(())
}

#[cfg(unix)]
struct ShutdownSignals {
    interrupt: tokio::signal::unix::Signal,
    terminate: tokio::signal::unix::Signal,
}

#[cfg(unix)]
impl ShutdownSignals {
    fn register() -> io::Result<Self> {
        use tokio::signal::unix::{signal, SignalKind};
        Ok(Self {
            interrupt: signal(SignalKind::interrupt())?,
            terminate: signal(SignalKind::terminate())?,
        })
    }

    async fn recv(mut self) -> bool {
        tokio::select! {
            got = self.interrupt.recv() => got.is_some(),
            got = self.terminate.recv() => got.is_some(),
        }
    }
}

#[cfg(not(unix))]
struct ShutdownSignals;

#[cfg(not(unix))]
impl ShutdownSignals {
    fn register() -> io::Result<Self> {
        Ok(Self)
    }

    async fn recv(self) -> bool {
        tokio::signal::ctrl_c().await.is_ok()
    }
}

/// Moves file bytes onto the device.
pub trait MediaTransfer {
    /// Copies `source` to `dest` and returns the number of bytes written. A
    /// partially written `dest` must not be left behind on error.
    fn copy(&self, source: &Path, dest: &Path) -> io::Result<u64>;
}

/// Plain filesystem copy with a size check.
#[derive(Debug, Clone, Copy, Default)]
pub struct FsTransfer;

impl MediaTransfer for FsTransfer {
    fn copy(&self, source: &Path, dest: &Path) -> io::Result<u64> {
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }

        let result = fs::copy(source, dest).and_then(|written| {
            let expected = fs::metadata(source)?.len();
            if written == expected {
                Ok(written)
            } else {
                Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!("copied {} of {} bytes", written, expected),
                ))
            }
        });

        if result.is_err() {
            let _ = fs::remove_file(dest);
        }
        result
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncStatus {
    Completed,
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct SyncReport {
    pub stats: SyncStats,
    pub status: SyncStatus,
}

pub type ProgressFn<'a> = Box<dyn FnMut(usize, usize) + 'a>;

enum FileOutcome {
    Added,
    Skipped,
}

pub fn is_supported_media_file(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|ext| {
            SUPPORTED_EXTENSIONS
                .iter()
                .any(|s| s.eq_ignore_ascii_case(ext))
        })
}

fn is_hidden(entry: &DirEntry) -> bool {
    entry.depth() > 0
        && entry
            .file_name()
            .to_str()
            .is_some_and(|name| name.starts_with('.'))
}

/// Everything below `dir` in file-name order, without dot-entries.
fn walk(dir: &Path) -> impl Iterator<Item = walkdir::Result<DirEntry>> {
    WalkDir::new(dir)
        .min_depth(1)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| !is_hidden(e))
}

/// Number of files a tree sync of `dir` would consider.
pub fn count_audio_files_recursive(dir: &Path) -> usize {
    walk(dir)
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file() && is_supported_media_file(e.path()))
        .count()
}

/// One batch of syncing against an open [`Database`].
pub struct SyncSession<'a> {
    db: &'a Database,
    allocator: PathAllocator,
    builder: TrackBuilder,
    skip_duplicates: bool,
    probe: Box<dyn MetadataProbe + 'a>,
    transfer: Box<dyn MediaTransfer + 'a>,
    cancel: CancelToken,
    progress: Option<ProgressFn<'a>>,
    resolution: TypeResolution,
    stats: SyncStats,
    processed: usize,
    total: usize,
}

impl<'a> SyncSession<'a> {
    /// Seeds the path allocator from the files already on the device.
    pub fn new(db: &'a Database, config: &SyncConfig) -> Self {
        let mut allocator = PathAllocator::new(config.num_buckets);
        allocator.initialize(db.mount_point());

        Self {
            db,
            allocator,
            builder: TrackBuilder::new(config.default_bitrate_kbps),
            skip_duplicates: config.skip_duplicates,
            probe: Box::new(LoftyProbe),
            transfer: Box::new(FsTransfer),
            cancel: CancelToken::new(),
            progress: None,
            resolution: TypeResolution::Probe,
            stats: SyncStats::default(),
            processed: 0,
            total: 0,
        }
    }

    pub fn with_probe(mut self, probe: impl MetadataProbe + 'a) -> Self {
        self.probe = Box::new(probe);
        self
    }

    pub fn with_transfer(mut self, transfer: impl MediaTransfer + 'a) -> Self {
        self.transfer = Box::new(transfer);
        self
    }

    pub fn with_cancel_token(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_resolution(mut self, resolution: TypeResolution) -> Self {
        self.resolution = resolution;
        self
    }

    /// Called with `(files_processed, files_total)` after each file.
    pub fn on_progress(mut self, progress: impl FnMut(usize, usize) + 'a) -> Self {
        self.progress = Some(Box::new(progress));
        self
    }

    pub fn resolution(&self) -> TypeResolution {
        self.resolution
    }

    pub fn stats(&self) -> &SyncStats {
        &self.stats
    }

    fn begin(&mut self, total: usize) -> Result<(), SyncError> {
        self.stats = SyncStats {
            started_at: Some(Local::now()),
            tracks_before: self.db.track_count()?,
            ..Default::default()
        };
        self.processed = 0;
        self.total = total;
        Ok(())
    }

    fn finish(&mut self) -> Result<(), SyncError> {
        self.stats.tracks_after = self.db.track_count()?;
        self.stats.finish(Local::now());
        Ok(())
    }

    fn report_progress(&mut self) {
        self.processed += 1;
        if let Some(progress) = self.progress.as_mut() {
            progress(self.processed, self.total);
        }
    }

    /// Syncs every supported file under `source_dir`.
    pub fn sync_tree(&mut self, source_dir: &Path) -> Result<SyncReport, SyncError> {
        if !source_dir.exists() {
            return Err(SyncError::NotFound(source_dir.to_path_buf()));
        }
        if !source_dir.is_dir() {
            return Err(SyncError::NotADirectory(source_dir.to_path_buf()));
        }

        self.begin(count_audio_files_recursive(source_dir))?;
        info!(
            "Syncing {} files from {}",
            self.total,
            source_dir.display()
        );

        let mut status = SyncStatus::Completed;
        for entry in walk(source_dir) {
            if self.cancel.is_cancelled() {
                info!("Sync cancelled after {} files", self.processed);
                status = SyncStatus::Cancelled;
                break;
            }

            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    warn!("Skipping unreadable entry: {}", e);
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }
            let path = entry.path();
            if !is_supported_media_file(path) {
                debug!("Skipping unsupported file {}", path.display());
                continue;
            }

            match self.process_file(path) {
                Ok(_) => {}
                Err(SyncError::Store(e)) => return Err(e.into()),
                Err(e) => {
                    self.stats.files_failed += 1;
                    warn!("Failed to sync {}: {}", path.display(), e);
                }
            }
            self.report_progress();
        }

        self.finish()?;
        Ok(SyncReport {
            stats: self.stats.clone(),
            status,
        })
    }

    /// Syncs a single file. Unlike tree syncs, a failure here is returned.
    pub fn sync_file(&mut self, path: &Path) -> Result<(), SyncError> {
        if !path.exists() {
            return Err(SyncError::NotFound(path.to_path_buf()));
        }
        if !path.is_file() {
            return Err(SyncError::NotAFile(path.to_path_buf()));
        }
        if !is_supported_media_file(path) {
            return Err(SyncError::Unsupported(path.to_path_buf()));
        }

        self.begin(1)?;
        let result = self.process_file(path);
        if result.is_err() {
            self.stats.files_failed += 1;
        }
        self.report_progress();
        self.finish()?;
        result.map(|_| ())
    }

    /// Like [`sync_tree`](Self::sync_tree) with every file typed as
    /// `media_type`. The previous resolution is restored afterwards.
    pub fn sync_tree_filtered(
        &mut self,
        source_dir: &Path,
        media_type: MediaType,
    ) -> Result<SyncReport, SyncError> {
        let mut forced = ForcedResolution::new(self, media_type);
        let report = forced.sync_tree(source_dir);
        drop(forced);
        report
    }

    fn process_file(&mut self, path: &Path) -> Result<FileOutcome, SyncError> {
        let record = self.probe.probe(path, self.resolution);
        let (title, artist, album) = stored_identity(&record);

        if self.skip_duplicates {
            if let Some(existing) = self.db.find_duplicate(&title, &artist, &album, record.file_size)? {
                info!(
                    "Skipping duplicate: {} - {} (track {})",
                    artist, title, existing
                );
                self.stats.files_skipped += 1;
                return Ok(FileOutcome::Skipped);
            }
        }

        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let target = self.allocator.allocate(self.db.mount_point(), &file_name)?;

        let bytes = self
            .transfer
            .copy(path, &target.absolute)
            .map_err(|source| SyncError::CopyFailure {
                source_path: path.to_path_buf(),
                dest: target.absolute.clone(),
                source,
            })?;

        let track = match self
            .builder
            .build(&record, &target.device_relative, bytes, Local::now())
        {
            Ok(track) => track,
            Err(source) => {
                let _ = fs::remove_file(&target.absolute);
                return Err(SyncError::BuildFailure {
                    path: path.to_path_buf(),
                    source,
                });
            }
        };

        let media_type = track.media_type;
        if let Err(e) = self.db.add_track(track, record.artwork.as_ref()) {
            let _ = fs::remove_file(&target.absolute);
            return Err(e.into());
        }

        self.stats.files_added += 1;
        self.stats.bytes_transferred += bytes;
        info!(
            "Added {}: {} - {} -> {}",
            media_type, artist, title, target.device_relative
        );
        Ok(FileOutcome::Added)
    }
}

/// Forces a media type for as long as it lives.
struct ForcedResolution<'s, 'a> {
    session: &'s mut SyncSession<'a>,
    previous: TypeResolution,
}

impl<'s, 'a> ForcedResolution<'s, 'a> {
    fn new(session: &'s mut SyncSession<'a>, media_type: MediaType) -> Self {
        let previous = session.resolution;
        session.resolution = TypeResolution::Forced(media_type);
        debug!("Forcing media type {}", media_type);
        Self { session, previous }
    }
}

impl<'a> Deref for ForcedResolution<'_, 'a> {
    type Target = SyncSession<'a>;

    fn deref(&self) -> &Self::Target {
        self.session
    }
}

impl DerefMut for ForcedResolution<'_, '_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.session
    }
}

impl Drop for ForcedResolution<'_, '_> {
    fn drop(&mut self) {
        self.session.resolution = self.previous;
    }
}
