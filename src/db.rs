use crate::actions::{ActionQueue, DeferredAction, RemovalCriteria};
use crate::allocator;
use crate::error::StoreError;
use crate::itdb::{self, Library};
use crate::models::{Artwork, LibraryTrack, Playlist, PlaylistRole, Thumbnail};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info, warn};

pub const ITUNES_DIR: &str = "iPod_Control/iTunes";
pub const DB_FILE_NAME: &str = "iTunesDB";
pub const BACKUP_EXTENSION: &str = "rbbackup";
pub const WORKING_EXTENSION: &str = "rbwork";

/// Locations of the database and its sibling files on one device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorePaths {
    pub db: PathBuf,
    pub backup: PathBuf,
    pub working: PathBuf,
}

impl StorePaths {
    pub fn for_mount(mount_point: &Path) -> Self {
        let db = mount_point.join(ITUNES_DIR).join(DB_FILE_NAME);
        Self {
            backup: db.with_extension(BACKUP_EXTENSION),
            working: db.with_extension(WORKING_EXTENSION),
            db,
        }
    }
}

struct OpenState {
    library: Library,
    actions: ActionQueue,
    backup_created: bool,
}

/// The device's library while it is open for syncing.
///
/// All reads and writes go through one lock. After [`Database::close`] every
/// call fails with [`StoreError::UseAfterClose`].
pub struct Database {
    mount_point: PathBuf,
    paths: StorePaths,
    state: Mutex<Option<OpenState>>,
    saving: AtomicBool,
}

fn write_failure(path: &Path) -> impl FnOnce(io::Error) -> StoreError + '_ {
    move |source| StoreError::WriteFailure {
        path: path.to_path_buf(),
        source,
    }
}

/// Resets the saving flag however `save` exits.
struct SavingGuard<'a>(&'a AtomicBool);

impl Drop for SavingGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl Database {
    fn from_library(mount_point: &Path, library: Library) -> Self {
        Self {
            mount_point: mount_point.to_path_buf(),
            paths: StorePaths::for_mount(mount_point),
            state: Mutex::new(Some(OpenState {
                library,
                actions: ActionQueue::new(),
                backup_created: false,
            })),
            saving: AtomicBool::new(false),
        }
    }

    /// Lays out an empty device: bucket directories plus a database holding
    /// only the master playlist.
    pub fn create(mount_point: &Path, device_name: &str) -> Result<Self, StoreError> {
        if !mount_point.is_dir() {
            return Err(StoreError::NotFound(mount_point.to_path_buf()));
        }
        let paths = StorePaths::for_mount(mount_point);
        if paths.db.exists() {
            return Err(StoreError::AlreadyExists(paths.db));
        }

        let itunes_dir = mount_point.join(ITUNES_DIR);
        fs::create_dir_all(&itunes_dir).map_err(write_failure(&itunes_dir))?;
        allocator::ensure_layout(mount_point, allocator::DEFAULT_BUCKETS)
            .map_err(write_failure(&allocator::music_root(mount_point)))?;

        let library = Library::new(device_name);
        write_replacing(&library, &paths)?;
        info!("Created iPod database at {}", paths.db.display());

        Ok(Self::from_library(mount_point, library))
    }

    pub fn open(mount_point: &Path) -> Result<Self, StoreError> {
        if !mount_point.is_dir() {
            return Err(StoreError::NotFound(mount_point.to_path_buf()));
        }
        let paths = StorePaths::for_mount(mount_point);
        let library = itdb::parse(&paths.db)?;
        info!(
            "Opened iPod database at {} ({} tracks)",
            paths.db.display(),
            library.tracks.len()
        );
        Ok(Self::from_library(mount_point, library))
    }

    /// Copies the backup over the canonical file and opens the result. For
    /// devices whose database no longer parses.
    pub fn recover(mount_point: &Path) -> Result<Self, StoreError> {
        let paths = StorePaths::for_mount(mount_point);
        if !paths.backup.exists() {
            return Err(StoreError::NotFound(paths.backup));
        }
        fs::copy(&paths.backup, &paths.db).map_err(write_failure(&paths.db))?;
        info!("Restored database from {}", paths.backup.display());
        Self::open(mount_point)
    }

    pub fn mount_point(&self) -> &Path {
        &self.mount_point
    }

    pub fn paths(&self) -> &StorePaths {
        &self.paths
    }

    fn lock(&self) -> Result<MutexGuard<'_, Option<OpenState>>, StoreError> {
        self.state.lock().map_err(|_| StoreError::LockPoisoned)
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut OpenState) -> R) -> Result<R, StoreError> {
        let mut guard = self.lock()?;
        let state = guard.as_mut().ok_or(StoreError::UseAfterClose)?;
        Ok(f(state))
    }

    /// Writes the library back to the device.
    ///
    /// The first save of a session copies the current file to the backup. The
    /// new contents go to the working copy, which is then renamed over the
    /// canonical file.
    pub fn save(&self) -> Result<(), StoreError> {
        if self.saving.swap(true, Ordering::SeqCst) {
            return Err(StoreError::SaveInProgress);
        }
        let _saving = SavingGuard(&self.saving);

        let mut guard = self.lock()?;
        let state = guard.as_mut().ok_or(StoreError::UseAfterClose)?;

        if !state.backup_created && self.paths.db.exists() {
            fs::copy(&self.paths.db, &self.paths.backup)
                .map_err(write_failure(&self.paths.backup))?;
            state.backup_created = true;
            debug!("Created backup at {}", self.paths.backup.display());
        }

        write_replacing(&state.library, &self.paths)?;
        info!(
            "Saved iPod database ({} tracks)",
            state.library.tracks.len()
        );
        Ok(())
    }

    /// Replaces the in-memory library with the backup's contents.
    pub fn restore_backup(&self) -> Result<(), StoreError> {
        self.with_state(|state| {
            if !self.paths.backup.exists() {
                return Err(StoreError::NotFound(self.paths.backup.clone()));
            }
            fs::copy(&self.paths.backup, &self.paths.db).map_err(write_failure(&self.paths.db))?;
            state.library = itdb::parse(&self.paths.db)?;
            info!("Restored database from {}", self.paths.backup.display());
            Ok(())
        })?
    }

    /// Deletes the backup and any leftover working copy.
    pub fn cleanup_backup(&self) -> Result<(), StoreError> {
        self.with_state(|state| {
            for path in [&self.paths.backup, &self.paths.working] {
                match fs::remove_file(path) {
                    Ok(()) => debug!("Removed {}", path.display()),
                    Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                    Err(e) => return Err(write_failure(path)(e)),
                }
            }
            state.backup_created = false;
            Ok(())
        })?
    }

    pub fn backup_exists(&self) -> bool {
        self.paths.backup.exists()
    }

    /// Releases the library. Calling it twice is fine.
    pub fn close(&self) {
        let mut guard = match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if guard.take().is_some() {
            debug!("Closed iPod database at {}", self.paths.db.display());
        }
    }

    pub fn is_open(&self) -> bool {
        self.lock().map(|g| g.is_some()).unwrap_or(false)
    }

    // -- mutations ---------------------------------------------------------

    /// Indexes `track`, returning its new id. Artwork that cannot be attached
    /// is logged and dropped.
    pub fn add_track(
        &self,
        track: LibraryTrack,
        artwork: Option<&Artwork>,
    ) -> Result<u32, StoreError> {
        self.with_state(|state| {
            let title = track.title.clone();
            let id = state.library.add_track(track);
            if let Some(artwork) = artwork {
                if let Err(e) = state.library.attach_artwork(id, artwork) {
                    warn!("Failed to attach artwork to '{}': {}", title, e);
                }
            }
            debug!("Added track {} '{}'", id, title);
            id
        })
    }

    /// Removes a track. With `delete_file` the media file is deleted too;
    /// failing to delete it is only logged.
    pub fn remove_track(&self, id: u32, delete_file: bool) -> Result<LibraryTrack, StoreError> {
        let track = self.with_state(|state| state.library.remove_track(id))??;
        if delete_file {
            let path = self.device_file(&track.device_path);
            if let Err(e) = fs::remove_file(&path) {
                warn!("Failed to delete {}: {}", path.display(), e);
            }
        }
        Ok(track)
    }

    pub fn add_playlist(&self, name: &str, role: PlaylistRole) -> Result<u32, StoreError> {
        if role == PlaylistRole::Master {
            return Err(StoreError::MasterPlaylistProtected);
        }
        self.with_state(|state| state.library.add_playlist(name, role))
    }

    pub fn remove_playlist(&self, id: u32) -> Result<(), StoreError> {
        self.with_state(|state| state.library.remove_playlist(id))?
    }

    pub fn rename_playlist(&self, id: u32, name: &str) -> Result<(), StoreError> {
        self.with_state(|state| state.library.rename_playlist(id, name))?
    }

    pub fn set_device_name(&self, name: &str) -> Result<(), StoreError> {
        self.with_state(|state| state.library.set_device_name(name))
    }

    // -- reads -------------------------------------------------------------

    pub fn track_count(&self) -> Result<usize, StoreError> {
        self.with_state(|state| state.library.tracks.len())
    }

    pub fn tracks(&self) -> Result<Vec<LibraryTrack>, StoreError> {
        self.with_state(|state| state.library.tracks.clone())
    }

    pub fn playlists(&self) -> Result<Vec<Playlist>, StoreError> {
        self.with_state(|state| state.library.playlists.clone())
    }

    pub fn device_name(&self) -> Result<String, StoreError> {
        self.with_state(|state| state.library.device_name.clone())
    }

    pub fn thumbnail(&self, id: u32) -> Result<Option<Thumbnail>, StoreError> {
        self.with_state(|state| state.library.thumbnail(id).cloned())
    }

    pub fn find_duplicate(
        &self,
        title: &str,
        artist: &str,
        album: &str,
        size: u64,
    ) -> Result<Option<u32>, StoreError> {
        self.with_state(|state| state.library.find_duplicate(title, artist, album, size))
    }

    /// Cheap health check: open, lockable, one master playlist, unique ids.
    pub fn validate(&self) -> bool {
        self.with_state(|state| state.library.is_consistent())
            .unwrap_or(false)
    }

    /// Absolute path of a file referenced by a track.
    pub fn device_file(&self, device_path: &str) -> PathBuf {
        self.mount_point.join(device_path.trim_start_matches('/'))
    }

    // -- deferred actions --------------------------------------------------

    pub fn enqueue(&self, action: DeferredAction) -> Result<(), StoreError> {
        self.with_state(|state| state.actions.push(action))
    }

    pub fn has_pending_actions(&self) -> Result<bool, StoreError> {
        self.with_state(|state| !state.actions.is_empty())
    }

    /// Applies every queued action in order and empties the queue. Actions
    /// that fail are logged and skipped. Returns how many were applied.
    pub fn process_actions(&self) -> Result<usize, StoreError> {
        self.with_state(|state| {
            if state.actions.is_empty() {
                return 0;
            }
            let queued = state.actions.len();
            let applied = state.actions.drain_into(&mut state.library);
            info!("Processed {} of {} deferred actions", applied, queued);
            applied
        })
    }

    /// Dropping queued actions by criteria is not available yet.
    pub fn remove_pending(&self, criteria: &RemovalCriteria) -> Result<usize, StoreError> {
        self.with_state(|_| ())?;
        debug!("remove_pending({:?}) requested", criteria);
        Err(StoreError::Unsupported("removing pending actions"))
    }
}

impl Drop for Database {
    fn drop(&mut self) {
        self.close();
    }
}

/// Writes to the working copy and renames it over the canonical file. On
/// failure the working copy is removed and the canonical file is untouched.
fn write_replacing(library: &Library, paths: &StorePaths) -> Result<(), StoreError> {
    let result = itdb::write(library, &paths.working).and_then(|()| {
        fs::rename(&paths.working, &paths.db).map_err(write_failure(&paths.db))
    });
    if result.is_err() {
        let _ = fs::remove_file(&paths.working);
    }
    result
}
