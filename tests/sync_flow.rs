use podsync_lib::config::SyncConfig;
use podsync_lib::db::Database;
use podsync_lib::metadata::{MetadataProbe, TypeResolution};
use podsync_lib::models::{MediaRecord, MediaType, PlaylistRole};
use podsync_lib::sync::{CancelToken, FsTransfer, MediaTransfer, SyncSession, SyncStatus};
use std::cell::Cell;
use std::fs;
use std::io;
use std::path::Path;
use tempfile::TempDir;

/// Takes everything from the file name, honouring a forced type.
struct NameProbe;

impl MetadataProbe for NameProbe {
    fn probe(&self, path: &Path, resolution: TypeResolution) -> MediaRecord {
        let title = path.file_stem().unwrap().to_string_lossy().into_owned();
        MediaRecord {
            title: Some(title),
            artist: Some("Test Artist".to_string()),
            album: Some("Test Album".to_string()),
            duration_secs: 180,
            bitrate_kbps: 192,
            file_size: fs::metadata(path).map(|m| m.len()).unwrap_or(0),
            media_type: match resolution {
                TypeResolution::Forced(t) => t,
                TypeResolution::Probe => MediaType::Audio,
            },
            ..Default::default()
        }
    }
}

/// Copies normally except for the n-th call, which fails.
struct FailingNth {
    fail_at: usize,
    calls: Cell<usize>,
}

impl MediaTransfer for FailingNth {
    fn copy(&self, source: &Path, dest: &Path) -> io::Result<u64> {
        let call = self.calls.get() + 1;
        self.calls.set(call);
        if call == self.fail_at {
            return Err(io::Error::other("device disconnected"));
        }
        FsTransfer.copy(source, dest)
    }
}

struct Fixture {
    mount: TempDir,
    source: TempDir,
}

impl Fixture {
    fn new() -> Self {
        let fixture = Self {
            mount: tempfile::tempdir().unwrap(),
            source: tempfile::tempdir().unwrap(),
        };
        Database::create(fixture.mount.path(), "Test iPod").unwrap();
        fixture
    }

    fn add_source(&self, name: &str, contents: &[u8]) {
        let path = self.source.path().join(name);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, contents).unwrap();
    }

    fn add_songs(&self, count: usize) {
        for i in 0..count {
            self.add_source(&format!("song{:02}.mp3", i), format!("audio {}", i).as_bytes());
        }
    }

    fn open(&self) -> Database {
        Database::open(self.mount.path()).unwrap()
    }
}

fn config() -> SyncConfig {
    SyncConfig {
        log_to_file: false,
        ..Default::default()
    }
}

#[test]
fn syncs_supported_files_and_saves() {
    let fx = Fixture::new();
    fx.add_source("a.mp3", b"first fake mp3 payload");
    fx.add_source("nested/b.mp3", b"second fake mp3 payload");
    fx.add_source("nested/deeper/c.mp3", b"third fake mp3 payload");
    fx.add_source("notes.txt", b"not audio");

    let db = fx.open();
    let config = config();
    let report = SyncSession::new(&db, &config)
        .sync_tree(fx.source.path())
        .unwrap();

    assert_eq!(report.status, SyncStatus::Completed);
    assert_eq!(report.stats.files_added, 3);
    assert_eq!(report.stats.files_failed, 0);
    assert_eq!(report.stats.tracks_before, 0);
    assert_eq!(report.stats.tracks_after, 3);
    db.save().unwrap();
    db.close();

    let reopened = fx.open();
    let tracks = reopened.tracks().unwrap();
    assert_eq!(tracks.len(), 3);
    for track in &tracks {
        assert!(track.device_path.starts_with("/iPod_Control/Music/F"));
        assert!(reopened.device_file(&track.device_path).is_file());
    }
}

#[test]
fn one_failed_copy_does_not_stop_the_batch() {
    let fx = Fixture::new();
    fx.add_songs(10);

    let db = fx.open();
    let config = config();
    let mut session = SyncSession::new(&db, &config)
        .with_probe(NameProbe)
        .with_transfer(FailingNth {
            fail_at: 5,
            calls: Cell::new(0),
        });
    let report = session.sync_tree(fx.source.path()).unwrap();

    assert_eq!(report.stats.files_added, 9);
    assert_eq!(report.stats.files_failed, 1);
    assert_eq!(db.track_count().unwrap(), 9);
}

#[test]
fn cancelling_stops_between_files() {
    let fx = Fixture::new();
    fx.add_songs(10);

    let db = fx.open();
    let config = config();
    let cancel = CancelToken::new();
    let trigger = cancel.clone();
    let processed = Cell::new(0);

    let mut session = SyncSession::new(&db, &config)
        .with_probe(NameProbe)
        .with_cancel_token(cancel)
        .on_progress(|done, _total| {
            processed.set(done);
            if done == 3 {
                trigger.cancel();
            }
        });
    let report = session.sync_tree(fx.source.path()).unwrap();
    drop(session);

    assert_eq!(report.status, SyncStatus::Cancelled);
    assert!(processed.get() <= 3);
    assert!(report.stats.files_added <= 3);
    assert_eq!(db.track_count().unwrap(), report.stats.files_added as usize);
}

#[test]
fn filtered_sync_forces_type_then_restores() {
    let fx = Fixture::new();
    fx.add_songs(4);

    let db = fx.open();
    let config = config();
    let mut session = SyncSession::new(&db, &config).with_probe(NameProbe);
    let report = session
        .sync_tree_filtered(fx.source.path(), MediaType::Podcast)
        .unwrap();
    assert_eq!(session.resolution(), TypeResolution::Probe);
    drop(session);

    assert_eq!(report.stats.files_added, 4);
    let tracks = db.tracks().unwrap();
    assert!(tracks.iter().all(|t| t.media_type == MediaType::Podcast));
    assert!(tracks.iter().all(|t| t.remember_position && t.skip_when_shuffling));

    let playlists = db.playlists().unwrap();
    let podcasts = playlists
        .iter()
        .find(|p| p.role == PlaylistRole::Podcasts)
        .unwrap();
    assert_eq!(podcasts.track_ids.len(), 4);
}

#[test]
fn master_playlist_holds_every_track() {
    let fx = Fixture::new();
    fx.add_songs(5);

    let db = fx.open();
    let config = config();
    SyncSession::new(&db, &config)
        .with_probe(NameProbe)
        .sync_tree(fx.source.path())
        .unwrap();

    let playlists = db.playlists().unwrap();
    let masters: Vec<_> = playlists.iter().filter(|p| p.is_master()).collect();
    assert_eq!(masters.len(), 1);
    for track in db.tracks().unwrap() {
        assert!(masters[0].contains(track.id));
    }
    assert!(db.validate());
}

#[test]
fn second_run_skips_duplicates() {
    let fx = Fixture::new();
    fx.add_songs(3);
    let config = config();

    let db = fx.open();
    SyncSession::new(&db, &config)
        .with_probe(NameProbe)
        .sync_tree(fx.source.path())
        .unwrap();
    db.save().unwrap();
    db.close();

    let db = fx.open();
    let report = SyncSession::new(&db, &config)
        .with_probe(NameProbe)
        .sync_tree(fx.source.path())
        .unwrap();
    assert_eq!(report.stats.files_added, 0);
    assert_eq!(report.stats.files_skipped, 3);
    assert_eq!(report.stats.tracks_after, 3);
}

#[test]
fn allocations_never_reuse_codes_on_device() {
    let fx = Fixture::new();
    fx.add_songs(6);
    let config = config();

    let db = fx.open();
    SyncSession::new(&db, &config)
        .with_probe(NameProbe)
        .sync_tree(fx.source.path())
        .unwrap();
    db.save().unwrap();
    db.close();

    // Different names so nothing is a duplicate.
    let more = tempfile::tempdir().unwrap();
    for i in 0..6 {
        fs::write(more.path().join(format!("other{}.mp3", i)), b"more").unwrap();
    }
    let db = fx.open();
    SyncSession::new(&db, &config)
        .with_probe(NameProbe)
        .sync_tree(more.path())
        .unwrap();

    let mut paths: Vec<String> = db.tracks().unwrap().into_iter().map(|t| t.device_path).collect();
    let total = paths.len();
    paths.sort();
    paths.dedup();
    assert_eq!(total, 12);
    assert_eq!(paths.len(), 12);
}

#[test]
fn single_file_errors_are_returned() {
    let fx = Fixture::new();
    fx.add_source("readme.txt", b"text");

    let db = fx.open();
    let config = config();
    let mut session = SyncSession::new(&db, &config).with_probe(NameProbe);
    assert!(session.sync_file(&fx.source.path().join("readme.txt")).is_err());
    assert!(session.sync_file(&fx.source.path().join("missing.mp3")).is_err());

    fx.add_source("one.mp3", b"one");
    session.sync_file(&fx.source.path().join("one.mp3")).unwrap();
    assert_eq!(session.stats().files_added, 1);
}
