use chrono::Local;
use podsync_lib::actions::DeferredAction;
use podsync_lib::db::{Database, StorePaths};
use podsync_lib::error::StoreError;
use podsync_lib::models::{
    Artwork, ArtworkFormat, LibraryTrack, MediaType, PlaylistRole, PodcastFields,
};
use std::fs;

const JPEG: &[u8] = &[0xFF, 0xD8, 0xFF, 0xE0, 0x00, 0x10, b'J', b'F', b'I', b'F', 0x00, 0x01];

fn episode(title: &str, description: &str) -> LibraryTrack {
    let now = Local::now();
    LibraryTrack {
        id: 0,
        title: title.to_string(),
        artist: "Host".to_string(),
        album: "Show".to_string(),
        genre: None,
        composer: None,
        album_artist: None,
        year: 2024,
        track_number: 1,
        disc_number: 1,
        length_ms: 1_800_000,
        bitrate_kbps: 96,
        size_bytes: 21_600_000,
        file_type: "mp3".to_string(),
        device_path: "/iPod_Control/Music/F01/AAAC.mp3".to_string(),
        media_type: MediaType::Podcast,
        podcast_flag: true,
        unplayed: true,
        remember_position: true,
        skip_when_shuffling: true,
        bookmark_ms: 0,
        rating: 0,
        play_count: 0,
        time_added: now,
        time_modified: now,
        time_played: None,
        artwork_id: None,
        podcast: Some(PodcastFields {
            url: Some("https://example.org/ep1.mp3".to_string()),
            rss_url: Some("https://example.org/feed.rss".to_string()),
            description: Some(description.to_string()),
            subtitle: Some("Pilot".to_string()),
            category: Some("Technology".to_string()),
            released: Some(now),
            show_name: Some("Show".to_string()),
            season: 1,
            episode: 1,
            episode_id: Some("s01e01".to_string()),
        }),
    }
}

#[test]
fn description_and_artwork_survive_reopen() {
    let mount = tempfile::tempdir().unwrap();
    let db = Database::create(mount.path(), "iPod").unwrap();
    let artwork = Artwork {
        data: JPEG.to_vec(),
        format: ArtworkFormat::Jpeg,
    };
    let id = db
        .add_track(episode("Pilot", "First episode, with ünïcode"), Some(&artwork))
        .unwrap();
    db.save().unwrap();
    db.close();

    let db = Database::open(mount.path()).unwrap();
    let tracks = db.tracks().unwrap();
    let track = tracks.iter().find(|t| t.id == id).unwrap();
    let podcast = track.podcast.as_ref().unwrap();
    assert_eq!(podcast.description.as_deref(), Some("First episode, with ünïcode"));
    assert_eq!(podcast.episode_id.as_deref(), Some("s01e01"));

    let thumb = db.thumbnail(track.artwork_id.unwrap()).unwrap().unwrap();
    assert_eq!(thumb.data, JPEG);
    assert_eq!(thumb.format, ArtworkFormat::Jpeg);

    let podcasts = db
        .playlists()
        .unwrap()
        .into_iter()
        .find(|p| p.role == PlaylistRole::Podcasts)
        .unwrap();
    assert_eq!(podcasts.track_ids, vec![id]);
}

#[test]
fn bad_artwork_does_not_block_the_track() {
    let mount = tempfile::tempdir().unwrap();
    let db = Database::create(mount.path(), "iPod").unwrap();
    let junk = Artwork {
        data: b"GIF89a".to_vec(),
        format: ArtworkFormat::Unknown,
    };
    let id = db.add_track(episode("Pilot", "x"), Some(&junk)).unwrap();
    let tracks = db.tracks().unwrap();
    assert_eq!(tracks.len(), 1);
    assert_eq!(tracks[0].id, id);
    assert_eq!(tracks[0].artwork_id, None);
}

#[test]
fn backup_is_taken_once_per_session() {
    let mount = tempfile::tempdir().unwrap();
    let paths = StorePaths::for_mount(mount.path());
    Database::create(mount.path(), "iPod").unwrap();
    let original = fs::read(&paths.db).unwrap();

    let db = Database::open(mount.path()).unwrap();
    assert!(!db.backup_exists());

    db.add_track(episode("One", "a"), None).unwrap();
    db.save().unwrap();
    assert_eq!(fs::read(&paths.backup).unwrap(), original);

    db.add_track(episode("Two", "b"), None).unwrap();
    db.save().unwrap();
    assert_eq!(fs::read(&paths.backup).unwrap(), original);
    assert!(!paths.working.exists());

    db.cleanup_backup().unwrap();
    assert!(!db.backup_exists());
}

#[test]
fn recover_replaces_an_unreadable_database() {
    let mount = tempfile::tempdir().unwrap();
    let paths = StorePaths::for_mount(mount.path());
    Database::create(mount.path(), "iPod").unwrap();

    let db = Database::open(mount.path()).unwrap();
    db.add_track(episode("One", "a"), None).unwrap();
    db.save().unwrap();
    db.close();

    fs::write(&paths.db, b"garbage").unwrap();
    assert!(matches!(
        Database::open(mount.path()),
        Err(StoreError::ParseFailure { .. })
    ));

    let recovered = Database::recover(mount.path()).unwrap();
    assert_eq!(recovered.track_count().unwrap(), 0);
    assert!(recovered.validate());
}

#[test]
fn closed_database_refuses_work() {
    let mount = tempfile::tempdir().unwrap();
    let db = Database::create(mount.path(), "iPod").unwrap();
    db.close();
    db.close();

    assert!(!db.is_open());
    assert!(matches!(db.track_count(), Err(StoreError::UseAfterClose)));
    assert!(matches!(db.save(), Err(StoreError::UseAfterClose)));
    assert!(matches!(
        db.add_track(episode("Late", "x"), None),
        Err(StoreError::UseAfterClose)
    ));
    assert!(!db.validate());
}

#[test]
fn deferred_actions_apply_in_order() {
    let mount = tempfile::tempdir().unwrap();
    let db = Database::create(mount.path(), "iPod").unwrap();
    assert_eq!(db.process_actions().unwrap(), 0);

    db.enqueue(DeferredAction::SetName("First".into())).unwrap();
    db.enqueue(DeferredAction::AddTrack(Box::new(episode("Queued", "q"))))
        .unwrap();
    db.enqueue(DeferredAction::SetName("Second".into())).unwrap();
    assert!(db.has_pending_actions().unwrap());

    assert_eq!(db.process_actions().unwrap(), 3);
    assert!(!db.has_pending_actions().unwrap());
    assert_eq!(db.device_name().unwrap(), "Second");
    assert_eq!(db.track_count().unwrap(), 1);
    assert_eq!(db.process_actions().unwrap(), 0);
}

#[test]
fn failed_save_leaves_the_database_untouched() {
    let mount = tempfile::tempdir().unwrap();
    let paths = StorePaths::for_mount(mount.path());
    let db = Database::create(mount.path(), "iPod").unwrap();
    db.add_track(episode("Kept", "a"), None).unwrap();
    db.save().unwrap();
    let before = fs::read(&paths.db).unwrap();

    db.add_track(episode("Lost", "b"), None).unwrap();
    fs::create_dir(&paths.working).unwrap();
    assert!(matches!(db.save(), Err(StoreError::WriteFailure { .. })));
    assert_eq!(fs::read(&paths.db).unwrap(), before);

    let reopened = Database::open(mount.path()).unwrap();
    let titles: Vec<String> = reopened.tracks().unwrap().into_iter().map(|t| t.title).collect();
    assert_eq!(titles, vec!["Kept".to_string()]);
    reopened.close();

    // Nothing is stuck: once the path is free the next save goes through.
    fs::remove_dir(&paths.working).unwrap();
    db.save().unwrap();
    assert_eq!(Database::open(mount.path()).unwrap().track_count().unwrap(), 2);
}

#[test]
fn stale_deferred_action_is_skipped() {
    let mount = tempfile::tempdir().unwrap();
    let db = Database::create(mount.path(), "iPod").unwrap();
    db.enqueue(DeferredAction::RemoveTrack(42)).unwrap();
    db.enqueue(DeferredAction::SetName("Renamed".into())).unwrap();

    assert_eq!(db.process_actions().unwrap(), 1);
    assert!(!db.has_pending_actions().unwrap());
    assert_eq!(db.device_name().unwrap(), "Renamed");
}
