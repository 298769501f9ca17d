use crate::allocator::music_root;
use crate::config::SyncConfig;
use crate::db::Database;
use crate::metadata::TypeResolution;
use crate::models::{LibraryTrack, MediaType, Playlist, PlaylistRole, SyncStats};
use crate::mount::{resolve_mount_point, FilesystemType, MountPoint};
use crate::sync::{
    count_audio_files_recursive, install_interrupt_handler, CancelToken, SyncSession, SyncStatus,
};
use crate::track_builder::policy_for;
use anyhow::{Context, Result};
use serde::Serialize;
use std::collections::HashSet;
use std::fmt::Write as _;
use std::fs;
use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use tracing::{error, info, warn};

pub const EXIT_OK: i32 = 0;
pub const EXIT_FAILURE: i32 = 1;
pub const EXIT_CANCELLED: i32 = 130;

const RECENT_TRACKS: usize = 10;
const MIB: f64 = 1024.0 * 1024.0;

/// Shared state for one CLI invocation.
pub struct AppState {
    pub config: SyncConfig,
    pub cancel: CancelToken,
}

impl AppState {
    pub fn new(config: SyncConfig) -> Self {
        Self {
            config,
            cancel: CancelToken::new(),
        }
    }
}

fn open_device(state: &AppState, mount_arg: &str) -> Result<(MountPoint, Database)> {
    let mount = resolve_mount_point(mount_arg)?;
    mount.ensure_layout(state.config.num_buckets)?;
    let db = Database::open(&mount.path).with_context(|| {
        format!(
            "Failed to open iPod database on {} (run `podsync init` first?)",
            mount.path.display()
        )
    })?;
    Ok((mount, db))
}

pub fn init(state: &AppState, mount_arg: &str, name: &str) -> Result<i32> {
    let mount = resolve_mount_point(mount_arg)?;
    let db = Database::create(&mount.path, name)
        .with_context(|| format!("Failed to initialize iPod at {}", mount.path.display()))?;
    mount.ensure_layout(state.config.num_buckets)?;

    println!("Initialized iPod database on {}", mount.path.display());
    println!("Device name:      {}", db.device_name()?);
    println!("Filesystem:       {}", mount.filesystem);
    Ok(EXIT_OK)
}

// ---------------------------------------------------------------------------
// Sync

/// What a sync command should walk.
#[derive(Debug, Clone)]
pub enum SyncRequest {
    Tree {
        dir: PathBuf,
        media_type: Option<MediaType>,
    },
    File {
        path: PathBuf,
        media_type: Option<MediaType>,
    },
    Filtered {
        dir: PathBuf,
        media_type: MediaType,
    },
}

impl SyncRequest {
    fn forced_type(&self) -> Option<MediaType> {
        match self {
            SyncRequest::Tree { media_type, .. } | SyncRequest::File { media_type, .. } => {
                *media_type
            }
            SyncRequest::Filtered { media_type, .. } => Some(*media_type),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Success,
    Failed,
    Cancelled,
}

impl Outcome {
    fn label(self) -> &'static str {
        match self {
            Outcome::Success => "SUCCESS",
            Outcome::Failed => "FAILED",
            Outcome::Cancelled => "CANCELLED",
        }
    }

    fn exit_code(self) -> i32 {
        match self {
            Outcome::Success => EXIT_OK,
            Outcome::Failed => EXIT_FAILURE,
            Outcome::Cancelled => EXIT_CANCELLED,
        }
    }
}

fn format_bytes(bytes: u64) -> String {
    if bytes >= 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / MIB)
    } else if bytes >= 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else {
        format!("{} bytes", bytes)
    }
}

fn render_summary(outcome: Outcome, media_type: Option<MediaType>, stats: &SyncStats) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "\n=== SYNC SUMMARY ===");
    let _ = writeln!(out, "Result: {}", outcome.label());
    if let Some(media_type) = media_type {
        let _ = writeln!(out, "Media type: {}", media_type);
    }
    let _ = writeln!(out, "Files added: {}", stats.files_added);
    let _ = writeln!(out, "Files skipped: {}", stats.files_skipped);
    let _ = writeln!(out, "Files failed: {}", stats.files_failed);
    let _ = writeln!(out, "Tracks before: {}", stats.tracks_before);
    let _ = writeln!(out, "Tracks after: {}", stats.tracks_after);
    let _ = writeln!(out, "Transferred: {}", format_bytes(stats.bytes_transferred));
    let _ = writeln!(out, "Duration: {} seconds", stats.elapsed_secs());
    let _ = writeln!(out, "Average speed: {:.2} MB/s", stats.average_speed / MIB);
    out
}

/// Runs one sync batch and saves once at the end. The summary is printed
/// whatever happens.
pub fn sync(state: &AppState, mount_arg: &str, request: SyncRequest) -> Result<i32> {
    let (_mount, db) = open_device(state, mount_arg)?;

    match &request {
        SyncRequest::Tree { dir, .. } | SyncRequest::Filtered { dir, .. } => {
            let total = count_audio_files_recursive(dir);
            match request.forced_type() {
                Some(t) => println!("Found {} audio files to sync with media type: {}", total, t),
                None => println!("Found {} audio files to sync", total),
            }
        }
        SyncRequest::File { path, .. } => println!("Syncing {}", path.display()),
    }

    if let Err(e) = install_interrupt_handler(&state.cancel) {
        warn!("Ctrl-C will not cancel cleanly: {}", e);
    }

    let resolution = match &request {
        SyncRequest::Tree {
            media_type: Some(t),
            ..
        }
        | SyncRequest::File {
            media_type: Some(t),
            ..
        } => TypeResolution::Forced(*t),
        _ => TypeResolution::Probe,
    };

    let mut session = SyncSession::new(&db, &state.config)
        .with_cancel_token(state.cancel.clone())
        .with_resolution(resolution)
        .on_progress(|done, total| {
            eprint!("\rProgress: {}/{} files", done, total);
            if done == total {
                eprintln!();
            }
        });

    let result = match &request {
        SyncRequest::Tree { dir, .. } => session.sync_tree(dir).map(|r| r.status),
        SyncRequest::File { path, .. } => session.sync_file(path).map(|()| SyncStatus::Completed),
        SyncRequest::Filtered { dir, media_type } => {
            session.sync_tree_filtered(dir, *media_type).map(|r| r.status)
        }
    };
    let stats = session.stats().clone();
    drop(session);

    let mut outcome = match result {
        Ok(SyncStatus::Completed) => Outcome::Success,
        Ok(SyncStatus::Cancelled) => Outcome::Cancelled,
        Err(e) => {
            error!("Sync failed: {}", e);
            eprintln!("Error: {}", e);
            Outcome::Failed
        }
    };

    // Partial progress of a cancelled or failed batch is still committed.
    if stats.files_added > 0 || outcome == Outcome::Success {
        if let Err(e) = db.save() {
            error!("Failed to save iPod database: {}", e);
            eprintln!("Error: Failed to save iPod database, changes did not take: {}", e);
            outcome = Outcome::Failed;
        }
    }

    print!("{}", render_summary(outcome, request.forced_type(), &stats));
    db.close();
    Ok(outcome.exit_code())
}

// ---------------------------------------------------------------------------
// Listing

#[derive(Serialize)]
struct Listing<'a> {
    device_name: String,
    playlists: &'a [Playlist],
    tracks: &'a [LibraryTrack],
}

fn role_label(role: PlaylistRole) -> &'static str {
    match role {
        PlaylistRole::Master => " (Master)",
        PlaylistRole::Podcasts => " (Podcasts)",
        PlaylistRole::Audiobooks => " (Audiobooks)",
        PlaylistRole::Videos => " (Videos)",
        PlaylistRole::Ordinary => "",
    }
}

/// Counts of audio, podcasts, audiobooks, videos and everything else.
fn count_by_class(tracks: &[LibraryTrack]) -> [usize; 5] {
    let mut counts = [0usize; 5];
    for track in tracks {
        let slot = match track.media_type {
            MediaType::Audio => 0,
            MediaType::Podcast => 1,
            MediaType::Audiobook => 2,
            t if t.is_video() => 3,
            _ => 4,
        };
        counts[slot] += 1;
    }
    counts
}

pub fn render_listing(tracks: &[LibraryTrack], playlists: &[Playlist]) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "=== IPOD TRACK LISTING ===");
    let _ = writeln!(out, "Total tracks: {}", tracks.len());
    let _ = writeln!(out, "Total playlists: {}\n", playlists.len());

    let _ = writeln!(out, "PLAYLISTS:");
    for playlist in playlists {
        let name = if playlist.name.is_empty() {
            "(Unnamed)"
        } else {
            playlist.name.as_str()
        };
        let _ = writeln!(
            out,
            "  {:<20}: {} tracks{}",
            name,
            playlist.track_ids.len(),
            role_label(playlist.role)
        );
    }

    let [audio, podcasts, audiobooks, videos, other] = count_by_class(tracks);
    let _ = writeln!(out, "\nTRACKS BY MEDIA TYPE:");
    let _ = writeln!(out, "  Audio/Music:     {}", audio);
    let _ = writeln!(out, "  Podcasts:        {}", podcasts);
    let _ = writeln!(out, "  Audiobooks:      {}", audiobooks);
    let _ = writeln!(out, "  Videos:          {}", videos);
    let _ = writeln!(out, "  Other:           {}", other);

    let _ = writeln!(out, "\nRECENT TRACKS (last {}):", RECENT_TRACKS);
    for track in tracks.iter().rev().take(RECENT_TRACKS) {
        let _ = writeln!(
            out,
            "  [{}] {} - {}",
            track.media_type, track.artist, track.title
        );
    }
    out
}

pub fn list(state: &AppState, mount_arg: &str, json: bool) -> Result<i32> {
    let (_mount, db) = open_device(state, mount_arg)?;
    let tracks = db.tracks()?;
    let playlists = db.playlists()?;

    if json {
        let listing = Listing {
            device_name: db.device_name()?,
            playlists: &playlists,
            tracks: &tracks,
        };
        println!(
            "{}",
            serde_json::to_string_pretty(&listing).context("Failed to serialize listing")?
        );
    } else {
        print!("{}", render_listing(&tracks, &playlists));
    }
    Ok(EXIT_OK)
}

// ---------------------------------------------------------------------------
// Info

/// Files in the bucket directories that no track points at.
pub fn orphan_files(mount_point: &Path, tracks: &[LibraryTrack]) -> Vec<PathBuf> {
    let referenced: HashSet<PathBuf> = tracks
        .iter()
        .map(|t| mount_point.join(t.device_path.trim_start_matches('/')))
        .collect();

    let Ok(buckets) = fs::read_dir(music_root(mount_point)) else {
        return Vec::new();
    };
    let mut orphans: Vec<PathBuf> = buckets
        .flatten()
        .filter(|b| b.path().is_dir())
        .filter_map(|b| fs::read_dir(b.path()).ok())
        .flat_map(|entries| entries.flatten())
        .map(|e| e.path())
        .filter(|p| p.is_file() && !referenced.contains(p))
        .collect();
    orphans.sort();
    orphans
}

pub struct DeviceInfo<'a> {
    pub mount_point: &'a Path,
    pub device_name: &'a str,
    pub tracks: &'a [LibraryTrack],
    pub playlist_count: usize,
    pub filesystem: FilesystemType,
    pub orphan_count: usize,
    pub backup_present: bool,
    pub sysinfo_size: Option<u64>,
}

pub fn render_info(info: &DeviceInfo<'_>) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "=== IPOD INFORMATION ===");
    let _ = writeln!(out, "Mount point:      {}", info.mount_point.display());
    let _ = writeln!(out, "Device name:      {}", info.device_name);
    let _ = writeln!(out, "Filesystem:       {}", info.filesystem);
    let _ = writeln!(out, "Total tracks:     {}", info.tracks.len());
    let _ = writeln!(out, "Total playlists:  {}", info.playlist_count);

    let total_ms: u64 = info.tracks.iter().map(|t| u64::from(t.length_ms)).sum();
    let total_size: u64 = info.tracks.iter().map(|t| t.size_bytes).sum();
    if total_ms > 0 {
        let hours = total_ms / (1000 * 3600);
        let minutes = (total_ms % (1000 * 3600)) / (1000 * 60);
        let _ = writeln!(out, "Total duration:   {}h {}m", hours, minutes);
    }
    if total_size > 0 {
        let _ = writeln!(out, "Total size:       {:.1} MB", total_size as f64 / MIB);
    }

    let mut mp3 = 0;
    let mut m4a = 0;
    let mut other = 0;
    for track in info.tracks {
        match track.file_type.to_ascii_lowercase().as_str() {
            "mp3" => mp3 += 1,
            "m4a" => m4a += 1,
            _ => other += 1,
        }
    }
    let _ = writeln!(out, "\nFile formats:");
    let _ = writeln!(out, "  MP3:            {}", mp3);
    let _ = writeln!(out, "  M4A/AAC:        {}", m4a);
    let _ = writeln!(out, "  Other:          {}", other);

    let _ = writeln!(out);
    let _ = writeln!(out, "Orphaned files:   {}", info.orphan_count);
    let _ = writeln!(
        out,
        "Database backup:  {}",
        if info.backup_present { "Present" } else { "None" }
    );
    match info.sysinfo_size {
        Some(0) => {
            let _ = writeln!(out, "SysInfo file:     Found (empty)");
        }
        Some(size) => {
            let _ = writeln!(out, "SysInfo file:     Found ({} bytes)", size);
        }
        None => {
            let _ = writeln!(out, "SysInfo file:     Not found");
        }
    }
    out
}

pub fn info(state: &AppState, mount_arg: &str) -> Result<i32> {
    let (mount, db) = open_device(state, mount_arg)?;
    let tracks = db.tracks()?;
    let device_name = db.device_name()?;
    let sysinfo_size = fs::metadata(mount.path.join("iPod_Control/Device/SysInfo"))
        .ok()
        .map(|m| m.len());

    let info = DeviceInfo {
        mount_point: &mount.path,
        device_name: &device_name,
        tracks: &tracks,
        playlist_count: db.playlists()?.len(),
        filesystem: mount.filesystem,
        orphan_count: orphan_files(&mount.path, &tracks).len(),
        backup_present: db.backup_exists(),
        sysinfo_size,
    };
    print!("{}", render_info(&info));
    Ok(EXIT_OK)
}

// ---------------------------------------------------------------------------
// Reset

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetTarget {
    All,
    Type(MediaType),
}

impl std::str::FromStr for ResetTarget {
    type Err = crate::models::ParseMediaTypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.eq_ignore_ascii_case("all") {
            Ok(ResetTarget::All)
        } else {
            s.parse().map(ResetTarget::Type)
        }
    }
}

fn confirm(prompt: &str) -> bool {
    print!("{} (y/N): ", prompt);
    let _ = io::stdout().flush();
    let mut answer = String::new();
    if io::stdin().lock().read_line(&mut answer).is_err() {
        return false;
    }
    matches!(answer.trim(), "y" | "Y" | "yes" | "YES")
}

/// Removes every track of one media type along with its files.
pub fn reset_type(db: &Database, media_type: MediaType) -> Result<usize> {
    let ids: Vec<u32> = db
        .tracks()?
        .into_iter()
        .filter(|t| t.media_type == media_type)
        .map(|t| t.id)
        .collect();

    for id in &ids {
        db.remove_track(*id, true)?;
    }

    if let Some(role) = policy_for(media_type).playlist {
        let empty_role_playlist = db
            .playlists()?
            .into_iter()
            .find(|p| p.role == role && p.track_ids.is_empty());
        if let Some(playlist) = empty_role_playlist {
            db.remove_playlist(playlist.id)?;
            info!("Removed empty {} playlist", playlist.name);
        }
    }
    Ok(ids.len())
}

/// Empties the device: every track, every non-master playlist and every
/// file in the bucket directories.
pub fn reset_all(db: &Database) -> Result<(usize, usize, usize)> {
    let tracks = db.tracks()?;
    for track in &tracks {
        db.remove_track(track.id, true)?;
    }

    let playlists: Vec<Playlist> = db
        .playlists()?
        .into_iter()
        .filter(|p| !p.is_master())
        .collect();
    for playlist in &playlists {
        db.remove_playlist(playlist.id)?;
    }

    let mut deleted = 0;
    for leftover in orphan_files(db.mount_point(), &[]) {
        match fs::remove_file(&leftover) {
            Ok(()) => deleted += 1,
            Err(e) => warn!("Failed to delete {}: {}", leftover.display(), e),
        }
    }
    Ok((tracks.len(), playlists.len(), deleted))
}

pub fn reset(state: &AppState, mount_arg: &str, target: ResetTarget, yes: bool) -> Result<i32> {
    let (_mount, db) = open_device(state, mount_arg)?;

    let warning = match target {
        ResetTarget::All => "WARNING: This will remove ALL tracks and playlists from the iPod".to_string(),
        ResetTarget::Type(t) => format!(
            "WARNING: This will remove ALL tracks of type '{}' from the iPod",
            t
        ),
    };
    println!("{}", warning);
    if !yes && !confirm("Are you sure?") {
        println!("Reset aborted.");
        return Ok(EXIT_OK);
    }

    match target {
        ResetTarget::Type(media_type) => {
            let removed = reset_type(&db, media_type)?;
            db.save().context("Failed to save iPod database")?;
            println!("Tracks removed:  {}", removed);
        }
        ResetTarget::All => {
            let (tracks, playlists, files) = reset_all(&db)?;
            db.save().context("Failed to save iPod database")?;
            println!("Tracks removed:    {}", tracks);
            println!("Playlists removed: {}", playlists);
            println!("Files deleted:     {}", files);
        }
    }
    Ok(EXIT_OK)
}

// ---------------------------------------------------------------------------
// Backups

pub fn restore_backup(mount_arg: &str) -> Result<i32> {
    let mount = resolve_mount_point(mount_arg)?;
    let db = Database::recover(&mount.path).context("Failed to restore iPod database from backup")?;
    println!(
        "Restored iPod database from backup ({} tracks)",
        db.track_count()?
    );
    Ok(EXIT_OK)
}

pub fn clean_backup(state: &AppState, mount_arg: &str) -> Result<i32> {
    let (_mount, db) = open_device(state, mount_arg)?;
    let had_backup = db.backup_exists();
    db.cleanup_backup().context("Failed to remove backup files")?;
    if had_backup {
        println!("Removed database backup");
    } else {
        println!("No database backup to remove");
    }
    Ok(EXIT_OK)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocator;
    use chrono::Local;

    fn track(title: &str, media_type: MediaType, file_type: &str) -> LibraryTrack {
        let now = Local::now();
        LibraryTrack {
            id: 0,
            title: title.to_string(),
            artist: "Artist".to_string(),
            album: "Album".to_string(),
            genre: None,
            composer: None,
            album_artist: None,
            year: 2020,
            track_number: 1,
            disc_number: 1,
            length_ms: 90 * 60 * 1000,
            bitrate_kbps: 128,
            size_bytes: 3 * 1024 * 1024,
            file_type: file_type.to_string(),
            device_path: format!("/iPod_Control/Music/F00/{}.{}", title, file_type),
            media_type,
            podcast_flag: false,
            unplayed: false,
            remember_position: false,
            skip_when_shuffling: false,
            bookmark_ms: 0,
            rating: 0,
            play_count: 0,
            time_added: now,
            time_modified: now,
            time_played: None,
            artwork_id: None,
            podcast: None,
        }
    }

    #[test]
    fn reset_target_parses_all_or_type() {
        assert_eq!("ALL".parse::<ResetTarget>(), Ok(ResetTarget::All));
        assert_eq!(
            "podcast".parse::<ResetTarget>(),
            Ok(ResetTarget::Type(MediaType::Podcast))
        );
        assert!("everything".parse::<ResetTarget>().is_err());
    }

    #[test]
    fn listing_groups_by_class() {
        let tracks = vec![
            track("AAAB", MediaType::Audio, "mp3"),
            track("AAAC", MediaType::Podcast, "mp3"),
            track("AAAD", MediaType::TvShow, "mp4"),
            track("AAAE", MediaType::Memo, "m4a"),
        ];
        let playlists = vec![Playlist {
            id: 1,
            name: "iPod".into(),
            role: PlaylistRole::Master,
            track_ids: vec![1, 2, 3, 4],
        }];
        let out = render_listing(&tracks, &playlists);
        assert!(out.contains("iPod                : 4 tracks (Master)"));
        assert!(out.contains("Audio/Music:     1"));
        assert!(out.contains("Videos:          1"));
        assert!(out.contains("Other:           1"));
        assert!(out.contains("[TV Show] Artist - AAAD"));
    }

    #[test]
    fn info_reports_totals_and_orphans() {
        let tracks = vec![
            track("AAAB", MediaType::Audio, "mp3"),
            track("AAAC", MediaType::Audio, "m4a"),
        ];
        let info = DeviceInfo {
            mount_point: Path::new("/media/ipod"),
            device_name: "iPod",
            tracks: &tracks,
            playlist_count: 1,
            filesystem: FilesystemType::Fat32,
            orphan_count: 2,
            backup_present: true,
            sysinfo_size: None,
        };
        let out = render_info(&info);
        assert!(out.contains("Total duration:   3h 0m"));
        assert!(out.contains("Total size:       6.0 MB"));
        assert!(out.contains("MP3:            1"));
        assert!(out.contains("M4A/AAC:        1"));
        assert!(out.contains("Orphaned files:   2"));
        assert!(out.contains("Database backup:  Present"));
        assert!(out.contains("Filesystem:       FAT32"));
    }

    #[test]
    fn orphans_are_unreferenced_bucket_files() {
        let mount = tempfile::tempdir().unwrap();
        allocator::ensure_layout(mount.path(), 4).unwrap();
        let bucket = music_root(mount.path()).join("F00");
        fs::write(bucket.join("AAAB.mp3"), b"x").unwrap();
        fs::write(bucket.join("ZZZZ.mp3"), b"x").unwrap();

        let tracks = vec![track("AAAB", MediaType::Audio, "mp3")];
        let orphans = orphan_files(mount.path(), &tracks);
        assert_eq!(orphans, vec![bucket.join("ZZZZ.mp3")]);
    }

    #[test]
    fn summary_shows_forced_type() {
        let stats = SyncStats {
            files_added: 3,
            tracks_after: 3,
            ..Default::default()
        };
        let out = render_summary(Outcome::Success, Some(MediaType::Podcast), &stats);
        assert!(out.contains("Result: SUCCESS"));
        assert!(out.contains("Media type: Podcast"));
        assert!(out.contains("Files added: 3"));
        assert_eq!(Outcome::Cancelled.exit_code(), 130);
    }
}
