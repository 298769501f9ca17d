use crate::models::{Artwork, ArtworkFormat, MediaRecord, MediaType, PodcastInfo};
use chrono::{DateTime, Local};
use lofty::error::LoftyError;
use lofty::picture::MimeType;
use lofty::prelude::*;
use lofty::read_from_path;
use lofty::tag::{ItemKey, Tag};
use std::borrow::Cow;
use std::fs;
use std::path::Path;
use tracing::{debug, warn};
use url::Url;

/// Files smaller than this get no duration estimate.
const MIN_ESTIMATE_SIZE: u64 = 1024;
const ESTIMATE_BITRATE_KBPS: u64 = 128;
const PODCAST_RSS_PLACEHOLDER: &str = "http://localhost/podcast.rss";

/// How a file's media type is decided.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TypeResolution {
    /// Classify from tags and file name.
    #[default]
    Probe,
    /// Every file gets this type.
    Forced(MediaType),
}

/// Source of metadata for files about to be synced. Never fails: a file with
/// unreadable tags still gets a record built from its name.
pub trait MetadataProbe {
    fn probe(&self, path: &Path, resolution: TypeResolution) -> MediaRecord;
}

/// Reads tags and audio properties with lofty.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoftyProbe;

impl MetadataProbe for LoftyProbe {
    fn probe(&self, path: &Path, resolution: TypeResolution) -> MediaRecord {
        probe_file(path, resolution, Local::now())
    }
}

/// Fields recoverable from an `Artist - Album - 03 - Title.mp3` style name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FilenameFields {
    pub artist: Option<String>,
    pub album: Option<String>,
    pub title: Option<String>,
    pub track_number: u32,
}

/// Leading decimal digits of `s`, like C's `atoi`.
fn leading_number(s: &str) -> u32 {
    let digits: String = s.chars().take_while(|c| c.is_ascii_digit()).collect();
    digits.parse().unwrap_or(0)
}

fn non_empty(s: &str) -> Option<String> {
    let s = s.trim();
    (!s.is_empty()).then(|| s.to_string())
}

/// Splits a file stem on `" - "`.
pub fn parse_filename(stem: &str) -> FilenameFields {
    let parts: Vec<&str> = stem.split(" - ").map(str::trim).collect();

    match parts.as_slice() {
        [artist, album, track, title, ..] => FilenameFields {
            artist: non_empty(artist),
            album: non_empty(album),
            title: non_empty(title),
            track_number: leading_number(track),
        },
        [first, artist, title] if first.starts_with(|c: char| c.is_ascii_digit()) => {
            FilenameFields {
                artist: non_empty(artist),
                album: None,
                title: non_empty(title),
                track_number: leading_number(first),
            }
        }
        [artist, album, title] => FilenameFields {
            artist: non_empty(artist),
            album: non_empty(album),
            title: non_empty(title),
            track_number: 0,
        },
        [artist, title] => FilenameFields {
            artist: non_empty(artist),
            album: None,
            title: non_empty(title),
            track_number: 0,
        },
        _ => FilenameFields {
            title: non_empty(stem),
            ..Default::default()
        },
    }
}

/// Duration guess for untagged files, assuming 128 kbps.
pub fn estimate_duration_secs(file_size: u64) -> u32 {
    if file_size <= MIN_ESTIMATE_SIZE {
        return 0;
    }
    u32::try_from(file_size * 8 / (ESTIMATE_BITRATE_KBPS * 1000)).unwrap_or(u32::MAX)
}

/// Media type implied by the file itself.
pub fn detect_media_type(path: &Path, record: &MediaRecord) -> MediaType {
    let is_m4b = path
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("m4b"));

    if record
        .genre
        .as_deref()
        .is_some_and(|g| g.trim().eq_ignore_ascii_case("podcast"))
    {
        MediaType::Podcast
    } else if is_m4b {
        MediaType::Audiobook
    } else {
        MediaType::Audio
    }
}

/// Placeholder podcast data for files that are podcasts only because the
/// caller said so.
pub fn synthesize_podcast(path: &Path, title: &str, now: DateTime<Local>) -> PodcastInfo {
    PodcastInfo {
        url: Some(file_url(path)),
        rss_url: Some(PODCAST_RSS_PLACEHOLDER.to_string()),
        description: Some(format!("Podcast episode: {}", title)),
        subtitle: Some(title.to_string()),
        category: Some("Podcasts".to_string()),
        released: Some(now),
        unplayed: Some(true),
        ..Default::default()
    }
}

fn file_url(path: &Path) -> String {
    let absolute = std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf());
    Url::from_file_path(&absolute)
        .map(String::from)
        .unwrap_or_else(|()| format!("file://{}", absolute.display()))
}

fn text(value: Option<Cow<'_, str>>) -> Option<String> {
    value.and_then(|s| non_empty(&s))
}

fn artwork_from_tag(tag: &Tag) -> Option<Artwork> {
    let picture = tag.pictures().first()?;
    if picture.data().is_empty() {
        return None;
    }
    let format = match picture.mime_type() {
        Some(MimeType::Jpeg) => ArtworkFormat::Jpeg,
        Some(MimeType::Png) => ArtworkFormat::Png,
        _ => ArtworkFormat::Unknown,
    };
    Some(Artwork {
        data: picture.data().to_vec(),
        format,
    })
}

/// Overlays whatever lofty can read onto `record`. Tag values win over
/// file-name values.
fn apply_tags(path: &Path, record: &mut MediaRecord) -> Result<(), LoftyError> {
    let tagged_file = read_from_path(path)?;

    let properties = tagged_file.properties();
    let secs = properties.duration().as_secs();
    if secs > 0 {
        record.duration_secs = u32::try_from(secs).unwrap_or(u32::MAX);
    }
    if let Some(kbps) = properties.audio_bitrate() {
        record.bitrate_kbps = kbps;
    }

    let Some(tag) = tagged_file
        .primary_tag()
        .or_else(|| tagged_file.first_tag())
    else {
        debug!("No tags in {}", path.display());
        return Ok(());
    };

    if let Some(title) = text(tag.title()) {
        record.title = Some(title);
    }
    if let Some(artist) = text(tag.artist()) {
        record.artist = Some(artist);
    }
    if let Some(album) = text(tag.album()) {
        record.album = Some(album);
    }
    if let Some(genre) = text(tag.genre()) {
        record.genre = Some(genre);
    }
    if let Some(composer) = tag.get_string(&ItemKey::Composer).and_then(non_empty) {
        record.composer = Some(composer);
    }
    if let Some(album_artist) = tag.get_string(&ItemKey::AlbumArtist).and_then(non_empty) {
        record.album_artist = Some(album_artist);
    }
    if let Some(year) = tag.year() {
        record.year = year;
    }
    if let Some(track) = tag.track() {
        record.track_number = track;
    }
    if let Some(disc) = tag.disk() {
        record.disc_number = disc;
    }
    record.artwork = artwork_from_tag(tag);

    Ok(())
}

/// Builds a record for `path`. Reading tags is best effort.
pub fn probe_file(path: &Path, resolution: TypeResolution, now: DateTime<Local>) -> MediaRecord {
    let mut record = MediaRecord {
        time_added: Some(now),
        ..Default::default()
    };

    match fs::metadata(path) {
        Ok(meta) => record.file_size = meta.len(),
        Err(e) => warn!("Cannot stat {}: {}", path.display(), e),
    }

    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let from_name = parse_filename(&stem);
    record.title = from_name.title;
    record.artist = from_name.artist;
    record.album = from_name.album;
    record.track_number = from_name.track_number;

    if let Err(e) = apply_tags(path, &mut record) {
        warn!("Could not read tags from {}: {}", path.display(), e);
    }

    if record.duration_secs == 0 {
        record.duration_secs = estimate_duration_secs(record.file_size);
        if record.duration_secs > 0 {
            debug!(
                "Estimated duration for {}: {}s",
                path.display(),
                record.duration_secs
            );
        }
    }

    record.media_type = match resolution {
        TypeResolution::Forced(media_type) => media_type,
        TypeResolution::Probe => detect_media_type(path, &record),
    };

    if record.media_type == MediaType::Podcast && record.podcast.is_none() {
        let title = record.title.clone().unwrap_or_else(|| "Unknown Title".to_string());
        record.podcast = Some(synthesize_podcast(path, &title, now));
        debug!("Set podcast-specific metadata for: {}", title);
    }

    record
}
