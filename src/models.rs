use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

pub const VALID_MEDIA_TYPES: &str =
    "audio, movie, podcast, audiobook, musicvideo, tvshow, ringtone, rental, itunes-extra, memo, itunes-u";

/// Media kinds understood by the device, with their on-device codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MediaType {
    Audio,
    Movie,
    Podcast,
    Audiobook,
    MusicVideo,
    TvShow,
    Ringtone,
    Rental,
    ItunesExtra,
    Memo,
    ItunesU,
}

impl MediaType {
    pub const ALL: [MediaType; 11] = [
        MediaType::Audio,
        MediaType::Movie,
        MediaType::Podcast,
        MediaType::Audiobook,
        MediaType::MusicVideo,
        MediaType::TvShow,
        MediaType::Ringtone,
        MediaType::Rental,
        MediaType::ItunesExtra,
        MediaType::Memo,
        MediaType::ItunesU,
    ];

    pub fn code(self) -> u32 {
        match self {
            MediaType::Audio => 0x0000_0001,
            MediaType::Movie => 0x0000_0002,
            MediaType::Podcast => 0x0000_0004,
            MediaType::Audiobook => 0x0000_0008,
            MediaType::MusicVideo => 0x0000_0020,
            MediaType::TvShow => 0x0000_0040,
            MediaType::Ringtone => 0x0000_4000,
            MediaType::Rental => 0x0000_8000,
            MediaType::ItunesExtra => 0x0001_0000,
            MediaType::Memo => 0x0010_0000,
            MediaType::ItunesU => 0x0020_0000,
        }
    }

    pub fn from_code(code: u32) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.code() == code)
    }

    /// Human readable name used in listings and summaries.
    pub fn display_name(self) -> &'static str {
        match self {
            MediaType::Audio => "Audio",
            MediaType::Movie => "Movie",
            MediaType::Podcast => "Podcast",
            MediaType::Audiobook => "Audiobook",
            MediaType::MusicVideo => "Music Video",
            MediaType::TvShow => "TV Show",
            MediaType::Ringtone => "Ringtone",
            MediaType::Rental => "Rental",
            MediaType::ItunesExtra => "iTunes Extra",
            MediaType::Memo => "Memo",
            MediaType::ItunesU => "iTunes U",
        }
    }

    pub fn is_video(self) -> bool {
        matches!(
            self,
            MediaType::Movie | MediaType::MusicVideo | MediaType::TvShow
        )
    }
}

impl fmt::Display for MediaType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.display_name())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid media type '{0}' (valid types: {VALID_MEDIA_TYPES})")]
pub struct ParseMediaTypeError(pub String);

impl FromStr for MediaType {
    type Err = ParseMediaTypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let media_type = match s.to_ascii_lowercase().as_str() {
            "audio" => MediaType::Audio,
            "movie" | "video" => MediaType::Movie,
            "podcast" => MediaType::Podcast,
            "audiobook" => MediaType::Audiobook,
            "musicvideo" | "music-video" => MediaType::MusicVideo,
            "tvshow" | "tv-show" => MediaType::TvShow,
            "ringtone" => MediaType::Ringtone,
            "rental" => MediaType::Rental,
            "itunes-extra" | "extra" => MediaType::ItunesExtra,
            "memo" => MediaType::Memo,
            "itunes-u" | "itunesu" => MediaType::ItunesU,
            _ => return Err(ParseMediaTypeError(s.to_string())),
        };
        Ok(media_type)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArtworkFormat {
    Jpeg,
    Png,
    Unknown,
}

impl ArtworkFormat {
    pub fn as_str(self) -> &'static str {
        match self {
            ArtworkFormat::Jpeg => "jpeg",
            ArtworkFormat::Png => "png",
            ArtworkFormat::Unknown => "unknown",
        }
    }

    pub fn from_tag(tag: &str) -> Self {
        match tag {
            "jpeg" | "jpg" => ArtworkFormat::Jpeg,
            "png" => ArtworkFormat::Png,
            _ => ArtworkFormat::Unknown,
        }
    }
}

/// Embedded cover art pulled out of a source file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artwork {
    #[serde(skip)]
    pub data: Vec<u8>,
    pub format: ArtworkFormat,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PodcastInfo {
    pub show_name: Option<String>,
    pub season: u32,
    pub episode: u32,
    pub episode_id: Option<String>,
    pub url: Option<String>,
    pub rss_url: Option<String>,
    pub description: Option<String>,
    pub subtitle: Option<String>,
    pub category: Option<String>,
    pub released: Option<DateTime<Local>>,
    /// `None` means "never explicitly marked", which counts as unplayed.
    pub unplayed: Option<bool>,
}

/// Result of probing one source file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaRecord {
    pub title: Option<String>,
    pub artist: Option<String>,
    pub album: Option<String>,
    pub genre: Option<String>,
    pub composer: Option<String>,
    pub album_artist: Option<String>,
    pub year: u32,
    pub track_number: u32,
    pub disc_number: u32,
    pub duration_secs: u32,
    pub bitrate_kbps: u32,
    pub file_size: u64,
    pub rating: u8, // 0-100
    pub play_count: u32,
    pub time_added: Option<DateTime<Local>>,
    pub time_played: Option<DateTime<Local>>,
    pub media_type: MediaType,
    pub remember_position: bool,
    pub skip_when_shuffling: bool,
    pub bookmark_ms: u32,
    pub podcast: Option<PodcastInfo>,
    pub artwork: Option<Artwork>,
}

impl Default for MediaRecord {
    fn default() -> Self {
        Self {
            title: None,
            artist: None,
            album: None,
            genre: None,
            composer: None,
            album_artist: None,
            year: 0,
            track_number: 0,
            disc_number: 0,
            duration_secs: 0,
            bitrate_kbps: 0,
            file_size: 0,
            rating: 0,
            play_count: 0,
            time_added: None,
            time_played: None,
            media_type: MediaType::Audio,
            remember_position: false,
            skip_when_shuffling: false,
            bookmark_ms: 0,
            podcast: None,
            artwork: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PodcastFields {
    pub url: Option<String>,
    pub rss_url: Option<String>,
    pub description: Option<String>,
    pub subtitle: Option<String>,
    pub category: Option<String>,
    pub released: Option<DateTime<Local>>,
    pub show_name: Option<String>,
    pub season: u32,
    pub episode: u32,
    pub episode_id: Option<String>,
}

/// A track as persisted in the device database.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LibraryTrack {
    pub id: u32, // assigned by the library on insert
    pub title: String,
    pub artist: String,
    pub album: String,
    pub genre: Option<String>,
    pub composer: Option<String>,
    pub album_artist: Option<String>,
    pub year: u32,
    pub track_number: u32,
    pub disc_number: u32,
    pub length_ms: u32,
    pub bitrate_kbps: u32,
    pub size_bytes: u64,
    pub file_type: String,
    /// Device-relative path, e.g. `/iPod_Control/Music/F03/ABCD.mp3`.
    pub device_path: String,
    pub media_type: MediaType,
    pub podcast_flag: bool,
    pub unplayed: bool,
    pub remember_position: bool,
    pub skip_when_shuffling: bool,
    pub bookmark_ms: u32,
    pub rating: u8,
    pub play_count: u32,
    pub time_added: DateTime<Local>,
    pub time_modified: DateTime<Local>,
    pub time_played: Option<DateTime<Local>>,
    pub artwork_id: Option<u32>,
    pub podcast: Option<PodcastFields>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PlaylistRole {
    Master,
    Podcasts,
    Audiobooks,
    Videos,
    Ordinary,
}

impl PlaylistRole {
    pub fn code(self) -> u64 {
        match self {
            PlaylistRole::Master => 1,
            PlaylistRole::Podcasts => 2,
            PlaylistRole::Audiobooks => 3,
            PlaylistRole::Videos => 4,
            PlaylistRole::Ordinary => 0,
        }
    }

    pub fn from_code(code: u64) -> Option<Self> {
        match code {
            0 => Some(PlaylistRole::Ordinary),
            1 => Some(PlaylistRole::Master),
            2 => Some(PlaylistRole::Podcasts),
            3 => Some(PlaylistRole::Audiobooks),
            4 => Some(PlaylistRole::Videos),
            _ => None,
        }
    }

    /// Name used when the playlist is created lazily.
    pub fn default_name(self) -> &'static str {
        match self {
            PlaylistRole::Master => "iPod",
            PlaylistRole::Podcasts => "Podcasts",
            PlaylistRole::Audiobooks => "Audiobooks",
            PlaylistRole::Videos => "Videos",
            PlaylistRole::Ordinary => "Playlist",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Playlist {
    pub id: u32,
    pub name: String,
    pub role: PlaylistRole,
    pub track_ids: Vec<u32>,
}

impl Playlist {
    pub fn is_master(&self) -> bool {
        self.role == PlaylistRole::Master
    }

    pub fn contains(&self, track_id: u32) -> bool {
        self.track_ids.contains(&track_id)
    }
}

/// Artwork attached to one or more tracks, stored inside the database.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Thumbnail {
    pub id: u32,
    pub format: ArtworkFormat,
    #[serde(skip)]
    pub data: Vec<u8>,
}

/// Running counters for one sync invocation.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SyncStats {
    pub files_added: u32,
    pub files_skipped: u32,
    pub files_failed: u32,
    pub files_updated: u32,
    pub tracks_before: usize,
    pub tracks_after: usize,
    pub bytes_transferred: u64,
    pub started_at: Option<DateTime<Local>>,
    pub finished_at: Option<DateTime<Local>>,
    /// Bytes per second over the whole run.
    pub average_speed: f64,
}

impl SyncStats {
    pub fn elapsed_secs(&self) -> i64 {
        match (self.started_at, self.finished_at) {
            (Some(start), Some(end)) => (end - start).num_seconds(),
            _ => 0,
        }
    }

    pub(crate) fn finish(&mut self, now: DateTime<Local>) {
        self.finished_at = Some(now);
        let millis = self
            .started_at
            .map(|start| (now - start).num_milliseconds())
            .unwrap_or(0);
        self.average_speed = if millis > 0 {
            self.bytes_transferred as f64 * 1000.0 / millis as f64
        } else {
            self.bytes_transferred as f64
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn media_type_tokens_and_aliases() {
        assert_eq!("audio".parse::<MediaType>(), Ok(MediaType::Audio));
        assert_eq!("Podcast".parse::<MediaType>(), Ok(MediaType::Podcast));
        assert_eq!("video".parse::<MediaType>(), Ok(MediaType::Movie));
        assert_eq!("itunesu".parse::<MediaType>(), Ok(MediaType::ItunesU));
        assert_eq!("tv-show".parse::<MediaType>(), Ok(MediaType::TvShow));
    }

    #[test]
    fn unknown_media_type_is_an_error_not_audio() {
        let err = "podcsat".parse::<MediaType>().unwrap_err();
        assert_eq!(err, ParseMediaTypeError("podcsat".into()));
        assert!(err.to_string().contains("itunes-extra"));
    }

    #[test]
    fn media_type_codes_round_trip() {
        for t in MediaType::ALL {
            assert_eq!(MediaType::from_code(t.code()), Some(t));
        }
        assert_eq!(MediaType::from_code(0x3), None);
    }
}
