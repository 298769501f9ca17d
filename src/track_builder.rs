use crate::error::BuildError;
use crate::models::{LibraryTrack, MediaRecord, MediaType, PlaylistRole, PodcastFields};
use chrono::{DateTime, Datelike, Local};

pub const DEFAULT_BITRATE_KBPS: u32 = 128;
const DEVICE_PREFIX: &str = "/iPod_Control/";

/// Which extra fields a media type fills in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtraFields {
    None,
    /// Genre, year, track and disc get defaults when missing.
    MusicDefaults,
    /// URL, feed, description and release time are carried over.
    Podcast,
}

/// Per-media-type flags and playlist placement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TypePolicy {
    pub podcast_flag: bool,
    pub unplayed: bool,
    pub remember_position: bool,
    pub skip_when_shuffling: bool,
    /// Carry the source's saved playback position over.
    pub keep_bookmark: bool,
    pub extras: ExtraFields,
    pub playlist: Option<PlaylistRole>,
}

const AUDIO: TypePolicy = TypePolicy {
    podcast_flag: false,
    unplayed: false,
    remember_position: false,
    skip_when_shuffling: false,
    keep_bookmark: false,
    extras: ExtraFields::MusicDefaults,
    playlist: None,
};

const PODCAST: TypePolicy = TypePolicy {
    podcast_flag: true,
    unplayed: true,
    remember_position: true,
    skip_when_shuffling: true,
    keep_bookmark: false,
    extras: ExtraFields::Podcast,
    playlist: Some(PlaylistRole::Podcasts),
};

const AUDIOBOOK: TypePolicy = TypePolicy {
    podcast_flag: false,
    unplayed: false,
    remember_position: true,
    skip_when_shuffling: true,
    keep_bookmark: true,
    extras: ExtraFields::None,
    playlist: Some(PlaylistRole::Audiobooks),
};

const VIDEO: TypePolicy = TypePolicy {
    playlist: Some(PlaylistRole::Videos),
    ..AUDIOBOOK
};

const OTHER: TypePolicy = TypePolicy {
    playlist: None,
    ..AUDIOBOOK
};

pub fn policy_for(media_type: MediaType) -> TypePolicy {
    match media_type {
        MediaType::Audio => AUDIO,
        MediaType::Podcast => PODCAST,
        MediaType::Audiobook => AUDIOBOOK,
        MediaType::Movie | MediaType::MusicVideo | MediaType::TvShow => VIDEO,
        MediaType::Ringtone
        | MediaType::Rental
        | MediaType::ItunesExtra
        | MediaType::Memo
        | MediaType::ItunesU => OTHER,
    }
}

/// The database's file type tag for a device path.
pub fn file_type_for(device_path: &str) -> String {
    let ext = device_path
        .rsplit_once('/')
        .map_or(device_path, |(_, name)| name)
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase());

    match ext.as_deref() {
        None | Some("") | Some("mp3") => "mp3".to_string(),
        Some("m4a") | Some("aac") | Some("m4b") | Some("m4p") => "m4a".to_string(),
        Some(other) => other.to_string(),
    }
}

fn or_unknown(value: &Option<String>, fallback: &str) -> String {
    match value.as_deref().map(str::trim) {
        Some(v) if !v.is_empty() => v.to_string(),
        _ => fallback.to_string(),
    }
}

/// Title, artist and album as they will be stored for `record`.
pub fn stored_identity(record: &MediaRecord) -> (String, String, String) {
    (
        or_unknown(&record.title, "Unknown Title"),
        or_unknown(&record.artist, "Unknown Artist"),
        or_unknown(&record.album, "Unknown Album"),
    )
}

/// Turns probed metadata plus an allocated device path into a database track.
#[derive(Debug, Clone)]
pub struct TrackBuilder {
    default_bitrate_kbps: u32,
}

impl Default for TrackBuilder {
    fn default() -> Self {
        Self::new(DEFAULT_BITRATE_KBPS)
    }
}

impl TrackBuilder {
    pub fn new(default_bitrate_kbps: u32) -> Self {
        Self {
            default_bitrate_kbps,
        }
    }

    pub fn build(
        &self,
        record: &MediaRecord,
        device_path: &str,
        file_size: u64,
        now: DateTime<Local>,
    ) -> Result<LibraryTrack, BuildError> {
        if !device_path.starts_with(DEVICE_PREFIX) {
            return Err(BuildError::InvalidDevicePath(device_path.to_string()));
        }

        let policy = policy_for(record.media_type);
        let (title, artist, album) = stored_identity(record);

        let mut track = LibraryTrack {
            id: 0,
            title,
            artist,
            album,
            genre: record.genre.clone(),
            composer: record.composer.clone(),
            album_artist: record.album_artist.clone(),
            year: record.year,
            track_number: record.track_number,
            disc_number: record.disc_number,
            length_ms: record.duration_secs.saturating_mul(1000),
            bitrate_kbps: match record.bitrate_kbps {
                0 => self.default_bitrate_kbps,
                kbps => kbps,
            },
            size_bytes: file_size,
            file_type: file_type_for(device_path),
            device_path: device_path.to_string(),
            media_type: record.media_type,
            podcast_flag: policy.podcast_flag,
            unplayed: policy.unplayed,
            remember_position: policy.remember_position,
            skip_when_shuffling: policy.skip_when_shuffling,
            bookmark_ms: if policy.keep_bookmark { record.bookmark_ms } else { 0 },
            rating: record.rating.min(100),
            play_count: record.play_count,
            time_added: now,
            time_modified: now,
            time_played: record.time_played,
            artwork_id: None,
            podcast: None,
        };

        match policy.extras {
            ExtraFields::MusicDefaults => {
                if track.genre.as_deref().map_or(true, |g| g.trim().is_empty()) {
                    track.genre = Some("Unknown".to_string());
                }
                if track.year == 0 {
                    track.year = now.year().max(0) as u32;
                }
                if track.track_number == 0 {
                    track.track_number = 1;
                }
                if track.disc_number == 0 {
                    track.disc_number = 1;
                }
            }
            ExtraFields::Podcast => {
                if let Some(info) = &record.podcast {
                    if info.unplayed == Some(false) {
                        track.unplayed = false;
                    }
                    if let Some(released) = info.released {
                        track.time_modified = released;
                    }
                    track.podcast = Some(PodcastFields {
                        url: info.url.clone(),
                        rss_url: info.rss_url.clone(),
                        description: info.description.clone(),
                        subtitle: info.subtitle.clone(),
                        category: info.category.clone(),
                        released: info.released,
                        show_name: info.show_name.clone(),
                        season: info.season,
                        episode: info.episode,
                        episode_id: info.episode_id.clone(),
                    });
                }
            }
            ExtraFields::None => {
                // Episode numbering still applies to shows.
                if let Some(info) = &record.podcast {
                    track.podcast = Some(PodcastFields {
                        show_name: info.show_name.clone(),
                        season: info.season,
                        episode: info.episode,
                        episode_id: info.episode_id.clone(),
                        ..Default::default()
                    });
                }
            }
        }

        Ok(track)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::PodcastInfo;
    use chrono::TimeZone;

    const PATH: &str = "/iPod_Control/Music/F00/AAAB.mp3";

    fn now() -> DateTime<Local> {
        Local.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn full_record_carries_over() {
        let record = MediaRecord {
            title: Some("Song".into()),
            artist: Some("Band".into()),
            album: Some("Record".into()),
            genre: Some("Rock".into()),
            year: 1999,
            track_number: 4,
            disc_number: 2,
            duration_secs: 215,
            bitrate_kbps: 256,
            ..Default::default()
        };
        let t = TrackBuilder::default().build(&record, PATH, 1234, now()).unwrap();
        assert_eq!((t.title.as_str(), t.artist.as_str(), t.album.as_str()), ("Song", "Band", "Record"));
        assert_eq!(t.length_ms, 215_000);
        assert_eq!(t.bitrate_kbps, 256);
        assert_eq!(t.size_bytes, 1234);
        assert_eq!((t.year, t.track_number, t.disc_number), (1999, 4, 2));
        assert_eq!(t.file_type, "mp3");
        assert!(!t.podcast_flag && !t.remember_position);
    }

    #[test]
    fn audio_ignores_resume_flags_from_the_source() {
        let record = MediaRecord {
            remember_position: true,
            skip_when_shuffling: true,
            bookmark_ms: 42_000,
            ..Default::default()
        };
        let t = TrackBuilder::default().build(&record, PATH, 10, now()).unwrap();
        assert!(!t.remember_position);
        assert!(!t.skip_when_shuffling);
        assert_eq!(t.bookmark_ms, 0);
    }

    #[test]
    fn bookmark_survives_only_where_the_policy_keeps_it() {
        let mut record = MediaRecord {
            bookmark_ms: 42_000,
            media_type: MediaType::Podcast,
            ..Default::default()
        };
        let t = TrackBuilder::default().build(&record, PATH, 10, now()).unwrap();
        assert_eq!(t.bookmark_ms, 0);

        record.media_type = MediaType::Audiobook;
        let t = TrackBuilder::default().build(&record, PATH, 10, now()).unwrap();
        assert_eq!(t.bookmark_ms, 42_000);
        assert!(t.remember_position);
    }

    #[test]
    fn blank_fields_become_unknown() {
        let record = MediaRecord {
            title: Some("   ".into()),
            ..Default::default()
        };
        let t = TrackBuilder::default().build(&record, PATH, 0, now()).unwrap();
        assert_eq!(t.title, "Unknown Title");
        assert_eq!(t.artist, "Unknown Artist");
        assert_eq!(t.album, "Unknown Album");
        assert_eq!(t.genre.as_deref(), Some("Unknown"));
        assert_eq!(t.year, 2024);
        assert_eq!((t.track_number, t.disc_number), (1, 1));
        assert_eq!(t.bitrate_kbps, 128);
    }

    #[test]
    fn podcast_policy_sets_flags_and_fields() {
        let released = Local.with_ymd_and_hms(2023, 1, 2, 3, 4, 5).unwrap();
        let record = MediaRecord {
            title: Some("Ep 1".into()),
            media_type: MediaType::Podcast,
            podcast: Some(PodcastInfo {
                description: Some("Podcast episode: Ep 1".into()),
                released: Some(released),
                ..Default::default()
            }),
            ..Default::default()
        };
        let t = TrackBuilder::default().build(&record, PATH, 10, now()).unwrap();
        assert!(t.podcast_flag && t.unplayed);
        assert!(t.remember_position && t.skip_when_shuffling);
        assert_eq!(t.time_modified, released);
        assert_eq!(t.time_added, now());
        assert_eq!(
            t.podcast.unwrap().description.as_deref(),
            Some("Podcast episode: Ep 1")
        );
        assert_eq!(t.genre, None);
    }

    #[test]
    fn played_podcast_is_not_marked_unplayed() {
        let record = MediaRecord {
            media_type: MediaType::Podcast,
            podcast: Some(PodcastInfo {
                unplayed: Some(false),
                ..Default::default()
            }),
            ..Default::default()
        };
        let t = TrackBuilder::default().build(&record, PATH, 10, now()).unwrap();
        assert!(!t.unplayed);
        assert!(t.remember_position && t.skip_when_shuffling);
    }

    #[test]
    fn every_non_audio_type_resumes_and_skips_shuffle() {
        for media_type in MediaType::ALL.into_iter().filter(|t| *t != MediaType::Audio) {
            let policy = policy_for(media_type);
            assert!(policy.remember_position, "{media_type}");
            assert!(policy.skip_when_shuffling, "{media_type}");
        }
        assert_eq!(policy_for(MediaType::TvShow).playlist, Some(PlaylistRole::Videos));
        assert_eq!(policy_for(MediaType::Memo).playlist, None);
    }

    #[test]
    fn file_type_follows_extension() {
        assert_eq!(file_type_for("/iPod_Control/Music/F00/AAAB.m4b"), "m4a");
        assert_eq!(file_type_for("/iPod_Control/Music/F00/AAAB.AAC"), "m4a");
        assert_eq!(file_type_for("/iPod_Control/Music/F00/AAAB.wav"), "wav");
        assert_eq!(file_type_for("/iPod_Control/Music/F00.d/AAAB"), "mp3");
    }

    #[test]
    fn path_outside_device_tree_is_rejected() {
        let err = TrackBuilder::default()
            .build(&MediaRecord::default(), "/tmp/song.mp3", 0, now())
            .unwrap_err();
        assert!(matches!(err, BuildError::InvalidDevicePath(_)));
    }
}
