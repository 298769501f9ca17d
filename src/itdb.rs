//! The on-device library and its persisted form.
//!
//! The database is a binary property list with a `Tracks` array, a
//! `Playlists` array and a `Thumbnails` array. `parse` and `write` are the only
//! two entry points touching the file format; everything else works on the
//! in-memory [`Library`].

use crate::error::StoreError;
use crate::models::{
    Artwork, ArtworkFormat, LibraryTrack, MediaType, Playlist, PlaylistRole, PodcastFields,
    Thumbnail,
};
use crate::track_builder::policy_for;
use chrono::{DateTime, Local};
use plist::{Dictionary, Value};
use std::collections::HashSet;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;
use std::time::SystemTime;
use tracing::{debug, warn};

const FORMAT_VERSION: u64 = 1;

#[derive(Debug, Clone)]
pub struct Library {
    pub device_name: String,
    pub tracks: Vec<LibraryTrack>,
    pub playlists: Vec<Playlist>,
    pub thumbnails: Vec<Thumbnail>,
    next_track_id: u32,
    next_playlist_id: u32,
    next_thumbnail_id: u32,
}

impl Library {
    /// An empty library holding only the master playlist.
    pub fn new(device_name: &str) -> Self {
        let mut library = Self {
            device_name: device_name.to_string(),
            tracks: Vec::new(),
            playlists: Vec::new(),
            thumbnails: Vec::new(),
            next_track_id: 1,
            next_playlist_id: 1,
            next_thumbnail_id: 1,
        };
        library.add_playlist(device_name, PlaylistRole::Master);
        library
    }

    fn recompute_counters(&mut self) {
        self.next_track_id = self.tracks.iter().map(|t| t.id).max().unwrap_or(0) + 1;
        self.next_playlist_id = self.playlists.iter().map(|p| p.id).max().unwrap_or(0) + 1;
        self.next_thumbnail_id = self.thumbnails.iter().map(|t| t.id).max().unwrap_or(0) + 1;
    }

    pub fn master(&self) -> Option<&Playlist> {
        self.playlists.iter().find(|p| p.is_master())
    }

    fn master_mut(&mut self) -> &mut Playlist {
        let idx = match self.playlists.iter().position(|p| p.is_master()) {
            Some(idx) => idx,
            None => {
                warn!("Library has no master playlist, recreating it");
                let name = self.device_name.clone();
                self.add_playlist(&name, PlaylistRole::Master);
                self.playlists.len() - 1
            }
        };
        &mut self.playlists[idx]
    }

    pub fn playlist(&self, id: u32) -> Option<&Playlist> {
        self.playlists.iter().find(|p| p.id == id)
    }

    fn playlist_mut(&mut self, id: u32) -> Option<&mut Playlist> {
        self.playlists.iter_mut().find(|p| p.id == id)
    }

    pub fn role_playlist(&self, role: PlaylistRole) -> Option<&Playlist> {
        self.playlists.iter().find(|p| p.role == role)
    }

    /// Returns the playlist carrying `role`, creating it on first use.
    fn role_playlist_mut(&mut self, role: PlaylistRole) -> &mut Playlist {
        let idx = match self.playlists.iter().position(|p| p.role == role) {
            Some(idx) => idx,
            None => {
                debug!("Creating {} playlist", role.default_name());
                self.add_playlist(role.default_name(), role);
                self.playlists.len() - 1
            }
        };
        &mut self.playlists[idx]
    }

    pub fn track(&self, id: u32) -> Option<&LibraryTrack> {
        self.tracks.iter().find(|t| t.id == id)
    }

    pub fn thumbnail(&self, id: u32) -> Option<&Thumbnail> {
        self.thumbnails.iter().find(|t| t.id == id)
    }

    /// Inserts `track` with a fresh id, adds it to the master playlist and to
    /// the role playlist of its media type.
    pub fn add_track(&mut self, mut track: LibraryTrack) -> u32 {
        let id = self.next_track_id;
        self.next_track_id += 1;
        track.id = id;

        let role = policy_for(track.media_type).playlist;
        self.tracks.push(track);
        self.master_mut().track_ids.push(id);
        if let Some(role) = role {
            self.role_playlist_mut(role).track_ids.push(id);
        }
        id
    }

    /// Stores `artwork` as a thumbnail and links it to `track_id`.
    pub fn attach_artwork(&mut self, track_id: u32, artwork: &Artwork) -> Result<u32, StoreError> {
        let format = sniff_image(&artwork.data).ok_or_else(|| {
            StoreError::Artwork(format!(
                "{} bytes tagged {} are not a JPEG or PNG image",
                artwork.data.len(),
                artwork.format.as_str()
            ))
        })?;

        let thumb_id = self.next_thumbnail_id;
        let track = self
            .tracks
            .iter_mut()
            .find(|t| t.id == track_id)
            .ok_or(StoreError::TrackNotFound(track_id))?;
        track.artwork_id = Some(thumb_id);

        self.next_thumbnail_id += 1;
        self.thumbnails.push(Thumbnail {
            id: thumb_id,
            format,
            data: artwork.data.clone(),
        });
        Ok(thumb_id)
    }

    /// Removes the track, its playlist memberships and an unreferenced
    /// thumbnail. Returns the removed track.
    pub fn remove_track(&mut self, id: u32) -> Result<LibraryTrack, StoreError> {
        let idx = self
            .tracks
            .iter()
            .position(|t| t.id == id)
            .ok_or(StoreError::TrackNotFound(id))?;
        let track = self.tracks.remove(idx);

        for playlist in &mut self.playlists {
            playlist.track_ids.retain(|&tid| tid != id);
        }

        if let Some(thumb_id) = track.artwork_id {
            let still_used = self.tracks.iter().any(|t| t.artwork_id == Some(thumb_id));
            if !still_used {
                self.thumbnails.retain(|t| t.id != thumb_id);
            }
        }
        Ok(track)
    }

    pub fn add_playlist(&mut self, name: &str, role: PlaylistRole) -> u32 {
        let id = self.next_playlist_id;
        self.next_playlist_id += 1;
        self.playlists.push(Playlist {
            id,
            name: name.to_string(),
            role,
            track_ids: Vec::new(),
        });
        id
    }

    pub fn remove_playlist(&mut self, id: u32) -> Result<(), StoreError> {
        let playlist = self.playlist(id).ok_or(StoreError::PlaylistNotFound(id))?;
        if playlist.is_master() {
            return Err(StoreError::MasterPlaylistProtected);
        }
        self.playlists.retain(|p| p.id != id);
        Ok(())
    }

    pub fn rename_playlist(&mut self, id: u32, name: &str) -> Result<(), StoreError> {
        let playlist = self.playlist_mut(id).ok_or(StoreError::PlaylistNotFound(id))?;
        playlist.name = name.to_string();
        Ok(())
    }

    /// Renames the device, which is also the master playlist's name.
    pub fn set_device_name(&mut self, name: &str) {
        self.device_name = name.to_string();
        self.master_mut().name = name.to_string();
    }

    pub fn find_duplicate(&self, title: &str, artist: &str, album: &str, size: u64) -> Option<u32> {
        self.tracks
            .iter()
            .find(|t| t.title == title && t.artist == artist && t.album == album && t.size_bytes == size)
            .map(|t| t.id)
    }

    /// Exactly one master playlist and no repeated track ids.
    pub fn is_consistent(&self) -> bool {
        let masters = self.playlists.iter().filter(|p| p.is_master()).count();
        let mut seen = HashSet::new();
        masters == 1 && self.tracks.iter().all(|t| seen.insert(t.id))
    }

    pub fn tracks_of_type(&self, media_type: MediaType) -> impl Iterator<Item = &LibraryTrack> {
        self.tracks.iter().filter(move |t| t.media_type == media_type)
    }
}

/// Detects the real image format from magic bytes.
fn sniff_image(data: &[u8]) -> Option<ArtworkFormat> {
    if data.starts_with(&[0xFF, 0xD8, 0xFF]) {
        Some(ArtworkFormat::Jpeg)
    } else if data.starts_with(&[0x89, b'P', b'N', b'G']) {
        Some(ArtworkFormat::Png)
    } else {
        None
    }
}

// ---------------------------------------------------------------------------
// Reading

fn get_string(dict: &Dictionary, key: &str) -> Option<String> {
    dict.get(key).and_then(|v| v.as_string()).map(|s| s.to_string())
}

fn get_u64(dict: &Dictionary, key: &str) -> Option<u64> {
    dict.get(key).and_then(|v| v.as_unsigned_integer())
}

fn get_u32(dict: &Dictionary, key: &str) -> u32 {
    get_u64(dict, key)
        .and_then(|n| u32::try_from(n).ok())
        .unwrap_or(0)
}

fn get_bool(dict: &Dictionary, key: &str) -> bool {
    dict.get(key).and_then(|v| v.as_boolean()).unwrap_or(false)
}

fn get_date(dict: &Dictionary, key: &str) -> Option<DateTime<Local>> {
    dict.get(key)
        .and_then(|v| v.as_date())
        .map(|d| DateTime::<Local>::from(SystemTime::from(d)))
}

fn get_array<'a>(root: &'a Dictionary, key: &str) -> Result<&'a [Value], String> {
    match root.get(key) {
        None => Ok(&[]),
        Some(v) => v
            .as_array()
            .map(|a| a.as_slice())
            .ok_or_else(|| format!("{} is not an array", key)),
    }
}

fn parse_track(dict: &Dictionary) -> Result<LibraryTrack, String> {
    let id = get_u64(dict, "Track ID")
        .and_then(|n| u32::try_from(n).ok())
        .ok_or("track without Track ID")?;
    let device_path = get_string(dict, "Location").ok_or(format!("track {} has no Location", id))?;

    let media_code = get_u32(dict, "Media Kind");
    let media_type = MediaType::from_code(media_code).unwrap_or_else(|| {
        warn!("Track {} has unknown media kind {:#x}, treating as audio", id, media_code);
        MediaType::Audio
    });

    let added = get_date(dict, "Date Added").unwrap_or_else(Local::now);

    let podcast = dict
        .get("Podcast Info")
        .and_then(|v| v.as_dictionary())
        .map(|p| PodcastFields {
            url: get_string(p, "Podcast URL"),
            rss_url: get_string(p, "RSS URL"),
            description: get_string(p, "Description"),
            subtitle: get_string(p, "Subtitle"),
            category: get_string(p, "Category"),
            released: get_date(p, "Release Date"),
            show_name: get_string(p, "Show"),
            season: get_u32(p, "Season"),
            episode: get_u32(p, "Episode"),
            episode_id: get_string(p, "Episode ID"),
        });

    Ok(LibraryTrack {
        id,
        title: get_string(dict, "Name").unwrap_or_default(),
        artist: get_string(dict, "Artist").unwrap_or_default(),
        album: get_string(dict, "Album").unwrap_or_default(),
        genre: get_string(dict, "Genre"),
        composer: get_string(dict, "Composer"),
        album_artist: get_string(dict, "Album Artist"),
        year: get_u32(dict, "Year"),
        track_number: get_u32(dict, "Track Number"),
        disc_number: get_u32(dict, "Disc Number"),
        length_ms: get_u32(dict, "Total Time"),
        bitrate_kbps: get_u32(dict, "Bit Rate"),
        size_bytes: get_u64(dict, "Size").unwrap_or(0),
        file_type: get_string(dict, "Kind").unwrap_or_else(|| "mp3".to_string()),
        device_path,
        media_type,
        podcast_flag: get_bool(dict, "Podcast"),
        unplayed: get_bool(dict, "Unplayed"),
        remember_position: get_bool(dict, "Remember Position"),
        skip_when_shuffling: get_bool(dict, "Skip When Shuffling"),
        bookmark_ms: get_u32(dict, "Bookmark Time"),
        rating: get_u32(dict, "Rating").min(100) as u8,
        play_count: get_u32(dict, "Play Count"),
        time_added: added,
        time_modified: get_date(dict, "Date Modified").unwrap_or(added),
        time_played: get_date(dict, "Play Date"),
        artwork_id: get_u64(dict, "Artwork ID").and_then(|n| u32::try_from(n).ok()),
        podcast,
    })
}

fn parse_playlist(dict: &Dictionary) -> Result<Playlist, String> {
    let id = get_u64(dict, "Playlist ID")
        .and_then(|n| u32::try_from(n).ok())
        .ok_or("playlist without Playlist ID")?;
    let role_code = get_u64(dict, "Role").unwrap_or(0);
    let role = PlaylistRole::from_code(role_code)
        .ok_or(format!("playlist {} has unknown role {}", id, role_code))?;

    let track_ids = match dict.get("Items") {
        None => Vec::new(),
        Some(v) => v
            .as_array()
            .ok_or(format!("playlist {} items are not an array", id))?
            .iter()
            .filter_map(|item| item.as_unsigned_integer())
            .filter_map(|n| u32::try_from(n).ok())
            .collect(),
    };

    Ok(Playlist {
        id,
        name: get_string(dict, "Name").unwrap_or_else(|| role.default_name().to_string()),
        role,
        track_ids,
    })
}

fn parse_thumbnail(dict: &Dictionary) -> Result<Thumbnail, String> {
    let id = get_u64(dict, "Thumbnail ID")
        .and_then(|n| u32::try_from(n).ok())
        .ok_or("thumbnail without Thumbnail ID")?;
    let data = dict
        .get("Data")
        .and_then(|v| v.as_data())
        .ok_or(format!("thumbnail {} has no data", id))?
        .to_vec();
    Ok(Thumbnail {
        id,
        format: ArtworkFormat::from_tag(&get_string(dict, "Format").unwrap_or_default()),
        data,
    })
}

fn parse_root(value: &Value) -> Result<Library, String> {
    let root = value.as_dictionary().ok_or("root is not a dictionary")?;

    let version = get_u64(root, "Version").unwrap_or(FORMAT_VERSION);
    if version > FORMAT_VERSION {
        return Err(format!("unsupported database version {}", version));
    }

    let tracks = get_array(root, "Tracks")?
        .iter()
        .map(|v| v.as_dictionary().ok_or_else(|| "track is not a dictionary".to_string()).and_then(parse_track))
        .collect::<Result<Vec<_>, _>>()?;
    let playlists = get_array(root, "Playlists")?
        .iter()
        .map(|v| v.as_dictionary().ok_or_else(|| "playlist is not a dictionary".to_string()).and_then(parse_playlist))
        .collect::<Result<Vec<_>, _>>()?;
    let thumbnails = get_array(root, "Thumbnails")?
        .iter()
        .map(|v| v.as_dictionary().ok_or_else(|| "thumbnail is not a dictionary".to_string()).and_then(parse_thumbnail))
        .collect::<Result<Vec<_>, _>>()?;

    let mut library = Library {
        device_name: get_string(root, "Device Name").unwrap_or_else(|| "iPod".to_string()),
        tracks,
        playlists,
        thumbnails,
        next_track_id: 1,
        next_playlist_id: 1,
        next_thumbnail_id: 1,
    };
    library.recompute_counters();

    if library.master().is_none() {
        return Err("database has no master playlist".to_string());
    }
    Ok(library)
}

/// Reads a database file into memory.
pub fn parse(path: &Path) -> Result<Library, StoreError> {
    if !path.exists() {
        return Err(StoreError::NotFound(path.to_path_buf()));
    }

    let value = Value::from_file(path).map_err(|e| StoreError::ParseFailure {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;

    let library = parse_root(&value).map_err(|reason| StoreError::ParseFailure {
        path: path.to_path_buf(),
        reason,
    })?;

    debug!(
        "Parsed {}: {} tracks, {} playlists, {} thumbnails",
        path.display(),
        library.tracks.len(),
        library.playlists.len(),
        library.thumbnails.len()
    );
    Ok(library)
}

// ---------------------------------------------------------------------------
// Writing

fn date_value(dt: &DateTime<Local>) -> Value {
    Value::Date(SystemTime::from(*dt).into())
}

fn insert_opt(dict: &mut Dictionary, key: &str, value: &Option<String>) {
    if let Some(v) = value {
        dict.insert(key.to_string(), Value::String(v.clone()));
    }
}

fn insert_int(dict: &mut Dictionary, key: &str, value: u64) {
    dict.insert(key.to_string(), Value::Integer(value.into()));
}

fn track_value(track: &LibraryTrack) -> Value {
    let mut dict = Dictionary::new();
    insert_int(&mut dict, "Track ID", track.id.into());
    dict.insert("Name".to_string(), Value::String(track.title.clone()));
    dict.insert("Artist".to_string(), Value::String(track.artist.clone()));
    dict.insert("Album".to_string(), Value::String(track.album.clone()));
    insert_opt(&mut dict, "Genre", &track.genre);
    insert_opt(&mut dict, "Composer", &track.composer);
    insert_opt(&mut dict, "Album Artist", &track.album_artist);
    insert_int(&mut dict, "Year", track.year.into());
    insert_int(&mut dict, "Track Number", track.track_number.into());
    insert_int(&mut dict, "Disc Number", track.disc_number.into());
    insert_int(&mut dict, "Total Time", track.length_ms.into());
    insert_int(&mut dict, "Bit Rate", track.bitrate_kbps.into());
    insert_int(&mut dict, "Size", track.size_bytes);
    dict.insert("Kind".to_string(), Value::String(track.file_type.clone()));
    dict.insert("Location".to_string(), Value::String(track.device_path.clone()));
    insert_int(&mut dict, "Media Kind", track.media_type.code().into());
    dict.insert("Podcast".to_string(), Value::Boolean(track.podcast_flag));
    dict.insert("Unplayed".to_string(), Value::Boolean(track.unplayed));
    dict.insert("Remember Position".to_string(), Value::Boolean(track.remember_position));
    dict.insert("Skip When Shuffling".to_string(), Value::Boolean(track.skip_when_shuffling));
    insert_int(&mut dict, "Bookmark Time", track.bookmark_ms.into());
    insert_int(&mut dict, "Rating", track.rating.into());
    insert_int(&mut dict, "Play Count", track.play_count.into());
    dict.insert("Date Added".to_string(), date_value(&track.time_added));
    dict.insert("Date Modified".to_string(), date_value(&track.time_modified));
    if let Some(played) = &track.time_played {
        dict.insert("Play Date".to_string(), date_value(played));
    }
    if let Some(artwork_id) = track.artwork_id {
        insert_int(&mut dict, "Artwork ID", artwork_id.into());
    }

    if let Some(p) = &track.podcast {
        let mut pd = Dictionary::new();
        insert_opt(&mut pd, "Podcast URL", &p.url);
        insert_opt(&mut pd, "RSS URL", &p.rss_url);
        insert_opt(&mut pd, "Description", &p.description);
        insert_opt(&mut pd, "Subtitle", &p.subtitle);
        insert_opt(&mut pd, "Category", &p.category);
        if let Some(released) = &p.released {
            pd.insert("Release Date".to_string(), date_value(released));
        }
        insert_opt(&mut pd, "Show", &p.show_name);
        insert_int(&mut pd, "Season", p.season.into());
        insert_int(&mut pd, "Episode", p.episode.into());
        insert_opt(&mut pd, "Episode ID", &p.episode_id);
        dict.insert("Podcast Info".to_string(), Value::Dictionary(pd));
    }

    Value::Dictionary(dict)
}

fn playlist_value(playlist: &Playlist) -> Value {
    let mut dict = Dictionary::new();
    insert_int(&mut dict, "Playlist ID", playlist.id.into());
    dict.insert("Name".to_string(), Value::String(playlist.name.clone()));
    insert_int(&mut dict, "Role", playlist.role.code());
    let items = playlist
        .track_ids
        .iter()
        .map(|&id| Value::Integer(u64::from(id).into()))
        .collect();
    dict.insert("Items".to_string(), Value::Array(items));
    Value::Dictionary(dict)
}

fn thumbnail_value(thumb: &Thumbnail) -> Value {
    let mut dict = Dictionary::new();
    insert_int(&mut dict, "Thumbnail ID", thumb.id.into());
    dict.insert("Format".to_string(), Value::String(thumb.format.as_str().to_string()));
    dict.insert("Data".to_string(), Value::Data(thumb.data.clone()));
    Value::Dictionary(dict)
}

fn library_value(library: &Library) -> Value {
    let mut root = Dictionary::new();
    insert_int(&mut root, "Version", FORMAT_VERSION);
    root.insert("Device Name".to_string(), Value::String(library.device_name.clone()));
    root.insert(
        "Tracks".to_string(),
        Value::Array(library.tracks.iter().map(track_value).collect()),
    );
    root.insert(
        "Playlists".to_string(),
        Value::Array(library.playlists.iter().map(playlist_value).collect()),
    );
    root.insert(
        "Thumbnails".to_string(),
        Value::Array(library.thumbnails.iter().map(thumbnail_value).collect()),
    );
    Value::Dictionary(root)
}

/// Serializes `library` to `path`, replacing any existing file. Callers that
/// need atomic replacement write to a scratch path and rename.
pub fn write(library: &Library, path: &Path) -> Result<(), StoreError> {
    let to_store_err = |source: io::Error| StoreError::WriteFailure {
        path: path.to_path_buf(),
        source,
    };

    let file = File::create(path).map_err(to_store_err)?;
    let mut writer = BufWriter::new(file);
    library_value(library)
        .to_writer_binary(&mut writer)
        .map_err(|e| to_store_err(io::Error::other(e)))?;
    writer.flush().map_err(to_store_err)?;
    writer.get_ref().sync_all().map_err(to_store_err)?;
    Ok(())
}
