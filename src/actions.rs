use crate::error::StoreError;
use crate::itdb::Library;
use crate::models::{LibraryTrack, MediaType};
use std::collections::VecDeque;
use tracing::{debug, warn};

/// A library mutation recorded now and applied later, in order.
#[derive(Debug, Clone)]
pub enum DeferredAction {
    SetName(String),
    AddTrack(Box<LibraryTrack>),
    RemoveTrack(u32),
}

impl DeferredAction {
    /// Applies the action and returns a short description of what happened.
    pub fn apply(self, library: &mut Library) -> Result<String, StoreError> {
        match self {
            DeferredAction::SetName(name) => {
                library.set_device_name(&name);
                Ok(format!("Renamed device to {}", name))
            }
            DeferredAction::AddTrack(track) => {
                let title = track.title.clone();
                let id = library.add_track(*track);
                Ok(format!("Added track {} ({})", id, title))
            }
            DeferredAction::RemoveTrack(id) => {
                let track = library.remove_track(id)?;
                Ok(format!("Removed track {} ({})", id, track.title))
            }
        }
    }
}

/// Which queued actions to drop.
#[derive(Debug, Clone)]
pub enum RemovalCriteria {
    TrackId(u32),
    MediaType(MediaType),
}

#[derive(Debug, Default)]
pub struct ActionQueue {
    pending: VecDeque<DeferredAction>,
}

impl ActionQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, action: DeferredAction) {
        self.pending.push_back(action);
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Applies every queued action oldest first and leaves the queue empty.
    /// A failing action is logged and skipped. Returns how many applied.
    pub fn drain_into(&mut self, library: &mut Library) -> usize {
        let mut applied = 0;
        while let Some(action) = self.pending.pop_front() {
            match action.apply(library) {
                Ok(message) => {
                    debug!("{}", message);
                    applied += 1;
                }
                Err(e) => warn!("Skipping deferred action: {}", e),
            }
        }
        applied
    }
}
