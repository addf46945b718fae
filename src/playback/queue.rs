use crate::models::Track;

/// Ordered tracks plus the current position; loops in both directions
#[derive(Debug, Clone, Default)]
pub struct Queue {
    tracks: Vec<Track>,
    current_index: usize,
}

impl Queue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the contents and point at `track_id`, or the first entry if it is absent
    pub fn replace(&mut self, tracks: Vec<Track>, track_id: &str) {
        self.current_index = tracks.iter().position(|t| t.id == track_id).unwrap_or(0);
        self.tracks = tracks;
    }

    pub fn clear(&mut self) {
        self.tracks.clear();
        self.current_index = 0;
    }

    pub fn tracks(&self) -> &[Track] {
        &self.tracks
    }

    pub fn current_index(&self) -> usize {
        self.current_index
    }

    pub fn current_track(&self) -> Option<&Track> {
        self.tracks.get(self.current_index)
    }

    pub fn position_of(&self, track_id: &str) -> Option<usize> {
        self.tracks.iter().position(|t| t.id == track_id)
    }

    /// Point at an existing entry; out-of-range indices are ignored
    pub fn select(&mut self, index: usize) -> Option<&Track> {
        if index < self.tracks.len() {
            self.current_index = index;
        }
        self.tracks.get(index)
    }

    /// Step forward, wrapping from the last entry to the first
    pub fn advance(&mut self) -> Option<&Track> {
        if self.tracks.is_empty() {
            return None;
        }
        self.current_index = (self.current_index + 1) % self.tracks.len();
        self.current_track()
    }

    /// Step back, wrapping from the first entry to the last
    pub fn retreat(&mut self) -> Option<&Track> {
        if self.tracks.is_empty() {
            return None;
        }
        self.current_index = match self.current_index {
            0 => self.tracks.len() - 1,
            i => i - 1,
        };
        self.current_track()
    }

    pub fn len(&self) -> usize {
        self.tracks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }
}
