/// Catalog records handed to the playback core
use serde::{Deserialize, Serialize};
use std::fmt;

/// Album reference carried by a track
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Album {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub image_url: Option<String>,
}

/// Artist reference carried by a track
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artist {
    pub id: String,
    pub name: String,
}

/// A catalog track, resolved by the UI layer before playback is requested.
///
/// `preview_url` is `None` when the catalog offers no short clip for the track.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Track {
    pub id: String,
    pub name: String,
    pub duration_ms: u64,
    #[serde(default)]
    pub preview_url: Option<String>,
    pub album: Album,
    #[serde(default)]
    pub artists: Vec<Artist>,
}

impl Track {
    /// Streaming URI understood by the premium device
    pub fn uri(&self) -> String {
        format!("spotify:track:{}", self.id)
    }

    /// Comma-separated artist names for display
    pub fn artist_names(&self) -> String {
        self.artists
            .iter()
            .map(|a| a.name.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    }
}

/// Extract the base62 id from `spotify:track:<id>`, an open.spotify.com URL, or a bare id
pub fn track_id_from_uri(uri: &str) -> &str {
    if let Some(id) = uri.strip_prefix("spotify:track:") {
        id
    } else if uri.contains("/track/") {
        let tail = uri.rsplit('/').next().unwrap_or(uri);
        tail.split('?').next().unwrap_or(tail)
    } else {
        uri
    }
}

/// Subscription level of the signed-in account
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum AccountTier {
    /// Free or unknown accounts; preview clips only
    #[default]
    Free,
    /// Full-track streaming through the premium device
    Premium,
}

impl AccountTier {
    /// Map the Web API `product` field to a tier
    pub fn from_product(product: Option<&str>) -> Self {
        match product {
            Some(p) if p.eq_ignore_ascii_case("premium") => AccountTier::Premium,
            _ => AccountTier::Free,
        }
    }

    pub fn is_premium(self) -> bool {
        matches!(self, AccountTier::Premium)
    }
}

impl fmt::Display for AccountTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AccountTier::Free => write!(f, "free"),
            AccountTier::Premium => write!(f, "premium"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_track_id_from_uri() {
        assert_eq!(track_id_from_uri("spotify:track:abc123"), "abc123");
        assert_eq!(
            track_id_from_uri("https://open.spotify.com/track/abc123?si=xyz"),
            "abc123"
        );
        assert_eq!(track_id_from_uri("abc123"), "abc123");
    }

    #[test]
    fn test_account_tier_from_product() {
        assert_eq!(AccountTier::from_product(Some("premium")), AccountTier::Premium);
        assert_eq!(AccountTier::from_product(Some("free")), AccountTier::Free);
        assert_eq!(AccountTier::from_product(Some("open")), AccountTier::Free);
        assert_eq!(AccountTier::from_product(None), AccountTier::Free);
    }

    #[test]
    fn test_track_deserializes_without_preview() {
        let json = r#"{
            "id": "t1",
            "name": "Song",
            "duration_ms": 180000,
            "preview_url": null,
            "album": {"id": "a1", "name": "Album"},
            "artists": [{"id": "r1", "name": "One"}, {"id": "r2", "name": "Two"}]
        }"#;
        let track: Track = serde_json::from_str(json).unwrap();
        assert!(track.preview_url.is_none());
        assert_eq!(track.uri(), "spotify:track:t1");
        assert_eq!(track.artist_names(), "One, Two");
        assert!(track.album.image_url.is_none());
    }
}
