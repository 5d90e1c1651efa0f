//! Stream identity derivation
//!
//! Every captured source is broadcast under a key derived from the
//! participant tile that encloses it: the sanitized display name when one can
//! be read from the tile's accessibility label, otherwise `User_<id>`.

use crate::element::VideoTile;
use crate::tracks::TrackKind;
use rand::Rng;

/// Length of generated fallback participant IDs
const FALLBACK_ID_LEN: usize = 6;

const FALLBACK_ID_ALPHABET: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";

/// Identity of one captured source
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceIdentity {
    /// Participant ID from the tile, or a generated one
    pub participant_id: String,
    /// Display name read from the tile label
    pub display_name: Option<String>,
    /// Key the source's streams are broadcast under
    pub stream_key: String,
    /// Whether `participant_id` was generated
    pub generated_id: bool,
}

impl SourceIdentity {
    /// Session key for one of the source's tracks: `<stream_key>_<kind>`
    pub fn session_key(&self, kind: TrackKind) -> String {
        session_key(&self.stream_key, kind)
    }
}

/// Derive the identity of a source from its enclosing tile
pub fn derive_identity(tile: Option<&VideoTile>) -> SourceIdentity {
    let tile_id = tile
        .and_then(|tile| tile.participant_id.as_deref())
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .map(str::to_string);
    let display_name = tile
        .and_then(|tile| tile.accessibility_label.as_deref())
        .and_then(parse_display_name);

    let generated_id = tile_id.is_none();
    let participant_id = tile_id.unwrap_or_else(fallback_participant_id);

    let stream_key = display_name
        .as_deref()
        .map(sanitize_stream_key)
        .filter(|key| !key.is_empty())
        .unwrap_or_else(|| format!("User_{}", participant_id));

    SourceIdentity {
        participant_id,
        display_name,
        stream_key,
        generated_id,
    }
}

/// Read the display name from a comma-separated accessibility label: the
/// last segment, trimmed, without a trailing period
pub fn parse_display_name(label: &str) -> Option<String> {
    let last = label.rsplit(',').next()?.trim();
    let name = last.strip_suffix('.').unwrap_or(last).trim();
    if name.is_empty() {
        None
    } else {
        Some(name.to_string())
    }
}

/// Keep only `[A-Za-z0-9_-]`
pub fn sanitize_stream_key(name: &str) -> String {
    name.chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '_' || *c == '-')
        .collect()
}

/// Short random base-36 participant ID
pub fn fallback_participant_id() -> String {
    let mut rng = rand::thread_rng();
    (0..FALLBACK_ID_LEN)
        .map(|_| FALLBACK_ID_ALPHABET[rng.gen_range(0..FALLBACK_ID_ALPHABET.len())] as char)
        .collect()
}

/// Session key for a track of a stream: `<stream_key>_<kind>`
pub fn session_key(stream_key: &str, kind: TrackKind) -> String {
    format!("{}_{}", stream_key, kind.as_str())
}
