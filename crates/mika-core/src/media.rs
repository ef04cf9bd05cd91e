//! Stable semantic ids for non-text content.
//!
//! History is eventually textified; these ids let a transcript line keep
//! "what kind of media happened here" and let tools fetch the original
//! asset back by id.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

pub const MEDIA_KIND_IMAGE: &str = "image";
pub const MEDIA_KIND_EMOJI: &str = "emoji";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaSemantic {
    pub kind: String,
    pub id: String,
    #[serde(default)]
    pub r#ref: String,
    #[serde(default)]
    pub source: String,
}

pub fn normalize_media_kind(kind: &str) -> &'static str {
    match kind.trim().to_ascii_lowercase().as_str() {
        "emoji" | "mface" | "sticker" => MEDIA_KIND_EMOJI,
        _ => MEDIA_KIND_IMAGE,
    }
}

/// Deterministic short id from a seed string (hash truncation).
fn stable_short_id(seed: &str) -> String {
    let digest = Sha256::digest(seed.as_bytes());
    hex::encode(digest)[..12].to_string()
}

pub fn build_media_semantic(kind: &str, asset_ref: &str, url: &str, emoji_id: &str, source: &str) -> MediaSemantic {
    let media_kind = normalize_media_kind(kind);
    if media_kind == MEDIA_KIND_EMOJI {
        let mut seed = emoji_id.trim();
        if seed.is_empty() {
            seed = asset_ref.trim();
        }
        if seed.is_empty() {
            seed = url.trim();
        }
        let seed = if seed.is_empty() { "emoji:unknown" } else { seed };
        let r#ref = [asset_ref, url, emoji_id]
            .iter()
            .map(|s| s.trim())
            .find(|s| !s.is_empty())
            .unwrap_or("")
            .to_string();
        return MediaSemantic {
            kind: MEDIA_KIND_EMOJI.to_string(),
            id: stable_short_id(&format!("emoji:{}", seed)),
            r#ref,
            source: source.trim().to_string(),
        };
    }

    let mut seed = url.trim();
    if seed.is_empty() {
        seed = asset_ref.trim();
    }
    let seed = if seed.is_empty() { "image:unknown" } else { seed };
    let r#ref = if asset_ref.trim().is_empty() {
        url.trim().to_string()
    } else {
        asset_ref.trim().to_string()
    };
    MediaSemantic {
        kind: MEDIA_KIND_IMAGE.to_string(),
        id: stable_short_id(&format!("image:{}", seed)),
        r#ref,
        source: source.trim().to_string(),
    }
}

/// Textual stand-in for a media part: `[图片][picid:<id>]` / `[表情][emoji:<id>]`.
pub fn placeholder(semantic: Option<&MediaSemantic>) -> String {
    match semantic {
        Some(sem) if normalize_media_kind(&sem.kind) == MEDIA_KIND_EMOJI => {
            if sem.id.is_empty() {
                "[表情]".to_string()
            } else {
                format!("[表情][emoji:{}]", sem.id)
            }
        }
        Some(sem) if !sem.id.is_empty() => format!("[图片][picid:{}]", sem.id),
        _ => "[图片]".to_string(),
    }
}

pub fn placeholder_for_url(url: &str) -> String {
    let semantic = build_media_semantic(MEDIA_KIND_IMAGE, "", url, "", "");
    placeholder(Some(&semantic))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_url_yields_same_id() {
        let a = build_media_semantic("image", "", "https://x/a.png", "", "group");
        let b = build_media_semantic("image", "", "https://x/a.png", "", "");
        assert_eq!(a.id, b.id);
        assert_eq!(a.id.len(), 12);
    }

    #[test]
    fn sticker_normalizes_to_emoji() {
        let sem = build_media_semantic("sticker", "", "", "f123", "");
        assert_eq!(sem.kind, MEDIA_KIND_EMOJI);
        assert!(placeholder(Some(&sem)).starts_with("[表情][emoji:"));
    }

    #[test]
    fn unknown_media_falls_back_to_plain_tag() {
        assert_eq!(placeholder(None), "[图片]");
    }
}
