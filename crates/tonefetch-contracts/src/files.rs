//! File-name normalization for downloaded artifacts.
//!
//! Everything here is pure: remote names are untrusted input and may carry
//! path components, characters that are illegal on common filesystems, or no
//! extension at all.

use std::path::Path;

const FALLBACK_FILE_NAME: &str = "model";
const FALLBACK_DIR_NAME: &str = "tone";
const MAX_DIR_NAME_CHARS: usize = 50;

/// Platform tags whose model files carry a canonical extension when the
/// remote name has none.
const PLATFORM_EXTENSIONS: &[(&str, &str)] = &[("nam", "nam")];

/// Replaces control characters and `<>:"/\|?*` with underscores and trims
/// leading/trailing dots and spaces. An empty result becomes `"model"`.
pub fn safe_file_name(raw: &str) -> String {
    let replaced: String = raw
        .chars()
        .map(|ch| {
            if ch.is_control() || matches!(ch, '<' | '>' | ':' | '"' | '/' | '\\' | '|' | '?' | '*')
            {
                '_'
            } else {
                ch
            }
        })
        .collect();
    let trimmed = replaced.trim_matches([' ', '.']);
    if trimmed.is_empty() {
        FALLBACK_FILE_NAME.to_string()
    } else {
        trimmed.to_string()
    }
}

/// Maps a remote model name plus the owning tone's platform tag to a safe
/// local file name.
///
/// Path components are stripped first (both separator styles, so a crafted
/// `..\..\name` cannot escape the tone directory). A name that already ends
/// in an extension is kept as-is after sanitization; otherwise the platform
/// table decides whether a canonical extension is appended.
pub fn normalize_model_file_name(raw: &str, platform: Option<&str>) -> String {
    let base_component = raw.rsplit(['/', '\\']).next().unwrap_or(raw);
    let base = safe_file_name(base_component);

    if Path::new(&base)
        .extension()
        .is_some_and(|ext| !ext.is_empty())
    {
        return base;
    }

    let hint = platform.map(|tag| tag.trim().to_ascii_lowercase());
    if let Some(extension) = hint.as_deref().and_then(|tag| {
        PLATFORM_EXTENSIONS
            .iter()
            .find(|(known, _)| *known == tag)
            .map(|(_, extension)| *extension)
    }) {
        return format!("{base}.{extension}");
    }

    base
}

/// Directory-safe rendition of a tone title: alphanumerics, spaces, dashes
/// and underscores survive, everything else becomes an underscore, capped at
/// 50 characters.
pub fn safe_dir_name(title: &str) -> String {
    let replaced: String = title
        .chars()
        .map(|ch| {
            if ch.is_alphanumeric() || matches!(ch, ' ' | '-' | '_') {
                ch
            } else {
                '_'
            }
        })
        .collect();
    let capped: String = replaced.trim().chars().take(MAX_DIR_NAME_CHARS).collect();
    let capped = capped.trim_end().to_string();
    if capped.is_empty() {
        FALLBACK_DIR_NAME.to_string()
    } else {
        capped
    }
}

/// Per-tone artifact directory name: sanitized title plus the stable id.
pub fn tone_dir_name(title: &str, id: u64) -> String {
    format!("{}_{}", safe_dir_name(title), id)
}
