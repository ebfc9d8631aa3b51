//! Small helpers shared across the gateway.

use std::path::{Path, PathBuf};

/// Truncate a string to at most `max_chars` characters, appending "..." if
/// truncated. Safe across multi-byte UTF-8 characters.
pub(crate) fn truncate_with_ellipsis(s: &str, max_chars: usize) -> String {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => {
            let truncated = &s[..idx];
            format!("{}...", truncated.trim_end())
        }
        None => s.to_string(),
    }
}

/// Persist one uploaded part under `<workspace>/media/`.
///
/// The client-supplied name is flattened to `[A-Za-z0-9._-]` so it cannot
/// escape the media directory; a colliding name gets a UUID prefix instead of
/// overwriting. Returns `None` (after logging) on any I/O failure so one bad
/// part never fails the whole request.
pub(crate) fn save_uploaded_file(
    workspace: &Path,
    original_name: &str,
    data: &[u8],
) -> Option<PathBuf> {
    let mut name: String = original_name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect();
    if name.trim_matches(['_', '.']).is_empty() {
        name = "upload".to_string();
    }

    let media_dir = workspace.join("media");
    if let Err(e) = std::fs::create_dir_all(&media_dir) {
        tracing::warn!("failed to create media directory: {e}");
        return None;
    }

    let mut path = media_dir.join(&name);
    if path.exists() {
        path = media_dir.join(format!("{}-{name}", uuid::Uuid::new_v4()));
    }

    match std::fs::write(&path, data) {
        Ok(()) => Some(path),
        Err(e) => {
            tracing::warn!("failed to save uploaded file {name}: {e}");
            None
        }
    }
}
