//! Persists shared snippets under unguessable names.

use crate::config::ShareConfig;
use rand::RngCore;
use std::io;
use std::path::PathBuf;
use tracing::info;

/// Random bytes per snippet id.
pub const ID_BYTES: usize = 16;

/// A stored snippet and where to fetch it from.
#[derive(Debug, Clone)]
pub struct Published {
    pub id: String,
    pub path: PathBuf,
    pub url: String,
}

/// 32 hex characters from the OS-seeded thread RNG.
pub fn snippet_id() -> String {
    let mut bytes = [0u8; ID_BYTES];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Store `text` and return its locator.
///
/// The content goes to a hidden temporary name first and is renamed into
/// place, so the public name never refers to a partial file.
pub async fn publish(config: &ShareConfig, text: &str) -> io::Result<Published> {
    tokio::fs::create_dir_all(&config.share_dir).await?;

    let id = snippet_id();
    let filename = if config.extension.is_empty() {
        id.clone()
    } else {
        format!("{}.{}", id, config.extension)
    };
    let path = config.share_dir.join(&filename);
    let staging = config.share_dir.join(format!(".{}.partial", filename));

    if let Err(e) = tokio::fs::write(&staging, text).await {
        let _ = tokio::fs::remove_file(&staging).await;
        return Err(e);
    }
    tokio::fs::rename(&staging, &path).await?;

    let url = format!("{}/{}", config.url_prefix.trim_end_matches('/'), filename);
    info!(bytes = text.len(), path = ?path, "Published snippet");
    Ok(Published { id, path, url })
}

/// Read a published snippet back by file name.
///
/// Names that could escape the share directory or point at a staging file
/// are reported as not found.
pub async fn load(config: &ShareConfig, filename: &str) -> io::Result<String> {
    if !is_snippet_name(filename) {
        return Err(io::Error::new(io::ErrorKind::NotFound, "invalid snippet name"));
    }
    tokio::fs::read_to_string(config.share_dir.join(filename)).await
}

fn is_snippet_name(name: &str) -> bool {
    !name.is_empty()
        && !name.starts_with('.')
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '-' || c == '_')
}
