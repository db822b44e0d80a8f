use std::path::{Path, PathBuf};

use futures_util::StreamExt;
use tokio::io::AsyncWriteExt;
use tracing::info;

use super::SetupError;

fn file_name(url: &str) -> &str {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    path.rsplit('/').find(|s| !s.is_empty()).unwrap_or("download")
}

/// Downloads `url` into `dir` and returns the local path.
///
/// A file that already exists is reused.
pub async fn download(url: &str, dir: &Path) -> Result<PathBuf, SetupError> {
    let target = dir.join(file_name(url));
    if tokio::fs::try_exists(&target).await? {
        info!(path = %target.display(), "package already downloaded");
        return Ok(target);
    }

    info!(url, "downloading");
    let response = reqwest::get(url).await?;
    if !response.status().is_success() {
        return Err(SetupError::Download {
            url: url.to_string(),
            status: response.status().as_u16(),
        });
    }

    tokio::fs::create_dir_all(dir).await?;

    // Erst nach vollständigem Download umbenennen
    let partial = target.with_extension("part");
    let mut file = tokio::fs::File::create(&partial).await?;
    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        file.write_all(&chunk).await?;
    }
    file.flush().await?;
    drop(file);

    tokio::fs::rename(&partial, &target).await?;
    Ok(target)
}
