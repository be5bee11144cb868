use std::path::Path;

use anyhow::Context;

use crate::error::Result;

/// Write a file through a temp sibling plus rename, so readers observe
/// either the previous content or the new content in full.
pub async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("path has no parent: {path:?}"))?;
    let file_name = path
        .file_name()
        .with_context(|| format!("path has no file name: {path:?}"))?
        .to_string_lossy();

    let nonce = format!(
        "{}-{}",
        std::process::id(),
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos()
    );
    let tmp_path = parent.join(format!(".{file_name}.loupe-tmp-{nonce}"));

    tokio::fs::write(&tmp_path, bytes)
        .await
        .with_context(|| format!("failed to write temp file: {tmp_path:?}"))?;

    match tokio::fs::rename(&tmp_path, path).await {
        Ok(()) => Ok(()),
        Err(rename_err) => {
            // Windows refuses to rename over an existing file; retry once
            // after removing the target.
            let _ = tokio::fs::remove_file(path).await;
            match tokio::fs::rename(&tmp_path, path).await {
                Ok(()) => Ok(()),
                Err(err) => {
                    let _ = tokio::fs::remove_file(&tmp_path).await;
                    Err(anyhow::anyhow!(
                        "failed to replace file: {path:?} (rename_err={rename_err}, err={err})"
                    )
                    .into())
                }
            }
        }
    }
}
