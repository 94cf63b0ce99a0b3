//! Best-effort video thumbnails
//!
//! Extracts the first frame of a video via an ffmpeg subprocess, scaled to
//! a fixed width. Failures never block sending; callers log and continue
//! without a thumbnail.

use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::types::{PosternError, Result};

/// Thumbnail width in pixels; height keeps the aspect ratio
const THUMBNAIL_WIDTH: u32 = 72;

/// Render the first frame of `content` as a JPEG thumbnail
pub async fn video_thumbnail(content: &[u8]) -> Result<Vec<u8>> {
    let mut child = Command::new("ffmpeg")
        .args([
            "-i",
            "pipe:0",
            "-vf",
            &format!("scale={}:-1", THUMBNAIL_WIDTH),
            "-frames:v",
            "1",
            "-f",
            "image2",
            "pipe:1",
        ])
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .map_err(|e| PosternError::Internal(format!("failed to spawn ffmpeg: {}", e)))?;

    // Feed stdin from a task so a full stdout pipe cannot deadlock us
    let mut stdin = child
        .stdin
        .take()
        .ok_or_else(|| PosternError::Internal("ffmpeg stdin unavailable".into()))?;
    let input = content.to_vec();
    let writer = tokio::spawn(async move {
        let _ = stdin.write_all(&input).await;
        let _ = stdin.shutdown().await;
    });

    let output = child
        .wait_with_output()
        .await
        .map_err(|e| PosternError::Internal(format!("ffmpeg failed: {}", e)))?;
    let _ = writer.await;

    if !output.status.success() {
        return Err(PosternError::Internal(format!(
            "ffmpeg exited with {}",
            output.status
        )));
    }
    if output.stdout.is_empty() {
        return Err(PosternError::Internal(
            "no thumbnail data returned".into(),
        ));
    }
    Ok(output.stdout)
}
