//! Media source resolution
//!
//! Media bytes originate either from an inline base64 payload or from an
//! HTTP URL fetch. For URL sources a filename is derived: explicit
//! parameter first, then the last non-empty URL path segment, then the
//! Content-Disposition header. MIME comes from the server's Content-Type
//! or content sniffing.

pub mod thumb;

use base64::Engine;
use tracing::debug;

use crate::types::{PosternError, Result};

/// Media bytes ready for upload, with resolved metadata
#[derive(Debug, Clone)]
pub struct ResolvedMedia {
    pub bytes: Vec<u8>,
    pub mime_type: String,
    pub file_name: Option<String>,
}

/// Decode an inline base64 payload
pub fn from_base64(data: &str, file_name: Option<&str>) -> Result<ResolvedMedia> {
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(data.trim())
        .map_err(|_| PosternError::InvalidRequest("invalid media format".into()))?;
    if bytes.is_empty() {
        return Err(PosternError::InvalidRequest("empty media payload".into()));
    }

    let mime_type = sniff_mime(&bytes).to_string();
    Ok(ResolvedMedia {
        bytes,
        mime_type,
        file_name: file_name.map(str::to_string),
    })
}

/// Fetch media from a URL, deriving filename and MIME type
pub async fn fetch_url(
    client: &reqwest::Client,
    url: &str,
    explicit_name: Option<&str>,
) -> Result<ResolvedMedia> {
    let response = client
        .get(url)
        .send()
        .await
        .map_err(|e| PosternError::Fetch(format!("failed to download media from URL: {}", e)))?;

    if !response.status().is_success() {
        return Err(PosternError::Fetch(format!(
            "failed to download media: HTTP {}",
            response.status()
        )));
    }

    let header_mime = response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.split(';').next().unwrap_or(v).trim().to_string())
        .filter(|v| !v.is_empty());

    let disposition = response
        .headers()
        .get(reqwest::header::CONTENT_DISPOSITION)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    let bytes = response
        .bytes()
        .await
        .map_err(|e| PosternError::Fetch(format!("failed to download media: {}", e)))?
        .to_vec();
    if bytes.is_empty() {
        return Err(PosternError::Fetch("downloaded media is empty".into()));
    }

    // Filename preference: explicit, then URL path, then Content-Disposition
    let file_name = explicit_name
        .map(str::to_string)
        .or_else(|| file_name_from_url(url))
        .or_else(|| disposition.as_deref().and_then(file_name_from_disposition));
    if let Some(ref name) = file_name {
        debug!("Resolved media filename: {}", name);
    }

    let mime_type = header_mime.unwrap_or_else(|| sniff_mime(&bytes).to_string());
    Ok(ResolvedMedia {
        bytes,
        mime_type,
        file_name,
    })
}

/// Last non-empty path segment of the URL, query stripped
fn file_name_from_url(url: &str) -> Option<String> {
    let parsed = reqwest::Url::parse(url).ok()?;
    let name = parsed
        .path_segments()?
        .filter(|s| !s.is_empty())
        .next_back()?
        .to_string();
    if name.is_empty() {
        None
    } else {
        Some(name)
    }
}

/// `filename=` parameter of a Content-Disposition header
fn file_name_from_disposition(header: &str) -> Option<String> {
    for part in header.split(';') {
        let part = part.trim();
        let Some(value) = part.strip_prefix("filename=") else {
            continue;
        };
        let value = value.trim().trim_matches('"');
        if !value.is_empty() {
            return Some(value.to_string());
        }
    }
    None
}

/// Identify common media types by magic numbers
pub fn sniff_mime(bytes: &[u8]) -> &'static str {
    if bytes.starts_with(&[0xFF, 0xD8, 0xFF]) {
        "image/jpeg"
    } else if bytes.starts_with(&[0x89, b'P', b'N', b'G']) {
        "image/png"
    } else if bytes.starts_with(b"GIF8") {
        "image/gif"
    } else if bytes.len() >= 12 && &bytes[0..4] == b"RIFF" && &bytes[8..12] == b"WEBP" {
        "image/webp"
    } else if bytes.len() >= 12 && &bytes[4..8] == b"ftyp" {
        "video/mp4"
    } else if bytes.starts_with(&[0x1A, 0x45, 0xDF, 0xA3]) {
        "video/webm"
    } else if bytes.starts_with(b"%PDF") {
        "application/pdf"
    } else if bytes.starts_with(&[b'P', b'K', 0x03, 0x04]) {
        "application/zip"
    } else if bytes.starts_with(b"ID3") || bytes.starts_with(&[0xFF, 0xFB]) {
        "audio/mpeg"
    } else if bytes.starts_with(b"OggS") {
        "audio/ogg"
    } else {
        "application/octet-stream"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base64_decodes_and_sniffs() {
        let png = [0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A, 1, 2, 3];
        let encoded = base64::engine::general_purpose::STANDARD.encode(png);

        let media = from_base64(&encoded, None).unwrap();
        assert_eq!(media.mime_type, "image/png");
        assert_eq!(media.bytes.len(), png.len());
        assert!(media.file_name.is_none());
    }

    #[test]
    fn test_base64_rejects_garbage() {
        assert!(matches!(
            from_base64("not&&base64!!", None).unwrap_err(),
            PosternError::InvalidRequest(_)
        ));
    }

    #[test]
    fn test_file_name_from_url_strips_query() {
        assert_eq!(
            file_name_from_url("https://cdn.example.com/files/report.pdf?sig=abc").as_deref(),
            Some("report.pdf")
        );
        assert_eq!(
            file_name_from_url("https://example.com/a/b/photo.jpg").as_deref(),
            Some("photo.jpg")
        );
        // Trailing slash: no usable segment
        assert_eq!(file_name_from_url("https://example.com/dir/"), None);
        assert_eq!(file_name_from_url("https://example.com"), None);
    }

    #[test]
    fn test_file_name_from_disposition() {
        assert_eq!(
            file_name_from_disposition("attachment; filename=\"invoice.pdf\"").as_deref(),
            Some("invoice.pdf")
        );
        assert_eq!(
            file_name_from_disposition("attachment; filename=plain.txt").as_deref(),
            Some("plain.txt")
        );
        assert_eq!(file_name_from_disposition("inline"), None);
    }

    #[test]
    fn test_sniff_common_types() {
        assert_eq!(sniff_mime(&[0xFF, 0xD8, 0xFF, 0xE0]), "image/jpeg");
        assert_eq!(sniff_mime(b"GIF89a..."), "image/gif");
        assert_eq!(sniff_mime(b"%PDF-1.7"), "application/pdf");
        assert_eq!(
            sniff_mime(&[0, 0, 0, 0x18, b'f', b't', b'y', b'p', b'm', b'p', b'4', b'2']),
            "video/mp4"
        );
        assert_eq!(sniff_mime(b"hello world"), "application/octet-stream");
        assert_eq!(sniff_mime(&[]), "application/octet-stream");
    }
}
