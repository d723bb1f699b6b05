//! Output postprocessor.
//!
//! Each file output a worker writes to disk is either PUT to a configured
//! upload URL prefix, or, with no prefix configured, base64 data-URL encoded
//! in place. Content-type detection falls back through extension, then
//! `application/octet-stream`, matching the `mime_guess`-based detection
//! already used for the inline base64 path in `orchestrator::run_event_loop`.

use base64::Engine;

#[derive(Debug, thiserror::Error)]
pub enum UploadError {
    #[error("failed to read output file {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("upload request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("upload to {url} returned status {status}")]
    Status {
        url: String,
        status: reqwest::StatusCode,
    },
}

/// Uploads (or inlines) file outputs a worker wrote to disk.
///
/// Constructed once per orchestrator and shared across predictions - `reqwest::Client`
/// is internally an `Arc` over a connection pool, so cloning it is cheap.
#[derive(Clone)]
pub struct OutputUploader {
    client: reqwest::Client,
    upload_prefix: Option<String>,
}

impl OutputUploader {
    pub fn new(upload_prefix: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            upload_prefix,
        }
    }

    pub fn has_upload_prefix(&self) -> bool {
        self.upload_prefix.is_some()
    }

    /// Resolve content type with the three-tier priority: an explicit type
    /// captured at input-fetch time (when this output is a pass-through of a
    /// previously fetched input file), then extension-guessing, then the
    /// `application/octet-stream` fallback baked into `mime_guess`.
    fn content_type(path: &str, explicit: Option<&str>) -> String {
        if let Some(explicit) = explicit {
            return explicit.to_string();
        }
        mime_guess::from_path(path)
            .first_or_octet_stream()
            .to_string()
    }

    /// Produce the JSON value that should replace a file output in the
    /// prediction response.
    pub async fn process(
        &self,
        path: &str,
        explicit_content_type: Option<&str>,
    ) -> Result<serde_json::Value, UploadError> {
        let bytes = tokio::fs::read(path)
            .await
            .map_err(|source| UploadError::Read {
                path: path.to_string(),
                source,
            })?;
        self.process_bytes(path, bytes, explicit_content_type).await
    }

    /// Same as `process()`, but takes bytes already read from disk (avoids a
    /// second read when the caller already has them in hand).
    pub async fn process_bytes(
        &self,
        path: &str,
        bytes: Vec<u8>,
        explicit_content_type: Option<&str>,
    ) -> Result<serde_json::Value, UploadError> {
        let content_type = Self::content_type(path, explicit_content_type);

        let Some(prefix) = &self.upload_prefix else {
            let encoded = base64::engine::general_purpose::STANDARD.encode(&bytes);
            return Ok(serde_json::Value::String(format!(
                "data:{content_type};base64,{encoded}"
            )));
        };

        let filename = std::path::Path::new(path)
            .file_name()
            .map(|f| f.to_string_lossy().to_string())
            .unwrap_or_else(|| "output".to_string());
        let url = format!("{prefix}{filename}");

        let response = self
            .client
            .put(&url)
            .header(reqwest::header::CONTENT_TYPE, &content_type)
            .body(bytes)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(UploadError::Status {
                url,
                status: response.status(),
            });
        }

        Ok(serde_json::Value::String(url))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn encodes_as_data_url_without_prefix() {
        let uploader = OutputUploader::new(None);
        let result = uploader
            .process_bytes("out.png", b"fake-png-bytes".to_vec(), None)
            .await
            .unwrap();

        let s = result.as_str().unwrap();
        assert!(s.starts_with("data:image/png;base64,"));
    }

    #[tokio::test]
    async fn falls_back_to_octet_stream_for_unknown_extension() {
        let uploader = OutputUploader::new(None);
        let result = uploader
            .process_bytes("out.unknownext", b"bytes".to_vec(), None)
            .await
            .unwrap();

        let s = result.as_str().unwrap();
        assert!(s.starts_with("data:application/octet-stream;base64,"));
    }

    #[tokio::test]
    async fn explicit_content_type_wins_over_extension_guess() {
        let uploader = OutputUploader::new(None);
        let result = uploader
            .process_bytes("out.png", b"not-really-a-png".to_vec(), Some("text/plain"))
            .await
            .unwrap();

        let s = result.as_str().unwrap();
        assert!(s.starts_with("data:text/plain;base64,"));
    }

    #[test]
    fn has_upload_prefix_reflects_config() {
        assert!(!OutputUploader::new(None).has_upload_prefix());
        assert!(OutputUploader::new(Some("https://up.example/".to_string())).has_upload_prefix());
    }
}
