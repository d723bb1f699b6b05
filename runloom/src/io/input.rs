//! Input preprocessor.
//!
//! File-like inputs arrive as either an HTTP/HTTPS URL or a base64 `data:`
//! URI. Both get downloaded/decoded to a local temp file before the worker
//! ever sees them - the worker only ever opens local paths.

use std::path::PathBuf;

use base64::Engine;

#[derive(Debug, thiserror::Error)]
pub enum InputFetchError {
    #[error("failed to download {url}: {source}")]
    Download { url: String, source: reqwest::Error },
    #[error("download of {url} returned status {status}")]
    Status {
        url: String,
        status: reqwest::StatusCode,
    },
    #[error("failed to write temp file: {0}")]
    Write(#[from] std::io::Error),
    #[error("malformed data URI")]
    InvalidDataUri,
    #[error("invalid base64 payload: {0}")]
    Base64(#[from] base64::DecodeError),
}

/// A file-like input materialized to disk, with the content type captured
/// at fetch time - the extension/octet-stream fallbacks only apply later,
/// at output time.
#[derive(Debug, Clone)]
pub struct FetchedInput {
    pub path: PathBuf,
    pub content_type: Option<String>,
}

/// Downloads or decodes file-like prediction inputs into `working_directory`.
#[derive(Clone)]
pub struct InputFetcher {
    client: reqwest::Client,
    working_directory: PathBuf,
}

impl InputFetcher {
    pub fn new(working_directory: PathBuf) -> Self {
        Self {
            client: reqwest::Client::new(),
            working_directory,
        }
    }

    /// Resolve a field value into a local file, if it looks like one of the
    /// two file-input encodings. Returns `None` for anything else (scalars
    /// the worker already understands natively) - the caller passes those
    /// through unchanged.
    pub async fn fetch_value(&self, value: &str) -> Result<Option<FetchedInput>, InputFetchError> {
        if let Some(uri) = value.strip_prefix("data:") {
            let (bytes, content_type) = decode_data_uri(uri)?;
            let extension = content_type.as_deref().and_then(guess_extension);
            let path = self.write_temp_file(&bytes, extension).await?;
            return Ok(Some(FetchedInput { path, content_type }));
        }

        if value.starts_with("http://") || value.starts_with("https://") {
            return self.download(value).await.map(Some);
        }

        Ok(None)
    }

    async fn download(&self, url: &str) -> Result<FetchedInput, InputFetchError> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|source| InputFetchError::Download {
                url: url.to_string(),
                source,
            })?;

        if !response.status().is_success() {
            return Err(InputFetchError::Status {
                url: url.to_string(),
                status: response.status(),
            });
        }

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        let bytes = response
            .bytes()
            .await
            .map_err(|source| InputFetchError::Download {
                url: url.to_string(),
                source,
            })?;

        let path = self.write_temp_file(&bytes, None).await?;
        Ok(FetchedInput { path, content_type })
    }

    async fn write_temp_file(
        &self,
        bytes: &[u8],
        extension: Option<&str>,
    ) -> Result<PathBuf, std::io::Error> {
        tokio::fs::create_dir_all(&self.working_directory).await?;
        let filename = match extension {
            Some(ext) => format!("input-{}.{ext}", uuid::Uuid::new_v4()),
            None => format!("input-{}", uuid::Uuid::new_v4()),
        };
        let path = self.working_directory.join(filename);
        tokio::fs::write(&path, bytes).await?;
        Ok(path)
    }
}

/// Guess a filename extension from a `data:` URI's declared media type, so
/// the temp file a worker opens carries a hint about its own content - a
/// worker that branches on `Path.suffix` (image vs. audio vs. video) only
/// works if the path looks the part.
fn guess_extension(content_type: &str) -> Option<&'static str> {
    mime_guess::get_mime_extensions_str(content_type)
        .and_then(|exts| exts.first())
        .copied()
}

/// Split a `data:` URI (minus the `data:` prefix) into decoded bytes and an
/// optional media type.
fn decode_data_uri(uri: &str) -> Result<(Vec<u8>, Option<String>), InputFetchError> {
    let (header, data) = uri.split_once(',').ok_or(InputFetchError::InvalidDataUri)?;
    let is_base64 = header.ends_with(";base64");
    let media_type = header.trim_end_matches(";base64").trim().to_string();

    let bytes = if is_base64 {
        base64::engine::general_purpose::STANDARD.decode(data)?
    } else {
        urlencoding_decode(data).into_bytes()
    };

    let content_type = if media_type.is_empty() {
        None
    } else {
        Some(media_type)
    };

    Ok((bytes, content_type))
}

/// Minimal percent-decoding for non-base64 data URIs (`data:,hello%20world`).
/// Most real-world file inputs are base64; this covers the plain-text case
/// without pulling in a URL-encoding dependency.
fn urlencoding_decode(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            if let Ok(byte) = u8::from_str_radix(&s[i + 1..i + 3], 16) {
                out.push(byte);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}
