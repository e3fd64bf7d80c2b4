//! Input resolution: turn a user-supplied path or URL into a [`Document`].
//!
//! The whole file is read into memory because storage takes a single
//! multipart POST and the upload size guard needs the length up front.
//! Content is checked against the declared kind (`%PDF` for PDF, a zip
//! header for DOCX) before anything is uploaded, so a mislabelled file
//! fails locally with a clear message instead of at the parse endpoint.

use crate::error::PipelineError;
use crate::remote::{Document, FileKind};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

const PDF_MAGIC: &[u8] = b"%PDF";
const ZIP_MAGIC: &[u8] = b"PK\x03\x04";

/// Check if the input string looks like a URL.
pub fn is_url(input: &str) -> bool {
    input.starts_with("http://") || input.starts_with("https://")
}

/// Resolve `input` (local path or HTTP(S) URL) to a validated document.
///
/// The kind comes from `kind` when given, otherwise from the file
/// extension.
pub async fn resolve_document(
    input: &str,
    kind: Option<FileKind>,
    download_timeout_secs: u64,
) -> Result<Document, PipelineError> {
    let (name, bytes) = if is_url(input) {
        download_url(input, download_timeout_secs).await?
    } else {
        read_local(input).await?
    };

    let kind = match kind {
        Some(kind) => kind,
        None => kind_from_name(&name).ok_or_else(|| PipelineError::InvalidInput {
            input: input.to_string(),
            reason: "cannot tell the file type from its extension \
                     (expected pdf, docx, doc, txt or md)"
                .into(),
        })?,
    };

    let document = Document::new(name, kind, bytes);
    validate(input, &document)?;
    debug!(
        "Resolved {} as {} ({} bytes)",
        input,
        kind.extension(),
        document.len()
    );
    Ok(document)
}

/// Reject empty documents and content that does not match its kind.
pub fn validate(input: &str, document: &Document) -> Result<(), PipelineError> {
    let invalid = |reason: String| PipelineError::InvalidInput {
        input: input.to_string(),
        reason,
    };

    if document.is_empty() {
        return Err(invalid("document is empty".into()));
    }
    let expected = match document.kind {
        FileKind::Pdf => Some(PDF_MAGIC),
        FileKind::Docx => Some(ZIP_MAGIC),
        FileKind::Doc | FileKind::Txt => None,
    };
    if let Some(magic) = expected {
        if !document.bytes.starts_with(magic) {
            let head = &document.bytes[..document.len().min(magic.len())];
            return Err(invalid(format!(
                "not a valid {} file (starts with {:?})",
                document.kind.extension(),
                String::from_utf8_lossy(head)
            )));
        }
    }
    if document.kind == FileKind::Txt && std::str::from_utf8(&document.bytes).is_err() {
        return Err(invalid("text input is not valid UTF-8".into()));
    }
    Ok(())
}

fn kind_from_name(name: &str) -> Option<FileKind> {
    Path::new(name)
        .extension()
        .and_then(|ext| ext.to_str())
        .and_then(FileKind::from_extension)
}

async fn read_local(path_str: &str) -> Result<(String, Vec<u8>), PipelineError> {
    let path = PathBuf::from(path_str);

    let bytes = match tokio::fs::read(&path).await {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => {
            return Err(PipelineError::PermissionDenied { path });
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(PipelineError::FileNotFound { path });
        }
        Err(e) => {
            return Err(PipelineError::InvalidInput {
                input: path_str.to_string(),
                reason: e.to_string(),
            });
        }
    };

    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path_str.to_string());
    Ok((name, bytes))
}

async fn download_url(url: &str, timeout_secs: u64) -> Result<(String, Vec<u8>), PipelineError> {
    info!("Downloading document from: {}", url);
    let failed = |reason: String| PipelineError::DownloadFailed {
        url: url.to_string(),
        reason,
    };

    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(timeout_secs))
        .build()
        .map_err(|e| failed(e.to_string()))?;

    let response = client.get(url).send().await.map_err(|e| {
        if e.is_timeout() {
            failed(format!("timed out after {timeout_secs}s"))
        } else {
            failed(e.to_string())
        }
    })?;

    if !response.status().is_success() {
        return Err(failed(format!("HTTP {}", response.status())));
    }

    let bytes = response
        .bytes()
        .await
        .map_err(|e| failed(e.to_string()))?;

    let name = filename_from_url(url);
    info!("Downloaded {} ({} bytes)", name, bytes.len());
    Ok((name, bytes.to_vec()))
}

/// Last path segment of the URL if it looks like a file name.
fn filename_from_url(url: &str) -> String {
    if let Ok(parsed) = reqwest::Url::parse(url) {
        if let Some(mut segments) = parsed.path_segments() {
            if let Some(last) = segments.next_back() {
                if !last.is_empty() && last.contains('.') {
                    return last.to_string();
                }
            }
        }
    }
    "downloaded.pdf".to_string()
}
