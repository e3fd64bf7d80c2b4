//! [`RemoteJobClient`] over HTTP.
//!
//! JSON endpoints answer with an envelope `{code, message, data}`; `code`
//! 200 (or 0) means success. The storage upload is a signed multipart POST
//! straight to the object store, judged only by its status code.
//!
//! 5xx answers and connection failures become [`PipelineError::Transport`]
//! (retryable while polling); 4xx answers and non-success envelope codes
//! become [`PipelineError::RemoteRejected`].

use super::{
    Document, FileKind, JobId, JobKind, JobSubmission, RemoteJobClient, StatusRecord, TaskId,
    UploadReceipt, UploadTicket,
};
use crate::config::{PipelineConfig, SessionContext};
use crate::error::PipelineError;
use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, info};

/// Production job client.
pub struct HttpJobClient {
    http: reqwest::Client,
    upload_http: reqwest::Client,
    config: PipelineConfig,
    session: SessionContext,
}

impl HttpJobClient {
    pub fn new(config: &PipelineConfig, session: SessionContext) -> Result<Self, PipelineError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| PipelineError::Internal(format!("http client: {e}")))?;
        let upload_http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.upload_timeout_secs))
            .build()
            .map_err(|e| PipelineError::Internal(format!("upload client: {e}")))?;

        Ok(Self {
            http,
            upload_http,
            config: config.clone(),
            session,
        })
    }

    /// POST `body` as JSON to `path` and unwrap the envelope's `data`.
    async fn post_json<B, T>(&self, operation: &str, path: &str, body: &B) -> Result<T, PipelineError>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let url = self.config.endpoint(path);
        debug!(operation, %url, "POST");

        let mut request = self.http.post(&url).json(body);
        if let Some(token) = self.session.token.token() {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .map_err(|e| PipelineError::transport(operation, e))?;

        let status = response.status();
        let bytes = response
            .bytes()
            .await
            .map_err(|e| PipelineError::transport(operation, e))?;

        if status.is_server_error() {
            return Err(PipelineError::transport(
                operation,
                format!("HTTP {status}"),
            ));
        }
        if !status.is_success() {
            return Err(PipelineError::RemoteRejected {
                operation: operation.to_string(),
                code: i64::from(status.as_u16()),
                message: String::from_utf8_lossy(&bytes).into_owned(),
            });
        }

        decode_envelope(operation, &bytes)
    }
}

// ── Envelope ─────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    code: i64,
    #[serde(default, alias = "msg")]
    message: String,
    data: Option<T>,
}

fn decode_envelope<T: DeserializeOwned>(operation: &str, bytes: &[u8]) -> Result<T, PipelineError> {
    let envelope: Envelope<T> =
        serde_json::from_slice(bytes).map_err(|e| PipelineError::malformed(operation, e))?;

    if envelope.code != 200 && envelope.code != 0 {
        return Err(PipelineError::RemoteRejected {
            operation: operation.to_string(),
            code: envelope.code,
            message: envelope.message,
        });
    }

    envelope
        .data
        .ok_or_else(|| PipelineError::malformed(operation, "envelope has no data"))
}

// ── Request / response bodies ────────────────────────────────────────────

#[derive(Serialize)]
struct SignatureRequest<'a> {
    file_name: &'a str,
    file_kind: FileKind,
}

#[derive(Serialize)]
struct ParseRequest<'a> {
    task_id: &'a TaskId,
    file_kind: FileKind,
}

#[derive(Debug, Deserialize)]
struct ParseData {
    word_count: i64,
}

#[derive(Serialize)]
struct SubmitRequest<'a> {
    task_id: &'a TaskId,
    user_id: &'a str,
    word_count: u64,
    metadata: &'a super::JobMetadata,
}

#[derive(Deserialize)]
struct SubmitData {
    job_id: JobId,
}

#[derive(Serialize)]
struct StatusRequest<'a> {
    job_ids: &'a [JobId],
}

#[derive(Deserialize)]
struct StatusData {
    #[serde(default)]
    records: Vec<StatusRecord>,
}

#[async_trait]
impl RemoteJobClient for HttpJobClient {
    async fn issue_upload_credentials(
        &self,
        document: &Document,
    ) -> Result<UploadTicket, PipelineError> {
        let ticket: UploadTicket = self
            .post_json(
                "upload signature",
                "/api/upload/signature",
                &SignatureRequest {
                    file_name: &document.name,
                    file_kind: document.kind,
                },
            )
            .await?;

        if ticket.task_id.0.is_empty() {
            return Err(PipelineError::malformed("upload signature", "empty task_id"));
        }
        info!(task_id = %ticket.task_id, host = %ticket.host, "Upload credentials issued");
        Ok(ticket)
    }

    async fn upload_bytes(
        &self,
        ticket: &UploadTicket,
        document: &Document,
    ) -> Result<UploadReceipt, PipelineError> {
        let mut form = Form::new();
        for (name, value) in &ticket.fields {
            form = form.text(name.clone(), value.clone());
        }
        form = form.text("key", ticket.key.clone());
        if !ticket.fields.contains_key("success_action_status") {
            form = form.text(
                "success_action_status",
                self.config.upload_success_status.to_string(),
            );
        }

        // Storage requires the file part to come last.
        let part = Part::bytes(document.bytes.clone())
            .file_name(document.name.clone())
            .mime_str(document.kind.content_type())
            .map_err(|e| PipelineError::Internal(format!("upload mime type: {e}")))?;
        form = form.part("file", part);

        let response = self
            .upload_http
            .post(&ticket.host)
            .multipart(form)
            .send()
            .await
            .map_err(|e| PipelineError::transport("upload", e))?;

        let status = response.status().as_u16();
        let accepted = status == self.config.upload_success_status;
        debug!(task_id = %ticket.task_id, status, accepted, "Storage answered upload");
        Ok(UploadReceipt { status, accepted })
    }

    async fn parse(&self, task_id: &TaskId, kind: FileKind) -> Result<u64, PipelineError> {
        let data: ParseData = self
            .post_json(
                "parse",
                "/api/parse",
                &ParseRequest {
                    task_id,
                    file_kind: kind,
                },
            )
            .await?;

        u64::try_from(data.word_count).map_err(|_| {
            PipelineError::malformed("parse", format!("negative word count {}", data.word_count))
        })
    }

    async fn submit_job(
        &self,
        kind: JobKind,
        submission: &JobSubmission,
    ) -> Result<JobId, PipelineError> {
        let operation = format!("{kind} submit");
        let data: SubmitData = self
            .post_json(
                &operation,
                &format!("/api/{}/submit", kind.path()),
                &SubmitRequest {
                    task_id: &submission.task_id,
                    user_id: &self.session.user_id,
                    word_count: submission.word_count,
                    metadata: &submission.metadata,
                },
            )
            .await?;

        if data.job_id.0.is_empty() {
            return Err(PipelineError::malformed(operation, "empty job_id"));
        }
        Ok(data.job_id)
    }

    async fn query_status(
        &self,
        kind: JobKind,
        job_ids: &[JobId],
    ) -> Result<HashMap<JobId, StatusRecord>, PipelineError> {
        let data: StatusData = self
            .post_json(
                &format!("{kind} status"),
                &format!("/api/{}/status", kind.path()),
                &StatusRequest { job_ids },
            )
            .await?;

        Ok(data
            .records
            .into_iter()
            .map(|record| (record.job_id.clone(), record))
            .collect())
    }
}
