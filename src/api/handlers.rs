use actix_multipart::Multipart;
use actix_web::http::header::{ContentDisposition, DispositionParam, DispositionType};
use actix_web::{web, HttpResponse};
use futures::TryStreamExt;
use serde_json::json;
use std::io;
use tracing::{error, info, warn};

use crate::api::recordings::{RecordingStore, StagedRecording};
use crate::db::AttachOutcome;
use crate::error::AppError;
use crate::{AppState, Result};

/// Longest `callId` accepted from a form field.
const MAX_CALL_ID_LEN: usize = 256;

/// `POST /api/upload`: store the recording of a call.
///
/// Multipart form with a `callId` text field and an `audio` file field, in
/// any order. The first upload for a call wins; later ones get 409 and the
/// stored file is left untouched.
pub async fn upload(state: web::Data<AppState>, mut payload: Multipart) -> Result<HttpResponse> {
    let mut call_id: Option<String> = None;
    let mut audio: Option<StagedRecording> = None;

    while let Some(mut field) = payload.try_next().await? {
        let name = field.content_disposition().get_name().map(str::to_owned);
        match name.as_deref() {
            Some("callId") => {
                let mut raw = Vec::new();
                while let Some(chunk) = field.try_next().await? {
                    if raw.len() + chunk.len() > MAX_CALL_ID_LEN {
                        return Err(AppError::ValidationError("callId is too long".to_string()));
                    }
                    raw.extend_from_slice(&chunk);
                }
                let value = String::from_utf8(raw)
                    .map_err(|_| AppError::ValidationError("callId is not UTF-8".to_string()))?;
                call_id = Some(value.trim().to_string());
            }
            Some("audio") => {
                let mut staged = state.recordings.stage().await?;
                while let Some(chunk) = field.try_next().await? {
                    staged.write_chunk(&chunk).await?;
                }
                audio = Some(staged);
            }
            _ => {
                // Unknown fields are read and ignored.
                while field.try_next().await?.is_some() {}
            }
        }
    }

    let call_id = call_id.ok_or_else(|| AppError::ValidationError("Missing callId".to_string()))?;
    let file_name = RecordingStore::file_name(&call_id)?;
    let staged = audio
        .filter(|staged| !staged.is_empty())
        .ok_or_else(|| AppError::ValidationError("Missing audio file".to_string()))?;
    let dest = state.recordings.resolve(&file_name)?;
    let audio_url = RecordingStore::download_url(&file_name);

    match state.store.attach_recording(&call_id, &audio_url).await? {
        AttachOutcome::Attached => {
            let size = staged.persist(&dest).await.map_err(|e| {
                error!(call_id = %call_id, "Recording claimed but not stored: {}", e);
                e
            })?;
            info!(call_id = %call_id, size, "Recording stored");
            Ok(HttpResponse::Ok().json(json!({
                "message": "Recording uploaded",
                "filename": file_name,
                "size": size,
            })))
        }
        AttachOutcome::AlreadyRecorded(existing) => {
            warn!(call_id = %call_id, existing = %existing, "Call already has a recording, upload discarded");
            Ok(HttpResponse::Conflict().json(json!({
                "message": "Call already has a recording",
                "existing_file": existing,
            })))
        }
    }
}

/// `GET /api/history`: every call record, newest first.
pub async fn history(state: web::Data<AppState>) -> Result<HttpResponse> {
    let calls = state.store.list_calls().await?;
    Ok(HttpResponse::Ok().json(calls))
}

/// `GET /api/downloads/{file}`: serve a stored recording as an attachment.
pub async fn download(state: web::Data<AppState>, file: web::Path<String>) -> Result<HttpResponse> {
    let file_name = file.into_inner();
    let path = state.recordings.resolve(&file_name)?;

    let bytes = match tokio::fs::read(&path).await {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            return Err(AppError::NotFound(file_name));
        }
        Err(e) => return Err(e.into()),
    };

    Ok(HttpResponse::Ok()
        .content_type("audio/wav")
        .insert_header(ContentDisposition {
            disposition: DispositionType::Attachment,
            parameters: vec![DispositionParam::Filename(file_name)],
        })
        .body(bytes))
}
