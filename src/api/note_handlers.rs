//! API handlers for notes

use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::StatusCode,
    Json,
};
use tracing::debug;

use super::handlers::AppError;
use crate::notes::{CreateNoteRequest, Note};
use crate::store::NoteStore;
use crate::AppState;

/// Create a note. The pipeline picks it up from the change log.
pub async fn create_note(
    State(state): State<AppState>,
    body: Result<Json<CreateNoteRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<Note>), AppError> {
    let Json(req) = body.map_err(|e| AppError::BadRequest(e.body_text()))?;
    let note = req.into_note()?;
    state.store.put(&note).await?;
    debug!(note_id = %note.id, "Note created");
    Ok((StatusCode::CREATED, Json(note)))
}

/// List every note
pub async fn list_notes(State(state): State<AppState>) -> Result<Json<Vec<Note>>, AppError> {
    Ok(Json(state.store.scan_all().await?))
}

pub async fn get_note(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Note>, AppError> {
    state
        .store
        .get(&id)
        .await?
        .map(Json)
        .ok_or_else(|| AppError::NotFound("Note not found".into()))
}
