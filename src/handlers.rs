//! Axum handlers for the chat service

use crate::auth::{AuthError, SERVICE_USER, User, bearer_token};
use crate::client::HttpClient;
use crate::errors::ApiError;
use crate::gateway::{StopOutcome, is_valid_task_id, stop_task};
use crate::models::{
    ChatCompletion, ChatRequest, CompletionChoice, CompletionMessage, ConversationDetail,
    ConversationList, CopyResponse, Health, ListModelResponse, ListQuery, StatusResponse,
    StopResponse, TitleUpdate, TokenRequest, UploadResponse, conversation_title,
};
use crate::relay::{RelayRequest, complete_blocking, spawn_relay};
use crate::render::mime_for_filename;
use crate::store::{Conversation, Role, Visibility};
use crate::AppState;
use axum::{
    Json,
    extract::{Multipart, Path, Query, State, rejection::JsonRejection},
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Response},
};
use chrono::Utc;
use serde_json::json;
use tracing::{debug, error, info, instrument, warn};

/// Extensions accepted by the upload endpoint.
pub const ALLOWED_UPLOAD_EXTENSIONS: &[&str] = &[
    "pdf", "docx", "doc", "txt", "jpg", "jpeg", "png", "gif", "xlsx", "xls", "pptx", "ppt",
];

type ApiResult<T> = Result<T, ApiError>;

/// Resolve the caller from the `Authorization` header.
///
/// A token that is sent must be valid. Without one the caller is anonymous, unless the service
/// requires authentication.
async fn caller<T: HttpClient>(state: &AppState<T>, headers: &HeaderMap) -> ApiResult<Option<User>> {
    match bearer_token(headers)? {
        Some(token) => Ok(Some(state.auth.authenticate(token).await?)),
        None if state.settings.require_auth => Err(AuthError::MissingToken.into()),
        None => Ok(None),
    }
}

fn is_service(user: Option<&User>) -> bool {
    user.is_some_and(|u| u.id == SERVICE_USER)
}

/// Ownerless conversations are open to everyone; owned ones to their owner and the service key.
fn visibility(user: Option<&User>) -> Visibility<'_> {
    match user {
        None => Visibility::Ownerless,
        Some(user) if user.id == SERVICE_USER => Visibility::All,
        Some(user) => Visibility::OwnedBy(&user.id),
    }
}

fn can_access(user: Option<&User>, conversation: &Conversation) -> bool {
    visibility(user).admits(conversation)
}

async fn visible_conversation<T: HttpClient>(
    state: &AppState<T>,
    user: Option<&User>,
    id: &str,
) -> ApiResult<Conversation> {
    match state.store.get_conversation(id).await? {
        Some(conversation) if can_access(user, &conversation) => Ok(conversation),
        Some(_) => {
            debug!(conversation_id = %id, "Conversation belongs to another user");
            Err(ApiError::not_found(format!("conversation not found: {id}")))
        }
        None => Err(ApiError::not_found(format!("conversation not found: {id}"))),
    }
}

/// Messages in conversations the caller cannot see answer 404 like missing ones.
async fn visible_message<T: HttpClient>(
    state: &AppState<T>,
    user: Option<&User>,
    message_id: &str,
) -> ApiResult<()> {
    let not_found = || ApiError::not_found(format!("message not found: {message_id}"));
    let conversation_id = state
        .store
        .message_conversation(message_id)
        .await?
        .ok_or_else(not_found)?;
    match state.store.get_conversation(&conversation_id).await? {
        Some(conversation) if can_access(user, &conversation) => Ok(()),
        _ => {
            debug!(message_id = %message_id, "Message is not visible to the caller");
            Err(not_found())
        }
    }
}

/// The chat entry point: persists the question, then streams or returns the answer.
#[instrument(skip(state, headers, payload))]
pub async fn chat<T>(
    State(state): State<AppState<T>>,
    headers: HeaderMap,
    payload: Result<Json<ChatRequest>, JsonRejection>,
) -> ApiResult<Response>
where
    T: HttpClient + Clone + Send + Sync + 'static,
{
    let user = caller(&state, &headers).await?;
    let Json(request) = payload.map_err(|e| {
        warn!(error = %e, "Invalid chat request");
        ApiError::bad_request(e.body_text())
    })?;

    let query = request
        .query()
        .filter(|q| !q.trim().is_empty())
        .ok_or_else(|| ApiError::bad_request("request must contain a user message"))?
        .to_string();

    let conversation_id = match request.conversation_id.as_deref().filter(|id| !id.is_empty()) {
        Some(id) => visible_conversation(&state, user.as_ref(), id).await?.id,
        None => {
            let title = conversation_title(&query);
            let id = state
                .store
                .create_conversation(&title, &request.model, user.as_ref().map(|u| u.id.as_str()))
                .await?;
            info!(conversation_id = %id, title = %title, "Created conversation");
            id
        }
    };

    state
        .store
        .add_message(&conversation_id, Role::User, &query)
        .await?;

    info!(
        conversation_id = %conversation_id,
        model = %request.model,
        stream = request.stream,
        output_format = %request.output_format,
        "Relaying chat request"
    );

    let relay_request = RelayRequest {
        query,
        conversation_id: conversation_id.clone(),
        upstream_conversation_id: request.upstream_conversation_id.clone(),
        output_format: request.output_format,
    };

    if request.stream {
        return Ok(spawn_relay(state.relay_context(), relay_request));
    }

    let answer = complete_blocking(&state.relay_context(), relay_request).await?;
    let completion = ChatCompletion {
        id: answer
            .message_id
            .clone()
            .or(answer.upstream_message_id.clone())
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
        object: "chat.completion".into(),
        created: Utc::now().timestamp(),
        model: request.model,
        choices: vec![CompletionChoice {
            index: 0,
            message: CompletionMessage {
                role: Role::Assistant,
                content: answer.answer,
            },
            finish_reason: "stop".into(),
        }],
        usage: answer.usage.unwrap_or_else(|| json!({})),
        conversation_id,
        upstream_conversation_id: answer.upstream_conversation_id,
        file: answer.file,
    };
    Ok(Json(completion).into_response())
}

/// Best-effort cancellation of a running gateway task.
#[instrument(skip(state, headers))]
pub async fn stop_chat<T: HttpClient>(
    State(state): State<AppState<T>>,
    headers: HeaderMap,
    Path(task_id): Path<String>,
) -> ApiResult<Json<StopResponse>> {
    caller(&state, &headers).await?;
    if !is_valid_task_id(&task_id) {
        return Err(ApiError::bad_request(format!("invalid task id: {task_id}")));
    }

    let outcome = stop_task(&state.http_client, &state.gateway, &task_id)
        .await
        .map_err(|e| {
            error!(error = %e, "Could not build stop request");
            ApiError::internal(e.to_string())
        })?;

    match outcome {
        StopOutcome::Stopped { result, .. } => Ok(Json(StopResponse {
            success: true,
            result,
            message: "response stopped".into(),
        })),
        StopOutcome::Failed {
            last_status,
            last_body,
        } => {
            let status = match last_status {
                Some(status) if !status.is_success() => status,
                _ => StatusCode::BAD_GATEWAY,
            };
            let detail = last_body
                .filter(|b| !b.is_empty())
                .unwrap_or_else(|| "no stop endpoint accepted the request".into());
            Err(ApiError::new(
                status,
                "upstream_error",
                format!("failed to stop task {task_id}: {detail}"),
            ))
        }
    }
}

#[instrument(skip(state, headers))]
pub async fn list_conversations<T: HttpClient>(
    State(state): State<AppState<T>>,
    headers: HeaderMap,
    Query(query): Query<ListQuery>,
) -> ApiResult<Json<ConversationList>> {
    let user = caller(&state, &headers).await?;
    let limit = query.limit.min(ListQuery::MAX_LIMIT);

    let conversations = state
        .store
        .list_conversations(visibility(user.as_ref()), limit, query.offset)
        .await?;

    Ok(Json(ConversationList { conversations }))
}

#[instrument(skip(state, headers))]
pub async fn get_conversation<T: HttpClient>(
    State(state): State<AppState<T>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> ApiResult<Json<ConversationDetail>> {
    let user = caller(&state, &headers).await?;
    let conversation = visible_conversation(&state, user.as_ref(), &id).await?;
    let messages = state.store.get_messages(&id).await?;
    Ok(Json(ConversationDetail {
        conversation,
        messages,
    }))
}

#[instrument(skip(state, headers, payload))]
pub async fn update_conversation<T: HttpClient>(
    State(state): State<AppState<T>>,
    headers: HeaderMap,
    Path(id): Path<String>,
    payload: Result<Json<TitleUpdate>, JsonRejection>,
) -> ApiResult<Json<StatusResponse>> {
    let user = caller(&state, &headers).await?;
    let Json(update) = payload.map_err(|e| ApiError::bad_request(e.body_text()))?;
    let title = update.title.trim();
    if title.is_empty() {
        return Err(ApiError::bad_request("title must not be empty"));
    }

    visible_conversation(&state, user.as_ref(), &id).await?;
    if !state.store.update_conversation_title(&id, title).await? {
        return Err(ApiError::not_found(format!("conversation not found: {id}")));
    }
    info!(conversation_id = %id, title = %title, "Renamed conversation");
    Ok(Json(StatusResponse::success()))
}

#[instrument(skip(state, headers))]
pub async fn delete_conversation<T: HttpClient>(
    State(state): State<AppState<T>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> ApiResult<Json<StatusResponse>> {
    let user = caller(&state, &headers).await?;
    visible_conversation(&state, user.as_ref(), &id).await?;
    if !state.store.delete_conversation(&id).await? {
        return Err(ApiError::not_found(format!("conversation not found: {id}")));
    }
    info!(conversation_id = %id, "Deleted conversation");
    Ok(Json(StatusResponse::success()))
}

/// A bare file name: no separators, no parent references, not hidden.
fn is_safe_filename(filename: &str) -> bool {
    !filename.is_empty()
        && !filename.starts_with('.')
        && !filename.contains(['/', '\\', '\0'])
        && !filename.contains("..")
}

/// Download a document generated from an answer.
#[instrument(skip(state, headers))]
pub async fn download_file<T: HttpClient>(
    State(state): State<AppState<T>>,
    headers: HeaderMap,
    Path(filename): Path<String>,
) -> ApiResult<Response> {
    caller(&state, &headers).await?;
    if !is_safe_filename(&filename) {
        warn!(filename = %filename, "Rejected file path");
        return Err(ApiError::bad_request("invalid file name"));
    }

    let path = state.settings.generated_dir.join(&filename);
    let bytes = match tokio::fs::read(&path).await {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(ApiError::not_found(format!("file not found: {filename}")));
        }
        Err(e) => {
            error!(path = %path.display(), error = %e, "Failed to read generated file");
            return Err(ApiError::internal("failed to read file"));
        }
    };

    Ok((
        [
            (header::CONTENT_TYPE, mime_for_filename(&filename).to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{filename}\""),
            ),
        ],
        bytes,
    )
        .into_response())
}

struct UploadedFile {
    filename: String,
    content_type: Option<String>,
    data: axum::body::Bytes,
}

/// Store an uploaded file and attach it to a message or conversation.
#[instrument(skip(state, headers, multipart))]
pub async fn upload_file<T: HttpClient>(
    State(state): State<AppState<T>>,
    headers: HeaderMap,
    mut multipart: Multipart,
) -> ApiResult<Json<UploadResponse>> {
    let user = caller(&state, &headers).await?;

    let mut file = None;
    let mut message_id = None;
    let mut conversation_id = None;
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::bad_request(format!("invalid multipart body: {e}")))?
    {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "file" => {
                let filename = field
                    .file_name()
                    .map(str::to_owned)
                    .ok_or_else(|| ApiError::bad_request("file field has no file name"))?;
                let content_type = field.content_type().map(str::to_owned);
                let data = field
                    .bytes()
                    .await
                    .map_err(|e| ApiError::bad_request(format!("failed to read upload: {e}")))?;
                file = Some(UploadedFile {
                    filename,
                    content_type,
                    data,
                });
            }
            "message_id" | "conversation_id" => {
                let value = field
                    .text()
                    .await
                    .map_err(|e| ApiError::bad_request(format!("invalid {name} field: {e}")))?;
                let value = Some(value.trim().to_string()).filter(|v| !v.is_empty());
                if name == "message_id" {
                    message_id = value;
                } else {
                    conversation_id = value;
                }
            }
            other => debug!(field = %other, "Ignoring multipart field"),
        }
    }

    let file = file.ok_or_else(|| ApiError::bad_request("missing file field"))?;
    let extension = std::path::Path::new(&file.filename)
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
        .filter(|e| ALLOWED_UPLOAD_EXTENSIONS.contains(&e.as_str()))
        .ok_or_else(|| ApiError::bad_request("unsupported file type"))?;
    if file.data.len() > state.settings.max_upload_bytes {
        return Err(ApiError::bad_request(format!(
            "file exceeds the {} byte limit",
            state.settings.max_upload_bytes
        )));
    }

    // Nothing is written for a target the caller cannot see
    if let Some(message_id) = &message_id {
        visible_message(&state, user.as_ref(), message_id).await?;
    } else if let Some(conversation_id) = &conversation_id {
        visible_conversation(&state, user.as_ref(), conversation_id).await?;
    }

    let file_id = uuid::Uuid::new_v4().to_string();
    let upload_dir = &state.settings.upload_dir;
    let path = upload_dir.join(format!("{file_id}.{extension}"));
    let write = async {
        tokio::fs::create_dir_all(upload_dir).await?;
        tokio::fs::write(&path, &file.data).await
    };
    if let Err(e) = write.await {
        error!(path = %path.display(), error = %e, "Failed to store upload");
        return Err(ApiError::internal("failed to store upload"));
    }

    let mime_type = file
        .content_type
        .clone()
        .unwrap_or_else(|| "application/octet-stream".into());
    let file_path = path.to_string_lossy();

    let attachment_id = match (&message_id, &conversation_id) {
        (Some(message_id), _) => Some(
            state
                .store
                .add_attachment(message_id, &file.filename, &file_path, &mime_type)
                .await?,
        ),
        (None, Some(conversation_id)) => {
            let system_message = state
                .store
                .add_message(
                    conversation_id,
                    Role::System,
                    &format!("Uploaded file: {}", file.filename),
                )
                .await?;
            Some(
                state
                    .store
                    .add_attachment(&system_message, &file.filename, &file_path, &mime_type)
                    .await?,
            )
        }
        (None, None) => None,
    };

    info!(
        file_id = %file_id,
        filename = %file.filename,
        size = file.data.len(),
        attachment_id = ?attachment_id,
        "Stored upload"
    );

    Ok(Json(UploadResponse {
        file_id,
        filename: file.filename,
        size: file.data.len(),
        mime_type,
        uploaded_at: Utc::now(),
        attachment_id,
        message_id,
        conversation_id,
    }))
}

#[instrument(skip(state, headers))]
pub async fn record_copy<T: HttpClient>(
    State(state): State<AppState<T>>,
    headers: HeaderMap,
    Path(message_id): Path<String>,
) -> ApiResult<Json<CopyResponse>> {
    let user = caller(&state, &headers).await?;
    visible_message(&state, user.as_ref(), &message_id).await?;
    let stat = state
        .store
        .record_copy(&message_id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("message not found: {message_id}")))?;
    debug!(message_id = %message_id, copy_count = stat.copy_count, "Recorded copy");
    Ok(Json(CopyResponse { message_id, stat }))
}

#[instrument(skip(state, headers))]
pub async fn copy_stat<T: HttpClient>(
    State(state): State<AppState<T>>,
    headers: HeaderMap,
    Path(message_id): Path<String>,
) -> ApiResult<Json<CopyResponse>> {
    let user = caller(&state, &headers).await?;
    visible_message(&state, user.as_ref(), &message_id).await?;
    let stat = state
        .store
        .copy_stat(&message_id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("message not found: {message_id}")))?;
    Ok(Json(CopyResponse { message_id, stat }))
}

/// Issue a session token for a user. Only callers holding a static API key may do this.
#[instrument(skip(state, headers, payload))]
pub async fn issue_token<T: HttpClient>(
    State(state): State<AppState<T>>,
    headers: HeaderMap,
    payload: Result<Json<TokenRequest>, JsonRejection>,
) -> ApiResult<Response> {
    let user = caller(&state, &headers).await?;
    if user.is_none() {
        return Err(AuthError::MissingToken.into());
    }
    if !is_service(user.as_ref()) {
        return Err(ApiError::forbidden("only service keys may issue tokens"));
    }
    let Json(request) = payload.map_err(|e| ApiError::bad_request(e.body_text()))?;
    if request.user_id.trim().is_empty() || request.user_id == SERVICE_USER {
        return Err(ApiError::bad_request("invalid user id"));
    }

    let issued = state.auth.issue_token(&request.user_id).await?;
    Ok((StatusCode::CREATED, Json(issued)).into_response())
}

#[instrument(skip(state))]
pub async fn models<T: HttpClient>(State(state): State<AppState<T>>) -> impl IntoResponse {
    Json(ListModelResponse::from_names(&state.settings.models))
}

#[instrument(skip(state, headers))]
pub async fn stats<T: HttpClient>(
    State(state): State<AppState<T>>,
    headers: HeaderMap,
) -> ApiResult<impl IntoResponse> {
    caller(&state, &headers).await?;
    Ok(Json(state.store.stats().await?))
}

pub async fn health() -> impl IntoResponse {
    Json(Health {
        status: "ok".into(),
        version: env!("CARGO_PKG_VERSION").into(),
    })
}
