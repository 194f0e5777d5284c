//! 下载令牌、文件读取、上传与删除处理器。

use axum::extract::{Extension, Form, FromRequest, Json, Multipart, Path, Query, Request};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Json as JsonResponse, Response};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::debug;

use crate::error::ApiError;
use crate::http::Requester;
use crate::provider::{
    DirectReadRequest, DownloadRequest, FileProvider, FileResponse, FileSelector, StoredUpload,
};

/// `POST /download` 参数，接受 JSON 或表单编码。
#[derive(Debug, Default, Deserialize)]
pub(crate) struct DownloadParams {
    path: Option<String>,
    database_id: Option<String>,
    record_id: Option<String>,
    file_uuid: Option<String>,
    content_type: Option<String>,
}

impl<S: Send + Sync> FromRequest<S> for DownloadParams {
    type Rejection = ApiError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let is_json = req
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .is_some_and(|value| value.starts_with("application/json"));
        if is_json {
            let Json(params) = Json::<DownloadParams>::from_request(req, state)
                .await
                .map_err(|err| ApiError::BadRequest(err.body_text()))?;
            Ok(params)
        } else {
            let Form(params) = Form::<DownloadParams>::from_request(req, state)
                .await
                .map_err(|err| ApiError::BadRequest(err.body_text()))?;
            Ok(params)
        }
    }
}

#[derive(Debug, Serialize)]
pub(crate) struct TokenResponse {
    token: String,
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct FileQuery {
    path: Option<String>,
    database_id: Option<String>,
    record_id: Option<String>,
    content_type: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct UploadQuery {
    database_id: Option<String>,
    record_id: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct DeleteQuery {
    path: Option<String>,
    database_id: Option<String>,
    file_uuid: Option<String>,
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|value| !value.trim().is_empty())
}

/// `database_id + file_uuid` 优先，其次是直接路径。
fn selector_from(
    path: Option<String>,
    database_id: Option<String>,
    file_uuid: Option<String>,
) -> Result<FileSelector, ApiError> {
    match (non_empty(file_uuid), non_empty(database_id), non_empty(path)) {
        (Some(file_uuid), Some(database_id), _) => Ok(FileSelector::Stored {
            database_id,
            file_uuid,
        }),
        (None, database_id, Some(path)) => Ok(FileSelector::Path { path, database_id }),
        _ => Err(ApiError::BadRequest(
            "Param file_uuid and database_id must be specified.".into(),
        )),
    }
}

fn range_header(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::RANGE)
        .and_then(|value| value.to_str().ok())
}

/// 签发下载令牌。
pub async fn request_download_token(
    headers: HeaderMap,
    Extension(provider): Extension<Arc<FileProvider>>,
    params: DownloadParams,
) -> Result<JsonResponse<TokenResponse>, ApiError> {
    let selector = selector_from(params.path, params.database_id, params.file_uuid)?;
    let request = DownloadRequest {
        selector,
        record_id: non_empty(params.record_id),
        content_type: non_empty(params.content_type),
    };
    let token = provider
        .issue_download_token(request, &Requester::from_headers(&headers))
        .await?;
    Ok(JsonResponse(TokenResponse { token }))
}

/// 按令牌下载文件，支持 Range 请求。
pub async fn download_file(
    Path(token): Path<String>,
    headers: HeaderMap,
    Extension(provider): Extension<Arc<FileProvider>>,
) -> Result<FileResponse, ApiError> {
    Ok(provider.retrieve(&token, range_header(&headers)).await?)
}

/// 校验 `file:read` 权限后直接读取文件。
pub async fn get_file(
    Query(query): Query<FileQuery>,
    headers: HeaderMap,
    Extension(provider): Extension<Arc<FileProvider>>,
) -> Result<FileResponse, ApiError> {
    let path = non_empty(query.path)
        .ok_or_else(|| ApiError::BadRequest("Param path must be specified.".into()))?;
    let request = DirectReadRequest {
        path,
        database_id: non_empty(query.database_id),
        record_id: non_empty(query.record_id),
        content_type: non_empty(query.content_type),
    };
    Ok(provider
        .fetch_direct(
            request,
            &Requester::from_headers(&headers),
            range_header(&headers),
        )
        .await?)
}

/// 接收 multipart 上传：`file` 为文件内容，可选 `metadata` 为 JSON 对象。
pub async fn upload_file(
    Query(query): Query<UploadQuery>,
    headers: HeaderMap,
    Extension(provider): Extension<Arc<FileProvider>>,
    mut multipart: Multipart,
) -> Result<Response, ApiError> {
    let requester = Requester::from_headers(&headers);
    let database_id = query.database_id.unwrap_or_default();
    let record_id = query.record_id.unwrap_or_default();

    let mut stored = None;
    let received = receive_parts(
        &provider,
        &database_id,
        &record_id,
        &mut multipart,
        &requester,
        &mut stored,
    )
    .await;
    let (metadata, stored) = match (received, stored) {
        (Ok(metadata), Some(stored)) => (metadata, stored),
        (Ok(_), None) => {
            return Err(ApiError::BadRequest("Field file must be specified.".into()));
        }
        (Err(err), stored) => {
            if let Some(stored) = stored {
                provider.discard_upload(stored).await;
            }
            return Err(err);
        }
    };

    let outcome = match provider.register_upload(&stored, metadata, &requester).await {
        Ok(outcome) => outcome,
        Err(err) => {
            provider.discard_upload(stored).await;
            return Err(err.into());
        }
    };
    if !outcome.status.is_success() {
        provider.discard_upload(stored).await;
        return Ok((outcome.status, JsonResponse(Value::Object(outcome.body))).into_response());
    }

    let mut body = Map::new();
    body.insert("save_file_path".into(), Value::from(outcome.save_file_path));
    body.extend(outcome.body);
    Ok((outcome.status, JsonResponse(Value::Object(body))).into_response())
}

async fn receive_parts(
    provider: &FileProvider,
    database_id: &str,
    record_id: &str,
    multipart: &mut Multipart,
    requester: &Requester,
    stored: &mut Option<StoredUpload>,
) -> Result<Map<String, Value>, ApiError> {
    let mut metadata = Map::new();
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|err| ApiError::BadRequest(err.body_text()))?
    {
        let name = field.name().map(str::to_string);
        match name.as_deref() {
            Some("file") => {
                if stored.is_some() {
                    return Err(ApiError::BadRequest("Only one file may be uploaded.".into()));
                }
                let file_name = field
                    .file_name()
                    .map(str::to_string)
                    .ok_or_else(|| ApiError::BadRequest("File name must be specified.".into()))?;
                *stored = Some(
                    provider
                        .receive_upload(database_id, record_id, &file_name, field, requester)
                        .await?,
                );
            }
            Some("metadata") => {
                let text = field
                    .text()
                    .await
                    .map_err(|err| ApiError::BadRequest(err.body_text()))?;
                metadata = match serde_json::from_str::<Value>(&text) {
                    Ok(Value::Object(map)) => map,
                    Ok(_) | Err(_) => {
                        return Err(ApiError::BadRequest(
                            "Field metadata must be a JSON object.".into(),
                        ));
                    }
                };
            }
            other => debug!(field = ?other, "ignoring multipart field"),
        }
    }
    Ok(metadata)
}

/// 删除上传目录内的文件。
pub async fn delete_file(
    Query(query): Query<DeleteQuery>,
    headers: HeaderMap,
    Extension(provider): Extension<Arc<FileProvider>>,
) -> Result<StatusCode, ApiError> {
    let selector = selector_from(query.path, query.database_id, query.file_uuid)?;
    provider
        .delete_managed(selector, &Requester::from_headers(&headers))
        .await?;
    Ok(StatusCode::OK)
}
