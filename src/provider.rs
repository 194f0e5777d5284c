//! 文件访问编排：签发下载令牌、按令牌读取、直接读取、上传登记与受限删除。

use axum::body::{Body as AxumBody, Bytes};
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use chrono::Utc;
use futures_util::stream::{Stream, StreamExt};
use httpdate::fmt_http_date;
use serde_json::{Map, Value};
use std::fmt::Display;
use std::fs::Metadata;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, UNIX_EPOCH};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::atomic::AtomicFile;
use crate::error::AccessError;
use crate::http::Requester;
use crate::metastore::MetaStore;
use crate::path_guard::{PathGuard, plain_file_name, valid_filename};
use crate::permission::{ACTION_FILE_ADD, ACTION_FILE_DELETE, ACTION_FILE_READ, PermissionChecker};
use crate::range::{self, RangeStatus};
use crate::stream::{self, ByteStream};
use crate::token::{Claims, TOKEN_ISSUER, TokenCodec};

/// 目标文件的定位方式。
#[derive(Clone, Debug)]
pub enum FileSelector {
    Path {
        path: String,
        database_id: Option<String>,
    },
    Stored {
        database_id: String,
        file_uuid: String,
    },
}

impl FileSelector {
    pub fn database_id(&self) -> Option<&str> {
        match self {
            FileSelector::Path { database_id, .. } => database_id.as_deref(),
            FileSelector::Stored { database_id, .. } => Some(database_id),
        }
    }
}

#[derive(Clone, Debug)]
pub struct DownloadRequest {
    pub selector: FileSelector,
    pub record_id: Option<String>,
    pub content_type: Option<String>,
}

#[derive(Clone, Debug)]
pub struct DirectReadRequest {
    pub path: String,
    pub database_id: Option<String>,
    pub record_id: Option<String>,
    pub content_type: Option<String>,
}

/// 已落盘、尚未登记的上传文件。
#[derive(Debug)]
pub struct StoredUpload {
    pub database_id: String,
    pub record_id: String,
    pub path: String,
}

#[derive(Debug)]
pub struct UploadOutcome {
    pub status: StatusCode,
    pub save_file_path: String,
    pub body: Map<String, Value>,
}

/// 文件响应描述：状态码、响应头与惰性字节流。
pub struct FileResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: ByteStream,
}

impl IntoResponse for FileResponse {
    fn into_response(self) -> Response {
        (self.status, self.headers, AxumBody::from_stream(self.body)).into_response()
    }
}

pub struct FileProvider {
    guard: PathGuard,
    codec: TokenCodec,
    permissions: Arc<dyn PermissionChecker>,
    meta: Arc<dyn MetaStore>,
    token_lifetime: Duration,
    upload_root: PathBuf,
}

impl FileProvider {
    pub fn new(
        guard: PathGuard,
        codec: TokenCodec,
        permissions: Arc<dyn PermissionChecker>,
        meta: Arc<dyn MetaStore>,
        token_lifetime: Duration,
        upload_root: PathBuf,
    ) -> Self {
        Self {
            guard,
            codec,
            permissions,
            meta,
            token_lifetime,
            upload_root,
        }
    }

    /// 解析文件路径、校验权限与文件存在性，然后签发下载令牌。
    pub async fn issue_download_token(
        &self,
        request: DownloadRequest,
        requester: &Requester,
    ) -> Result<String, AccessError> {
        check_content_type(request.content_type.as_deref())?;
        let database_id = request.selector.database_id().map(str::to_string);
        let (path, stored_content_type) = self
            .resolve_selector(&request.selector, requester)
            .await?;

        self.permissions
            .check(requester, ACTION_FILE_READ, database_id.as_deref())
            .await?;

        let mut content_type = request.content_type.or(stored_content_type);
        if let (Some(database_id), Some(record_id)) =
            (database_id.as_deref(), request.record_id.as_deref())
            && let Some(looked_up) = self
                .record_content_type(requester, database_id, record_id, &path)
                .await
        {
            content_type = Some(looked_up);
        }
        let content_type = content_type.filter(|value| {
            let usable = HeaderValue::from_str(value).is_ok();
            if !usable {
                warn!(path, content_type = value, "stored content type ignored");
            }
            usable
        });

        if !self.guard.validate(Path::new(&path), true).await {
            return Err(AccessError::NotFound("No such file".into()));
        }

        let now = Utc::now().timestamp();
        let lifetime = i64::try_from(self.token_lifetime.as_secs()).unwrap_or(i64::MAX);
        let claims = Claims {
            subject_path: path,
            database_id,
            record_id: request.record_id,
            content_type,
            issued_at: now,
            not_before: now,
            expires_at: now.saturating_add(lifetime),
            issuer: TOKEN_ISSUER.into(),
        };
        let token = self.codec.issue(&claims)?;
        info!(
            path = claims.subject_path,
            database_id = claims.database_id,
            expires_at = claims.expires_at,
            "download token issued"
        );
        Ok(token)
    }

    /// 校验令牌并返回对应文件内容（支持 Range）。
    pub async fn retrieve(
        &self,
        token: &str,
        range_header: Option<&str>,
    ) -> Result<FileResponse, AccessError> {
        let claims = self.codec.verify(token).inspect_err(|err| {
            warn!(reason = %err, "download token rejected");
        })?;
        self.serve(
            &claims.subject_path,
            claims.content_type.as_deref(),
            range_header,
        )
        .await
    }

    /// 不经令牌、直接按路径读取文件（需 `file:read` 权限）。
    pub async fn fetch_direct(
        &self,
        request: DirectReadRequest,
        requester: &Requester,
        range_header: Option<&str>,
    ) -> Result<FileResponse, AccessError> {
        check_content_type(request.content_type.as_deref())?;
        self.permissions
            .check(requester, ACTION_FILE_READ, request.database_id.as_deref())
            .await?;

        let mut content_type = request.content_type;
        if content_type.is_none()
            && let (Some(database_id), Some(record_id)) =
                (request.database_id.as_deref(), request.record_id.as_deref())
        {
            content_type = self
                .record_content_type(requester, database_id, record_id, &request.path)
                .await;
        }
        self.serve(&request.path, content_type.as_deref(), range_header)
            .await
    }

    /// 删除上传目录内的文件。
    pub async fn delete_managed(
        &self,
        selector: FileSelector,
        requester: &Requester,
    ) -> Result<String, AccessError> {
        let (path, _) = self.resolve_selector(&selector, requester).await?;
        if !PathGuard::is_contained_in(Path::new(&path), &self.upload_root).await {
            warn!(path, "delete outside upload root rejected");
            return Err(AccessError::InvalidPath(path));
        }

        self.permissions
            .check(requester, ACTION_FILE_DELETE, selector.database_id())
            .await?;

        let metadata = fs::symlink_metadata(&path)
            .await
            .map_err(|err| AccessError::from_io(err, &path))?;
        if metadata.is_dir() {
            return Err(AccessError::OperationNotPermitted(path));
        }
        fs::remove_file(&path)
            .await
            .map_err(|err| AccessError::from_io(err, &path))?;
        info!(path, "file deleted");
        Ok(path)
    }

    /// 校验权限后将上传内容写入 `<root>/database_<db>/record_<record>/<name>`。
    ///
    /// 文件完整落盘后才出现在最终路径；同名文件已存在时返回 Conflict。
    pub async fn receive_upload<S, E>(
        &self,
        database_id: &str,
        record_id: &str,
        file_name: &str,
        body: S,
        requester: &Requester,
    ) -> Result<StoredUpload, AccessError>
    where
        S: Stream<Item = Result<Bytes, E>> + Send,
        E: Display + Send,
    {
        if database_id.trim().is_empty() || record_id.trim().is_empty() {
            return Err(AccessError::BadRequest(
                "Param database_id and record_id must be specified.".into(),
            ));
        }
        self.permissions
            .check(requester, ACTION_FILE_ADD, Some(database_id))
            .await?;

        let plain_name = plain_file_name(file_name)
            .ok_or_else(|| AccessError::InvalidPath(file_name.to_string()))?;
        let target = self
            .upload_root
            .join(format!("database_{}", valid_filename(database_id)))
            .join(format!("record_{}", valid_filename(record_id)))
            .join(plain_name);
        let target_display = target.to_string_lossy().to_string();
        if !self.guard.validate(&target, false).await
            || !PathGuard::is_contained_in(&target, &self.upload_root).await
        {
            return Err(AccessError::InvalidPath(target_display));
        }
        if fs::try_exists(&target).await.unwrap_or(false) {
            return Err(AccessError::Conflict(format!(
                "The file with the same path ({target_display}) already exists."
            )));
        }
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|err| AccessError::Internal(err.to_string()))?;
        }

        let mut atomic = AtomicFile::new(&target).await?;
        let write_result: Result<u64, AccessError> = async {
            let mut body = std::pin::pin!(body);
            let mut written: u64 = 0;
            while let Some(chunk) = body.next().await {
                let chunk = chunk.map_err(|err| AccessError::BadRequest(err.to_string()))?;
                written += chunk.len() as u64;
                atomic
                    .file_mut()
                    .write_all(&chunk)
                    .await
                    .map_err(|err| AccessError::Internal(err.to_string()))?;
            }
            Ok(written)
        }
        .await;
        let written = match write_result {
            Ok(written) => written,
            Err(err) => {
                atomic.cleanup().await;
                return Err(err);
            }
        };
        atomic.finalize_new().await?;
        info!(path = target_display, bytes = written, "upload stored");

        Ok(StoredUpload {
            database_id: database_id.to_string(),
            record_id: record_id.to_string(),
            path: target_display,
        })
    }

    /// 在元数据服务登记已落盘的文件；上游 200 映射为 201，其余状态原样返回。
    pub async fn register_upload(
        &self,
        stored: &StoredUpload,
        metadata: Map<String, Value>,
        requester: &Requester,
    ) -> Result<UploadOutcome, AccessError> {
        let created = self
            .meta
            .add_file(
                requester,
                &stored.database_id,
                &stored.record_id,
                &stored.path,
                metadata,
            )
            .await
            .inspect_err(|err| {
                warn!(path = stored.path, error = %err, "metadata registration failed");
            })?;
        let status = if created.status == StatusCode::OK {
            StatusCode::CREATED
        } else {
            created.status
        };
        Ok(UploadOutcome {
            status,
            save_file_path: stored.path.clone(),
            body: created.body,
        })
    }

    /// 撤回尚未登记的上传文件。
    pub async fn discard_upload(&self, stored: StoredUpload) {
        if let Err(err) = fs::remove_file(&stored.path).await {
            warn!(path = stored.path, error = %err, "failed to discard upload");
        }
    }

    async fn resolve_selector(
        &self,
        selector: &FileSelector,
        requester: &Requester,
    ) -> Result<(String, Option<String>), AccessError> {
        match selector {
            FileSelector::Path { path, .. } => Ok((path.clone(), None)),
            FileSelector::Stored {
                database_id,
                file_uuid,
            } => match self
                .meta
                .file_by_uuid(requester, database_id, file_uuid)
                .await?
            {
                Some(file) => Ok((file.path, file.content_type)),
                None => Err(AccessError::NotFound("No such file".into())),
            },
        }
    }

    async fn record_content_type(
        &self,
        requester: &Requester,
        database_id: &str,
        record_id: &str,
        path: &str,
    ) -> Option<String> {
        match self
            .meta
            .content_type(requester, database_id, record_id, path)
            .await
        {
            Ok(content_type) => content_type,
            Err(err) => {
                warn!(database_id, record_id, error = %err, "content type lookup failed");
                None
            }
        }
    }

    async fn serve(
        &self,
        path: &str,
        content_type: Option<&str>,
        range_header: Option<&str>,
    ) -> Result<FileResponse, AccessError> {
        if !self.guard.validate(Path::new(path), true).await {
            return Err(AccessError::NotFound(format!("No such file: {path}")));
        }
        let metadata = fs::metadata(path)
            .await
            .map_err(|err| AccessError::from_io(err, path))?;
        let total = metadata.len();
        let range = range::resolve(range_header, total)?;
        let body = stream::open(Path::new(path), &range)
            .await
            .map_err(|err| AccessError::from_io(err, path))?;

        let mut headers = HeaderMap::new();
        let content_type = match content_type {
            Some(value) => value.to_string(),
            None => mime_guess::from_path(path)
                .first_or_octet_stream()
                .essence_str()
                .to_string(),
        };
        insert_header(&mut headers, header::CONTENT_TYPE, &content_type)?;
        insert_header(&mut headers, header::CONTENT_LENGTH, &range.length.to_string())?;
        insert_header(
            &mut headers,
            header::CONTENT_DISPOSITION,
            &content_disposition(path),
        )?;
        headers.insert(header::ACCEPT_RANGES, HeaderValue::from_static("bytes"));
        insert_header(&mut headers, header::ETAG, &etag_from_metadata(&metadata))?;
        if let Ok(modified) = metadata.modified() {
            insert_header(&mut headers, header::LAST_MODIFIED, &fmt_http_date(modified))?;
        }

        let status = match range.status {
            RangeStatus::PartialContent => {
                insert_header(
                    &mut headers,
                    header::CONTENT_RANGE,
                    &format!("bytes {}-{}/{}", range.start, range.end, total),
                )?;
                debug!(
                    path,
                    start = range.start,
                    end = range.end,
                    length = range.length,
                    "serving range"
                );
                StatusCode::PARTIAL_CONTENT
            }
            RangeStatus::FullContent => {
                debug!(path, size = total, "serving full file");
                StatusCode::OK
            }
        };
        Ok(FileResponse {
            status,
            headers,
            body,
        })
    }
}

fn insert_header(
    headers: &mut HeaderMap,
    name: HeaderName,
    value: &str,
) -> Result<(), AccessError> {
    let value = HeaderValue::from_str(value)
        .map_err(|_| AccessError::Internal(format!("invalid {name} header value")))?;
    headers.insert(name, value);
    Ok(())
}

/// `attachment; filename="<basename>"`，非 ASCII 文件名追加 RFC 5987 `filename*`。
fn content_disposition(path: &str) -> String {
    let name = Path::new(path)
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_default();
    let is_plain = name
        .chars()
        .all(|c| (c.is_ascii_graphic() && c != '"' && c != '\\') || c == ' ');
    if is_plain {
        return format!("attachment; filename=\"{name}\"");
    }
    let fallback: String = name
        .chars()
        .map(|c| if c.is_ascii_graphic() && c != '"' && c != '\\' { c } else { '_' })
        .collect();
    let mut encoded = String::new();
    for byte in name.bytes() {
        if byte.is_ascii_alphanumeric() || b"!#$&+-.^_`|~".contains(&byte) {
            encoded.push(byte as char);
        } else {
            encoded.push_str(&format!("%{byte:02X}"));
        }
    }
    format!("attachment; filename=\"{fallback}\"; filename*=UTF-8''{encoded}")
}

/// 调用方给出的 Content-Type 必须是合法的头部值。
fn check_content_type(content_type: Option<&str>) -> Result<(), AccessError> {
    match content_type {
        Some(value) if HeaderValue::from_str(value).is_err() => Err(AccessError::BadRequest(
            format!("Invalid content type: {value:?}"),
        )),
        _ => Ok(()),
    }
}

/// 根据文件元数据生成弱 ETag。
fn etag_from_metadata(metadata: &Metadata) -> String {
    let size = metadata.len();
    if let Ok(modified) = metadata.modified()
        && let Ok(duration) = modified.duration_since(UNIX_EPOCH)
    {
        return format!(
            "W/\"{}-{}-{}\"",
            size,
            duration.as_secs(),
            duration.subsec_nanos()
        );
    }
    format!("W/\"{size}\"")
}
