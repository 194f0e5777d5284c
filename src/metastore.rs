//! 元数据服务与记录服务客户端：按 uuid 查询文件路径、查询内容类型、登记新文件。

use async_trait::async_trait;
use axum::http::StatusCode;
use reqwest::Url;
use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::error::AccessError;
use crate::http::Requester;

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct StoredFile {
    pub path: String,
    #[serde(rename = "content-type", alias = "content_type", default)]
    pub content_type: Option<String>,
}

/// 元数据服务对新文件登记请求的响应。
#[derive(Debug)]
pub struct CreatedResource {
    pub status: StatusCode,
    pub body: Map<String, Value>,
}

#[async_trait]
pub trait MetaStore: Send + Sync {
    /// 按 `(database_id, file_uuid)` 查询文件；不存在时返回 `None`。
    async fn file_by_uuid(
        &self,
        requester: &Requester,
        database_id: &str,
        file_uuid: &str,
    ) -> Result<Option<StoredFile>, AccessError>;

    /// 在记录 `(database_id, record_id)` 中查找 `path` 对应文件的内容类型。
    async fn content_type(
        &self,
        requester: &Requester,
        database_id: &str,
        record_id: &str,
        path: &str,
    ) -> Result<Option<String>, AccessError>;

    async fn add_file(
        &self,
        requester: &Requester,
        database_id: &str,
        record_id: &str,
        path: &str,
        metadata: Map<String, Value>,
    ) -> Result<CreatedResource, AccessError>;
}

#[derive(Deserialize)]
struct RecordInfo {
    #[serde(default)]
    files: Vec<StoredFile>,
}

#[derive(Debug, Clone)]
pub struct HttpMetaStore {
    client: reqwest::Client,
    meta_url: String,
    record_url: Option<String>,
}

impl HttpMetaStore {
    pub fn new(client: reqwest::Client, meta_url: &str, record_url: Option<&str>) -> Self {
        Self {
            client,
            meta_url: meta_url.to_string(),
            record_url: record_url.map(str::to_string),
        }
    }
}

fn endpoint(base: &str, segments: &[&str]) -> Result<Url, AccessError> {
    let mut url = Url::parse(base)
        .map_err(|err| AccessError::Internal(format!("invalid service url {base}: {err}")))?;
    url.path_segments_mut()
        .map_err(|_| AccessError::Internal(format!("invalid service url {base}")))?
        .pop_if_empty()
        .extend(segments);
    Ok(url)
}

fn upstream_failure(service: &str, err: reqwest::Error) -> AccessError {
    warn!(service, error = %err, "upstream request failed");
    AccessError::UpstreamUnavailable(format!("{service} unreachable"))
}

#[async_trait]
impl MetaStore for HttpMetaStore {
    async fn file_by_uuid(
        &self,
        requester: &Requester,
        database_id: &str,
        file_uuid: &str,
    ) -> Result<Option<StoredFile>, AccessError> {
        let Some(authorization) = requester.authorization.as_deref() else {
            return Ok(None);
        };
        let url = endpoint(
            &self.meta_url,
            &["databases", database_id, "files", file_uuid],
        )?;
        let response = self
            .client
            .get(url)
            .header(reqwest::header::AUTHORIZATION, authorization)
            .send()
            .await
            .map_err(|err| upstream_failure("meta store", err))?;

        let status = response.status();
        if status.is_server_error() {
            return Err(AccessError::UpstreamUnavailable(format!(
                "meta store returned {status}"
            )));
        }
        if !status.is_success() {
            debug!(database_id, file_uuid, %status, "file lookup failed");
            return Ok(None);
        }
        match response.json::<StoredFile>().await {
            Ok(file) => Ok(Some(file)),
            Err(err) => {
                debug!(database_id, file_uuid, error = %err, "file lookup returned no path");
                Ok(None)
            }
        }
    }

    async fn content_type(
        &self,
        requester: &Requester,
        database_id: &str,
        record_id: &str,
        path: &str,
    ) -> Result<Option<String>, AccessError> {
        let Some(record_url) = self.record_url.as_deref() else {
            return Ok(None);
        };
        let url = endpoint(record_url, &[database_id, "records", record_id])?;
        let mut request = self.client.get(url).header(reqwest::header::ACCEPT, "application/json");
        if let Some(authorization) = requester.authorization.as_deref() {
            request = request.header(reqwest::header::AUTHORIZATION, authorization);
        }
        let response = request
            .send()
            .await
            .map_err(|err| upstream_failure("record store", err))?;
        if !response.status().is_success() {
            return Ok(None);
        }
        let record: RecordInfo = response
            .json()
            .await
            .map_err(|err| AccessError::UpstreamUnavailable(format!("invalid record: {err}")))?;
        Ok(record
            .files
            .into_iter()
            .find(|file| file.path == path)
            .and_then(|file| file.content_type))
    }

    async fn add_file(
        &self,
        requester: &Requester,
        database_id: &str,
        record_id: &str,
        path: &str,
        metadata: Map<String, Value>,
    ) -> Result<CreatedResource, AccessError> {
        let Some(authorization) = requester.authorization.as_deref() else {
            return Err(AccessError::UpstreamUnavailable(
                "Metadata updating process returned no response".into(),
            ));
        };
        let url = endpoint(&self.meta_url, &["databases", database_id, "files"])?;
        let mut payload = Map::new();
        payload.insert("record_id".into(), Value::from(record_id));
        payload.insert("database_id".into(), Value::from(database_id));
        payload.insert("path".into(), Value::from(path));
        payload.extend(metadata);

        let response = self
            .client
            .post(url)
            .header(reqwest::header::AUTHORIZATION, authorization)
            .json(&payload)
            .send()
            .await
            .map_err(|err| upstream_failure("meta store", err))?;
        let status = response.status();
        let body = match response.json::<Value>().await {
            Ok(Value::Object(map)) => map,
            Ok(_) | Err(_) => Map::new(),
        };
        Ok(CreatedResource { status, body })
    }
}
