//! 权限校验协作方：远程权限服务客户端与测试用的放行实现。

use async_trait::async_trait;
use axum::http::StatusCode;
use tracing::{debug, warn};

use crate::error::AccessError;
use crate::http::Requester;

pub const ACTION_FILE_READ: &str = "file:read";
pub const ACTION_FILE_ADD: &str = "file:write:add";
pub const ACTION_FILE_DELETE: &str = "file:write:delete";

/// 判断请求方是否拥有某个数据库上的指定操作权限。
#[async_trait]
pub trait PermissionChecker: Send + Sync {
    async fn check(
        &self,
        requester: &Requester,
        action: &str,
        database_id: Option<&str>,
    ) -> Result<(), AccessError>;
}

/// 不做任何校验，仅用于开发与测试配置。
#[derive(Debug, Default)]
pub struct AllowAll;

#[async_trait]
impl PermissionChecker for AllowAll {
    async fn check(
        &self,
        _requester: &Requester,
        action: &str,
        database_id: Option<&str>,
    ) -> Result<(), AccessError> {
        debug!(action, database_id, "permission check bypassed");
        Ok(())
    }
}

/// 调用 `GET {base}/permitted-actions/{action}?database_id=...`，响应体为 JSON 布尔值。
#[derive(Debug, Clone)]
pub struct HttpPermissionClient {
    client: reqwest::Client,
    base_url: String,
}

impl HttpPermissionClient {
    pub fn new(client: reqwest::Client, base_url: &str) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl PermissionChecker for HttpPermissionClient {
    async fn check(
        &self,
        requester: &Requester,
        action: &str,
        database_id: Option<&str>,
    ) -> Result<(), AccessError> {
        let Some(authorization) = requester.authorization.as_deref() else {
            return Err(AccessError::Forbidden);
        };
        let url = format!("{}/permitted-actions/{}", self.base_url, action);
        let mut request = self
            .client
            .get(url)
            .header(reqwest::header::AUTHORIZATION, authorization);
        if let Some(database_id) = database_id {
            request = request.query(&[("database_id", database_id)]);
        }
        let response = request.send().await.map_err(|err| {
            warn!(action, error = %err, "permission service unreachable");
            AccessError::UpstreamUnavailable("permission service unreachable".into())
        })?;

        match response.status() {
            status if status.is_success() => {
                let permitted: bool = response.json().await.map_err(|err| {
                    AccessError::UpstreamUnavailable(format!("invalid permission response: {err}"))
                })?;
                if permitted {
                    Ok(())
                } else {
                    debug!(action, database_id, "permission denied");
                    Err(AccessError::Forbidden)
                }
            }
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(AccessError::Forbidden),
            status => {
                warn!(action, %status, "permission service returned an error");
                Err(AccessError::UpstreamUnavailable(format!(
                    "permission service returned {status}"
                )))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::Router;
    use axum::extract::{Path, Query};
    use axum::http::HeaderMap;
    use axum::response::{IntoResponse, Json};
    use axum::routing::get;
    use std::collections::HashMap;
    use tokio::net::TcpListener;

    async fn permitted_actions(
        Path(action): Path<String>,
        Query(query): Query<HashMap<String, String>>,
        headers: HeaderMap,
    ) -> axum::response::Response {
        if headers.get("authorization").is_none() {
            return StatusCode::UNAUTHORIZED.into_response();
        }
        match query.get("database_id").map(String::as_str) {
            Some("broken") => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
            Some("db1") => Json(action == ACTION_FILE_READ).into_response(),
            _ => Json(false).into_response(),
        }
    }

    async fn spawn_permission_service() -> String {
        let app = Router::new().route("/permitted-actions/{action}", get(permitted_actions));
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        format!("http://{addr}/")
    }

    fn bearer() -> Requester {
        Requester {
            authorization: Some("Bearer abc".into()),
        }
    }

    #[tokio::test]
    async fn allow_all_permits_everything() {
        let result = AllowAll
            .check(&Requester::default(), ACTION_FILE_DELETE, None)
            .await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn http_client_maps_service_answers() {
        let base = spawn_permission_service().await;
        let client = HttpPermissionClient::new(reqwest::Client::new(), &base);

        assert!(client.check(&bearer(), ACTION_FILE_READ, Some("db1")).await.is_ok());
        assert!(matches!(
            client.check(&bearer(), ACTION_FILE_DELETE, Some("db1")).await,
            Err(AccessError::Forbidden)
        ));
        assert!(matches!(
            client.check(&bearer(), ACTION_FILE_READ, Some("broken")).await,
            Err(AccessError::UpstreamUnavailable(_))
        ));
    }

    #[tokio::test]
    async fn http_client_requires_credentials() {
        let client = HttpPermissionClient::new(reqwest::Client::new(), "http://127.0.0.1:9");
        let result = client
            .check(&Requester::default(), ACTION_FILE_READ, Some("db1"))
            .await;
        assert!(matches!(result, Err(AccessError::Forbidden)));
    }

    #[tokio::test]
    async fn unreachable_service_is_upstream_failure() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        drop(listener);
        let client = HttpPermissionClient::new(reqwest::Client::new(), &format!("http://{addr}"));
        let result = client.check(&bearer(), ACTION_FILE_READ, Some("db1")).await;
        assert!(matches!(result, Err(AccessError::UpstreamUnavailable(_))));
    }
}
