//! 下载令牌的签发与校验（HS256 紧凑格式，头部携带密钥 id）。

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::Utc;
use hmac::{Hmac, Mac};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::sync::Arc;
use subtle::ConstantTimeEq;
use thiserror::Error;
use tracing::debug;

use crate::keys::{KeyStore, SigningKey};

pub const TOKEN_ISSUER: &str = "api-file-provider";

type HmacSha256 = Hmac<Sha256>;

/// 令牌载荷。时间字段为 Unix 秒。
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    #[serde(rename = "path")]
    pub subject_path: String,
    pub database_id: Option<String>,
    pub record_id: Option<String>,
    pub content_type: Option<String>,
    #[serde(rename = "iat")]
    pub issued_at: i64,
    #[serde(rename = "nbf")]
    pub not_before: i64,
    #[serde(rename = "exp")]
    pub expires_at: i64,
    #[serde(rename = "iss")]
    pub issuer: String,
}

#[derive(Serialize, Deserialize)]
struct Header {
    alg: String,
    typ: String,
    kid: String,
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum TokenError {
    #[error("invalid claims")]
    InvalidClaims,
    #[error("malformed token")]
    Malformed,
    #[error("invalid signature")]
    InvalidSignature,
    #[error("token expired")]
    Expired,
    #[error("token not yet valid")]
    NotYetValid,
}

/// 使用 [`KeyStore`] 中的密钥签发与校验令牌。
#[derive(Clone, Debug)]
pub struct TokenCodec {
    keys: Arc<KeyStore>,
    leeway: i64,
}

impl TokenCodec {
    pub fn new(keys: Arc<KeyStore>, leeway_secs: u64) -> Self {
        Self {
            keys,
            leeway: i64::try_from(leeway_secs).unwrap_or(i64::MAX),
        }
    }

    /// 以当前密钥签发令牌。
    pub fn issue(&self, claims: &Claims) -> Result<String, TokenError> {
        if claims.subject_path.is_empty()
            || claims.issued_at > claims.not_before
            || claims.expires_at <= claims.not_before
        {
            return Err(TokenError::InvalidClaims);
        }
        let key = self.keys.current_key();
        let header = Header {
            alg: "HS256".into(),
            typ: "JWT".into(),
            kid: key.id().to_string(),
        };
        let header = serde_json::to_vec(&header).map_err(|_| TokenError::InvalidClaims)?;
        let payload = serde_json::to_vec(claims).map_err(|_| TokenError::InvalidClaims)?;
        let signing_input = format!(
            "{}.{}",
            URL_SAFE_NO_PAD.encode(header),
            URL_SAFE_NO_PAD.encode(payload)
        );
        let signature = sign(&key, signing_input.as_bytes())?;
        Ok(format!(
            "{signing_input}.{}",
            URL_SAFE_NO_PAD.encode(signature)
        ))
    }

    /// 校验结构、签名与有效期，成功时原样返回载荷。
    pub fn verify(&self, token: &str) -> Result<Claims, TokenError> {
        self.verify_at(token, Utc::now().timestamp())
    }

    fn verify_at(&self, token: &str, now: i64) -> Result<Claims, TokenError> {
        let mut parts = token.split('.');
        let (Some(header_b64), Some(payload_b64), Some(signature_b64), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(TokenError::Malformed);
        };
        let header: Header = decode_segment(header_b64)?;
        if header.alg != "HS256" {
            return Err(TokenError::Malformed);
        }
        let signature = URL_SAFE_NO_PAD
            .decode(signature_b64)
            .map_err(|_| TokenError::Malformed)?;
        let claims: Claims = decode_segment(payload_b64)?;

        let Some(key) = self.keys.key(&header.kid) else {
            debug!(key_id = header.kid, "token signed with unknown key");
            return Err(TokenError::InvalidSignature);
        };
        let signing_input_len = header_b64.len() + 1 + payload_b64.len();
        let expected = sign(&key, &token.as_bytes()[..signing_input_len])?;
        if !bool::from(expected.as_slice().ct_eq(signature.as_slice())) {
            return Err(TokenError::InvalidSignature);
        }

        if now > claims.expires_at.saturating_add(self.leeway) {
            return Err(TokenError::Expired);
        }
        if now.saturating_add(self.leeway) < claims.not_before {
            return Err(TokenError::NotYetValid);
        }
        Ok(claims)
    }
}

fn sign(key: &SigningKey, input: &[u8]) -> Result<Vec<u8>, TokenError> {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(key.as_bytes())
        .map_err(|_| TokenError::InvalidSignature)?;
    mac.update(input);
    Ok(mac.finalize().into_bytes().to_vec())
}

fn decode_segment<T: DeserializeOwned>(segment: &str) -> Result<T, TokenError> {
    let bytes = URL_SAFE_NO_PAD
        .decode(segment)
        .map_err(|_| TokenError::Malformed)?;
    serde_json::from_slice(&bytes).map_err(|_| TokenError::Malformed)
}
