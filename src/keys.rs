//! 令牌签名密钥：由基础密钥与轮换盐确定性派生，轮换时保留少量历史密钥。

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use sha2::{Digest, Sha256};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// 一把签名密钥，`id` 即派生时使用的轮换盐。
#[derive(Clone, PartialEq, Eq)]
pub struct SigningKey {
    id: String,
    bytes: [u8; 32],
}

impl SigningKey {
    fn derive(base_secret: &[u8], salt: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(base_secret);
        hasher.update(salt.as_bytes());
        Self {
            id: salt.to_string(),
            bytes: hasher.finalize().into(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }
}

impl fmt::Debug for SigningKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SigningKey")
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

/// 不可变的密钥环快照，首个元素为当前密钥，环永不为空。
#[derive(Debug)]
struct KeyRing {
    keys: Vec<Arc<SigningKey>>,
}

/// 持有当前签名密钥，读多写一；轮换时整体替换快照。
#[derive(Debug)]
pub struct KeyStore {
    base_secret: Vec<u8>,
    history: usize,
    ring: RwLock<Arc<KeyRing>>,
}

impl KeyStore {
    /// `history` 为轮换后仍可用于校验的旧密钥数量。
    ///
    /// 盐为周期序号时，同时派生前 `history` 个周期的密钥，
    /// 重启后的进程或共享密钥的其他实例仍能校验此前签发的令牌。
    pub fn new(base_secret: impl Into<Vec<u8>>, initial_salt: &str, history: usize) -> Self {
        let base_secret = base_secret.into();
        let mut keys = vec![Arc::new(SigningKey::derive(&base_secret, initial_salt))];
        if let Ok(epoch) = initial_salt.parse::<u64>() {
            let previous = (1..=history as u64)
                .map_while(|back| epoch.checked_sub(back))
                .map(|salt| Arc::new(SigningKey::derive(&base_secret, &salt.to_string())));
            keys.extend(previous);
        }
        Self {
            base_secret,
            history,
            ring: RwLock::new(Arc::new(KeyRing { keys })),
        }
    }

    fn snapshot(&self) -> Arc<KeyRing> {
        self.ring.read().clone()
    }

    /// 返回当前签名密钥。
    pub fn current_key(&self) -> Arc<SigningKey> {
        self.snapshot().keys[0].clone()
    }

    /// 按 id 查找当前或历史密钥。
    pub fn key(&self, id: &str) -> Option<Arc<SigningKey>> {
        self.snapshot()
            .keys
            .iter()
            .find(|key| key.id == id)
            .cloned()
    }

    /// 以 `hash(base_secret || salt)` 派生新密钥并替换当前密钥；盐未变化时不做任何事。
    pub fn rotate(&self, salt: &str) {
        let mut ring = self.ring.write();
        if ring.keys[0].id == salt {
            return;
        }
        let key = Arc::new(SigningKey::derive(&self.base_secret, salt));
        let keys = std::iter::once(key)
            .chain(ring.keys.iter().take(self.history).cloned())
            .collect();
        *ring = Arc::new(KeyRing { keys });
        info!(key_id = salt, retained = self.history, "signing key rotated");
    }
}

/// 轮换盐：自 Unix 纪元起经过的完整轮换周期数。
pub fn epoch_salt(now: DateTime<Utc>, interval: Duration) -> String {
    let interval = interval.as_secs().max(1) as i64;
    now.timestamp().div_euclid(interval).to_string()
}
