//! 訂單、挑戰與憑證紀錄的持久化。
//!
//! 協調器每完成一次往返就透過 [`Persister`] 寫入受影響的紀錄，
//! 因此流程中斷後最多只會遺失正在進行的那一次請求。

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use chrono::{DateTime, Utc};
use openssl::sha::sha256;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    certificate::Certificate,
    challenge::AuthorizationChallenge,
    order::{Order, OrderStatus, OrderType},
    storage::{Storage, StorageError},
};

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Record not found: {0}")]
    NotFound(String),
}

type Result<T> = std::result::Result<T, RepositoryError>;

/// 將變更寫入持久層。每個方法只寫入它所負責的那筆紀錄。
pub trait Persister: Send + Sync {
    fn flush_challenge(&self, challenge: &AuthorizationChallenge) -> Result<()>;

    /// 寫入訂單本身以及其所有挑戰。
    fn flush_order(&self, order: &Order) -> Result<()>;

    fn flush_certificate(&self, certificate: &Certificate) -> Result<()>;
}

/// 由任意字串導出穩定、可用於路徑的紀錄識別碼。
pub fn record_id(seed: &str) -> String {
    let mut id = URL_SAFE_NO_PAD.encode(sha256(seed.as_bytes()));
    id.truncate(22);
    id
}

/// 訂單的儲存格式：挑戰各自存放，這裡只記錄順序。
#[derive(Debug, Serialize, Deserialize)]
struct OrderRecord {
    id: String,
    certificate_id: String,
    order_type: OrderType,
    status: OrderStatus,
    expiration: Option<DateTime<Utc>>,
    order_url: String,
    finalize_url: String,
    certificate_url: Option<String>,
    challenge_ids: Vec<String>,
}

impl From<&Order> for OrderRecord {
    fn from(order: &Order) -> Self {
        OrderRecord {
            id: order.id.clone(),
            certificate_id: order.certificate_id.clone(),
            order_type: order.order_type,
            status: order.status,
            expiration: order.expiration,
            order_url: order.order_url.clone(),
            finalize_url: order.finalize_url.clone(),
            certificate_url: order.certificate_url.clone(),
            challenge_ids: order
                .authorization_challenges
                .iter()
                .map(|challenge| challenge.id.clone())
                .collect(),
        }
    }
}

/// 以 [`Storage`] 為後端、以 JSON 格式保存紀錄的 [`Persister`]。
///
/// 目錄配置：
///
/// ```text
/// certificates/<id>.json
/// orders/<id>/order.json
/// orders/<id>/challenges/<challenge id>.json
/// ```
#[derive(Debug)]
pub struct StorageRepository<S: Storage> {
    storage: S,
}

impl<S: Storage> StorageRepository<S> {
    pub fn new(storage: S) -> Self {
        StorageRepository { storage }
    }

    pub fn storage(&self) -> &S {
        &self.storage
    }

    fn certificate_key(id: &str) -> String {
        format!("certificates/{}.json", id)
    }

    fn order_key(id: &str) -> String {
        format!("orders/{}/order.json", id)
    }

    fn challenge_key(order_id: &str, id: &str) -> String {
        format!("orders/{}/challenges/{}.json", order_id, id)
    }

    fn write<T: Serialize>(&self, key: &str, value: &T) -> Result<()> {
        let data = serde_json::to_vec_pretty(value)?;
        self.storage.write_file(key, &data)?;
        Ok(())
    }

    fn read<T: for<'de> Deserialize<'de>>(&self, key: &str) -> Result<T> {
        let data = match self.storage.read_file(key) {
            Ok(data) => data,
            Err(StorageError::NotFound(_)) => return Err(RepositoryError::NotFound(key.to_string())),
            Err(e) => return Err(e.into()),
        };
        Ok(serde_json::from_slice(&data)?)
    }

    /// 讀回先前保存的訂單與其挑戰。
    pub fn load_order(&self, id: &str) -> Result<Order> {
        let record: OrderRecord = self.read(&Self::order_key(id))?;
        let authorization_challenges = record
            .challenge_ids
            .iter()
            .map(|challenge_id| self.read(&Self::challenge_key(&record.id, challenge_id)))
            .collect::<Result<Vec<AuthorizationChallenge>>>()?;

        Ok(Order {
            id: record.id,
            certificate_id: record.certificate_id,
            order_type: record.order_type,
            status: record.status,
            expiration: record.expiration,
            order_url: record.order_url,
            finalize_url: record.finalize_url,
            certificate_url: record.certificate_url,
            authorization_challenges,
        })
    }

    /// 讀回先前保存的憑證。
    pub fn load_certificate(&self, id: &str) -> Result<Certificate> {
        self.read(&Self::certificate_key(id))
    }
}

impl<S: Storage> Persister for StorageRepository<S> {
    fn flush_challenge(&self, challenge: &AuthorizationChallenge) -> Result<()> {
        self.write(
            &Self::challenge_key(&challenge.order_id, &challenge.id),
            challenge,
        )
    }

    fn flush_order(&self, order: &Order) -> Result<()> {
        for challenge in &order.authorization_challenges {
            self.flush_challenge(challenge)?;
        }
        self.write(&Self::order_key(&order.id), &OrderRecord::from(order))
    }

    fn flush_certificate(&self, certificate: &Certificate) -> Result<()> {
        self.write(&Self::certificate_key(&certificate.id), certificate)
    }
}
