use std::{collections::HashMap, sync::Mutex};

use reqwest::blocking::Client;
use thiserror::Error;

use crate::account::Server;

/// 表示在取得 Nonce 時可能發生的錯誤狀況。
#[derive(Error, Debug)]
pub enum NonceError {
    /// 當請求過程中發生錯誤時回傳此錯誤。
    #[error("Failed to make request: {0}")]
    RequestFailed(#[from] reqwest::Error),
    /// 當回應中缺少 `Replay-Nonce` 標頭時回傳此錯誤。
    #[error("No Replay-Nonce header found in response from {0}")]
    NoNonceHeader(String),
    /// 當標頭值無法轉換成字串時回傳此錯誤。
    #[error("Invalid header value: {0}")]
    InvalidHeaderValue(#[from] reqwest::header::ToStrError),
    #[error("Nonce pool lock poisoned")]
    LockPoisoned,
}

/// 定義取得與回收 Nonce 的行為。
pub trait NonceT: Send + Sync {
    /// 取得一個可用於 `server` 的 Nonce。
    fn get(&self, server: &Server) -> Result<String, NonceError>;

    /// 保存回應中附帶的 `Replay-Nonce`，供下一次請求使用。
    fn remember(&self, server: &Server, nonce: String);
}

/// 以伺服器為單位快取 Nonce；快取用罄時才以 HTTP HEAD 重新取得。
#[derive(Debug)]
pub struct NoncePool {
    client: Client,
    cache: Mutex<HashMap<String, String>>,
}

impl NoncePool {
    pub fn new(client: Client) -> Self {
        NoncePool {
            client,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// ACME v2 有專屬的 newNonce 端點；ACME v1 則從目錄回應取得。
    fn nonce_url(server: &Server) -> &str {
        if server.new_nonce_url.is_empty() {
            &server.directory_url
        } else {
            &server.new_nonce_url
        }
    }
}

impl NonceT for NoncePool {
    fn get(&self, server: &Server) -> Result<String, NonceError> {
        let cached = self
            .cache
            .lock()
            .map_err(|_| NonceError::LockPoisoned)?
            .remove(&server.directory_url);
        if let Some(nonce) = cached {
            return Ok(nonce);
        }

        let url = Self::nonce_url(server);
        let response = self.client.head(url).send()?;
        match response.headers().get("Replay-Nonce") {
            Some(nonce) => Ok(nonce.to_str()?.to_string()),
            None => Err(NonceError::NoNonceHeader(url.to_string())),
        }
    }

    fn remember(&self, server: &Server, nonce: String) {
        if let Ok(mut cache) = self.cache.lock() {
            cache.insert(server.directory_url.clone(), nonce);
        }
    }
}

/// 模擬 Nonce 實作，通常用於測試環境中提供固定的 Nonce 值。
#[derive(Debug, Clone)]
pub struct MockNonce {
    value: String,
}

impl MockNonce {
    pub fn new(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
        }
    }
}

impl NonceT for MockNonce {
    /// 直接回傳預設的 Nonce 值，適用於測試情境。
    fn get(&self, _server: &Server) -> Result<String, NonceError> {
        Ok(self.value.clone())
    }

    fn remember(&self, _server: &Server, _nonce: String) {}
}
