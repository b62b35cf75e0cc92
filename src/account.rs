//! 憑證機構端點設定（[`Server`]）與用來簽署請求的帳戶（[`Account`]）。
//!
//! 帳戶註冊不在本庫範圍內：帳戶 URL 與私鑰由呼叫者提供，這裡只負責保存與讀取。

use serde::{Deserialize, Serialize};

use crate::{
    key_pair::{KeyError, KeyPair},
    protocol::{self, ProtocolError, ProtocolStrategy},
};

/// 憑證機構端點設定。
///
/// `protocol_version` 保留設定檔中的原始字串，每次呼叫時才解析成策略，
/// 因此錯誤的設定會在送出任何網路請求前被拒絕。
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Server {
    /// 顯示用名稱。
    #[serde(default)]
    pub name: String,
    /// 協定世代，`acme01` 或 `acme02`。
    pub protocol_version: String,
    /// ACME 目錄 URL，亦作為 Nonce 快取的鍵。
    pub directory_url: String,
    /// newNonce 端點（僅 ACME v2）。
    #[serde(default)]
    pub new_nonce_url: String,
    /// newOrder 端點（僅 ACME v2）。
    #[serde(default)]
    pub new_order_url: String,
    /// new-authz / newAuthz 端點。
    #[serde(default)]
    pub new_authorization_url: String,
    /// new-cert 端點（僅 ACME v1）。
    #[serde(default)]
    pub new_certificate_url: String,
}

impl Server {
    /// 從 JSON 設定建立伺服器設定。
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// 解析此伺服器的協定策略。
    ///
    /// # Errors
    ///
    /// 協定字串無法辨識時回傳 [`ProtocolError::UnrecognizedVersion`]。
    pub fn protocol(&self) -> Result<&'static dyn ProtocolStrategy, ProtocolError> {
        protocol::resolve(&self.protocol_version)
    }
}

/// 在某個 [`Server`] 上已註冊的 ACME 帳戶。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    /// 帳戶名稱（通常為聯絡信箱）。
    pub name: String,
    /// 帳戶所屬的伺服器。
    pub server: Server,
    /// 帳戶 URL，ACME v2 以此作為 JWS 的 `kid`。
    #[serde(default)]
    pub registration_uri: String,
    /// 帳戶私鑰（PEM）。
    pub private_key_pem: String,
}

impl Account {
    pub fn new(name: &str, server: Server, registration_uri: &str, private_key_pem: &str) -> Self {
        Account {
            name: name.to_string(),
            server,
            registration_uri: registration_uri.to_string(),
            private_key_pem: private_key_pem.to_string(),
        }
    }

    /// 帳戶的協定策略，等同於 `self.server.protocol()`。
    pub fn protocol(&self) -> Result<&'static dyn ProtocolStrategy, ProtocolError> {
        self.server.protocol()
    }

    /// 解析帳戶私鑰。
    pub fn key_pair(&self) -> Result<KeyPair, KeyError> {
        KeyPair::from_pem(self.private_key_pem.as_bytes())
    }
}
