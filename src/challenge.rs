use std::fmt;

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use chrono::{DateTime, Utc};
use openssl::sha::sha256;
use serde::{Deserialize, Serialize};

use crate::domain::Domain;

/// 授權（authorization）的狀態。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthorizationStatus {
    Pending,
    Processing,
    Valid,
    Invalid,
    Deactivated,
    Expired,
    Revoked,
}

impl AuthorizationStatus {
    /// 根據伺服器回傳的字串取得對應狀態，大小寫不敏感。
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "pending" => Some(Self::Pending),
            "processing" => Some(Self::Processing),
            "valid" => Some(Self::Valid),
            "invalid" => Some(Self::Invalid),
            "deactivated" => Some(Self::Deactivated),
            "expired" => Some(Self::Expired),
            "revoked" => Some(Self::Revoked),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Valid => "valid",
            Self::Invalid => "invalid",
            Self::Deactivated => "deactivated",
            Self::Expired => "expired",
            Self::Revoked => "revoked",
        }
    }

    /// 授權是否已失敗且無法再轉為有效。
    pub fn is_failed(&self) -> bool {
        matches!(
            self,
            Self::Invalid | Self::Deactivated | Self::Expired | Self::Revoked
        )
    }
}

impl fmt::Display for AuthorizationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 挑戰（challenge）的狀態。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChallengeStatus {
    Pending,
    Processing,
    Valid,
    Invalid,
}

impl ChallengeStatus {
    /// 根據伺服器回傳的字串取得對應狀態，大小寫不敏感。
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "pending" => Some(Self::Pending),
            "processing" => Some(Self::Processing),
            "valid" => Some(Self::Valid),
            "invalid" => Some(Self::Invalid),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Valid => "valid",
            Self::Invalid => "invalid",
        }
    }

    /// 判斷是否為終結狀態。
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Valid | Self::Invalid)
    }
}

impl fmt::Display for ChallengeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 單一網域的驗證狀態：一筆授權，以及其中交由本機處理器負責的那個挑戰。
///
/// `challenge_started` 為 `true` 代表驗證物（DNS 記錄、HTTP 檔案等）可能仍存在於外部，
/// 處理器的 `after_challenge` 執行後必須清除。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthorizationChallenge {
    /// 紀錄識別碼（由授權 URL 導出）。
    pub id: String,
    /// 所屬訂單的識別碼。
    pub order_id: String,
    pub domain: Domain,
    pub authorization_status: AuthorizationStatus,
    pub authorization_url: String,
    pub authorization_expiration: Option<DateTime<Utc>>,
    /// ACME 挑戰類型，例如 `http-01`。
    pub challenge_type: String,
    pub challenge_url: String,
    pub challenge_token: String,
    /// `token.thumbprint` 形式的 key authorization。
    pub challenge_authorization_key: String,
    pub challenge_status: ChallengeStatus,
    /// 伺服器回報的挑戰錯誤說明，沒有錯誤時為空字串。
    #[serde(default)]
    pub challenge_error: String,
    #[serde(default)]
    pub challenge_started: bool,
}

impl AuthorizationChallenge {
    /// 建立一筆處於 `pending/pending` 且尚未啟動的紀錄。
    pub fn new(domain: Domain, authorization_url: &str, challenge_type: &str, challenge_url: &str) -> Self {
        AuthorizationChallenge {
            id: String::new(),
            order_id: String::new(),
            domain,
            authorization_status: AuthorizationStatus::Pending,
            authorization_url: authorization_url.to_string(),
            authorization_expiration: None,
            challenge_type: challenge_type.to_string(),
            challenge_url: challenge_url.to_string(),
            challenge_token: String::new(),
            challenge_authorization_key: String::new(),
            challenge_status: ChallengeStatus::Pending,
            challenge_error: String::new(),
            challenge_started: false,
        }
    }

    /// 授權與挑戰是否皆仍為 `pending`，也就是可以啟動挑戰。
    pub fn is_pending(&self) -> bool {
        self.authorization_status == AuthorizationStatus::Pending
            && self.challenge_status == ChallengeStatus::Pending
    }

    /// dns-01 挑戰需要發佈到 `_acme-challenge` TXT 記錄的值。
    pub fn dns_txt_value(&self) -> String {
        URL_SAFE_NO_PAD.encode(sha256(self.challenge_authorization_key.as_bytes()))
    }

    /// dns-01 挑戰的 TXT 記錄名稱。
    pub fn dns_record_name(&self) -> String {
        format!("_acme-challenge.{}", self.domain.punycode())
    }
}
