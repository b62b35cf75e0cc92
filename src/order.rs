use std::{fmt, str::FromStr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::challenge::AuthorizationChallenge;

/// 訂單的種類，決定哪些協定呼叫是合法的。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderType {
    /// ACME v1：每個網域各自的一組授權，最後以 new-cert 取得憑證。
    Authorization,
    /// ACME v2：單一訂單紀錄，最後以 finalize URL 提交 CSR。
    Order,
}

impl fmt::Display for OrderType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Authorization => write!(f, "AUTHORIZATION"),
            Self::Order => write!(f, "ORDER"),
        }
    }
}

/// 訂單狀態，目前支援的狀態有 pending、ready、processing、valid 與 invalid。
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum OrderStatus {
    Pending,
    Ready,
    Processing,
    Valid,
    Invalid,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Ready => "ready",
            Self::Processing => "processing",
            Self::Valid => "valid",
            Self::Invalid => "invalid",
        }
    }
}

impl FromStr for OrderStatus {
    type Err = String;

    /// 根據字串內容解析對應的訂單狀態
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "ready" => Ok(Self::Ready),
            "processing" => Ok(Self::Processing),
            "valid" => Ok(Self::Valid),
            "invalid" => Ok(Self::Invalid),
            other => Err(other.to_string()),
        }
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 一次憑證簽發的嘗試。
///
/// `order_type` 為 [`OrderType::Order`] 時必定帶有 `order_url` 與 `finalize_url`；
/// 為 [`OrderType::Authorization`] 時兩者皆為空字串。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    /// 紀錄識別碼。
    pub id: String,
    /// 所屬憑證的識別碼。
    pub certificate_id: String,
    pub order_type: OrderType,
    pub status: OrderStatus,
    /// 訂單（或授權集合中最早）的到期時間。
    pub expiration: Option<DateTime<Utc>>,
    pub order_url: String,
    pub finalize_url: String,
    /// 訂單生效後可下載憑證的 URL。
    pub certificate_url: Option<String>,
    /// 每個網域一筆，順序與憑證網域相同。
    pub authorization_challenges: Vec<AuthorizationChallenge>,
}

impl Order {
    pub fn new(certificate_id: &str, order_type: OrderType) -> Self {
        Order {
            id: String::new(),
            certificate_id: certificate_id.to_string(),
            order_type,
            status: OrderStatus::Pending,
            expiration: None,
            order_url: String::new(),
            finalize_url: String::new(),
            certificate_url: None,
            authorization_challenges: Vec::new(),
        }
    }

    /// 目前仍標記為已啟動（驗證物可能還在外部）的挑戰數量。
    pub fn started_challenges(&self) -> usize {
        self.authorization_challenges
            .iter()
            .filter(|challenge| challenge.challenge_started)
            .count()
    }
}
