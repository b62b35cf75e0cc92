use serde::{Deserialize, Serialize};
use thiserror::Error;

/// 網域名稱解析時可能發生的錯誤。
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    #[error("Empty domain name")]
    Empty,
    #[error("Invalid domain name {name}: {reason}")]
    Invalid { name: String, reason: String },
}

type Result<T> = std::result::Result<T, DomainError>;

const WILDCARD_PREFIX: &str = "*.";

/// 要申請憑證的 DNS 名稱。
///
/// 內部保存去除 `*.` 前綴後的主機名稱（原始輸入與 punycode 兩種形式），
/// 並另以旗標記錄是否為萬用字元網域。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Domain {
    host: String,
    punycode: String,
    is_wildcard: bool,
    challenge_type_handle: String,
}

impl Domain {
    /// 解析網域名稱並以 IDNA 轉成 punycode。
    ///
    /// # 參數
    ///
    /// - `name`: 網域名稱，可包含 `*.` 前綴與非 ASCII 字元。
    /// - `challenge_type_handle`: 此網域使用的驗證方式代號。
    ///
    /// # 錯誤
    ///
    /// 名稱為空、含有內嵌的 `*`，或 IDNA 轉換失敗時回傳 [`DomainError`]。
    pub fn new(name: &str, challenge_type_handle: &str) -> Result<Self> {
        let name = name.trim();
        let (host, is_wildcard) = match name.strip_prefix(WILDCARD_PREFIX) {
            Some(host) => (host, true),
            None => (name, false),
        };
        let host = host.trim_end_matches('.');
        if host.is_empty() {
            return Err(DomainError::Empty);
        }
        if host.contains('*') {
            return Err(DomainError::Invalid {
                name: name.to_string(),
                reason: "wildcards are only allowed as the leftmost label".to_string(),
            });
        }
        let punycode = idna::domain_to_ascii(host).map_err(|e| DomainError::Invalid {
            name: name.to_string(),
            reason: e.to_string(),
        })?;

        Ok(Domain {
            host: host.to_lowercase(),
            punycode,
            is_wildcard,
            challenge_type_handle: challenge_type_handle.to_string(),
        })
    }

    /// 供人閱讀的名稱，萬用字元網域保留 `*.` 前綴。
    pub fn host_display_name(&self) -> String {
        self.with_prefix(&self.host)
    }

    /// 不含 `*.` 前綴的 punycode 名稱。
    pub fn punycode(&self) -> &str {
        &self.punycode
    }

    /// 含 `*.` 前綴的 punycode 名稱，用於 new-order 識別項。
    pub fn punycode_display_name(&self) -> String {
        self.with_prefix(&self.punycode)
    }

    pub fn is_wildcard(&self) -> bool {
        self.is_wildcard
    }

    pub fn challenge_type_handle(&self) -> &str {
        &self.challenge_type_handle
    }

    fn with_prefix(&self, name: &str) -> String {
        if self.is_wildcard {
            format!("{}{}", WILDCARD_PREFIX, name)
        } else {
            name.to_string()
        }
    }
}
