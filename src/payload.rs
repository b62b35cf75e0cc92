use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::error::Error;

/// 定義所有 ACME 請求載荷（Payload）必須實作的功能。
///
/// 傳輸層接受 [`serde_json::Value`]，因此此 trait 提供轉換成 JSON 值的方法，
/// 並要求實作者提供自己的驗證邏輯。
pub trait PayloadT: Serialize + for<'de> Deserialize<'de> {
    /// 將載荷轉換成 JSON 格式的字串。
    ///
    /// # 錯誤
    ///
    /// 若序列化失敗，則回傳 [`serde_json::Error`]。
    fn to_json_string(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// 將載荷轉換成 [`Value`]，供傳輸層送出。
    ///
    /// # 錯誤
    ///
    /// 若序列化失敗，則回傳 [`serde_json::Error`]。
    fn to_value(&self) -> Result<Value, serde_json::Error> {
        serde_json::to_value(self)
    }

    /// 驗證載荷資料是否符合預期的規範。
    fn validate(&self) -> Result<(), Box<dyn Error>>;
}

/// 表示一個識別項，用來描述證書所涵蓋的主機名稱。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identifier {
    #[serde(rename = "type")]
    pub type_: String,
    pub value: String,
}

impl Identifier {
    /// 建立類型為 `"dns"` 的識別項。
    pub fn dns(value: impl Into<String>) -> Self {
        Identifier {
            type_: "dns".to_string(),
            value: value.into(),
        }
    }
}

/// 建立新訂單（ACME v2）時所需的載荷資料。
///
/// 識別項的順序即為證書網域的順序。
#[derive(Debug, Serialize, Deserialize)]
pub struct NewOrderPayload {
    pub identifiers: Vec<Identifier>,
}

impl NewOrderPayload {
    pub fn new(identifiers: Vec<Identifier>) -> Self {
        NewOrderPayload { identifiers }
    }
}

impl PayloadT for NewOrderPayload {
    /// 驗證新訂單載荷資料：
    ///
    /// - 必須至少包含一個識別項。
    /// - 所有識別項的類型必須為 `"dns"` 且值不得為空。
    fn validate(&self) -> Result<(), Box<dyn Error>> {
        if self.identifiers.is_empty() {
            return Err("At least one identifier is required".into());
        }
        for identifier in &self.identifiers {
            if identifier.type_ != "dns" {
                return Err("Identifier type must be 'dns'".into());
            }
            if identifier.value.is_empty() {
                return Err("Identifier value cannot be empty".into());
            }
        }
        Ok(())
    }
}

/// 建立單一網域授權（new-authz）時的載荷資料。
///
/// ACME v1 需要 `resource` 欄位且不支援萬用字元；ACME v2 以 `wildcard` 旗標標示萬用字元網域。
#[derive(Debug, Serialize, Deserialize)]
pub struct NewAuthorizationPayload {
    pub identifier: Identifier,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resource: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub wildcard: Option<bool>,
}

impl NewAuthorizationPayload {
    /// ACME v1 格式：`{identifier, resource: "new-authz"}`。
    pub fn legacy(identifier: Identifier) -> Self {
        NewAuthorizationPayload {
            identifier,
            resource: Some("new-authz".to_string()),
            wildcard: None,
        }
    }

    /// ACME v2 格式：僅在萬用字元網域時加上 `wildcard: true`。
    pub fn new(identifier: Identifier, wildcard: bool) -> Self {
        NewAuthorizationPayload {
            identifier,
            resource: None,
            wildcard: wildcard.then_some(true),
        }
    }
}

impl PayloadT for NewAuthorizationPayload {
    fn validate(&self) -> Result<(), Box<dyn Error>> {
        if self.identifier.value.is_empty() {
            return Err("Identifier value cannot be empty".into());
        }
        if self.resource.is_some() && self.wildcard.is_some() {
            return Err("Wildcard identifiers cannot be sent as a new-authz resource".into());
        }
        Ok(())
    }
}

/// 接受挑戰（開始驗證）時的載荷資料。
///
/// ACME v2 送出空物件 `{}`；ACME v1 需附上 `resource` 與 `keyAuthorization`。
#[derive(Debug, Serialize, Deserialize, Default)]
pub struct ChallengeStartPayload {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resource: Option<String>,
    #[serde(rename = "keyAuthorization", skip_serializing_if = "Option::is_none")]
    pub key_authorization: Option<String>,
}

impl ChallengeStartPayload {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn legacy(key_authorization: &str) -> Self {
        ChallengeStartPayload {
            resource: Some("challenge".to_string()),
            key_authorization: Some(key_authorization.to_string()),
        }
    }
}

impl PayloadT for ChallengeStartPayload {
    /// 舊版格式必須帶有非空的 key authorization。
    fn validate(&self) -> Result<(), Box<dyn Error>> {
        match (&self.resource, &self.key_authorization) {
            (None, None) => Ok(()),
            (Some(_), Some(key)) if !key.is_empty() => Ok(()),
            _ => Err("Legacy challenge payload requires a key authorization".into()),
        }
    }
}

/// 表示最終化訂單時所需的載荷資料。
///
/// `csr` 為 DER 格式 CSR 的 Base64 URL 安全編碼（無填充）。
#[derive(Debug, Serialize, Deserialize)]
pub struct FinalizeOrderPayload {
    #[serde(rename = "csr")]
    csr_b64_str: String,
}

impl FinalizeOrderPayload {
    pub fn new(csr_b64: impl Into<String>) -> Self {
        FinalizeOrderPayload {
            csr_b64_str: csr_b64.into(),
        }
    }
}

impl PayloadT for FinalizeOrderPayload {
    fn validate(&self) -> Result<(), Box<dyn Error>> {
        if self.csr_b64_str.is_empty() {
            return Err("CSR cannot be empty".into());
        }
        Ok(())
    }
}

/// ACME v1 的 new-cert 載荷：`{resource: "new-cert", csr}`。
#[derive(Debug, Serialize, Deserialize)]
pub struct NewCertPayload {
    resource: String,
    csr: String,
}

impl NewCertPayload {
    pub fn new(csr_b64: impl Into<String>) -> Self {
        NewCertPayload {
            resource: "new-cert".to_string(),
            csr: csr_b64.into(),
        }
    }
}

impl PayloadT for NewCertPayload {
    fn validate(&self) -> Result<(), Box<dyn Error>> {
        if self.csr.is_empty() {
            return Err("CSR cannot be empty".into());
        }
        Ok(())
    }
}
