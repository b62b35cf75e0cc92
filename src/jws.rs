//! 此模組提供 ACME 請求所需的 JSON Web Signature (JWS) 封裝，
//! 包含保護頭（protected header）的組成與以帳戶金鑰簽名。

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::key_pair::{KeyError, KeyPair};

/// 表示與 JWS 相關的錯誤。
#[derive(Error, Debug)]
pub enum JwsError {
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Key error: {0}")]
    Key(#[from] KeyError),
}

type Result<T> = std::result::Result<T, JwsError>;

/// 保護頭的資料結構。
///
/// `jwk` 與 `kid` 只會出現其中一個：尚未取得帳戶 URL（或使用 ACME v1）時帶 `jwk`，
/// 否則帶 `kid`。
#[derive(Debug, Serialize)]
pub struct ProtectedHeader {
    alg: String,
    nonce: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    jwk: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    kid: Option<String>,
}

impl ProtectedHeader {
    /// 以公開 JWK 識別簽名者的保護頭。
    pub fn with_jwk(key_pair: &KeyPair, nonce: impl Into<String>, url: &str) -> Result<Self> {
        Ok(ProtectedHeader {
            alg: KeyPair::ALG.to_string(),
            nonce: nonce.into(),
            url: Some(url.to_string()),
            jwk: Some(key_pair.jwk()?),
            kid: None,
        })
    }

    /// 以帳戶 URL（key id）識別簽名者的保護頭。
    pub fn with_kid(kid: &str, nonce: impl Into<String>, url: &str) -> Self {
        ProtectedHeader {
            alg: KeyPair::ALG.to_string(),
            nonce: nonce.into(),
            url: Some(url.to_string()),
            jwk: None,
            kid: Some(kid.to_string()),
        }
    }
}

/// 表示一個以 flattened JSON 序列化的 JWS 物件。
#[derive(Serialize, Deserialize, Debug)]
pub struct Jws {
    /// 經 Base64 URL 安全編碼的保護頭。
    #[serde(rename = "protected")]
    header: String,
    /// 經 Base64 URL 安全編碼的載荷；POST-as-GET 時為空字串。
    payload: String,
    /// 經 Base64 URL 安全編碼的簽名。
    signature: String,
}

impl Jws {
    /// 對保護頭與載荷簽名並建立 JWS。
    ///
    /// `payload` 為 `None` 時代表 POST-as-GET，載荷欄位會是空字串。
    pub fn sign(key_pair: &KeyPair, header: &ProtectedHeader, payload: Option<&Value>) -> Result<Self> {
        let header = URL_SAFE_NO_PAD.encode(serde_json::to_vec(header)?);
        let payload = match payload {
            Some(value) => URL_SAFE_NO_PAD.encode(serde_json::to_vec(value)?),
            None => String::new(),
        };
        let signing_input = format!("{}.{}", header, payload);
        let signature = URL_SAFE_NO_PAD.encode(key_pair.sign(signing_input.as_bytes())?);

        Ok(Jws {
            header,
            payload,
            signature,
        })
    }

    /// 將 `Jws` 實例序列化為 JSON 格式的字串。
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}
