use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use openssl::{
    error::ErrorStack,
    hash::MessageDigest,
    pkey::{Id, PKey, Private},
    rsa::Rsa,
    sha::sha256,
    sign::Signer,
};
use serde_json::{Map, Value};
use thiserror::Error;

/// 鍵相關操作的錯誤列舉。
#[derive(Debug, Error)]
pub enum KeyError {
    #[error("OpenSSL error: {0}")]
    OpenSSL(#[from] ErrorStack),
    #[error("Unsupported key algorithm, only RSA keys are supported")]
    UnsupportedAlgorithm,
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

type Result<T> = std::result::Result<T, KeyError>;

/// RSA 金鑰對，用於簽署 JWS 以及產生 CSR。
#[derive(Debug, Clone)]
pub struct KeyPair {
    /// 私鑰，使用 OpenSSL 的 `PKey` 封裝。
    pub pri_key: PKey<Private>,
}

impl KeyPair {
    /// 預設的 RSA 金鑰長度。
    pub const DEFAULT_BITS: u32 = 2048;

    /// JWS 使用的演算法名稱。
    pub const ALG: &'static str = "RS256";

    /// 產生一組新的 RSA 金鑰對。
    pub fn generate(bits: u32) -> Result<Self> {
        let rsa = Rsa::generate(bits)?;
        Ok(Self {
            pri_key: PKey::from_rsa(rsa)?,
        })
    }

    /// 根據 PEM 格式的私鑰資料建立金鑰對。
    ///
    /// # 錯誤
    ///
    /// PEM 無法解析或金鑰不是 RSA 時回傳 [`KeyError`]。
    pub fn from_pem(pri_key_pem: &[u8]) -> Result<Self> {
        let pri_key = PKey::private_key_from_pem(pri_key_pem)?;
        if pri_key.id() != Id::RSA {
            return Err(KeyError::UnsupportedAlgorithm);
        }
        Ok(Self { pri_key })
    }

    /// 以 PKCS#8 PEM 格式輸出私鑰。
    pub fn to_pem(&self) -> Result<String> {
        let pem = self.pri_key.private_key_to_pem_pkcs8()?;
        Ok(String::from_utf8_lossy(&pem).into_owned())
    }

    /// 取得符合 RFC 7638 欄位順序（`e`、`kty`、`n`）的公開 JWK。
    pub fn jwk(&self) -> Result<Value> {
        let rsa = self.pri_key.rsa()?;
        let mut map = Map::new();
        map.insert("e".to_string(), URL_SAFE_NO_PAD.encode(rsa.e().to_vec()).into());
        map.insert("kty".to_string(), "RSA".into());
        map.insert("n".to_string(), URL_SAFE_NO_PAD.encode(rsa.n().to_vec()).into());
        Ok(Value::Object(map))
    }

    /// 計算金鑰的 JWK 縮影（thumbprint），用來組成挑戰的 key authorization。
    pub fn thumbprint(&self) -> Result<String> {
        let jwk = serde_json::to_string(&self.jwk()?)?;
        Ok(URL_SAFE_NO_PAD.encode(sha256(jwk.as_bytes())))
    }

    /// 以 SHA-256 對資料簽名（RS256）。
    pub fn sign(&self, data: &[u8]) -> Result<Vec<u8>> {
        let mut signer = Signer::new(MessageDigest::sha256(), &self.pri_key)?;
        signer.update(data)?;
        Ok(signer.sign_to_vec()?)
    }
}
