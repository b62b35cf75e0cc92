use std::result;

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use openssl::{
    hash::MessageDigest,
    stack::Stack,
    x509::{extension::SubjectAlternativeName, X509NameBuilder, X509Req},
};
use thiserror::Error;

use crate::{
    certificate::Certificate,
    key_pair::{KeyError, KeyPair},
};

/// 用於描述建立 CSR（證書簽名請求）過程中可能發生的錯誤。
#[derive(Debug, Error)]
pub enum CsrError {
    #[error("Openssl error: {0}")]
    OpensslError(#[from] openssl::error::ErrorStack),
    #[error("Key error: {0}")]
    Key(#[from] KeyError),
    #[error("No SAN entries")]
    NoSanEntries,
}

/// 為簡化錯誤處理定義 Result 類型
type Result<T> = result::Result<T, CsrError>;

/// 為憑證產生 PEM 格式 CSR 的介面。
pub trait CsrGenerator: Send + Sync {
    /// 產生 CSR。憑證尚無私鑰時，實作可以建立一把並寫回 `certificate`。
    fn generate_csr(&self, certificate: &mut Certificate) -> Result<String>;
}

/// 表示一個 CSR 建構器，主要用於生成包含主體替代名稱 (SAN) 擴展的證書簽名請求。
#[derive(Debug, Default)]
pub struct CsrBuilder {
    san_entries: Vec<String>,
}

impl CsrBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// 新增一個 DNS 主體替代名稱 (SAN)。第一個加入的名稱同時作為 CN。
    pub fn set_san(mut self, dns_name: &str) -> Self {
        self.san_entries.push(dns_name.to_string());
        self
    }

    /// 以目前的 SAN 項目與金鑰對簽署並建立 CSR。
    ///
    /// # 錯誤
    ///
    /// 未設定任何 SAN 時回傳 [`CsrError::NoSanEntries`]。
    pub fn build(self, key_pair: &KeyPair) -> Result<X509Req> {
        let Some(common_name) = self.san_entries.first() else {
            return Err(CsrError::NoSanEntries);
        };

        let mut req_builder = X509Req::builder()?;
        let mut name = X509NameBuilder::new()?;
        name.append_entry_by_text("CN", common_name)?;
        req_builder.set_subject_name(&name.build())?;

        let mut san_builder = SubjectAlternativeName::new();
        for entry in &self.san_entries {
            san_builder.dns(entry);
        }
        let san_extension = san_builder.build(&req_builder.x509v3_context(None))?;

        let mut stack = Stack::new()?;
        stack.push(san_extension)?;
        req_builder.add_extensions(&stack)?;

        req_builder.set_pubkey(&key_pair.pri_key)?;
        req_builder.sign(&key_pair.pri_key, MessageDigest::sha256())?;

        Ok(req_builder.build())
    }
}

/// 以 OpenSSL 產生 CSR：每個網域皆列為 DNS SAN，私鑰缺少時產生新的 RSA 金鑰。
#[derive(Debug, Clone)]
pub struct OpensslCsrGenerator {
    key_bits: u32,
}

impl OpensslCsrGenerator {
    pub fn new(key_bits: u32) -> Self {
        OpensslCsrGenerator { key_bits }
    }
}

impl Default for OpensslCsrGenerator {
    fn default() -> Self {
        Self::new(KeyPair::DEFAULT_BITS)
    }
}

impl CsrGenerator for OpensslCsrGenerator {
    fn generate_csr(&self, certificate: &mut Certificate) -> Result<String> {
        if certificate.private_key_pem.is_empty() {
            certificate.private_key_pem = KeyPair::generate(self.key_bits)?.to_pem()?;
        }
        let key_pair = KeyPair::from_pem(certificate.private_key_pem.as_bytes())?;

        let builder = certificate
            .domains
            .iter()
            .fold(CsrBuilder::new(), |builder, cd| {
                builder.set_san(&cd.domain.punycode_display_name())
            });
        let csr = builder.build(&key_pair)?;
        Ok(String::from_utf8_lossy(&csr.to_pem()?).into_owned())
    }
}

/// 將 PEM 格式的 CSR 轉成 DER。
pub fn pem_to_der(csr_pem: &str) -> Result<Vec<u8>> {
    Ok(X509Req::from_pem(csr_pem.as_bytes())?.to_der()?)
}

/// finalize / new-cert 所需的 CSR 欄位：DER 的 Base64 URL 安全編碼（無填充）。
pub fn csr_field(csr_pem: &str) -> Result<String> {
    Ok(URL_SAFE_NO_PAD.encode(pem_to_der(csr_pem)?))
}
