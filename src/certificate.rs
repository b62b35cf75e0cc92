use chrono::{DateTime, Utc};
use openssl::{asn1::Asn1Time, x509::X509};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{account::Account, domain::Domain};

/// 證書相關操作可能出現的錯誤類型
#[derive(Debug, Error)]
pub enum CertificateError {
    #[error("Failed to parse certificate: {0}")]
    ParseError(#[from] openssl::error::ErrorStack),
    #[error("The issued certificate chain is empty")]
    EmptyChain,
    #[error("Invalid expiration timestamp")]
    InvalidTimestamp,
}

type Result<T> = std::result::Result<T, CertificateError>;

/// 憑證與網域之間的關聯，保留網域在憑證中的順序。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CertificateDomain {
    pub domain: Domain,
}

impl From<Domain> for CertificateDomain {
    fn from(domain: Domain) -> Self {
        CertificateDomain { domain }
    }
}

/// 要申請的憑證。
///
/// `csr` 是暫存狀態：只有在某次 finalize / new-cert 呼叫成功時才會留下，
/// 其他時候皆為空字串。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Certificate {
    pub id: String,
    pub account: Account,
    pub domains: Vec<CertificateDomain>,
    /// PEM 格式的 CSR。
    #[serde(default)]
    pub csr: String,
    /// 憑證私鑰（PEM），為空時由 CSR 產生器建立。
    #[serde(default)]
    pub private_key_pem: String,
    /// 已簽發的葉憑證（PEM）。
    #[serde(default)]
    pub certificate_pem: Option<String>,
    /// 簽發者憑證鏈（PEM）。
    #[serde(default)]
    pub issuer_certificate_pem: Option<String>,
}

impl Certificate {
    pub fn new(id: &str, account: Account, domains: Vec<Domain>) -> Self {
        Certificate {
            id: id.to_string(),
            account,
            domains: domains.into_iter().map(CertificateDomain::from).collect(),
            csr: String::new(),
            private_key_pem: String::new(),
            certificate_pem: None,
            issuer_certificate_pem: None,
        }
    }

    /// 保存下載到的憑證鏈：第一張為葉憑證，其餘為簽發者憑證。
    ///
    /// # 錯誤
    ///
    /// PEM 無法解析或不含任何憑證時回傳 [`CertificateError`]，此時原有資料不變。
    pub fn set_issued_chain(&mut self, pem: &str) -> Result<()> {
        let chain = X509::stack_from_pem(pem.as_bytes())?;
        let (leaf, issuers) = chain.split_first().ok_or(CertificateError::EmptyChain)?;

        let mut issuer_pem = String::new();
        for issuer in issuers {
            issuer_pem.push_str(&String::from_utf8_lossy(&issuer.to_pem()?));
        }
        self.certificate_pem = Some(String::from_utf8_lossy(&leaf.to_pem()?).into_owned());
        self.issuer_certificate_pem = (!issuer_pem.is_empty()).then_some(issuer_pem);
        Ok(())
    }

    /// 已簽發憑證的到期時間；尚未簽發時回傳 `None`。
    pub fn not_after(&self) -> Result<Option<DateTime<Utc>>> {
        let Some(pem) = &self.certificate_pem else {
            return Ok(None);
        };
        let cert = X509::from_pem(pem.as_bytes())?;
        let epoch = Asn1Time::from_unix(0)?;
        let diff = epoch.diff(cert.not_after())?;
        let seconds = diff.days as i64 * 86400 + diff.secs as i64;
        DateTime::<Utc>::from_timestamp(seconds, 0)
            .map(Some)
            .ok_or(CertificateError::InvalidTimestamp)
    }
}
