//! ACME 協定世代的抽象層。
//!
//! 舊版（ACME v1）以逐網域授權為核心，新版（ACME v2）則以訂單為核心。
//! 兩者在 HTTP 方法、載荷格式與萬用字元支援上都不相容，因此所有差異都集中在
//! [`ProtocolStrategy`] 中，由 [`ProtocolVersion::strategy`] 在每次呼叫時挑選一次。

use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    certificate::CertificateDomain,
    challenge::AuthorizationChallenge,
    domain::Domain,
    payload::{ChallengeStartPayload, Identifier, NewAuthorizationPayload, NewOrderPayload},
    transport::Method,
};

/// 協定層級的錯誤，皆為不可重試的致命錯誤。
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Unrecognized ACME protocol version: {0}")]
    UnrecognizedVersion(String),
    #[error("ACME v1 does not support wildcard domains ({0})")]
    WildcardNotSupported(String),
    #[error("The {operation} operation is not available with {version}")]
    UnsupportedOperation {
        operation: &'static str,
        version: ProtocolVersion,
    },
}

type Result<T> = std::result::Result<T, ProtocolError>;

/// 支援的協定世代。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProtocolVersion {
    /// 舊版逐網域授權模型。
    Acme01,
    /// RFC 8555 訂單模型。
    Acme02,
}

impl ProtocolVersion {
    /// 所有已知的協定世代。
    pub const ALL: [ProtocolVersion; 2] = [ProtocolVersion::Acme01, ProtocolVersion::Acme02];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Acme01 => "acme01",
            Self::Acme02 => "acme02",
        }
    }

    /// 取得此世代對應的策略實作。
    pub fn strategy(self) -> &'static dyn ProtocolStrategy {
        match self {
            Self::Acme01 => &Acme01,
            Self::Acme02 => &Acme02,
        }
    }
}

impl FromStr for ProtocolVersion {
    type Err = ProtocolError;

    /// 解析伺服器設定中的協定字串。只接受完全相同的 `acme01` / `acme02`，
    /// 其他值一律回傳 [`ProtocolError::UnrecognizedVersion`]。
    fn from_str(s: &str) -> Result<Self> {
        match s {
            "acme01" => Ok(Self::Acme01),
            "acme02" => Ok(Self::Acme02),
            _ => Err(ProtocolError::UnrecognizedVersion(s.to_string())),
        }
    }
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Acme01 => write!(f, "ACME v1"),
            Self::Acme02 => write!(f, "ACME v2"),
        }
    }
}

/// 解析協定字串並回傳對應策略。
pub fn resolve(version: &str) -> Result<&'static dyn ProtocolStrategy> {
    Ok(version.parse::<ProtocolVersion>()?.strategy())
}

/// 每個協定世代必須提供的行為。
///
/// 協調器只透過此介面決定 HTTP 方法與載荷格式，不再自行比對版本。
pub trait ProtocolStrategy: fmt::Debug + Send + Sync {
    /// 此策略所代表的協定世代。
    fn version(&self) -> ProtocolVersion;

    /// 讀取訂單、授權、挑戰與憑證時使用的 HTTP 方法。
    ///
    /// ACME v1 使用一般 GET，ACME v2 使用 POST-as-GET（不帶載荷的 POST）。
    fn fetch_method(&self) -> Method;

    /// 是否支援萬用字元網域。
    fn supports_wildcard(&self) -> bool;

    /// 是否支援 new-order / finalize 流程。
    fn supports_orders(&self) -> bool;

    /// 是否支援 new-cert 端點。
    fn supports_new_cert(&self) -> bool;

    /// new-order 請求使用的 HTTP 方法。
    fn new_order_method(&self) -> Result<Method> {
        self.require_orders()?;
        Ok(Method::Post)
    }

    /// 依照網域順序建立 new-order 載荷。
    fn new_order_payload(&self, domains: &[CertificateDomain]) -> Result<NewOrderPayload> {
        self.require_orders()?;
        let mut identifiers = Vec::with_capacity(domains.len());
        for cd in domains {
            self.require_wildcard(&cd.domain)?;
            identifiers.push(Identifier::dns(cd.domain.punycode_display_name()));
        }
        Ok(NewOrderPayload::new(identifiers))
    }

    /// 建立 new-authz 請求的載荷；不支援萬用字元的世代會拒絕萬用字元網域。
    fn new_authorization_payload(&self, domain: &Domain) -> Result<NewAuthorizationPayload> {
        self.require_wildcard(domain)?;
        Ok(self.authorization_payload(domain))
    }

    /// 此世代的 new-authz 載荷格式。
    fn authorization_payload(&self, domain: &Domain) -> NewAuthorizationPayload;

    /// 建立接受挑戰（開始驗證）的載荷。
    fn challenge_start_payload(&self, challenge: &AuthorizationChallenge) -> ChallengeStartPayload;

    /// 若網域為萬用字元而此世代不支援則回傳錯誤。
    fn require_wildcard(&self, domain: &Domain) -> Result<()> {
        if domain.is_wildcard() && !self.supports_wildcard() {
            Err(ProtocolError::WildcardNotSupported(domain.host_display_name()))
        } else {
            Ok(())
        }
    }

    /// 若此世代不支援訂單流程則回傳錯誤。
    fn require_orders(&self) -> Result<()> {
        if self.supports_orders() {
            Ok(())
        } else {
            Err(ProtocolError::UnsupportedOperation {
                operation: "new-order",
                version: self.version(),
            })
        }
    }

    /// 若此世代不支援 new-cert 端點則回傳錯誤。
    fn require_new_cert(&self) -> Result<()> {
        if self.supports_new_cert() {
            Ok(())
        } else {
            Err(ProtocolError::UnsupportedOperation {
                operation: "new-cert",
                version: self.version(),
            })
        }
    }
}

/// ACME v1 策略。
#[derive(Debug, Clone, Copy, Default)]
pub struct Acme01;

/// ACME v2 策略。
#[derive(Debug, Clone, Copy, Default)]
pub struct Acme02;

impl ProtocolStrategy for Acme01 {
    fn version(&self) -> ProtocolVersion {
        ProtocolVersion::Acme01
    }

    fn fetch_method(&self) -> Method {
        Method::Get
    }

    fn supports_wildcard(&self) -> bool {
        false
    }

    fn supports_orders(&self) -> bool {
        false
    }

    fn supports_new_cert(&self) -> bool {
        true
    }

    fn authorization_payload(&self, domain: &Domain) -> NewAuthorizationPayload {
        NewAuthorizationPayload::legacy(Identifier::dns(domain.punycode()))
    }

    fn challenge_start_payload(&self, challenge: &AuthorizationChallenge) -> ChallengeStartPayload {
        ChallengeStartPayload::legacy(&challenge.challenge_authorization_key)
    }
}

impl ProtocolStrategy for Acme02 {
    fn version(&self) -> ProtocolVersion {
        ProtocolVersion::Acme02
    }

    fn fetch_method(&self) -> Method {
        Method::Post
    }

    fn supports_wildcard(&self) -> bool {
        true
    }

    fn supports_orders(&self) -> bool {
        true
    }

    fn supports_new_cert(&self) -> bool {
        false
    }

    fn authorization_payload(&self, domain: &Domain) -> NewAuthorizationPayload {
        NewAuthorizationPayload::new(Identifier::dns(domain.punycode()), domain.is_wildcard())
    }

    fn challenge_start_payload(&self, _challenge: &AuthorizationChallenge) -> ChallengeStartPayload {
        ChallengeStartPayload::empty()
    }
}
