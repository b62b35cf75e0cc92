//! 把伺服器回應投影到 [`Order`] 與 [`AuthorizationChallenge`] 紀錄上。
//!
//! 同時處理 RFC 8555（ACME v2）與舊版 ACME v1 的 JSON 格式：
//! v2 的挑戰以 `url` 表示位址、授權 URL 來自訂單的 `authorizations` 陣列；
//! v1 的挑戰以 `uri` 表示位址、授權 URL 來自 new-authz 回應的 `Location` 標頭。

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value;
use thiserror::Error;

use crate::{
    certificate::Certificate,
    challenge::{AuthorizationChallenge, AuthorizationStatus, ChallengeStatus},
    domain::Domain,
    handler::ChallengeHandlerRegistry,
    key_pair::KeyError,
    order::{Order, OrderStatus, OrderType},
    repository::record_id,
    transport::Response,
};

#[derive(Debug, Error)]
pub enum UnserializeError {
    #[error("Missing field in server response: {0}")]
    MissingField(&'static str),
    #[error("Missing Location header in server response")]
    MissingLocation,
    #[error("Unknown {kind} status: {value}")]
    UnknownStatus { kind: &'static str, value: String },
    #[error("Invalid timestamp {value}: {source}")]
    InvalidTimestamp {
        value: String,
        source: chrono::ParseError,
    },
    #[error("The server returned an identifier that is not part of the certificate: {0}")]
    UnknownIdentifier(String),
    #[error("Invalid challenge type set for domain {0}")]
    NoHandler(String),
    #[error("The authorization for {domain} does not offer a {challenge_type} challenge")]
    NoMatchingChallenge {
        domain: String,
        challenge_type: String,
    },
    #[error("Expected {expected} authorization responses, got {actual}")]
    CountMismatch { expected: usize, actual: usize },
    #[error("Key error: {0}")]
    Key(#[from] KeyError),
}

type Result<T> = std::result::Result<T, UnserializeError>;

/// 回應到紀錄的投影。
pub trait Unserializer: Send + Sync {
    /// 由 new-order 回應與各授權回應（順序同 `authorizations` 陣列）建立訂單。
    fn unserialize_order(
        &self,
        certificate: &Certificate,
        main: &Response,
        children: &[Response],
    ) -> Result<Order>;

    /// 由逐網域的 new-authz 回應建立授權集合。
    fn unserialize_authorization_requests(
        &self,
        certificate: &Certificate,
        responses: &[Response],
    ) -> Result<Order>;

    /// 以最新的授權與挑戰資料更新一筆紀錄。
    fn update_authorization_challenge(
        &self,
        challenge: &mut AuthorizationChallenge,
        authorization: &Value,
        challenge_data: &Value,
    ) -> Result<()>;

    /// 以訂單資料（new-order、訂單查詢或 finalize 的回應）更新訂單層級的欄位。
    fn update_main_order_record(&self, order: &mut Order, data: &Value) -> Result<()>;

    /// 由各授權的狀態重新計算授權集合的整體狀態。
    fn update_main_authorization_set_record(&self, order: &mut Order) -> Result<()>;
}

/// 預設的 [`Unserializer`]，依網域的處理器決定要採用授權中的哪個挑戰。
pub struct OrderUnserializer {
    handlers: Arc<dyn ChallengeHandlerRegistry>,
}

impl OrderUnserializer {
    pub fn new(handlers: Arc<dyn ChallengeHandlerRegistry>) -> Self {
        OrderUnserializer { handlers }
    }

    fn build_challenge(
        &self,
        certificate: &Certificate,
        thumbprint: &str,
        order_id: &str,
        authorization_url: &str,
        authorization: &Value,
    ) -> Result<AuthorizationChallenge> {
        let domain = find_domain(certificate, authorization)?;
        let handler = self
            .handlers
            .get_challenge_by_handle(domain.challenge_type_handle())
            .ok_or_else(|| UnserializeError::NoHandler(domain.host_display_name()))?;
        let challenge_type = handler.challenge_type();

        let challenge_data = authorization
            .get("challenges")
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
            .find(|c| c.get("type").and_then(Value::as_str) == Some(challenge_type))
            .ok_or_else(|| UnserializeError::NoMatchingChallenge {
                domain: domain.host_display_name(),
                challenge_type: challenge_type.to_string(),
            })?;
        let challenge_url = str_field(challenge_data, "url")
            .or_else(|_| str_field(challenge_data, "uri"))
            .map_err(|_| UnserializeError::MissingField("challenges[].url"))?;
        let token = str_field(challenge_data, "token")?;

        let mut challenge = AuthorizationChallenge::new(
            domain.clone(),
            authorization_url,
            challenge_type,
            challenge_url,
        );
        challenge.id = record_id(authorization_url);
        challenge.order_id = order_id.to_string();
        challenge.challenge_token = token.to_string();
        challenge.challenge_authorization_key = format!("{}.{}", token, thumbprint);
        self.update_authorization_challenge(&mut challenge, authorization, challenge_data)?;
        Ok(challenge)
    }
}

impl Unserializer for OrderUnserializer {
    fn unserialize_order(
        &self,
        certificate: &Certificate,
        main: &Response,
        children: &[Response],
    ) -> Result<Order> {
        let order_url = main
            .location
            .as_deref()
            .ok_or(UnserializeError::MissingLocation)?;
        let mut order = Order::new(&certificate.id, OrderType::Order);
        order.id = record_id(order_url);
        order.order_url = order_url.to_string();
        self.update_main_order_record(&mut order, &main.data)?;
        if order.finalize_url.is_empty() {
            return Err(UnserializeError::MissingField("finalize"));
        }

        let authorization_urls = main
            .data
            .get("authorizations")
            .and_then(Value::as_array)
            .ok_or(UnserializeError::MissingField("authorizations"))?;
        if authorization_urls.len() != children.len() {
            return Err(UnserializeError::CountMismatch {
                expected: authorization_urls.len(),
                actual: children.len(),
            });
        }

        let thumbprint = certificate.account.key_pair()?.thumbprint()?;
        for (url, child) in authorization_urls.iter().zip(children) {
            let url = url
                .as_str()
                .ok_or(UnserializeError::MissingField("authorizations[]"))?;
            let challenge = self.build_challenge(certificate, &thumbprint, &order.id, url, &child.data)?;
            order.authorization_challenges.push(challenge);
        }
        Ok(order)
    }

    fn unserialize_authorization_requests(
        &self,
        certificate: &Certificate,
        responses: &[Response],
    ) -> Result<Order> {
        let urls = responses
            .iter()
            .map(|response| response.location.as_deref().ok_or(UnserializeError::MissingLocation))
            .collect::<Result<Vec<_>>>()?;

        let mut order = Order::new(&certificate.id, OrderType::Authorization);
        order.id = record_id(&urls.join("\n"));

        let thumbprint = certificate.account.key_pair()?.thumbprint()?;
        for (url, response) in urls.iter().zip(responses) {
            let challenge = self.build_challenge(certificate, &thumbprint, &order.id, url, &response.data)?;
            order.authorization_challenges.push(challenge);
        }
        self.update_main_authorization_set_record(&mut order)?;
        Ok(order)
    }

    fn update_authorization_challenge(
        &self,
        challenge: &mut AuthorizationChallenge,
        authorization: &Value,
        challenge_data: &Value,
    ) -> Result<()> {
        let authorization_status = str_field(authorization, "status")?;
        challenge.authorization_status = AuthorizationStatus::from_str(authorization_status)
            .ok_or_else(|| UnserializeError::UnknownStatus {
                kind: "authorization",
                value: authorization_status.to_string(),
            })?;
        if let Some(expiration) = parse_expiration(authorization)? {
            challenge.authorization_expiration = Some(expiration);
        }

        let challenge_status = str_field(challenge_data, "status")?;
        challenge.challenge_status =
            ChallengeStatus::from_str(challenge_status).ok_or_else(|| {
                UnserializeError::UnknownStatus {
                    kind: "challenge",
                    value: challenge_status.to_string(),
                }
            })?;
        challenge.challenge_error = match challenge_data.get("error") {
            None | Some(Value::Null) => String::new(),
            Some(error) => match error.get("detail").and_then(Value::as_str) {
                Some(detail) => detail.to_string(),
                None => error.to_string(),
            },
        };
        Ok(())
    }

    fn update_main_order_record(&self, order: &mut Order, data: &Value) -> Result<()> {
        let status = str_field(data, "status")?;
        order.status = status
            .parse::<OrderStatus>()
            .map_err(|value| UnserializeError::UnknownStatus {
                kind: "order",
                value,
            })?;
        if let Some(expiration) = parse_expiration(data)? {
            order.expiration = Some(expiration);
        }
        if let Some(finalize) = data.get("finalize").and_then(Value::as_str) {
            order.finalize_url = finalize.to_string();
        }
        if let Some(certificate) = data.get("certificate").and_then(Value::as_str) {
            order.certificate_url = Some(certificate.to_string());
        }
        Ok(())
    }

    fn update_main_authorization_set_record(&self, order: &mut Order) -> Result<()> {
        let challenges = &order.authorization_challenges;
        order.status = if challenges
            .iter()
            .any(|challenge| challenge.authorization_status.is_failed())
        {
            OrderStatus::Invalid
        } else if !challenges.is_empty()
            && challenges
                .iter()
                .all(|challenge| challenge.authorization_status == AuthorizationStatus::Valid)
        {
            OrderStatus::Ready
        } else {
            OrderStatus::Pending
        };
        order.expiration = challenges
            .iter()
            .filter_map(|challenge| challenge.authorization_expiration)
            .min();
        Ok(())
    }
}

fn str_field<'a>(data: &'a Value, field: &'static str) -> Result<&'a str> {
    data.get(field)
        .and_then(Value::as_str)
        .ok_or(UnserializeError::MissingField(field))
}

fn parse_expiration(data: &Value) -> Result<Option<DateTime<Utc>>> {
    match data.get("expires").and_then(Value::as_str) {
        None => Ok(None),
        Some(value) => DateTime::parse_from_rfc3339(value)
            .map(|time| Some(time.with_timezone(&Utc)))
            .map_err(|source| UnserializeError::InvalidTimestamp {
                value: value.to_string(),
                source,
            }),
    }
}

/// 依授權回應中的識別項找出對應的憑證網域。
///
/// ACME v2 以 `wildcard: true` 標示萬用字元授權，識別項本身不含 `*.`；
/// 部分伺服器仍會回傳帶前綴的值，兩種寫法都接受。
fn find_domain<'a>(certificate: &'a Certificate, authorization: &Value) -> Result<&'a Domain> {
    let value = authorization
        .get("identifier")
        .and_then(|identifier| identifier.get("value"))
        .and_then(Value::as_str)
        .ok_or(UnserializeError::MissingField("identifier.value"))?;
    let (host, prefixed) = match value.strip_prefix("*.") {
        Some(host) => (host, true),
        None => (value, false),
    };
    let wildcard = prefixed
        || authorization
            .get("wildcard")
            .and_then(Value::as_bool)
            .unwrap_or(false);

    certificate
        .domains
        .iter()
        .map(|cd| &cd.domain)
        .find(|domain| {
            domain.punycode().eq_ignore_ascii_case(host) && domain.is_wildcard() == wildcard
        })
        .ok_or_else(|| UnserializeError::UnknownIdentifier(value.to_string()))
}
