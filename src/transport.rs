//! 簽名請求的傳輸層。
//!
//! [`Transport`] 是協調器唯一的網路出口：送出一個請求並回傳狀態碼、`Location`
//! 標頭與解碼後的本文；狀態碼不在預期集合內時回傳 [`TransportError::UnexpectedStatus`]。

use std::{collections::VecDeque, fmt, string::FromUtf8Error, sync::Mutex, time::Duration};

use log::debug;
use openssl::x509::X509;
use reqwest::{
    blocking::Client,
    header::{CONTENT_TYPE, LOCATION},
};
use serde_json::Value;
use thiserror::Error;

use crate::{
    account::Account,
    jws::{Jws, JwsError, ProtectedHeader},
    key_pair::KeyError,
    nonce::{NonceError, NonceT, NoncePool},
    protocol::{ProtocolError, ProtocolVersion},
};

/// 傳輸層錯誤。
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Request error: {0}")]
    Request(#[from] reqwest::Error),
    #[error("Connection failed: {0}")]
    Connection(String),
    #[error("Unexpected response to {method} {url}: HTTP {code} (expected {expected:?}): {detail}")]
    UnexpectedStatus {
        method: Method,
        url: String,
        code: u16,
        expected: Vec<u16>,
        detail: String,
    },
    #[error("Nonce error: {0}")]
    Nonce(#[from] NonceError),
    #[error("JWS error: {0}")]
    Jws(#[from] JwsError),
    #[error("Key error: {0}")]
    Key(#[from] KeyError),
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Request header error: {0}")]
    Header(#[from] reqwest::header::ToStrError),
    #[error("Response body is not valid UTF-8: {0}")]
    Utf8(#[from] FromUtf8Error),
    #[error("Invalid DER certificate in response: {0}")]
    Certificate(#[from] openssl::error::ErrorStack),
}

type Result<T> = std::result::Result<T, TransportError>;

/// 請求所使用的 HTTP 方法。不帶載荷的 `Post` 即為 POST-as-GET。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Post,
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Method::Get => write!(f, "GET"),
            Method::Post => write!(f, "POST"),
        }
    }
}

/// 解碼後的回應。
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    /// HTTP 狀態碼。
    pub code: u16,
    /// `Location` 標頭（新建立的資源 URL）。
    pub location: Option<String>,
    /// JSON 本文解碼為物件；其他本文（例如 PEM 憑證鏈）為 [`Value::String`]。
    /// `application/pkix-cert`（DER）本文會先轉成 PEM。
    pub data: Value,
}

impl Response {
    pub fn new(code: u16, data: Value) -> Self {
        Response {
            code,
            location: None,
            data,
        }
    }

    pub fn with_location(mut self, location: &str) -> Self {
        self.location = Some(location.to_string());
        self
    }

    /// 是否為 2xx 回應。
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.code)
    }
}

/// 送出一個經過帳戶簽名的 ACME 請求。
pub trait Transport: Send + Sync {
    /// # 參數
    ///
    /// - `account`: 簽署請求的帳戶。
    /// - `method`: HTTP 方法。
    /// - `url`: 目標 URL。
    /// - `payload`: 載荷；`None` 搭配 `Post` 即為 POST-as-GET。
    /// - `expected`: 可接受的狀態碼。
    ///
    /// # Errors
    ///
    /// 網路失敗或狀態碼不在 `expected` 中時回傳 [`TransportError`]。
    fn send(
        &self,
        account: &Account,
        method: Method,
        url: &str,
        payload: Option<&Value>,
        expected: &[u16],
    ) -> Result<Response>;
}

/// 以 blocking `reqwest` 實作的傳輸層，所有 POST 皆以帳戶金鑰簽署為 JWS。
pub struct HttpTransport {
    client: Client,
    nonces: Box<dyn NonceT>,
}

impl HttpTransport {
    /// 使用預設設定建立傳輸層。
    pub fn new() -> Result<Self> {
        HttpTransportBuilder::new().build()
    }

    /// 建立簽好名的 JWS 本文。
    fn signed_body(&self, account: &Account, url: &str, payload: Option<&Value>) -> Result<String> {
        let version = account.protocol()?.version();
        let key_pair = account.key_pair()?;
        let nonce = self.nonces.get(&account.server)?;
        let header = match version {
            ProtocolVersion::Acme02 if !account.registration_uri.is_empty() => {
                ProtectedHeader::with_kid(&account.registration_uri, nonce, url)
            }
            _ => ProtectedHeader::with_jwk(&key_pair, nonce, url)?,
        };
        Ok(Jws::sign(&key_pair, &header, payload)?.to_json()?)
    }
}

impl fmt::Debug for HttpTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpTransport").finish_non_exhaustive()
    }
}

impl Transport for HttpTransport {
    fn send(
        &self,
        account: &Account,
        method: Method,
        url: &str,
        payload: Option<&Value>,
        expected: &[u16],
    ) -> Result<Response> {
        let request = match method {
            Method::Get => self.client.get(url),
            Method::Post => self
                .client
                .post(url)
                .header(CONTENT_TYPE, "application/jose+json")
                .body(self.signed_body(account, url, payload)?),
        };
        let response = request.send()?;

        if let Some(nonce) = response.headers().get("Replay-Nonce") {
            self.nonces
                .remember(&account.server, nonce.to_str()?.to_string());
        }
        let code = response.status().as_u16();
        debug!("{} {} -> HTTP {}", method, url, code);
        let location = match response.headers().get(LOCATION) {
            Some(value) => Some(value.to_str()?.to_string()),
            None => None,
        };
        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);
        let body = response.bytes()?;

        let data = checked_body(method, url, code, content_type.as_deref(), &body, expected)?;
        Ok(Response {
            code,
            location,
            data,
        })
    }
}

/// 檢查狀態碼並解碼本文。
///
/// 狀態碼不符時回傳 [`TransportError::UnexpectedStatus`]；此時本文無法解碼也只作為錯誤說明，
/// 不會蓋掉狀態碼。
fn checked_body(
    method: Method,
    url: &str,
    code: u16,
    content_type: Option<&str>,
    body: &[u8],
    expected: &[u16],
) -> Result<Value> {
    if expected.contains(&code) {
        return decode_body(body, content_type);
    }
    let data = decode_body(body, content_type)
        .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(body).into_owned()));
    Err(TransportError::UnexpectedStatus {
        method,
        url: url.to_string(),
        code,
        expected: expected.to_vec(),
        detail: problem_detail(&data),
    })
}

/// [`HttpTransport`] 的構造器。
pub struct HttpTransportBuilder {
    user_agent: String,
    timeout: Option<Duration>,
    nonces: Option<Box<dyn NonceT>>,
}

impl HttpTransportBuilder {
    /// 預設的 User-Agent。
    const DEFAULT_USER_AGENT: &'static str =
        concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"));

    pub fn new() -> Self {
        HttpTransportBuilder {
            user_agent: Self::DEFAULT_USER_AGENT.to_string(),
            timeout: None,
            nonces: None,
        }
    }

    /// 設置 User-Agent。
    pub fn user_agent(mut self, user_agent: &str) -> Self {
        self.user_agent = user_agent.to_string();
        self
    }

    /// 設置單一請求的逾時時間；未設置時沿用 `reqwest` 的預設值。
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// 以自訂的 Nonce 來源取代預設的 [`NoncePool`]。
    pub fn nonces(mut self, nonces: Box<dyn NonceT>) -> Self {
        self.nonces = Some(nonces);
        self
    }

    pub fn build(self) -> Result<HttpTransport> {
        let mut builder = Client::builder().user_agent(self.user_agent);
        if let Some(timeout) = self.timeout {
            builder = builder.timeout(timeout);
        }
        let client = builder.build()?;
        let nonces = match self.nonces {
            Some(nonces) => nonces,
            None => Box::new(NoncePool::new(client.clone())),
        };
        Ok(HttpTransport { client, nonces })
    }
}

impl Default for HttpTransportBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// 依 `Content-Type` 解碼本文。
///
/// - JSON：解碼成物件，空本文視為 `null`。
/// - `application/pkix-cert`：ACME v1 以 DER 回傳憑證，轉成 PEM 字串。
/// - 其他（例如 `application/pem-certificate-chain`）：必須是合法的 UTF-8 文字。
fn decode_body(body: &[u8], content_type: Option<&str>) -> Result<Value> {
    let media_type = content_type
        .and_then(|value| value.split(';').next())
        .map(|value| value.trim().to_ascii_lowercase())
        .unwrap_or_default();

    if media_type.contains("json") {
        if body.iter().all(u8::is_ascii_whitespace) {
            return Ok(Value::Null);
        }
        return Ok(serde_json::from_slice(body)?);
    }
    if media_type == PKIX_CERT && !body.is_empty() {
        let pem = X509::from_der(body)?.to_pem()?;
        return Ok(Value::String(String::from_utf8(pem)?));
    }
    Ok(Value::String(String::from_utf8(body.to_vec())?))
}

const PKIX_CERT: &str = "application/pkix-cert";

/// 從 RFC 7807 problem document 取出可讀的錯誤說明。
fn problem_detail(data: &Value) -> String {
    match (data.get("type"), data.get("detail")) {
        (Some(Value::String(kind)), Some(Value::String(detail))) => format!("{}: {}", kind, detail),
        (_, Some(Value::String(detail))) => detail.clone(),
        _ => match data {
            Value::String(text) => text.clone(),
            other => other.to_string(),
        },
    }
}

/// 傳輸層收到的一次請求紀錄。
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedRequest {
    pub method: Method,
    pub url: String,
    pub payload: Option<Value>,
    pub expected: Vec<u16>,
}

/// 依序回放預先排好的回應，並記錄收到的每個請求，通常用於測試。
///
/// 與真正的傳輸層一樣，回應狀態碼不在預期集合內時回傳
/// [`TransportError::UnexpectedStatus`]；回應用罄時回傳 [`TransportError::Connection`]。
#[derive(Debug, Default)]
pub struct MockTransport {
    responses: Mutex<VecDeque<Result<Response>>>,
    requests: Mutex<Vec<RecordedRequest>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// 排入一個回應。
    pub fn push_response(&self, response: Response) -> &Self {
        if let Ok(mut responses) = self.responses.lock() {
            responses.push_back(Ok(response));
        }
        self
    }

    /// 排入一個錯誤。
    pub fn push_error(&self, error: TransportError) -> &Self {
        if let Ok(mut responses) = self.responses.lock() {
            responses.push_back(Err(error));
        }
        self
    }

    /// 目前為止收到的所有請求。
    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.requests
            .lock()
            .map(|requests| requests.clone())
            .unwrap_or_default()
    }

    /// 尚未被取用的回應數量。
    pub fn remaining(&self) -> usize {
        self.responses
            .lock()
            .map(|responses| responses.len())
            .unwrap_or_default()
    }
}

impl Transport for MockTransport {
    fn send(
        &self,
        _account: &Account,
        method: Method,
        url: &str,
        payload: Option<&Value>,
        expected: &[u16],
    ) -> Result<Response> {
        if let Ok(mut requests) = self.requests.lock() {
            requests.push(RecordedRequest {
                method,
                url: url.to_string(),
                payload: payload.cloned(),
                expected: expected.to_vec(),
            });
        }
        let next = self
            .responses
            .lock()
            .map_err(|_| TransportError::Connection("mock transport lock poisoned".to_string()))?
            .pop_front();
        let response = match next {
            Some(result) => result?,
            None => {
                return Err(TransportError::Connection(format!(
                    "no response scripted for {} {}",
                    method, url
                )))
            }
        };
        if !expected.contains(&response.code) {
            return Err(TransportError::UnexpectedStatus {
                method,
                url: url.to_string(),
                code: response.code,
                expected: expected.to_vec(),
                detail: problem_detail(&response.data),
            });
        }
        Ok(response)
    }
}
