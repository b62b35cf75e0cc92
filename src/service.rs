//! 訂單流程的協調器。
//!
//! [`OrderService`] 依序執行建立訂單、啟動與刷新挑戰、最終化與下載憑證等步驟。
//! 每次呼叫只做同步的網路往返，並在每次往返後立即透過 [`Persister`] 寫入受影響的紀錄；
//! 兩次呼叫之間不保留任何狀態。
//!
//! 需要在失敗時回復的暫存狀態（產生到一半的 CSR、已佈置的驗證物）以 guard 表示：
//! guard 在 drop 時執行補償步驟，只有呼叫 `commit` 才會解除。

use std::{
    ops::{Deref, DerefMut},
    sync::Arc,
    thread,
    time::Duration,
};

use log::{debug, info, warn};
use serde_json::Value;
use thiserror::Error;

use crate::{
    account::Account,
    certificate::Certificate,
    challenge::{AuthorizationChallenge, ChallengeStatus},
    csr::{csr_field, CsrError, CsrGenerator, OpensslCsrGenerator},
    handler::{ChallengeHandler, ChallengeHandlerRegistry, HandlerError},
    order::{Order, OrderType},
    payload::{FinalizeOrderPayload, NewCertPayload, PayloadT},
    protocol::{ProtocolError, ProtocolStrategy},
    repository::{Persister, RepositoryError, StorageRepository},
    storage::{DirStorage, StorageError},
    transport::{HttpTransport, Method, Response, Transport, TransportError},
    unserializer::{OrderUnserializer, UnserializeError, Unserializer},
};

/// 協調器可能回傳的錯誤。
#[derive(Debug, Error)]
pub enum OrderServiceError {
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("Unserialize error: {0}")]
    Unserialize(#[from] UnserializeError),
    #[error("Repository error: {0}")]
    Repository(#[from] RepositoryError),
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("CSR error: {0}")]
    Csr(#[from] CsrError),
    #[error("Challenge handler error: {0}")]
    Handler(#[from] HandlerError),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Invalid challenge type set for domain {0}")]
    InvalidChallengeType(String),
    #[error("The {operation} operation requires an order of type {expected}, got {actual}")]
    OrderTypeMismatch {
        operation: &'static str,
        expected: OrderType,
        actual: OrderType,
    },
    #[error("The order has no finalize URL")]
    MissingFinalizeUrl,
    #[error("Error downloading the certificate: empty result")]
    EmptyCertificate,
    #[error("Error downloading the certificate: expected a string, got {0}")]
    UnexpectedCertificateBody(&'static str),
    #[error("Missing component: {0}")]
    MissingComponent(&'static str),
}

type Result<T> = std::result::Result<T, OrderServiceError>;

/// 下載憑證時最多嘗試的次數。
const MAX_DOWNLOAD_ATTEMPTS: usize = 2;

/// 讀取訂單、授權與挑戰時接受的狀態碼。
const FETCH_STATUS: &[u16] = &[200, 202];

/// 訂單與挑戰生命週期的協調器。
pub struct OrderService {
    transport: Arc<dyn Transport>,
    unserializer: Arc<dyn Unserializer>,
    handlers: Arc<dyn ChallengeHandlerRegistry>,
    persister: Arc<dyn Persister>,
    csr_generator: Arc<dyn CsrGenerator>,
    download_retry_delay: Duration,
}

impl OrderService {
    pub fn builder() -> OrderServiceBuilder {
        OrderServiceBuilder::new()
    }

    /// 建立 ACME v2 訂單並取回每筆授權的內容。
    ///
    /// 網域順序即為 `identifiers` 的順序。建立後的訂單會立即寫入持久層。
    ///
    /// # Errors
    ///
    /// 協定不是 ACME v2、任何請求的狀態碼不符預期，或回應無法投影成訂單時回傳錯誤。
    pub fn create_order(&self, certificate: &Certificate) -> Result<Order> {
        let account = &certificate.account;
        let strategy = account.protocol()?;
        let method = strategy.new_order_method()?;
        let payload = strategy.new_order_payload(&certificate.domains)?.to_value()?;

        debug!("Creating a new order at {}", account.server.new_order_url);
        let main = self.transport.send(
            account,
            method,
            &account.server.new_order_url,
            Some(&payload),
            &[201],
        )?;

        let mut children = Vec::new();
        let authorization_urls = main
            .data
            .get("authorizations")
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
            .filter_map(Value::as_str);
        for url in authorization_urls {
            debug!("Fetching authorization {}", url);
            children.push(
                self.transport
                    .send(account, strategy.fetch_method(), url, None, &[200])?,
            );
        }

        let order = self
            .unserializer
            .unserialize_order(certificate, &main, &children)?;
        self.persister.flush_order(&order)?;
        info!(
            "Created order {} with {} authorizations",
            order.order_url,
            order.authorization_challenges.len()
        );
        Ok(order)
    }

    /// 為每個網域各自送出 new-authz 請求，並把結果整理成一個授權集合。
    ///
    /// 所有載荷都在送出第一個請求前建立，因此 ACME v1 的萬用字元網域不會產生任何網路請求。
    pub fn create_authorization_challenges(&self, certificate: &Certificate) -> Result<Order> {
        let account = &certificate.account;
        let strategy = account.protocol()?;

        let mut payloads = Vec::with_capacity(certificate.domains.len());
        for certificate_domain in &certificate.domains {
            payloads.push(
                strategy
                    .new_authorization_payload(&certificate_domain.domain)?
                    .to_value()?,
            );
        }

        let mut responses = Vec::with_capacity(payloads.len());
        for (payload, certificate_domain) in payloads.iter().zip(&certificate.domains) {
            debug!(
                "Requesting authorization for {}",
                certificate_domain.domain.host_display_name()
            );
            responses.push(self.transport.send(
                account,
                Method::Post,
                &account.server.new_authorization_url,
                Some(payload),
                &[201],
            )?);
        }

        let order = self
            .unserializer
            .unserialize_authorization_requests(certificate, &responses)?;
        self.persister.flush_order(&order)?;
        info!(
            "Created {} authorizations for certificate {}",
            order.authorization_challenges.len(),
            certificate.id
        );
        Ok(order)
    }

    /// 啟動所有仍處於 `pending/pending` 的挑戰。
    ///
    /// 只要有任何挑戰被啟動，就重新計算訂單的整體狀態並寫入。
    /// `order` 必須已經寫入過持久層。
    pub fn start_authorization_challenges(&self, account: &Account, order: &mut Order) -> Result<()> {
        let strategy = account.protocol()?;
        let mut refresh_global_state = false;
        for challenge in order.authorization_challenges.iter_mut() {
            if challenge.is_pending() {
                self.start_authorization_challenge(account, strategy, challenge)?;
                refresh_global_state = true;
            }
        }
        if refresh_global_state {
            self.update_order_aggregate(account, strategy, order)?;
            self.persister.flush_order(order)?;
        }
        Ok(())
    }

    /// 啟動單一挑戰。
    ///
    /// 驗證物佈置完成並將 `challenge_started` 寫入持久層之後，才送出接受挑戰的請求。
    /// 請求失敗時會重新讀取伺服器上的狀態：若挑戰已不再是 `pending`，失敗視為無害；
    /// 否則回傳原本的錯誤。只要挑戰最後沒有維持啟動狀態，就會移除驗證物並清除旗標。
    fn start_authorization_challenge(
        &self,
        account: &Account,
        strategy: &dyn ProtocolStrategy,
        challenge: &mut AuthorizationChallenge,
    ) -> Result<()> {
        let handler = self
            .handlers
            .get_challenge_by_handle(challenge.domain.challenge_type_handle())
            .ok_or_else(|| {
                OrderServiceError::InvalidChallengeType(challenge.domain.host_display_name())
            })?;
        let payload = strategy.challenge_start_payload(challenge).to_value()?;

        let newly_started = !challenge.challenge_started;
        if newly_started {
            handler.before_challenge(challenge)?;
        }
        let mut started = StartedChallenge::new(challenge, handler, self.persister.as_ref(), newly_started);
        started.challenge_started = true;
        self.persister.flush_challenge(&started)?;

        debug!("Starting challenge {}", started.challenge_url);
        let start_result = self.transport.send(
            account,
            Method::Post,
            &started.challenge_url,
            Some(&payload),
            &[200, 202],
        );
        let challenge_data = match &start_result {
            Ok(response) => response.data.clone(),
            Err(e) => {
                debug!(
                    "Starting challenge {} failed ({}), checking the server state",
                    started.challenge_url, e
                );
                self.fetch(account, strategy, &started.challenge_url)?
            }
        };
        let authorization_data = self.fetch(account, strategy, &started.authorization_url)?;
        self.unserializer
            .update_authorization_challenge(&mut started, &authorization_data, &challenge_data)?;

        if let Err(e) = start_result {
            if started.challenge_status == ChallengeStatus::Pending {
                return Err(e.into());
            }
            debug!(
                "Ignoring failed start of {}: the challenge is already {}",
                started.challenge_url, started.challenge_status
            );
        }
        self.persister.flush_challenge(&started)?;
        info!(
            "Challenge for {} started ({})",
            started.domain.host_display_name(),
            started.challenge_status
        );
        started.commit();
        Ok(())
    }

    /// 重新讀取每個挑戰的授權與挑戰狀態，再更新訂單的整體狀態。
    ///
    /// 伺服器狀態未改變時重複呼叫不會造成任何變化。
    pub fn refresh(&self, account: &Account, order: &mut Order) -> Result<()> {
        let strategy = account.protocol()?;
        for challenge in order.authorization_challenges.iter_mut() {
            let authorization = self.fetch(account, strategy, &challenge.authorization_url)?;
            let challenge_data = self.fetch(account, strategy, &challenge.challenge_url)?;
            self.unserializer
                .update_authorization_challenge(challenge, &authorization, &challenge_data)?;
            self.persister.flush_challenge(challenge)?;
        }
        self.update_order_aggregate(account, strategy, order)?;
        self.persister.flush_order(order)?;
        debug!("Refreshed order {} ({})", order.id, order.status);
        Ok(())
    }

    /// 移除所有已啟動挑戰的驗證物並清除啟動旗標，用於放棄訂單時。
    ///
    /// 處理器的錯誤只會記錄，不會中斷流程。
    pub fn stop_authorization_challenges(&self, order: &mut Order) -> Result<()> {
        debug!(
            "Stopping {} started challenges of order {}",
            order.started_challenges(),
            order.id
        );
        for challenge in order
            .authorization_challenges
            .iter_mut()
            .filter(|challenge| challenge.challenge_started)
        {
            match self
                .handlers
                .get_challenge_by_handle(challenge.domain.challenge_type_handle())
            {
                Some(handler) => {
                    if let Err(e) = handler.after_challenge(challenge) {
                        warn!(
                            "Failed to clean up the challenge for {}: {}",
                            challenge.domain.host_display_name(),
                            e
                        );
                    }
                }
                None => warn!(
                    "No challenge handler for {}, skipping cleanup",
                    challenge.domain.host_display_name()
                ),
            }
            challenge.challenge_started = false;
            self.persister.flush_challenge(challenge)?;
        }
        Ok(())
    }

    /// 對 ACME v2 訂單提交 CSR。
    ///
    /// 憑證沒有 CSR 時會在這裡產生；若之後任何步驟失敗，產生的 CSR 會被清除。
    pub fn finalize_order(&self, certificate: &mut Certificate, order: &mut Order) -> Result<()> {
        certificate.account.protocol()?.require_orders()?;
        if order.order_type != OrderType::Order {
            return Err(OrderServiceError::OrderTypeMismatch {
                operation: "finalize",
                expected: OrderType::Order,
                actual: order.order_type,
            });
        }
        if order.finalize_url.is_empty() {
            return Err(OrderServiceError::MissingFinalizeUrl);
        }

        let scratch = ScratchCsr::acquire(certificate, self.csr_generator.as_ref())?;
        let payload = FinalizeOrderPayload::new(csr_field(&scratch.csr)?).to_value()?;
        debug!("Finalizing order {}", order.order_url);
        let response = self.transport.send(
            &scratch.account,
            Method::Post,
            &order.finalize_url,
            Some(&payload),
            &[200],
        )?;
        self.unserializer
            .update_main_order_record(order, &response.data)?;
        self.persister.flush_order(order)?;
        if scratch.generated() {
            self.persister.flush_certificate(&scratch)?;
        }
        scratch.commit();
        info!("Finalized order {} ({})", order.order_url, order.status);
        Ok(())
    }

    /// 以 ACME v1 的 new-cert 端點申請憑證。
    ///
    /// 回傳 201（已簽發）或 403（授權不足）的回應，由呼叫者判斷後續動作；
    /// 回應不是 2xx 時，這裡產生的 CSR 會被清除。
    pub fn call_acme01_new_cert(&self, certificate: &mut Certificate) -> Result<Response> {
        certificate.account.protocol()?.require_new_cert()?;

        let scratch = ScratchCsr::acquire(certificate, self.csr_generator.as_ref())?;
        let payload = NewCertPayload::new(csr_field(&scratch.csr)?).to_value()?;
        debug!("Requesting certificate {}", scratch.id);
        let response = self.transport.send(
            &scratch.account,
            Method::Post,
            &scratch.account.server.new_certificate_url,
            Some(&payload),
            &[201, 403],
        )?;
        if response.is_success() {
            if scratch.generated() {
                self.persister.flush_certificate(&scratch)?;
            }
            scratch.commit();
        } else {
            info!(
                "The server refused to issue certificate {} (HTTP {})",
                scratch.id, response.code
            );
        }
        Ok(response)
    }

    /// 下載已簽發的憑證鏈（PEM）。
    ///
    /// `retry_on_empty` 為 `true` 時，若第一次取得空白本文，會等待固定時間後再試一次。
    ///
    /// # Errors
    ///
    /// 最後取得的本文不是非空字串時回傳錯誤。
    pub fn download_actual_certificate(
        &self,
        account: &Account,
        url: &str,
        retry_on_empty: bool,
    ) -> Result<String> {
        let method = account.protocol()?.fetch_method();
        let mut attempt = 0;
        let data = loop {
            attempt += 1;
            debug!("Downloading certificate {} (attempt {})", url, attempt);
            let response = self.transport.send(account, method, url, None, &[200])?;
            if !is_empty_body(&response.data) || !retry_on_empty || attempt >= MAX_DOWNLOAD_ATTEMPTS
            {
                break response.data;
            }
            thread::sleep(self.download_retry_delay);
        };

        match data {
            Value::String(pem) if !pem.is_empty() => {
                info!("Downloaded certificate {}", url);
                Ok(pem)
            }
            Value::String(_) | Value::Null => Err(OrderServiceError::EmptyCertificate),
            other => Err(OrderServiceError::UnexpectedCertificateBody(json_type(&other))),
        }
    }

    fn fetch(&self, account: &Account, strategy: &dyn ProtocolStrategy, url: &str) -> Result<Value> {
        debug!("Fetching {}", url);
        Ok(self
            .transport
            .send(account, strategy.fetch_method(), url, None, FETCH_STATUS)?
            .data)
    }

    /// ACME v1 由各授權的狀態推導；ACME v2 重新讀取完整的訂單紀錄。
    fn update_order_aggregate(
        &self,
        account: &Account,
        strategy: &dyn ProtocolStrategy,
        order: &mut Order,
    ) -> Result<()> {
        match order.order_type {
            OrderType::Authorization => self.unserializer.update_main_authorization_set_record(order)?,
            OrderType::Order => {
                let data = self.fetch(account, strategy, &order.order_url)?;
                self.unserializer.update_main_order_record(order, &data)?;
            }
        }
        Ok(())
    }
}

fn is_empty_body(data: &Value) -> bool {
    match data {
        Value::Null => true,
        Value::String(s) => s.is_empty(),
        Value::Array(a) => a.is_empty(),
        Value::Object(o) => o.is_empty(),
        _ => false,
    }
}

fn json_type(data: &Value) -> &'static str {
    match data {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// 單次 finalize / new-cert 呼叫期間的暫存 CSR。
///
/// CSR 若是在這裡產生的，drop 時會被清空，除非已呼叫 [`ScratchCsr::commit`]。
struct ScratchCsr<'a> {
    certificate: &'a mut Certificate,
    revert: bool,
}

impl<'a> ScratchCsr<'a> {
    fn acquire(certificate: &'a mut Certificate, generator: &dyn CsrGenerator) -> Result<Self> {
        let revert = certificate.csr.is_empty();
        if revert {
            let csr = generator.generate_csr(certificate)?;
            certificate.csr = csr;
        }
        Ok(ScratchCsr {
            certificate,
            revert,
        })
    }

    /// CSR 是否在這次呼叫中產生。
    fn generated(&self) -> bool {
        self.revert
    }

    fn commit(mut self) {
        self.revert = false;
    }
}

impl Deref for ScratchCsr<'_> {
    type Target = Certificate;

    fn deref(&self) -> &Certificate {
        &*self.certificate
    }
}

impl Drop for ScratchCsr<'_> {
    fn drop(&mut self) {
        if self.revert {
            debug!("Discarding the CSR of certificate {}", self.certificate.id);
            self.certificate.csr.clear();
        }
    }
}

/// 已佈置驗證物的挑戰。
///
/// drop 時若仍處於 armed 狀態，會呼叫處理器的 `after_challenge`、清除啟動旗標並寫入；
/// 兩者的錯誤都只記錄，不會覆蓋原本的結果。
struct StartedChallenge<'a> {
    challenge: &'a mut AuthorizationChallenge,
    handler: Arc<dyn ChallengeHandler>,
    persister: &'a dyn Persister,
    revert: bool,
}

impl<'a> StartedChallenge<'a> {
    fn new(
        challenge: &'a mut AuthorizationChallenge,
        handler: Arc<dyn ChallengeHandler>,
        persister: &'a dyn Persister,
        revert: bool,
    ) -> Self {
        StartedChallenge {
            challenge,
            handler,
            persister,
            revert,
        }
    }

    fn commit(mut self) {
        self.revert = false;
    }
}

impl Deref for StartedChallenge<'_> {
    type Target = AuthorizationChallenge;

    fn deref(&self) -> &AuthorizationChallenge {
        &*self.challenge
    }
}

impl DerefMut for StartedChallenge<'_> {
    fn deref_mut(&mut self) -> &mut AuthorizationChallenge {
        &mut *self.challenge
    }
}

impl Drop for StartedChallenge<'_> {
    fn drop(&mut self) {
        if !self.revert {
            return;
        }
        if let Err(e) = self.handler.after_challenge(&*self.challenge) {
            warn!(
                "Failed to clean up the challenge for {}: {}",
                self.challenge.domain.host_display_name(),
                e
            );
        }
        self.challenge.challenge_started = false;
        if let Err(e) = self.persister.flush_challenge(&*self.challenge) {
            warn!(
                "Failed to persist the stopped challenge for {}: {}",
                self.challenge.domain.host_display_name(),
                e
            );
        }
    }
}

/// [`OrderService`] 的構造器。
///
/// 只有處理器登錄表是必填；其餘元件未設置時使用：
/// [`HttpTransport`]、[`OrderUnserializer`]、以 [`DirStorage::default_root`] 為根的
/// [`StorageRepository`]，以及 [`OpensslCsrGenerator`]。
pub struct OrderServiceBuilder {
    transport: Option<Arc<dyn Transport>>,
    unserializer: Option<Arc<dyn Unserializer>>,
    handlers: Option<Arc<dyn ChallengeHandlerRegistry>>,
    persister: Option<Arc<dyn Persister>>,
    csr_generator: Option<Arc<dyn CsrGenerator>>,
    download_retry_delay: Duration,
}

impl OrderServiceBuilder {
    /// 預設的憑證下載重試間隔。
    pub const DEFAULT_DOWNLOAD_RETRY_DELAY: Duration = Duration::from_secs(2);

    pub fn new() -> Self {
        OrderServiceBuilder {
            transport: None,
            unserializer: None,
            handlers: None,
            persister: None,
            csr_generator: None,
            download_retry_delay: Self::DEFAULT_DOWNLOAD_RETRY_DELAY,
        }
    }

    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn unserializer(mut self, unserializer: Arc<dyn Unserializer>) -> Self {
        self.unserializer = Some(unserializer);
        self
    }

    pub fn handlers(mut self, handlers: Arc<dyn ChallengeHandlerRegistry>) -> Self {
        self.handlers = Some(handlers);
        self
    }

    pub fn persister(mut self, persister: Arc<dyn Persister>) -> Self {
        self.persister = Some(persister);
        self
    }

    pub fn csr_generator(mut self, csr_generator: Arc<dyn CsrGenerator>) -> Self {
        self.csr_generator = Some(csr_generator);
        self
    }

    /// 設置憑證下載的重試間隔。
    pub fn download_retry_delay(mut self, delay: Duration) -> Self {
        self.download_retry_delay = delay;
        self
    }

    pub fn build(self) -> Result<OrderService> {
        let handlers = self
            .handlers
            .ok_or(OrderServiceError::MissingComponent("challenge handler registry"))?;
        let transport: Arc<dyn Transport> = match self.transport {
            Some(transport) => transport,
            None => Arc::new(HttpTransport::new()?),
        };
        let persister: Arc<dyn Persister> = match self.persister {
            Some(persister) => persister,
            None => Arc::new(StorageRepository::new(DirStorage::open(
                DirStorage::default_root(),
            )?)),
        };
        let unserializer = self
            .unserializer
            .unwrap_or_else(|| Arc::new(OrderUnserializer::new(handlers.clone())));
        let csr_generator = self
            .csr_generator
            .unwrap_or_else(|| Arc::new(OpensslCsrGenerator::default()));

        Ok(OrderService {
            transport,
            unserializer,
            handlers,
            persister,
            csr_generator,
            download_retry_delay: self.download_retry_delay,
        })
    }
}

impl Default for OrderServiceBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Mutex,
    };

    use serde_json::json;

    use super::*;
    use crate::{
        account::Server,
        challenge::AuthorizationStatus,
        domain::Domain,
        handler::HandlerRegistry,
        key_pair::KeyPair,
        order::OrderStatus,
        protocol::ProtocolVersion,
        repository::record_id,
        transport::MockTransport,
    };

    #[derive(Debug, Clone, PartialEq)]
    enum Flushed {
        Challenge(AuthorizationChallenge),
        Order(Order),
        Certificate(Certificate),
    }

    #[derive(Default)]
    struct RecordingPersister {
        flushed: Mutex<Vec<Flushed>>,
    }

    impl RecordingPersister {
        fn flushed(&self) -> Vec<Flushed> {
            self.flushed.lock().unwrap().clone()
        }

        fn last_challenge(&self) -> Option<AuthorizationChallenge> {
            self.flushed().into_iter().rev().find_map(|f| match f {
                Flushed::Challenge(c) => Some(c),
                _ => None,
            })
        }
    }

    impl Persister for RecordingPersister {
        fn flush_challenge(
            &self,
            challenge: &AuthorizationChallenge,
        ) -> std::result::Result<(), RepositoryError> {
            self.flushed
                .lock()
                .unwrap()
                .push(Flushed::Challenge(challenge.clone()));
            Ok(())
        }

        fn flush_order(&self, order: &Order) -> std::result::Result<(), RepositoryError> {
            self.flushed.lock().unwrap().push(Flushed::Order(order.clone()));
            Ok(())
        }

        fn flush_certificate(
            &self,
            certificate: &Certificate,
        ) -> std::result::Result<(), RepositoryError> {
            self.flushed
                .lock()
                .unwrap()
                .push(Flushed::Certificate(certificate.clone()));
            Ok(())
        }
    }

    #[derive(Default)]
    struct RecordingHandler {
        before: AtomicUsize,
        after: AtomicUsize,
        fail_after: bool,
    }

    impl ChallengeHandler for RecordingHandler {
        fn challenge_type(&self) -> &str {
            "http-01"
        }

        fn before_challenge(
            &self,
            _challenge: &AuthorizationChallenge,
        ) -> std::result::Result<(), HandlerError> {
            self.before.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn after_challenge(
            &self,
            _challenge: &AuthorizationChallenge,
        ) -> std::result::Result<(), HandlerError> {
            self.after.fetch_add(1, Ordering::SeqCst);
            if self.fail_after {
                Err(HandlerError::Failed("provider unreachable".to_string()))
            } else {
                Ok(())
            }
        }
    }

    struct Fixture {
        service: OrderService,
        transport: Arc<MockTransport>,
        persister: Arc<RecordingPersister>,
        handler: Arc<RecordingHandler>,
    }

    fn fixture_with(handler: RecordingHandler) -> Fixture {
        let _ = env_logger::builder().is_test(true).try_init();
        let transport = Arc::new(MockTransport::new());
        let persister = Arc::new(RecordingPersister::default());
        let handler = Arc::new(handler);
        let registry = HandlerRegistry::new().register("web", handler.clone());
        let service = OrderService::builder()
            .transport(transport.clone())
            .persister(persister.clone())
            .handlers(Arc::new(registry))
            .download_retry_delay(Duration::ZERO)
            .build()
            .unwrap();
        Fixture {
            service,
            transport,
            persister,
            handler,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(RecordingHandler::default())
    }

    fn server(version: &str) -> Server {
        Server {
            name: "test".to_string(),
            protocol_version: version.to_string(),
            directory_url: "https://ca/directory".to_string(),
            new_nonce_url: "https://ca/new-nonce".to_string(),
            new_order_url: "https://ca/new-order".to_string(),
            new_authorization_url: "https://ca/new-authz".to_string(),
            new_certificate_url: "https://ca/new-cert".to_string(),
        }
    }

    fn account(version: &str) -> Account {
        let key_pair = KeyPair::generate(2048).unwrap();
        Account::new(
            "admin@example.com",
            server(version),
            "https://ca/acct/1",
            &key_pair.to_pem().unwrap(),
        )
    }

    fn certificate(version: &str, names: &[&str]) -> Certificate {
        let domains = names.iter().map(|n| Domain::new(n, "web").unwrap()).collect();
        Certificate::new("cert-1", account(version), domains)
    }

    fn order(order_type: OrderType, names: &[&str]) -> Order {
        let mut order = Order::new("cert-1", order_type);
        order.id = "order-1".to_string();
        if order_type == OrderType::Order {
            order.order_url = "https://ca/order/1".to_string();
            order.finalize_url = "https://ca/order/1/finalize".to_string();
        }
        for name in names {
            let mut challenge = AuthorizationChallenge::new(
                Domain::new(name, "web").unwrap(),
                &format!("https://ca/authz/{}", name),
                "http-01",
                &format!("https://ca/chall/{}", name),
            );
            challenge.id = record_id(&challenge.authorization_url);
            challenge.order_id = order.id.clone();
            challenge.challenge_token = "tok".to_string();
            challenge.challenge_authorization_key = "tok.thumb".to_string();
            order.authorization_challenges.push(challenge);
        }
        order
    }

    fn authz(status: &str) -> Response {
        Response::new(200, json!({"status": status}))
    }

    fn chall(status: &str) -> Response {
        Response::new(200, json!({"type": "http-01", "status": status, "token": "tok"}))
    }

    fn order_data(status: &str) -> Response {
        Response::new(
            200,
            json!({"status": status, "finalize": "https://ca/order/1/finalize"}),
        )
    }

    fn authorization_body(value: &str) -> Value {
        json!({
            "identifier": {"type": "dns", "value": value},
            "status": "pending",
            "expires": "2030-01-01T00:00:00Z",
            "challenges": [
                {"type": "http-01", "url": format!("https://ca/chall/{}", value), "status": "pending", "token": "tok"}
            ]
        })
    }

    #[test]
    fn test_create_order_two_domains() {
        let f = fixture();
        let certificate = certificate("acme02", &["a.example.com", "b.example.com"]);
        f.transport
            .push_response(
                Response::new(
                    201,
                    json!({
                        "status": "pending",
                        "authorizations": ["https://ca/authz/a", "https://ca/authz/b"],
                        "finalize": "https://ca/order/1/finalize"
                    }),
                )
                .with_location("https://ca/order/1"),
            )
            .push_response(Response::new(200, authorization_body("a.example.com")))
            .push_response(Response::new(200, authorization_body("b.example.com")));

        let order = f.service.create_order(&certificate).unwrap();

        let requests = f.transport.requests();
        assert_eq!(requests.len(), 3);
        assert_eq!(requests[0].method, Method::Post);
        assert_eq!(requests[0].url, "https://ca/new-order");
        assert_eq!(requests[0].expected, vec![201]);
        assert_eq!(
            serde_json::to_string(requests[0].payload.as_ref().unwrap()).unwrap(),
            r#"{"identifiers":[{"type":"dns","value":"a.example.com"},{"type":"dns","value":"b.example.com"}]}"#
        );
        for (request, url) in requests[1..].iter().zip(["https://ca/authz/a", "https://ca/authz/b"]) {
            assert_eq!(request.method, Method::Post);
            assert_eq!(request.url, url);
            assert_eq!(request.payload, None);
            assert_eq!(request.expected, vec![200]);
        }

        assert_eq!(order.order_type, OrderType::Order);
        assert_eq!(order.authorization_challenges.len(), 2);
        for challenge in &order.authorization_challenges {
            assert_eq!(challenge.authorization_status, AuthorizationStatus::Pending);
            assert_eq!(challenge.challenge_status, ChallengeStatus::Pending);
            assert!(!challenge.challenge_started);
        }
        assert_eq!(f.persister.flushed(), vec![Flushed::Order(order)]);
    }

    #[test]
    fn test_create_order_requires_order_centric_protocol() {
        let f = fixture();
        let certificate = certificate("acme01", &["a.example.com"]);
        assert!(matches!(
            f.service.create_order(&certificate),
            Err(OrderServiceError::Protocol(ProtocolError::UnsupportedOperation { .. }))
        ));
        assert!(f.transport.requests().is_empty());
    }

    #[test]
    fn test_legacy_wildcard_rejected_before_any_request() {
        let f = fixture();
        let certificate = certificate("acme01", &["example.com", "*.example.com"]);
        assert!(matches!(
            f.service.create_authorization_challenges(&certificate),
            Err(OrderServiceError::Protocol(ProtocolError::WildcardNotSupported(_)))
        ));
        assert!(f.transport.requests().is_empty());
    }

    #[test]
    fn test_unrecognized_protocol_fails_before_any_request() {
        let f = fixture();
        let mut certificate = certificate("acme03", &["a.example.com"]);
        let account = certificate.account.clone();
        let mut order = order(OrderType::Order, &["a.example.com"]);

        let is_unrecognized = |result: Result<()>| {
            matches!(
                result,
                Err(OrderServiceError::Protocol(ProtocolError::UnrecognizedVersion(_)))
            )
        };
        assert!(is_unrecognized(f.service.create_order(&certificate).map(|_| ())));
        assert!(is_unrecognized(
            f.service
                .create_authorization_challenges(&certificate)
                .map(|_| ())
        ));
        assert!(is_unrecognized(
            f.service.start_authorization_challenges(&account, &mut order)
        ));
        assert!(is_unrecognized(f.service.refresh(&account, &mut order)));
        assert!(is_unrecognized(
            f.service.finalize_order(&mut certificate, &mut order)
        ));
        assert!(is_unrecognized(
            f.service.call_acme01_new_cert(&mut certificate).map(|_| ())
        ));
        assert!(is_unrecognized(
            f.service
                .download_actual_certificate(&account, "https://ca/cert/1", true)
                .map(|_| ())
        ));
        assert!(f.transport.requests().is_empty());
        assert!(certificate.csr.is_empty());
    }

    #[test]
    fn test_create_legacy_authorizations() {
        let f = fixture();
        let certificate = certificate("acme01", &["a.example.com", "b.example.com"]);
        for name in ["a.example.com", "b.example.com"] {
            let mut body = authorization_body(name);
            body["challenges"][0] = json!({
                "type": "http-01",
                "uri": format!("https://ca/acme/challenge/{}", name),
                "status": "pending",
                "token": "tok"
            });
            f.transport.push_response(
                Response::new(201, body).with_location(&format!("https://ca/acme/authz/{}", name)),
            );
        }

        let order = f
            .service
            .create_authorization_challenges(&certificate)
            .unwrap();

        let requests = f.transport.requests();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[0].url, "https://ca/new-authz");
        assert_eq!(requests[0].expected, vec![201]);
        assert_eq!(
            requests[1].payload,
            Some(json!({"identifier": {"type": "dns", "value": "b.example.com"}, "resource": "new-authz"}))
        );
        assert_eq!(order.order_type, OrderType::Authorization);
        assert_eq!(
            order.authorization_challenges[1].authorization_url,
            "https://ca/acme/authz/b.example.com"
        );
        assert_eq!(
            order.authorization_challenges[1].challenge_url,
            "https://ca/acme/challenge/b.example.com"
        );
    }

    #[test]
    fn test_start_challenges_success() {
        let f = fixture();
        let account = account("acme02");
        let mut order = order(OrderType::Order, &["a.example.com"]);
        f.transport
            .push_response(chall("processing"))
            .push_response(authz("pending"))
            .push_response(order_data("pending"));

        f.service
            .start_authorization_challenges(&account, &mut order)
            .unwrap();

        let requests = f.transport.requests();
        assert_eq!(requests[0].url, "https://ca/chall/a.example.com");
        assert_eq!(requests[0].payload, Some(json!({})));
        assert_eq!(requests[0].expected, vec![200, 202]);
        assert_eq!(requests[1].url, "https://ca/authz/a.example.com");
        assert_eq!(requests[2].url, "https://ca/order/1");

        let challenge = &order.authorization_challenges[0];
        assert!(challenge.challenge_started);
        assert_eq!(challenge.challenge_status, ChallengeStatus::Processing);
        assert_eq!(f.handler.before.load(Ordering::SeqCst), 1);
        assert_eq!(f.handler.after.load(Ordering::SeqCst), 0);

        // 啟動旗標必須在送出請求前就已寫入
        let flushed = f.persister.flushed();
        match &flushed[0] {
            Flushed::Challenge(c) => {
                assert!(c.challenge_started);
                assert_eq!(c.challenge_status, ChallengeStatus::Pending);
            }
            other => panic!("unexpected first flush: {:?}", other),
        }
        assert_eq!(flushed.last(), Some(&Flushed::Order(order.clone())));
    }

    #[test]
    fn test_start_skips_challenges_that_are_not_pending() {
        let f = fixture();
        let account = account("acme02");
        let mut order = order(OrderType::Order, &["a.example.com"]);
        order.authorization_challenges[0].challenge_status = ChallengeStatus::Valid;

        f.service
            .start_authorization_challenges(&account, &mut order)
            .unwrap();
        assert!(f.transport.requests().is_empty());
        assert!(f.persister.flushed().is_empty());
        assert_eq!(f.handler.before.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_start_failure_swallowed_when_server_moved_on() {
        let f = fixture();
        let account = account("acme02");
        let mut order = order(OrderType::Order, &["a.example.com"]);
        f.transport
            .push_response(Response::new(400, json!({"detail": "already processed"})))
            .push_response(chall("valid"))
            .push_response(authz("valid"))
            .push_response(order_data("ready"));

        f.service
            .start_authorization_challenges(&account, &mut order)
            .unwrap();

        let challenge = &order.authorization_challenges[0];
        assert_eq!(challenge.challenge_status, ChallengeStatus::Valid);
        assert_eq!(challenge.authorization_status, AuthorizationStatus::Valid);
        assert!(challenge.challenge_started);
        assert_eq!(order.status, OrderStatus::Ready);
        assert_eq!(f.handler.after.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_start_failure_raised_when_still_pending() {
        let f = fixture_with(RecordingHandler {
            fail_after: true,
            ..RecordingHandler::default()
        });
        let account = account("acme02");
        let mut order = order(OrderType::Order, &["a.example.com"]);
        f.transport
            .push_response(Response::new(500, json!({"detail": "server overloaded"})))
            .push_response(chall("pending"))
            .push_response(authz("pending"));

        let err = f
            .service
            .start_authorization_challenges(&account, &mut order)
            .unwrap_err();
        assert!(matches!(
            err,
            OrderServiceError::Transport(TransportError::UnexpectedStatus { code: 500, .. })
        ));

        assert!(!order.authorization_challenges[0].challenge_started);
        assert!(!f.persister.last_challenge().unwrap().challenge_started);
        assert_eq!(f.handler.before.load(Ordering::SeqCst), 1);
        assert_eq!(f.handler.after.load(Ordering::SeqCst), 1);
        assert_eq!(f.transport.remaining(), 0);
    }

    #[test]
    fn test_start_reconciliation_failure_reverts() {
        let f = fixture();
        let account = account("acme02");
        let mut order = order(OrderType::Order, &["a.example.com"]);
        f.transport
            .push_response(chall("pending"))
            .push_error(TransportError::Connection("reset by peer".to_string()));

        assert!(matches!(
            f.service.start_authorization_challenges(&account, &mut order),
            Err(OrderServiceError::Transport(TransportError::Connection(_)))
        ));
        assert!(!order.authorization_challenges[0].challenge_started);
        assert_eq!(f.handler.after.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_restart_of_started_challenge_keeps_artifact() {
        let f = fixture();
        let account = account("acme02");
        let mut order = order(OrderType::Order, &["a.example.com"]);
        order.authorization_challenges[0].challenge_started = true;
        f.transport
            .push_error(TransportError::Connection("timeout".to_string()))
            .push_response(chall("pending"))
            .push_response(authz("pending"));

        assert!(f
            .service
            .start_authorization_challenges(&account, &mut order)
            .is_err());
        assert!(order.authorization_challenges[0].challenge_started);
        assert_eq!(f.handler.before.load(Ordering::SeqCst), 0);
        assert_eq!(f.handler.after.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_start_with_unknown_handler() {
        let f = fixture();
        let account = account("acme02");
        let mut order = order(OrderType::Order, &["a.example.com"]);
        order.authorization_challenges[0].domain = Domain::new("a.example.com", "ftp").unwrap();

        assert!(matches!(
            f.service.start_authorization_challenges(&account, &mut order),
            Err(OrderServiceError::InvalidChallengeType(domain)) if domain == "a.example.com"
        ));
        assert!(f.transport.requests().is_empty());
    }

    #[test]
    fn test_start_legacy_challenge() {
        let f = fixture();
        let account = account("acme01");
        let mut order = order(OrderType::Authorization, &["a.example.com"]);
        f.transport
            .push_response(Response::new(202, json!({"type": "http-01", "status": "pending", "token": "tok"})))
            .push_response(authz("pending"));

        f.service
            .start_authorization_challenges(&account, &mut order)
            .unwrap();

        let requests = f.transport.requests();
        assert_eq!(requests.len(), 2);
        assert_eq!(
            requests[0].payload,
            Some(json!({"resource": "challenge", "keyAuthorization": "tok.thumb"}))
        );
        assert_eq!(requests[1].method, Method::Get);
        assert!(order.authorization_challenges[0].challenge_started);
        assert_eq!(order.status, OrderStatus::Pending);
    }

    #[test]
    fn test_refresh_is_idempotent() {
        let f = fixture();
        let account = account("acme02");
        let mut order = order(OrderType::Order, &["a.example.com", "b.example.com"]);
        for _ in 0..2 {
            f.transport
                .push_response(authz("valid"))
                .push_response(chall("valid"))
                .push_response(authz("pending"))
                .push_response(chall("processing"))
                .push_response(order_data("pending"));
        }

        f.service.refresh(&account, &mut order).unwrap();
        let after_first = order.clone();
        let first_flushes = f.persister.flushed();

        f.service.refresh(&account, &mut order).unwrap();
        assert_eq!(order, after_first);
        let all_flushes = f.persister.flushed();
        assert_eq!(&all_flushes[first_flushes.len()..], &first_flushes[..]);

        assert_eq!(
            order.authorization_challenges[0].authorization_status,
            AuthorizationStatus::Valid
        );
        assert_eq!(
            order.authorization_challenges[1].challenge_status,
            ChallengeStatus::Processing
        );
        assert!(f
            .transport
            .requests()
            .iter()
            .all(|r| r.method == Method::Post && r.payload.is_none()));
    }

    #[test]
    fn test_refresh_legacy_aggregate() {
        let f = fixture();
        let account = account("acme01");
        let mut order = order(OrderType::Authorization, &["a.example.com"]);
        f.transport
            .push_response(authz("valid"))
            .push_response(chall("valid"));

        f.service.refresh(&account, &mut order).unwrap();
        assert_eq!(order.status, OrderStatus::Ready);
        assert_eq!(f.transport.requests().len(), 2);
    }

    #[test]
    fn test_stop_challenges_suppresses_handler_errors() {
        let f = fixture_with(RecordingHandler {
            fail_after: true,
            ..RecordingHandler::default()
        });
        let mut order = order(OrderType::Order, &["a.example.com", "b.example.com"]);
        order.authorization_challenges[1].challenge_started = true;

        f.service.stop_authorization_challenges(&mut order).unwrap();

        assert_eq!(f.handler.after.load(Ordering::SeqCst), 1);
        assert_eq!(order.started_challenges(), 0);
        let flushed = f.persister.flushed();
        assert_eq!(flushed.len(), 1);
        assert_eq!(
            flushed[0],
            Flushed::Challenge(order.authorization_challenges[1].clone())
        );
    }

    #[test]
    fn test_finalize_failure_discards_generated_csr() {
        let f = fixture();
        let mut certificate = certificate("acme02", &["a.example.com"]);
        let mut order = order(OrderType::Order, &["a.example.com"]);
        f.transport
            .push_response(Response::new(403, json!({"detail": "order not ready"})));

        assert!(f.service.finalize_order(&mut certificate, &mut order).is_err());
        assert!(certificate.csr.is_empty());
        assert!(f.persister.flushed().is_empty());
    }

    #[test]
    fn test_finalize_success_keeps_generated_csr() {
        let f = fixture();
        let mut certificate = certificate("acme02", &["a.example.com"]);
        let mut order = order(OrderType::Order, &["a.example.com"]);
        f.transport.push_response(Response::new(
            200,
            json!({"status": "processing", "finalize": "https://ca/order/1/finalize"}),
        ));

        f.service
            .finalize_order(&mut certificate, &mut order)
            .unwrap();

        assert!(certificate.csr.starts_with("-----BEGIN CERTIFICATE REQUEST-----"));
        assert_eq!(order.status, OrderStatus::Processing);
        let request = &f.transport.requests()[0];
        assert_eq!(request.url, "https://ca/order/1/finalize");
        assert_eq!(
            request.payload,
            Some(json!({"csr": csr_field(&certificate.csr).unwrap()}))
        );
        assert_eq!(
            f.persister.flushed(),
            vec![
                Flushed::Order(order.clone()),
                Flushed::Certificate(certificate.clone())
            ]
        );
    }

    #[test]
    fn test_finalize_failure_keeps_existing_csr() {
        let f = fixture();
        let mut certificate = certificate("acme02", &["a.example.com"]);
        certificate.csr = OpensslCsrGenerator::default()
            .generate_csr(&mut certificate)
            .unwrap();
        let existing = certificate.csr.clone();
        let mut order = order(OrderType::Order, &["a.example.com"]);
        f.transport
            .push_error(TransportError::Connection("refused".to_string()));

        assert!(f.service.finalize_order(&mut certificate, &mut order).is_err());
        assert_eq!(certificate.csr, existing);
    }

    #[test]
    fn test_finalize_rejects_authorization_sets() {
        let f = fixture();
        let mut certificate = certificate("acme02", &["a.example.com"]);
        let mut order = order(OrderType::Authorization, &["a.example.com"]);
        assert!(matches!(
            f.service.finalize_order(&mut certificate, &mut order),
            Err(OrderServiceError::OrderTypeMismatch { .. })
        ));
        assert!(f.transport.requests().is_empty());
    }

    #[test]
    fn test_new_cert_forbidden_discards_csr() {
        let f = fixture();
        let mut certificate = certificate("acme01", &["a.example.com"]);
        f.transport
            .push_response(Response::new(403, json!({"detail": "authorizations missing"})));

        let response = f.service.call_acme01_new_cert(&mut certificate).unwrap();
        assert_eq!(response.code, 403);
        assert!(certificate.csr.is_empty());
        assert!(f.persister.flushed().is_empty());

        let request = &f.transport.requests()[0];
        assert_eq!(request.url, "https://ca/new-cert");
        assert_eq!(request.expected, vec![201, 403]);
        assert_eq!(request.payload.as_ref().unwrap()["resource"], "new-cert");
    }

    #[test]
    fn test_new_cert_issued_keeps_csr() {
        let f = fixture();
        let mut certificate = certificate("acme01", &["a.example.com"]);
        f.transport.push_response(
            Response::new(201, json!("")).with_location("https://ca/acme/cert/1"),
        );

        let response = f.service.call_acme01_new_cert(&mut certificate).unwrap();
        assert_eq!(response.location.as_deref(), Some("https://ca/acme/cert/1"));
        assert!(!certificate.csr.is_empty());
        assert_eq!(
            f.persister.flushed(),
            vec![Flushed::Certificate(certificate.clone())]
        );
    }

    #[test]
    fn test_new_cert_requires_legacy_protocol() {
        let f = fixture();
        let mut certificate = certificate("acme02", &["a.example.com"]);
        assert!(matches!(
            f.service.call_acme01_new_cert(&mut certificate),
            Err(OrderServiceError::Protocol(ProtocolError::UnsupportedOperation {
                version: ProtocolVersion::Acme02,
                ..
            }))
        ));
        assert!(certificate.csr.is_empty());
    }

    #[test]
    fn test_download_retries_once_on_empty_body() {
        let f = fixture();
        let account = account("acme02");
        f.transport
            .push_response(Response::new(200, json!("")))
            .push_response(Response::new(200, json!("-----BEGIN CERTIFICATE-----")));

        let pem = f
            .service
            .download_actual_certificate(&account, "https://ca/cert/1", true)
            .unwrap();
        assert_eq!(pem, "-----BEGIN CERTIFICATE-----");
        let requests = f.transport.requests();
        assert_eq!(requests.len(), 2);
        assert!(requests.iter().all(|r| r.method == Method::Post && r.payload.is_none()));
    }

    #[test]
    fn test_download_without_retry_fails_on_empty_body() {
        let f = fixture();
        let account = account("acme01");
        f.transport
            .push_response(Response::new(200, json!("")))
            .push_response(Response::new(200, json!("-----BEGIN CERTIFICATE-----")));

        assert!(matches!(
            f.service
                .download_actual_certificate(&account, "https://ca/cert/1", false),
            Err(OrderServiceError::EmptyCertificate)
        ));
        let requests = f.transport.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].method, Method::Get);
    }

    #[test]
    fn test_download_gives_up_after_two_attempts() {
        let f = fixture();
        let account = account("acme02");
        f.transport
            .push_response(Response::new(200, Value::Null))
            .push_response(Response::new(200, Value::Null))
            .push_response(Response::new(200, json!("-----BEGIN CERTIFICATE-----")));

        assert!(matches!(
            f.service
                .download_actual_certificate(&account, "https://ca/cert/1", true),
            Err(OrderServiceError::EmptyCertificate)
        ));
        assert_eq!(f.transport.requests().len(), 2);
    }

    #[test]
    fn test_download_rejects_json_body() {
        let f = fixture();
        let account = account("acme02");
        f.transport
            .push_response(Response::new(200, json!({"status": "valid"})));

        assert!(matches!(
            f.service
                .download_actual_certificate(&account, "https://ca/cert/1", true),
            Err(OrderServiceError::UnexpectedCertificateBody("object"))
        ));
    }

    #[test]
    fn test_builder_requires_handlers() {
        assert!(matches!(
            OrderService::builder()
                .transport(Arc::new(MockTransport::new()))
                .persister(Arc::new(RecordingPersister::default()))
                .build(),
            Err(OrderServiceError::MissingComponent(_))
        ));
    }
}
