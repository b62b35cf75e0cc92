//! 網域驗證的處理器。
//!
//! 處理器負責在挑戰開始前佈置驗證物（HTTP 檔案、DNS 記錄…），並在結束後移除。
//! 每個網域以 `challenge_type_handle` 指定要使用哪個處理器。

use std::{
    collections::HashMap,
    fs, io,
    path::{Path, PathBuf},
    sync::Arc,
};

use log::debug;
use thiserror::Error;

use crate::challenge::AuthorizationChallenge;

#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("Challenge handler failed: {0}")]
    Failed(String),
}

type Result<T> = std::result::Result<T, HandlerError>;

/// 負責一種驗證方式的處理器。
pub trait ChallengeHandler: Send + Sync {
    /// 此處理器能滿足的 ACME 挑戰類型，例如 `http-01`。
    fn challenge_type(&self) -> &str;

    /// 佈置驗證物。
    fn before_challenge(&self, challenge: &AuthorizationChallenge) -> Result<()>;

    /// 移除驗證物。
    fn after_challenge(&self, challenge: &AuthorizationChallenge) -> Result<()>;
}

/// 依代號查詢處理器。
pub trait ChallengeHandlerRegistry: Send + Sync {
    fn get_challenge_by_handle(&self, handle: &str) -> Option<Arc<dyn ChallengeHandler>>;
}

/// 以 `HashMap` 實作的處理器登錄表。
#[derive(Default, Clone)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn ChallengeHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 以 `handle` 註冊處理器，同名的舊處理器會被取代。
    pub fn register(mut self, handle: &str, handler: Arc<dyn ChallengeHandler>) -> Self {
        self.handlers.insert(handle.to_string(), handler);
        self
    }
}

impl ChallengeHandlerRegistry for HandlerRegistry {
    fn get_challenge_by_handle(&self, handle: &str) -> Option<Arc<dyn ChallengeHandler>> {
        self.handlers.get(handle).cloned()
    }
}

/// http-01 處理器：把 key authorization 寫到
/// `<webroot>/.well-known/acme-challenge/<token>`。
#[derive(Debug, Clone)]
pub struct HttpFileHandler {
    webroot: PathBuf,
}

impl HttpFileHandler {
    pub const CHALLENGE_TYPE: &'static str = "http-01";
    const WELL_KNOWN: &'static str = ".well-known/acme-challenge";

    pub fn new<P: AsRef<Path>>(webroot: P) -> Self {
        HttpFileHandler {
            webroot: webroot.as_ref().to_path_buf(),
        }
    }

    /// 驗證檔案的完整路徑。token 只允許 base64url 字元，避免寫出 webroot 之外。
    pub fn challenge_path(&self, challenge: &AuthorizationChallenge) -> Result<PathBuf> {
        let token = &challenge.challenge_token;
        let valid = !token.is_empty()
            && token
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !valid {
            return Err(HandlerError::Failed(format!(
                "Invalid challenge token for {}: {:?}",
                challenge.domain.host_display_name(),
                token
            )));
        }
        Ok(self.webroot.join(Self::WELL_KNOWN).join(token))
    }
}

impl ChallengeHandler for HttpFileHandler {
    fn challenge_type(&self) -> &str {
        Self::CHALLENGE_TYPE
    }

    fn before_challenge(&self, challenge: &AuthorizationChallenge) -> Result<()> {
        let path = self.challenge_path(challenge)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, challenge.challenge_authorization_key.as_bytes())?;
        debug!("Wrote http-01 challenge file {}", path.display());
        Ok(())
    }

    fn after_challenge(&self, challenge: &AuthorizationChallenge) -> Result<()> {
        let path = self.challenge_path(challenge)?;
        match fs::remove_file(&path) {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e.into()),
            _ => {
                debug!("Removed http-01 challenge file {}", path.display());
                Ok(())
            }
        }
    }
}
