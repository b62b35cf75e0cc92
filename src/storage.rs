//! 鍵值式的持久化儲存。
//!
//! key 是以 `/` 分隔的相對路徑（例如 `orders/abc/order.json`），
//! 由 [`Storage`] 的實作決定實際存放位置。

use std::{
    collections::BTreeMap,
    env, fmt, fs,
    io::{self, Write},
    path::{Component, Path, PathBuf},
    sync::RwLock,
};

use tempfile::NamedTempFile;
use thiserror::Error;

/// 儲存操作可能發生的錯誤類型。
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("Key is invalid: {0}")]
    InvalidKey(String),
    #[error("Key not found: {0}")]
    NotFound(String),
    #[error("Key is a dir: {0}")]
    IsDir(String),
    #[error("Not a directory: {0}")]
    NotDirectory(String),
    #[error("Lock poisoned")]
    LockPoisoned,
}

/// 儲存操作的結果類型，封裝 [`StorageError`]。
pub type Result<T> = std::result::Result<T, StorageError>;

/// 儲存系統需實現的 API。
pub trait Storage: Send + Sync + fmt::Debug {
    /// 讀取 key 所對應檔案的內容。
    fn read_file(&self, key: &str) -> Result<Vec<u8>>;

    /// 寫入 key 所對應的檔案，父目錄不存在時會自動建立。
    fn write_file(&self, key: &str, value: &[u8]) -> Result<()>;
}

/// 將 key 正規化為不含 `.`、`..` 與開頭斜線的相對路徑。
fn normalize_key(key: &str) -> Result<PathBuf> {
    if key.trim_matches('/').is_empty() {
        return Err(StorageError::InvalidKey("Empty key".to_string()));
    }
    if key.contains(['\0', '\n', '\r', '\\']) || key.contains("//") {
        return Err(StorageError::InvalidKey(key.to_string()));
    }

    let mut normalized = PathBuf::new();
    for component in Path::new(key).components() {
        match component {
            Component::RootDir | Component::CurDir => {}
            Component::ParentDir => {
                if !normalized.pop() {
                    return Err(StorageError::InvalidKey(format!(
                        "Cannot use '..' to escape root directory: {}",
                        key
                    )));
                }
            }
            Component::Normal(name) => normalized.push(name),
            Component::Prefix(_) => return Err(StorageError::InvalidKey(key.to_string())),
        }
    }
    if normalized.as_os_str().is_empty() {
        return Err(StorageError::InvalidKey(key.to_string()));
    }
    Ok(normalized)
}

/// 檔案 key 不可以斜線結尾。
fn normalize_file_key(key: &str) -> Result<PathBuf> {
    if key.ends_with('/') {
        return Err(StorageError::InvalidKey(format!(
            "File key cannot end with '/': {}",
            key
        )));
    }
    normalize_key(key)
}

/// 基於記憶體的儲存實作，主要用於測試。
///
/// 只保存檔案；目錄由檔案路徑隱含。
#[derive(Debug, Default)]
pub struct MemStorage {
    files: RwLock<BTreeMap<PathBuf, Vec<u8>>>,
}

impl MemStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// `path` 是否為某個既有檔案的上層目錄。
    fn is_dir(files: &BTreeMap<PathBuf, Vec<u8>>, path: &Path) -> bool {
        files
            .keys()
            .any(|file| file != path && file.starts_with(path))
    }
}

impl Storage for MemStorage {
    fn read_file(&self, key: &str) -> Result<Vec<u8>> {
        let path = normalize_file_key(key)?;
        let files = self.files.read().map_err(|_| StorageError::LockPoisoned)?;
        match files.get(&path) {
            Some(data) => Ok(data.clone()),
            None if Self::is_dir(&files, &path) => Err(StorageError::IsDir(key.to_string())),
            None => Err(StorageError::NotFound(key.to_string())),
        }
    }

    fn write_file(&self, key: &str, value: &[u8]) -> Result<()> {
        let path = normalize_file_key(key)?;
        let mut files = self.files.write().map_err(|_| StorageError::LockPoisoned)?;
        if let Some(ancestor) = path.ancestors().skip(1).find(|a| files.contains_key(*a)) {
            return Err(StorageError::NotDirectory(
                ancestor.to_string_lossy().into_owned(),
            ));
        }
        if Self::is_dir(&files, &path) {
            return Err(StorageError::IsDir(key.to_string()));
        }
        files.insert(path, value.to_vec());
        Ok(())
    }
}

/// 以本機目錄為根的儲存實作。
///
/// 寫入時先寫到同目錄下的暫存檔，再以 rename 取代目標檔案，
/// 中途當機不會留下寫到一半的紀錄。
#[derive(Debug, Clone)]
pub struct DirStorage {
    root: PathBuf,
}

impl DirStorage {
    /// 開啟（必要時建立）以 `root` 為根目錄的儲存。
    pub fn open<P: AsRef<Path>>(root: P) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;
        Ok(DirStorage { root })
    }

    /// 預設的儲存路徑：`$HOME/.local/share/<套件名稱>`，沒有 `$HOME` 時使用 `/var/lib`。
    pub fn default_root() -> PathBuf {
        let base_dir = env::var_os("HOME")
            .map(|home| PathBuf::from(home).join(".local/share"))
            .unwrap_or_else(|| PathBuf::from("/var/lib"));
        base_dir.join(env!("CARGO_PKG_NAME"))
    }

    /// 根目錄。
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_of(&self, key: &Path) -> PathBuf {
        self.root.join(key)
    }
}

impl Storage for DirStorage {
    fn read_file(&self, key: &str) -> Result<Vec<u8>> {
        let path = self.path_of(&normalize_file_key(key)?);
        if path.is_dir() {
            return Err(StorageError::IsDir(key.to_string()));
        }
        match fs::read(&path) {
            Ok(data) => Ok(data),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                Err(StorageError::NotFound(key.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    fn write_file(&self, key: &str, value: &[u8]) -> Result<()> {
        let path = self.path_of(&normalize_file_key(key)?);
        if path.is_dir() {
            return Err(StorageError::IsDir(key.to_string()));
        }
        let parent = path
            .parent()
            .ok_or_else(|| StorageError::InvalidKey(key.to_string()))?;
        if parent.is_file() {
            return Err(StorageError::NotDirectory(
                parent.to_string_lossy().into_owned(),
            ));
        }
        fs::create_dir_all(parent)?;

        let mut temp = NamedTempFile::new_in(parent)?;
        temp.write_all(value)?;
        temp.as_file().sync_all()?;
        temp.persist(&path).map_err(|e| e.error)?;
        Ok(())
    }
}
