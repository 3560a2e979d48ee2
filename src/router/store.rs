//! 地理数据库存储
//!
//! 每种数据库一个 [`GeoStore`]，独占当前读取器。读取器只会被整体替换，
//! 查询方通过 [`GeoStore::current`] 拿到某一时刻完整的快照。

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, SystemTime};

use arc_swap::ArcSwapOption;
use async_trait::async_trait;
use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::fetch::Fetcher;
use super::scheduler::{RefreshLock, RefreshTarget};
use crate::common::{DatabaseKind, GeoError};
use crate::config::path::PathResolver;
use crate::config::types::GeoResourceConfig;

/// 启动时下载的最大尝试次数（两次尝试之间不等待）
pub const FETCH_ATTEMPTS: usize = 3;
/// 周期更新使用的临时文件后缀
pub const TEMP_SUFFIX: &str = ".tmp";

/// 可从文件打开的只读数据库
pub trait GeoDatabase: Send + Sync + Sized + 'static {
    const KIND: DatabaseKind;

    /// 打开并校验文件，返回读取器和分类代码列表
    fn open(path: &Path) -> anyhow::Result<(Self, Vec<String>)>;
}

/// 一次成功加载的结果，创建后不再修改
#[derive(Debug)]
pub struct LoadedDatabase<D> {
    pub reader: D,
    pub codes: Vec<String>,
    pub source_path: PathBuf,
    pub loaded_at: SystemTime,
    /// 单调递增，用于区分不同读取器实例
    pub generation: u64,
}

/// 单个数据库的更新选项，构造后不可变
#[derive(Debug, Clone, Default)]
pub struct GeoUpdateOptions {
    pub path: Option<String>,
    pub download_url: Option<String>,
    pub download_detour: Option<String>,
    /// 0 表示关闭定时更新
    pub auto_update_interval: Duration,
    pub watch: bool,
}

impl From<&GeoResourceConfig> for GeoUpdateOptions {
    fn from(config: &GeoResourceConfig) -> Self {
        Self {
            path: config.path().map(str::to_string),
            download_url: config.download_url().map(str::to_string),
            download_detour: config.download_detour().map(str::to_string),
            auto_update_interval: config.auto_update_interval,
            watch: config.watch,
        }
    }
}

/// 读取器替换通知
pub trait SwapListener<D>: Send + Sync {
    /// 新读取器生效后、旧读取器释放前调用
    fn on_swap(&self, current: &Arc<LoadedDatabase<D>>);
}

pub struct GeoStore<D: GeoDatabase> {
    options: GeoUpdateOptions,
    path: PathBuf,
    current: ArcSwapOption<LoadedDatabase<D>>,
    fetcher: Arc<dyn Fetcher>,
    cancel: CancellationToken,
    generation: AtomicU64,
    refresh: RefreshLock,
    listener: RwLock<Option<Weak<dyn SwapListener<D>>>>,
}

impl<D: GeoDatabase> GeoStore<D> {
    pub fn new(
        options: GeoUpdateOptions,
        resolver: &PathResolver,
        fetcher: Arc<dyn Fetcher>,
        cancel: CancellationToken,
    ) -> Self {
        let path = resolver.resolve(options.path.as_deref(), D::KIND.default_filename());
        let path = std::path::absolute(&path).unwrap_or(path);
        Self {
            options,
            path,
            current: ArcSwapOption::empty(),
            fetcher,
            cancel,
            generation: AtomicU64::new(0),
            refresh: RefreshLock::new(),
            listener: RwLock::new(None),
        }
    }

    pub fn kind(&self) -> DatabaseKind {
        D::KIND
    }

    /// 解析后的数据库文件路径
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn options(&self) -> &GeoUpdateOptions {
        &self.options
    }

    pub fn download_url(&self) -> &str {
        self.options
            .download_url
            .as_deref()
            .unwrap_or_else(|| D::KIND.default_download_url())
    }

    /// 当前读取器快照
    pub fn current(&self) -> Option<Arc<LoadedDatabase<D>>> {
        self.current.load_full()
    }

    pub fn refresh_lock(&self) -> &RefreshLock {
        &self.refresh
    }

    pub fn set_listener(&self, listener: Weak<dyn SwapListener<D>>) {
        *self.listener.write() = Some(listener);
    }

    /// 启动准备：文件缺失时下载（最多 3 次），然后打开
    pub async fn prepare(&self) -> Result<Arc<LoadedDatabase<D>>, GeoError> {
        let kind = D::KIND;
        if !validate_existing(kind, &self.path)? {
            warn!(kind = %kind, path = %self.path.display(), "database not exists");
            self.fetch_with_retry(&self.path).await?;
        }
        let loaded = self.open(self.path.clone()).await?;
        Ok(self.install(loaded))
    }

    async fn fetch_with_retry(&self, target: &Path) -> Result<(), GeoError> {
        let kind = D::KIND;
        let url = self.download_url();
        let detour = self.options.download_detour.as_deref();

        let mut last_error = None;
        for attempt in 1..=FETCH_ATTEMPTS {
            match self.fetcher.fetch(url, target, detour, &self.cancel).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    error!(kind = %kind, attempt, error = %e, "download database failed");
                    let _ = std::fs::remove_file(target);
                    let permanent = e.is_permanent();
                    last_error = Some(e);
                    if permanent {
                        break;
                    }
                }
            }
        }
        Err(last_error.unwrap_or_else(|| GeoError::Missing {
            kind,
            path: target.to_path_buf(),
        }))
    }

    /// 打开 `new_path` 并替换当前读取器；打开失败时保持原状
    pub async fn swap(&self, new_path: &Path) -> Result<Arc<LoadedDatabase<D>>, GeoError> {
        let loaded = self.open(new_path.to_path_buf()).await?;
        Ok(self.install(loaded))
    }

    /// 重新打开磁盘上的数据库文件（文件变化触发，不访问网络）
    pub async fn reload(&self) -> Result<Arc<LoadedDatabase<D>>, GeoError> {
        if !validate_existing(D::KIND, &self.path)? {
            return Err(GeoError::Missing {
                kind: D::KIND,
                path: self.path.clone(),
            });
        }
        self.swap(&self.path.clone()).await
    }

    /// 下载到临时文件，校验可打开后原子改名覆盖，再替换读取器
    pub async fn download_then_swap(
        &self,
        temp_suffix: &str,
    ) -> Result<Arc<LoadedDatabase<D>>, GeoError> {
        let kind = D::KIND;
        validate_existing(kind, &self.path)?;

        let temp = with_suffix(&self.path, temp_suffix);
        match tokio::fs::remove_file(&temp).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        let fetched = self
            .fetcher
            .fetch(
                self.download_url(),
                &temp,
                self.options.download_detour.as_deref(),
                &self.cancel,
            )
            .await;
        if let Err(e) = fetched {
            let _ = tokio::fs::remove_file(&temp).await;
            return Err(e);
        }
        info!(kind = %kind, "download database success");

        let mut loaded = match self.open(temp.clone()).await {
            Ok(loaded) => loaded,
            Err(e) => {
                let _ = tokio::fs::remove_file(&temp).await;
                return Err(e);
            }
        };

        if let Err(e) = tokio::fs::rename(&temp, &self.path).await {
            let _ = tokio::fs::remove_file(&temp).await;
            return Err(GeoError::Persist { kind, source: e });
        }
        loaded.source_path = self.path.clone();
        Ok(self.install(loaded))
    }

    async fn open(&self, path: PathBuf) -> Result<LoadedDatabase<D>, GeoError> {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let source_path = path.clone();
        let (reader, codes) = tokio::task::spawn_blocking(move || D::open(&path))
            .await
            .map_err(|e| GeoError::Other(anyhow::anyhow!("open task failed: {}", e)))?
            .map_err(|e| GeoError::corrupt(D::KIND, e))?;
        Ok(LoadedDatabase {
            reader,
            codes,
            source_path,
            loaded_at: SystemTime::now(),
            generation,
        })
    }

    fn install(&self, loaded: LoadedDatabase<D>) -> Arc<LoadedDatabase<D>> {
        let loaded = Arc::new(loaded);
        info!(
            kind = %D::KIND,
            codes = loaded.codes.len(),
            path = %loaded.source_path.display(),
            "loaded database"
        );

        let previous = self.current.swap(Some(loaded.clone()));
        let listener = self.listener.read().as_ref().and_then(Weak::upgrade);
        if let Some(listener) = listener {
            listener.on_swap(&loaded);
        }
        drop(previous);
        loaded
    }
}

#[async_trait]
impl<D: GeoDatabase> RefreshTarget for GeoStore<D> {
    fn kind(&self) -> DatabaseKind {
        D::KIND
    }

    fn live_path(&self) -> &Path {
        &self.path
    }

    fn update_interval(&self) -> Duration {
        self.options.auto_update_interval
    }

    fn watch_enabled(&self) -> bool {
        self.options.watch
    }

    fn refresh_lock(&self) -> &RefreshLock {
        &self.refresh
    }

    async fn update(&self) -> Result<(), GeoError> {
        info!(kind = %D::KIND, "try to update database...");
        self.download_then_swap(TEMP_SUFFIX).await?;
        info!(kind = %D::KIND, "reload database success");
        Ok(())
    }

    async fn reload(&self) -> Result<(), GeoError> {
        GeoStore::reload(self).await.map(|_| ())
    }
}

/// 检查已有文件
///
/// 目录返回配置错误；空文件删除后视为不存在。返回文件是否存在。
pub fn validate_existing(kind: DatabaseKind, path: &Path) -> Result<bool, GeoError> {
    match std::fs::metadata(path) {
        Ok(meta) if meta.is_dir() => Err(GeoError::IsDirectory {
            kind,
            path: path.to_path_buf(),
        }),
        Ok(meta) if meta.len() == 0 => {
            warn!(kind = %kind, path = %path.display(), "removing empty database file");
            std::fs::remove_file(path)?;
            Ok(false)
        }
        Ok(_) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e.into()),
    }
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(suffix);
    PathBuf::from(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::GeoErrorKind;

    #[test]
    fn directory_is_configuration_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = validate_existing(DatabaseKind::GeoIp, dir.path()).unwrap_err();
        assert_eq!(err.kind(), GeoErrorKind::Configuration);
    }

    #[test]
    fn empty_file_is_removed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("geosite.db");
        std::fs::write(&path, b"").unwrap();
        assert!(!validate_existing(DatabaseKind::GeoSite, &path).unwrap());
        assert!(!path.exists());
    }

    #[test]
    fn existing_file_is_kept() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("geoip.db");
        std::fs::write(&path, b"data").unwrap();
        assert!(validate_existing(DatabaseKind::GeoIp, &path).unwrap());
        assert!(!validate_existing(DatabaseKind::GeoIp, &dir.path().join("absent")).unwrap());
    }

    #[test]
    fn temp_suffix_appends_to_file_name() {
        let path = with_suffix(Path::new("/var/lib/geoip.db"), TEMP_SUFFIX);
        assert_eq!(path, PathBuf::from("/var/lib/geoip.db.tmp"));
    }

    #[test]
    fn options_from_config_drop_empty_values() {
        let config = GeoResourceConfig {
            path: Some(String::new()),
            download_url: Some("https://example.com/geoip.db".to_string()),
            ..Default::default()
        };
        let options = GeoUpdateOptions::from(&config);
        assert!(options.path.is_none());
        assert_eq!(options.download_url.as_deref(), Some("https://example.com/geoip.db"));
        assert!(options.watch);
    }
}
