//! 地理数据库刷新调度
//!
//! 每种数据库一个协调任务，独占非阻塞锁语义。触发源（启动过期检查、
//! 定时器、文件监听）各自一个任务，通过有界队列向协调任务发送请求。
//! 锁被占用时请求直接丢弃，不排队也不报错。

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use notify::event::{AccessKind, AccessMode, ModifyKind, RenameMode};
use notify::{Event, EventKind, RecursiveMode, Watcher};
use tokio::sync::{mpsc, Mutex, OwnedMutexGuard};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::common::{DatabaseKind, GeoError};

/// 协调队列容量，触发源使用 try_send，满了即丢弃
const REQUEST_QUEUE: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshRequest {
    /// 下载、校验并替换
    Update,
    /// 仅重新打开本地文件
    Reload,
}

impl RefreshRequest {
    pub fn as_str(self) -> &'static str {
        match self {
            RefreshRequest::Update => "update",
            RefreshRequest::Reload => "reload",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshState {
    Idle,
    Refreshing,
}

#[derive(Debug, Clone, Copy)]
pub struct RefreshStats {
    pub cycles_started: u64,
    pub in_flight: usize,
    pub peak_concurrent: usize,
    pub state: RefreshState,
}

#[derive(Default)]
struct Counters {
    cycles: AtomicU64,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

/// 单个数据库的非阻塞刷新锁
pub struct RefreshLock {
    mutex: Arc<Mutex<()>>,
    counters: Arc<Counters>,
}

/// 持有期间该数据库处于 Refreshing 状态
pub struct RefreshGuard {
    _lock: OwnedMutexGuard<()>,
    counters: Arc<Counters>,
}

impl Drop for RefreshGuard {
    fn drop(&mut self) {
        self.counters.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

impl Default for RefreshLock {
    fn default() -> Self {
        Self::new()
    }
}

impl RefreshLock {
    pub fn new() -> Self {
        Self {
            mutex: Arc::new(Mutex::new(())),
            counters: Arc::new(Counters::default()),
        }
    }

    /// Idle -> Refreshing；已在刷新时返回 None
    pub fn try_begin(&self) -> Option<RefreshGuard> {
        let lock = self.mutex.clone().try_lock_owned().ok()?;
        let current = self.counters.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.counters.peak.fetch_max(current, Ordering::SeqCst);
        self.counters.cycles.fetch_add(1, Ordering::SeqCst);
        Some(RefreshGuard {
            _lock: lock,
            counters: self.counters.clone(),
        })
    }

    pub fn stats(&self) -> RefreshStats {
        let in_flight = self.counters.in_flight.load(Ordering::SeqCst);
        RefreshStats {
            cycles_started: self.counters.cycles.load(Ordering::SeqCst),
            in_flight,
            peak_concurrent: self.counters.peak.load(Ordering::SeqCst),
            state: if in_flight > 0 {
                RefreshState::Refreshing
            } else {
                RefreshState::Idle
            },
        }
    }
}

/// 可被调度刷新的资源
#[async_trait]
pub trait RefreshTarget: Send + Sync + 'static {
    fn kind(&self) -> DatabaseKind;
    fn live_path(&self) -> &Path;
    fn update_interval(&self) -> Duration;
    fn watch_enabled(&self) -> bool;
    fn refresh_lock(&self) -> &RefreshLock;
    async fn update(&self) -> Result<(), GeoError>;
    async fn reload(&self) -> Result<(), GeoError>;
}

async fn run_cycle(target: &dyn RefreshTarget, request: RefreshRequest) {
    let kind = target.kind();
    let result = match request {
        RefreshRequest::Update => target.update().await,
        RefreshRequest::Reload => {
            info!(kind = %kind, "file changed, try to reload...");
            target.reload().await
        }
    };
    match result {
        Ok(()) => {
            if request == RefreshRequest::Reload {
                info!(kind = %kind, "database reloaded");
            }
        }
        Err(GeoError::Cancelled) => debug!(kind = %kind, "refresh cancelled"),
        Err(e) => error!(
            kind = %kind,
            request = request.as_str(),
            error = %e,
            "refresh failed, keeping current database"
        ),
    }
}

/// 尝试获取锁并在后台执行一次刷新；锁被占用时返回 None
pub fn dispatch(target: &Arc<dyn RefreshTarget>, request: RefreshRequest) -> Option<JoinHandle<()>> {
    let Some(guard) = target.refresh_lock().try_begin() else {
        debug!(
            kind = %target.kind(),
            request = request.as_str(),
            "refresh in progress, trigger ignored"
        );
        return None;
    };
    let target = target.clone();
    Some(tokio::spawn(async move {
        let _guard = guard;
        run_cycle(target.as_ref(), request).await;
    }))
}

/// 尝试获取锁并就地执行一次刷新，返回是否执行
pub async fn run_exclusive(target: &dyn RefreshTarget, request: RefreshRequest) -> bool {
    let Some(_guard) = target.refresh_lock().try_begin() else {
        debug!(
            kind = %target.kind(),
            request = request.as_str(),
            "refresh in progress, trigger ignored"
        );
        return false;
    };
    run_cycle(target, request).await;
    true
}

/// 单个数据库的刷新调度器
pub struct RefreshScheduler {
    kind: DatabaseKind,
    requests: mpsc::Sender<RefreshRequest>,
    tasks: Vec<JoinHandle<()>>,
}

impl RefreshScheduler {
    /// 启动协调任务以及定时、监听触发源
    pub fn start(target: Arc<dyn RefreshTarget>, cancel: CancellationToken) -> Self {
        let kind = target.kind();
        let (tx, rx) = mpsc::channel(REQUEST_QUEUE);
        let mut tasks = vec![tokio::spawn(coordinate(target.clone(), rx, cancel.clone()))];

        let interval = target.update_interval();
        if !interval.is_zero() {
            tasks.push(tokio::spawn(periodic(
                kind,
                target.live_path().to_path_buf(),
                interval,
                tx.clone(),
                cancel.clone(),
            )));
        }

        if target.watch_enabled() {
            match spawn_watcher(kind, target.live_path().to_path_buf(), tx.clone(), cancel) {
                Ok(task) => tasks.push(task),
                Err(e) => warn!(kind = %kind, error = %e, "geo resource watcher not started"),
            }
        }

        Self {
            kind,
            requests: tx,
            tasks,
        }
    }

    pub fn kind(&self) -> DatabaseKind {
        self.kind
    }

    /// 非阻塞提交刷新请求，队列满时丢弃
    pub fn request(&self, request: RefreshRequest) -> bool {
        send_request(self.kind, &self.requests, request)
    }

    /// 等待所有后台任务退出（需先取消 token）
    pub async fn join(self) {
        drop(self.requests);
        for task in self.tasks {
            let _ = task.await;
        }
    }
}

fn send_request(
    kind: DatabaseKind,
    tx: &mpsc::Sender<RefreshRequest>,
    request: RefreshRequest,
) -> bool {
    match tx.try_send(request) {
        Ok(()) => true,
        Err(_) => {
            debug!(kind = %kind, request = request.as_str(), "refresh queue busy, trigger dropped");
            false
        }
    }
}

async fn coordinate(
    target: Arc<dyn RefreshTarget>,
    mut rx: mpsc::Receiver<RefreshRequest>,
    cancel: CancellationToken,
) {
    let mut cycles: Vec<JoinHandle<()>> = Vec::new();
    loop {
        let request = tokio::select! {
            _ = cancel.cancelled() => break,
            request = rx.recv() => match request {
                Some(request) => request,
                None => break,
            },
        };
        cycles.retain(|task| !task.is_finished());
        if let Some(task) = dispatch(&target, request) {
            cycles.push(task);
        }
    }

    for task in cycles {
        let _ = task.await;
    }
    debug!(kind = %target.kind(), "refresh coordinator stopped");
}

/// 文件修改时间早于 `interval` 视为过期
pub fn is_stale(path: &Path, interval: Duration) -> bool {
    std::fs::metadata(path)
        .and_then(|meta| meta.modified())
        .ok()
        .and_then(|modified| modified.elapsed().ok())
        .is_some_and(|age| age > interval)
}

async fn periodic(
    kind: DatabaseKind,
    path: PathBuf,
    interval: Duration,
    tx: mpsc::Sender<RefreshRequest>,
    cancel: CancellationToken,
) {
    if is_stale(&path, interval) {
        info!(kind = %kind, path = %path.display(), "database is outdated, updating now");
        send_request(kind, &tx, RefreshRequest::Update);
    }

    let Some(start) = Instant::now().checked_add(interval) else {
        warn!(kind = %kind, interval = ?interval, "update interval too large, periodic refresh disabled");
        return;
    };
    let mut ticker = tokio::time::interval_at(start, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                send_request(kind, &tx, RefreshRequest::Update);
            }
        }
    }
    debug!(kind = %kind, "periodic refresh stopped");
}

/// 监听事件是否应触发重载
///
/// 只关心目标路径本身；删除、权限变化、移出以及只读访问都忽略。
pub fn is_relevant(event: &Event, live_path: &Path) -> bool {
    let ignored = match event.kind {
        EventKind::Remove(_) => true,
        EventKind::Modify(ModifyKind::Metadata(_)) => true,
        EventKind::Modify(ModifyKind::Name(RenameMode::From)) => true,
        EventKind::Access(AccessKind::Close(AccessMode::Write)) => false,
        EventKind::Access(_) => true,
        _ => false,
    };
    !ignored && event.paths.iter().any(|p| same_file(p, live_path))
}

fn same_file(a: &Path, b: &Path) -> bool {
    if a == b {
        return true;
    }
    if a.file_name() != b.file_name() {
        return false;
    }
    let parent = |p: &Path| p.parent().and_then(|dir| dir.canonicalize().ok());
    matches!((parent(a), parent(b)), (Some(x), Some(y)) if x == y)
}

fn spawn_watcher(
    kind: DatabaseKind,
    live_path: PathBuf,
    tx: mpsc::Sender<RefreshRequest>,
    cancel: CancellationToken,
) -> Result<JoinHandle<()>, GeoError> {
    let dir = live_path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));

    let (event_tx, mut event_rx) = mpsc::unbounded_channel();
    let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| {
        let _ = event_tx.send(res);
    })
    .map_err(|e| GeoError::Other(e.into()))?;
    watcher
        .watch(&dir, RecursiveMode::NonRecursive)
        .map_err(|e| GeoError::Other(e.into()))?;
    debug!(kind = %kind, path = %live_path.display(), "geo resource watcher: watching");

    Ok(tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                event = event_rx.recv() => match event {
                    Some(Ok(event)) => {
                        if is_relevant(&event, &live_path) {
                            send_request(kind, &tx, RefreshRequest::Reload);
                        }
                    }
                    Some(Err(e)) => {
                        error!(kind = %kind, error = %e, "geo resource watcher: fsnotify error");
                    }
                    None => break,
                },
            }
        }

        drop(watcher);
        event_rx.close();
        while event_rx.try_recv().is_ok() {}
        debug!(kind = %kind, "geo resource watcher stopped");
    }))
}
