//! 规则集提供者
//!
//! local 规则集直接读取文件；remote 规则集经由 detour 下载到本地缓存，
//! 校验通过后原子替换文件和内存中的数据。

use std::collections::HashSet;
use std::fmt;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use anyhow::Result;
use arc_swap::ArcSwap;
use async_trait::async_trait;
use ipnet::IpNet;
use parking_lot::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::fetch::Fetcher;
use super::rules::{parse_prefix, HeadlessRule, InboundContext, RuleSet, RuleSetMetadata};
use super::scheduler::{is_stale, RefreshLock};
use super::srs::{is_srs_format, parse_srs};
use super::trie::DomainMatcher;
use crate::common::GeoError;
use crate::config::path::PathResolver;
use crate::config::types::RuleSetConfig;

/// remote 规则集未配置更新间隔时的默认值
pub const DEFAULT_UPDATE_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);

/// 规则集内容，加载后只读
#[derive(Default)]
pub struct RuleSetData {
    pub domain: DomainMatcher,
    pub ip_cidrs: Vec<IpNet>,
    pub source_ip_cidrs: Vec<IpNet>,
    pub process_names: HashSet<String>,
    pub wifi_ssids: HashSet<String>,
}

impl RuleSetData {
    /// 任一条目命中即匹配
    pub fn matches(&self, ctx: &InboundContext) -> bool {
        if ctx.domain().is_some_and(|d| self.domain.matches(d)) {
            return true;
        }
        if ctx
            .destination_ips()
            .any(|ip| self.ip_cidrs.iter().any(|net| net.contains(&ip)))
        {
            return true;
        }
        if let Some(source) = ctx.source {
            let ip: IpAddr = source.ip();
            if self.source_ip_cidrs.iter().any(|net| net.contains(&ip)) {
                return true;
            }
        }
        if ctx
            .process_name
            .as_ref()
            .is_some_and(|name| self.process_names.contains(name))
        {
            return true;
        }
        ctx.wifi_ssid
            .as_ref()
            .is_some_and(|ssid| self.wifi_ssids.contains(ssid))
    }

    pub fn rule_count(&self) -> usize {
        self.domain.len()
            + self.ip_cidrs.len()
            + self.source_ip_cidrs.len()
            + self.process_names.len()
            + self.wifi_ssids.len()
    }

    pub fn metadata(&self) -> RuleSetMetadata {
        RuleSetMetadata {
            contains_process_rule: !self.process_names.is_empty(),
            contains_wifi_rule: !self.wifi_ssids.is_empty(),
            contains_ip_cidr_rule: !self.ip_cidrs.is_empty(),
        }
    }
}

/// 按格式解析规则集文件；内容带 SRS 魔数时总是按二进制解析
pub fn parse_rule_set(content: &[u8], format: &str, behavior: &str) -> Result<RuleSetData> {
    if format == "binary" || is_srs_format(content) {
        return parse_srs(content);
    }
    let text = std::str::from_utf8(content)
        .map_err(|e| anyhow::anyhow!("rule-set is not valid UTF-8: {}", e))?;
    match behavior {
        "domain" => parse_domain_rules(text),
        "ipcidr" => parse_ipcidr_rules(text),
        "classical" => parse_classical_rules(text),
        other => anyhow::bail!("unsupported rule-set behavior '{}'", other),
    }
}

/// 源格式的规则行，去掉 YAML 列表前缀和引号
fn payload_lines(content: &str) -> impl Iterator<Item = &str> {
    content.lines().filter_map(|line| {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') || line == "payload:" {
            return None;
        }
        let line = line.strip_prefix("- ").unwrap_or(line);
        let line = line.trim_matches('\'').trim_matches('"');
        (!line.is_empty()).then_some(line)
    })
}

/// 域名行为
///
/// 支持格式:
/// - 纯文本: 每行一个域名，默认后缀匹配
/// - Clash YAML payload: `- '+.example.com'` 或 `- 'example.com'`
/// - 前缀语法: `domain:`, `domain_suffix:`, `domain_keyword:`, `domain_regex:`, `+.`
fn parse_domain_rules(content: &str) -> Result<RuleSetData> {
    let mut data = RuleSetData::default();
    for line in payload_lines(content) {
        if let Some(domain) = line.strip_prefix("domain:") {
            data.domain.add_full(domain);
        } else if let Some(suffix) = line.strip_prefix("domain_suffix:") {
            data.domain.add_suffix(suffix);
        } else if let Some(keyword) = line.strip_prefix("domain_keyword:") {
            data.domain.add_keyword(keyword);
        } else if let Some(pattern) = line.strip_prefix("domain_regex:") {
            data.domain.add_regex(pattern)?;
        } else if let Some(suffix) = line.strip_prefix("+.") {
            data.domain.add_suffix(suffix);
        } else {
            data.domain.add_suffix(line);
        }
    }
    Ok(data)
}

fn parse_ipcidr_rules(content: &str) -> Result<RuleSetData> {
    let mut data = RuleSetData::default();
    for line in payload_lines(content) {
        data.ip_cidrs.push(parse_prefix(line)?);
    }
    Ok(data)
}

/// classical 行为
///
/// 每行格式: `RULE-TYPE,value[,extra]`。不支持的类型跳过。
fn parse_classical_rules(content: &str) -> Result<RuleSetData> {
    let mut data = RuleSetData::default();
    for line in payload_lines(content) {
        let mut parts = line.splitn(3, ',');
        let (Some(kind), Some(value)) = (parts.next(), parts.next()) else {
            continue;
        };
        let value = value.trim();
        match kind.trim() {
            "DOMAIN" => data.domain.add_full(value),
            "DOMAIN-SUFFIX" => data.domain.add_suffix(value),
            "DOMAIN-KEYWORD" => data.domain.add_keyword(value),
            "DOMAIN-REGEX" => data.domain.add_regex(value)?,
            "IP-CIDR" | "IP-CIDR6" => data.ip_cidrs.push(parse_prefix(value)?),
            "SRC-IP-CIDR" => data.source_ip_cidrs.push(parse_prefix(value)?),
            "PROCESS-NAME" => {
                data.process_names.insert(value.to_string());
            }
            "WIFI-SSID" => {
                data.wifi_ssids.insert(value.to_string());
            }
            other => debug!(rule_type = other, "unsupported rule-set line skipped"),
        }
    }
    Ok(data)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ProviderKind {
    Local,
    Remote,
}

struct ProviderInner {
    tag: String,
    kind: ProviderKind,
    format: String,
    behavior: String,
    path: PathBuf,
    url: Option<String>,
    detour: Option<String>,
    interval: Duration,
    data: ArcSwap<RuleSetData>,
    updated: RwLock<Option<SystemTime>>,
    fetcher: Arc<dyn Fetcher>,
    cancel: CancellationToken,
    refresh: RefreshLock,
}

/// 文件或远程来源的规则集
pub struct ProviderRuleSet {
    inner: Arc<ProviderInner>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ProviderRuleSet {
    pub fn new(
        config: &RuleSetConfig,
        resolver: &PathResolver,
        fetcher: Arc<dyn Fetcher>,
        cancel: &CancellationToken,
    ) -> Result<Self> {
        let kind = match config.kind.as_str() {
            "local" => ProviderKind::Local,
            "remote" => ProviderKind::Remote,
            other => anyhow::bail!("rule-set '{}': unknown type '{}'", config.tag, other),
        };
        if !matches!(config.format.as_str(), "source" | "binary") {
            anyhow::bail!("rule-set '{}': unknown format '{}'", config.tag, config.format);
        }
        let url = config.url.clone().filter(|u| !u.is_empty());
        let path = match (kind, config.path.as_deref().filter(|p| !p.is_empty())) {
            (_, Some(path)) => resolver.base_path(path),
            (ProviderKind::Remote, None) => {
                let ext = if config.format == "binary" { "srs" } else { "list" };
                resolver.base_path(format!("rule-set/{}.{}", config.tag, ext))
            }
            (ProviderKind::Local, None) => {
                anyhow::bail!("rule-set '{}': local rule-set requires a path", config.tag)
            }
        };
        if kind == ProviderKind::Remote && url.is_none() {
            anyhow::bail!("rule-set '{}': remote rule-set requires a url", config.tag);
        }
        let interval = match (kind, config.update_interval.is_zero()) {
            (ProviderKind::Remote, true) => DEFAULT_UPDATE_INTERVAL,
            _ => config.update_interval,
        };

        Ok(Self {
            inner: Arc::new(ProviderInner {
                tag: config.tag.clone(),
                kind,
                format: config.format.clone(),
                behavior: config.behavior.clone(),
                path,
                url,
                detour: config.download_detour.clone().filter(|d| !d.is_empty()),
                interval,
                data: ArcSwap::from_pointee(RuleSetData::default()),
                updated: RwLock::new(None),
                fetcher,
                cancel: cancel.child_token(),
                refresh: RefreshLock::new(),
            }),
            task: Mutex::new(None),
        })
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    pub fn refresh_lock(&self) -> &RefreshLock {
        &self.inner.refresh
    }
}

impl ProviderInner {
    async fn load_file(&self, path: &Path) -> Result<RuleSetData, GeoError> {
        let content = tokio::fs::read(path).await?;
        let format = self.format.clone();
        let behavior = self.behavior.clone();
        tokio::task::spawn_blocking(move || parse_rule_set(&content, &format, &behavior))
            .await
            .map_err(|e| GeoError::Other(anyhow::anyhow!("parse task failed: {}", e)))?
            .map_err(|e| GeoError::Config(format!("rule-set '{}': {}", self.tag, e)))
    }

    fn install(&self, data: RuleSetData) {
        info!(
            tag = %self.tag,
            rules = data.rule_count(),
            path = %self.path.display(),
            "rule-set loaded"
        );
        self.data.store(Arc::new(data));
        *self.updated.write() = Some(SystemTime::now());
    }

    /// 下载到临时文件，解析通过后改名覆盖并替换内存数据
    async fn download(&self) -> Result<(), GeoError> {
        let Some(url) = self.url.as_deref() else {
            return Ok(());
        };
        let mut temp = self.path.clone().into_os_string();
        temp.push(".tmp");
        let temp = PathBuf::from(temp);

        self.fetcher
            .fetch(url, &temp, self.detour.as_deref(), &self.cancel)
            .await?;
        let data = match self.load_file(&temp).await {
            Ok(data) => data,
            Err(e) => {
                let _ = tokio::fs::remove_file(&temp).await;
                return Err(e);
            }
        };
        if let Err(e) = tokio::fs::rename(&temp, &self.path).await {
            let _ = tokio::fs::remove_file(&temp).await;
            return Err(e.into());
        }
        self.install(data);
        Ok(())
    }

    async fn update(&self) -> Result<(), GeoError> {
        match self.kind {
            ProviderKind::Remote => self.download().await,
            ProviderKind::Local => {
                let data = self.load_file(&self.path).await?;
                self.install(data);
                Ok(())
            }
        }
    }

    async fn run_periodic(self: Arc<Self>) {
        let Some(start) = tokio::time::Instant::now().checked_add(self.interval) else {
            return;
        };
        let mut ticker = tokio::time::interval_at(start, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let Some(_guard) = self.refresh.try_begin() else {
                        continue;
                    };
                    match self.update().await {
                        Ok(()) => {}
                        Err(GeoError::Cancelled) => break,
                        Err(e) => error!(tag = %self.tag, error = %e, "rule-set update failed"),
                    }
                }
            }
        }
        debug!(tag = %self.tag, "rule-set refresh stopped");
    }
}

impl fmt::Display for ProviderRuleSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "rule_set[{}]", self.inner.tag)
    }
}

impl HeadlessRule for ProviderRuleSet {
    fn matches(&self, ctx: &InboundContext) -> bool {
        self.inner.data.load().matches(ctx)
    }

    fn rule_count(&self) -> usize {
        self.inner.data.load().rule_count()
    }

    fn contains_destination_ip_cidr(&self) -> bool {
        !self.inner.data.load().ip_cidrs.is_empty()
    }
}

#[async_trait]
impl RuleSet for ProviderRuleSet {
    fn tag(&self) -> &str {
        &self.inner.tag
    }

    fn kind(&self) -> &str {
        match self.inner.kind {
            ProviderKind::Local => "local",
            ProviderKind::Remote => "remote",
        }
    }

    fn format(&self) -> &str {
        &self.inner.format
    }

    fn updated_time(&self) -> Option<SystemTime> {
        *self.inner.updated.read()
    }

    fn metadata(&self) -> RuleSetMetadata {
        self.inner.data.load().metadata()
    }

    async fn start(&self) -> Result<(), GeoError> {
        let inner = &self.inner;
        if inner.kind == ProviderKind::Remote
            && (!inner.path.exists() || is_stale(&inner.path, inner.interval))
        {
            if let Err(e) = inner.download().await {
                if !inner.path.exists() {
                    return Err(e);
                }
                warn!(tag = %inner.tag, error = %e, "rule-set download failed, using cached file");
            } else {
                return Ok(());
            }
        }
        let data = inner.load_file(&inner.path).await?;
        inner.install(data);
        Ok(())
    }

    fn post_start(&self) {
        if self.inner.kind != ProviderKind::Remote || self.inner.interval.is_zero() {
            return;
        }
        let mut task = self.task.lock();
        if task.is_none() {
            *task = Some(tokio::spawn(self.inner.clone().run_periodic()));
        }
    }

    async fn update(&self) -> Result<(), GeoError> {
        let Some(_guard) = self.inner.refresh.try_begin() else {
            debug!(tag = %self.inner.tag, "rule-set update in progress");
            return Ok(());
        };
        self.inner.update().await
    }

    fn close(&self) {
        self.inner.cancel.cancel();
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(domain: &str) -> InboundContext {
        InboundContext::for_domain(domain, 443)
    }

    #[test]
    fn parse_domain_plain_text() {
        let content = "example.com\ngoogle.com\n# comment\n\ntest.org\n";
        let data = parse_domain_rules(content).unwrap();
        assert_eq!(data.rule_count(), 3);
        assert!(data.matches(&ctx("example.com")));
        assert!(data.matches(&ctx("www.example.com")));
        assert!(data.matches(&ctx("sub.google.com")));
        assert!(!data.matches(&ctx("notexample.com")));
    }

    #[test]
    fn parse_domain_with_prefixes() {
        let content =
            "domain:exact.com\ndomain_suffix:suffix.com\ndomain_keyword:kw\ndomain_regex:^re\\d\\.\n";
        let data = parse_domain_rules(content).unwrap();
        assert_eq!(data.rule_count(), 4);
        assert!(data.matches(&ctx("exact.com")));
        assert!(!data.matches(&ctx("sub.exact.com")));
        assert!(data.matches(&ctx("sub.suffix.com")));
        assert!(data.matches(&ctx("kw.example.com")));
        assert!(data.matches(&ctx("re1.example.com")));
    }

    #[test]
    fn parse_domain_clash_yaml_format() {
        let content = "payload:\n  - '+.google.com'\n  - 'facebook.com'\n";
        let data = parse_domain_rules(content).unwrap();
        assert!(data.matches(&ctx("www.google.com")));
        assert!(data.matches(&ctx("sub.facebook.com")));
    }

    #[test]
    fn parse_ipcidr_rules_and_errors() {
        let data = parse_ipcidr_rules("10.0.0.0/8\n192.168.1.1\n").unwrap();
        assert_eq!(data.ip_cidrs.len(), 2);
        assert!(data.matches(&InboundContext::for_ip("10.1.2.3".parse().unwrap(), 80)));
        assert!(data.matches(&InboundContext::for_ip("192.168.1.1".parse().unwrap(), 80)));
        assert!(!data.matches(&InboundContext::for_ip("8.8.8.8".parse().unwrap(), 80)));
        assert!(data.metadata().contains_ip_cidr_rule);

        assert!(parse_ipcidr_rules("not-a-cidr\n").is_err());
    }

    #[test]
    fn parse_classical_mixed() {
        let content = "payload:\n  - 'DOMAIN,exact.com'\n  - 'DOMAIN-SUFFIX,google.com'\n  - 'IP-CIDR,10.0.0.0/8,no-resolve'\n  - 'PROCESS-NAME,curl'\n  - 'WIFI-SSID,home'\n  - 'GEOIP,CN'\n";
        let data = parse_classical_rules(content).unwrap();
        assert!(data.matches(&ctx("exact.com")));
        assert!(data.matches(&ctx("www.google.com")));
        assert!(data.matches(&InboundContext::for_ip("10.0.0.1".parse().unwrap(), 80)));

        let mut process = ctx("unrelated.org");
        process.process_name = Some("curl".to_string());
        assert!(data.matches(&process));

        let metadata = data.metadata();
        assert!(metadata.contains_process_rule);
        assert!(metadata.contains_wifi_rule);
        assert!(metadata.contains_ip_cidr_rule);
    }

    #[test]
    fn unknown_behavior_is_error() {
        assert!(parse_rule_set(b"example.com", "source", "unknown").is_err());
    }

    fn local_config(path: &Path) -> RuleSetConfig {
        RuleSetConfig {
            tag: "local-set".to_string(),
            kind: "local".to_string(),
            format: "source".to_string(),
            behavior: "domain".to_string(),
            path: Some(path.display().to_string()),
            url: None,
            download_detour: None,
            update_interval: Duration::ZERO,
        }
    }

    struct NoFetch;

    #[async_trait]
    impl Fetcher for NoFetch {
        async fn fetch(
            &self,
            _url: &str,
            _save_path: &Path,
            _detour: Option<&str>,
            _cancel: &CancellationToken,
        ) -> Result<(), GeoError> {
            Err(GeoError::Config("network disabled".to_string()))
        }
    }

    #[tokio::test]
    async fn local_rule_set_loads_and_reloads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("set.list");
        std::fs::write(&path, "example.com\n").unwrap();

        let resolver = PathResolver::new(dir.path());
        let set = ProviderRuleSet::new(
            &local_config(&path),
            &resolver,
            Arc::new(NoFetch),
            &CancellationToken::new(),
        )
        .unwrap();
        assert!(set.updated_time().is_none());
        set.start().await.unwrap();
        assert!(set.matches(&ctx("www.example.com")));
        assert!(set.updated_time().is_some());

        std::fs::write(&path, "other.org\n").unwrap();
        set.update().await.unwrap();
        assert!(!set.matches(&ctx("www.example.com")));
        assert!(set.matches(&ctx("other.org")));
        set.close();
    }

    #[test]
    fn remote_requires_url() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = local_config(&dir.path().join("x"));
        config.kind = "remote".to_string();
        let resolver = PathResolver::new(dir.path());
        assert!(ProviderRuleSet::new(
            &config,
            &resolver,
            Arc::new(NoFetch),
            &CancellationToken::new()
        )
        .is_err());
    }

    #[tokio::test]
    async fn remote_falls_back_to_cached_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cached.list");
        std::fs::write(&path, "cached.example\n").unwrap();
        let file = std::fs::File::options().write(true).open(&path).unwrap();
        file.set_modified(SystemTime::now() - Duration::from_secs(3 * 24 * 3600))
            .unwrap();

        let mut config = local_config(&path);
        config.kind = "remote".to_string();
        config.url = Some("http://127.0.0.1:9/set.list".to_string());
        let resolver = PathResolver::new(dir.path());
        let set = ProviderRuleSet::new(
            &config,
            &resolver,
            Arc::new(NoFetch),
            &CancellationToken::new(),
        )
        .unwrap();
        set.start().await.unwrap();
        assert!(set.matches(&ctx("cached.example")));
        assert_eq!(set.kind(), "remote");
    }
}
