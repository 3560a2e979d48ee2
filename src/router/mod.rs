pub mod cache;
mod codec;
pub mod fetch;
pub mod geoip;
pub mod geosite;
pub mod provider;
pub mod rules;
pub mod scheduler;
pub mod srs;
pub mod store;
pub mod trie;

use std::collections::HashMap;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::common::{DatabaseKind, GeoError};
use crate::config::path::PathResolver;
use crate::config::types::Config;
use crate::proxy::OutboundResolver;
use cache::GeositeCatalog;
use fetch::{Fetcher, HttpFetcher};
use geoip::GeoIpReader;
use geosite::GeositeReader;
use provider::ProviderRuleSet;
use rules::{
    DefaultDnsRule, DefaultRule, DnsRule, HeadlessRule, InboundContext, RegionLookup, Rule, RuleEnv,
    RuleSet,
};
use scheduler::{run_exclusive, RefreshRequest, RefreshScheduler, RefreshStats, RefreshTarget};
use store::{GeoStore, GeoUpdateOptions, LoadedDatabase};

/// 路由核心：地理数据库、规则、DNS 规则与规则集
pub struct Router {
    geoip: Arc<GeoStore<GeoIpReader>>,
    geosite: Arc<GeositeCatalog>,
    need_geoip: bool,
    need_geosite: bool,
    rules: Vec<Arc<dyn Rule>>,
    dns_rules: Vec<Arc<dyn DnsRule>>,
    rule_sets: Vec<Arc<dyn RuleSet>>,
    rule_set_index: HashMap<String, Arc<dyn RuleSet>>,
    final_outbound: String,
    schedulers: tokio::sync::Mutex<Vec<RefreshScheduler>>,
    update_lock: tokio::sync::Mutex<()>,
    cancel: CancellationToken,
}

impl Router {
    /// 下载流量经由 `outbounds` 中的出站发出
    pub fn new(
        config: &Config,
        outbounds: Arc<dyn OutboundResolver>,
        cancel: CancellationToken,
    ) -> Result<Self, GeoError> {
        let fetcher = Arc::new(HttpFetcher::new(outbounds)?);
        Self::with_fetcher(config, fetcher, cancel)
    }

    pub fn with_fetcher(
        config: &Config,
        fetcher: Arc<dyn Fetcher>,
        cancel: CancellationToken,
    ) -> Result<Self, GeoError> {
        let resolver = match config.working_dir.as_deref().filter(|d| !d.is_empty()) {
            Some(dir) => PathResolver::new(dir),
            None => PathResolver::from_current_dir(),
        };

        let geoip = Arc::new(GeoStore::new(
            GeoUpdateOptions::from(&config.route.geoip),
            &resolver,
            fetcher.clone(),
            cancel.clone(),
        ));
        let geosite_store = Arc::new(GeoStore::new(
            GeoUpdateOptions::from(&config.route.geosite),
            &resolver,
            fetcher.clone(),
            cancel.clone(),
        ));
        let geosite = GeositeCatalog::new(geosite_store);

        let mut rule_sets: Vec<Arc<dyn RuleSet>> = Vec::new();
        let mut rule_set_index: HashMap<String, Arc<dyn RuleSet>> = HashMap::new();
        for rs_config in &config.route.rule_set {
            let rule_set: Arc<dyn RuleSet> = Arc::new(
                ProviderRuleSet::new(rs_config, &resolver, fetcher.clone(), &cancel)
                    .map_err(|e| GeoError::Config(e.to_string()))?,
            );
            if rule_set_index
                .insert(rs_config.tag.clone(), rule_set.clone())
                .is_some()
            {
                return Err(GeoError::Config(format!(
                    "duplicate rule-set tag '{}'",
                    rs_config.tag
                )));
            }
            rule_sets.push(rule_set);
        }

        let env = RuleEnv {
            region: geoip.clone() as Arc<dyn RegionLookup>,
            rule_sets: &rule_set_index,
        };

        let mut need_geoip = false;
        let mut need_geosite = false;
        let mut rules: Vec<Arc<dyn Rule>> = Vec::new();
        let mut geosite_rules: Vec<Arc<dyn Rule>> = Vec::new();
        for (index, rule_config) in config.route.rules.iter().enumerate() {
            let rule = DefaultRule::new(&rule_config.matcher, &rule_config.outbound, &env)
                .map_err(|e| GeoError::Config(format!("route rule[{}]: {}", index, e)))?;
            need_geoip |= rule.uses_geoip();
            let uses_geosite = !rule.geosite_codes().is_empty();
            let rule: Arc<dyn Rule> = Arc::new(rule);
            if uses_geosite {
                need_geosite = true;
                geosite_rules.push(rule.clone());
            }
            rules.push(rule);
        }

        let mut dns_rules: Vec<Arc<dyn DnsRule>> = Vec::new();
        let mut geosite_dns_rules: Vec<Arc<dyn DnsRule>> = Vec::new();
        for (index, rule_config) in config.dns.rules.iter().enumerate() {
            let rule = DefaultDnsRule::new(rule_config, &env)
                .map_err(|e| GeoError::Config(format!("dns rule[{}]: {}", index, e)))?;
            need_geoip |= rule.inner().uses_geoip();
            let uses_geosite = !rule.inner().geosite_codes().is_empty();
            let rule: Arc<dyn DnsRule> = Arc::new(rule);
            if uses_geosite {
                need_geosite = true;
                geosite_dns_rules.push(rule.clone());
            }
            dns_rules.push(rule);
        }
        geosite.register(geosite_rules, geosite_dns_rules);

        Ok(Self {
            geoip,
            geosite,
            need_geoip,
            need_geosite,
            rules,
            dns_rules,
            rule_sets,
            rule_set_index,
            final_outbound: config.route.final_outbound.clone(),
            schedulers: tokio::sync::Mutex::new(Vec::new()),
            update_lock: tokio::sync::Mutex::new(()),
            cancel,
        })
    }

    pub fn need_geoip(&self) -> bool {
        self.need_geoip
    }

    pub fn need_geosite(&self) -> bool {
        self.need_geosite
    }

    /// 准备被引用的数据库并加载规则集；任一失败即返回错误
    pub async fn start(&self) -> Result<(), GeoError> {
        if self.need_geoip {
            self.geoip.prepare().await?;
        }
        if self.need_geosite {
            self.geosite.store().prepare().await?;
            // 首次替换时已编译，此处命中缓存，只为把缺失代码作为启动错误返回
            for rule in &self.rules {
                rule.update_geosite(self.geosite.as_ref())
                    .map_err(|e| GeoError::Config(format!("rule {}: {}", rule, e)))?;
            }
            for rule in &self.dns_rules {
                rule.update_geosite(self.geosite.as_ref())
                    .map_err(|e| GeoError::Config(format!("dns rule {}: {}", rule, e)))?;
            }
        }
        for rule_set in &self.rule_sets {
            rule_set.start().await?;
        }
        info!(
            rules = self.rules.len(),
            dns_rules = self.dns_rules.len(),
            rule_sets = self.rule_sets.len(),
            "router started"
        );
        Ok(())
    }

    /// 启动后台刷新：定时器、文件监听和规则集更新
    pub async fn post_start(&self) {
        let mut schedulers = self.schedulers.lock().await;
        if !schedulers.is_empty() {
            return;
        }
        if self.need_geoip {
            let target: Arc<dyn RefreshTarget> = self.geoip.clone();
            schedulers.push(RefreshScheduler::start(target, self.cancel.clone()));
        }
        if self.need_geosite {
            let target: Arc<dyn RefreshTarget> = self.geosite.store().clone();
            schedulers.push(RefreshScheduler::start(target, self.cancel.clone()));
        }
        for rule_set in &self.rule_sets {
            rule_set.post_start();
        }
    }

    /// 取消所有后台任务并等待退出
    pub async fn close(&self) {
        self.cancel.cancel();
        let schedulers = std::mem::take(&mut *self.schedulers.lock().await);
        for scheduler in schedulers {
            scheduler.join().await;
        }
        for rule_set in &self.rule_sets {
            rule_set.close();
        }
        debug!("router closed");
    }

    /// 当前 GeoIP 读取器
    pub fn geoip_reader(&self) -> Option<Arc<LoadedDatabase<GeoIpReader>>> {
        self.geoip.current()
    }

    pub fn geosite_reader(&self) -> Option<Arc<LoadedDatabase<GeositeReader>>> {
        self.geosite.store().current()
    }

    /// 分类代码对应的编译规则，同一数据库版本内返回同一实例
    pub fn load_geosite(&self, code: &str) -> anyhow::Result<Arc<dyn Rule>> {
        self.geosite.load(code)
    }

    /// 手动更新规则引用到的数据库
    ///
    /// 已有更新在进行时直接返回；失败只记录日志。
    pub async fn update_geo_database(&self) {
        let Ok(_guard) = self.update_lock.try_lock() else {
            debug!("geo database update already running");
            return;
        };
        if self.need_geosite {
            run_exclusive(self.geosite.store().as_ref(), RefreshRequest::Update).await;
        }
        if self.need_geoip {
            run_exclusive(self.geoip.as_ref(), RefreshRequest::Update).await;
        }
    }

    pub fn geo_stats(&self, kind: DatabaseKind) -> RefreshStats {
        match kind {
            DatabaseKind::GeoIp => self.geoip.refresh_lock().stats(),
            DatabaseKind::GeoSite => self.geosite.store().refresh_lock().stats(),
        }
    }

    pub fn geoip_store(&self) -> &Arc<GeoStore<GeoIpReader>> {
        &self.geoip
    }

    pub fn geosite_catalog(&self) -> &Arc<GeositeCatalog> {
        &self.geosite
    }

    pub fn rules(&self) -> &[Arc<dyn Rule>] {
        &self.rules
    }

    pub fn rule(&self, uuid: &str) -> Option<&Arc<dyn Rule>> {
        self.rules.iter().find(|rule| rule.uuid() == uuid)
    }

    pub fn dns_rules(&self) -> &[Arc<dyn DnsRule>] {
        &self.dns_rules
    }

    pub fn dns_rule(&self, uuid: &str) -> Option<&Arc<dyn DnsRule>> {
        self.dns_rules.iter().find(|rule| rule.uuid() == uuid)
    }

    pub fn rule_sets(&self) -> &[Arc<dyn RuleSet>] {
        &self.rule_sets
    }

    pub fn rule_set(&self, tag: &str) -> Option<&Arc<dyn RuleSet>> {
        self.rule_set_index.get(tag)
    }

    pub fn final_outbound(&self) -> &str {
        &self.final_outbound
    }

    /// 第一条启用且匹配的规则的出站，均不匹配时返回 final
    pub fn route(&self, ctx: &InboundContext) -> &str {
        for rule in &self.rules {
            if !rule.disabled() && rule.matches(ctx) {
                debug!(rule = %rule, outbound = rule.outbound(), "route matched");
                return rule.outbound();
            }
        }
        debug!(outbound = %self.final_outbound, "route final");
        &self.final_outbound
    }

    /// 第一条启用且匹配的 DNS 规则
    pub fn match_dns(&self, ctx: &InboundContext) -> Option<&Arc<dyn DnsRule>> {
        self.dns_rules
            .iter()
            .find(|rule| !rule.disabled() && rule.matches(ctx))
    }
}
