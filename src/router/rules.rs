//! 规则模型
//!
//! 能力分层：[`HeadlessRule`] 只是匹配谓词；[`Rule`] 增加身份与生命周期；
//! [`DnsRule`] 增加 DNS 后备策略。[`RuleSet`] 是独立下载更新的规则集合。

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

use anyhow::Result;
use arc_swap::ArcSwap;
use async_trait::async_trait;
use ipnet::IpNet;
use tracing::info;

use super::trie::DomainMatcher;
use crate::common::{Address, GeoError};
use crate::config::types::{DnsRuleConfig, RuleMatchConfig};
use crate::proxy::Network;

/// 待匹配的连接或 DNS 查询元数据
#[derive(Debug, Clone, Default)]
pub struct InboundContext {
    pub inbound: String,
    pub network: Option<Network>,
    pub source: Option<SocketAddr>,
    pub destination: Option<Address>,
    /// 已解析的目标地址；DNS 规则中为响应地址
    pub destination_addresses: Vec<IpAddr>,
    pub process_name: Option<String>,
    pub wifi_ssid: Option<String>,
}

impl InboundContext {
    pub fn for_domain(domain: &str, port: u16) -> Self {
        Self {
            destination: Some(Address::Domain(domain.to_string(), port)),
            network: Some(Network::Tcp),
            ..Default::default()
        }
    }

    pub fn for_ip(ip: IpAddr, port: u16) -> Self {
        Self {
            destination: Some(Address::Ip(SocketAddr::new(ip, port))),
            network: Some(Network::Tcp),
            ..Default::default()
        }
    }

    pub fn domain(&self) -> Option<&str> {
        self.destination.as_ref().and_then(Address::domain)
    }

    pub fn destination_port(&self) -> Option<u16> {
        self.destination.as_ref().map(Address::port)
    }

    /// 目标 IP 字面量和已解析地址
    pub fn destination_ips(&self) -> impl Iterator<Item = IpAddr> + '_ {
        self.destination
            .as_ref()
            .and_then(Address::ip)
            .into_iter()
            .chain(self.destination_addresses.iter().copied())
    }
}

/// 纯匹配谓词
pub trait HeadlessRule: Send + Sync + fmt::Display {
    fn matches(&self, ctx: &InboundContext) -> bool;
    fn rule_count(&self) -> usize;
    fn contains_destination_ip_cidr(&self) -> bool;
}

/// 按分类代码取得编译后的规则
pub trait GeositeLoader: Send + Sync {
    fn load_geosite(&self, code: &str) -> Result<Arc<dyn Rule>>;
}

/// IP -> 地区代码
pub trait RegionLookup: Send + Sync {
    fn lookup_region(&self, ip: IpAddr) -> Option<String>;
}

/// 带身份和生命周期的规则
pub trait Rule: HeadlessRule {
    fn uuid(&self) -> &str;
    fn disabled(&self) -> bool;
    /// 切换启用状态
    fn change_status(&self);
    fn rule_type(&self) -> &str;
    fn outbound(&self) -> &str;
    /// 针对当前 GeoSite 数据库重新编译引用的分类
    fn update_geosite(&self, loader: &dyn GeositeLoader) -> Result<()>;
    fn skip_resolve(&self) -> bool;
}

/// DNS 后备策略匹配结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FallbackMatch {
    pub servers: Vec<String>,
    pub client_subnet: Option<IpNet>,
    pub rewrite_ttl: Option<u32>,
    /// 命中的尝试序号，0 为首选策略
    pub index: usize,
}

pub trait DnsRule: Rule {
    /// 第 `index` 次尝试使用的策略；规则不匹配或策略耗尽时返回 None
    fn match_fallback(&self, ctx: &InboundContext, index: usize) -> Option<FallbackMatch>;
    fn disable_cache(&self) -> bool;
    fn rewrite_ttl(&self) -> Option<u32>;
    fn client_subnet(&self) -> Option<IpNet>;
    fn with_address_limit(&self) -> bool;
    fn match_address_limit(&self, ctx: &InboundContext) -> bool;
    fn servers(&self) -> &[String];
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RuleSetMetadata {
    pub contains_process_rule: bool,
    pub contains_wifi_rule: bool,
    pub contains_ip_cidr_rule: bool,
}

/// 独立获取、校验、热替换的规则集
#[async_trait]
pub trait RuleSet: HeadlessRule {
    fn tag(&self) -> &str;
    /// local | remote
    fn kind(&self) -> &str;
    /// source | binary
    fn format(&self) -> &str;
    fn updated_time(&self) -> Option<SystemTime>;
    fn metadata(&self) -> RuleSetMetadata;
    /// 首次加载，失败则规则集不可用
    async fn start(&self) -> Result<(), GeoError>;
    /// 启动后台定时更新
    fn post_start(&self);
    /// 立即更新一次
    async fn update(&self) -> Result<(), GeoError>;
    fn close(&self);
}

/// 构建规则时需要的外部依赖
pub struct RuleEnv<'a> {
    pub region: Arc<dyn RegionLookup>,
    pub rule_sets: &'a HashMap<String, Arc<dyn RuleSet>>,
}

struct GeoIpItem {
    codes: HashSet<String>,
    lookup: Arc<dyn RegionLookup>,
}

impl GeoIpItem {
    fn matches(&self, ip: IpAddr) -> bool {
        if self.codes.contains("private") && !is_public_ip(ip) {
            return true;
        }
        self.lookup
            .lookup_region(ip)
            .is_some_and(|code| self.codes.contains(&code))
    }
}

/// 默认规则
///
/// 目标类条件（domain、geosite、geoip、ip_cidr、rule_set）之间为或，
/// 与 inbound、network、port 之间为与。
pub struct DefaultRule {
    uuid: String,
    outbound: String,
    invert: bool,
    skip_resolve: bool,
    disabled: AtomicBool,
    inbound: Vec<String>,
    network: Vec<Network>,
    ports: Vec<u16>,
    domain: Option<DomainMatcher>,
    geosite_codes: Vec<String>,
    geosite: ArcSwap<Vec<Arc<dyn Rule>>>,
    geoip: Option<GeoIpItem>,
    ip_cidrs: Vec<IpNet>,
    rule_sets: Vec<Arc<dyn RuleSet>>,
    description: String,
}

impl DefaultRule {
    pub fn new(config: &RuleMatchConfig, outbound: &str, env: &RuleEnv<'_>) -> Result<Self> {
        let mut rule = Self::empty(outbound);
        let mut description = Vec::new();

        rule.inbound = config.inbound.clone();
        if !config.inbound.is_empty() {
            description.push(format!("inbound=[{}]", config.inbound.join(" ")));
        }

        for network in &config.network {
            rule.network.push(match network.as_str() {
                "tcp" => Network::Tcp,
                "udp" => Network::Udp,
                other => anyhow::bail!("unknown network: {}", other),
            });
        }
        if !config.network.is_empty() {
            description.push(format!("network=[{}]", config.network.join(" ")));
        }

        rule.ports = config.port.clone();
        if !config.port.is_empty() {
            let ports: Vec<String> = config.port.iter().map(u16::to_string).collect();
            description.push(format!("port=[{}]", ports.join(" ")));
        }

        let mut matcher = DomainMatcher::new();
        for domain in &config.domain {
            matcher.add_full(domain);
        }
        for suffix in &config.domain_suffix {
            matcher.add_suffix(suffix);
        }
        for keyword in &config.domain_keyword {
            matcher.add_keyword(keyword);
        }
        for pattern in &config.domain_regex {
            matcher.add_regex(pattern)?;
        }
        if !matcher.is_empty() {
            description.push(format!("domain=<{} entries>", matcher.len()));
            rule.domain = Some(matcher);
        }

        rule.geosite_codes = config.geosite.iter().map(|c| c.to_lowercase()).collect();
        if !rule.geosite_codes.is_empty() {
            description.push(format!("geosite=[{}]", rule.geosite_codes.join(" ")));
        }

        if !config.geoip.is_empty() {
            let codes: HashSet<String> = config.geoip.iter().map(|c| c.to_lowercase()).collect();
            description.push(format!("geoip=[{}]", config.geoip.join(" ")));
            rule.geoip = Some(GeoIpItem {
                codes,
                lookup: env.region.clone(),
            });
        }

        for cidr in &config.ip_cidr {
            rule.ip_cidrs.push(parse_prefix(cidr)?);
        }
        if !config.ip_cidr.is_empty() {
            description.push(format!("ip_cidr=[{}]", config.ip_cidr.join(" ")));
        }

        for tag in &config.rule_set {
            let rule_set = env
                .rule_sets
                .get(tag)
                .ok_or_else(|| anyhow::anyhow!("rule-set not found: {}", tag))?;
            rule.rule_sets.push(rule_set.clone());
        }
        if !config.rule_set.is_empty() {
            description.push(format!("rule_set=[{}]", config.rule_set.join(" ")));
        }

        rule.invert = config.invert;
        rule.skip_resolve = config.skip_resolve;
        rule.disabled = AtomicBool::new(config.disabled);
        if config.invert {
            description.insert(0, "!".to_string());
        }
        rule.description = description.join(" ");
        Ok(rule)
    }

    /// 由编译后的分类条目构造（GeoSite 缓存使用）
    pub fn from_domain_matcher(name: String, matcher: DomainMatcher) -> Self {
        let mut rule = Self::empty("");
        rule.description = name;
        rule.domain = Some(matcher);
        rule
    }

    fn empty(outbound: &str) -> Self {
        Self {
            uuid: uuid::Uuid::new_v4().to_string(),
            outbound: outbound.to_string(),
            invert: false,
            skip_resolve: false,
            disabled: AtomicBool::new(false),
            inbound: Vec::new(),
            network: Vec::new(),
            ports: Vec::new(),
            domain: None,
            geosite_codes: Vec::new(),
            geosite: ArcSwap::from_pointee(Vec::new()),
            geoip: None,
            ip_cidrs: Vec::new(),
            rule_sets: Vec::new(),
            description: String::new(),
        }
    }

    pub fn geosite_codes(&self) -> &[String] {
        &self.geosite_codes
    }

    pub fn uses_geoip(&self) -> bool {
        self.geoip.is_some()
    }

    fn has_destination_items(&self) -> bool {
        self.domain.is_some()
            || !self.geosite_codes.is_empty()
            || self.geoip.is_some()
            || !self.ip_cidrs.is_empty()
            || !self.rule_sets.is_empty()
    }

    fn match_destination(&self, ctx: &InboundContext) -> bool {
        if let Some(domain) = ctx.domain() {
            if self.domain.as_ref().is_some_and(|m| m.matches(domain)) {
                return true;
            }
            if self.geosite.load().iter().any(|rule| rule.matches(ctx)) {
                return true;
            }
        }
        for ip in ctx.destination_ips() {
            if self.ip_cidrs.iter().any(|net| net.contains(&ip)) {
                return true;
            }
            if self.geoip.as_ref().is_some_and(|item| item.matches(ip)) {
                return true;
            }
        }
        self.rule_sets.iter().any(|set| set.matches(ctx))
    }

    fn match_all(&self, ctx: &InboundContext) -> bool {
        if !self.inbound.is_empty() && !self.inbound.contains(&ctx.inbound) {
            return false;
        }
        if !self.network.is_empty() && !ctx.network.is_some_and(|n| self.network.contains(&n)) {
            return false;
        }
        if !self.ports.is_empty()
            && !ctx.destination_port().is_some_and(|p| self.ports.contains(&p))
        {
            return false;
        }
        !self.has_destination_items() || self.match_destination(ctx)
    }
}

impl fmt::Display for DefaultRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.description)
    }
}

impl HeadlessRule for DefaultRule {
    fn matches(&self, ctx: &InboundContext) -> bool {
        self.match_all(ctx) != self.invert
    }

    fn rule_count(&self) -> usize {
        self.domain.as_ref().map_or(0, DomainMatcher::len)
            + self.geosite_codes.len()
            + self.geoip.as_ref().map_or(0, |item| item.codes.len())
            + self.ip_cidrs.len()
            + self.rule_sets.len()
    }

    fn contains_destination_ip_cidr(&self) -> bool {
        !self.ip_cidrs.is_empty()
            || self.geoip.is_some()
            || self
                .rule_sets
                .iter()
                .any(|set| set.contains_destination_ip_cidr())
    }
}

impl Rule for DefaultRule {
    fn uuid(&self) -> &str {
        &self.uuid
    }

    fn disabled(&self) -> bool {
        self.disabled.load(Ordering::SeqCst)
    }

    fn change_status(&self) {
        let was_disabled = self.disabled.fetch_xor(true, Ordering::SeqCst);
        info!(uuid = %self.uuid, rule = %self, disabled = !was_disabled, "rule status changed");
    }

    fn rule_type(&self) -> &str {
        "default"
    }

    fn outbound(&self) -> &str {
        &self.outbound
    }

    fn update_geosite(&self, loader: &dyn GeositeLoader) -> Result<()> {
        if self.geosite_codes.is_empty() {
            return Ok(());
        }
        let mut compiled = Vec::with_capacity(self.geosite_codes.len());
        for code in &self.geosite_codes {
            compiled.push(loader.load_geosite(code)?);
        }
        self.geosite.store(Arc::new(compiled));
        Ok(())
    }

    fn skip_resolve(&self) -> bool {
        self.skip_resolve
    }
}

#[derive(Debug, Clone)]
struct DnsStrategy {
    servers: Vec<String>,
    client_subnet: Option<IpNet>,
    rewrite_ttl: Option<u32>,
}

/// 默认 DNS 规则
pub struct DefaultDnsRule {
    rule: DefaultRule,
    /// 0 号为首选策略，其后为后备策略
    strategies: Vec<DnsStrategy>,
    disable_cache: bool,
    address_limit: Vec<IpNet>,
}

impl DefaultDnsRule {
    pub fn new(config: &DnsRuleConfig, env: &RuleEnv<'_>) -> Result<Self> {
        if config.server.is_empty() {
            anyhow::bail!("dns rule requires at least one server");
        }
        let rule = DefaultRule::new(&config.matcher, &config.server[0], env)?;

        let mut strategies = vec![DnsStrategy {
            servers: config.server.clone(),
            client_subnet: config.client_subnet.as_deref().map(parse_prefix).transpose()?,
            rewrite_ttl: config.rewrite_ttl,
        }];
        for fallback in &config.fallback {
            if fallback.server.is_empty() {
                anyhow::bail!("dns fallback requires at least one server");
            }
            strategies.push(DnsStrategy {
                servers: fallback.server.clone(),
                client_subnet: fallback.client_subnet.as_deref().map(parse_prefix).transpose()?,
                rewrite_ttl: fallback.rewrite_ttl,
            });
        }

        let address_limit = config
            .address_limit
            .iter()
            .map(|s| parse_prefix(s))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            rule,
            strategies,
            disable_cache: config.disable_cache,
            address_limit,
        })
    }

    pub fn inner(&self) -> &DefaultRule {
        &self.rule
    }
}

impl fmt::Display for DefaultDnsRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} => [{}]", self.rule, self.strategies[0].servers.join(" "))
    }
}

impl HeadlessRule for DefaultDnsRule {
    fn matches(&self, ctx: &InboundContext) -> bool {
        self.rule.matches(ctx)
    }

    fn rule_count(&self) -> usize {
        self.rule.rule_count()
    }

    fn contains_destination_ip_cidr(&self) -> bool {
        self.rule.contains_destination_ip_cidr()
    }
}

impl Rule for DefaultDnsRule {
    fn uuid(&self) -> &str {
        self.rule.uuid()
    }

    fn disabled(&self) -> bool {
        self.rule.disabled()
    }

    fn change_status(&self) {
        self.rule.change_status()
    }

    fn rule_type(&self) -> &str {
        self.rule.rule_type()
    }

    fn outbound(&self) -> &str {
        self.rule.outbound()
    }

    fn update_geosite(&self, loader: &dyn GeositeLoader) -> Result<()> {
        self.rule.update_geosite(loader)
    }

    fn skip_resolve(&self) -> bool {
        self.rule.skip_resolve()
    }
}

impl DnsRule for DefaultDnsRule {
    fn match_fallback(&self, ctx: &InboundContext, index: usize) -> Option<FallbackMatch> {
        let strategy = self.strategies.get(index)?;
        if !self.rule.matches(ctx) {
            return None;
        }
        Some(FallbackMatch {
            servers: strategy.servers.clone(),
            client_subnet: strategy.client_subnet,
            rewrite_ttl: strategy.rewrite_ttl,
            index,
        })
    }

    fn disable_cache(&self) -> bool {
        self.disable_cache
    }

    fn rewrite_ttl(&self) -> Option<u32> {
        self.strategies[0].rewrite_ttl
    }

    fn client_subnet(&self) -> Option<IpNet> {
        self.strategies[0].client_subnet
    }

    fn with_address_limit(&self) -> bool {
        !self.address_limit.is_empty()
    }

    fn match_address_limit(&self, ctx: &InboundContext) -> bool {
        if self.address_limit.is_empty() {
            return true;
        }
        ctx.destination_addresses
            .iter()
            .any(|ip| self.address_limit.iter().any(|net| net.contains(ip)))
    }

    fn servers(&self) -> &[String] {
        &self.strategies[0].servers
    }
}

/// 解析 CIDR，裸 IP 视为单地址前缀
pub(crate) fn parse_prefix(value: &str) -> Result<IpNet> {
    if let Ok(net) = value.parse::<IpNet>() {
        return Ok(net);
    }
    value
        .parse::<IpAddr>()
        .map(IpNet::from)
        .map_err(|e| anyhow::anyhow!("invalid CIDR '{}': {}", value, e))
}

fn is_public_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            !(v4.is_private()
                || v4.is_loopback()
                || v4.is_link_local()
                || v4.is_unspecified()
                || v4.is_broadcast()
                || v4.octets()[0] == 100 && (v4.octets()[1] & 0xC0) == 64)
        }
        IpAddr::V6(v6) => {
            let first = v6.segments()[0];
            !(v6.is_loopback()
                || v6.is_unspecified()
                || (first & 0xFE00) == 0xFC00
                || (first & 0xFFC0) == 0xFE80)
        }
    }
}
