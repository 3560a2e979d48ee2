use std::collections::HashSet;
use std::time::Duration;

use anyhow::Result;
use serde::{Deserialize, Deserializer};

#[derive(Debug, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub log: LogConfig,
    /// 相对路径的基准目录，缺省为当前工作目录
    #[serde(default)]
    pub working_dir: Option<String>,
    #[serde(default = "default_outbounds")]
    pub outbounds: Vec<OutboundConfig>,
    #[serde(default)]
    pub route: RouteConfig,
    #[serde(default)]
    pub dns: DnsConfig,
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        if self.outbounds.is_empty() {
            anyhow::bail!("at least one outbound is required");
        }
        let mut outbound_tags = HashSet::new();
        for outbound in &self.outbounds {
            if !outbound_tags.insert(outbound.tag.as_str()) {
                anyhow::bail!("duplicate outbound tag '{}'", outbound.tag);
            }
        }
        if !outbound_tags.contains(self.route.final_outbound.as_str()) {
            anyhow::bail!(
                "route final '{}' does not match any outbound tag",
                self.route.final_outbound
            );
        }
        for rule in &self.route.rules {
            if !outbound_tags.contains(rule.outbound.as_str()) {
                anyhow::bail!(
                    "rule outbound '{}' does not match any outbound tag",
                    rule.outbound
                );
            }
        }

        let detours = [
            ("geoip", self.route.geoip.download_detour()),
            ("geosite", self.route.geosite.download_detour()),
        ];
        for (name, detour) in detours {
            if let Some(detour) = detour {
                if !outbound_tags.contains(detour) {
                    anyhow::bail!("{} download_detour '{}' not found", name, detour);
                }
            }
        }

        let mut rule_set_tags = HashSet::new();
        for rule_set in &self.route.rule_set {
            if !rule_set_tags.insert(rule_set.tag.as_str()) {
                anyhow::bail!("duplicate rule-set tag '{}'", rule_set.tag);
            }
            if let Some(detour) = rule_set.download_detour.as_deref() {
                if !outbound_tags.contains(detour) {
                    anyhow::bail!("rule-set '{}' download_detour '{}' not found", rule_set.tag, detour);
                }
            }
        }
        let referenced = self
            .route
            .rules
            .iter()
            .map(|r| &r.matcher)
            .chain(self.dns.rules.iter().map(|r| &r.matcher))
            .flat_map(|m| m.rule_set.iter());
        for tag in referenced {
            if !rule_set_tags.contains(tag.as_str()) {
                anyhow::bail!("rule references unknown rule-set '{}'", tag);
            }
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
pub struct LogConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct OutboundConfig {
    pub tag: String,
    /// direct | block
    pub protocol: String,
}

fn default_outbounds() -> Vec<OutboundConfig> {
    vec![OutboundConfig {
        tag: "direct".to_string(),
        protocol: "direct".to_string(),
    }]
}

#[derive(Debug, Deserialize)]
pub struct RouteConfig {
    #[serde(default)]
    pub rules: Vec<RuleConfig>,
    #[serde(rename = "final", default = "default_outbound")]
    pub final_outbound: String,
    #[serde(default)]
    pub geoip: GeoResourceConfig,
    #[serde(default)]
    pub geosite: GeoResourceConfig,
    #[serde(default)]
    pub rule_set: Vec<RuleSetConfig>,
}

impl Default for RouteConfig {
    fn default() -> Self {
        Self {
            rules: Vec::new(),
            final_outbound: default_outbound(),
            geoip: GeoResourceConfig::default(),
            geosite: GeoResourceConfig::default(),
            rule_set: Vec::new(),
        }
    }
}

fn default_outbound() -> String {
    "direct".to_string()
}

/// 单个地理数据库的加载与更新选项
#[derive(Debug, Clone, Deserialize)]
pub struct GeoResourceConfig {
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub download_url: Option<String>,
    #[serde(default)]
    pub download_detour: Option<String>,
    /// 0 表示关闭定时更新
    #[serde(default, deserialize_with = "deserialize_duration")]
    pub auto_update_interval: Duration,
    /// 监听文件变化并热重载
    #[serde(default = "default_true")]
    pub watch: bool,
}

impl Default for GeoResourceConfig {
    fn default() -> Self {
        Self {
            path: None,
            download_url: None,
            download_detour: None,
            auto_update_interval: Duration::ZERO,
            watch: true,
        }
    }
}

impl GeoResourceConfig {
    pub fn path(&self) -> Option<&str> {
        non_empty(&self.path)
    }

    pub fn download_url(&self) -> Option<&str> {
        non_empty(&self.download_url)
    }

    pub fn download_detour(&self) -> Option<&str> {
        non_empty(&self.download_detour)
    }
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|s| !s.is_empty())
}

fn default_true() -> bool {
    true
}

/// 规则匹配条件，路由规则与 DNS 规则共用
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RuleMatchConfig {
    pub inbound: Vec<String>,
    pub network: Vec<String>,
    pub domain: Vec<String>,
    pub domain_suffix: Vec<String>,
    pub domain_keyword: Vec<String>,
    pub domain_regex: Vec<String>,
    pub geosite: Vec<String>,
    pub geoip: Vec<String>,
    pub ip_cidr: Vec<String>,
    pub port: Vec<u16>,
    pub rule_set: Vec<String>,
    pub invert: bool,
    pub skip_resolve: bool,
    pub disabled: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RuleConfig {
    #[serde(flatten)]
    pub matcher: RuleMatchConfig,
    pub outbound: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct DnsConfig {
    #[serde(default)]
    pub rules: Vec<DnsRuleConfig>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DnsRuleConfig {
    #[serde(flatten)]
    pub matcher: RuleMatchConfig,
    /// 首选 DNS 服务器
    #[serde(default)]
    pub server: Vec<String>,
    /// 依次尝试的后备策略
    #[serde(default)]
    pub fallback: Vec<DnsFallbackConfig>,
    #[serde(default)]
    pub disable_cache: bool,
    #[serde(default)]
    pub rewrite_ttl: Option<u32>,
    #[serde(default)]
    pub client_subnet: Option<String>,
    /// 响应地址限制（CIDR 列表）
    #[serde(default)]
    pub address_limit: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DnsFallbackConfig {
    pub server: Vec<String>,
    #[serde(default)]
    pub client_subnet: Option<String>,
    #[serde(default)]
    pub rewrite_ttl: Option<u32>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RuleSetConfig {
    pub tag: String,
    /// local | remote
    #[serde(rename = "type")]
    pub kind: String,
    /// source | binary
    #[serde(default = "default_rule_set_format")]
    pub format: String,
    /// source 格式的解析方式: domain | ipcidr | classical
    #[serde(default = "default_behavior")]
    pub behavior: String,
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub download_detour: Option<String>,
    #[serde(default, deserialize_with = "deserialize_duration")]
    pub update_interval: Duration,
}

fn default_rule_set_format() -> String {
    "source".to_string()
}

fn default_behavior() -> String {
    "classical".to_string()
}

/// 接受整数秒或 humantime 字符串（如 "7d"、"12h 30m"）
fn deserialize_duration<'de, D>(deserializer: D) -> std::result::Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Secs(u64),
        Text(String),
    }

    match Raw::deserialize(deserializer)? {
        Raw::Secs(secs) => Ok(Duration::from_secs(secs)),
        Raw::Text(text) if text.trim().is_empty() => Ok(Duration::ZERO),
        Raw::Text(text) => humantime::parse_duration(text.trim()).map_err(serde::de::Error::custom),
    }
}
