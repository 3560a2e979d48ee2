//! GeoSite 分类编译缓存
//!
//! 同一分类代码在同一数据库版本内只编译一次，所有引用共享同一个实例。
//! 数据库替换时整体失效，并立即让已注册的规则重新编译。

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use anyhow::Result;
use parking_lot::RwLock;
use tracing::{debug, error};

use super::geosite::{self, GeositeReader};
use super::rules::{DefaultRule, DnsRule, GeositeLoader, Rule};
use super::store::{GeoStore, LoadedDatabase, SwapListener};

struct CacheState {
    generation: u64,
    entries: HashMap<String, Arc<dyn Rule>>,
}

/// 代码 -> 编译后规则
pub struct CompiledRuleCache {
    state: RwLock<CacheState>,
}

impl Default for CompiledRuleCache {
    fn default() -> Self {
        Self::new()
    }
}

impl CompiledRuleCache {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(CacheState {
                generation: 0,
                entries: HashMap::new(),
            }),
        }
    }

    /// 命中直接返回；未命中时用 `compile` 编译并插入
    ///
    /// `generation` 是编译所用读取器的版本。版本已过期时结果不写入缓存，
    /// 避免旧数据污染新一代缓存。
    pub fn lookup<F>(&self, code: &str, generation: u64, compile: F) -> Result<Arc<dyn Rule>>
    where
        F: FnOnce() -> Result<Arc<dyn Rule>>,
    {
        {
            let state = self.state.read();
            if state.generation == generation {
                if let Some(rule) = state.entries.get(code) {
                    return Ok(rule.clone());
                }
            }
        }

        let rule = compile()?;

        let mut state = self.state.write();
        if state.generation != generation {
            debug!(code, generation, current = state.generation, "compiled against stale database, not cached");
            return Ok(rule);
        }
        // 并发编译时以先插入者为准
        Ok(state.entries.entry(code.to_string()).or_insert(rule).clone())
    }

    /// 切换到新版本并清空，返回旧条目供调用方在合适时机释放
    pub fn reset(&self, generation: u64) -> HashMap<String, Arc<dyn Rule>> {
        let mut state = self.state.write();
        state.generation = generation;
        std::mem::take(&mut state.entries)
    }

    pub fn generation(&self) -> u64 {
        self.state.read().generation
    }

    pub fn len(&self) -> usize {
        self.state.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, code: &str) -> bool {
        self.state.read().entries.contains_key(code)
    }
}

/// GeoSite 数据库上的分类加载器，负责缓存与规则刷新
pub struct GeositeCatalog {
    store: Arc<GeoStore<GeositeReader>>,
    cache: CompiledRuleCache,
    rules: RwLock<Vec<Arc<dyn Rule>>>,
    dns_rules: RwLock<Vec<Arc<dyn DnsRule>>>,
}

impl GeositeCatalog {
    /// 创建并注册为 store 的替换监听者
    pub fn new(store: Arc<GeoStore<GeositeReader>>) -> Arc<Self> {
        let catalog = Arc::new(Self {
            store: store.clone(),
            cache: CompiledRuleCache::new(),
            rules: RwLock::new(Vec::new()),
            dns_rules: RwLock::new(Vec::new()),
        });
        let weak = Arc::downgrade(&catalog);
        let listener: Weak<dyn SwapListener<GeositeReader>> = weak;
        store.set_listener(listener);
        catalog
    }

    /// 登记引用 geosite 的规则，数据库替换时统一刷新
    pub fn register(&self, rules: Vec<Arc<dyn Rule>>, dns_rules: Vec<Arc<dyn DnsRule>>) {
        *self.rules.write() = rules;
        *self.dns_rules.write() = dns_rules;
    }

    pub fn store(&self) -> &Arc<GeoStore<GeositeReader>> {
        &self.store
    }

    pub fn cache(&self) -> &CompiledRuleCache {
        &self.cache
    }

    /// 加载分类代码对应的规则
    pub fn load(&self, code: &str) -> Result<Arc<dyn Rule>> {
        let current = self
            .store
            .current()
            .ok_or_else(|| anyhow::anyhow!("geosite database not loaded"))?;
        self.load_from(&current, code)
    }

    fn load_from(&self, db: &LoadedDatabase<GeositeReader>, code: &str) -> Result<Arc<dyn Rule>> {
        let code = code.to_lowercase();
        self.cache.lookup(&code, db.generation, || {
            let items = db.reader.read(&code)?;
            let matcher = geosite::compile(&items)?;
            let rule: Arc<dyn Rule> = Arc::new(DefaultRule::from_domain_matcher(
                format!("geosite:{}", code),
                matcher,
            ));
            Ok(rule)
        })
    }

    fn refresh_rules(&self, db: &LoadedDatabase<GeositeReader>) {
        let loader = PinnedLoader { catalog: self, db };
        for rule in self.rules.read().iter() {
            if let Err(e) = rule.update_geosite(&loader) {
                error!(rule = %rule, error = %e, "failed to reload geosite rules");
            }
        }
        for rule in self.dns_rules.read().iter() {
            if let Err(e) = rule.update_geosite(&loader) {
                error!(rule = %rule, error = %e, "failed to reload geosite rules");
            }
        }
    }
}

impl GeositeLoader for GeositeCatalog {
    fn load_geosite(&self, code: &str) -> Result<Arc<dyn Rule>> {
        self.load(code)
    }
}

impl SwapListener<GeositeReader> for GeositeCatalog {
    fn on_swap(&self, current: &Arc<LoadedDatabase<GeositeReader>>) {
        let stale = self.cache.reset(current.generation);
        self.refresh_rules(current);
        debug!(
            generation = current.generation,
            dropped = stale.len(),
            compiled = self.cache.len(),
            "geosite cache rebuilt"
        );
        drop(stale);
    }
}

/// 固定到某一读取器的加载器，保证一轮刷新内使用同一份数据
struct PinnedLoader<'a> {
    catalog: &'a GeositeCatalog,
    db: &'a LoadedDatabase<GeositeReader>,
}

impl GeositeLoader for PinnedLoader<'_> {
    fn load_geosite(&self, code: &str) -> Result<Arc<dyn Rule>> {
        self.catalog.load_from(self.db, code)
    }
}
