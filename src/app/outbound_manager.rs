use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use tracing::info;

use crate::config::types::OutboundConfig;
use crate::proxy::outbound::direct::DirectOutbound;
use crate::proxy::outbound::reject::RejectOutbound;
use crate::proxy::{OutboundHandler, OutboundResolver};

pub struct OutboundManager {
    handlers: HashMap<String, Arc<dyn OutboundHandler>>,
    /// 第一个配置的出站作为默认出站
    default_tag: Option<String>,
}

impl OutboundManager {
    pub fn new(configs: &[OutboundConfig]) -> Result<Self> {
        let mut handlers: HashMap<String, Arc<dyn OutboundHandler>> = HashMap::new();

        for config in configs {
            let handler: Arc<dyn OutboundHandler> = match config.protocol.as_str() {
                "direct" => Arc::new(DirectOutbound::new(config.tag.clone())),
                "block" | "reject" => Arc::new(RejectOutbound::new(config.tag.clone())),
                other => anyhow::bail!("unsupported outbound protocol: {}", other),
            };
            info!(tag = %config.tag, protocol = %config.protocol, "outbound registered");
            handlers.insert(config.tag.clone(), handler);
        }

        Ok(Self {
            handlers,
            default_tag: configs.first().map(|c| c.tag.clone()),
        })
    }

    /// 直接由处理器构建（测试和嵌入场景）
    pub fn from_handlers(handlers: Vec<Arc<dyn OutboundHandler>>) -> Self {
        let default_tag = handlers.first().map(|h| h.tag().to_string());
        let handlers = handlers
            .into_iter()
            .map(|h| (h.tag().to_string(), h))
            .collect();
        Self {
            handlers,
            default_tag,
        }
    }

    pub fn get(&self, tag: &str) -> Option<Arc<dyn OutboundHandler>> {
        self.handlers.get(tag).cloned()
    }

    pub fn list(&self) -> &HashMap<String, Arc<dyn OutboundHandler>> {
        &self.handlers
    }
}

impl OutboundResolver for OutboundManager {
    fn outbound(&self, tag: &str) -> Option<Arc<dyn OutboundHandler>> {
        self.get(tag)
    }

    fn default_outbound(&self) -> Option<Arc<dyn OutboundHandler>> {
        self.default_tag.as_deref().and_then(|tag| self.get(tag))
    }
}
