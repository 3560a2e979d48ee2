pub mod outbound;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;

use crate::common::{Address, ProxyStream};

/// 网络类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Network {
    Tcp,
    Udp,
}

impl Network {
    pub fn as_str(self) -> &'static str {
        match self {
            Network::Tcp => "tcp",
            Network::Udp => "udp",
        }
    }
}

/// 连接会话元数据
#[derive(Debug, Clone)]
pub struct Session {
    pub target: Address,
    pub source: Option<SocketAddr>,
    pub inbound_tag: String,
    pub network: Network,
}

impl Session {
    /// 路由器自身发起的连接（如数据库下载）
    pub fn internal(target: Address, tag: &str) -> Self {
        Self {
            target,
            source: None,
            inbound_tag: tag.to_string(),
            network: Network::Tcp,
        }
    }
}

/// 出站处理器 trait
#[async_trait]
pub trait OutboundHandler: Send + Sync + 'static {
    fn tag(&self) -> &str;
    async fn connect(&self, session: &Session) -> Result<ProxyStream>;
}

/// 按 tag 查找出站，用于路由下载等维护流量
pub trait OutboundResolver: Send + Sync {
    fn outbound(&self, tag: &str) -> Option<Arc<dyn OutboundHandler>>;
    fn default_outbound(&self) -> Option<Arc<dyn OutboundHandler>>;
}
