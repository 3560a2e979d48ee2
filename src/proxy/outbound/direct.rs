use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tokio::net::TcpStream;
use tracing::debug;

use crate::common::ProxyStream;
use crate::proxy::{OutboundHandler, Session};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

pub struct DirectOutbound {
    tag: String,
    connect_timeout: Duration,
}

impl DirectOutbound {
    pub fn new(tag: String) -> Self {
        Self {
            tag,
            connect_timeout: CONNECT_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }
}

#[async_trait]
impl OutboundHandler for DirectOutbound {
    fn tag(&self) -> &str {
        &self.tag
    }

    async fn connect(&self, session: &Session) -> Result<ProxyStream> {
        let addr = session.target.resolve().await?;

        debug!(target = %session.target, resolved = %addr, "direct connect");
        let stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| {
                anyhow::anyhow!("connect timeout after {:?} to {}", self.connect_timeout, addr)
            })??;
        stream.set_nodelay(true)?;
        Ok(Box::new(stream))
    }
}
