use anyhow::Result;
use async_trait::async_trait;
use tracing::debug;

use crate::common::ProxyStream;
use crate::proxy::{OutboundHandler, Session};

pub struct RejectOutbound {
    tag: String,
}

impl RejectOutbound {
    pub fn new(tag: String) -> Self {
        Self { tag }
    }
}

#[async_trait]
impl OutboundHandler for RejectOutbound {
    fn tag(&self) -> &str {
        &self.tag
    }

    async fn connect(&self, session: &Session) -> Result<ProxyStream> {
        debug!(target = %session.target, "reject: connection blocked");
        anyhow::bail!("connection rejected by outbound '{}'", self.tag)
    }
}
