//! 集成测试共用：数据库构造与模拟下载器
#![allow(dead_code)]

use std::collections::{BTreeMap, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use georoute::common::GeoError;
use georoute::config::PathResolver;
use georoute::router::fetch::Fetcher;
use georoute::router::geosite::{self, Item, ItemType};

/// 最小的 sing-geoip 数据库：0.0.0.0/1 -> `code`，其余地址无记录
pub fn geoip_db(code: &str) -> Vec<u8> {
    assert!(code.len() < 29);
    let mut buf = Vec::new();
    // 搜索树：1 个节点，24 位记录；左记录指向数据区偏移 0，右记录为空
    buf.extend_from_slice(&[0x00, 0x00, 0x11, 0x00, 0x00, 0x01]);
    buf.extend_from_slice(&[0u8; 16]);
    push_string(&mut buf, code);

    buf.extend_from_slice(b"\xAB\xCD\xEFMaxMind.com");
    buf.push(0xE9);
    push_string(&mut buf, "binary_format_major_version");
    buf.extend_from_slice(&[0xA1, 0x02]);
    push_string(&mut buf, "binary_format_minor_version");
    buf.push(0xA0);
    push_string(&mut buf, "build_epoch");
    buf.extend_from_slice(&[0x00, 0x02]);
    push_string(&mut buf, "database_type");
    push_string(&mut buf, "sing-geoip");
    push_string(&mut buf, "description");
    buf.push(0xE0);
    push_string(&mut buf, "ip_version");
    buf.extend_from_slice(&[0xA1, 0x04]);
    push_string(&mut buf, "languages");
    buf.extend_from_slice(&[0x01, 0x04]);
    push_string(&mut buf, code);
    push_string(&mut buf, "node_count");
    buf.extend_from_slice(&[0xC1, 0x01]);
    push_string(&mut buf, "record_size");
    buf.extend_from_slice(&[0xA1, 0x18]);
    buf
}

fn push_string(buf: &mut Vec<u8>, value: &str) {
    assert!(value.len() < 29);
    buf.push(0x40 | value.len() as u8);
    buf.extend_from_slice(value.as_bytes());
}

/// 由 (代码, 后缀列表) 构造 geosite 数据库
pub fn geosite_db(categories: &[(&str, &[&str])]) -> Vec<u8> {
    let map: BTreeMap<String, Vec<Item>> = categories
        .iter()
        .map(|(code, suffixes)| {
            let items = suffixes
                .iter()
                .map(|s| Item::new(ItemType::DomainSuffix, *s))
                .collect();
            (code.to_string(), items)
        })
        .collect();
    let mut buf = Vec::new();
    geosite::write(&mut buf, &map).unwrap();
    buf
}

/// 不在搜索目录中查找的路径解析器
pub fn resolver(dir: &Path) -> PathResolver {
    PathResolver::new(dir).with_search_paths(Vec::new())
}

pub enum Reply {
    Bytes(Vec<u8>),
    Fail,
    /// 下载出站不存在
    NoDetour,
}

/// 按顺序返回预设结果的下载器
#[derive(Default)]
pub struct ScriptedFetcher {
    replies: Mutex<VecDeque<Reply>>,
    calls: AtomicUsize,
    urls: Mutex<Vec<String>>,
    delay: Option<Duration>,
}

impl ScriptedFetcher {
    pub fn new(replies: Vec<Reply>) -> Arc<Self> {
        Arc::new(Self {
            replies: Mutex::new(replies.into()),
            ..Default::default()
        })
    }

    pub fn slow(replies: Vec<Reply>, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            replies: Mutex::new(replies.into()),
            delay: Some(delay),
            ..Default::default()
        })
    }

    pub fn push(&self, reply: Reply) {
        self.replies.lock().push_back(reply);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn urls(&self) -> Vec<String> {
        self.urls.lock().clone()
    }
}

#[async_trait]
impl Fetcher for ScriptedFetcher {
    async fn fetch(
        &self,
        url: &str,
        save_path: &Path,
        _detour: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<(), GeoError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.urls.lock().push(url.to_string());
        if let Some(delay) = self.delay {
            tokio::select! {
                _ = cancel.cancelled() => return Err(GeoError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
        }
        let reply = self.replies.lock().pop_front();
        match reply {
            Some(Reply::Bytes(data)) => {
                if let Some(parent) = save_path.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                std::fs::write(save_path, data)?;
                Ok(())
            }
            Some(Reply::NoDetour) => Err(GeoError::DetourNotFound("missing".to_string())),
            Some(Reply::Fail) | None => {
                // 留下部分文件，验证调用方会清理
                let _ = std::fs::write(save_path, b"partial");
                Err(GeoError::download(url, anyhow::anyhow!("scripted failure")))
            }
        }
    }
}
