//! 数据库与规则集下载
//!
//! 下载流量经由指定的出站（detour）拨号，与用户流量遵循同样的代理规则。
//! 每次下载使用独立连接，结束后连接任务随守卫一起终止。

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use async_trait::async_trait;
use bytes::Bytes;
use http::{header, Method, Request, Response, Uri};
use http_body_util::{BodyExt, Empty};
use hyper::body::Incoming;
use hyper_util::rt::TokioIo;
use rustls::pki_types::ServerName;
use tokio::io::AsyncWriteExt;
use tokio::task::JoinHandle;
use tokio_rustls::TlsConnector;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::common::tls::build_tls_config;
use crate::common::{Address, GeoError, ProxyStream};
use crate::proxy::{OutboundHandler, OutboundResolver, Session};

/// 最多跟随的重定向次数（release 资源会跳转到 CDN）
const MAX_REDIRECTS: usize = 5;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const TLS_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);
const USER_AGENT: &str = concat!("georoute/", env!("CARGO_PKG_VERSION"));

/// 远程文件下载器
#[async_trait]
pub trait Fetcher: Send + Sync {
    /// 下载 `url` 到 `save_path`
    ///
    /// `detour` 为空时使用默认出站。失败或取消时删除已写入的部分文件。
    async fn fetch(
        &self,
        url: &str,
        save_path: &Path,
        detour: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<(), GeoError>;
}

/// 基于 hyper 的 HTTP(S) 下载器，连接通过出站建立
pub struct HttpFetcher {
    outbounds: Arc<dyn OutboundResolver>,
    tls: Arc<rustls::ClientConfig>,
}

/// 连接驱动任务守卫，drop 时终止任务并释放连接
struct ConnectionGuard(JoinHandle<()>);

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.0.abort();
    }
}

impl HttpFetcher {
    pub fn new(outbounds: Arc<dyn OutboundResolver>) -> Result<Self, GeoError> {
        let tls = build_tls_config(Some(&["http/1.1"][..]))?;
        Ok(Self::with_tls_config(outbounds, Arc::new(tls)))
    }

    pub fn with_tls_config(
        outbounds: Arc<dyn OutboundResolver>,
        tls: Arc<rustls::ClientConfig>,
    ) -> Self {
        Self { outbounds, tls }
    }

    fn select_outbound(&self, detour: Option<&str>) -> Result<Arc<dyn OutboundHandler>, GeoError> {
        match detour.filter(|tag| !tag.is_empty()) {
            Some(tag) => self
                .outbounds
                .outbound(tag)
                .ok_or_else(|| GeoError::DetourNotFound(tag.to_string())),
            None => self
                .outbounds
                .default_outbound()
                .ok_or_else(|| GeoError::DetourNotFound("<default>".to_string())),
        }
    }

    async fn download(
        &self,
        outbound: &dyn OutboundHandler,
        url: &str,
        save_path: &Path,
    ) -> Result<(), GeoError> {
        let mut uri: Uri = url.parse().map_err(|e| GeoError::download(url, e))?;

        for _ in 0..=MAX_REDIRECTS {
            let (response, guard) = self
                .get(outbound, &uri)
                .await
                .map_err(|e| GeoError::download(url, e))?;

            let status = response.status();
            if status.is_redirection() {
                let location = response
                    .headers()
                    .get(header::LOCATION)
                    .and_then(|v| v.to_str().ok())
                    .ok_or_else(|| {
                        GeoError::download(url, anyhow!("redirect {} without location", status))
                    })?;
                let next = resolve_location(&uri, location).map_err(|e| GeoError::download(url, e))?;
                debug!(from = %uri, to = %next, status = status.as_u16(), "following redirect");
                uri = next;
                continue;
            }
            if !status.is_success() {
                return Err(GeoError::download(url, anyhow!("unexpected status {}", status)));
            }

            let written = save_body(response, save_path, url).await?;
            drop(guard);
            debug!(url, bytes = written, path = %save_path.display(), "download finished");
            return Ok(());
        }

        Err(GeoError::download(
            url,
            anyhow!("too many redirects (max {})", MAX_REDIRECTS),
        ))
    }

    async fn get(
        &self,
        outbound: &dyn OutboundHandler,
        uri: &Uri,
    ) -> anyhow::Result<(Response<Incoming>, ConnectionGuard)> {
        let stream = self.connect(outbound, uri).await?;
        let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream)).await?;
        let guard = ConnectionGuard(tokio::spawn(async move {
            if let Err(e) = conn.await {
                debug!(error = %e, "fetch connection closed with error");
            }
        }));

        let authority = uri
            .authority()
            .map(|a| a.as_str())
            .ok_or_else(|| anyhow!("missing host in {}", uri))?;
        let path = uri.path_and_query().map(|p| p.as_str()).unwrap_or("/");
        let request = Request::builder()
            .method(Method::GET)
            .uri(path)
            .header(header::HOST, authority)
            .header(header::USER_AGENT, USER_AGENT)
            .header(header::ACCEPT, "*/*")
            .body(Empty::<Bytes>::new())?;

        let response = sender.send_request(request).await?;
        Ok((response, guard))
    }

    async fn connect(&self, outbound: &dyn OutboundHandler, uri: &Uri) -> anyhow::Result<ProxyStream> {
        let https = match uri.scheme_str() {
            Some("https") => true,
            Some("http") => false,
            other => anyhow::bail!("unsupported url scheme: {:?}", other),
        };
        let host = uri.host().ok_or_else(|| anyhow!("missing host in {}", uri))?;
        let port = uri.port_u16().unwrap_or(if https { 443 } else { 80 });

        let session = Session::internal(Address::from_host_port(host, port), "geo-fetch");
        let stream = tokio::time::timeout(CONNECT_TIMEOUT, outbound.connect(&session))
            .await
            .map_err(|_| anyhow!("connect timeout after {:?} via '{}'", CONNECT_TIMEOUT, outbound.tag()))??;
        if !https {
            return Ok(stream);
        }

        let sni = host.trim_start_matches('[').trim_end_matches(']').to_string();
        let server_name =
            ServerName::try_from(sni).map_err(|e| anyhow!("invalid server name '{}': {}", host, e))?;
        let connector = TlsConnector::from(self.tls.clone());
        let tls_stream = tokio::time::timeout(TLS_HANDSHAKE_TIMEOUT, connector.connect(server_name, stream))
            .await
            .map_err(|_| anyhow!("TLS handshake timeout with {}", host))??;
        Ok(Box::new(tls_stream))
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(
        &self,
        url: &str,
        save_path: &Path,
        detour: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<(), GeoError> {
        let outbound = self.select_outbound(detour)?;

        if let Some(parent) = save_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }

        info!(url, detour = outbound.tag(), "downloading");
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(GeoError::Cancelled),
            result = self.download(outbound.as_ref(), url, save_path) => result,
        };

        if result.is_err() {
            let _ = tokio::fs::remove_file(save_path).await;
        }
        result
    }
}

async fn save_body(response: Response<Incoming>, save_path: &Path, url: &str) -> Result<u64, GeoError> {
    let mut file = tokio::fs::File::create(save_path).await.map_err(|e| {
        GeoError::download(url, anyhow!("open output file {}: {}", save_path.display(), e))
    })?;

    let mut body = response.into_body();
    let mut written = 0u64;
    while let Some(frame) = body.frame().await {
        let frame = frame.map_err(|e| GeoError::download(url, e))?;
        if let Ok(data) = frame.into_data() {
            file.write_all(&data).await?;
            written += data.len() as u64;
        }
    }
    file.flush().await?;
    Ok(written)
}

/// 解析重定向目标，支持绝对地址和以 `/` 开头的相对地址
fn resolve_location(base: &Uri, location: &str) -> anyhow::Result<Uri> {
    let parsed: Uri = location.parse()?;
    if parsed.scheme().is_some() {
        return Ok(parsed);
    }
    if !location.starts_with('/') {
        anyhow::bail!("unsupported relative redirect: {}", location);
    }
    let scheme = base.scheme_str().unwrap_or("http");
    let authority = base
        .authority()
        .ok_or_else(|| anyhow!("missing host in {}", base))?;
    Ok(format!("{}://{}{}", scheme, authority, location).parse()?)
}
