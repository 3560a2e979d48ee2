use std::sync::Arc;

use anyhow::Result;
use rustls::crypto::ring as ring_provider;
use rustls::pki_types::CertificateDer;
use rustls::ClientConfig;

/// 构建下载用的 TLS ClientConfig（webpki 根证书）
///
/// - `alpn`: 可选的 ALPN 协议列表（如 `["http/1.1"]`）
pub fn build_tls_config(alpn: Option<&[&str]>) -> Result<ClientConfig> {
    build_tls_config_with_roots(Vec::new(), alpn)
}

/// 构建 TLS ClientConfig，接受额外的根证书（供测试和私有 CA 使用）
pub fn build_tls_config_with_roots(
    roots: Vec<CertificateDer<'static>>,
    alpn: Option<&[&str]>,
) -> Result<ClientConfig> {
    let mut root_store = rustls::RootCertStore::empty();
    root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    for cert in roots {
        root_store
            .add(cert)
            .map_err(|e| anyhow::anyhow!("add custom root cert failed: {}", e))?;
    }

    let provider = Arc::new(ring_provider::default_provider());
    let mut config = ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|e| anyhow::anyhow!("TLS config error: {}", e))?
        .with_root_certificates(root_store)
        .with_no_client_auth();

    if let Some(protocols) = alpn {
        config.alpn_protocols = protocols.iter().map(|p| p.as_bytes().to_vec()).collect();
    }

    Ok(config)
}
