//! georoute: 代理路由核心
//!
//! 地理数据库（GeoIP / GeoSite）的加载、经由出站的下载与热替换，
//! 以及建立在其上的路由规则、DNS 规则和规则集。

pub mod app;
pub mod common;
pub mod config;
pub mod proxy;
pub mod router;
