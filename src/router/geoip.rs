use std::net::IpAddr;
use std::path::Path;

use anyhow::Result;

use super::rules::RegionLookup;
use super::store::{GeoDatabase, GeoStore};
use crate::common::DatabaseKind;

/// sing-geoip 格式的数据库类型标识，记录直接是地区代码字符串
const SING_GEOIP_TYPE: &str = "sing-geoip";

/// GeoIP 数据库（MaxMind mmdb 格式）
#[derive(Debug)]
pub struct GeoIpReader {
    reader: maxminddb::Reader<Vec<u8>>,
    string_records: bool,
}

impl GeoIpReader {
    /// 从 mmdb 文件加载，返回读取器和数据库声明的地区代码
    pub fn open(path: &Path) -> Result<(Self, Vec<String>)> {
        let reader = maxminddb::Reader::open_readfile(path).map_err(|e| {
            anyhow::anyhow!("failed to load GeoIP database '{}': {}", path.display(), e)
        })?;
        Ok(Self::from_reader(reader))
    }

    pub fn from_bytes(data: Vec<u8>) -> Result<(Self, Vec<String>)> {
        let reader = maxminddb::Reader::from_source(data)
            .map_err(|e| anyhow::anyhow!("failed to parse GeoIP database: {}", e))?;
        Ok(Self::from_reader(reader))
    }

    fn from_reader(reader: maxminddb::Reader<Vec<u8>>) -> (Self, Vec<String>) {
        let string_records = reader.metadata.database_type == SING_GEOIP_TYPE;
        let codes = reader.metadata.languages.clone();
        (
            Self {
                reader,
                string_records,
            },
            codes,
        )
    }

    pub fn database_type(&self) -> &str {
        &self.reader.metadata.database_type
    }

    /// 查询 IP 对应的地区代码（小写，如 "cn"）
    pub fn lookup(&self, ip: IpAddr) -> Option<String> {
        if self.string_records {
            let code: String = self.reader.lookup(ip).ok()?;
            return Some(code);
        }

        #[derive(serde::Deserialize)]
        struct Country {
            country: Option<CountryInfo>,
        }
        #[derive(serde::Deserialize)]
        struct CountryInfo {
            iso_code: Option<String>,
        }

        let result: Country = self.reader.lookup(ip).ok()?;
        result.country?.iso_code.map(|code| code.to_lowercase())
    }
}

impl GeoDatabase for GeoIpReader {
    const KIND: DatabaseKind = DatabaseKind::GeoIp;

    fn open(path: &Path) -> Result<(Self, Vec<String>)> {
        GeoIpReader::open(path)
    }
}

/// 规则总是查询当前读取器；数据库未加载时不匹配
impl RegionLookup for GeoStore<GeoIpReader> {
    fn lookup_region(&self, ip: IpAddr) -> Option<String> {
        self.current()?.reader.lookup(ip)
    }
}
