/// 二进制规则集（SRS）解析
///
/// 格式:
///   3B magic ("SRS") + 1B version + zlib_compressed_body
///
/// 压缩体:
///   uvarint(rule_count) + rules...
///
/// 每条规则:
///   u8(rule_type) + items... + 0xFF(final) + bool(invert)
use std::io::{self, Read};
use std::net::{Ipv4Addr, Ipv6Addr};

use anyhow::{bail, Result};
use flate2::read::ZlibDecoder;
use ipnet::{IpNet, Ipv4Subnets, Ipv6Subnets};

use super::codec::{read_string_list, read_u8, read_uvarint};
use super::provider::RuleSetData;

const SRS_MAGIC: [u8; 3] = *b"SRS";
const MAX_VERSION: u8 = 3;

const RULE_ITEM_QUERY_TYPE: u8 = 0;
const RULE_ITEM_DOMAIN: u8 = 2;
const RULE_ITEM_DOMAIN_KEYWORD: u8 = 3;
const RULE_ITEM_DOMAIN_REGEX: u8 = 4;
const RULE_ITEM_SOURCE_IP_CIDR: u8 = 5;
const RULE_ITEM_IP_CIDR: u8 = 6;
const RULE_ITEM_SOURCE_PORT: u8 = 7;
const RULE_ITEM_PORT: u8 = 9;
const RULE_ITEM_PROCESS_NAME: u8 = 11;
const RULE_ITEM_WIFI_SSID: u8 = 14;
const RULE_ITEM_NETWORK_TYPE: u8 = 18;
const RULE_ITEM_NETWORK_IS_EXPENSIVE: u8 = 19;
const RULE_ITEM_NETWORK_IS_CONSTRAINED: u8 = 20;
const RULE_ITEM_FINAL: u8 = 0xFF;

const LOGICAL_AND: u8 = 0;
const LOGICAL_OR: u8 = 1;

/// 解析 SRS 文件内容
pub fn parse_srs(data: &[u8]) -> Result<RuleSetData> {
    if data.len() < 4 {
        bail!("SRS file too short");
    }
    if !is_srs_format(data) {
        bail!(
            "invalid SRS magic: {:02x} {:02x} {:02x}",
            data[0],
            data[1],
            data[2]
        );
    }
    let version = data[3];
    if version > MAX_VERSION {
        bail!("unsupported SRS version: {}", version);
    }

    let mut decompressed = Vec::new();
    ZlibDecoder::new(&data[4..]).read_to_end(&mut decompressed)?;

    let mut cursor = io::Cursor::new(decompressed.as_slice());
    let rule_count = read_uvarint(&mut cursor)?;
    let mut out = RuleSetData::default();
    for _ in 0..rule_count {
        read_rule(&mut cursor, &mut out)?;
    }
    Ok(out)
}

pub fn is_srs_format(data: &[u8]) -> bool {
    data.len() >= 4 && data[0..3] == SRS_MAGIC
}

/// 规则集按所有条目的并集匹配，无法等价表示的规则直接报错
fn read_rule(cursor: &mut io::Cursor<&[u8]>, out: &mut RuleSetData) -> Result<()> {
    match read_u8(cursor)? {
        0 => read_default_rule(cursor, out),
        1 => {
            // logical: mode + uvarint(count) + rules + invert
            let mode = read_u8(cursor)?;
            let count = read_uvarint(cursor)?;
            match mode {
                LOGICAL_OR => {}
                LOGICAL_AND if count <= 1 => {}
                LOGICAL_AND => bail!("unsupported SRS logical AND rule with {} children", count),
                other => bail!("unknown SRS logical mode: {}", other),
            }
            for _ in 0..count {
                read_rule(cursor, out)?;
            }
            read_invert(cursor)
        }
        other => bail!("unknown SRS rule type: {}", other),
    }
}

fn read_invert(cursor: &mut io::Cursor<&[u8]>) -> Result<()> {
    match read_u8(cursor)? {
        0 => Ok(()),
        _ => bail!("unsupported SRS inverted rule"),
    }
}

fn read_default_rule(cursor: &mut io::Cursor<&[u8]>, out: &mut RuleSetData) -> Result<()> {
    loop {
        let item_type = read_u8(cursor)?;
        match item_type {
            RULE_ITEM_FINAL => return read_invert(cursor),
            RULE_ITEM_DOMAIN => {
                // 完全匹配列表 + 后缀列表
                for domain in read_string_list(cursor)? {
                    out.domain.add_full(&domain);
                }
                for suffix in read_string_list(cursor)? {
                    out.domain.add_suffix(&suffix);
                }
            }
            RULE_ITEM_DOMAIN_KEYWORD => {
                for keyword in read_string_list(cursor)? {
                    out.domain.add_keyword(&keyword);
                }
            }
            RULE_ITEM_DOMAIN_REGEX => {
                for pattern in read_string_list(cursor)? {
                    out.domain.add_regex(&pattern)?;
                }
            }
            RULE_ITEM_SOURCE_IP_CIDR => out.source_ip_cidrs.extend(read_ip_set(cursor)?),
            RULE_ITEM_IP_CIDR => out.ip_cidrs.extend(read_ip_set(cursor)?),
            RULE_ITEM_PROCESS_NAME => out.process_names.extend(read_string_list(cursor)?),
            RULE_ITEM_WIFI_SSID => out.wifi_ssids.extend(read_string_list(cursor)?),
            other => skip_item(cursor, other)?,
        }
    }
}

/// IP 集合: uvarint(range_count) + (is_ipv6, from, to)...
fn read_ip_set(cursor: &mut io::Cursor<&[u8]>) -> Result<Vec<IpNet>> {
    let count = read_uvarint(cursor)?;
    let mut cidrs = Vec::new();
    for _ in 0..count {
        if read_u8(cursor)? != 0 {
            let mut from = [0u8; 16];
            let mut to = [0u8; 16];
            cursor.read_exact(&mut from)?;
            cursor.read_exact(&mut to)?;
            cidrs.extend(range_to_cidrs_v6(Ipv6Addr::from(from), Ipv6Addr::from(to)));
        } else {
            let mut from = [0u8; 4];
            let mut to = [0u8; 4];
            cursor.read_exact(&mut from)?;
            cursor.read_exact(&mut to)?;
            cidrs.extend(range_to_cidrs_v4(Ipv4Addr::from(from), Ipv4Addr::from(to)));
        }
    }
    Ok(cidrs)
}

/// 地址区间拆成最少的前缀集合
fn range_to_cidrs_v4(from: Ipv4Addr, to: Ipv4Addr) -> Vec<IpNet> {
    Ipv4Subnets::new(from, to, 0).map(IpNet::V4).collect()
}

fn range_to_cidrs_v6(from: Ipv6Addr, to: Ipv6Addr) -> Vec<IpNet> {
    Ipv6Subnets::new(from, to, 0).map(IpNet::V6).collect()
}

fn skip_item(cursor: &mut io::Cursor<&[u8]>, item_type: u8) -> Result<()> {
    match item_type {
        // u16 列表
        RULE_ITEM_QUERY_TYPE | RULE_ITEM_SOURCE_PORT | RULE_ITEM_PORT => {
            let count = read_uvarint(cursor)?;
            skip_bytes(cursor, count.saturating_mul(2))
        }
        RULE_ITEM_NETWORK_TYPE => {
            let count = read_uvarint(cursor)?;
            skip_bytes(cursor, count)
        }
        RULE_ITEM_NETWORK_IS_EXPENSIVE | RULE_ITEM_NETWORK_IS_CONSTRAINED => Ok(()),
        _ => read_string_list(cursor).map(|_| ()),
    }
}

fn skip_bytes(cursor: &mut io::Cursor<&[u8]>, len: u64) -> Result<()> {
    let remaining = (cursor.get_ref().len() as u64).saturating_sub(cursor.position());
    if len > remaining {
        bail!("item length {} exceeds remaining {} bytes", len, remaining);
    }
    cursor.set_position(cursor.position() + len);
    Ok(())
}
