//! GeoSite 分类数据库
//!
//! 二进制格式:
//!   u8(version=0) + uvarint(code_count)
//!   + code_count * [string(code) + uvarint(item_offset) + uvarint(item_count)]
//!   + items...
//!
//! 每个条目: u8(item_type) + string(value)
//! `item_offset` 相对于条目区起点。

use std::collections::{BTreeMap, HashMap};
use std::io::{self, Write};
use std::path::Path;

use anyhow::{bail, Result};

use super::codec::{read_string, read_u8, read_uvarint, write_string, write_uvarint};
use super::store::GeoDatabase;
use super::trie::DomainMatcher;
use crate::common::DatabaseKind;

const VERSION: u8 = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ItemType {
    Domain = 0,
    DomainSuffix = 1,
    DomainKeyword = 2,
    DomainRegex = 3,
}

impl ItemType {
    fn from_u8(value: u8) -> Result<Self> {
        Ok(match value {
            0 => ItemType::Domain,
            1 => ItemType::DomainSuffix,
            2 => ItemType::DomainKeyword,
            3 => ItemType::DomainRegex,
            other => bail!("unknown geosite item type: {}", other),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Item {
    pub kind: ItemType,
    pub value: String,
}

impl Item {
    pub fn new(kind: ItemType, value: impl Into<String>) -> Self {
        Self {
            kind,
            value: value.into(),
        }
    }
}

/// 已打开的 GeoSite 数据库，读取后不再修改
#[derive(Debug)]
pub struct GeositeReader {
    /// code -> (条目区偏移, 条目数)
    index: HashMap<String, (usize, usize)>,
    items: Vec<u8>,
}

impl GeositeReader {
    /// 从字节解析并校验索引，返回读取器和全部分类代码
    pub fn from_bytes(data: &[u8]) -> Result<(Self, Vec<String>)> {
        let mut cursor = io::Cursor::new(data);
        let version = read_u8(&mut cursor)?;
        if version != VERSION {
            bail!("unsupported geosite version: {}", version);
        }

        let count = read_uvarint(&mut cursor)?;
        let mut entries = Vec::new();
        for _ in 0..count {
            let code = read_string(&mut cursor)?.to_lowercase();
            let offset = read_uvarint(&mut cursor)? as usize;
            let item_count = read_uvarint(&mut cursor)? as usize;
            entries.push((code, offset, item_count));
        }

        let items = data[cursor.position() as usize..].to_vec();
        let mut index = HashMap::with_capacity(entries.len());
        let mut codes = Vec::with_capacity(entries.len());
        for (code, offset, item_count) in entries {
            if offset > items.len() || (item_count > 0 && offset == items.len()) {
                bail!(
                    "geosite code '{}' points outside item section ({} > {})",
                    code,
                    offset,
                    items.len()
                );
            }
            if index.insert(code.clone(), (offset, item_count)).is_some() {
                bail!("duplicate geosite code '{}'", code);
            }
            codes.push(code);
        }
        codes.sort();

        Ok((Self { index, items }, codes))
    }

    pub fn open(path: &Path) -> Result<(Self, Vec<String>)> {
        let data = std::fs::read(path)
            .map_err(|e| anyhow::anyhow!("failed to read geosite file '{}': {}", path.display(), e))?;
        Self::from_bytes(&data)
    }

    /// 读取某个分类的全部条目（分类名大小写不敏感）
    pub fn read(&self, code: &str) -> Result<Vec<Item>> {
        let code = code.to_lowercase();
        let Some(&(offset, count)) = self.index.get(&code) else {
            bail!("geosite code not found: {}", code);
        };

        let mut cursor = io::Cursor::new(&self.items[offset..]);
        let mut items = Vec::with_capacity(count);
        for _ in 0..count {
            let kind = ItemType::from_u8(read_u8(&mut cursor)?)?;
            let value = read_string(&mut cursor)?;
            items.push(Item { kind, value });
        }
        Ok(items)
    }

    pub fn contains(&self, code: &str) -> bool {
        self.index.contains_key(&code.to_lowercase())
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }
}

impl GeoDatabase for GeositeReader {
    const KIND: DatabaseKind = DatabaseKind::GeoSite;

    fn open(path: &Path) -> Result<(Self, Vec<String>)> {
        GeositeReader::open(path)
    }
}

/// 写出 GeoSite 数据库（生成工具与测试使用）
pub fn write<W: Write>(writer: &mut W, categories: &BTreeMap<String, Vec<Item>>) -> io::Result<()> {
    let mut items = Vec::new();
    let mut index = Vec::with_capacity(categories.len());
    for (code, entries) in categories {
        index.push((code.as_str(), items.len(), entries.len()));
        for item in entries {
            items.push(item.kind as u8);
            write_string(&mut items, &item.value)?;
        }
    }

    writer.write_all(&[VERSION])?;
    write_uvarint(writer, index.len() as u64)?;
    for (code, offset, count) in index {
        write_string(writer, code)?;
        write_uvarint(writer, offset as u64)?;
        write_uvarint(writer, count as u64)?;
    }
    writer.write_all(&items)
}

/// 将分类条目编译为域名匹配器
pub fn compile(items: &[Item]) -> Result<DomainMatcher> {
    let mut matcher = DomainMatcher::new();
    for item in items {
        match item.kind {
            ItemType::Domain => matcher.add_full(&item.value),
            ItemType::DomainSuffix => matcher.add_suffix(&item.value),
            ItemType::DomainKeyword => matcher.add_keyword(&item.value),
            ItemType::DomainRegex => matcher.add_regex(&item.value)?,
        }
    }
    Ok(matcher)
}
