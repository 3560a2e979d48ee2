use std::collections::{HashMap, HashSet};

use anyhow::Result;
use regex::Regex;

/// Trie node for efficient domain suffix matching.
///
/// Domains are inserted in reverse-label order, e.g. "www.example.com"
/// is stored as ["com", "example", "www"].
#[derive(Default)]
pub struct DomainTrie {
    root: TrieNode,
    len: usize,
}

#[derive(Default)]
struct TrieNode {
    children: HashMap<String, TrieNode>,
    /// 以该节点结尾的后缀同时匹配自身
    terminal: bool,
    /// 以 `.` 开头插入的后缀只匹配子域名
    subdomain_only: bool,
}

impl DomainTrie {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a domain suffix.
    ///
    /// `example.com` matches `example.com` and every subdomain;
    /// `.example.com` matches subdomains only.
    pub fn insert(&mut self, suffix: &str) {
        let (suffix, subdomain_only) = match suffix.strip_prefix('.') {
            Some(rest) => (rest, true),
            None => (suffix, false),
        };
        if suffix.is_empty() {
            return;
        }
        let mut node = &mut self.root;
        for label in suffix.split('.').rev() {
            node = node.children.entry(label.to_lowercase()).or_default();
        }
        if !node.terminal && !node.subdomain_only {
            self.len += 1;
        }
        if subdomain_only {
            node.subdomain_only = true;
        } else {
            node.terminal = true;
        }
    }

    /// Check if the domain equals or falls under any inserted suffix.
    pub fn matches(&self, domain: &str) -> bool {
        let domain = domain.trim_end_matches('.');
        let labels: Vec<&str> = domain.split('.').rev().collect();
        let mut node = &self.root;

        for (depth, label) in labels.iter().enumerate() {
            let lower = label.to_lowercase();
            match node.children.get(&lower) {
                Some(child) => {
                    let remaining = labels.len() - depth - 1;
                    if child.terminal || (child.subdomain_only && remaining > 0) {
                        return true;
                    }
                    node = child;
                }
                None => break,
            }
        }

        false
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// 编译后的域名匹配器：完全匹配、后缀、关键字、正则
#[derive(Default)]
pub struct DomainMatcher {
    full: HashSet<String>,
    suffix: DomainTrie,
    keywords: Vec<String>,
    regexes: Vec<Regex>,
}

impl DomainMatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_full(&mut self, domain: &str) {
        self.full.insert(domain.to_lowercase());
    }

    pub fn add_suffix(&mut self, suffix: &str) {
        self.suffix.insert(suffix);
    }

    pub fn add_keyword(&mut self, keyword: &str) {
        self.keywords.push(keyword.to_lowercase());
    }

    pub fn add_regex(&mut self, pattern: &str) -> Result<()> {
        let regex = Regex::new(pattern)
            .map_err(|e| anyhow::anyhow!("invalid domain regex '{}': {}", pattern, e))?;
        self.regexes.push(regex);
        Ok(())
    }

    pub fn matches(&self, domain: &str) -> bool {
        let domain = domain.trim_end_matches('.').to_lowercase();
        if self.full.contains(&domain) || self.suffix.matches(&domain) {
            return true;
        }
        if self.keywords.iter().any(|k| domain.contains(k.as_str())) {
            return true;
        }
        self.regexes.iter().any(|r| r.is_match(&domain))
    }

    /// 条目总数
    pub fn len(&self) -> usize {
        self.full.len() + self.suffix.len() + self.keywords.len() + self.regexes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
