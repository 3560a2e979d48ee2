//! 资源文件路径解析
//!
//! 未显式配置路径时，按顺序在若干常用目录中查找默认文件名，
//! 都找不到则落到基准目录（工作目录）下。

use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub struct PathResolver {
    base_dir: PathBuf,
    search_paths: Vec<PathBuf>,
}

impl PathResolver {
    /// 使用默认搜索目录：可执行文件所在目录、用户数据目录、系统共享目录
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        let mut search_paths = Vec::new();
        if let Some(exe_dir) = std::env::current_exe()
            .ok()
            .and_then(|p| p.parent().map(Path::to_path_buf))
        {
            search_paths.push(exe_dir);
        }
        if let Some(data_dir) = dirs::data_dir() {
            search_paths.push(data_dir.join("georoute"));
        }
        search_paths.push(PathBuf::from("/usr/local/share/georoute"));
        search_paths.push(PathBuf::from("/usr/share/georoute"));
        Self {
            base_dir: base_dir.into(),
            search_paths,
        }
    }

    /// 基准目录取当前工作目录
    pub fn from_current_dir() -> Self {
        let base = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
        Self::new(base)
    }

    pub fn with_search_paths(mut self, search_paths: Vec<PathBuf>) -> Self {
        self.search_paths = search_paths;
        self
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// 在搜索目录中查找文件名，返回第一个存在的完整路径
    pub fn find(&self, name: &str) -> Option<PathBuf> {
        self.search_paths
            .iter()
            .map(|dir| dir.join(name))
            .find(|candidate| candidate.is_file())
    }

    /// 相对路径拼接到基准目录，绝对路径原样返回
    pub fn base_path(&self, path: impl AsRef<Path>) -> PathBuf {
        let path = path.as_ref();
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.base_dir.join(path)
        }
    }

    /// 解析数据库文件路径
    ///
    /// 配置了路径则使用配置值，否则在搜索目录中查找 `default_filename`；
    /// 结果不存在时拼接到基准目录。
    pub fn resolve(&self, configured: Option<&str>, default_filename: &str) -> PathBuf {
        let candidate = match configured.filter(|p| !p.is_empty()) {
            Some(path) => PathBuf::from(path),
            None => self
                .find(default_filename)
                .unwrap_or_else(|| PathBuf::from(default_filename)),
        };
        if candidate.exists() {
            candidate
        } else {
            self.base_path(candidate)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn configured_path_wins() {
        let dir = tempfile::tempdir().unwrap();
        let resolver = PathResolver::new(dir.path()).with_search_paths(vec![]);
        let path = resolver.resolve(Some("/opt/data/geoip.db"), "geoip.db");
        assert_eq!(path, PathBuf::from("/opt/data/geoip.db"));
    }

    #[test]
    fn relative_configured_path_joins_base() {
        let dir = tempfile::tempdir().unwrap();
        let resolver = PathResolver::new(dir.path()).with_search_paths(vec![]);
        let path = resolver.resolve(Some("data/geosite.db"), "geosite.db");
        assert_eq!(path, dir.path().join("data/geosite.db"));
    }

    #[test]
    fn default_filename_found_in_search_path() {
        let base = tempfile::tempdir().unwrap();
        let share = tempfile::tempdir().unwrap();
        std::fs::write(share.path().join("geoip.db"), b"x").unwrap();
        let resolver = PathResolver::new(base.path())
            .with_search_paths(vec![PathBuf::from("/nonexistent"), share.path().to_path_buf()]);
        assert_eq!(
            resolver.resolve(None, "geoip.db"),
            share.path().join("geoip.db")
        );
    }

    #[test]
    fn missing_default_falls_back_to_base() {
        let base = tempfile::tempdir().unwrap();
        let resolver = PathResolver::new(base.path()).with_search_paths(vec![]);
        assert_eq!(
            resolver.resolve(Some(""), "geosite.db"),
            base.path().join("geosite.db")
        );
    }
}
