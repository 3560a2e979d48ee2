use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

/// 地理数据库种类
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DatabaseKind {
    /// IP 段 -> 地区代码
    GeoIp,
    /// 分类代码 -> 域名条目
    GeoSite,
}

impl DatabaseKind {
    pub fn as_str(self) -> &'static str {
        match self {
            DatabaseKind::GeoIp => "geoip",
            DatabaseKind::GeoSite => "geosite",
        }
    }

    /// 未配置路径时使用的默认文件名
    pub fn default_filename(self) -> &'static str {
        match self {
            DatabaseKind::GeoIp => "geoip.db",
            DatabaseKind::GeoSite => "geosite.db",
        }
    }

    /// 未配置下载地址时使用的默认地址
    pub fn default_download_url(self) -> &'static str {
        match self {
            DatabaseKind::GeoIp => {
                "https://github.com/SagerNet/sing-geoip/releases/latest/download/geoip.db"
            }
            DatabaseKind::GeoSite => {
                "https://github.com/SagerNet/sing-geosite/releases/latest/download/geosite.db"
            }
        }
    }
}

impl fmt::Display for DatabaseKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Error, Debug)]
pub enum GeoError {
    #[error("{kind} path is a directory: {}", path.display())]
    IsDirectory { kind: DatabaseKind, path: PathBuf },

    #[error("{kind} database not exists: {}", path.display())]
    Missing { kind: DatabaseKind, path: PathBuf },

    #[error("download {url}: {source}")]
    Download {
        url: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("open {kind} database: {source}")]
    Corrupt {
        kind: DatabaseKind,
        #[source]
        source: anyhow::Error,
    },

    #[error("detour outbound not found: {0}")]
    DetourNotFound(String),

    #[error("save {kind} database: {source}")]
    Persist {
        kind: DatabaseKind,
        #[source]
        source: std::io::Error,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("config error: {0}")]
    Config(String),

    #[error("cancelled")]
    Cancelled,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl GeoError {
    pub fn download(url: impl Into<String>, source: impl Into<anyhow::Error>) -> Self {
        GeoError::Download {
            url: url.into(),
            source: source.into(),
        }
    }

    pub fn corrupt(kind: DatabaseKind, source: impl Into<anyhow::Error>) -> Self {
        GeoError::Corrupt {
            kind,
            source: source.into(),
        }
    }

    /// Whether another download attempt could succeed.
    pub fn is_retryable(&self) -> bool {
        self.kind().is_retryable()
    }

    /// Whether this error can never be fixed by retrying (bad configuration,
    /// cancellation).
    pub fn is_permanent(&self) -> bool {
        self.kind().is_permanent()
    }

    pub fn kind(&self) -> GeoErrorKind {
        match self {
            GeoError::IsDirectory { .. } => GeoErrorKind::Configuration,
            GeoError::Missing { .. } => GeoErrorKind::MissingResource,
            GeoError::Download { .. } => GeoErrorKind::Download,
            GeoError::Corrupt { .. } => GeoErrorKind::CorruptDatabase,
            GeoError::DetourNotFound(_) => GeoErrorKind::DetourNotFound,
            GeoError::Persist { .. } => GeoErrorKind::Persist,
            GeoError::Io(_) => GeoErrorKind::Io,
            GeoError::Config(_) => GeoErrorKind::Configuration,
            GeoError::Cancelled => GeoErrorKind::Cancelled,
            GeoError::Other(_) => GeoErrorKind::Other,
        }
    }
}

/// Lightweight error category for pattern matching without borrowing the error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GeoErrorKind {
    Configuration,
    MissingResource,
    Download,
    CorruptDatabase,
    DetourNotFound,
    Persist,
    Io,
    Cancelled,
    Other,
}

impl GeoErrorKind {
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            GeoErrorKind::Download | GeoErrorKind::Io | GeoErrorKind::MissingResource
        )
    }

    pub fn is_permanent(self) -> bool {
        matches!(
            self,
            GeoErrorKind::Configuration | GeoErrorKind::DetourNotFound | GeoErrorKind::Cancelled
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            GeoErrorKind::Configuration => "CONFIG",
            GeoErrorKind::MissingResource => "MISSING",
            GeoErrorKind::Download => "DOWNLOAD",
            GeoErrorKind::CorruptDatabase => "CORRUPT",
            GeoErrorKind::DetourNotFound => "DETOUR_NOT_FOUND",
            GeoErrorKind::Persist => "PERSIST",
            GeoErrorKind::Io => "IO",
            GeoErrorKind::Cancelled => "CANCELLED",
            GeoErrorKind::Other => "OTHER",
        }
    }
}

impl From<GeoError> for std::io::Error {
    fn from(e: GeoError) -> Self {
        std::io::Error::other(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn directory_error_is_permanent() {
        let err = GeoError::IsDirectory {
            kind: DatabaseKind::GeoIp,
            path: PathBuf::from("/tmp/geoip.db"),
        };
        assert_eq!(err.kind(), GeoErrorKind::Configuration);
        assert!(err.is_permanent());
        assert!(!err.is_retryable());
        assert_eq!(err.to_string(), "geoip path is a directory: /tmp/geoip.db");
    }

    #[test]
    fn download_error_is_retryable() {
        let err = GeoError::download("https://example.com/a.db", anyhow::anyhow!("reset"));
        assert!(err.is_retryable());
        assert_eq!(err.kind().as_str(), "DOWNLOAD");
        assert!(err.to_string().contains("https://example.com/a.db"));
    }

    #[test]
    fn corrupt_error_wraps_cause() {
        let err = GeoError::corrupt(DatabaseKind::GeoSite, anyhow::anyhow!("bad header"));
        assert_eq!(err.to_string(), "open geosite database: bad header");
        assert!(!err.is_retryable());
        assert!(!err.is_permanent());
    }

    #[test]
    fn default_names() {
        assert_eq!(DatabaseKind::GeoIp.default_filename(), "geoip.db");
        assert_eq!(DatabaseKind::GeoSite.default_filename(), "geosite.db");
        assert!(DatabaseKind::GeoSite
            .default_download_url()
            .ends_with("/geosite.db"));
    }
}
