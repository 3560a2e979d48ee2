pub mod path;
pub mod types;

use anyhow::Result;
use std::path::Path;

pub use path::PathResolver;
pub use types::Config;

pub fn load_config(path: &str) -> Result<Config> {
    let content = std::fs::read_to_string(Path::new(path))
        .map_err(|e| anyhow::anyhow!("read config '{}': {}", path, e))?;
    let config: Config = serde_yml::from_str(&content)
        .map_err(|e| anyhow::anyhow!("parse config '{}': {}", path, e))?;
    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_config_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let config_path = dir.path().join("config.yaml");
        std::fs::write(
            &config_path,
            "outbounds:\n  - tag: direct\n    protocol: direct\n  - tag: block\n    protocol: block\nroute:\n  final: direct\n  rules:\n    - geosite: [category-ads]\n      outbound: block\n  geosite:\n    auto_update_interval: 24h\n",
        )
        .unwrap();

        let config = load_config(config_path.to_str().unwrap()).unwrap();
        assert_eq!(config.outbounds.len(), 2);
        assert_eq!(config.route.rules.len(), 1);
        assert_eq!(
            config.route.geosite.auto_update_interval,
            std::time::Duration::from_secs(24 * 3600)
        );
    }

    #[test]
    fn load_config_missing_file() {
        let err = load_config("/nonexistent/georoute.yaml").unwrap_err();
        assert!(err.to_string().contains("read config"));
    }

    #[test]
    fn load_config_runs_validation() {
        let dir = tempfile::tempdir().unwrap();
        let config_path = dir.path().join("config.yaml");
        std::fs::write(&config_path, "outbounds: []\n").unwrap();
        assert!(load_config(config_path.to_str().unwrap()).is_err());
    }
}
