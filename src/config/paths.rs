//! Configuration paths

use std::path::PathBuf;

/// Get the configuration directory
pub fn config_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("CODEPLAY_CONFIG_DIR") {
        return PathBuf::from(dir);
    }

    dirs::config_dir()
        .map(|d| d.join("codeplay"))
        .unwrap_or_else(|| {
            dirs::home_dir()
                .map(|h| h.join(".config").join("codeplay"))
                .unwrap_or_else(|| PathBuf::from(".codeplay"))
        })
}

/// Get the main configuration file path
pub fn config_path() -> PathBuf {
    if let Ok(path) = std::env::var("CODEPLAY_CONFIG") {
        return PathBuf::from(path);
    }

    config_dir().join("config.json")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_path_is_inside_config_dir_by_default() {
        if std::env::var("CODEPLAY_CONFIG").is_err() {
            assert!(config_path().starts_with(config_dir()));
        }
        assert!(config_path().to_string_lossy().len() > 0);
    }
}
