use std::path::PathBuf;

/// Application-level constants
pub const APP_NAME: &str = "Payerlens";
pub const APP_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Overrides the data directory.
pub const DATA_DIR_ENV: &str = "PAYERLENS_DATA_DIR";
/// Overrides the routing config path.
pub const ROUTING_ENV: &str = "PAYERLENS_ROUTING";

/// Get the application data directory.
///
/// `PAYERLENS_DATA_DIR` when set, else the platform data dir, else the
/// working directory.
pub fn app_data_dir() -> PathBuf {
    if let Some(dir) = std::env::var_os(DATA_DIR_ENV).filter(|v| !v.is_empty()) {
        return PathBuf::from(dir);
    }
    dirs::data_dir()
        .map(|d| d.join("payerlens"))
        .unwrap_or_else(|| PathBuf::from(".payerlens"))
}

/// SQLite store holding policy versions and persisted diffs
pub fn database_path() -> PathBuf {
    app_data_dir().join("payerlens.db")
}

/// Provider routing (JSON). Missing file means built-in routes.
pub fn routing_config_path() -> PathBuf {
    match std::env::var_os(ROUTING_ENV).filter(|v| !v.is_empty()) {
        Some(path) => PathBuf::from(path),
        None => app_data_dir().join("routing.json"),
    }
}

/// Pipeline, diff and impact settings (JSON)
pub fn settings_path() -> PathBuf {
    app_data_dir().join("settings.json")
}

/// Prompt template overrides, one `<name>.txt` per template
pub fn templates_dir() -> PathBuf {
    app_data_dir().join("prompts")
}

/// Optional replacement for the bundled reference code table
pub fn reference_codes_path() -> PathBuf {
    app_data_dir().join("reference_codes.json")
}

/// Default tracing filter when `RUST_LOG` is unset
pub fn default_log_filter() -> &'static str {
    "payerlens=info,warn"
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paths_live_under_app_data() {
        let app = app_data_dir();
        assert!(database_path().starts_with(&app));
        assert!(settings_path().starts_with(&app));
        assert!(templates_dir().ends_with("prompts"));
    }

    #[test]
    fn app_name_is_payerlens() {
        assert_eq!(APP_NAME, "Payerlens");
    }

    #[test]
    fn app_version_matches_cargo() {
        assert_eq!(APP_VERSION, "0.1.0");
    }

    #[test]
    fn log_filter_targets_crate() {
        assert!(default_log_filter().starts_with("payerlens="));
    }
}
