use crate::error::Result;
use crate::watermark::WATERMARK_VERSION;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use validator::Validate;

/// Runtime settings: defaults, then an optional settings file, then
/// `GRIDCRAWL_*` environment variables.
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct Settings {
    #[validate(length(min = 1))]
    pub database_url: String,

    #[validate(range(min = 1, max = 3600))]
    pub http_timeout_secs: u64,

    #[validate(length(min = 1))]
    pub user_agent: String,

    /// Format version stamped on every crawl attempt.
    #[validate(range(min = 1, max = 2))]
    pub watermark_version: u32,
}

impl Settings {
    pub fn load(file: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder()
            .set_default("database_url", "sqlite:gridcrawl.db?mode=rwc")?
            .set_default("http_timeout_secs", 60_i64)?
            .set_default("user_agent", concat!("gridcrawl/", env!("CARGO_PKG_VERSION")))?
            .set_default("watermark_version", WATERMARK_VERSION as i64)?;

        if let Some(path) = file {
            builder = builder.add_source(config::File::from(path));
        }

        let settings: Settings = builder
            .add_source(config::Environment::with_prefix("GRIDCRAWL"))
            .build()?
            .try_deserialize()?;

        settings.validate()?;
        Ok(settings)
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn file_values_override_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.toml");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "http_timeout_secs = 15").unwrap();
        writeln!(file, "database_url = \"sqlite:/tmp/grid.db?mode=rwc\"").unwrap();

        let settings = Settings::load(Some(&path)).unwrap();
        assert_eq!(settings.http_timeout(), Duration::from_secs(15));
        assert_eq!(settings.database_url, "sqlite:/tmp/grid.db?mode=rwc");
        assert_eq!(settings.watermark_version, WATERMARK_VERSION);
    }

    #[test]
    fn out_of_range_values_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.yaml");
        std::fs::write(&path, "watermark_version: 9\n").unwrap();

        assert!(Settings::load(Some(&path)).is_err());
    }
}
