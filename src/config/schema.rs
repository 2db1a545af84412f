use crate::parser::{TableSchema, is_known_encoding};
use crate::processor::Processor;
use crate::registry::{CrawlerSchedule, SelectionMode};
use chrono_tz::Tz;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use validator::{Validate, ValidationError};

/// Contents of one crawler declaration file.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate)]
pub struct CrawlConfig {
    #[serde(default)]
    #[validate]
    pub crawlers: Vec<CrawlerConfig>,

    /// Table schemas registered in addition to the built-in ones.
    #[serde(default)]
    #[validate]
    pub tables: Vec<TableSchema>,

    /// Optional path to a parent configuration file to inherit from
    #[serde(default)]
    pub extends: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[validate(schema(function = "validate_crawler"))]
pub struct CrawlerConfig {
    #[validate(length(min = 1))]
    pub name: String,

    #[serde(default)]
    #[validate(url)]
    pub url: Option<String>,

    /// IANA zone the source publishes its local times in.
    #[validate(custom = "validate_timezone")]
    pub timezone: String,

    #[serde(default)]
    pub mode: SelectionMode,

    #[serde(default)]
    #[validate(range(min = 1))]
    pub limit: Option<usize>,

    #[serde(default)]
    #[validate(custom = "validate_filter")]
    pub filename_filter: Option<String>,

    pub processor: Processor,

    #[serde(default)]
    pub schedule: Option<CrawlerSchedule>,

    #[serde(default)]
    #[validate(custom = "validate_encoding")]
    pub encoding: Option<String>,

    #[serde(default = "default_active")]
    pub active: bool,
}

fn default_active() -> bool {
    true
}

fn invalid(code: &'static str, message: String) -> ValidationError {
    let mut err = ValidationError::new(code);
    err.message = Some(Cow::from(message));
    err
}

fn validate_timezone(value: &str) -> Result<(), ValidationError> {
    value
        .parse::<Tz>()
        .map(|_| ())
        .map_err(|_| invalid("timezone", format!("unknown timezone {}", value)))
}

fn validate_filter(value: &str) -> Result<(), ValidationError> {
    Regex::new(value)
        .map(|_| ())
        .map_err(|e| invalid("filename_filter", e.to_string()))
}

fn validate_encoding(value: &str) -> Result<(), ValidationError> {
    if is_known_encoding(value) {
        Ok(())
    } else {
        Err(invalid("encoding", format!("unknown text encoding {}", value)))
    }
}

fn validate_crawler(crawler: &CrawlerConfig) -> Result<(), ValidationError> {
    if crawler.url.is_none() {
        return Err(invalid("url", format!("crawler {} has no url", crawler.name)));
    }

    if crawler.mode == SelectionMode::MostRecent && crawler.limit.is_none() {
        return Err(invalid(
            "limit",
            format!("crawler {} selects most recent files but sets no limit", crawler.name),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn crawler() -> CrawlerConfig {
        serde_yaml::from_str(
            r#"
name: au.nemweb.dispatch_scada
url: http://nemweb.com.au/Reports/Current/Dispatch_SCADA/
timezone: Australia/Brisbane
mode: since-watermark
filename_filter: "PUBLIC_DISPATCHSCADA_.*\\.zip$"
processor:
  type: aemo_mms
schedule: live
"#,
        )
        .unwrap()
    }

    #[test]
    fn parses_a_crawler_declaration() {
        let crawler = crawler();
        assert!(crawler.validate().is_ok());
        assert_eq!(crawler.mode, SelectionMode::SinceWatermark);
        assert_eq!(crawler.schedule, Some(CrawlerSchedule::Live));
        assert_eq!(crawler.processor, Processor::AemoMms);
        assert!(crawler.active);
    }

    #[test]
    fn rejects_bad_timezone_filter_and_encoding() {
        let mut bad_zone = crawler();
        bad_zone.timezone = "Australia/Atlantis".into();
        assert!(bad_zone.validate().is_err());

        let mut bad_filter = crawler();
        bad_filter.filename_filter = Some("([".into());
        assert!(bad_filter.validate().is_err());

        let mut bad_encoding = crawler();
        bad_encoding.encoding = Some("klingon-8".into());
        assert!(bad_encoding.validate().is_err());
    }

    #[test]
    fn most_recent_mode_needs_a_limit() {
        let mut crawler = crawler();
        crawler.mode = SelectionMode::MostRecent;
        assert!(crawler.validate().is_err());

        crawler.limit = Some(3);
        assert!(crawler.validate().is_ok());
    }
}
