pub mod loader;
pub mod schema;
pub mod settings;

pub use loader::ConfigLoader;
pub use schema::{CrawlConfig, CrawlerConfig};
pub use settings::Settings;
