//! Remote directory listings.
//!
//! Sources publish IIS-style index pages where every entry is an anchor
//! preceded by a text node carrying the modified time and size:
//!
//! ```text
//! Sunday, June 12, 2022  4:05 AM        12345 <A HREF="/Reports/...zip">PUBLIC_...zip</A><br>
//! ```
//!
//! Modified times carry no offset; they are localized with the crawler's
//! configured timezone and kept as UTC instants.

use crate::error::{Error, Result};
use crate::fetch::Fetcher;
use chrono::{DateTime, Duration, NaiveDateTime, TimeZone, Utc};
use chrono_tz::Tz;
use regex::Regex;
use select::document::Document;
use select::predicate::Name;
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;
use url::Url;

static ENTRY_META: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(\w+,\s+\w+\s+\d{1,2},\s+\d{4}\s+\d{1,2}:\d{2}\s+[AP]M)\s+(<dir>|\d+)")
        .expect("valid listing regex")
});

const LISTING_TIME_FORMAT: &str = "%A, %B %d, %Y %I:%M %p";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileKind {
    Data,
    Archive,
    Ignorable,
}

impl FileKind {
    pub fn from_filename(filename: &str) -> Self {
        let ext = filename
            .rsplit_once('.')
            .map(|(_, ext)| ext.to_ascii_lowercase())
            .unwrap_or_default();

        match ext.as_str() {
            "zip" => FileKind::Archive,
            "csv" | "txt" | "json" => FileKind::Data,
            _ => FileKind::Ignorable,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DirlistingEntry {
    pub filename: String,
    pub link: Url,
    pub modified: DateTime<Utc>,
    pub is_directory: bool,
    pub kind: FileKind,
    pub size: Option<u64>,
}

/// Which entries of a listing a run should process.
#[derive(Debug, Clone, PartialEq)]
pub enum Selection {
    All,
    ModifiedSince(DateTime<Utc>),
    MostRecent(usize),
}

#[derive(Debug, Clone)]
pub struct Dirlisting {
    pub url: Url,
    pub timezone: Tz,
    entries: Vec<DirlistingEntry>,
}

impl Dirlisting {
    pub async fn fetch(fetcher: &dyn Fetcher, url: &Url, timezone: Tz) -> Result<Self> {
        let html = fetcher.fetch_text(url).await?;
        let listing = Self::parse(&html, url, timezone)?;

        log::debug!(
            "Got {} entries, {} files and {} directories from {}",
            listing.count(),
            listing.file_count(),
            listing.directory_count(),
            url
        );
        Ok(listing)
    }

    pub fn parse(html: &str, base: &Url, timezone: Tz) -> Result<Self> {
        let document = Document::from(html);
        let mut entries = Vec::new();

        for anchor in document.find(Name("a")) {
            let label = anchor.text().trim().to_string();
            if label.contains("To Parent Directory") {
                continue;
            }

            let Some(href) = anchor.attr("href") else {
                continue;
            };

            let Some(meta) = anchor.prev().and_then(|node| node.as_text().map(str::to_string)) else {
                log::debug!("No listing metadata before anchor {}", href);
                continue;
            };

            let Some(caps) = ENTRY_META.captures(&meta) else {
                log::debug!("Unrecognized listing metadata for {}: {:?}", href, meta.trim());
                continue;
            };

            let modified = match parse_listing_time(&caps[1], timezone) {
                Ok(modified) => modified,
                Err(e) => {
                    log::warn!("Skipping listing entry {}: {}", href, e);
                    continue;
                }
            };
            let link = base
                .join(href)
                .map_err(|e| Error::Parse(format!("Invalid link {}: {}", href, e)))?;

            let is_directory = caps[2].eq_ignore_ascii_case("<dir>");
            let size = if is_directory { None } else { caps[2].parse().ok() };

            let filename = if label.is_empty() {
                link.path_segments()
                    .and_then(|mut segments| segments.next_back().map(str::to_string))
                    .unwrap_or_default()
            } else {
                label
            };

            entries.push(DirlistingEntry {
                kind: FileKind::from_filename(&filename),
                filename,
                link,
                modified,
                is_directory,
                size,
            });
        }

        Ok(Self {
            url: base.clone(),
            timezone,
            entries,
        })
    }

    pub fn entries(&self) -> &[DirlistingEntry] {
        &self.entries
    }

    pub fn count(&self) -> usize {
        self.entries.len()
    }

    pub fn file_count(&self) -> usize {
        self.entries.iter().filter(|e| !e.is_directory).count()
    }

    pub fn directory_count(&self) -> usize {
        self.entries.iter().filter(|e| e.is_directory).count()
    }

    /// Keeps only entries whose filename matches `pattern`.
    pub fn apply_filter(&mut self, pattern: &Regex) {
        self.entries.retain(|e| pattern.is_match(&e.filename));
    }

    /// Drops files that can never contain tables (html, pdf, ...).
    pub fn retain_fetchable(&mut self) {
        self.entries
            .retain(|e| e.is_directory || e.kind != FileKind::Ignorable);
    }

    pub fn all_files(&self) -> Vec<DirlistingEntry> {
        self.files().cloned().collect()
    }

    /// Files modified strictly after `since`, oldest first, ties by filename.
    pub fn modified_since(&self, since: DateTime<Utc>) -> Vec<DirlistingEntry> {
        let mut selected: Vec<_> = self.files().filter(|e| e.modified > since).cloned().collect();
        selected.sort_by(|a, b| a.modified.cmp(&b.modified).then_with(|| a.filename.cmp(&b.filename)));
        selected
    }

    /// The `limit` newest files, newest first, ties by filename.
    pub fn most_recent(&self, limit: usize) -> Vec<DirlistingEntry> {
        let mut selected: Vec<_> = self.files().cloned().collect();
        selected.sort_by(|a, b| b.modified.cmp(&a.modified).then_with(|| a.filename.cmp(&b.filename)));
        selected.truncate(limit);
        selected
    }

    pub fn select(&self, selection: &Selection) -> Vec<DirlistingEntry> {
        match selection {
            Selection::All => self.all_files(),
            Selection::ModifiedSince(since) => self.modified_since(*since),
            Selection::MostRecent(limit) => self.most_recent(*limit),
        }
    }

    fn files(&self) -> impl Iterator<Item = &DirlistingEntry> {
        self.entries.iter().filter(|e| !e.is_directory)
    }
}

fn parse_listing_time(raw: &str, timezone: Tz) -> Result<DateTime<Utc>> {
    let normalized = raw.split_whitespace().collect::<Vec<_>>().join(" ");
    let naive = NaiveDateTime::parse_from_str(&normalized, LISTING_TIME_FORMAT)
        .map_err(|e| Error::Parse(format!("Invalid listing time {:?}: {}", normalized, e)))?;

    // A wall time inside a daylight-saving gap is read as the time an hour later.
    [naive, naive + Duration::hours(1)]
        .iter()
        .find_map(|local| timezone.from_local_datetime(local).earliest())
        .map(|dt| dt.with_timezone(&Utc))
        .ok_or_else(|| Error::Parse(format!("{} does not exist in {}", normalized, timezone)))
}

#[cfg(test)]
mod tests {
    use super::*;

    const LISTING: &str = r#"<html><head><title>nemweb.com.au - /Reports/Current/DispatchIS_Reports/</title></head><body>
<H1>nemweb.com.au - /Reports/Current/DispatchIS_Reports/</H1><hr>
<pre><A HREF="/Reports/Current/">[To Parent Directory]</A><br><br>
 Sunday, June 12, 2022 10:00 AM        20480 <A HREF="/Reports/Current/DispatchIS_Reports/PUBLIC_DISPATCHIS_A.zip">PUBLIC_DISPATCHIS_A.zip</A><br>
 Monday, June 13, 2022 10:00 AM        20480 <A HREF="/Reports/Current/DispatchIS_Reports/PUBLIC_DISPATCHIS_C.zip">PUBLIC_DISPATCHIS_C.zip</A><br>
 Monday, June 13, 2022 10:00 AM        20480 <A HREF="/Reports/Current/DispatchIS_Reports/PUBLIC_DISPATCHIS_B.zip">PUBLIC_DISPATCHIS_B.zip</A><br>
 Tuesday, June 14, 2022  9:05 PM        20480 <A HREF="/Reports/Current/DispatchIS_Reports/PUBLIC_DISPATCHIS_D.zip">PUBLIC_DISPATCHIS_D.zip</A><br>
 Tuesday, June 14, 2022  9:05 PM        512 <A HREF="/Reports/Current/DispatchIS_Reports/README.html">README.html</A><br>
 Wednesday, June 15, 2022  1:00 AM        &lt;dir&gt; <A HREF="/Reports/Current/DispatchIS_Reports/DUPLICATE/">DUPLICATE</A><br></pre><hr></body></html>"#;

    fn listing() -> Dirlisting {
        let base = Url::parse("https://nemweb.com.au/Reports/Current/DispatchIS_Reports/").unwrap();
        Dirlisting::parse(LISTING, &base, chrono_tz::Australia::Brisbane).unwrap()
    }

    fn names(entries: &[DirlistingEntry]) -> Vec<&str> {
        entries.iter().map(|e| e.filename.as_str()).collect()
    }

    #[test]
    fn parses_entries_and_skips_parent_link() {
        let listing = listing();
        assert_eq!(listing.count(), 6);
        assert_eq!(listing.directory_count(), 1);
        assert_eq!(listing.file_count(), 5);

        let first = &listing.entries()[0];
        assert_eq!(first.filename, "PUBLIC_DISPATCHIS_A.zip");
        assert_eq!(first.kind, FileKind::Archive);
        assert_eq!(first.size, Some(20480));
        assert_eq!(
            first.link.as_str(),
            "https://nemweb.com.au/Reports/Current/DispatchIS_Reports/PUBLIC_DISPATCHIS_A.zip"
        );
    }

    #[test]
    fn localizes_times_with_source_timezone() {
        let listing = listing();
        // Brisbane is UTC+10 with no daylight saving
        assert_eq!(
            listing.entries()[0].modified,
            Utc.with_ymd_and_hms(2022, 6, 12, 0, 0, 0).unwrap()
        );
        assert_eq!(
            listing.entries()[3].modified,
            Utc.with_ymd_and_hms(2022, 6, 14, 11, 5, 0).unwrap()
        );
    }

    #[test]
    fn modified_since_is_strict_ascending_and_tiebroken() {
        let listing = listing();
        let since = Utc.with_ymd_and_hms(2022, 6, 12, 0, 0, 0).unwrap();
        let selected = listing.modified_since(since);
        assert_eq!(
            names(&selected),
            vec![
                "PUBLIC_DISPATCHIS_B.zip",
                "PUBLIC_DISPATCHIS_C.zip",
                "PUBLIC_DISPATCHIS_D.zip",
                "README.html"
            ]
        );
    }

    #[test]
    fn most_recent_takes_newest_first() {
        let mut listing = listing();
        listing.retain_fetchable();

        assert_eq!(
            names(&listing.most_recent(2)),
            vec!["PUBLIC_DISPATCHIS_D.zip", "PUBLIC_DISPATCHIS_B.zip"]
        );
        assert_eq!(listing.most_recent(10).len(), 4);
    }

    #[test]
    fn filter_applies_before_selection() {
        let mut listing = listing();
        listing.apply_filter(&Regex::new(r"_[AB]\.zip$").unwrap());

        assert_eq!(
            names(&listing.select(&Selection::All)),
            vec!["PUBLIC_DISPATCHIS_A.zip", "PUBLIC_DISPATCHIS_B.zip"]
        );
    }

    #[test]
    fn all_files_keeps_listing_order_without_directories() {
        let listing = listing();
        let all = listing.all_files();
        assert_eq!(all.len(), 5);
        assert_eq!(all[1].filename, "PUBLIC_DISPATCHIS_C.zip");
        assert!(all.iter().all(|e| !e.is_directory));
    }

    #[test]
    fn kind_is_inferred_from_extension() {
        assert_eq!(FileKind::from_filename("PUBLIC_DISPATCHSCADA.CSV"), FileKind::Data);
        assert_eq!(FileKind::from_filename("archive.ZIP"), FileKind::Archive);
        assert_eq!(FileKind::from_filename("index.html"), FileKind::Ignorable);
        assert_eq!(FileKind::from_filename("noext"), FileKind::Ignorable);
        assert_eq!(FileKind::from_filename("IDN60901.94768.json"), FileKind::Data);
    }

    #[test]
    fn unconvertible_times_do_not_lose_the_listing() {
        let html = r#"<pre><A HREF="/fwo/">[To Parent Directory]</A><br><br>
 Sunday, October 2, 2022  2:30 AM        2048 <A HREF="/fwo/GAP.csv">GAP.csv</A><br>
 Friday, June 31, 2022 10:00 AM        2048 <A HREF="/fwo/BAD.csv">BAD.csv</A><br>
 Sunday, October 2, 2022  4:00 AM        2048 <A HREF="/fwo/OK.csv">OK.csv</A><br></pre>"#;
        let base = Url::parse("https://reg.bom.gov.au/fwo/").unwrap();
        let listing = Dirlisting::parse(html, &base, chrono_tz::Australia::Sydney).unwrap();

        assert_eq!(names(listing.entries()), vec!["GAP.csv", "OK.csv"]);
        // 2:30 AM falls in the spring-forward gap and is read as 3:30 AM AEDT
        assert_eq!(
            listing.entries()[0].modified,
            Utc.with_ymd_and_hms(2022, 10, 1, 16, 30, 0).unwrap()
        );
        assert_eq!(
            listing.entries()[1].modified,
            Utc.with_ymd_and_hms(2022, 10, 1, 17, 0, 0).unwrap()
        );
    }
}
