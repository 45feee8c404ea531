use chrono::{DateTime, FixedOffset, Utc};
use feed_rs::parser;
use thiserror::Error;

/// Publication dates must look like `Mon, 02 Jan 2024 15:04:05 +0000`.
/// The weekday is split off and checked separately (see [`parse_pub_date`]).
const PUB_DATE_FORMAT: &str = "%d %b %Y %H:%M:%S %z";

const WEEKDAYS: [&str; 7] = ["Mon", "Tue", "Wed", "Thu", "Fri", "Sat", "Sun"];

/// Errors raised while turning a feed body into entries.
#[derive(Debug, Error)]
pub enum ParseError {
    /// Body is not RSS/Atom markup
    #[error("Malformed feed: {0}")]
    Malformed(String),
    /// Entry lacks a title or link
    #[error("Feed entry {index} has no {field}")]
    MissingField { index: usize, field: &'static str },
    /// Entry has no publication date, or one that does not match the expected format
    #[error("Feed entry {index} ({title:?}) has a missing or malformed publication date")]
    InvalidDate { index: usize, title: String },
}

/// One entry of the syndication feed, before image enrichment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedEntry {
    pub title: String,
    pub description: Option<String>,
    pub link: String,
    pub published_at: DateTime<Utc>,
}

/// Parse a `"Dow, DD Mon YYYY HH:MM:SS ±HHMM"` date.
///
/// The weekday has to be one of the English abbreviations but is not
/// cross-checked against the day of month, the same leniency `strptime`
/// shows. Anything else off-format returns `None`.
pub fn parse_pub_date(text: &str) -> Option<DateTime<FixedOffset>> {
    let (weekday, rest) = text.trim().split_once(", ")?;
    if !WEEKDAYS.contains(&weekday) {
        return None;
    }
    DateTime::parse_from_str(rest, PUB_DATE_FORMAT).ok()
}

fn parse_pub_date_utc(text: &str) -> Option<DateTime<Utc>> {
    parse_pub_date(text).map(|dt| dt.with_timezone(&Utc))
}

/// Parse an RSS or Atom body into entries, in feed order.
///
/// Every entry must carry a title, a link and a conforming publication
/// date. The first entry that does not aborts the whole parse; callers
/// that want per-entry isolation use [`parse_feed_lenient`].
pub fn parse_feed(bytes: &[u8]) -> Result<Vec<FeedEntry>, ParseError> {
    parse_entries(bytes)?.into_iter().collect()
}

/// Like [`parse_feed`], but keeps going past bad entries and returns their
/// errors next to the good ones.
///
/// Markup that is not a feed at all is still an error.
pub fn parse_feed_lenient(
    bytes: &[u8],
) -> Result<(Vec<FeedEntry>, Vec<ParseError>), ParseError> {
    let mut entries = Vec::new();
    let mut rejected = Vec::new();
    for result in parse_entries(bytes)? {
        match result {
            Ok(entry) => entries.push(entry),
            Err(e) => rejected.push(e),
        }
    }
    Ok((entries, rejected))
}

fn parse_entries(bytes: &[u8]) -> Result<Vec<Result<FeedEntry, ParseError>>, ParseError> {
    let feed = parser::Builder::new()
        .timestamp_parser(parse_pub_date_utc)
        .build()
        .parse(bytes)
        .map_err(|e| ParseError::Malformed(e.to_string()))?;

    let entries = feed
        .entries
        .into_iter()
        .enumerate()
        .map(|(index, entry)| -> Result<FeedEntry, ParseError> {
            let title = entry
                .title
                .map(|t| t.content.trim().to_string())
                .filter(|t| !t.is_empty())
                .ok_or(ParseError::MissingField {
                    index,
                    field: "title",
                })?;
            let link = entry
                .links
                .first()
                .map(|l| l.href.trim().to_string())
                .filter(|l| !l.is_empty())
                .ok_or(ParseError::MissingField {
                    index,
                    field: "link",
                })?;
            let published_at = entry
                .published
                .ok_or_else(|| ParseError::InvalidDate {
                    index,
                    title: title.clone(),
                })?;
            let description = entry
                .summary
                .map(|s| s.content)
                .filter(|s| !s.trim().is_empty());

            Ok(FeedEntry {
                title,
                description,
                link,
                published_at,
            })
        })
        .collect();

    Ok(entries)
}
