//! Feed retrieval and enrichment.
//!
//! - [`fetcher`] - single-attempt HTTP download with timeout and size limit
//! - [`parser`] - RSS/Atom parsing with `feed-rs` and strict publication dates
//! - [`image`] - `og:image` lookup on article pages with `scraper`

mod fetcher;
mod image;
mod parser;

pub use fetcher::{fetch_feed, FetchError};
pub use image::{extract_og_image, resolve_image};
pub use parser::{parse_feed, parse_feed_lenient, parse_pub_date, FeedEntry, ParseError};
