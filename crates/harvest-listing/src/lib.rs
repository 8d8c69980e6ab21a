//! Listing crawl contracts: rendering sessions, timestamp normalization, post
//! extraction and the per-source listing controller.

mod controller;
mod extract;
mod layout;
mod session;
pub mod testing;
mod timestamp;

pub use controller::{pages_needed, CrawlOutcome, CrawlProgress, CrawlState, ListingController};
pub use extract::{PageExtraction, PostExtractor};
pub use layout::{CrawlSettings, LayoutError, ListingLayout};
pub use session::{RenderingSession, SessionError};
pub use timestamp::{canonical_date, normalize, NotParseable};

pub const CRATE_NAME: &str = "harvest-listing";
