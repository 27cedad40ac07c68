pub mod aggregator;
pub mod feeds;

pub use aggregator::{aggregate, consumer_load, SectionAggregation, SectionInputs, SectionTotal};
pub use feeds::{FeedIndex, FeedSelection, ResolvedFeed};
