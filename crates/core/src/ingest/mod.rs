pub mod market;
pub mod pushshift;
pub mod social;
pub mod yahoo;

pub use market::{MarketDataIngester, MarketSource};
pub use pushshift::PushshiftSource;
pub use social::{
    PageQuery, SocialContentIngester, SocialOptions, SocialPage, SocialPager, SocialSource,
    SubredditMap, parse_ticker_lists,
};
pub use yahoo::YahooChartSource;
