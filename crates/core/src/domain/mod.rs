pub mod records;
pub mod ticker;

pub use records::{
    ContentKind, IngestionCursor, JoinedDailyRecord, NormalizedSentimentEvent, RawPriceBar,
    RawSocialRecord, Source,
};
pub use ticker::Ticker;
