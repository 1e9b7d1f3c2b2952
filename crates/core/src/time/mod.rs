pub mod market_calendar;

pub use market_calendar::MarketCalendar;
