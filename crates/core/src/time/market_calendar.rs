use chrono::{DateTime, Datelike, Duration, NaiveDate, TimeZone, Timelike, Utc, Weekday};
use chrono_tz::Tz;
use std::collections::HashSet;

pub const DEFAULT_MARKET_TZ: Tz = chrono_tz::America::New_York;

/// Market timezone plus the rules for which session is complete.
#[derive(Debug, Clone)]
pub struct MarketCalendar {
    tz: Tz,
    // Before this local hour, today's session is treated as still open.
    close_cutoff_hour: u32,
    holidays: HashSet<NaiveDate>,
}

impl MarketCalendar {
    pub fn new(tz: Tz, close_cutoff_hour: u32, extra_holidays: &[NaiveDate]) -> anyhow::Result<Self> {
        anyhow::ensure!(
            close_cutoff_hour <= 24,
            "market close cutoff hour must be 0..=24 (got {close_cutoff_hour})"
        );

        let mut holidays = fixed_date_holidays();
        holidays.extend(extra_holidays.iter().copied());

        Ok(Self {
            tz,
            close_cutoff_hour,
            holidays,
        })
    }

    pub fn tz(&self) -> Tz {
        self.tz
    }

    pub fn local_date(&self, ts: DateTime<Utc>) -> NaiveDate {
        ts.with_timezone(&self.tz).date_naive()
    }

    /// First instant of `date` in market time.
    pub fn day_start_utc(&self, date: NaiveDate) -> DateTime<Utc> {
        let midnight = date.and_hms_opt(0, 0, 0).unwrap_or_default();
        // Zones that jump over midnight start the day at the first local time that exists.
        (0..=2)
            .find_map(|h| {
                self.tz
                    .from_local_datetime(&(midnight + Duration::hours(h)))
                    .earliest()
            })
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(|| Utc.from_utc_datetime(&midnight))
    }

    /// Last whole second of `date` in market time.
    pub fn day_end_utc(&self, date: NaiveDate) -> DateTime<Utc> {
        self.day_start_utc(date + Duration::days(1)) - Duration::seconds(1)
    }

    pub fn is_trading_day(&self, date: NaiveDate) -> bool {
        !is_weekend(date) && !self.holidays.contains(&date)
    }

    /// Most recent session whose close has passed at `now_utc`.
    pub fn last_closed_session(&self, now_utc: DateTime<Utc>) -> NaiveDate {
        let now_local = now_utc.with_timezone(&self.tz);
        let mut date = now_local.date_naive();
        if now_local.hour() < self.close_cutoff_hour {
            date = date - Duration::days(1);
        }
        while !self.is_trading_day(date) {
            date = date - Duration::days(1);
        }
        date
    }
}

pub fn parse_holidays(raw: &str) -> Vec<NaiveDate> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .filter_map(|s| match NaiveDate::parse_from_str(s, "%Y-%m-%d") {
            Ok(d) => Some(d),
            Err(err) => {
                tracing::warn!(value = s, error = %err, "ignoring unparseable market holiday");
                None
            }
        })
        .collect()
}

fn is_weekend(date: NaiveDate) -> bool {
    matches!(date.weekday(), Weekday::Sat | Weekday::Sun)
}

/// Weekday on which a fixed-date holiday is observed.
///
/// Saturday moves to Friday and Sunday to Monday, except that New Year's Day on a Saturday
/// is not observed at all (the exchange keeps the prior year's last session open).
fn observed(date: NaiveDate) -> Option<NaiveDate> {
    match date.weekday() {
        Weekday::Sat if date.month() == 1 && date.day() == 1 => None,
        Weekday::Sat => Some(date - Duration::days(1)),
        Weekday::Sun => Some(date + Duration::days(1)),
        _ => Some(date),
    }
}

fn fixed_date_holidays() -> HashSet<NaiveDate> {
    // Only holidays that never move. Floating ones come from MARKET_HOLIDAYS.
    let mut out = HashSet::new();
    for y in 2015..=2035 {
        for (m, d) in [(1, 1), (6, 19), (7, 4), (12, 25)] {
            // Juneteenth closures start in 2022.
            if (m, d) == (6, 19) && y < 2022 {
                continue;
            }
            if let Some(date) = NaiveDate::from_ymd_opt(y, m, d).and_then(observed) {
                out.insert(date);
            }
        }
    }
    out
}
