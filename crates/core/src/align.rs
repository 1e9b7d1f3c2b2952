use crate::domain::{JoinedDailyRecord, NormalizedSentimentEvent, RawPriceBar};
use chrono::NaiveDate;
use chrono_tz::Tz;
use std::collections::BTreeMap;

/// Result of joining one ticker's events and bars.
#[derive(Debug, Clone, Default)]
pub struct AlignOutput {
    /// One record per bar, ascending by date.
    pub records: Vec<JoinedDailyRecord>,
    /// Events dated after the last bar. They belong to a session that has no bar yet.
    pub unattached: Vec<NormalizedSentimentEvent>,
}

/// Buckets sentiment events into the market's trading days.
///
/// An event belongs to the trading day whose local date it falls on. Events on weekends or
/// holidays roll forward to the next bar, so Saturday and Sunday chatter lands on Monday.
/// Events older than the first bar in the batch attach to the first bar.
#[derive(Debug, Clone, Copy)]
pub struct TemporalAligner {
    tz: Tz,
}

impl TemporalAligner {
    pub fn new(tz: Tz) -> Self {
        Self { tz }
    }

    pub fn align(
        &self,
        events: &[NormalizedSentimentEvent],
        bars: &[RawPriceBar],
    ) -> AlignOutput {
        let mut bars: Vec<&RawPriceBar> = bars.iter().collect();
        bars.sort_by_key(|b| b.date);
        bars.dedup_by_key(|b| b.date);

        let Some(last) = bars.last() else {
            return AlignOutput {
                records: Vec::new(),
                unattached: events.to_vec(),
            };
        };
        let last_date = last.date;

        let mut buckets: BTreeMap<NaiveDate, Vec<&NormalizedSentimentEvent>> = BTreeMap::new();
        let mut unattached = Vec::new();
        for ev in events {
            let local = ev.timestamp.with_timezone(&self.tz).date_naive();
            if local > last_date {
                unattached.push(ev.clone());
                continue;
            }
            // First bar on or after the event's local date.
            let idx = bars.partition_point(|b| b.date < local);
            let Some(bar) = bars.get(idx) else {
                unattached.push(ev.clone());
                continue;
            };
            buckets.entry(bar.date).or_default().push(ev);
        }

        let records = bars
            .iter()
            .map(|bar| {
                let day = buckets.get(&bar.date).map(Vec::as_slice).unwrap_or(&[]);
                let agg = aggregate(day);
                JoinedDailyRecord {
                    ticker: bar.ticker.clone(),
                    date: bar.date,
                    price_open: Some(bar.open),
                    price_close: Some(bar.close),
                    price_volume: Some(bar.volume),
                    sentiment_mean: agg.map(|a| a.mean),
                    sentiment_weighted_mean: agg.map(|a| a.weighted_mean),
                    sentiment_count: agg.map(|a| a.count),
                }
            })
            .collect();

        AlignOutput {
            records,
            unattached,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct DayAggregate {
    mean: f64,
    weighted_mean: f64,
    count: i32,
}

fn aggregate(events: &[&NormalizedSentimentEvent]) -> Option<DayAggregate> {
    if events.is_empty() {
        return None;
    }
    let n = events.len() as f64;
    let mean = events.iter().map(|e| e.score).sum::<f64>() / n;
    let total_weight: f64 = events.iter().map(|e| e.weight).sum();
    let weighted_mean = if total_weight > 0.0 {
        events.iter().map(|e| e.score * e.weight).sum::<f64>() / total_weight
    } else {
        mean
    };
    Some(DayAggregate {
        mean,
        weighted_mean,
        count: i32::try_from(events.len()).unwrap_or(i32::MAX),
    })
}
