//! Trading calendar facade
//!
//! The position manager needs only one question answered: given a bartime,
//! which prior business day should the prior-close price come from. Holiday
//! calendars belong to implementations behind this trait.

use chrono::{DateTime, Datelike, NaiveTime, TimeZone, Utc, Weekday};

use crate::types::ProductType;

pub trait TradingCalendar {
    /// The timestamp of the daily bar `n` business days before `ts`
    fn prior_business_day(&self, product_type: ProductType, ts: DateTime<Utc>, n: u32)
        -> DateTime<Utc>;
}

/// Weekday-only calendar: every Monday through Friday is a business day.
/// Daily bars are stamped at the configured time-of-day on their date; the
/// default matches the sim feed's convention of stamping 1D bars at the
/// start of the date.
#[derive(Debug, Clone)]
pub struct WeekdayCalendar {
    daily_bar_time: NaiveTime,
}

impl WeekdayCalendar {
    pub fn new(daily_bar_time: NaiveTime) -> Self {
        Self { daily_bar_time }
    }

    pub fn daily_bar_time(&self) -> NaiveTime {
        self.daily_bar_time
    }
}

impl Default for WeekdayCalendar {
    fn default() -> Self {
        Self {
            daily_bar_time: NaiveTime::MIN,
        }
    }
}

impl TradingCalendar for WeekdayCalendar {
    fn prior_business_day(
        &self,
        _product_type: ProductType,
        ts: DateTime<Utc>,
        n: u32,
    ) -> DateTime<Utc> {
        let mut date = ts.date_naive();
        let mut remaining = n;
        while remaining > 0 {
            date = date.pred_opt().expect("date underflow");
            if !matches!(date.weekday(), Weekday::Sat | Weekday::Sun) {
                remaining -= 1;
            }
        }
        Utc.from_utc_datetime(&date.and_time(self.daily_bar_time))
    }
}
