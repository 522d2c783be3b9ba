use std::collections::BTreeSet;

use chrono::{Datelike, Duration, NaiveDate, Weekday};

use crate::traits::HolidayProvider;

/// Set of public holidays, immutable for the duration of a run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HolidayCalendar {
    dates: BTreeSet<NaiveDate>,
}

impl HolidayCalendar {
    pub fn new<I: IntoIterator<Item = NaiveDate>>(dates: I) -> Self {
        Self {
            dates: dates.into_iter().collect(),
        }
    }

    /// Hong Kong general holidays for `years`, plus explicitly listed dates
    /// (the lunar-calendar holidays, which are not computed here).
    ///
    /// A holiday falling on a Sunday moves the next non-holiday weekday
    /// into the set.
    pub fn hong_kong<Y, I>(years: Y, extra: I) -> Self
    where
        Y: IntoIterator<Item = i32>,
        I: IntoIterator<Item = NaiveDate>,
    {
        let mut base: BTreeSet<NaiveDate> = years.into_iter().flat_map(statutory_dates).collect();
        base.extend(extra);

        let mut dates = base.clone();
        for holiday in base.iter().filter(|d| d.weekday() == Weekday::Sun) {
            let mut sub = *holiday + Duration::days(1);
            while dates.contains(&sub) || sub.weekday() == Weekday::Sun {
                sub += Duration::days(1);
            }
            dates.insert(sub);
        }
        Self { dates }
    }

    pub fn len(&self) -> usize {
        self.dates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dates.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = NaiveDate> + '_ {
        self.dates.iter().copied()
    }
}

impl HolidayProvider for HolidayCalendar {
    fn is_holiday(&self, date: NaiveDate) -> bool {
        self.dates.contains(&date)
    }

    fn days_to_next_holiday(&self, date: NaiveDate) -> Option<i64> {
        self.dates
            .range(date..)
            .next()
            .map(|h| (*h - date).num_days())
    }

    fn days_since_previous_holiday(&self, date: NaiveDate) -> Option<i64> {
        self.dates
            .range(..=date)
            .next_back()
            .map(|h| (date - *h).num_days())
    }
}

/// Hong Kong general holidays that follow fixed or Easter-relative rules.
fn statutory_dates(year: i32) -> Vec<NaiveDate> {
    let fixed = [(1, 1), (5, 1), (7, 1), (10, 1), (12, 25), (12, 26)];
    let mut dates: Vec<NaiveDate> = fixed
        .iter()
        .filter_map(|(m, d)| NaiveDate::from_ymd_opt(year, *m, *d))
        .collect();

    // Good Friday, the day following Good Friday, Easter Monday
    if let Some(easter) = easter_date(year) {
        dates.extend([-2, -1, 1].iter().map(|k| easter + Duration::days(*k)));
    }
    dates
}

/// Calculate Easter date using the Anonymous Gregorian algorithm.
/// This is efficient and accurate for the Gregorian calendar (1583-4099).
fn easter_date(year: i32) -> Option<NaiveDate> {
    let a = year % 19;
    let b = year / 100;
    let c = year % 100;
    let (d, e) = (b / 4, b % 4);
    let g = (8 * b + 13) / 25;
    let h = (19 * a + b - d - g + 15) % 30;
    let (i, k) = (c / 4, c % 4);
    let l = (32 + 2 * e + 2 * i - h - k) % 7;
    let m = (a + 11 * h + 19 * l) / 433;
    let month = (h + l - 7 * m + 90) / 25;
    let day = (h + l - 7 * m + 33 * month + 19) % 32;

    NaiveDate::from_ymd_opt(year, month as u32, day as u32)
}
