use crate::error::Error;
use crate::state::StateStore;
use chrono::{DateTime, Days, Months, NaiveDate, NaiveDateTime};

pub const DATE_FORMAT: &str = "%Y-%m-%d";

/// Returned for "last run" expressions when no previous run was recorded.
pub const DEFAULT_LAST_RUN: &str = "1997-01-01";

const LAST_RUN_ALIASES: [&str; 3] = ["last", "lastrun", "last run"];

const DATETIME_FORMATS: [&str; 3] = ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M"];

const DATE_FORMATS: [&str; 12] = [
    "%Y-%m-%d",
    "%Y/%m/%d",
    "%Y.%m.%d",
    "%d.%m.%Y",
    "%m/%d/%Y",
    "%B %d, %Y",
    "%B %d %Y",
    "%d %B %Y",
    "%d %B, %Y",
    "%b %d, %Y",
    "%b %d %Y",
    "%d %b %Y",
];

/// Turns the user's `date_from`/`date_to` expressions into `YYYY-MM-DD`.
pub struct DateResolver<'a> {
    state: &'a dyn StateStore,
    today: NaiveDate,
}

impl<'a> DateResolver<'a> {
    pub fn new(state: &'a dyn StateStore, today: NaiveDate) -> Self {
        DateResolver { state, today }
    }

    /// Resolves `expr` to a date string.
    ///
    /// The "last run" aliases (`last`, `lastrun`, `last run`, any case) return
    /// the persisted watermark, or [`DEFAULT_LAST_RUN`] when there is none.
    /// Anything else goes through [`parse_date`].
    ///
    /// # Errors
    /// [`Error::DateParse`] if the expression is not a recognisable date.
    pub fn resolve(&self, expr: &str) -> Result<String, Error> {
        let normalized = expr.trim().to_lowercase();
        if LAST_RUN_ALIASES.contains(&normalized.as_str()) {
            let watermark = self.state.read()?;
            return Ok(watermark
                .last_run
                .unwrap_or_else(|| DEFAULT_LAST_RUN.to_string()));
        }

        parse_date(expr, self.today)
            .map(|date| date.format(DATE_FORMAT).to_string())
            .ok_or_else(|| Error::DateParse {
                date: expr.to_string(),
            })
    }
}

/// Permissive date parsing: relative words (`today`, `yesterday`),
/// relative offsets (`3 days ago`, `in 2 weeks`) and a range of absolute
/// formats. Relative expressions are anchored at `today`.
pub fn parse_date(expr: &str, today: NaiveDate) -> Option<NaiveDate> {
    let trimmed = expr.trim();
    if trimmed.is_empty() {
        return None;
    }

    let lowered = trimmed.to_lowercase();
    match lowered.as_str() {
        "today" | "now" => return Some(today),
        "yesterday" => return today.checked_sub_days(Days::new(1)),
        "tomorrow" => return today.checked_add_days(Days::new(1)),
        _ => {}
    }

    if let Some(date) = parse_relative(&lowered, today) {
        return Some(date);
    }

    parse_absolute(trimmed)
}

fn parse_relative(expr: &str, today: NaiveDate) -> Option<NaiveDate> {
    let tokens: Vec<&str> = expr.split_whitespace().collect();
    let (amount, unit, backwards) = match tokens.as_slice() {
        [amount, unit, "ago"] => (*amount, *unit, true),
        ["in", amount, unit] => (*amount, *unit, false),
        _ => return None,
    };

    let amount: u32 = match amount {
        "a" | "an" => 1,
        n => n.parse().ok()?,
    };

    match unit.trim_end_matches('s') {
        "day" => shift_days(today, u64::from(amount), backwards),
        "week" => shift_days(today, u64::from(amount) * 7, backwards),
        "month" => shift_months(today, amount, backwards),
        "year" => shift_months(today, amount.checked_mul(12)?, backwards),
        _ => None,
    }
}

fn shift_days(date: NaiveDate, days: u64, backwards: bool) -> Option<NaiveDate> {
    if backwards {
        date.checked_sub_days(Days::new(days))
    } else {
        date.checked_add_days(Days::new(days))
    }
}

fn shift_months(date: NaiveDate, months: u32, backwards: bool) -> Option<NaiveDate> {
    if backwards {
        date.checked_sub_months(Months::new(months))
    } else {
        date.checked_add_months(Months::new(months))
    }
}

fn parse_absolute(expr: &str) -> Option<NaiveDate> {
    if let Ok(datetime) = DateTime::parse_from_rfc3339(expr) {
        return Some(datetime.date_naive());
    }

    DATETIME_FORMATS
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(expr, format).ok())
        .map(|datetime| datetime.date())
        .or_else(|| {
            DATE_FORMATS
                .iter()
                .find_map(|format| NaiveDate::parse_from_str(expr, format).ok())
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{MockStateStore, Watermark};

    fn today() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 3, 15).unwrap()
    }

    fn store_with(last_run: Option<&'static str>) -> MockStateStore {
        let mut store = MockStateStore::new();
        store.expect_read().returning(move || {
            Ok(match last_run {
                Some(date) => Watermark::new(date),
                None => Watermark::default(),
            })
        });
        store.expect_write().times(0);
        store
    }

    #[test]
    fn test_last_run_aliases_return_watermark() {
        let store = store_with(Some("2024-02-29"));
        let resolver = DateResolver::new(&store, today());

        for alias in ["last", "LastRun", "last run", "LAST RUN", "  last  "] {
            assert_eq!(resolver.resolve(alias).unwrap(), "2024-02-29", "{alias}");
        }
    }

    #[test]
    fn test_last_run_defaults_without_watermark() {
        let store = store_with(None);
        let resolver = DateResolver::new(&store, today());

        assert_eq!(resolver.resolve("lastrun").unwrap(), DEFAULT_LAST_RUN);
        assert_eq!(resolver.resolve("Last").unwrap(), "1997-01-01");
    }

    #[test]
    fn test_absolute_dates() {
        let store = store_with(None);
        let resolver = DateResolver::new(&store, today());

        assert_eq!(resolver.resolve("2023-10-01").unwrap(), "2023-10-01");
        assert_eq!(resolver.resolve("2023/10/01").unwrap(), "2023-10-01");
        assert_eq!(resolver.resolve("01.10.2023").unwrap(), "2023-10-01");
        assert_eq!(resolver.resolve("2023-10-01T08:30:00Z").unwrap(), "2023-10-01");
        assert_eq!(resolver.resolve("2023-10-01 23:59:59").unwrap(), "2023-10-01");
        assert_eq!(resolver.resolve("October 1, 2023").unwrap(), "2023-10-01");
        assert_eq!(resolver.resolve("1 Oct 2023").unwrap(), "2023-10-01");
    }

    #[test]
    fn test_relative_dates() {
        let store = store_with(None);
        let resolver = DateResolver::new(&store, today());

        assert_eq!(resolver.resolve("today").unwrap(), "2024-03-15");
        assert_eq!(resolver.resolve("Yesterday").unwrap(), "2024-03-14");
        assert_eq!(resolver.resolve("3 days ago").unwrap(), "2024-03-12");
        assert_eq!(resolver.resolve("1 day ago").unwrap(), "2024-03-14");
        assert_eq!(resolver.resolve("2 weeks ago").unwrap(), "2024-03-01");
        assert_eq!(resolver.resolve("a month ago").unwrap(), "2024-02-15");
        assert_eq!(resolver.resolve("1 year ago").unwrap(), "2023-03-15");
        assert_eq!(resolver.resolve("in 5 days").unwrap(), "2024-03-20");
    }

    #[test]
    fn test_unparseable_dates_fail_without_touching_state() {
        let mut store = MockStateStore::new();
        store.expect_read().times(0);
        store.expect_write().times(0);
        let resolver = DateResolver::new(&store, today());

        for expr in ["", "not a date", "2024-13-01", "3 fortnights ago", "last week"] {
            match resolver.resolve(expr) {
                Err(Error::DateParse { date }) => assert_eq!(date, expr),
                other => panic!("expected DateParse for {expr:?}, got {other:?}"),
            }
        }
    }
}
