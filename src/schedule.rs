use crate::errors::{AppError, AppResult};
use crate::models::{Frequency, TimeWindow};
use chrono::{DateTime, Datelike, NaiveDate, TimeDelta, Utc, Weekday};

/// Recurrence of a job: frequency, UTC time of day and the anchor day the
/// frequency needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecurrenceRule {
    pub frequency: Frequency,
    pub hour: u32,
    pub minute: u32,
    pub weekday: Option<Weekday>,
    pub month_day: Option<u32>,
}

impl RecurrenceRule {
    /// Parses the raw schedule columns of a job. Presence of the weekday or
    /// month day is checked by the window generator, not here.
    pub fn from_parts(
        frequency: &str,
        time: Option<&str>,
        weekly_day: Option<&str>,
        monthly_day: Option<u32>,
    ) -> AppResult<Self> {
        let frequency = Frequency::parse(frequency)
            .ok_or_else(|| AppError::UnsupportedFrequency(format!("Unsupported frequency '{}'", frequency)))?;
        let time = time
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .ok_or_else(|| AppError::MissingScheduleField("schedule_time is required".to_string()))?;
        let (hour, minute) = parse_time_of_day(time)?;

        let weekday = weekly_day
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(parse_weekday)
            .transpose()?;

        if let Some(day) = monthly_day {
            if !(1..=31).contains(&day) {
                return Err(AppError::MissingScheduleField(format!(
                    "monthly_day must be between 1 and 31, got {}",
                    day
                )));
            }
        }

        Ok(Self {
            frequency,
            hour,
            minute,
            weekday,
            month_day: monthly_day,
        })
    }
}

/// Number of historical windows computed per job run. Unknown frequencies
/// yield zero windows.
pub fn run_count(frequency: &str) -> usize {
    match Frequency::parse(frequency) {
        Some(Frequency::Daily) => 30,
        Some(Frequency::Weekly) | Some(Frequency::Monthly) => 15,
        None => 0,
    }
}

/// Steps back from `as_of` (anchored to the rule's time of day) one period at a
/// time and returns `runs` contiguous windows, newest first.
pub fn generate_windows(as_of: DateTime<Utc>, rule: &RecurrenceRule, runs: usize) -> AppResult<Vec<TimeWindow>> {
    if runs == 0 {
        return Ok(Vec::new());
    }

    let weekday = match rule.frequency {
        Frequency::Weekly => Some(rule.weekday.ok_or_else(|| {
            AppError::MissingScheduleField("weekly_day is required for weekly frequency".to_string())
        })?),
        _ => None,
    };
    let month_day = match rule.frequency {
        Frequency::Monthly => Some(rule.month_day.ok_or_else(|| {
            AppError::MissingScheduleField("monthly_day is required for monthly frequency".to_string())
        })?),
        _ => None,
    };

    let mut windows = Vec::with_capacity(runs);
    let mut end = anchor(as_of.date_naive(), rule)?;

    for _ in 0..runs {
        let end_date = end.date_naive();
        let start_date = match rule.frequency {
            Frequency::Daily => step_days(end_date, 1)?,
            Frequency::Weekly => {
                let target = weekday.map(|day| day.num_days_from_sunday()).unwrap_or_default();
                let current = end_date.weekday().num_days_from_sunday();
                let diff = match (current + 7 - target) % 7 {
                    0 => 7,
                    diff => diff,
                };
                step_days(end_date, i64::from(diff))?
            }
            Frequency::Monthly => previous_month_on(end_date, month_day.unwrap_or(1))?,
        };

        let start = anchor(start_date, rule)?;
        windows.push(TimeWindow {
            window_date: start,
            start_ts: start,
            end_ts: end,
        });
        end = start;
    }

    Ok(windows)
}

/// Oldest-first copy of a generated window sequence, for callers that
/// chart or replay windows in time order. The executor hands windows to the
/// prompt newest-first and does not use this.
pub fn chronological(windows: &[TimeWindow]) -> Vec<TimeWindow> {
    windows.iter().rev().copied().collect()
}

fn anchor(date: NaiveDate, rule: &RecurrenceRule) -> AppResult<DateTime<Utc>> {
    date.and_hms_opt(rule.hour, rule.minute, 0)
        .map(|naive| naive.and_utc())
        .ok_or_else(|| AppError::Internal(format!("invalid time of day {:02}:{:02}", rule.hour, rule.minute)))
}

fn step_days(date: NaiveDate, days: i64) -> AppResult<NaiveDate> {
    date.checked_sub_signed(TimeDelta::days(days))
        .ok_or_else(|| AppError::Internal("date out of range".to_string()))
}

fn previous_month_on(date: NaiveDate, day: u32) -> AppResult<NaiveDate> {
    let (year, month) = if date.month() == 1 {
        (date.year() - 1, 12)
    } else {
        (date.year(), date.month() - 1)
    };
    let day = day.min(last_day_of_month(year, month)?);
    NaiveDate::from_ymd_opt(year, month, day).ok_or_else(|| AppError::Internal("date out of range".to_string()))
}

fn last_day_of_month(year: i32, month: u32) -> AppResult<u32> {
    let (next_year, next_month) = if month == 12 { (year + 1, 1) } else { (year, month + 1) };
    NaiveDate::from_ymd_opt(next_year, next_month, 1)
        .and_then(|first| first.pred_opt())
        .map(|last| last.day())
        .ok_or_else(|| AppError::Internal("date out of range".to_string()))
}

fn parse_time_of_day(raw: &str) -> AppResult<(u32, u32)> {
    let invalid = || AppError::MissingScheduleField(format!("schedule_time must be HH:MM, got '{}'", raw));
    let (hour, minute) = raw.split_once(':').ok_or_else(invalid)?;
    let hour: u32 = hour.trim().parse().map_err(|_| invalid())?;
    // Accept HH:MM:SS by ignoring the seconds part.
    let minute = minute.split(':').next().unwrap_or_default();
    let minute: u32 = minute.trim().parse().map_err(|_| invalid())?;
    if hour > 23 || minute > 59 {
        return Err(invalid());
    }
    Ok((hour, minute))
}

fn parse_weekday(raw: &str) -> AppResult<Weekday> {
    if let Ok(index) = raw.parse::<u32>() {
        return match index {
            0 => Ok(Weekday::Sun),
            1 => Ok(Weekday::Mon),
            2 => Ok(Weekday::Tue),
            3 => Ok(Weekday::Wed),
            4 => Ok(Weekday::Thu),
            5 => Ok(Weekday::Fri),
            6 => Ok(Weekday::Sat),
            _ => Err(AppError::MissingScheduleField(format!("weekly_day '{}' is not a weekday", raw))),
        };
    }
    raw.parse::<Weekday>()
        .map_err(|_| AppError::MissingScheduleField(format!("weekly_day '{}' is not a weekday", raw)))
}

#[cfg(test)]
mod tests {
    use super::{chronological, generate_windows, run_count, RecurrenceRule};
    use crate::errors::AppError;
    use chrono::{DateTime, Datelike, TimeZone, Utc, Weekday};

    fn at(year: i32, month: u32, day: u32, hour: u32, minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(year, month, day, hour, minute, 0).unwrap()
    }

    fn rule(frequency: &str, weekly_day: Option<&str>, monthly_day: Option<u32>) -> RecurrenceRule {
        RecurrenceRule::from_parts(frequency, Some("09:30"), weekly_day, monthly_day).expect("valid rule")
    }

    #[test]
    fn every_frequency_yields_contiguous_windows() {
        let as_of = at(2024, 5, 15, 17, 42);
        let rules = [
            rule("daily", None, None),
            rule("weekly", Some("Mon"), None),
            rule("monthly", None, Some(31)),
        ];
        for rule in &rules {
            for runs in [1usize, 2, 15, 30] {
                let windows = generate_windows(as_of, rule, runs).expect("windows");
                assert_eq!(windows.len(), runs);
                assert_eq!(windows[0].end_ts, at(2024, 5, 15, 9, 30));
                for window in &windows {
                    assert!(window.start_ts < window.end_ts);
                    assert_eq!(window.window_date, window.start_ts);
                }
                for pair in windows.windows(2) {
                    assert_eq!(pair[1].end_ts, pair[0].start_ts);
                }
            }
        }
    }

    #[test]
    fn daily_windows_step_one_day() {
        let windows = generate_windows(at(2024, 3, 1, 0, 5), &rule("daily", None, None), 2).expect("windows");
        assert_eq!(windows[0].start_ts, at(2024, 2, 29, 9, 30));
        assert_eq!(windows[0].end_ts, at(2024, 3, 1, 9, 30));
        assert_eq!(windows[1].start_ts, at(2024, 2, 28, 9, 30));
    }

    #[test]
    fn monthly_day_is_clamped_to_short_months() {
        let windows = generate_windows(at(2024, 5, 15, 12, 0), &rule("monthly", None, Some(31)), 4).expect("windows");
        // April has 30 days, March 31, February 29 in a leap year.
        assert_eq!(windows[0].start_ts, at(2024, 4, 30, 9, 30));
        assert_eq!(windows[1].start_ts, at(2024, 3, 31, 9, 30));
        assert_eq!(windows[2].start_ts, at(2024, 2, 29, 9, 30));
        assert_eq!(windows[3].start_ts, at(2024, 1, 31, 9, 30));
    }

    #[test]
    fn monthly_steps_across_year_boundary() {
        let windows = generate_windows(at(2024, 1, 10, 12, 0), &rule("monthly", None, Some(5)), 2).expect("windows");
        assert_eq!(windows[0].start_ts, at(2023, 12, 5, 9, 30));
        assert_eq!(windows[1].start_ts, at(2023, 11, 5, 9, 30));
    }

    #[test]
    fn weekly_never_steps_to_the_same_day() {
        // 2024-05-15 is a Wednesday.
        let same_day =
            generate_windows(at(2024, 5, 15, 12, 0), &rule("weekly", Some("Wed"), None), 2).expect("windows");
        assert_eq!(same_day[0].start_ts, at(2024, 5, 8, 9, 30));
        assert_eq!(same_day[1].start_ts, at(2024, 5, 1, 9, 30));

        let monday = generate_windows(at(2024, 5, 15, 12, 0), &rule("weekly", Some("1"), None), 3).expect("windows");
        assert_eq!(monday[0].start_ts, at(2024, 5, 13, 9, 30));
        assert_eq!(monday[1].start_ts, at(2024, 5, 6, 9, 30));
        for window in &monday {
            assert_eq!(window.start_ts.weekday(), Weekday::Mon);
            assert_ne!(window.start_ts.date_naive(), window.end_ts.date_naive());
        }
    }

    #[test]
    fn missing_anchor_day_is_rejected() {
        let weekly = rule("weekly", None, None);
        let err = generate_windows(at(2024, 5, 15, 12, 0), &weekly, 1).expect_err("weekly without weekday");
        assert!(matches!(err, AppError::MissingScheduleField(_)));

        let monthly = rule("monthly", None, None);
        let err = generate_windows(at(2024, 5, 15, 12, 0), &monthly, 1).expect_err("monthly without day");
        assert!(matches!(err, AppError::MissingScheduleField(_)));
    }

    #[test]
    fn unknown_frequency_is_unsupported() {
        let err = RecurrenceRule::from_parts("hourly", Some("09:30"), None, None).expect_err("unsupported");
        assert!(matches!(err, AppError::UnsupportedFrequency(_)));
        assert_eq!(run_count("hourly"), 0);
        assert_eq!(run_count("daily"), 30);
        assert_eq!(run_count("weekly"), 15);
        assert_eq!(run_count("monthly"), 15);
    }

    #[test]
    fn malformed_time_of_day_is_rejected() {
        for raw in ["", "9", "25:00", "09:61", "ab:cd"] {
            let err = RecurrenceRule::from_parts("daily", Some(raw), None, None).expect_err("bad time");
            assert!(matches!(err, AppError::MissingScheduleField(_)), "{}", raw);
        }
    }

    #[test]
    fn generation_is_deterministic_and_reversible() {
        let as_of = at(2024, 7, 4, 3, 0);
        let rule = rule("weekly", Some("Fri"), None);
        let first = generate_windows(as_of, &rule, 15).expect("windows");
        let second = generate_windows(as_of, &rule, 15).expect("windows");
        assert_eq!(first, second);

        let ordered = chronological(&first);
        assert_eq!(ordered.first(), first.last());
        assert!(ordered.windows(2).all(|pair| pair[0].end_ts == pair[1].start_ts));
    }
}
