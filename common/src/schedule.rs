//! Schedule evaluation: is capture permitted right now, and when is the
//! next instant it will be?
//!
//! Everything here is a pure function of the configuration, the current
//! instant and the previous capture anchor, so the capture loop can call
//! it every tick and tests can feed it arbitrary instants.

use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveTime, TimeZone};
use chrono_tz::Tz;
use tracing::warn;

use crate::config::Config;
use crate::sun;

/// Days searched ahead by [`next_eligible`] when no date range pushes
/// the horizon further out.
const SEARCH_HORIZON_DAYS: i64 = 31;
/// Longest DST forward jump to skip over.
const MAX_GAP_MINUTES: i64 = 180;

/// Outcome of [`decide`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Eligible,
    WaitingWindow,
    WaitingWeekday,
    WaitingDateRange,
    WaitingDaylight,
    Paused,
}

impl Decision {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Eligible => "eligible",
            Self::WaitingWindow => "waiting_window",
            Self::WaitingWeekday => "waiting_weekday",
            Self::WaitingDateRange => "waiting_date_range",
            Self::WaitingDaylight => "waiting_daylight",
            Self::Paused => "paused",
        }
    }
}

impl std::fmt::Display for Decision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── active window ────────────────────────────────────────────────────────

/// Daily time-of-day range in which capture is allowed.
///
/// `start == end` is the whole day.  `end < start` wraps past midnight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActiveWindow {
    pub start: NaiveTime,
    pub end: NaiveTime,
}

impl ActiveWindow {
    pub fn full_day() -> Self {
        let midnight = NaiveTime::MIN;
        ActiveWindow {
            start: midnight,
            end: midnight,
        }
    }

    /// Parse `HH:MM` bounds.  Anything malformed yields the full day, so a
    /// bad config never stops capture.
    pub fn parse(start: &str, end: &str) -> Self {
        let parse = |s: &str| NaiveTime::parse_from_str(s.trim(), "%H:%M");
        match (parse(start), parse(end)) {
            (Ok(start), Ok(end)) => ActiveWindow { start, end },
            _ => {
                warn!("Invalid active window {start:?}-{end:?}, capturing all day");
                Self::full_day()
            }
        }
    }

    pub fn is_full_day(&self) -> bool {
        self.start == self.end
    }

    /// `[start, end)` membership, wrapping past midnight.
    pub fn contains(&self, t: NaiveTime) -> bool {
        if self.is_full_day() {
            true
        } else if self.start < self.end {
            t >= self.start && t < self.end
        } else {
            t >= self.start || t < self.end
        }
    }
}

impl std::fmt::Display for ActiveWindow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}–{}", self.start.format("%H:%M"), self.end.format("%H:%M"))
    }
}

// ── gates ────────────────────────────────────────────────────────────────

/// Evaluate every gate except the pause flag, cheapest first.
///
/// Returns [`Decision::Eligible`] when date range, weekday, window and
/// daylight all permit capture at `now`.
pub fn calendar_gate(now: &DateTime<Tz>, cfg: &Config) -> Decision {
    let today = now.date_naive();

    if !in_date_range(today, cfg) {
        return Decision::WaitingDateRange;
    }

    if !cfg.active_days.contains(&today.weekday()) {
        return Decision::WaitingWeekday;
    }

    if !cfg.active_window.contains(now.time()) {
        return Decision::WaitingWindow;
    }

    if cfg.use_astral {
        let open = sun::sun_times(today, cfg.latitude, cfg.longitude, now.timezone())
            .map(|s| s.contains(now))
            .unwrap_or(false);
        if !open {
            return Decision::WaitingDaylight;
        }
    }

    Decision::Eligible
}

/// All five gates, pause first.
pub fn gate(now: &DateTime<Tz>, cfg: &Config) -> Decision {
    if cfg.paused {
        return Decision::Paused;
    }
    calendar_gate(now, cfg)
}

/// Decide whether a capture should happen at `now`.
///
/// `last` is the instant the interval is measured from.  Inside an open
/// window but before the interval has elapsed the result is
/// [`Decision::WaitingWindow`].
pub fn decide(now: &DateTime<Tz>, cfg: &Config, last: Option<&DateTime<Tz>>) -> Decision {
    match gate(now, cfg) {
        Decision::Eligible => {}
        other => return other,
    }
    match last {
        Some(last) if *now - *last < interval(cfg) => Decision::WaitingWindow,
        _ => Decision::Eligible,
    }
}

/// Nearest instant strictly after `now` at which all gates are open and the
/// interval since `last` has elapsed.
///
/// `None` while paused, once the date range is over, or when nothing opens
/// within the search horizon (e.g. astral restriction during polar night).
pub fn next_eligible(
    now: &DateTime<Tz>,
    cfg: &Config,
    last: Option<&DateTime<Tz>>,
) -> Option<DateTime<Tz>> {
    if cfg.paused {
        return None;
    }

    let mut floor = match last {
        Some(last) => (*last + interval(cfg)).max(*now),
        None => *now,
    };
    if floor <= *now {
        floor = *now + Duration::seconds(1);
    }

    let tz = now.timezone();
    let first_day = floor.date_naive();
    if let Some(to) = cfg.date_to {
        if to < first_day {
            return None;
        }
    }

    let mut horizon = SEARCH_HORIZON_DAYS;
    if let Some(from) = cfg.date_from {
        horizon = horizon.max((from - first_day).num_days() + 2);
    }

    // The open set is a union of intervals whose left edges are local
    // midnights, window starts or sunrises, so the earliest open instant is
    // either the floor or one of those edges.
    let mut candidates = vec![floor];
    for offset in 0..=horizon {
        let Some(day) = first_day.checked_add_signed(Duration::days(offset)) else {
            break;
        };
        if !day_may_open(day, cfg) {
            continue;
        }
        candidates.extend(local(tz, day, NaiveTime::MIN));
        if !cfg.active_window.is_full_day() {
            candidates.extend(local(tz, day, cfg.active_window.start));
        }
        if cfg.use_astral {
            if let Some(s) = sun::sun_times(day, cfg.latitude, cfg.longitude, tz) {
                candidates.push(s.sunrise);
            }
        }
    }

    candidates.retain(|c| *c >= floor);
    candidates.sort();
    candidates.dedup();
    candidates
        .into_iter()
        .find(|c| gate(c, cfg) == Decision::Eligible)
}

fn interval(cfg: &Config) -> Duration {
    Duration::seconds(cfg.interval_secs.max(1) as i64)
}

fn in_date_range(day: NaiveDate, cfg: &Config) -> bool {
    if let Some(from) = cfg.date_from {
        if day < from {
            return false;
        }
    }
    if let Some(to) = cfg.date_to {
        if day > to {
            return false;
        }
    }
    true
}

fn day_may_open(day: NaiveDate, cfg: &Config) -> bool {
    in_date_range(day, cfg) && cfg.active_days.contains(&day.weekday())
}

/// Wall-clock time to an instant.  A time skipped by a DST jump maps to
/// the first instant after the gap.
fn local(tz: Tz, day: NaiveDate, time: NaiveTime) -> Option<DateTime<Tz>> {
    let naive = day.and_time(time);
    (0..=MAX_GAP_MINUTES)
        .find_map(|m| tz.from_local_datetime(&(naive + Duration::minutes(m))).earliest())
}

// ─── tests ───────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Weekday;
    use chrono_tz::Europe::Berlin;

    /// 2024-06-03 is a Monday.
    fn at(day: u32, h: u32, m: u32) -> DateTime<Tz> {
        Berlin.with_ymd_and_hms(2024, 6, day, h, m, 0).unwrap()
    }

    fn office_hours() -> Config {
        Config {
            interval_secs: 60,
            active_window: ActiveWindow::parse("08:00", "18:00"),
            timezone: Berlin,
            ..Config::default()
        }
    }

    #[test]
    fn test_window_contains() {
        let w = ActiveWindow::parse("08:00", "18:00");
        let t = |h, m| NaiveTime::from_hms_opt(h, m, 0).unwrap();
        assert!(w.contains(t(8, 0)));
        assert!(w.contains(t(17, 59)));
        assert!(!w.contains(t(18, 0)));
        assert!(!w.contains(t(7, 59)));

        let night = ActiveWindow::parse("22:00", "06:00");
        assert!(night.contains(t(23, 0)));
        assert!(night.contains(t(2, 0)));
        assert!(!night.contains(t(6, 0)));
        assert!(!night.contains(t(12, 0)));
    }

    #[test]
    fn test_equal_bounds_is_full_day() {
        let w = ActiveWindow::parse("07:30", "07:30");
        assert!(w.is_full_day());
        for h in 0..24 {
            assert!(w.contains(NaiveTime::from_hms_opt(h, 15, 0).unwrap()));
        }

        let cfg = Config {
            active_window: w,
            timezone: Berlin,
            ..Config::default()
        };
        for day in 3..10 {
            assert_eq!(decide(&at(day, 3, 0), &cfg, None), Decision::Eligible);
        }
    }

    #[test]
    fn test_full_day_window_independent_of_astral() {
        let cfg = Config {
            active_window: ActiveWindow::full_day(),
            timezone: Berlin,
            use_astral: true,
            ..Config::default()
        };
        // The window gate itself never closes; only daylight does.
        assert_eq!(decide(&at(3, 1, 0), &cfg, None), Decision::WaitingDaylight);
        assert_eq!(decide(&at(3, 12, 0), &cfg, None), Decision::Eligible);
    }

    #[test]
    fn test_malformed_window_falls_back_to_full_day() {
        let w = ActiveWindow::parse("25:99", "18:00");
        assert!(w.is_full_day());
    }

    #[test]
    fn test_each_gate_reports_its_code() {
        let base = office_hours();
        let now = at(3, 9, 0);
        assert_eq!(decide(&now, &base, None), Decision::Eligible);

        let paused = Config { paused: true, ..base.clone() };
        assert_eq!(decide(&now, &paused, None), Decision::Paused);

        let dated = Config {
            date_from: NaiveDate::from_ymd_opt(2024, 6, 4),
            ..base.clone()
        };
        assert_eq!(decide(&now, &dated, None), Decision::WaitingDateRange);

        let weekend = Config {
            active_days: vec![Weekday::Sat, Weekday::Sun],
            ..base.clone()
        };
        assert_eq!(decide(&now, &weekend, None), Decision::WaitingWeekday);

        assert_eq!(decide(&at(3, 7, 0), &base, None), Decision::WaitingWindow);

        let astral = Config { use_astral: true, ..base.clone() };
        assert_eq!(decide(&at(3, 9, 0), &astral, None), Decision::Eligible);
        let early = Config {
            active_window: ActiveWindow::parse("03:00", "18:00"),
            use_astral: true,
            ..base.clone()
        };
        assert_eq!(decide(&at(3, 3, 30), &early, None), Decision::WaitingDaylight);
    }

    #[test]
    fn test_date_range_is_inclusive() {
        let cfg = Config {
            date_from: NaiveDate::from_ymd_opt(2024, 6, 3),
            date_to: NaiveDate::from_ymd_opt(2024, 6, 3),
            ..office_hours()
        };
        assert_eq!(decide(&at(3, 9, 0), &cfg, None), Decision::Eligible);
        assert_eq!(decide(&at(4, 9, 0), &cfg, None), Decision::WaitingDateRange);
    }

    #[test]
    fn test_interval_not_elapsed() {
        let cfg = office_hours();
        let last = at(3, 9, 0);
        let now = last + Duration::seconds(30);
        assert_eq!(decide(&now, &cfg, Some(&last)), Decision::WaitingWindow);
        assert_eq!(next_eligible(&now, &cfg, Some(&last)), Some(at(3, 9, 1)));

        let later = last + Duration::seconds(60);
        assert_eq!(decide(&later, &cfg, Some(&last)), Decision::Eligible);
    }

    #[test]
    fn test_monday_morning_capture_then_next_minute() {
        let cfg = office_hours();
        let now = at(3, 9, 0);
        assert_eq!(decide(&now, &cfg, None), Decision::Eligible);
        assert_eq!(next_eligible(&now, &cfg, Some(&now)), Some(at(3, 9, 1)));
    }

    #[test]
    fn test_monday_evening_waits_for_tuesday() {
        let cfg = office_hours();
        let now = at(3, 20, 0);
        assert_eq!(decide(&now, &cfg, None), Decision::WaitingWindow);
        assert_eq!(next_eligible(&now, &cfg, None), Some(at(4, 8, 0)));

        let no_tuesday = Config {
            active_days: vec![Weekday::Mon, Weekday::Wed],
            ..cfg
        };
        assert_eq!(next_eligible(&now, &no_tuesday, None), Some(at(5, 8, 0)));
    }

    #[test]
    fn test_next_eligible_before_window_today() {
        let cfg = office_hours();
        assert_eq!(next_eligible(&at(3, 6, 30), &cfg, None), Some(at(3, 8, 0)));
    }

    #[test]
    fn test_next_eligible_wrapping_window() {
        let cfg = Config {
            active_window: ActiveWindow::parse("22:00", "06:00"),
            ..office_hours()
        };
        assert_eq!(next_eligible(&at(3, 12, 0), &cfg, None), Some(at(3, 22, 0)));
        // 05:59 is still inside the window that started the night before.
        let last = at(4, 5, 58);
        assert_eq!(next_eligible(&at(4, 5, 58), &cfg, Some(&last)), Some(at(4, 5, 59)));
        // After 06:00 the next slot is tonight.
        let last = at(4, 5, 59);
        assert_eq!(next_eligible(&at(4, 5, 59), &cfg, Some(&last)), Some(at(4, 22, 0)));
    }

    #[test]
    fn test_next_eligible_window_start_inside_dst_gap() {
        // Berlin skips 02:00–03:00 on 2024-03-31.
        let cfg = Config {
            interval_secs: 60,
            active_window: ActiveWindow::parse("02:30", "05:00"),
            timezone: Berlin,
            ..Config::default()
        };
        let now = Berlin.with_ymd_and_hms(2024, 3, 31, 0, 30, 0).unwrap();
        let gap_end = Berlin.with_ymd_and_hms(2024, 3, 31, 3, 0, 0).unwrap();
        assert_eq!(gate(&gap_end, &cfg), Decision::Eligible);
        assert_eq!(next_eligible(&now, &cfg, None), Some(gap_end));
    }

    #[test]
    fn test_next_eligible_respects_date_range() {
        let cfg = Config {
            date_from: NaiveDate::from_ymd_opt(2024, 9, 1),
            ..office_hours()
        };
        // Far beyond the default horizon; all days active, so it opens on the first day.
        let next = next_eligible(&at(3, 9, 0), &cfg, None).unwrap();
        assert_eq!(next, Berlin.with_ymd_and_hms(2024, 9, 1, 8, 0, 0).unwrap());

        let ended = Config {
            date_to: NaiveDate::from_ymd_opt(2024, 6, 2),
            ..office_hours()
        };
        assert_eq!(next_eligible(&at(3, 9, 0), &ended, None), None);
    }

    #[test]
    fn test_next_eligible_with_astral_starts_at_sunrise() {
        let cfg = Config {
            active_window: ActiveWindow::full_day(),
            use_astral: true,
            ..office_hours()
        };
        let now = at(3, 23, 0);
        let next = next_eligible(&now, &cfg, None).unwrap();
        let sunrise = sun::sun_times(
            NaiveDate::from_ymd_opt(2024, 6, 4).unwrap(),
            cfg.latitude,
            cfg.longitude,
            Berlin,
        )
        .unwrap()
        .sunrise;
        assert_eq!(next, sunrise);
    }

    #[test]
    fn test_next_eligible_none_when_paused() {
        let cfg = Config { paused: true, ..office_hours() };
        assert_eq!(next_eligible(&at(3, 9, 0), &cfg, None), None);
    }

    #[test]
    fn test_next_eligible_deterministic_and_in_future() {
        let cfg = office_hours();
        for (day, h, m) in [(3, 9, 0), (3, 17, 59), (3, 18, 0), (8, 12, 0), (9, 23, 59)] {
            let now = at(day, h, m);
            let a = next_eligible(&now, &cfg, None).unwrap();
            let b = next_eligible(&now, &cfg, None).unwrap();
            assert_eq!(a, b);
            assert!(a > now);
            assert_eq!(gate(&a, &cfg), Decision::Eligible);
        }
    }
}
