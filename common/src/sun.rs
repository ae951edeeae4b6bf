//! Sunrise / sunset calculation for the astral capture restriction.
//!
//! Implements the common "sunrise equation" (NOAA simplification) with the
//! standard 0.833° solar depression for refraction and the solar disc.
//! Accuracy is within a minute or two for non-polar latitudes, which is
//! plenty for gating a capture interval.

use chrono::{DateTime, Duration, NaiveDate, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;

/// Julian date of 1970-01-01T00:00:00Z.
const UNIX_EPOCH_JD: f64 = 2_440_587.5;
/// Julian date of the J2000.0 epoch.
const J2000: f64 = 2_451_545.0;
const OBLIQUITY_DEG: f64 = 23.4397;
const DEPRESSION_DEG: f64 = -0.833;

/// Sunrise and sunset on one local day.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SunTimes {
    pub sunrise: DateTime<Tz>,
    pub sunset: DateTime<Tz>,
}

impl SunTimes {
    /// Inclusive at both ends.
    pub fn contains(&self, t: &DateTime<Tz>) -> bool {
        *t >= self.sunrise && *t <= self.sunset
    }
}

/// Compute sunrise and sunset for `date` at the given location.
///
/// Returns `None` during polar night.  During midnight sun the whole local
/// day is returned.
pub fn sun_times(date: NaiveDate, latitude: f64, longitude: f64, tz: Tz) -> Option<SunTimes> {
    let noon_utc = date.and_time(NaiveTime::from_hms_opt(12, 0, 0)?).and_utc();
    let jd_noon = noon_utc.timestamp() as f64 / 86_400.0 + UNIX_EPOCH_JD;
    // Whole days since J2000.0, which is itself at noon UTC.
    let n = (jd_noon - J2000).round();

    // Mean solar time
    let j_star = n - longitude / 360.0;
    // Solar mean anomaly
    let m = (357.5291 + 0.985_600_28 * j_star).rem_euclid(360.0);
    let m_rad = m.to_radians();
    // Equation of the center
    let c = 1.9148 * m_rad.sin() + 0.0200 * (2.0 * m_rad).sin() + 0.0003 * (3.0 * m_rad).sin();
    // Ecliptic longitude
    let lambda = (m + c + 180.0 + 102.9372).rem_euclid(360.0);
    let lambda_rad = lambda.to_radians();
    // Solar transit
    let j_transit = J2000 + j_star + 0.0053 * m_rad.sin() - 0.0069 * (2.0 * lambda_rad).sin();
    // Declination
    let sin_decl = lambda_rad.sin() * OBLIQUITY_DEG.to_radians().sin();
    let cos_decl = sin_decl.asin().cos();

    let lat_rad = latitude.to_radians();
    let cos_omega = (DEPRESSION_DEG.to_radians().sin() - lat_rad.sin() * sin_decl)
        / (lat_rad.cos() * cos_decl);

    if cos_omega > 1.0 {
        return None;
    }
    if cos_omega < -1.0 {
        return whole_day(date, tz);
    }

    let omega_deg = cos_omega.acos().to_degrees();
    let rise = julian_to_utc(j_transit - omega_deg / 360.0)?;
    let set = julian_to_utc(j_transit + omega_deg / 360.0)?;

    Some(SunTimes {
        sunrise: rise.with_timezone(&tz),
        sunset: set.with_timezone(&tz),
    })
}

/// Format a sun event as `HH:MM`, or `--:--` when unavailable.
pub fn format_hm(t: Option<&DateTime<Tz>>) -> String {
    t.map(|t| t.format("%H:%M").to_string())
        .unwrap_or_else(|| "--:--".to_string())
}

fn julian_to_utc(jd: f64) -> Option<DateTime<Utc>> {
    let millis = ((jd - UNIX_EPOCH_JD) * 86_400_000.0).round() as i64;
    DateTime::from_timestamp_millis(millis)
}

fn whole_day(date: NaiveDate, tz: Tz) -> Option<SunTimes> {
    let start = tz.from_local_datetime(&date.and_hms_opt(0, 0, 0)?).earliest()?;
    let next = date.succ_opt()?;
    let end = tz
        .from_local_datetime(&next.and_hms_opt(0, 0, 0)?)
        .earliest()
        .map(|t| t - Duration::seconds(1))?;
    Some(SunTimes {
        sunrise: start,
        sunset: end,
    })
}
