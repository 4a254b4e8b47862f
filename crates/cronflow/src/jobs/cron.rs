//! Five-field cron expressions evaluated at minute granularity.
//!
//! Fields: minute (0-59), hour (0-23), day-of-month (1-31), month (1-12),
//! day-of-week (0-6, 0 = Sunday). Each field accepts `*`, `*/n`, `a-b`,
//! single values and comma-separated lists of those. All five fields must
//! match for a minute to fire.

use chrono::{DateTime, Datelike, Duration, TimeZone, Timelike, Utc};
use chrono_tz::Tz;
use std::str::FromStr;
use thiserror::Error;

/// Search horizon for [`CronSchedule::next_after`].
const HORIZON_DAYS: i64 = 366;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CronError {
    #[error("cron expression must have 5 fields, got {0}")]
    FieldCount(usize),

    #[error("invalid {field} field {value:?}: {reason}")]
    Field {
        field: &'static str,
        value: String,
        reason: String,
    },

    #[error("unknown timezone {0:?}")]
    Timezone(String),

    #[error("cron expression {0:?} never fires within one year")]
    NoMatch(String),
}

struct FieldSpec {
    name: &'static str,
    min: u32,
    max: u32,
}

const FIELDS: [FieldSpec; 5] = [
    FieldSpec { name: "minute", min: 0, max: 59 },
    FieldSpec { name: "hour", min: 0, max: 23 },
    FieldSpec { name: "day-of-month", min: 1, max: 31 },
    FieldSpec { name: "month", min: 1, max: 12 },
    FieldSpec { name: "day-of-week", min: 0, max: 6 },
];

/// A parsed expression. Each field is a bitmask of allowed values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronSchedule {
    source: String,
    minutes: u64,
    hours: u64,
    days_of_month: u64,
    months: u64,
    days_of_week: u64,
}

impl CronSchedule {
    pub fn parse(expression: &str) -> Result<Self, CronError> {
        let parts: Vec<&str> = expression.split_whitespace().collect();
        if parts.len() != FIELDS.len() {
            return Err(CronError::FieldCount(parts.len()));
        }

        let mut masks = [0u64; 5];
        for (i, (raw, spec)) in parts.iter().zip(FIELDS.iter()).enumerate() {
            masks[i] = parse_field(spec, raw)?;
        }

        Ok(Self {
            source: parts.join(" "),
            minutes: masks[0],
            hours: masks[1],
            days_of_month: masks[2],
            months: masks[3],
            days_of_week: masks[4],
        })
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    fn date_matches(&self, local: &DateTime<Tz>) -> bool {
        bit(self.days_of_month, local.day())
            && bit(self.months, local.month())
            && bit(self.days_of_week, local.weekday().num_days_from_sunday())
    }

    pub fn matches(&self, local: &DateTime<Tz>) -> bool {
        self.date_matches(local)
            && bit(self.hours, local.hour())
            && bit(self.minutes, local.minute())
    }

    /// First matching minute strictly after `after`, as seen in `tz`.
    ///
    /// Scans forward minute by minute from the next whole minute. Whole days
    /// and hours that cannot match are skipped, which gives the same result as
    /// a plain scan.
    pub fn next_after(&self, tz: &Tz, after: DateTime<Utc>) -> Result<DateTime<Utc>, CronError> {
        let secs = after.timestamp();
        let start = secs - secs.rem_euclid(60) + 60;
        let mut t = DateTime::<Utc>::from_timestamp(start, 0)
            .ok_or_else(|| CronError::NoMatch(self.source.clone()))?;
        let limit = after + Duration::days(HORIZON_DAYS);

        while t <= limit {
            let local = t.with_timezone(tz);

            if !self.date_matches(&local) {
                t = next_local_midnight(tz, &local)
                    .filter(|next| *next > t)
                    .unwrap_or(t + Duration::minutes(1));
                continue;
            }

            if !bit(self.hours, local.hour()) {
                t += Duration::minutes(i64::from(60 - local.minute()));
                continue;
            }

            if bit(self.minutes, local.minute()) {
                return Ok(t);
            }

            t += Duration::minutes(1);
        }

        Err(CronError::NoMatch(self.source.clone()))
    }
}

impl FromStr for CronSchedule {
    type Err = CronError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

pub fn parse_timezone(timezone: &str) -> Result<Tz, CronError> {
    timezone
        .trim()
        .parse::<Tz>()
        .map_err(|_| CronError::Timezone(timezone.to_string()))
}

/// Parse `expression`, resolve `timezone`, and return the next fire instant after `after`.
pub fn next_cron_time(
    expression: &str,
    timezone: &str,
    after: DateTime<Utc>,
) -> Result<DateTime<Utc>, CronError> {
    let schedule = CronSchedule::parse(expression)?;
    let tz = parse_timezone(timezone)?;
    schedule.next_after(&tz, after)
}

fn bit(mask: u64, value: u32) -> bool {
    mask & (1u64 << value) != 0
}

fn next_local_midnight(tz: &Tz, local: &DateTime<Tz>) -> Option<DateTime<Utc>> {
    let next_day = local.date_naive().succ_opt()?;
    let midnight = next_day.and_hms_opt(0, 0, 0)?;
    tz.from_local_datetime(&midnight)
        .earliest()
        .map(|d| d.with_timezone(&Utc))
}

fn parse_field(spec: &FieldSpec, raw: &str) -> Result<u64, CronError> {
    let err = |reason: String| CronError::Field {
        field: spec.name,
        value: raw.to_string(),
        reason,
    };

    let mut mask = 0u64;
    for item in raw.split(',') {
        if item.is_empty() {
            return Err(err("empty list item".into()));
        }

        if item == "*" {
            for v in spec.min..=spec.max {
                mask |= 1 << v;
            }
        } else if let Some(step) = item.strip_prefix("*/") {
            let n: u32 = step
                .parse()
                .map_err(|_| err(format!("step {step:?} is not a number")))?;
            if n == 0 {
                return Err(err("step must be at least 1".into()));
            }
            for v in (spec.min..=spec.max).step_by(n as usize) {
                mask |= 1 << v;
            }
        } else if let Some((lo, hi)) = item.split_once('-') {
            let lo = parse_value(spec, lo).map_err(&err)?;
            let hi = parse_value(spec, hi).map_err(&err)?;
            if lo > hi {
                return Err(err(format!("range start {lo} is after end {hi}")));
            }
            for v in lo..=hi {
                mask |= 1 << v;
            }
        } else {
            let v = parse_value(spec, item).map_err(&err)?;
            mask |= 1 << v;
        }
    }

    Ok(mask)
}

fn parse_value(spec: &FieldSpec, s: &str) -> Result<u32, String> {
    let v: u32 = s
        .parse()
        .map_err(|_| format!("{s:?} is not a number"))?;
    if v < spec.min || v > spec.max {
        return Err(format!("{v} is outside {}-{}", spec.min, spec.max));
    }
    Ok(v)
}
