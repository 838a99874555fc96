use std::fmt;

use chrono::{DateTime, Datelike, Duration, TimeZone, Utc, Weekday};
use mole_core::ScheduleFrequency;
use serde::{Deserialize, Serialize};

/// Hour (UTC) at which daily and weekly syncs run.
const NIGHTLY_HOUR: u8 = 2;
const HOURLY_SECS: u64 = 3600;

/// When a job fires.
///
/// Equality is structural: two `Interval`s are equal iff their periods are
/// equal, two `Cron`s iff day-of-week, hour and minute all match, and
/// different variants are never equal. The reconciler relies on this to
/// avoid rescheduling unchanged jobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Trigger {
    /// Fire every `period_secs` seconds.
    Interval { period_secs: u64 },

    /// Fire at HH:MM UTC, every day or only on `day_of_week`.
    Cron {
        day_of_week: Option<Weekday>,
        hour: u8,
        minute: u8,
    },
}

impl Trigger {
    /// Trigger for a task schedule. `None` for `never` and for unsupported
    /// frequencies.
    pub fn for_frequency(frequency: &ScheduleFrequency) -> Option<Trigger> {
        match frequency {
            ScheduleFrequency::Hourly => Some(Trigger::Interval {
                period_secs: HOURLY_SECS,
            }),
            ScheduleFrequency::Daily => Some(Trigger::Cron {
                day_of_week: None,
                hour: NIGHTLY_HOUR,
                minute: 0,
            }),
            ScheduleFrequency::Weekly => Some(Trigger::Cron {
                day_of_week: Some(Weekday::Mon),
                hour: NIGHTLY_HOUR,
                minute: 0,
            }),
            ScheduleFrequency::Never | ScheduleFrequency::Unsupported(_) => None,
        }
    }

    /// Next UTC fire time strictly after `from`.
    ///
    /// Returns `None` when the trigger can never fire (zero period, hour or
    /// minute out of range).
    pub fn next_fire_after(&self, from: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match *self {
            Trigger::Interval { period_secs } => {
                if period_secs == 0 {
                    return None;
                }
                Some(from + Duration::seconds(i64::try_from(period_secs).ok()?))
            }

            Trigger::Cron {
                day_of_week,
                hour,
                minute,
            } => {
                // Today's candidate at HH:MM:00 UTC.
                let today = Utc
                    .with_ymd_and_hms(
                        from.year(),
                        from.month(),
                        from.day(),
                        u32::from(hour),
                        u32::from(minute),
                        0,
                    )
                    .single()?;

                match day_of_week {
                    None => {
                        if today > from {
                            Some(today)
                        } else {
                            Some(today + Duration::days(1))
                        }
                    }
                    Some(dow) => {
                        let days_ahead = (i64::from(dow.num_days_from_monday())
                            - i64::from(from.weekday().num_days_from_monday()))
                        .rem_euclid(7);
                        let candidate = today + Duration::days(days_ahead);
                        if candidate > from {
                            Some(candidate)
                        } else {
                            // Same weekday, time already passed.
                            Some(candidate + Duration::days(7))
                        }
                    }
                }
            }
        }
    }
}

impl fmt::Display for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Trigger::Interval { period_secs } => write!(f, "interval[{period_secs}s]"),
            Trigger::Cron {
                day_of_week: Some(dow),
                hour,
                minute,
            } => write!(f, "cron[{dow} {hour:02}:{minute:02} UTC]"),
            Trigger::Cron {
                day_of_week: None,
                hour,
                minute,
            } => write!(f, "cron[daily {hour:02}:{minute:02} UTC]"),
        }
    }
}
