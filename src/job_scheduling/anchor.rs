//! Daily anchor time for recurring library syncs

use chrono::{DateTime, Duration, NaiveTime, Timelike, Utc};
use chrono_tz::Tz;
use cron::Schedule;
use std::str::FromStr;

use crate::config::SchedulingConfig;
use crate::errors::JobSchedulingError;

/// Fixed local time-of-day every recurring sync fires at
#[derive(Debug, Clone)]
pub struct SyncAnchor {
    hour: u32,
    minute: u32,
    timezone: Tz,
    schedule: Schedule,
}

impl SyncAnchor {
    pub fn new(hour: u32, minute: u32, timezone: Tz) -> Result<Self, JobSchedulingError> {
        if hour > 23 || minute > 59 {
            return Err(JobSchedulingError::InvalidSchedule {
                reason: format!("anchor {hour:02}:{minute:02} is not a time of day"),
            });
        }

        let expression = format!("0 {minute} {hour} * * *");
        let schedule =
            Schedule::from_str(&expression).map_err(|e| JobSchedulingError::InvalidSchedule {
                reason: format!("cron expression '{expression}': {e}"),
            })?;

        Ok(Self {
            hour,
            minute,
            timezone,
            schedule,
        })
    }

    pub fn from_config(config: &SchedulingConfig) -> Result<Self, JobSchedulingError> {
        let time = NaiveTime::parse_from_str(config.anchor_time.trim(), "%H:%M").map_err(|e| {
            JobSchedulingError::InvalidSchedule {
                reason: format!("anchor_time '{}': {}", config.anchor_time, e),
            }
        })?;
        let timezone: Tz =
            config
                .timezone
                .parse()
                .map_err(|e| JobSchedulingError::InvalidSchedule {
                    reason: format!("timezone '{}': {}", config.timezone, e),
                })?;

        Self::new(time.hour(), time.minute(), timezone)
    }

    /// First anchor occurrence strictly after `now`.
    ///
    /// Before today's anchor this is today's; at or after it, tomorrow's.
    pub fn next_after(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        self.schedule
            .after(&now.with_timezone(&self.timezone))
            .next()
            .map(|next| next.with_timezone(&Utc))
            .unwrap_or_else(|| now + Duration::days(1))
    }

    pub fn timezone(&self) -> Tz {
        self.timezone
    }
}

impl std::fmt::Display for SyncAnchor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:02}:{:02} {}", self.hour, self.minute, self.timezone)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn utc(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    fn tokyo_anchor() -> SyncAnchor {
        SyncAnchor::from_config(&SchedulingConfig::default()).unwrap()
    }

    // 03:00 Asia/Tokyo is 18:00 UTC on the previous day
    #[rstest]
    #[case("2024-05-01T17:00:00Z", "2024-05-01T18:00:00Z")]
    #[case("2024-05-01T17:59:59Z", "2024-05-01T18:00:00Z")]
    #[case("2024-05-01T18:00:00Z", "2024-05-02T18:00:00Z")]
    #[case("2024-05-01T18:00:00.500Z", "2024-05-02T18:00:00Z")]
    #[case("2024-05-01T23:30:00Z", "2024-05-02T18:00:00Z")]
    fn next_anchor_after(#[case] now: &str, #[case] expected: &str) {
        assert_eq!(tokyo_anchor().next_after(utc(now)), utc(expected));
    }

    #[test]
    fn consecutive_runs_are_a_day_apart() {
        let anchor = tokyo_anchor();
        let first = anchor.next_after(utc("2024-01-10T00:00:00Z"));
        let second = anchor.next_after(first);
        assert_eq!(second - first, Duration::hours(24));
    }

    #[rstest]
    #[case("25:00", "Asia/Tokyo")]
    #[case("3am", "Asia/Tokyo")]
    #[case("03:00", "Mars/Olympus_Mons")]
    fn invalid_configuration_is_rejected(#[case] anchor_time: &str, #[case] timezone: &str) {
        let config = SchedulingConfig {
            anchor_time: anchor_time.to_string(),
            timezone: timezone.to_string(),
            ..SchedulingConfig::default()
        };
        assert!(matches!(
            SyncAnchor::from_config(&config),
            Err(JobSchedulingError::InvalidSchedule { .. })
        ));
    }

    #[test]
    fn display_names_time_and_zone() {
        assert_eq!(tokyo_anchor().to_string(), "03:00 Asia/Tokyo");
    }
}
