//! Engine configuration and target-time resolution.
//!
//! A configuration is validated once, handed to the engine at start, and
//! immutable for the lifetime of the run. The bearer token lives in a
//! [`SecretString`] so it is zeroized on drop and never `Debug`-printed.

use chrono::{NaiveTime, TimeZone, Utc};
use chrono_tz::Europe::Istanbul;
use secrecy::SecretString;

use crate::error::ConfigError;
use crate::wire;

/// Hard cap on courses added per run, enforced by the SIS form.
pub const MAX_ECRN: usize = 12;
/// Server-side debounce floor; pacing below this gets requests ignored.
pub const MIN_RETRY_INTERVAL: f64 = 3.0;
/// Upper bound of the adaptive back-off applied after rate limiting.
pub const MAX_RETRY_INTERVAL: f64 = 30.0;
/// Largest accepted early-arrival grace.
pub const MAX_SAFETY_BUFFER: f64 = 0.1;
/// Attempt budget bounds.
pub const MAX_ATTEMPTS_LIMIT: u32 = 300;

/// A target moment that slipped by less than this still fires today
/// instead of rolling over to tomorrow. Covers slow process startup right
/// at the registration moment.
const PAST_TARGET_GRACE: f64 = 5.0;

#[derive(Clone, Debug)]
pub struct EngineConfig {
    pub token: SecretString,
    pub ecrn_set: Vec<String>,
    pub scrn_set: Vec<String>,
    /// Time of day in the SIS civil zone (Europe/Istanbul).
    pub target_time: NaiveTime,
    pub max_attempts: u32,
    pub retry_interval: f64,
    pub safety_buffer: f64,
    pub dry_run: bool,
    /// Opt-in: keep quota-full courses in the working set in case a seat
    /// frees up. Default is terminal.
    pub treat_full_as_retryable: bool,
    /// Run the informational NTP comparison during full calibrations.
    pub ntp_compare: bool,
    /// SIS origin; overridable for tests and staging mirrors.
    pub base_url: String,
}

impl EngineConfig {
    pub fn new(
        token: impl Into<String>,
        ecrn_set: Vec<String>,
        scrn_set: Vec<String>,
        target_time: &str,
    ) -> Result<Self, ConfigError> {
        let target_time = parse_target_time(target_time)?;
        let cfg = Self {
            token: SecretString::from(token.into()),
            ecrn_set,
            scrn_set,
            target_time,
            max_attempts: 60,
            retry_interval: MIN_RETRY_INTERVAL,
            safety_buffer: 0.005,
            dry_run: false,
            treat_full_as_retryable: false,
            ntp_compare: true,
            base_url: wire::SIS_BASE.to_string(),
        };
        cfg.validate()?;
        Ok(cfg)
    }

    /// Re-checks every invariant; call after mutating public fields.
    pub fn validate(&self) -> Result<(), ConfigError> {
        use secrecy::ExposeSecret;

        if self.token.expose_secret().is_empty() {
            return Err(ConfigError::MissingToken);
        }
        if self.ecrn_set.is_empty() && self.scrn_set.is_empty() {
            return Err(ConfigError::NoCrns);
        }
        if self.ecrn_set.len() > MAX_ECRN {
            return Err(ConfigError::TooManyCourses(self.ecrn_set.len()));
        }
        for crn in self.ecrn_set.iter().chain(self.scrn_set.iter()) {
            if crn.len() != 5 || !crn.bytes().all(|b| b.is_ascii_digit()) {
                return Err(ConfigError::InvalidCrn(crn.clone()));
            }
        }
        if self.max_attempts < 1 || self.max_attempts > MAX_ATTEMPTS_LIMIT {
            return Err(ConfigError::AttemptBudgetOutOfRange(self.max_attempts));
        }
        if self.retry_interval < MIN_RETRY_INTERVAL {
            return Err(ConfigError::RetryTooAggressive(self.retry_interval));
        }
        if !(0.0..=MAX_SAFETY_BUFFER).contains(&self.safety_buffer) {
            return Err(ConfigError::BufferOutOfRange(self.safety_buffer));
        }
        Ok(())
    }
}

/// Parses `HH:MM:SS` into a [`NaiveTime`].
pub fn parse_target_time(raw: &str) -> Result<NaiveTime, ConfigError> {
    NaiveTime::parse_from_str(raw, "%H:%M:%S")
        .map_err(|_| ConfigError::InvalidTargetTime(raw.to_string()))
}

/// Resolves a time of day to the next occurrence (as a Unix epoch) in the
/// SIS zone. A moment that passed more than a few seconds ago rolls over
/// to the next day.
pub fn resolve_target_epoch(target: NaiveTime, now_epoch: f64) -> f64 {
    let secs = now_epoch.floor() as i64;
    let nanos = ((now_epoch - secs as f64) * 1e9) as u32;
    let now_utc = Utc
        .timestamp_opt(secs, nanos)
        .single()
        .unwrap_or_else(Utc::now);
    let now_local = now_utc.with_timezone(&Istanbul);

    let mut date = now_local.date_naive();
    loop {
        // Istanbul has no DST transitions, earliest() is unambiguous.
        if let Some(candidate) = Istanbul.from_local_datetime(&date.and_time(target)).earliest() {
            let epoch = candidate.timestamp() as f64
                + f64::from(candidate.timestamp_subsec_nanos()) / 1e9;
            if epoch >= now_epoch - PAST_TARGET_GRACE {
                return epoch;
            }
        }
        date = date.succ_opt().expect("date overflow");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> EngineConfig {
        EngineConfig::new(
            "eyJ.test.token",
            vec!["24066".into()],
            vec![],
            "14:00:00",
        )
        .unwrap()
    }

    #[test]
    fn retry_floor_is_inclusive() {
        let mut cfg = base_config();
        cfg.retry_interval = 3.0;
        assert!(cfg.validate().is_ok());

        cfg.retry_interval = 2.999;
        assert_eq!(
            cfg.validate(),
            Err(ConfigError::RetryTooAggressive(2.999))
        );
    }

    #[test]
    fn ecrn_count_is_bounded() {
        let mut cfg = base_config();
        cfg.ecrn_set = (0..12).map(|i| format!("{:05}", 24000 + i)).collect();
        assert!(cfg.validate().is_ok());

        cfg.ecrn_set.push("24099".into());
        assert_eq!(cfg.validate(), Err(ConfigError::TooManyCourses(13)));
    }

    #[test]
    fn rejects_malformed_crns() {
        let mut cfg = base_config();
        cfg.ecrn_set = vec!["2406".into()];
        assert_eq!(cfg.validate(), Err(ConfigError::InvalidCrn("2406".into())));

        cfg.ecrn_set = vec!["24o66".into()];
        assert!(matches!(cfg.validate(), Err(ConfigError::InvalidCrn(_))));
    }

    #[test]
    fn rejects_empty_token_and_empty_sets() {
        assert_eq!(
            EngineConfig::new("", vec!["24066".into()], vec![], "14:00:00").unwrap_err(),
            ConfigError::MissingToken
        );
        assert_eq!(
            EngineConfig::new("tok", vec![], vec![], "14:00:00").unwrap_err(),
            ConfigError::NoCrns
        );
    }

    #[test]
    fn rejects_bad_target_time() {
        assert!(matches!(
            EngineConfig::new("tok", vec!["24066".into()], vec![], "25:99:00"),
            Err(ConfigError::InvalidTargetTime(_))
        ));
        assert!(matches!(
            EngineConfig::new("tok", vec!["24066".into()], vec![], "14:00"),
            Err(ConfigError::InvalidTargetTime(_))
        ));
    }

    #[test]
    fn buffer_and_attempts_bounds() {
        let mut cfg = base_config();
        cfg.safety_buffer = 0.1;
        assert!(cfg.validate().is_ok());
        cfg.safety_buffer = 0.11;
        assert!(matches!(cfg.validate(), Err(ConfigError::BufferOutOfRange(_))));

        let mut cfg = base_config();
        cfg.max_attempts = 300;
        assert!(cfg.validate().is_ok());
        cfg.max_attempts = 301;
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::AttemptBudgetOutOfRange(301))
        ));
        cfg.max_attempts = 0;
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::AttemptBudgetOutOfRange(0))
        ));
    }

    #[test]
    fn past_target_rolls_to_next_day() {
        let target = NaiveTime::from_hms_opt(14, 0, 0).unwrap();
        // 2026-03-02 12:00:00 Istanbul (+03:00) == 09:00:00 UTC.
        let now_epoch = Utc
            .with_ymd_and_hms(2026, 3, 2, 9, 0, 0)
            .unwrap()
            .timestamp() as f64;

        // Two hours ahead of now: same day.
        let today = resolve_target_epoch(target, now_epoch);
        assert_eq!(today - now_epoch, 2.0 * 3600.0);

        // Three hours past: next day.
        let later_epoch = now_epoch + 5.0 * 3600.0;
        let tomorrow = resolve_target_epoch(target, later_epoch);
        assert_eq!(tomorrow - today, 24.0 * 3600.0);
    }

    #[test]
    fn just_missed_target_stays_today() {
        let target = NaiveTime::from_hms_opt(14, 0, 0).unwrap();
        let at_target = Utc
            .with_ymd_and_hms(2026, 3, 2, 11, 0, 0)
            .unwrap()
            .timestamp() as f64;

        // Two seconds late still resolves to the moment that just passed.
        let resolved = resolve_target_epoch(target, at_target + 2.0);
        assert_eq!(resolved, at_target);
    }
}
