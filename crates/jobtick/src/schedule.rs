//! Next-run computation from cron expressions, earliest-start bounds and
//! jitter windows.

use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use cron::Schedule as CronSchedule;
use rand::Rng;
use tracing::warn;

/// When a definition should run.
///
/// A schedule combines an optional cron expression, an optional
/// earliest-start instant and an optional jitter window. Without a cron
/// expression the schedule is one-shot: it fires once at the earliest-start
/// instant (or immediately when none is set) and is exhausted afterwards.
///
/// Construction never fails. An expression the cron parser rejects, or one
/// with no future occurrence, silently degrades the schedule to its
/// one-shot form.
///
/// The initial next-run time is computed with the epoch floor as the
/// reference instant, so a freshly built cron schedule is due immediately;
/// call [`update_next_run_time`](Schedule::update_next_run_time) with the
/// current instant to wait for the next cron occurrence instead.
#[derive(Debug, Clone)]
pub struct Schedule {
    cron: Option<CronSchedule>,
    expression: Option<String>,
    earliest_start: Option<DateTime<Utc>>,
    jitter: Option<Duration>,
    next_run_time: Option<DateTime<Utc>>,
    last_run_time: Option<DateTime<Utc>>,
}

impl Schedule {
    /// Create a schedule from its parts.
    pub fn new(
        expression: Option<&str>,
        earliest_start: Option<DateTime<Utc>>,
        jitter: Option<Duration>,
    ) -> Self {
        let mut schedule = Self {
            cron: expression.and_then(parse_expression),
            expression: expression.map(str::to_owned),
            earliest_start,
            jitter,
            next_run_time: None,
            last_run_time: None,
        };
        schedule.update_next_run_time(DateTime::UNIX_EPOCH);
        schedule
    }

    /// Recurring schedule from a cron expression.
    pub fn cron(expression: &str) -> Self {
        Self::new(Some(expression), None, None)
    }

    /// One-shot schedule firing at the given instant.
    pub fn one_shot(at: DateTime<Utc>) -> Self {
        Self::new(None, Some(at), None)
    }

    /// One-shot schedule firing on the next dispatch tick.
    pub fn immediate() -> Self {
        Self::new(None, None, None)
    }

    /// Do not schedule before the given instant, whatever the cron
    /// expression says.
    pub fn with_earliest_start(mut self, at: DateTime<Utc>) -> Self {
        self.earliest_start = Some(at);
        self.update_next_run_time(DateTime::UNIX_EPOCH);
        self
    }

    /// Offset every computed next-run time by a uniform random amount in
    /// `[-jitter, +jitter]`.
    pub fn with_jitter(mut self, jitter: Duration) -> Self {
        self.jitter = Some(jitter);
        self.update_next_run_time(DateTime::UNIX_EPOCH);
        self
    }

    /// The raw cron expression, kept even when the parser rejected it.
    pub fn cron_expression(&self) -> Option<&str> {
        self.expression.as_deref()
    }

    /// Whether a parsed cron expression drives this schedule.
    pub fn has_cron(&self) -> bool {
        self.cron.is_some()
    }

    pub fn earliest_start(&self) -> Option<DateTime<Utc>> {
        self.earliest_start
    }

    pub fn jitter(&self) -> Option<Duration> {
        self.jitter
    }

    pub fn next_run_time(&self) -> Option<DateTime<Utc>> {
        self.next_run_time
    }

    pub fn last_run_time(&self) -> Option<DateTime<Utc>> {
        self.last_run_time
    }

    /// An exhausted schedule never fires again.
    pub fn is_exhausted(&self) -> bool {
        self.next_run_time.is_none()
    }

    /// Record the start of a run. `Some` recomputes the next-run time with
    /// the given instant as the reference; `None` clears the field and
    /// leaves the next-run time untouched.
    pub fn set_last_run_time(&mut self, instant: Option<DateTime<Utc>>) {
        self.last_run_time = instant;
        if let Some(reference) = instant {
            self.update_next_run_time(reference);
        }
    }

    /// Recompute the next-run time relative to `reference`.
    ///
    /// With a cron expression the result is the first occurrence strictly
    /// after `reference`, clamped up to the earliest-start instant. Without
    /// one the schedule fires at the earliest-start instant until it has
    /// run once. The jitter offset, when configured, is drawn fresh on
    /// every recomputation; callers must not assume monotonicity across
    /// calls. A negative draw may land below the earliest-start instant,
    /// in which case the run fires immediately once due.
    pub fn update_next_run_time(&mut self, reference: DateTime<Utc>) {
        let base = match &self.cron {
            Some(cron) => match cron.after(&reference).next() {
                Some(next) => Some(self.clamp_to_earliest(next)),
                None => self.one_shot_next(),
            },
            None => self.one_shot_next(),
        };
        self.next_run_time = base.map(|instant| self.apply_jitter(instant));
    }

    fn one_shot_next(&self) -> Option<DateTime<Utc>> {
        if self.last_run_time.is_some() {
            None
        } else {
            Some(self.earliest_start.unwrap_or(DateTime::UNIX_EPOCH))
        }
    }

    fn clamp_to_earliest(&self, instant: DateTime<Utc>) -> DateTime<Utc> {
        match self.earliest_start {
            Some(earliest) if earliest > instant => earliest,
            _ => instant,
        }
    }

    fn apply_jitter(&self, instant: DateTime<Utc>) -> DateTime<Utc> {
        let Some(jitter) = self.jitter else {
            return instant;
        };
        let span = jitter.as_millis().min(i64::MAX as u128) as i64;
        if span == 0 {
            return instant;
        }
        let offset = rand::thread_rng().gen_range(-span..=span);
        instant + chrono::Duration::milliseconds(offset)
    }
}

/// Parse a cron expression, accepting both the 5-field form (minute, hour,
/// day-of-month, month, day-of-week) and the 6-field form with a leading
/// seconds field.
fn parse_expression(expression: &str) -> Option<CronSchedule> {
    let trimmed = expression.trim();
    let normalized = if trimmed.split_whitespace().count() == 5 {
        format!("0 {trimmed}")
    } else {
        trimmed.to_owned()
    };
    match CronSchedule::from_str(&normalized) {
        Ok(schedule) => Some(schedule),
        Err(error) => {
            warn!("invalid cron expression {expression:?}, scheduling as one-shot: {error}");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(hour: u32, minute: u32, second: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 10, hour, minute, second)
            .unwrap()
    }

    #[test]
    fn immediate_schedules_fire_at_the_epoch_floor() {
        let schedule = Schedule::immediate();
        assert!(!schedule.has_cron());
        assert_eq!(schedule.next_run_time(), Some(DateTime::UNIX_EPOCH));
        assert_eq!(schedule.last_run_time(), None);
    }

    #[test]
    fn one_shot_fires_at_the_earliest_start() {
        let start = at(9, 30, 0);
        let schedule = Schedule::one_shot(start);
        assert_eq!(schedule.next_run_time(), Some(start));
    }

    #[test]
    fn one_shot_is_exhausted_after_the_first_run() {
        let mut schedule = Schedule::one_shot(at(9, 30, 0));
        schedule.set_last_run_time(Some(at(9, 30, 1)));
        assert!(schedule.is_exhausted());
        assert_eq!(schedule.next_run_time(), None);
    }

    #[test]
    fn cron_next_run_follows_the_reference() {
        let mut schedule = Schedule::cron("0 * * * * *");
        let reference = at(12, 0, 30);
        schedule.update_next_run_time(reference);

        let expected = CronSchedule::from_str("0 * * * * *")
            .unwrap()
            .after(&reference)
            .next()
            .unwrap();
        assert_eq!(schedule.next_run_time(), Some(expected));
        assert_eq!(expected, at(12, 1, 0));
    }

    #[test]
    fn assigning_last_run_recomputes_from_that_instant() {
        let mut schedule = Schedule::cron("0 * * * * *");
        schedule.set_last_run_time(Some(at(12, 0, 30)));
        assert_eq!(schedule.last_run_time(), Some(at(12, 0, 30)));
        assert_eq!(schedule.next_run_time(), Some(at(12, 1, 0)));
    }

    #[test]
    fn clearing_last_run_does_not_recompute() {
        let mut schedule = Schedule::cron("0 * * * * *");
        schedule.set_last_run_time(Some(at(12, 0, 30)));
        let next = schedule.next_run_time();

        schedule.set_last_run_time(None);
        assert_eq!(schedule.last_run_time(), None);
        assert_eq!(schedule.next_run_time(), next);
    }

    #[test]
    fn five_field_expressions_are_accepted() {
        let mut schedule = Schedule::cron("*/5 * * * *");
        assert!(schedule.has_cron());

        schedule.update_next_run_time(at(12, 3, 10));
        assert_eq!(schedule.next_run_time(), Some(at(12, 5, 0)));
    }

    #[test]
    fn rejected_expressions_degrade_to_one_shot() {
        let start = at(8, 0, 0);
        let schedule = Schedule::new(Some("not a cron"), Some(start), None);
        assert!(!schedule.has_cron());
        assert_eq!(schedule.cron_expression(), Some("not a cron"));
        assert_eq!(schedule.next_run_time(), Some(start));
    }

    #[test]
    fn earliest_start_clamps_the_cron_occurrence() {
        let earliest = at(15, 0, 0);
        let mut schedule = Schedule::new(Some("0 * * * * *"), Some(earliest), None);
        schedule.update_next_run_time(at(12, 0, 30));
        assert_eq!(schedule.next_run_time(), Some(earliest));
    }

    #[test]
    fn jitter_stays_within_the_window() {
        let jitter = Duration::from_secs(30);
        let reference = at(12, 0, 30);
        let base = CronSchedule::from_str("0 0 * * * *")
            .unwrap()
            .after(&reference)
            .next()
            .unwrap();

        let mut schedule = Schedule::new(Some("0 0 * * * *"), None, Some(jitter));
        for _ in 0..50 {
            schedule.update_next_run_time(reference);
            let next = schedule.next_run_time().unwrap();
            let offset = (next - base).num_milliseconds().abs();
            assert!(offset <= 30_000, "offset {offset}ms exceeds the window");
        }
    }

    #[test]
    fn zero_jitter_is_a_no_op() {
        let mut schedule = Schedule::cron("0 * * * * *").with_jitter(Duration::ZERO);
        schedule.update_next_run_time(at(12, 0, 30));
        assert_eq!(schedule.next_run_time(), Some(at(12, 1, 0)));
    }
}
