use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use chrono_tz::Tz;
use cron::Schedule;

use crate::{
    clock::Clock,
    error::{Result, SchedulerError},
    jitter::JitterSource,
    types::JobDefinition,
};

/// Parse a cron expression.
///
/// Accepts the classic five-field form (seconds implied as `0`), the
/// six/seven-field form with seconds and years, and `@hourly`-style
/// shorthands.
pub fn parse_expression(expr: &str) -> Result<Schedule> {
    let trimmed = expr.trim();
    let normalized = if !trimmed.starts_with('@') && trimmed.split_whitespace().count() == 5 {
        format!("0 {trimmed}")
    } else {
        trimmed.to_string()
    };
    Schedule::from_str(&normalized)
        .map_err(|e| SchedulerError::InvalidSchedule(format!("{expr}: {e}")))
}

/// Parse an IANA timezone name.
pub fn parse_timezone(tz: &str) -> Result<Tz> {
    tz.parse::<Tz>()
        .map_err(|_| SchedulerError::InvalidTimezone(tz.to_string()))
}

/// Maps a job and a reference instant to the job's next eligible occurrence.
///
/// Never touches the store: the only inputs besides its arguments are the
/// clock (when no reference is given) and the jitter source.
pub struct DueCalculator {
    clock: Arc<dyn Clock>,
    jitter: Arc<dyn JitterSource>,
    default_tz: Tz,
}

impl DueCalculator {
    pub fn new(clock: Arc<dyn Clock>, jitter: Arc<dyn JitterSource>, default_tz: Tz) -> Self {
        Self {
            clock,
            jitter,
            default_tz,
        }
    }

    /// Next eligible occurrence of `job` after `from`.
    ///
    /// With `from = None` the reference is the clock's current instant and an
    /// occurrence exactly at that instant qualifies. Returns `Ok(None)` when
    /// the validity window has no further occurrences.
    pub fn next_due(
        &self,
        job: &JobDefinition,
        from: Option<DateTime<Utc>>,
    ) -> Result<Option<DateTime<Utc>>> {
        let (reference, inclusive) = match from {
            Some(t) => (t, false),
            None => (self.clock.now(), true),
        };

        let Some(mut due) = self.jittered(job, reference, inclusive)? else {
            return Ok(None);
        };

        if let Some(not_before) = job.not_before {
            if due < not_before {
                // One retry: the occurrence computed from the window start
                // (plus non-negative jitter) cannot land before it again.
                match self.jittered(job, not_before, true)? {
                    Some(d) => due = d,
                    None => return Ok(None),
                }
            }
        }

        if job.not_after.is_some_and(|not_after| due > not_after) {
            return Ok(None);
        }
        Ok(Some(due))
    }

    /// The raw (un-jittered) occurrence after `reference`, in the job's
    /// timezone. `inclusive` lets an occurrence at `reference` itself count.
    pub fn occurrence_after(
        &self,
        job: &JobDefinition,
        reference: DateTime<Utc>,
        inclusive: bool,
    ) -> Result<Option<DateTime<Utc>>> {
        let schedule = parse_expression(&job.schedule)?;
        let tz = match job.timezone.as_deref() {
            Some(name) => parse_timezone(name)?,
            None => self.default_tz,
        };
        // `after` is strict and works at second granularity.
        let start = if inclusive {
            reference - Duration::milliseconds(1)
        } else {
            reference
        };
        Ok(schedule
            .after(&start.with_timezone(&tz))
            .next()
            .map(|dt| dt.with_timezone(&Utc)))
    }

    fn jittered(
        &self,
        job: &JobDefinition,
        reference: DateTime<Utc>,
        inclusive: bool,
    ) -> Result<Option<DateTime<Utc>>> {
        let Some(occ) = self.occurrence_after(job, reference, inclusive)? else {
            return Ok(None);
        };
        let offset = self.jitter.jitter_ms(job.jitter_ms).min(job.jitter_ms);
        let delta = jitter_delta(offset)?;
        occ.checked_add_signed(delta)
            .map(Some)
            .ok_or_else(|| jitter_out_of_range(job.jitter_ms))
    }

    /// Reject definitions `next_due` could never evaluate: a bad expression,
    /// an unknown timezone, or a jitter bound past the representable range.
    pub fn validate(&self, job: &JobDefinition) -> Result<()> {
        parse_expression(&job.schedule)?;
        if let Some(name) = job.timezone.as_deref() {
            parse_timezone(name)?;
        }
        let delta = jitter_delta(job.jitter_ms)?;
        self.clock
            .now()
            .checked_add_signed(delta)
            .map(|_| ())
            .ok_or_else(|| jitter_out_of_range(job.jitter_ms))
    }
}

fn jitter_delta(ms: u64) -> Result<Duration> {
    i64::try_from(ms)
        .ok()
        .and_then(Duration::try_milliseconds)
        .ok_or_else(|| jitter_out_of_range(ms))
}

fn jitter_out_of_range(ms: u64) -> SchedulerError {
    SchedulerError::InvalidSchedule(format!("jitter_ms {ms} is out of range"))
}
