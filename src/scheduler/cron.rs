//! Crontab parsing and misfire detection.
//!
//! Job schedules are written in classic 5-field crontab form where
//! Sunday is day 0 (7 is accepted as an alias).  The `cron` crate
//! numbers Sunday=1 through Saturday=7 and requires a leading seconds
//! field, so expressions are converted before parsing.  The raw crontab
//! string is what gets persisted; conversion happens on every parse.

use std::collections::BTreeSet;
use std::str::FromStr;

use anyhow::Context as _;
use chrono::{DateTime, Duration, TimeZone};
pub use cron::Schedule;

/// Parse a 5-field crontab expression into a [`Schedule`].
///
/// Rejects anything that is not exactly 5 whitespace-separated fields
/// or that the `cron` crate cannot parse after day-of-week conversion.
pub fn parse_crontab(expr: &str) -> anyhow::Result<Schedule> {
    let fields: Vec<&str> = expr.split_whitespace().collect();
    if fields.len() != 5 {
        anyhow::bail!(
            "invalid cron expression '{expr}': expected 5 fields, got {}",
            fields.len()
        );
    }

    let dow = convert_dow_field(fields[4])
        .with_context(|| format!("invalid cron expression '{expr}'"))?;
    let with_seconds = format!(
        "0 {} {} {} {} {}",
        fields[0], fields[1], fields[2], fields[3], dow
    );
    Schedule::from_str(&with_seconds)
        .with_context(|| format!("invalid cron expression '{expr}'"))
}

/// Convert a crontab day-of-week field (Sunday=0, 7 as alias) to the
/// `cron` crate's convention (Sunday=1 .. Saturday=7).
fn convert_dow_field(field: &str) -> anyhow::Result<String> {
    let tokens: Vec<String> = field
        .split(',')
        .map(convert_dow_token)
        .collect::<anyhow::Result<_>>()?;
    Ok(tokens.join(","))
}

fn convert_dow_token(token: &str) -> anyhow::Result<String> {
    if token == "*" {
        return Ok(token.to_string());
    }
    // Named days (mon, tue, ...) have no numbering convention to fix.
    if token.chars().any(|c| c.is_ascii_alphabetic()) {
        return Ok(token.to_string());
    }

    if let Some((base, step)) = token.split_once('/') {
        let step: usize = step
            .parse()
            .ok()
            .filter(|s| *s > 0)
            .with_context(|| format!("invalid step in day-of-week '{token}'"))?;
        if base == "*" {
            // A shifted "every n-th day" set is the same set of days.
            return Ok(format!("*/{step}"));
        }
        let (lo, hi) = parse_day_range(base)?;
        let days: BTreeSet<u8> = (lo..=hi).step_by(step).map(to_native).collect();
        return Ok(join_days(&days));
    }

    if token.contains('-') {
        let (lo, hi) = parse_day_range(token)?;
        let (nlo, nhi) = (to_native(lo), to_native(hi));
        if nlo <= nhi {
            return Ok(format!("{nlo}-{nhi}"));
        }
        // The converted range wraps past Saturday (original range ended
        // on 7 = Sunday); expand it to an explicit list instead.
        let days: BTreeSet<u8> = (lo..=hi).map(to_native).collect();
        return Ok(join_days(&days));
    }

    Ok(to_native(parse_day(token)?).to_string())
}

/// Map a crontab day number (0-7, both 0 and 7 = Sunday) to the `cron`
/// crate's 1-7 numbering.
fn to_native(day: u8) -> u8 {
    day % 7 + 1
}

fn parse_day(s: &str) -> anyhow::Result<u8> {
    let day: u8 = s
        .trim()
        .parse()
        .with_context(|| format!("invalid day-of-week '{s}'"))?;
    if day > 7 {
        anyhow::bail!("day-of-week out of range: {day}");
    }
    Ok(day)
}

fn parse_day_range(s: &str) -> anyhow::Result<(u8, u8)> {
    let (lo, hi) = s
        .split_once('-')
        .with_context(|| format!("invalid day-of-week range '{s}'"))?;
    let (lo, hi) = (parse_day(lo)?, parse_day(hi)?);
    if lo > hi {
        anyhow::bail!("inverted day-of-week range '{s}'");
    }
    Ok((lo, hi))
}

fn join_days(days: &BTreeSet<u8>) -> String {
    days.iter()
        .map(|d| d.to_string())
        .collect::<Vec<_>>()
        .join(",")
}

/// Find the occurrence to replay after a restart, if any.
///
/// Walks the schedule forward from `last_fired` (at most `max_steps`
/// occurrences) and returns the latest occurrence at or before `now`,
/// provided it is within `grace` of `now`.  A job that has never fired
/// has nothing to recover.
pub fn detect_misfire<Z: TimeZone>(
    schedule: &Schedule,
    last_fired: Option<DateTime<Z>>,
    now: &DateTime<Z>,
    grace: Duration,
    max_steps: usize,
) -> Option<DateTime<Z>> {
    let last = last_fired?;
    let mut latest_missed: Option<DateTime<Z>> = None;
    for occurrence in schedule.after(&last).take(max_steps) {
        if occurrence > *now {
            break;
        }
        latest_missed = Some(occurrence);
    }
    let missed = latest_missed?;
    if now.clone().signed_duration_since(missed.clone()) <= grace {
        Some(missed)
    } else {
        None
    }
}
