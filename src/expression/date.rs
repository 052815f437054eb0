//! Date strings
//!
//! Dates are ISO-8601 strings in UTC. Parsing accepts what the embedded
//! engine's date functions accept, so the interpreter and the SQL tiers agree
//! on which strings are dates:
//!
//! `YYYY-MM-DD`, optionally followed by `T` or a space and `HH:MM`,
//! `HH:MM:SS` or `HH:MM:SS.fff`, optionally followed by `Z` or `+HH:MM`.
//! Days past the end of a month roll over into the next month.

use chrono::{DateTime, Datelike, Duration, Months, NaiveDate, NaiveDateTime, Timelike, Utc};

/// Output format of date arithmetic results
pub const DATE_OUTPUT_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.3fZ";

/// Units accepted by date arithmetic
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DateUnit {
    Year,
    Quarter,
    Month,
    Week,
    Day,
    Hour,
    Minute,
    Second,
    Millisecond,
}

impl DateUnit {
    /// Parses a unit name
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "year" => Some(DateUnit::Year),
            "quarter" => Some(DateUnit::Quarter),
            "month" => Some(DateUnit::Month),
            "week" => Some(DateUnit::Week),
            "day" => Some(DateUnit::Day),
            "hour" => Some(DateUnit::Hour),
            "minute" => Some(DateUnit::Minute),
            "second" => Some(DateUnit::Second),
            "millisecond" => Some(DateUnit::Millisecond),
            _ => None,
        }
    }

    /// Engine date modifier for units with a fixed length
    pub fn sql_modifier(&self) -> Option<&'static str> {
        match self {
            DateUnit::Day => Some("days"),
            DateUnit::Hour => Some("hours"),
            DateUnit::Minute => Some("minutes"),
            DateUnit::Second => Some("seconds"),
            _ => None,
        }
    }
}

/// Parses a date string; `None` when it is not a date
pub fn parse_date(input: &str) -> Option<DateTime<Utc>> {
    let bytes = input.as_bytes();
    let mut pos = 0;

    let year = digits(bytes, &mut pos, 4)?;
    expect(bytes, &mut pos, b'-')?;
    let month = digits(bytes, &mut pos, 2)?;
    expect(bytes, &mut pos, b'-')?;
    let day = digits(bytes, &mut pos, 2)?;

    if !(1..=12).contains(&month) || !(1..=31).contains(&day) {
        return None;
    }

    let mut millis: i64 = 0;
    if pos < bytes.len() && (bytes[pos] == b'T' || bytes[pos] == b' ') {
        pos += 1;
        let hour = digits(bytes, &mut pos, 2)?;
        expect(bytes, &mut pos, b':')?;
        let minute = digits(bytes, &mut pos, 2)?;
        let mut seconds = 0.0f64;
        if pos < bytes.len() && bytes[pos] == b':' {
            pos += 1;
            let whole = digits(bytes, &mut pos, 2)?;
            seconds = whole as f64;
            if pos < bytes.len() && bytes[pos] == b'.' {
                pos += 1;
                let start = pos;
                while pos < bytes.len() && bytes[pos].is_ascii_digit() {
                    pos += 1;
                }
                if pos == start {
                    return None;
                }
                let fraction: f64 = format!("0.{}", &input[start..pos]).parse().ok()?;
                seconds += fraction;
            }
        }
        if hour > 24 || minute > 59 || seconds >= 60.0 {
            return None;
        }
        // Round to the millisecond the way the engine does
        millis = hour as i64 * 3_600_000 + minute as i64 * 60_000 + (seconds * 1000.0 + 0.5) as i64;

        if pos < bytes.len() {
            match bytes[pos] {
                b'Z' | b'z' => pos += 1,
                b'+' | b'-' => {
                    let sign = if bytes[pos] == b'-' { -1 } else { 1 };
                    pos += 1;
                    let off_h = digits(bytes, &mut pos, 2)?;
                    expect(bytes, &mut pos, b':')?;
                    let off_m = digits(bytes, &mut pos, 2)?;
                    if off_h > 14 || off_m > 59 {
                        return None;
                    }
                    // Convert local time to UTC
                    millis -= sign * (off_h as i64 * 3_600_000 + off_m as i64 * 60_000);
                }
                _ => return None,
            }
        }
    }

    if pos != bytes.len() {
        return None;
    }

    let first = NaiveDate::from_ymd_opt(year as i32, month, 1)?;
    let date = first.checked_add_signed(Duration::days(day as i64 - 1))?;
    let midnight: NaiveDateTime = date.and_hms_opt(0, 0, 0)?;
    let timestamp = midnight.checked_add_signed(Duration::milliseconds(millis))?;
    Some(timestamp.and_utc())
}

fn digits(bytes: &[u8], pos: &mut usize, count: usize) -> Option<u32> {
    let end = *pos + count;
    let slice = bytes.get(*pos..end)?;
    if !slice.iter().all(u8::is_ascii_digit) {
        return None;
    }
    *pos = end;
    Some(slice.iter().fold(0u32, |acc, b| acc * 10 + (b - b'0') as u32))
}

fn expect(bytes: &[u8], pos: &mut usize, byte: u8) -> Option<()> {
    if bytes.get(*pos) == Some(&byte) {
        *pos += 1;
        Some(())
    } else {
        None
    }
}

/// Renders a date in the output format used by date arithmetic
pub fn format_date(date: &DateTime<Utc>) -> String {
    date.format(DATE_OUTPUT_FORMAT).to_string()
}

/// Day of week with Sunday = 1 through Saturday = 7
pub fn day_of_week(date: &DateTime<Utc>) -> u32 {
    date.weekday().num_days_from_sunday() + 1
}

/// Adds `amount` units to a date; `None` when the result is out of range.
///
/// Month arithmetic clamps to the end of the target month.
pub fn add_to_date(date: &DateTime<Utc>, unit: DateUnit, amount: i64) -> Option<DateTime<Utc>> {
    let months = |n: i64| -> Option<DateTime<Utc>> {
        let magnitude = u32::try_from(n.unsigned_abs()).ok()?;
        if n >= 0 {
            date.checked_add_months(Months::new(magnitude))
        } else {
            date.checked_sub_months(Months::new(magnitude))
        }
    };
    match unit {
        DateUnit::Year => months(amount.checked_mul(12)?),
        DateUnit::Quarter => months(amount.checked_mul(3)?),
        DateUnit::Month => months(amount),
        DateUnit::Week => date.checked_add_signed(Duration::try_weeks(amount)?),
        DateUnit::Day => date.checked_add_signed(Duration::try_days(amount)?),
        DateUnit::Hour => date.checked_add_signed(Duration::try_hours(amount)?),
        DateUnit::Minute => date.checked_add_signed(Duration::try_minutes(amount)?),
        DateUnit::Second => date.checked_add_signed(Duration::try_seconds(amount)?),
        DateUnit::Millisecond => date.checked_add_signed(Duration::try_milliseconds(amount)?),
    }
}

/// Number of `unit` boundaries crossed between two dates
pub fn date_diff(start: &DateTime<Utc>, end: &DateTime<Utc>, unit: DateUnit) -> i64 {
    let month_index = |d: &DateTime<Utc>| d.year() as i64 * 12 + d.month0() as i64;
    let epoch_days = |d: &DateTime<Utc>| d.timestamp().div_euclid(86_400);
    let floor_div = |d: &DateTime<Utc>, ms: i64| d.timestamp_millis().div_euclid(ms);

    match unit {
        DateUnit::Year => end.year() as i64 - start.year() as i64,
        DateUnit::Quarter => month_index(end) / 3 - month_index(start) / 3,
        DateUnit::Month => month_index(end) - month_index(start),
        // 1970-01-01 was a Thursday; weeks start on Sunday
        DateUnit::Week => (epoch_days(end) + 4).div_euclid(7) - (epoch_days(start) + 4).div_euclid(7),
        DateUnit::Day => epoch_days(end) - epoch_days(start),
        DateUnit::Hour => floor_div(end, 3_600_000) - floor_div(start, 3_600_000),
        DateUnit::Minute => floor_div(end, 60_000) - floor_div(start, 60_000),
        DateUnit::Second => floor_div(end, 1000) - floor_div(start, 1000),
        DateUnit::Millisecond => end.timestamp_millis() - start.timestamp_millis(),
    }
}

/// Renders a date with `%`-style specifiers.
///
/// Supported: `%Y %m %d %H %M %S %L` (milliseconds), `%j` (day of year),
/// `%w` (Sunday = 1), `%u` (ISO weekday) and `%%`. Returns `Err` with the
/// offending specifier otherwise.
pub fn format_with(date: &DateTime<Utc>, format: &str) -> Result<String, String> {
    let mut out = String::with_capacity(format.len() + 8);
    let mut chars = format.chars();
    while let Some(c) = chars.next() {
        if c != '%' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('Y') => out.push_str(&format!("{:04}", date.year())),
            Some('m') => out.push_str(&format!("{:02}", date.month())),
            Some('d') => out.push_str(&format!("{:02}", date.day())),
            Some('H') => out.push_str(&format!("{:02}", date.hour())),
            Some('M') => out.push_str(&format!("{:02}", date.minute())),
            Some('S') => out.push_str(&format!("{:02}", date.second())),
            Some('L') => out.push_str(&format!("{:03}", date.timestamp_subsec_millis())),
            Some('j') => out.push_str(&format!("{:03}", date.ordinal())),
            Some('w') => out.push_str(&day_of_week(date).to_string()),
            Some('u') => out.push_str(&date.weekday().number_from_monday().to_string()),
            Some('%') => out.push('%'),
            Some(other) => return Err(format!("%{}", other)),
            None => return Err("%".to_string()),
        }
    }
    Ok(out)
}
