//! Textual forms for the four time types of the portable universe.
//!
//! World time carries an offset and renders ISO-like with fractional
//! seconds; clock time is the same shape pinned to UTC. Spans and
//! deltas are signed `[-]D:HH:MM:SS[.fff]` with the days field
//! optional. The text forms round-trip exactly at microsecond
//! precision.

use chrono::DateTime;
use chrono::Duration;
use chrono::FixedOffset;
use chrono::SecondsFormat;
use chrono::Utc;

use crate::error::CodecError;

pub fn world_to_text(w: &DateTime<FixedOffset>) -> String {
	w.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn text_to_world(text: &str) -> Result<DateTime<FixedOffset>, CodecError> {
	DateTime::parse_from_rfc3339(text).map_err(|_| CodecError::BadTime {
		text: text.to_string(),
	})
}

pub fn clock_to_text(c: &DateTime<Utc>) -> String {
	c.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn text_to_clock(text: &str) -> Result<DateTime<Utc>, CodecError> {
	Ok(text_to_world(text)?.with_timezone(&Utc))
}

/// Render a span as `[-]D:HH:MM:SS[.ffffff]`; the days field is
/// omitted when zero.
pub fn span_to_text(s: &Duration) -> String {
	let negative = *s < Duration::zero();
	let magnitude = if negative { -*s } else { *s };

	let days = magnitude.num_days();
	let hours = magnitude.num_hours() - days * 24;
	let minutes = magnitude.num_minutes() - magnitude.num_hours() * 60;
	let seconds = magnitude.num_seconds() - magnitude.num_minutes() * 60;
	let micros = magnitude.num_microseconds().unwrap_or(0) - magnitude.num_seconds() * 1_000_000;

	let sign = if negative { "-" } else { "" };
	let mut out = if days > 0 {
		format!("{sign}{days}:{hours:02}:{minutes:02}:{seconds:02}")
	} else {
		format!("{sign}{hours:02}:{minutes:02}:{seconds:02}")
	};
	if micros > 0 {
		out.push_str(&format!(".{micros:06}"));
		while out.ends_with('0') {
			out.pop();
		}
	}
	out
}

pub fn text_to_span(text: &str) -> Result<Duration, CodecError> {
	let bad = || CodecError::BadTime {
		text: text.to_string(),
	};

	let (negative, rest) = match text.strip_prefix('-') {
		Some(rest) => (true, rest),
		None => (false, text),
	};

	let (clock, fraction) = match rest.split_once('.') {
		Some((clock, fraction)) => (clock, Some(fraction)),
		None => (rest, None),
	};

	let parts: Vec<&str> = clock.split(':').collect();
	let (days, hours, minutes, seconds) = match parts.as_slice() {
		[h, m, s] => (0i64, parse_field(h, text)?, parse_field(m, text)?, parse_field(s, text)?),
		[d, h, m, s] => (
			parse_field(d, text)?,
			parse_field(h, text)?,
			parse_field(m, text)?,
			parse_field(s, text)?,
		),
		_ => return Err(bad()),
	};

	let micros = match fraction {
		Some(f) if !f.is_empty() && f.len() <= 6 && f.bytes().all(|b| b.is_ascii_digit()) => {
			let padded = format!("{f:0<6}");
			padded.parse::<i64>().map_err(|_| bad())?
		}
		Some(_) => return Err(bad()),
		None => 0,
	};

	let total = Duration::days(days)
		+ Duration::hours(hours)
		+ Duration::minutes(minutes)
		+ Duration::seconds(seconds)
		+ Duration::microseconds(micros);

	Ok(if negative { -total } else { total })
}

fn parse_field(field: &str, whole: &str) -> Result<i64, CodecError> {
	field.parse().map_err(|_| CodecError::BadTime {
		text: whole.to_string(),
	})
}

/// Deltas share the span text form.
pub fn delta_to_text(d: &Duration) -> String {
	span_to_text(d)
}

pub fn text_to_delta(text: &str) -> Result<Duration, CodecError> {
	text_to_span(text)
}

#[cfg(test)]
mod tests {
	use super::*;
	use chrono::TimeZone;

	#[test]
	fn world_round_trip() {
		let w = FixedOffset::east_opt(3600)
			.unwrap()
			.with_ymd_and_hms(2025, 3, 9, 14, 30, 5)
			.unwrap()
			+ Duration::microseconds(250_000);
		let text = world_to_text(&w);
		assert_eq!(text_to_world(&text).unwrap(), w);
	}

	#[test]
	fn span_round_trip() {
		let cases = [
			Duration::seconds(0),
			Duration::seconds(59),
			Duration::minutes(90),
			Duration::days(3) + Duration::hours(4) + Duration::microseconds(123_456),
			-(Duration::hours(1) + Duration::milliseconds(500)),
		];
		for s in cases {
			let text = span_to_text(&s);
			assert_eq!(text_to_span(&text).unwrap(), s, "via {text:?}");
		}
	}

	#[test]
	fn span_text_shapes() {
		assert_eq!(span_to_text(&Duration::seconds(5)), "00:00:05");
		assert_eq!(
			span_to_text(&(Duration::days(2) + Duration::seconds(1))),
			"2:00:00:01"
		);
		assert_eq!(
			span_to_text(&-(Duration::minutes(1) + Duration::milliseconds(250))),
			"-00:01:00.25"
		);
	}

	#[test]
	fn bad_time_text_fails() {
		for bad in ["", "five", "1:2", "00:00:00.1234567", "10:00:xx"] {
			assert!(text_to_span(bad).is_err(), "{bad:?} parsed");
		}
	}
}
