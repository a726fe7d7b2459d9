//! Runtime logging: every Point action becomes a `PointLog` record on
//! the log task, which renders the canonical line shape
//! `YYYY-MM-DDTHH:MM:SS.fff <tag> [pid] <addr> <name>[state] - <text>`
//! and hands it to the `tracing` subscriber the embedder installed.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::SecondsFormat;
use chrono::Utc;

use crate::address::Address;
use crate::address::Hop;
use crate::error::CodecError;
use crate::error::RegistrationError;
use crate::message::Message;
use crate::message::Portable;
use crate::message::field;
use crate::portable::PortableType;
use crate::registry::MessageFlags;
use crate::registry::MessageRegistry;
use crate::registry::Schema;
use crate::runtime::Runtime;
use crate::value::Value;

/// One character per event kind, stable across releases.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LogTag {
	Created,
	Destroyed,
	Sent,
	Received,
	Started,
	Ended,
	Fault,
	Warning,
	Console,
	Trace,
	Debug,
	Sample,
	Check,
}

impl LogTag {
	pub fn glyph(&self) -> char {
		match self {
			LogTag::Created => '+',
			LogTag::Destroyed => 'X',
			LogTag::Sent => '>',
			LogTag::Received => '<',
			LogTag::Started => '(',
			LogTag::Ended => ')',
			LogTag::Fault => '!',
			LogTag::Warning => '?',
			LogTag::Console => '^',
			LogTag::Trace => '~',
			LogTag::Debug => '_',
			LogTag::Sample => '&',
			LogTag::Check => '=',
		}
	}

	fn from_glyph(glyph: char) -> LogTag {
		match glyph {
			'+' => LogTag::Created,
			'X' => LogTag::Destroyed,
			'>' => LogTag::Sent,
			'<' => LogTag::Received,
			'(' => LogTag::Started,
			')' => LogTag::Ended,
			'!' => LogTag::Fault,
			'?' => LogTag::Warning,
			'^' => LogTag::Console,
			'~' => LogTag::Trace,
			'&' => LogTag::Sample,
			'=' => LogTag::Check,
			_ => LogTag::Debug,
		}
	}
}

#[derive(Clone, Debug)]
pub struct PointLog {
	pub when: chrono::DateTime<Utc>,
	pub tag: LogTag,
	pub address: Hop,
	pub name: String,
	pub state: Option<String>,
	pub text: String,
}

impl PointLog {
	pub fn new(tag: LogTag, address: Hop, name: String, text: String) -> Self {
		Self {
			when: Utc::now(),
			tag,
			address,
			name,
			state: None,
			text,
		}
	}

	/// The persisted line shape.
	pub fn render(&self) -> String {
		let when = self.when.to_rfc3339_opts(SecondsFormat::Millis, true);
		let pid = std::process::id();
		let name = match &self.state {
			Some(state) => format!("{}[{state}]", self.name),
			None => self.name.clone(),
		};
		format!(
			"{when} {} [{pid}] <{:08x}> {name} - {}",
			self.glyph(),
			self.address,
			self.text
		)
	}

	fn glyph(&self) -> char {
		self.tag.glyph()
	}
}

impl Default for PointLog {
	fn default() -> Self {
		PointLog::new(LogTag::Debug, 0, String::new(), String::new())
	}
}

impl Message for PointLog {}

impl Portable for PointLog {
	const NAME: &'static str = "fabric.PointLog";

	fn schema() -> Schema {
		Schema::from([
			("when".to_string(), PortableType::Clock),
			("tag".to_string(), PortableType::Character),
			("address".to_string(), PortableType::Int8),
			("name".to_string(), PortableType::Str),
			("state".to_string(), PortableType::Str),
			("text".to_string(), PortableType::Str),
		])
	}

	fn to_value(&self, _reg: &MessageRegistry) -> Result<Value, CodecError> {
		Ok(Value::record([
			("when", Value::Str(crate::clock::clock_to_text(&self.when))),
			("tag", Value::Str(self.glyph().to_string())),
			("address", Value::Int(self.address)),
			("name", Value::Str(self.name.clone())),
			(
				"state",
				Value::Str(self.state.clone().unwrap_or_default()),
			),
			("text", Value::Str(self.text.clone())),
		]))
	}

	fn from_value(value: &Value, _reg: &MessageRegistry) -> Result<Self, CodecError> {
		let when = crate::clock::text_to_clock(
			field(value, "when", Self::NAME)?.as_str().unwrap_or_default(),
		)?;
		let state = field(value, "state", Self::NAME)?
			.as_str()
			.unwrap_or_default()
			.to_string();
		Ok(PointLog {
			when,
			tag: LogTag::from_glyph(
				field(value, "tag", Self::NAME)?
					.as_str()
					.and_then(|s| s.chars().next())
					.unwrap_or('_'),
			),
			address: field(value, "address", Self::NAME)?.as_int().unwrap_or(0),
			name: field(value, "name", Self::NAME)?
				.as_str()
				.unwrap_or_default()
				.to_string(),
			state: (!state.is_empty()).then_some(state),
			text: field(value, "text", Self::NAME)?
				.as_str()
				.unwrap_or_default()
				.to_string(),
		})
	}

	fn default_message() -> Self {
		PointLog::default()
	}
}

pub(crate) fn bind(reg: &MessageRegistry) -> Result<(), RegistrationError> {
	// Log records must never log their own send or the process eats
	// itself.
	reg.bind::<PointLog>(MessageFlags {
		log_on_send: false,
		log_on_receive: false,
		copy_before_send: false,
		portable: false,
		..Default::default()
	})?;
	Ok(())
}

pub(crate) fn boot(runtime: &Arc<Runtime>) -> Address {
	let hop = runtime.allocate();
	let address = Address::local(hop);
	let (tx, mut rx) = crate::mailbox::mailbox();
	runtime.insert_object(crate::runtime::ObjectRecord {
		address: address.clone(),
		queue: tx,
		parent: Address::null(),
		name: "log".to_string(),
		group: None,
	});

	let token = runtime.tokens.log.child();
	tokio::spawn(async move {
		loop {
			tokio::select! {
				_ = token.ended() => break,
				frame = rx.get() => {
					let Some(frame) = frame else { break };
					if let Some(record) = frame.message.downcast_ref::<PointLog>() {
						emit(record);
					}
				}
			}
		}
	});

	address
}

fn emit(record: &PointLog) {
	let line = record.render();
	match record.tag {
		LogTag::Fault => tracing::error!(target: "fabric", "{line}"),
		LogTag::Warning => tracing::warn!(target: "fabric", "{line}"),
		LogTag::Console | LogTag::Sample | LogTag::Check => {
			tracing::info!(target: "fabric", "{line}")
		}
		LogTag::Created | LogTag::Destroyed | LogTag::Started | LogTag::Ended => {
			tracing::debug!(target: "fabric", "{line}")
		}
		_ => tracing::trace!(target: "fabric", "{line}"),
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn line_shape() {
		let mut record = PointLog::new(LogTag::Sent, 0x2a, "echo".to_string(), "Ack to [7]".into());
		record.state = Some("NORMAL".to_string());
		let line = record.render();
		assert!(line.contains(" > ["), "{line}");
		assert!(line.contains("<0000002a> echo[NORMAL] - Ack to [7]"), "{line}");
	}

	#[test]
	fn glyphs_are_distinct() {
		let tags = [
			LogTag::Created,
			LogTag::Destroyed,
			LogTag::Sent,
			LogTag::Received,
			LogTag::Started,
			LogTag::Ended,
			LogTag::Fault,
			LogTag::Warning,
			LogTag::Console,
			LogTag::Trace,
			LogTag::Debug,
			LogTag::Sample,
			LogTag::Check,
		];
		let mut seen = std::collections::HashSet::new();
		for tag in tags {
			assert!(seen.insert(tag.glyph()));
		}
	}
}
