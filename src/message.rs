use std::collections::BTreeMap;
use std::fmt::Debug;
use std::sync::Arc;

use downcast_rs::DowncastSync;
use downcast_rs::impl_downcast;

use crate::address::Address;
use crate::codec;
use crate::error::CodecError;
use crate::portable::PortableType;
use crate::registry::MessageRegistry;
use crate::registry::Schema;
use crate::value::Value;

/// Anything that can travel through a mailbox. Concrete types are
/// recovered by downcasting at the handler boundary.
pub trait Message: DowncastSync + Debug {}
impl_downcast!(sync Message);

/// A message type the codec can carry across a transport. `NAME` is
/// the durable wire identity; the schema drives the typed walker.
pub trait Portable: Message + Sized {
	const NAME: &'static str;

	fn schema() -> Schema;

	/// Wire parent, if any; lets a handler registered for the parent
	/// accept this type (see the dispatch three-tier lookup).
	fn base() -> Option<&'static str> {
		None
	}

	/// Borrow the embedded parent value for base dispatch.
	fn base_view(&self) -> Option<&dyn Message> {
		None
	}

	fn to_value(&self, reg: &MessageRegistry) -> Result<Value, CodecError>;

	fn from_value(value: &Value, reg: &MessageRegistry) -> Result<Self, CodecError>;

	/// Every registered compound must be constructable without
	/// arguments; the codec pads with these.
	fn default_message() -> Self;
}

/// One mailbox entry.
#[derive(Clone, Debug)]
pub struct Frame {
	pub message: Arc<dyn Message>,
	pub to: Address,
	pub return_address: Address,
	pub replays: u8,
}

impl Frame {
	pub fn new(message: Arc<dyn Message>, to: Address, return_address: Address) -> Self {
		Self {
			message,
			to,
			return_address,
			replays: 0,
		}
	}
}

/// Helper to pull a named field out of a decoded record.
pub fn field<'v>(value: &'v Value, name: &str, of: &str) -> Result<&'v Value, CodecError> {
	value.get(name).ok_or_else(|| CodecError::MissingField {
		name: of.to_string(),
		field: name.to_string(),
	})
}

macro_rules! signals {
	($($(#[$doc:meta])* $name:ident => $wire:literal),+ $(,)?) => {
		$(
			$(#[$doc])*
			#[derive(Clone, Debug, Default, PartialEq, Eq)]
			pub struct $name;

			impl Message for $name {}

			impl Portable for $name {
				const NAME: &'static str = $wire;

				fn schema() -> Schema {
					Schema::new()
				}

				fn to_value(&self, _reg: &MessageRegistry) -> Result<Value, CodecError> {
					Ok(Value::Record(BTreeMap::new()))
				}

				fn from_value(_value: &Value, _reg: &MessageRegistry) -> Result<Self, CodecError> {
					Ok($name)
				}

				fn default_message() -> Self {
					$name
				}
			}
		)+
	};
}

signals! {
	/// Positive acknowledgement.
	Ack => "fabric.Ack",
	/// Negative acknowledgement.
	Nak => "fabric.Nak",
	/// A liveness or state probe; conventionally answered with `Ack`.
	Enquiry => "fabric.Enquiry",
	Ping => "fabric.Ping",
	/// The universal cancellation. Every long-lived object accepts it
	/// in every state.
	Stop => "fabric.Stop",
}

/// Opaque payload passed through a tunnel connection untouched.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Blob {
	pub bytes: Vec<u8>,
}

impl Message for Blob {}

impl Portable for Blob {
	const NAME: &'static str = "fabric.Blob";

	fn schema() -> Schema {
		Schema::from([("bytes".to_string(), PortableType::Block)])
	}

	fn to_value(&self, _reg: &MessageRegistry) -> Result<Value, CodecError> {
		Ok(Value::record([("bytes", Value::Bytes(self.bytes.clone()))]))
	}

	fn from_value(value: &Value, _reg: &MessageRegistry) -> Result<Self, CodecError> {
		match field(value, "bytes", Self::NAME)? {
			Value::Bytes(bytes) => Ok(Blob {
				bytes: bytes.clone(),
			}),
			other => Err(CodecError::Mismatch {
				expected: "block".to_string(),
				found: other.kind().to_string(),
			}),
		}
	}

	fn default_message() -> Self {
		Blob::default()
	}
}

/// An any-typed carrier: a bare word with no schema of its own.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Anything {
	pub value: Value,
}

impl Anything {
	pub fn new(value: Value) -> Self {
		Self { value }
	}
}

impl Message for Anything {}

impl Portable for Anything {
	const NAME: &'static str = "fabric.Anything";

	fn schema() -> Schema {
		Schema::from([("value".to_string(), PortableType::Word)])
	}

	fn to_value(&self, _reg: &MessageRegistry) -> Result<Value, CodecError> {
		Ok(Value::record([("value", self.value.clone())]))
	}

	fn from_value(value: &Value, _reg: &MessageRegistry) -> Result<Self, CodecError> {
		Ok(Anything {
			value: field(value, "value", Self::NAME)?.clone(),
		})
	}

	fn default_message() -> Self {
		Anything {
			value: Value::Null,
		}
	}
}

/// Delivered to the parent when a child terminates; `value` is the
/// child's completion value.
#[derive(Clone, Debug)]
pub struct Returned {
	pub value: Arc<dyn Message>,
}

impl Returned {
	pub fn new(value: Arc<dyn Message>) -> Self {
		Self { value }
	}
}

impl Message for Returned {}

impl Portable for Returned {
	const NAME: &'static str = "fabric.Returned";

	fn schema() -> Schema {
		Schema::from([("value".to_string(), PortableType::Any)])
	}

	fn to_value(&self, reg: &MessageRegistry) -> Result<Value, CodecError> {
		Ok(Value::record([(
			"value",
			codec::encode_any(reg, self.value.as_ref())?,
		)]))
	}

	fn from_value(value: &Value, reg: &MessageRegistry) -> Result<Self, CodecError> {
		let inner = field(value, "value", Self::NAME)?;
		Ok(Returned {
			value: codec::decode_any(reg, inner)?,
		})
	}

	fn default_message() -> Self {
		Returned {
			value: Arc::new(Ack),
		}
	}
}

/// Generic failure value: the root of the fault family.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Faulted {
	pub condition: String,
	pub explanation: Option<String>,
	pub code: Option<i64>,
	pub exit_status: Option<i64>,
}

impl Faulted {
	pub fn new(condition: impl Into<String>) -> Self {
		Self {
			condition: condition.into(),
			..Default::default()
		}
	}

	pub fn explained(condition: impl Into<String>, explanation: impl Into<String>) -> Self {
		Self {
			condition: condition.into(),
			explanation: Some(explanation.into()),
			..Default::default()
		}
	}
}

impl Message for Faulted {}

impl Portable for Faulted {
	const NAME: &'static str = "fabric.Faulted";

	fn schema() -> Schema {
		Schema::from([
			("condition".to_string(), PortableType::Str),
			("explanation".to_string(), PortableType::Str),
			("code".to_string(), PortableType::Int8),
			("exit_status".to_string(), PortableType::Int4),
		])
	}

	fn to_value(&self, _reg: &MessageRegistry) -> Result<Value, CodecError> {
		Ok(Value::record([
			("condition", Value::Str(self.condition.clone())),
			(
				"explanation",
				Value::Str(self.explanation.clone().unwrap_or_default()),
			),
			("code", Value::Int(self.code.unwrap_or(0))),
			("exit_status", Value::Int(self.exit_status.unwrap_or(0))),
		]))
	}

	fn from_value(value: &Value, _reg: &MessageRegistry) -> Result<Self, CodecError> {
		let explanation = field(value, "explanation", Self::NAME)?
			.as_str()
			.unwrap_or_default()
			.to_string();
		let code = field(value, "code", Self::NAME)?.as_int().unwrap_or(0);
		let exit_status = field(value, "exit_status", Self::NAME)?
			.as_int()
			.unwrap_or(0);
		Ok(Faulted {
			condition: field(value, "condition", Self::NAME)?
				.as_str()
				.unwrap_or_default()
				.to_string(),
			explanation: (!explanation.is_empty()).then_some(explanation),
			code: (code != 0).then_some(code),
			exit_status: (exit_status != 0).then_some(exit_status),
		})
	}

	fn default_message() -> Self {
		Faulted::default()
	}
}

macro_rules! derived_fault {
	($(#[$doc:meta])* $name:ident => $wire:literal { $($extra:ident : $extra_t:ty => $extra_pt:expr),* }) => {
		$(#[$doc])*
		#[derive(Clone, Debug, Default, PartialEq, Eq)]
		pub struct $name {
			pub fault: Faulted,
			$(pub $extra: $extra_t,)*
		}

		impl Message for $name {}

		impl Portable for $name {
			const NAME: &'static str = $wire;

			fn schema() -> Schema {
				Schema::from([
					("fault".to_string(), PortableType::UserDefined(Faulted::NAME.to_string())),
					$(((stringify!($extra)).to_string(), $extra_pt),)*
				])
			}

			fn base() -> Option<&'static str> {
				Some(Faulted::NAME)
			}

			fn base_view(&self) -> Option<&dyn Message> {
				Some(&self.fault)
			}

			fn to_value(&self, reg: &MessageRegistry) -> Result<Value, CodecError> {
				#[allow(unused_mut)]
				let mut record = match self.fault.to_value(reg)? {
					Value::Record(fields) => {
						let mut out = BTreeMap::new();
						out.insert("fault".to_string(), Value::Record(fields));
						out
					}
					other => {
						let mut out = BTreeMap::new();
						out.insert("fault".to_string(), other);
						out
					}
				};
				$(record.insert(stringify!($extra).to_string(), Value::Str(self.$extra.clone()));)*
				Ok(Value::Record(record))
			}

			fn from_value(value: &Value, reg: &MessageRegistry) -> Result<Self, CodecError> {
				Ok($name {
					fault: Faulted::from_value(field(value, "fault", Self::NAME)?, reg)?,
					$($extra: field(value, stringify!($extra), Self::NAME)?
						.as_str()
						.unwrap_or_default()
						.to_string(),)*
				})
			}

			fn default_message() -> Self {
				Self::default()
			}
		}
	};
}

derived_fault! {
	/// Produced by accepting a `Stop`.
	Aborted => "fabric.Aborted" {}
}

derived_fault! {
	/// A timer ran out; `timer` names the timer class that expired.
	TimedOut => "fabric.TimedOut" { timer: String => PortableType::Str }
}

impl Aborted {
	pub fn new() -> Self {
		Aborted {
			fault: Faulted::new("aborted"),
		}
	}
}

impl TimedOut {
	pub fn new(timer: impl Into<String>) -> Self {
		TimedOut {
			fault: Faulted::new("timed out"),
			timer: timer.into(),
		}
	}
}

macro_rules! rejections {
	($($(#[$doc:meta])* $name:ident => $wire:literal),+ $(,)?) => {
		$(
			$(#[$doc])*
			#[derive(Clone, Debug, Default, PartialEq, Eq)]
			pub struct $name {
				pub text: Option<String>,
			}

			impl $name {
				pub fn new(text: impl Into<String>) -> Self {
					Self { text: Some(text.into()) }
				}
			}

			impl Message for $name {}

			impl Portable for $name {
				const NAME: &'static str = $wire;

				fn schema() -> Schema {
					Schema::from([("text".to_string(), PortableType::Str)])
				}

				fn to_value(&self, _reg: &MessageRegistry) -> Result<Value, CodecError> {
					Ok(Value::record([(
						"text",
						Value::Str(self.text.clone().unwrap_or_default()),
					)]))
				}

				fn from_value(value: &Value, _reg: &MessageRegistry) -> Result<Self, CodecError> {
					let text = field(value, "text", Self::NAME)?
						.as_str()
						.unwrap_or_default()
						.to_string();
					Ok(Self {
						text: (!text.is_empty()).then_some(text),
					})
				}

				fn default_message() -> Self {
					Self::default()
				}
			}
		)+
	};
}

rejections! {
	/// Load management: try again later.
	TemporarilyUnavailable => "fabric.TemporarilyUnavailable",
	/// Load management: this request was refused.
	Busy => "fabric.Busy",
	/// Load management: the service is shedding requests.
	Overloaded => "fabric.Overloaded",
	/// Load management: the service is not taking requests at all.
	OutOfService => "fabric.OutOfService",
}

/// A decoded value whose wire type is unknown in this process. Not an
/// error: it can be inspected as a word, ignored, or forwarded, and it
/// re-encodes to the exact original envelope.
#[derive(Clone, Debug, PartialEq)]
pub struct Incognito {
	pub type_name: String,
	pub word: Value,
}

impl Message for Incognito {}

/// Register the stock message set. Called once at runtime boot.
pub fn bind_stock(reg: &MessageRegistry) -> Result<(), crate::error::RegistrationError> {
	use crate::registry::MessageFlags;

	let quiet = MessageFlags {
		log_on_send: false,
		log_on_receive: false,
		..Default::default()
	};

	reg.bind::<Ack>(quiet.clone())?;
	reg.bind::<Nak>(quiet.clone())?;
	reg.bind::<Enquiry>(quiet.clone())?;
	reg.bind::<Ping>(quiet.clone())?;
	reg.bind::<Stop>(quiet.clone())?;
	reg.bind::<Blob>(MessageFlags {
		copy_before_send: false,
		..quiet.clone()
	})?;
	reg.bind::<Anything>(MessageFlags::default())?;
	reg.bind::<Faulted>(MessageFlags::default())?;
	reg.bind::<Aborted>(MessageFlags::default())?;
	reg.bind::<TimedOut>(MessageFlags::default())?;
	reg.bind::<TemporarilyUnavailable>(MessageFlags::default())?;
	reg.bind::<Busy>(MessageFlags::default())?;
	reg.bind::<Overloaded>(MessageFlags::default())?;
	reg.bind::<OutOfService>(MessageFlags::default())?;
	reg.bind::<Returned>(MessageFlags {
		copy_before_send: false,
		..Default::default()
	})?;
	Ok(())
}
