use std::collections::BTreeMap;

use crate::address::Address;

/// The in-memory codec form: a tree of primitives, lists and maps.
///
/// This is what the "noop" codec produces and consumes, what
/// unregistered wire types decode into (see `Incognito`), and the
/// intermediate form between typed Rust values and JSON text. The
/// glossary calls this a *word*.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
	Null,
	Bool(bool),
	Int(i64),
	Float(f64),
	Str(String),
	Bytes(Vec<u8>),
	List(Vec<Value>),
	/// Compound with named fields, in canonical (sorted) order.
	Record(BTreeMap<String, Value>),
	/// General map with arbitrary key values.
	Map(Vec<(Value, Value)>),
	Address(Address),
	/// A pointer occurrence; the target lives once in the frame's
	/// alias table under this key.
	Alias(String),
}

impl Value {
	pub fn record(fields: impl IntoIterator<Item = (&'static str, Value)>) -> Value {
		Value::Record(
			fields
				.into_iter()
				.map(|(k, v)| (k.to_string(), v))
				.collect(),
		)
	}

	pub fn kind(&self) -> &'static str {
		match self {
			Value::Null => "null",
			Value::Bool(_) => "bool",
			Value::Int(_) => "int",
			Value::Float(_) => "float",
			Value::Str(_) => "string",
			Value::Bytes(_) => "bytes",
			Value::List(_) => "list",
			Value::Record(_) => "record",
			Value::Map(_) => "map",
			Value::Address(_) => "address",
			Value::Alias(_) => "alias",
		}
	}

	pub fn as_record(&self) -> Option<&BTreeMap<String, Value>> {
		match self {
			Value::Record(fields) => Some(fields),
			_ => None,
		}
	}

	pub fn get(&self, field: &str) -> Option<&Value> {
		self.as_record().and_then(|fields| fields.get(field))
	}

	pub fn as_str(&self) -> Option<&str> {
		match self {
			Value::Str(s) => Some(s),
			_ => None,
		}
	}

	pub fn as_int(&self) -> Option<i64> {
		match self {
			Value::Int(i) => Some(*i),
			_ => None,
		}
	}

	pub fn as_bool(&self) -> Option<bool> {
		match self {
			Value::Bool(b) => Some(*b),
			_ => None,
		}
	}

	pub fn as_address(&self) -> Option<&Address> {
		match self {
			Value::Address(a) => Some(a),
			_ => None,
		}
	}
}

impl From<&str> for Value {
	fn from(s: &str) -> Self {
		Value::Str(s.to_string())
	}
}

impl From<String> for Value {
	fn from(s: String) -> Self {
		Value::Str(s)
	}
}

impl From<i64> for Value {
	fn from(i: i64) -> Self {
		Value::Int(i)
	}
}

impl From<bool> for Value {
	fn from(b: bool) -> Self {
		Value::Bool(b)
	}
}

impl From<Address> for Value {
	fn from(a: Address) -> Self {
		Value::Address(a)
	}
}
