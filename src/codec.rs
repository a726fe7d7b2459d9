//! The typed codec: walks values against portable descriptors to
//! produce the wire form, and back.
//!
//! Two concrete forms share the walker: JSON text (persistence and
//! the socket wire) and the in-memory tree (tests, alternative
//! transports). A message body travels as `[type-name, value]`, the
//! `Any` envelope, so the receiving process can resolve the type by
//! wire name, or fall back to an
//! [`Incognito`](crate::message::Incognito) placeholder it can later
//! re-emit verbatim.
//!
//! Address occurrences in the packed tree are indices into the
//! frame's address-space vector. Transports rewrite the vector at
//! every hop without touching the body, which is what keeps relay
//! bodies opaque.

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::sync::Arc;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;

use crate::address::Address;
use crate::clock;
use crate::error::CodecError;
use crate::message::Incognito;
use crate::message::Message;
use crate::portable::PortableType;
use crate::registry::MessageRegistry;
use crate::value::Value;

/// An encoded body: the wire-form value, the pointer side table and
/// the address-space vector its address references index into.
#[derive(Clone, Debug, PartialEq)]
pub struct Packed {
	pub value: Value,
	pub aliased: BTreeMap<String, Value>,
	pub addresses: Vec<Address>,
}

/// A decoded body: the in-memory value plus the reconstructed arena.
/// Shared pointer identity is preserved through alias keys into the
/// arena.
#[derive(Clone, Debug, PartialEq)]
pub struct Unpacked {
	pub value: Value,
	pub aliased: BTreeMap<String, Value>,
}

struct PackCtx<'a> {
	arena: &'a BTreeMap<String, Value>,
	aliased: BTreeMap<String, Value>,
	addresses: Vec<Address>,
	busy: BTreeSet<String>,
}

struct UnpackCtx<'a> {
	arena: &'a BTreeMap<String, Value>,
	addresses: &'a [Address],
	aliased: BTreeMap<String, Value>,
	busy: BTreeSet<String>,
}

pub struct Codec<'r> {
	pub reg: &'r MessageRegistry,
}

impl<'r> Codec<'r> {
	pub fn new(reg: &'r MessageRegistry) -> Self {
		Self { reg }
	}

	/// Encode an in-memory value (with its pointer arena) against a
	/// portable type.
	pub fn pack(
		&self,
		value: &Value,
		arena: &BTreeMap<String, Value>,
		t: &PortableType,
	) -> Result<Packed, CodecError> {
		let mut ctx = PackCtx {
			arena,
			aliased: BTreeMap::new(),
			addresses: Vec::new(),
			busy: BTreeSet::new(),
		};
		let packed = self.pack_walk(value, t, &mut ctx)?;
		Ok(Packed {
			value: packed,
			aliased: ctx.aliased,
			addresses: ctx.addresses,
		})
	}

	/// Decode a wire value back into the in-memory form, resolving
	/// address references against the (possibly rewritten) vector.
	pub fn unpack(
		&self,
		value: &Value,
		arena: &BTreeMap<String, Value>,
		addresses: &[Address],
		t: &PortableType,
	) -> Result<Unpacked, CodecError> {
		let mut ctx = UnpackCtx {
			arena,
			addresses,
			aliased: BTreeMap::new(),
			busy: BTreeSet::new(),
		};
		let unpacked = self.unpack_walk(value, t, &mut ctx)?;
		Ok(Unpacked {
			value: unpacked,
			aliased: ctx.aliased,
		})
	}

	fn mismatch(t: &PortableType, v: &Value) -> CodecError {
		CodecError::Mismatch {
			expected: t.signature(),
			found: v.kind().to_string(),
		}
	}

	fn pack_walk(
		&self,
		value: &Value,
		t: &PortableType,
		ctx: &mut PackCtx<'_>,
	) -> Result<Value, CodecError> {
		use PortableType::*;
		match t {
			Boolean => match value {
				Value::Bool(b) => Ok(Value::Bool(*b)),
				_ => Err(Self::mismatch(t, value)),
			},
			Int2 | Int4 | Int8 | Uint2 | Uint4 | Uint8 | Byte | Rune => match value {
				Value::Int(i) => Ok(Value::Int(*i)),
				_ => Err(Self::mismatch(t, value)),
			},
			Float4 | Float8 => match value {
				Value::Float(f) => Ok(Value::Float(*f)),
				Value::Int(i) => Ok(Value::Float(*i as f64)),
				_ => Err(Self::mismatch(t, value)),
			},
			Character => match value {
				Value::Str(s) if s.chars().count() == 1 => Ok(value.clone()),
				_ => Err(Self::mismatch(t, value)),
			},
			Block => match value {
				Value::Bytes(_) => Ok(value.clone()),
				_ => Err(Self::mismatch(t, value)),
			},
			Str | Unicode => match value {
				Value::Str(_) => Ok(value.clone()),
				_ => Err(Self::mismatch(t, value)),
			},
			Clock => Self::check_time(value, t, clock::text_to_clock),
			World => Self::check_time(value, t, clock::text_to_world),
			Span => Self::check_time(value, t, clock::text_to_span),
			Delta => Self::check_time(value, t, clock::text_to_delta),
			Uuid => match value {
				Value::Str(s) => {
					uuid::Uuid::parse_str(s).map_err(|_| Self::mismatch(t, value))?;
					Ok(value.clone())
				}
				_ => Err(Self::mismatch(t, value)),
			},
			Enumeration(domain) => {
				let member = value.as_str().ok_or_else(|| Self::mismatch(t, value))?;
				let known = self
					.reg
					.types
					.enum_domain(domain)
					.ok_or_else(|| CodecError::OutOfDomain {
						domain: domain.clone(),
						member: member.to_string(),
					})?;
				if !known.contains(member) {
					return Err(CodecError::OutOfDomain {
						domain: domain.clone(),
						member: member.to_string(),
					});
				}
				Ok(value.clone())
			}
			UserDefined(name) => {
				let runtime = self.runtime(name)?;
				let fields = Self::record_fields(value, t)?;
				let mut packed = BTreeMap::new();
				for (field, field_t) in &runtime.schema {
					let field_v = match fields.get(field) {
						Some(v) => self.pack_walk(v, field_t, ctx)?,
						None => {
							return Err(CodecError::MissingField {
								name: name.clone(),
								field: field.clone(),
							});
						}
					};
					packed.insert(field.clone(), field_v);
				}
				Ok(Value::Record(packed))
			}
			ArrayOf(inner, n) => {
				let items = Self::container_items(value, t)?;
				if items.len() != *n {
					return Err(CodecError::ArrayLength {
						expected: *n,
						found: items.len(),
					});
				}
				let packed = items
					.iter()
					.map(|v| self.pack_walk(v, inner, ctx))
					.collect::<Result<Vec<_>, _>>()?;
				Ok(Value::List(packed))
			}
			VectorOf(inner) | DequeOf(inner) => {
				let items = Self::container_items(value, t)?;
				let packed = items
					.iter()
					.map(|v| self.pack_walk(v, inner, ctx))
					.collect::<Result<Vec<_>, _>>()?;
				Ok(Value::List(packed))
			}
			SetOf(inner) => {
				let items = Self::container_items(value, t)?;
				let mut packed = items
					.iter()
					.map(|v| self.pack_walk(v, inner, ctx))
					.collect::<Result<Vec<_>, _>>()?;
				// Canonical ordering makes re-encoding byte stable.
				packed.sort_by_key(render_key);
				Ok(Value::List(packed))
			}
			MapOf(key_t, value_t) => {
				let pairs = match value {
					Value::Map(pairs) => pairs,
					Value::Null => {
						return Err(CodecError::NullContainer {
							expected: t.signature(),
						});
					}
					_ => return Err(Self::mismatch(t, value)),
				};
				let mut packed = pairs
					.iter()
					.map(|(k, v)| {
						Ok(Value::List(vec![
							self.pack_walk(k, key_t, ctx)?,
							self.pack_walk(v, value_t, ctx)?,
						]))
					})
					.collect::<Result<Vec<_>, CodecError>>()?;
				packed.sort_by_key(render_key);
				Ok(Value::List(packed))
			}
			PointerTo(inner) => match value {
				Value::Null => Ok(Value::Null),
				Value::Alias(key) => {
					if !ctx.aliased.contains_key(key) && !ctx.busy.contains(key) {
						let target =
							ctx.arena
								.get(key)
								.cloned()
								.ok_or_else(|| CodecError::DanglingAlias {
									alias: key.clone(),
								})?;
						ctx.busy.insert(key.clone());
						let packed = self.pack_walk(&target, inner, ctx)?;
						ctx.busy.remove(key);
						ctx.aliased.insert(key.clone(), packed);
					}
					Ok(Value::Str(key.clone()))
				}
				_ => Err(Self::mismatch(t, value)),
			},
			Any => match value {
				Value::Null => Ok(Value::Null),
				Value::List(items) if items.len() == 2 && items[0].as_str().is_some() => {
					let name = items[0].as_str().unwrap_or_default();
					match self.reg.find_name(name) {
						Some(runtime) => {
							let inner_t = PortableType::UserDefined(runtime.name.clone());
							let packed = self.pack_walk(&items[1], &inner_t, ctx)?;
							Ok(Value::List(vec![items[0].clone(), packed]))
						}
						// Incognito payload: carried as a word.
						None => Ok(value.clone()),
					}
				}
				_ => Err(Self::mismatch(t, value)),
			},
			Type => match value {
				Value::Str(s) => {
					PortableType::from_text(s)?;
					Ok(value.clone())
				}
				_ => Err(Self::mismatch(t, value)),
			},
			TargetAddress | PortableType::Address => match value {
				Value::Address(a) => {
					let index = ctx.addresses.len() as i64;
					ctx.addresses.push(a.clone());
					Ok(Value::Int(index))
				}
				_ => Err(Self::mismatch(t, value)),
			},
			Word => Ok(value.clone()),
		}
	}

	fn unpack_walk(
		&self,
		value: &Value,
		t: &PortableType,
		ctx: &mut UnpackCtx<'_>,
	) -> Result<Value, CodecError> {
		use PortableType::*;
		match t {
			Boolean => match value {
				Value::Bool(_) => Ok(value.clone()),
				_ => Err(Self::mismatch(t, value)),
			},
			Int2 | Int4 | Int8 | Uint2 | Uint4 | Uint8 | Byte | Rune => match value {
				Value::Int(_) => Ok(value.clone()),
				_ => Err(Self::mismatch(t, value)),
			},
			Float4 | Float8 => match value {
				Value::Float(_) => Ok(value.clone()),
				Value::Int(i) => Ok(Value::Float(*i as f64)),
				_ => Err(Self::mismatch(t, value)),
			},
			Character => match value {
				Value::Str(s) if s.chars().count() == 1 => Ok(value.clone()),
				_ => Err(Self::mismatch(t, value)),
			},
			Block => match value {
				Value::Bytes(_) => Ok(value.clone()),
				// The JSON form of a block is base64 text.
				Value::Str(s) => BASE64
					.decode(s)
					.map(Value::Bytes)
					.map_err(|_| Self::mismatch(t, value)),
				_ => Err(Self::mismatch(t, value)),
			},
			Clock => Self::check_time(value, t, clock::text_to_clock),
			World => Self::check_time(value, t, clock::text_to_world),
			Span => Self::check_time(value, t, clock::text_to_span),
			Delta => Self::check_time(value, t, clock::text_to_delta),
			Uuid | Type => match value {
				Value::Str(_) => Ok(value.clone()),
				_ => Err(Self::mismatch(t, value)),
			},
			Enumeration(domain) => {
				let member = value.as_str().ok_or_else(|| Self::mismatch(t, value))?;
				let known =
					self.reg
						.types
						.enum_domain(domain)
						.ok_or_else(|| CodecError::OutOfDomain {
							domain: domain.clone(),
							member: member.to_string(),
						})?;
				if !known.contains(member) {
					return Err(CodecError::OutOfDomain {
						domain: domain.clone(),
						member: member.to_string(),
					});
				}
				Ok(value.clone())
			}
			UserDefined(name) => {
				let runtime = self.runtime(name)?;
				let fields = Self::record_fields(value, t)?;
				let mut unpacked = BTreeMap::new();
				// Unknown wire attributes are ignored; absent ones take
				// the type's zero value.
				for (field, field_t) in &runtime.schema {
					let field_v = match fields.get(field) {
						Some(v) => self.unpack_walk(v, field_t, ctx)?,
						None => self.zero(field_t),
					};
					unpacked.insert(field.clone(), field_v);
				}
				Ok(Value::Record(unpacked))
			}
			ArrayOf(inner, n) => {
				let items = Self::container_items(value, t)?;
				let mut unpacked = Vec::with_capacity(*n);
				for v in items.iter().take(*n) {
					unpacked.push(self.unpack_walk(v, inner, ctx)?);
				}
				// Short arrays pad right with zero values; long ones
				// were truncated by the take above.
				while unpacked.len() < *n {
					unpacked.push(self.zero(inner));
				}
				Ok(Value::List(unpacked))
			}
			VectorOf(inner) | DequeOf(inner) | SetOf(inner) => {
				let items = Self::container_items(value, t)?;
				let unpacked = items
					.iter()
					.map(|v| self.unpack_walk(v, inner, ctx))
					.collect::<Result<Vec<_>, _>>()?;
				Ok(Value::List(unpacked))
			}
			MapOf(key_t, value_t) => {
				let items = Self::container_items(value, t)?;
				let mut pairs = Vec::with_capacity(items.len());
				for item in items {
					let pair = match item {
						Value::List(kv) if kv.len() == 2 => kv,
						_ => return Err(Self::mismatch(t, item)),
					};
					pairs.push((
						self.unpack_walk(&pair[0], key_t, ctx)?,
						self.unpack_walk(&pair[1], value_t, ctx)?,
					));
				}
				Ok(Value::Map(pairs))
			}
			PointerTo(inner) => match value {
				Value::Null => Ok(Value::Null),
				Value::Str(key) | Value::Alias(key) => {
					if !ctx.aliased.contains_key(key) && !ctx.busy.contains(key) {
						let target =
							ctx.arena
								.get(key)
								.cloned()
								.ok_or_else(|| CodecError::DanglingAlias {
									alias: key.clone(),
								})?;
						ctx.busy.insert(key.clone());
						let unpacked = self.unpack_walk(&target, inner, ctx)?;
						ctx.busy.remove(key);
						ctx.aliased.insert(key.clone(), unpacked);
					}
					Ok(Value::Alias(key.clone()))
				}
				_ => Err(Self::mismatch(t, value)),
			},
			Any => match value {
				Value::Null => Ok(Value::Null),
				Value::List(items) if items.len() == 2 && items[0].as_str().is_some() => {
					let name = items[0].as_str().unwrap_or_default();
					match self.reg.find_name(name) {
						Some(runtime) => {
							let inner_t = PortableType::UserDefined(runtime.name.clone());
							let unpacked = self.unpack_walk(&items[1], &inner_t, ctx)?;
							Ok(Value::List(vec![items[0].clone(), unpacked]))
						}
						None => Ok(value.clone()),
					}
				}
				_ => Err(Self::mismatch(t, value)),
			},
			TargetAddress | PortableType::Address => match value {
				Value::Int(index) => {
					let address = ctx
						.addresses
						.get(*index as usize)
						.cloned()
						.unwrap_or_else(Address::null);
					Ok(Value::Address(address))
				}
				Value::Address(_) => Ok(value.clone()),
				_ => Err(Self::mismatch(t, value)),
			},
			Word => Ok(value.clone()),
		}
	}

	fn runtime(
		&self,
		name: &str,
	) -> Result<Arc<crate::registry::MessageRuntime>, CodecError> {
		self.reg
			.find_name(name)
			.ok_or_else(|| crate::error::RegistrationError::UnknownType {
				name: name.to_string(),
				referrer: "codec".to_string(),
			})
			.map_err(CodecError::from)
	}

	fn check_time<T>(
		value: &Value,
		t: &PortableType,
		parse: fn(&str) -> Result<T, CodecError>,
	) -> Result<Value, CodecError> {
		let text = value.as_str().ok_or_else(|| Self::mismatch(t, value))?;
		parse(text)?;
		Ok(value.clone())
	}

	fn record_fields<'v>(
		value: &'v Value,
		t: &PortableType,
	) -> Result<&'v BTreeMap<String, Value>, CodecError> {
		match value {
			Value::Record(fields) => Ok(fields),
			Value::Null => Err(CodecError::NullContainer {
				expected: t.signature(),
			}),
			_ => Err(Self::mismatch(t, value)),
		}
	}

	fn container_items<'v>(value: &'v Value, t: &PortableType) -> Result<&'v [Value], CodecError> {
		match value {
			Value::List(items) => Ok(items),
			Value::Null => Err(CodecError::NullContainer {
				expected: t.signature(),
			}),
			_ => Err(Self::mismatch(t, value)),
		}
	}

	/// The zero value of a type, used to right-pad short arrays and
	/// to fill attributes absent from the wire form.
	pub fn zero(&self, t: &PortableType) -> Value {
		use PortableType::*;
		match t {
			Boolean => Value::Bool(false),
			Int2 | Int4 | Int8 | Uint2 | Uint4 | Uint8 | Byte | Rune => Value::Int(0),
			Float4 | Float8 => Value::Float(0.0),
			Character => Value::Str(" ".to_string()),
			Block => Value::Bytes(Vec::new()),
			Str | Unicode => Value::Str(String::new()),
			Clock | World => Value::Str("1970-01-01T00:00:00.000000Z".to_string()),
			Span | Delta => Value::Str("00:00:00".to_string()),
			Uuid => Value::Str(uuid::Uuid::nil().to_string()),
			Enumeration(domain) => self
				.reg
				.types
				.enum_domain(domain)
				.and_then(|d| d.members.first().cloned())
				.map(Value::Str)
				.unwrap_or(Value::Null),
			UserDefined(name) => match self.reg.find_name(name) {
				Some(runtime) => Value::Record(
					runtime
						.schema
						.iter()
						.map(|(field, field_t)| (field.clone(), self.zero(field_t)))
						.collect(),
				),
				None => Value::Null,
			},
			ArrayOf(inner, n) => Value::List((0..*n).map(|_| self.zero(inner)).collect()),
			VectorOf(_) | DequeOf(_) | SetOf(_) => Value::List(Vec::new()),
			MapOf(_, _) => Value::Map(Vec::new()),
			PointerTo(_) | Any => Value::Null,
			Type => Value::Str("word".to_string()),
			TargetAddress | PortableType::Address => {
				Value::Address(crate::address::Address::null())
			}
			Word => Value::Null,
		}
	}
}

/// Deterministic ordering key for canonical set/map encoding.
fn render_key(v: &Value) -> String {
	format!("{v:?}")
}

/// Build the in-memory `Any` envelope `[type-name, value]` for a
/// message. An [`Incognito`] unfolds back to its original pair, so
/// unknown types survive a relay unchanged.
pub fn encode_any(reg: &MessageRegistry, message: &dyn Message) -> Result<Value, CodecError> {
	if let Some(incognito) = message.downcast_ref::<Incognito>() {
		return Ok(Value::List(vec![
			Value::Str(incognito.type_name.clone()),
			incognito.word.clone(),
		]));
	}

	let runtime = reg
		.find_message(message)
		.ok_or_else(|| CodecError::NotPortable {
			name: format!("{message:?}"),
		})?;
	if !runtime.flags.portable {
		return Err(CodecError::NotPortable {
			name: runtime.name.clone(),
		});
	}

	let memory = (runtime.to_value)(message, reg)?;
	Ok(Value::List(vec![Value::Str(runtime.name.clone()), memory]))
}

/// Resolve an in-memory `Any` envelope back to a message. A type name
/// with no local registration yields an [`Incognito`] carrying the
/// raw word.
pub fn decode_any(reg: &MessageRegistry, memory: &Value) -> Result<Arc<dyn Message>, CodecError> {
	let items = match memory {
		Value::List(items) if items.len() == 2 => items,
		_ => {
			return Err(CodecError::Mismatch {
				expected: "any".to_string(),
				found: memory.kind().to_string(),
			});
		}
	};
	let name = items[0].as_str().ok_or_else(|| CodecError::Mismatch {
		expected: "any".to_string(),
		found: items[0].kind().to_string(),
	})?;

	match reg.find_name(name) {
		Some(runtime) => (runtime.from_value)(&items[1], reg),
		None => Ok(Arc::new(Incognito {
			type_name: name.to_string(),
			word: items[1].clone(),
		})),
	}
}

/// Encode a full message body for the wire: the `Any` envelope packed
/// as JSON text, plus the pointer side table and address vector.
pub fn encode_body(
	reg: &MessageRegistry,
	message: &dyn Message,
) -> Result<(Vec<u8>, Vec<Address>), CodecError> {
	let memory = encode_any(reg, message)?;
	let codec = Codec::new(reg);
	let packed = codec.pack(&memory, &BTreeMap::new(), &PortableType::Any)?;

	let mut body = BTreeMap::new();
	body.insert("value".to_string(), packed.value);
	body.insert("aliased".to_string(), Value::Record(packed.aliased));
	let text = value_to_text(&Value::Record(body));
	Ok((text.into_bytes(), packed.addresses))
}

/// Decode a wire body produced by [`encode_body`], with the frame's
/// (rewritten) address vector.
pub fn decode_body(
	reg: &MessageRegistry,
	body: &[u8],
	addresses: &[Address],
) -> Result<Arc<dyn Message>, CodecError> {
	let text = std::str::from_utf8(body).map_err(|_| CodecError::Mismatch {
		expected: "utf-8 body".to_string(),
		found: "bytes".to_string(),
	})?;
	let tree = text_to_value(text)?;
	let value = tree.get("value").ok_or_else(|| CodecError::MissingField {
		name: "body".to_string(),
		field: "value".to_string(),
	})?;
	let arena = match tree.get("aliased") {
		Some(Value::Record(fields)) => fields.clone(),
		_ => BTreeMap::new(),
	};

	let codec = Codec::new(reg);
	let unpacked = codec.unpack(value, &arena, addresses, &PortableType::Any)?;
	decode_any(reg, &unpacked.value)
}

/// JSON text bridge: the wire rendering of an encoded tree.
pub fn value_to_json(value: &Value) -> serde_json::Value {
	use serde_json::json;
	match value {
		Value::Null => serde_json::Value::Null,
		Value::Bool(b) => json!(b),
		Value::Int(i) => json!(i),
		Value::Float(f) => json!(f),
		Value::Str(s) => json!(s),
		Value::Bytes(b) => json!(BASE64.encode(b)),
		Value::List(items) => serde_json::Value::Array(items.iter().map(value_to_json).collect()),
		Value::Record(fields) => serde_json::Value::Object(
			fields
				.iter()
				.map(|(k, v)| (k.clone(), value_to_json(v)))
				.collect(),
		),
		Value::Map(pairs) => serde_json::Value::Array(
			pairs
				.iter()
				.map(|(k, v)| serde_json::Value::Array(vec![value_to_json(k), value_to_json(v)]))
				.collect(),
		),
		Value::Address(a) => serde_json::Value::Array(a.hops().iter().map(|h| json!(h)).collect()),
		Value::Alias(key) => json!(key),
	}
}

/// JSON text bridge, inbound. The generic tree is type-agnostic; the
/// typed walker resolves blocks, aliases and address references when
/// it knows the expected type.
pub fn json_to_value(json: &serde_json::Value) -> Value {
	match json {
		serde_json::Value::Null => Value::Null,
		serde_json::Value::Bool(b) => Value::Bool(*b),
		serde_json::Value::Number(n) => {
			if let Some(i) = n.as_i64() {
				Value::Int(i)
			} else {
				Value::Float(n.as_f64().unwrap_or(0.0))
			}
		}
		serde_json::Value::String(s) => Value::Str(s.clone()),
		serde_json::Value::Array(items) => Value::List(items.iter().map(json_to_value).collect()),
		serde_json::Value::Object(fields) => Value::Record(
			fields
				.iter()
				.map(|(k, v)| (k.clone(), json_to_value(v)))
				.collect(),
		),
	}
}

pub fn value_to_text(value: &Value) -> String {
	value_to_json(value).to_string()
}

pub fn text_to_value(text: &str) -> Result<Value, CodecError> {
	let json: serde_json::Value = serde_json::from_str(text)?;
	Ok(json_to_value(&json))
}
