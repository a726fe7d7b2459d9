use std::fmt;

use crate::error::RegistrationError;

/// A portable type descriptor: the closed, introspectable type universe
/// shared by every process in a federation, independent of Rust's own
/// reflection story.
///
/// Every descriptor has a canonical signature string (see
/// [`PortableType::signature`]); the signature is the durable identity
/// used for cross-process type matching. Identical signatures collapse
/// to a single interned instance in the [`crate::registry::TypeRegistry`].
#[derive(Clone, PartialEq, Eq, Hash)]
pub enum PortableType {
	Boolean,
	Int2,
	Int4,
	Int8,
	Uint2,
	Uint4,
	Uint8,
	Float4,
	Float8,
	Byte,
	Character,
	Rune,
	Block,
	Str,
	Unicode,
	Clock,
	Span,
	World,
	Delta,
	Uuid,
	/// Bound to a concrete enum domain registered under this name.
	Enumeration(String),
	/// A registered compound, named by its qualified type name.
	UserDefined(String),
	ArrayOf(Box<PortableType>, usize),
	VectorOf(Box<PortableType>),
	DequeOf(Box<PortableType>),
	SetOf(Box<PortableType>),
	MapOf(Box<PortableType>, Box<PortableType>),
	PointerTo(Box<PortableType>),
	Any,
	Type,
	TargetAddress,
	Address,
	Word,
}

impl PortableType {
	/// Render the canonical signature. The grammar is stable and
	/// bit-exact; two descriptors are the same type iff their
	/// signatures are equal.
	pub fn signature(&self) -> String {
		let mut out = String::new();
		self.write_signature(&mut out);
		out
	}

	fn write_signature(&self, out: &mut String) {
		use PortableType::*;
		match self {
			Boolean => out.push_str("boolean"),
			Int2 => out.push_str("int2"),
			Int4 => out.push_str("int4"),
			Int8 => out.push_str("int8"),
			Uint2 => out.push_str("uint2"),
			Uint4 => out.push_str("uint4"),
			Uint8 => out.push_str("uint8"),
			Float4 => out.push_str("float4"),
			Float8 => out.push_str("float8"),
			Byte => out.push_str("byte"),
			Character => out.push_str("character"),
			Rune => out.push_str("rune"),
			Block => out.push_str("block"),
			Str => out.push_str("string"),
			Unicode => out.push_str("unicode"),
			Clock => out.push_str("clock"),
			Span => out.push_str("span"),
			World => out.push_str("world"),
			Delta => out.push_str("delta"),
			Uuid => out.push_str("uuid"),
			Enumeration(name) => {
				out.push_str("enum<");
				out.push_str(name);
				out.push('>');
			}
			UserDefined(name) => {
				out.push_str("udt<");
				out.push_str(name);
				out.push('>');
			}
			ArrayOf(t, n) => {
				out.push_str("array<");
				t.write_signature(out);
				out.push(',');
				out.push_str(&n.to_string());
				out.push('>');
			}
			VectorOf(t) => {
				out.push_str("vector<");
				t.write_signature(out);
				out.push('>');
			}
			DequeOf(t) => {
				out.push_str("deque<");
				t.write_signature(out);
				out.push('>');
			}
			SetOf(t) => {
				out.push_str("set<");
				t.write_signature(out);
				out.push('>');
			}
			MapOf(k, v) => {
				out.push_str("map<");
				k.write_signature(out);
				out.push(',');
				v.write_signature(out);
				out.push('>');
			}
			PointerTo(t) => {
				out.push_str("pointer<");
				t.write_signature(out);
				out.push('>');
			}
			Any => out.push_str("any"),
			Type => out.push_str("type"),
			TargetAddress => out.push_str("target"),
			Address => out.push_str("address"),
			Word => out.push_str("word"),
		}
	}

	/// Persistence form; identical to the signature.
	pub fn to_text(&self) -> String {
		self.signature()
	}

	/// Parse a signature back into a descriptor.
	pub fn from_text(text: &str) -> Result<PortableType, RegistrationError> {
		let mut parser = SignatureParser::new(text);
		let t = parser.parse()?;
		parser.expect_end()?;
		Ok(t)
	}

	/// A short human tag for log lines, e.g. `map<string,int8>` becomes
	/// `M:s-i8`. Tags are for people; signatures are for machines.
	pub fn tag(&self) -> String {
		use PortableType::*;
		match self {
			Boolean => "b".into(),
			Int2 => "i2".into(),
			Int4 => "i4".into(),
			Int8 => "i8".into(),
			Uint2 => "u2".into(),
			Uint4 => "u4".into(),
			Uint8 => "u8".into(),
			Float4 => "f4".into(),
			Float8 => "f8".into(),
			Byte => "y".into(),
			Character => "c".into(),
			Rune => "r".into(),
			Block => "k".into(),
			Str => "s".into(),
			Unicode => "u".into(),
			Clock => "t".into(),
			Span => "d".into(),
			World => "T".into(),
			Delta => "D".into(),
			Uuid => "U".into(),
			Enumeration(name) => format!("E:{}", short_name(name)),
			UserDefined(name) => short_name(name).to_string(),
			ArrayOf(t, n) => format!("A{n}:{}", t.tag()),
			VectorOf(t) => format!("V:{}", t.tag()),
			DequeOf(t) => format!("Q:{}", t.tag()),
			SetOf(t) => format!("S:{}", t.tag()),
			MapOf(k, v) => format!("M:{}-{}", k.tag(), v.tag()),
			PointerTo(t) => format!("P:{}", t.tag()),
			Any => "a".into(),
			Type => "y!".into(),
			TargetAddress => "@!".into(),
			Address => "@".into(),
			Word => "w".into(),
		}
	}
}

impl fmt::Debug for PortableType {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.signature())
	}
}

fn short_name(qualified: &str) -> &str {
	qualified.rsplit('.').next().unwrap_or(qualified)
}

/// Short tag for an arbitrary signature string, used by the log task.
pub fn signature_to_tag(signature: &str) -> String {
	match PortableType::from_text(signature) {
		Ok(t) => t.tag(),
		Err(_) => signature.to_string(),
	}
}

/// The descriptor a plain Rust type converts to. Containers compose
/// through their element types, so a bare container cannot even be
/// named; compounds and enumerations have no blanket mapping and are
/// declared explicitly against their registered names.
pub trait Hint {
	fn hint() -> PortableType;
}

macro_rules! hints {
	($($t:ty => $pt:expr),+ $(,)?) => {
		$(
			impl Hint for $t {
				fn hint() -> PortableType {
					$pt
				}
			}
		)+
	};
}

hints! {
	bool => PortableType::Boolean,
	i16 => PortableType::Int2,
	i32 => PortableType::Int4,
	i64 => PortableType::Int8,
	u16 => PortableType::Uint2,
	u32 => PortableType::Uint4,
	u64 => PortableType::Uint8,
	f32 => PortableType::Float4,
	f64 => PortableType::Float8,
	char => PortableType::Character,
	String => PortableType::Str,
	chrono::DateTime<chrono::Utc> => PortableType::Clock,
	chrono::DateTime<chrono::FixedOffset> => PortableType::World,
	chrono::Duration => PortableType::Span,
	uuid::Uuid => PortableType::Uuid,
	crate::address::Address => PortableType::Address,
	crate::value::Value => PortableType::Word,
}

impl<T: Hint> Hint for Vec<T> {
	fn hint() -> PortableType {
		PortableType::VectorOf(Box::new(T::hint()))
	}
}

impl<T: Hint> Hint for std::collections::VecDeque<T> {
	fn hint() -> PortableType {
		PortableType::DequeOf(Box::new(T::hint()))
	}
}

impl<T: Hint> Hint for std::collections::BTreeSet<T> {
	fn hint() -> PortableType {
		PortableType::SetOf(Box::new(T::hint()))
	}
}

impl<K: Hint, V: Hint> Hint for std::collections::BTreeMap<K, V> {
	fn hint() -> PortableType {
		PortableType::MapOf(Box::new(K::hint()), Box::new(V::hint()))
	}
}

impl<T: Hint, const N: usize> Hint for [T; N] {
	fn hint() -> PortableType {
		PortableType::ArrayOf(Box::new(T::hint()), N)
	}
}

struct SignatureParser<'a> {
	text: &'a str,
	pos: usize,
}

impl<'a> SignatureParser<'a> {
	fn new(text: &'a str) -> Self {
		Self { text, pos: 0 }
	}

	fn rest(&self) -> &'a str {
		&self.text[self.pos..]
	}

	fn eat(&mut self, token: &str) -> bool {
		if self.rest().starts_with(token) {
			self.pos += token.len();
			true
		} else {
			false
		}
	}

	fn expect(&mut self, token: &str) -> Result<(), RegistrationError> {
		if self.eat(token) {
			Ok(())
		} else {
			Err(self.bad())
		}
	}

	fn expect_end(&mut self) -> Result<(), RegistrationError> {
		if self.rest().is_empty() {
			Ok(())
		} else {
			Err(self.bad())
		}
	}

	fn bad(&self) -> RegistrationError {
		RegistrationError::BadSignature {
			signature: self.text.to_string(),
			at: self.pos,
		}
	}

	fn name(&mut self) -> Result<String, RegistrationError> {
		let rest = self.rest();
		let end = rest
			.find(|c: char| c == '<' || c == '>' || c == ',')
			.unwrap_or(rest.len());
		if end == 0 {
			return Err(self.bad());
		}
		self.pos += end;
		Ok(rest[..end].to_string())
	}

	fn number(&mut self) -> Result<usize, RegistrationError> {
		let rest = self.rest();
		let end = rest
			.find(|c: char| !c.is_ascii_digit())
			.unwrap_or(rest.len());
		if end == 0 {
			return Err(self.bad());
		}
		let n = rest[..end].parse().map_err(|_| self.bad())?;
		self.pos += end;
		Ok(n)
	}

	fn parse(&mut self) -> Result<PortableType, RegistrationError> {
		use PortableType::*;
		// Longest match first where one keyword prefixes another.
		const PRIMS: &[(&str, PortableType)] = &[
			("boolean", Boolean),
			("int2", Int2),
			("int4", Int4),
			("int8", Int8),
			("uint2", Uint2),
			("uint4", Uint4),
			("uint8", Uint8),
			("float4", Float4),
			("float8", Float8),
			("byte", Byte),
			("character", Character),
			("rune", Rune),
			("block", Block),
			("string", Str),
			("unicode", Unicode),
			("clock", Clock),
			("span", Span),
			("world", World),
			("delta", Delta),
			("uuid", Uuid),
			("any", Any),
			("type", Type),
			("target", TargetAddress),
			("address", Address),
			("word", Word),
		];

		if self.eat("enum<") {
			let name = self.name()?;
			self.expect(">")?;
			return Ok(Enumeration(name));
		}
		if self.eat("udt<") {
			let name = self.name()?;
			self.expect(">")?;
			return Ok(UserDefined(name));
		}
		if self.eat("array<") {
			let t = self.parse()?;
			self.expect(",")?;
			let n = self.number()?;
			self.expect(">")?;
			return Ok(ArrayOf(Box::new(t), n));
		}
		if self.eat("vector<") {
			let t = self.parse()?;
			self.expect(">")?;
			return Ok(VectorOf(Box::new(t)));
		}
		if self.eat("deque<") {
			let t = self.parse()?;
			self.expect(">")?;
			return Ok(DequeOf(Box::new(t)));
		}
		if self.eat("set<") {
			let t = self.parse()?;
			self.expect(">")?;
			return Ok(SetOf(Box::new(t)));
		}
		if self.eat("map<") {
			let k = self.parse()?;
			self.expect(",")?;
			let v = self.parse()?;
			self.expect(">")?;
			return Ok(MapOf(Box::new(k), Box::new(v)));
		}
		if self.eat("pointer<") {
			let t = self.parse()?;
			self.expect(">")?;
			return Ok(PointerTo(Box::new(t)));
		}

		for (word, t) in PRIMS {
			let followed_by_tick = self
				.rest()
				.strip_prefix(word)
				.map(|r| r.starts_with(|c: char| c.is_ascii_alphanumeric()))
				.unwrap_or(true);
			if !followed_by_tick && self.eat(word) {
				return Ok(t.clone());
			}
		}

		Err(self.bad())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn primitive_signatures() {
		assert_eq!(PortableType::Boolean.signature(), "boolean");
		assert_eq!(PortableType::Int8.signature(), "int8");
		assert_eq!(PortableType::TargetAddress.signature(), "target");
	}

	#[test]
	fn container_signatures() {
		let t = PortableType::MapOf(
			Box::new(PortableType::Str),
			Box::new(PortableType::VectorOf(Box::new(PortableType::Int4))),
		);
		assert_eq!(t.signature(), "map<string,vector<int4>>");

		let a = PortableType::ArrayOf(Box::new(PortableType::Float8), 16);
		assert_eq!(a.signature(), "array<float8,16>");
	}

	#[test]
	fn text_round_trip() {
		let cases = [
			"boolean",
			"uint2",
			"array<int8,4>",
			"vector<udt<acme.Job>>",
			"deque<block>",
			"set<string>",
			"map<string,pointer<udt<acme.Node>>>",
			"enum<acme.Mood>",
			"any",
			"type",
			"target",
			"address",
			"word",
		];
		for case in cases {
			let t = PortableType::from_text(case).unwrap();
			assert_eq!(t.signature(), case);
		}
	}

	#[test]
	fn malformed_signatures_fail() {
		for bad in ["", "in", "int", "vector<", "array<int8>", "map<string>", "int8 "] {
			assert!(PortableType::from_text(bad).is_err(), "{bad:?} parsed");
		}
	}

	#[test]
	fn hints_compose_through_containers() {
		assert_eq!(i64::hint(), PortableType::Int8);
		assert_eq!(
			<Vec<String>>::hint().signature(),
			"vector<string>"
		);
		assert_eq!(
			<std::collections::BTreeMap<String, Vec<f64>>>::hint().signature(),
			"map<string,vector<float8>>"
		);
		assert_eq!(<[u16; 4]>::hint().signature(), "array<uint2,4>");
	}
}
