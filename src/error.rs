use thiserror::Error;

/// Failures raised while binding types, machines or routines to the
/// runtime. All of these are programming errors surfaced at
/// registration time, before any message flows.
#[derive(Debug, Error)]
pub enum RegistrationError {
	#[error("malformed signature {signature:?} at byte {at}")]
	BadSignature { signature: String, at: usize },

	#[error("type {name:?} referenced by {referrer:?} is not registered")]
	UnknownType { name: String, referrer: String },

	#[error("enum domain {name:?} is not registered")]
	UnknownEnum { name: String },

	#[error("{name:?} is already registered with a different schema")]
	SchemaConflict { name: String },

	#[error("cannot infer a schema for {name:?}: {detail}")]
	SchemaAmbiguity { name: String, detail: String },

	#[error("container hint for {name:?} is missing its element type")]
	BareContainer { name: String },
}

/// Failures raised while encoding or decoding a value against a
/// portable type.
#[derive(Debug, Error)]
pub enum CodecError {
	#[error("value does not match type {expected}: found {found}")]
	Mismatch { expected: String, found: String },

	#[error("enum {domain:?} has no member {member:?}")]
	OutOfDomain { domain: String, member: String },

	#[error("invalid time text {text:?}")]
	BadTime { text: String },

	#[error("array of length {expected} cannot encode {found} items")]
	ArrayLength { expected: usize, found: usize },

	#[error("missing field {field:?} of {name:?}")]
	MissingField { name: String, field: String },

	#[error("null where a container was expected ({expected})")]
	NullContainer { expected: String },

	#[error("unresolved pointer alias {alias:?}")]
	DanglingAlias { alias: String },

	#[error("message type {name:?} is not portable")]
	NotPortable { name: String },

	#[error("malformed wire text: {0}")]
	BadText(#[from] serde_json::Error),

	#[error("{0}")]
	Registration(#[from] RegistrationError),
}

/// Failures raised by the transport engine while setting up or
/// tearing down sockets. Session-level outcomes such as `Closed` and
/// `Abandoned` are messages, not errors; see [`crate::message`].
#[derive(Debug, Error)]
pub enum TransportError {
	#[error("cannot listen at {requested}: {detail}")]
	CannotListen { requested: String, detail: String },

	#[error("cannot connect to {requested}: {detail}")]
	CannotConnect { requested: String, detail: String },

	#[error("frame exceeds the size cap: {announced} > {cap}")]
	FrameTooBig { announced: usize, cap: usize },

	#[error("malformed frame header: {detail}")]
	BadFrame { detail: String },

	#[error("encryption handshake failed: {detail}")]
	Handshake { detail: String },

	#[error("peer closed during {phase}")]
	PeerClosed { phase: &'static str },

	#[error(transparent)]
	Io(#[from] std::io::Error),

	#[error(transparent)]
	Codec(#[from] CodecError),
}

/// Failures surfaced by `select` on a channel.
#[derive(Debug, Error)]
pub enum SelectError {
	#[error("channel input is closed")]
	Closed,

	#[error("select is only valid on objects that own their task")]
	NotThreaded,
}
