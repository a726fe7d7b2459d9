//! The socket engine: one ListenConnect service owns every socket in
//! the process. Other objects ask it to listen or connect; each live
//! connection gets a proxy object whose address makes the far side
//! reachable with ordinary sends, a reader task, a writer task, and a
//! keeper child driving the liveness probe.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;

use parking_lot::Mutex;
use tokio::io::AsyncWriteExt;
use tokio::io::BufReader;
use tokio::net::TcpListener;
use tokio::net::TcpStream;
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::time::Duration;
use tokio::time::Instant;

use crate::address::Address;
use crate::codec;
use crate::error::CodecError;
use crate::error::RegistrationError;
use crate::error::TransportError;
use crate::log::LogTag;
use crate::log::PointLog;
use crate::mailbox;
use crate::mailbox::MailboxSender;
use crate::message::Blob;
use crate::message::Frame;
use crate::message::Message;
use crate::message::Portable;
use crate::message::Stop;
use crate::message::TimedOut;
use crate::message::field;
use crate::portable::Hint;
use crate::portable::PortableType;
use crate::registry::MessageFlags;
use crate::registry::MessageRegistry;
use crate::registry::Schema;
use crate::runtime::ObjectRecord;
use crate::runtime::Runtime;
use crate::seal::Handshake;
use crate::seal::Opener;
use crate::seal::Sealer;
use crate::seal::Side;
use crate::teardown::TeardownToken;
use crate::value::Value;
use crate::wire;
use crate::wire::WireFrame;
use crate::wire::WireHeader;

/// Seconds of silence before the keeper probes the peer.
pub const IDLE_TRANSPORT: f64 = 60.0;

/// Seconds the keeper waits for any response to its probe.
pub const RESPONSIVE_TRANSPORT: f64 = 5.0;

/// A listening or connecting endpoint.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct HostPort {
	pub host: String,
	pub port: u16,
}

impl HostPort {
	pub fn new(host: impl Into<String>, port: u16) -> Self {
		Self {
			host: host.into(),
			port,
		}
	}

	pub fn loopback(port: u16) -> Self {
		Self::new("127.0.0.1", port)
	}

	pub fn all_interfaces(port: u16) -> Self {
		Self::new("0.0.0.0", port)
	}
}

impl fmt::Display for HostPort {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}:{}", self.host, self.port)
	}
}

impl Message for HostPort {}

impl Portable for HostPort {
	const NAME: &'static str = "fabric.HostPort";

	fn schema() -> Schema {
		Schema::from([
			("host".to_string(), String::hint()),
			("port".to_string(), u16::hint()),
		])
	}

	fn to_value(&self, _reg: &MessageRegistry) -> Result<Value, CodecError> {
		Ok(Value::record([
			("host", Value::Str(self.host.clone())),
			("port", Value::Int(self.port as i64)),
		]))
	}

	fn from_value(value: &Value, _reg: &MessageRegistry) -> Result<Self, CodecError> {
		Ok(HostPort {
			host: field(value, "host", Self::NAME)?
				.as_str()
				.unwrap_or_default()
				.to_string(),
			port: field(value, "port", Self::NAME)?.as_int().unwrap_or(0) as u16,
		})
	}

	fn default_message() -> Self {
		HostPort::default()
	}
}

macro_rules! transport_record {
	($(#[$doc:meta])* $name:ident { $($field:ident : $t:ty => $pt:expr , $to:expr , $from:expr);* $(;)? } => $wire_name:literal) => {
		$(#[$doc])*
		#[derive(Clone, Debug, Default)]
		pub struct $name {
			$(pub $field: $t,)*
		}

		impl Message for $name {}

		impl Portable for $name {
			const NAME: &'static str = $wire_name;

			fn schema() -> Schema {
				#[allow(unused_mut)]
				let mut schema = Schema::new();
				$(schema.insert(stringify!($field).to_string(), $pt);)*
				schema
			}

			#[allow(unused_variables)]
			fn to_value(&self, reg: &MessageRegistry) -> Result<Value, CodecError> {
				#[allow(unused_mut)]
				let mut record: BTreeMap<String, Value> = BTreeMap::new();
				$(record.insert(stringify!($field).to_string(), ($to)(&self.$field, reg)?);)*
				Ok(Value::Record(record))
			}

			#[allow(unused_variables)]
			fn from_value(value: &Value, reg: &MessageRegistry) -> Result<Self, CodecError> {
				Ok($name {
					$($field: ($from)(field(value, stringify!($field), Self::NAME)?, reg)?,)*
				})
			}

			fn default_message() -> Self {
				Self::default()
			}
		}
	};
}

fn host_port_out(v: &HostPort, reg: &MessageRegistry) -> Result<Value, CodecError> {
	v.to_value(reg)
}

fn host_port_in(v: &Value, reg: &MessageRegistry) -> Result<HostPort, CodecError> {
	HostPort::from_value(v, reg)
}

fn string_out(v: &String, _reg: &MessageRegistry) -> Result<Value, CodecError> {
	Ok(Value::Str(v.clone()))
}

fn string_in(v: &Value, _reg: &MessageRegistry) -> Result<String, CodecError> {
	Ok(v.as_str().unwrap_or_default().to_string())
}

fn bool_out(v: &bool, _reg: &MessageRegistry) -> Result<Value, CodecError> {
	Ok(Value::Bool(*v))
}

fn bool_in(v: &Value, _reg: &MessageRegistry) -> Result<bool, CodecError> {
	Ok(v.as_bool().unwrap_or(false))
}

fn bytes_out(v: &Vec<u8>, _reg: &MessageRegistry) -> Result<Value, CodecError> {
	Ok(Value::Bytes(v.clone()))
}

fn bytes_in(v: &Value, _reg: &MessageRegistry) -> Result<Vec<u8>, CodecError> {
	match v {
		Value::Bytes(b) => Ok(b.clone()),
		_ => Ok(Vec::new()),
	}
}

fn address_out(v: &Address, _reg: &MessageRegistry) -> Result<Value, CodecError> {
	Ok(Value::Address(v.clone()))
}

fn address_in(v: &Value, _reg: &MessageRegistry) -> Result<Address, CodecError> {
	Ok(v.as_address().cloned().unwrap_or_else(Address::null))
}

fn any_out(v: &Arc<dyn Message>, reg: &MessageRegistry) -> Result<Value, CodecError> {
	codec::encode_any(reg, v.as_ref())
}

fn any_in(v: &Value, reg: &MessageRegistry) -> Result<Arc<dyn Message>, CodecError> {
	codec::decode_any(reg, v)
}

transport_record! {
	/// Ask the engine to open a listen socket.
	ListenForStream {
		requested_ipp: HostPort => PortableType::UserDefined(HostPort::NAME.to_string()), host_port_out, host_port_in;
		encrypted: bool => PortableType::Boolean, bool_out, bool_in;
		tunnel: bool => PortableType::Boolean, bool_out, bool_in;
	} => "fabric.ListenForStream"
}

transport_record! {
	/// Ask the engine to connect out.
	ConnectStream {
		requested_ipp: HostPort => PortableType::UserDefined(HostPort::NAME.to_string()), host_port_out, host_port_in;
		encrypted: bool => PortableType::Boolean, bool_out, bool_in;
		tunnel: bool => PortableType::Boolean, bool_out, bool_in;
	} => "fabric.ConnectStream"
}

transport_record! {
	/// Retire an earlier listen. Identify it by the bound endpoint the
	/// engine reported in `Listening` (which equals the requested one
	/// unless an ephemeral port was asked for).
	StopListening {
		requested_ipp: HostPort => PortableType::UserDefined(HostPort::NAME.to_string()), host_port_out, host_port_in;
	} => "fabric.StopListening"
}

transport_record! {
	/// The listen socket is up; `listening_ipp` carries the assigned
	/// port when the request asked for an ephemeral one.
	Listening {
		requested_ipp: HostPort => PortableType::UserDefined(HostPort::NAME.to_string()), host_port_out, host_port_in;
		listening_ipp: HostPort => PortableType::UserDefined(HostPort::NAME.to_string()), host_port_out, host_port_in;
	} => "fabric.Listening"
}

transport_record! {
	NotListening {
		requested_ipp: HostPort => PortableType::UserDefined(HostPort::NAME.to_string()), host_port_out, host_port_in;
		error: String => PortableType::Str, string_out, string_in;
	} => "fabric.NotListening"
}

transport_record! {
	NotConnected {
		requested_ipp: HostPort => PortableType::UserDefined(HostPort::NAME.to_string()), host_port_out, host_port_in;
		error: String => PortableType::Str, string_out, string_in;
	} => "fabric.NotConnected"
}

transport_record! {
	NotAccepted {
		listening_ipp: HostPort => PortableType::UserDefined(HostPort::NAME.to_string()), host_port_out, host_port_in;
		error: String => PortableType::Str, string_out, string_in;
	} => "fabric.NotAccepted"
}

transport_record! {
	/// An outbound connection is up; replies to this arrive at the
	/// far side's session controller.
	Connected {
		connected_ipp: HostPort => PortableType::UserDefined(HostPort::NAME.to_string()), host_port_out, host_port_in;
		proxy: Address => PortableType::Address, address_out, address_in;
	} => "fabric.Connected"
}

transport_record! {
	/// An inbound connection is up.
	Accepted {
		accepted_ipp: HostPort => PortableType::UserDefined(HostPort::NAME.to_string()), host_port_out, host_port_in;
		proxy: Address => PortableType::Address, address_out, address_in;
	} => "fabric.Accepted"
}

transport_record! {
	/// Handshake opener, client to listener.
	Diffie {
		public_key: Vec<u8> => PortableType::Block, bytes_out, bytes_in;
	} => "fabric.Diffie"
}

transport_record! {
	/// Handshake answer, listener to client.
	Hellman {
		public_key: Vec<u8> => PortableType::Block, bytes_out, bytes_in;
	} => "fabric.Hellman"
}

/// Ask a proxy to end its session; the value travels to the peer and
/// comes back out of both sides as `Closed{value}`.
#[derive(Clone, Debug)]
pub struct Close {
	pub value: Arc<dyn Message>,
}

impl Close {
	pub fn new(value: Arc<dyn Message>) -> Self {
		Self { value }
	}
}

impl Default for Close {
	fn default() -> Self {
		Close {
			value: Arc::new(crate::message::Ack),
		}
	}
}

impl Message for Close {}

impl Portable for Close {
	const NAME: &'static str = "fabric.Close";

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
		Ok(Close {
			value: codec::decode_any(reg, field(value, "value", Self::NAME)?)?,
		})
	}

	fn default_message() -> Self {
		Close::default()
	}
}

/// The session ended the way somebody asked it to.
#[derive(Clone, Debug)]
pub struct Closed {
	pub value: Arc<dyn Message>,
}

impl Default for Closed {
	fn default() -> Self {
		Closed {
			value: Arc::new(crate::message::Ack),
		}
	}
}

impl Message for Closed {}

impl Portable for Closed {
	const NAME: &'static str = "fabric.Closed";

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
		Ok(Closed {
			value: codec::decode_any(reg, field(value, "value", Self::NAME)?)?,
		})
	}

	fn default_message() -> Self {
		Closed::default()
	}
}

transport_record! {
	/// The peer dropped without closing.
	Abandoned {} => "fabric.Abandoned"
}

transport_record! {
	/// Liveness probe; the peer's transport answers without involving
	/// the application.
	TransportEnquiry {} => "fabric.TransportEnquiry"
}

transport_record! {
	TransportAck {} => "fabric.TransportAck"
}

/// Engine command: end a specific session with a value.
#[derive(Debug)]
pub struct Shutdown {
	pub session: Address,
	pub value: Arc<dyn Message>,
}

impl Message for Shutdown {}

/// Engine command: nudge a session's writer. Wakes are inherent to
/// the queue here, so this only traces.
#[derive(Debug)]
pub struct Bump {
	pub session: Address,
}

impl Message for Bump {}

/// Relay payload: an opaque body passing through this process with
/// its address vector, never decoded here.
#[derive(Debug)]
pub(crate) struct RelayedBody {
	pub tunnel: bool,
	pub body: Vec<u8>,
	pub addresses: Vec<Address>,
}

impl Message for RelayedBody {}

pub(crate) fn bind(reg: &MessageRegistry) -> Result<(), RegistrationError> {
	let quiet = MessageFlags {
		log_on_send: false,
		log_on_receive: false,
		..Default::default()
	};
	reg.bind::<HostPort>(MessageFlags::default())?;
	reg.bind::<ListenForStream>(MessageFlags::default())?;
	reg.bind::<ConnectStream>(MessageFlags::default())?;
	reg.bind::<StopListening>(MessageFlags::default())?;
	reg.bind::<Listening>(MessageFlags::default())?;
	reg.bind::<NotListening>(MessageFlags::default())?;
	reg.bind::<NotConnected>(MessageFlags::default())?;
	reg.bind::<NotAccepted>(MessageFlags::default())?;
	reg.bind::<Connected>(MessageFlags::default())?;
	reg.bind::<Accepted>(MessageFlags::default())?;
	reg.bind::<Diffie>(quiet.clone())?;
	reg.bind::<Hellman>(quiet.clone())?;
	reg.bind::<Close>(MessageFlags {
		copy_before_send: false,
		..Default::default()
	})?;
	reg.bind::<Closed>(MessageFlags {
		copy_before_send: false,
		..Default::default()
	})?;
	reg.bind::<Abandoned>(MessageFlags::default())?;
	reg.bind::<TransportEnquiry>(quiet.clone())?;
	reg.bind::<TransportAck>(quiet)?;
	Ok(())
}

/// Start the engine; returns its address.
pub(crate) fn boot(runtime: &Arc<Runtime>) -> Address {
	let hop = runtime.allocate();
	let address = Address::local(hop);
	let (tx, mut rx) = mailbox::mailbox();
	runtime.insert_object(ObjectRecord {
		address: address.clone(),
		queue: tx,
		parent: Address::null(),
		name: "listen-connect".to_string(),
		group: None,
	});

	let token = runtime.tokens.transport.child();
	let runtime = runtime.clone();
	let engine_address = address.clone();

	tokio::spawn(async move {
		let mut listeners: HashMap<HostPort, TeardownToken> = HashMap::new();
		loop {
			tokio::select! {
				_ = token.ended() => break,
				frame = rx.get() => {
					let Some(frame) = frame else { break };
					command(&runtime, &token, &mut listeners, frame).await;
				}
			}
		}
		runtime.destroy_object(&engine_address);
	});

	address
}

async fn command(
	runtime: &Arc<Runtime>,
	token: &TeardownToken,
	listeners: &mut HashMap<HostPort, TeardownToken>,
	frame: Frame,
) {
	let message = frame.message.as_ref();
	let controller = frame.return_address.clone();

	if let Some(listen) = message.downcast_ref::<ListenForStream>() {
		// Bind here so the listener registers under the endpoint it
		// actually got; StopListening is keyed by that endpoint.
		let requested = listen.requested_ipp.clone();
		match TcpListener::bind(requested.to_string()).await {
			Ok(listener) => {
				let listening_ipp = listener
					.local_addr()
					.map(|a| HostPort::new(a.ip().to_string(), a.port()))
					.unwrap_or_else(|_| requested.clone());
				let child = token.child();
				listeners.insert(listening_ipp.clone(), child.clone());
				runtime.post(
					Arc::new(Listening {
						requested_ipp: requested,
						listening_ipp: listening_ipp.clone(),
					}),
					controller.clone(),
					Address::null(),
				);
				tokio::spawn(run_listener(
					runtime.clone(),
					listener,
					listening_ipp,
					listen.clone(),
					controller,
					child,
				));
			}
			Err(error) => {
				runtime.post(
					Arc::new(NotListening {
						requested_ipp: requested,
						error: error.to_string(),
					}),
					controller,
					Address::null(),
				);
			}
		}
	} else if let Some(connect) = message.downcast_ref::<ConnectStream>() {
		tokio::spawn(run_connector(
			runtime.clone(),
			connect.clone(),
			controller,
			token.child(),
		));
	} else if let Some(stop) = message.downcast_ref::<StopListening>() {
		if let Some(child) = listeners.remove(&stop.requested_ipp) {
			child.teardown("stop listening");
		}
		runtime.post(
			Arc::new(crate::message::Ack),
			controller,
			Address::null(),
		);
	} else if let Some(shutdown) = message.downcast_ref::<Shutdown>() {
		runtime.post(
			Arc::new(Close::new(shutdown.value.clone())),
			shutdown.session.clone(),
			controller,
		);
	} else if let Some(bump) = message.downcast_ref::<Bump>() {
		tracing::trace!(session = %bump.session, "bump");
	} else if message.downcast_ref::<Stop>().is_some() {
		token.teardown("stopped");
		runtime.post(
			Arc::new(crate::message::Ack),
			controller,
			Address::null(),
		);
	} else {
		tracing::trace!("listen-connect dropped {message:?}");
	}
}

async fn run_listener(
	runtime: Arc<Runtime>,
	listener: TcpListener,
	listening_ipp: HostPort,
	request: ListenForStream,
	controller: Address,
	token: TeardownToken,
) {
	loop {
		tokio::select! {
			_ = token.ended() => break,
			accepted = listener.accept() => match accepted {
				Ok((stream, peer)) => {
					let peer_ipp = HostPort::new(peer.ip().to_string(), peer.port());
					tokio::spawn(run_connection(
						runtime.clone(),
						stream,
						peer_ipp,
						Side::Listening,
						controller.clone(),
						request.encrypted,
						request.tunnel,
						token.child(),
					));
				}
				Err(error) => {
					runtime.post(
						Arc::new(NotAccepted {
							listening_ipp: listening_ipp.clone(),
							error: error.to_string(),
						}),
						controller.clone(),
						Address::null(),
					);
				}
			}
		}
	}
}

async fn run_connector(
	runtime: Arc<Runtime>,
	request: ConnectStream,
	controller: Address,
	token: TeardownToken,
) {
	let requested = request.requested_ipp.clone();
	match TcpStream::connect(requested.to_string()).await {
		Ok(stream) => {
			run_connection(
				runtime,
				stream,
				requested,
				Side::Connecting,
				controller,
				request.encrypted,
				request.tunnel,
				token,
			)
			.await;
		}
		Err(error) => {
			runtime.post(
				Arc::new(NotConnected {
					requested_ipp: requested,
					error: error.to_string(),
				}),
				controller,
				Address::null(),
			);
		}
	}
}

struct Session {
	proxy: Address,
	controller: Address,
	/// Set when either side asked for the close; decides
	/// Closed-vs-Abandoned at the end.
	close_value: Mutex<Option<Arc<dyn Message>>>,
	ended: AtomicBool,
	last_inbound: Mutex<Instant>,
	token: TeardownToken,
}

impl Session {
	fn end(&self, runtime: &Runtime, value: Option<Arc<dyn Message>>) {
		if self.ended.swap(true, Ordering::SeqCst) {
			return;
		}
		let outcome: Arc<dyn Message> = match value.or_else(|| self.close_value.lock().clone()) {
			Some(value) => Arc::new(Closed { value }),
			None => Arc::new(Abandoned::default()),
		};
		runtime.post(outcome, self.controller.clone(), self.proxy.clone());
		runtime.destroy_object(&self.proxy);
		self.token.teardown("session over");
	}
}

#[allow(clippy::too_many_arguments)]
async fn run_connection(
	runtime: Arc<Runtime>,
	stream: TcpStream,
	ipp: HostPort,
	side: Side,
	controller: Address,
	encrypted: bool,
	tunnel: bool,
	token: TeardownToken,
) {
	let _ = stream.set_nodelay(true);
	let (read_half, write_half) = stream.into_split();
	let mut reader = BufReader::new(read_half);
	let mut writer = write_half;

	let keys = if encrypted {
		match shake_hands(&runtime, &mut reader, &mut writer, side).await {
			Ok(keys) => Some(keys),
			Err(error) => {
				let text = error.to_string();
				let outcome: Arc<dyn Message> = match side {
					Side::Connecting => Arc::new(NotConnected {
						requested_ipp: ipp,
						error: text,
					}),
					Side::Listening => Arc::new(NotAccepted {
						listening_ipp: ipp,
						error: text,
					}),
				};
				runtime.post(outcome, controller, Address::null());
				return;
			}
		}
	} else {
		None
	};
	let (sealer, opener) = match keys {
		Some(keys) => {
			let (sealer, opener) = keys.split();
			(Some(sealer), Some(opener))
		}
		None => (None, None),
	};

	// The proxy: the local stand-in for everything on the far side.
	let hop = runtime.allocate();
	let proxy = Address::local(hop);
	let (out_tx, out_rx) = mailbox::mailbox();
	runtime.insert_object(ObjectRecord {
		address: proxy.clone(),
		queue: out_tx.clone(),
		parent: controller.clone(),
		name: "proxy".to_string(),
		group: None,
	});
	runtime.post_log(PointLog::new(
		LogTag::Created,
		hop,
		"proxy".to_string(),
		format!("{side:?} {ipp}"),
	));

	let session = Arc::new(Session {
		proxy: proxy.clone(),
		controller: controller.clone(),
		close_value: Mutex::new(None),
		ended: AtomicBool::new(false),
		last_inbound: Mutex::new(Instant::now()),
		token,
	});

	let notice: Arc<dyn Message> = match side {
		Side::Connecting => Arc::new(Connected {
			connected_ipp: ipp.clone(),
			proxy: proxy.clone(),
		}),
		Side::Listening => Arc::new(Accepted {
			accepted_ipp: ipp.clone(),
			proxy: proxy.clone(),
		}),
	};
	// Replies to the session notice go to the proxy, i.e. to the far
	// side's controller.
	runtime.post(notice, controller.clone(), proxy.clone());

	tokio::spawn(writer_loop(
		runtime.clone(),
		session.clone(),
		out_rx,
		writer,
		sealer,
		tunnel,
	));
	tokio::spawn(reader_loop(
		runtime.clone(),
		session.clone(),
		reader,
		opener,
		out_tx.clone(),
	));
	tokio::spawn(keeper_loop(runtime, session, out_tx));
}

async fn shake_hands(
	runtime: &Arc<Runtime>,
	reader: &mut BufReader<OwnedReadHalf>,
	writer: &mut OwnedWriteHalf,
	side: Side,
) -> Result<crate::seal::SessionKeys, TransportError> {
	let reg = runtime.registry();
	match side {
		Side::Connecting => {
			let handshake = Handshake::new(side)?;
			let opener = Diffie {
				public_key: handshake.public_key().to_vec(),
			};
			write_transport_message(writer, reg, &opener, &mut None).await?;
			let frame = wire::read_frame(reader, &mut None).await?;
			let message = codec::decode_body(reg, &frame.body, &frame.addresses)?;
			let answer = message
				.downcast_ref::<Hellman>()
				.ok_or(TransportError::Handshake {
					detail: "expected Hellman".to_string(),
				})?;
			handshake.agree(&answer.public_key)
		}
		Side::Listening => {
			let frame = wire::read_frame(reader, &mut None).await?;
			let message = codec::decode_body(reg, &frame.body, &frame.addresses)?;
			let opener = message
				.downcast_ref::<Diffie>()
				.ok_or(TransportError::Handshake {
					detail: "expected Diffie".to_string(),
				})?;
			let handshake = Handshake::new(side)?;
			let answer = Hellman {
				public_key: handshake.public_key().to_vec(),
			};
			write_transport_message(writer, reg, &answer, &mut None).await?;
			handshake.agree(&opener.public_key)
		}
	}
}

/// Transport-level frames carry an empty target; they are consumed by
/// the far side's transport, never delivered upward.
async fn write_transport_message(
	writer: &mut OwnedWriteHalf,
	reg: &Arc<MessageRegistry>,
	message: &dyn Message,
	sealer: &mut Option<Sealer>,
) -> Result<(), TransportError> {
	let (body, addresses) = codec::encode_body(reg, message)?;
	let frame = WireFrame::new(
		WireHeader {
			to_address: Address::null(),
			return_address: Address::null(),
			tunnel: false,
		},
		body,
		addresses,
	);
	wire::write_frame(writer, &frame, sealer).await
}

async fn writer_loop(
	runtime: Arc<Runtime>,
	session: Arc<Session>,
	mut out_rx: mailbox::MailboxReceiver,
	mut writer: OwnedWriteHalf,
	mut sealer: Option<Sealer>,
	tunnel: bool,
) {
	let reg = runtime.registry().clone();
	loop {
		let frame = tokio::select! {
			_ = session.token.ended() => break,
			frame = out_rx.get() => match frame {
				Some(frame) => frame,
				None => break,
			},
		};

		let message = frame.message.as_ref();

		// Session control addressed to the proxy itself.
		if frame.to == session.proxy {
			if let Some(close) = message.downcast_ref::<Close>() {
				*session.close_value.lock() = Some(close.value.clone());
				let _ = write_transport_message(&mut writer, &reg, close, &mut sealer).await;
				let _ = writer.shutdown().await;
				// The reader emits Closed when the peer answers with
				// its FIN.
				continue;
			}
			if message.downcast_ref::<Stop>().is_some() {
				*session.close_value.lock() =
					Some(Arc::new(crate::message::Aborted::new()));
				let _ = writer.shutdown().await;
				continue;
			}
			if message.downcast_ref::<TransportEnquiry>().is_some()
				|| message.downcast_ref::<TransportAck>().is_some()
			{
				if write_transport_message(&mut writer, &reg, message, &mut sealer)
					.await
					.is_err()
				{
					break;
				}
				continue;
			}
		}

		let (tunnel_frame, body, addresses) = if let Some(relay) =
			message.downcast_ref::<RelayedBody>()
		{
			(relay.tunnel, relay.body.clone(), relay.addresses.clone())
		} else if tunnel {
			match message.downcast_ref::<Blob>() {
				Some(blob) => (true, blob.bytes.clone(), Vec::new()),
				None => {
					tracing::warn!("tunnel session only carries blobs; dropped {message:?}");
					continue;
				}
			}
		} else {
			match codec::encode_body(&reg, message) {
				Ok((body, addresses)) => (false, body, addresses),
				Err(error) => {
					runtime.post_log(PointLog::new(
						LogTag::Fault,
						session.proxy.trailing().unwrap_or(0),
						"proxy".to_string(),
						format!("encode: {error}"),
					));
					continue;
				}
			}
		};

		let wire_frame = WireFrame::new(
			WireHeader {
				to_address: frame.to.clone(),
				return_address: frame.return_address.tromboned(&session.proxy),
				tunnel: tunnel_frame,
			},
			body,
			addresses
				.iter()
				.map(|a| a.tromboned(&session.proxy))
				.collect(),
		);

		if let Err(error) = wire::write_frame(&mut writer, &wire_frame, &mut sealer).await {
			tracing::debug!("write failed: {error}");
			break;
		}
		metrics::counter!("fabric_frames_sent").increment(1);
	}
}

async fn reader_loop(
	runtime: Arc<Runtime>,
	session: Arc<Session>,
	mut reader: BufReader<OwnedReadHalf>,
	mut opener: Option<Opener>,
	out_tx: MailboxSender,
) {
	let reg = runtime.registry().clone();
	loop {
		let wire_frame = tokio::select! {
			_ = session.token.ended() => return,
			read = wire::read_frame(&mut reader, &mut opener) => match read {
				Ok(frame) => frame,
				Err(TransportError::Io(_)) | Err(TransportError::PeerClosed { .. }) => {
					// FIN or reset: Closed when a close was agreed,
					// Abandoned otherwise.
					session.end(&runtime, None);
					return;
				}
				Err(error) => {
					runtime.post_log(PointLog::new(
						LogTag::Fault,
						session.proxy.trailing().unwrap_or(0),
						"proxy".to_string(),
						format!("read: {error}"),
					));
					session.end(&runtime, None);
					return;
				}
			},
		};

		*session.last_inbound.lock() = Instant::now();
		metrics::counter!("fabric_frames_received").increment(1);

		// Transport-level traffic never goes upward.
		if wire_frame.header.to_address.is_null() {
			match codec::decode_body(&reg, &wire_frame.body, &wire_frame.addresses) {
				Ok(message) => {
					if message.downcast_ref::<TransportEnquiry>().is_some() {
						out_tx.put(Frame::new(
							Arc::new(TransportAck::default()),
							session.proxy.clone(),
							Address::null(),
						));
					} else if message.downcast_ref::<TransportAck>().is_some() {
						// Presence alone resets the idle clock.
					} else if let Some(close) = message.downcast_ref::<Close>() {
						session.end(&runtime, Some(close.value.clone()));
						return;
					}
				}
				Err(error) => {
					tracing::debug!("transport frame: {error}");
				}
			}
			continue;
		}

		let to = wire_frame.header.to_address.peeled();
		let return_address = wire_frame.header.return_address.arrived(&session.proxy);
		let addresses: Vec<Address> = wire_frame
			.addresses
			.iter()
			.map(|a| a.arrived(&session.proxy))
			.collect();

		if wire_frame.header.tunnel {
			let target = if to.is_null() {
				session.controller.clone()
			} else {
				to
			};
			runtime.post(
				Arc::new(Blob {
					bytes: wire_frame.body,
				}),
				target,
				return_address,
			);
			continue;
		}

		if to.len() > 1 {
			// A relay hop: the body stays opaque, only the vector is
			// carried onward for the next rewrite.
			runtime.post(
				Arc::new(RelayedBody {
					tunnel: false,
					body: wire_frame.body,
					addresses,
				}),
				to,
				return_address,
			);
			continue;
		}

		let target = if to.is_null() {
			session.controller.clone()
		} else {
			to
		};
		match codec::decode_body(&reg, &wire_frame.body, &addresses) {
			Ok(message) => {
				runtime.post(message, target, return_address);
			}
			Err(error) => {
				runtime.post_log(PointLog::new(
					LogTag::Fault,
					session.proxy.trailing().unwrap_or(0),
					"proxy".to_string(),
					format!("decode: {error}"),
				));
				session.end(&runtime, None);
				return;
			}
		}
	}
}

/// The keeper child: probes an idle peer and times the session out
/// when the probe goes unanswered.
async fn keeper_loop(runtime: Arc<Runtime>, session: Arc<Session>, out_tx: MailboxSender) {
	let idle = Duration::from_secs_f64(IDLE_TRANSPORT);
	let responsive = Duration::from_secs_f64(RESPONSIVE_TRANSPORT);
	loop {
		let deadline = *session.last_inbound.lock() + idle;
		tokio::select! {
			_ = session.token.ended() => return,
			_ = tokio::time::sleep_until(deadline) => {}
		}
		if *session.last_inbound.lock() + idle > Instant::now() {
			// Traffic arrived while we slept.
			continue;
		}

		let probed_at = Instant::now();
		out_tx.put(Frame::new(
			Arc::new(TransportEnquiry::default()),
			session.proxy.clone(),
			Address::null(),
		));

		tokio::select! {
			_ = session.token.ended() => return,
			_ = tokio::time::sleep(responsive) => {}
		}
		if *session.last_inbound.lock() < probed_at {
			session.end(
				&runtime,
				Some(Arc::new(TimedOut::new("TransportEnquiry"))),
			);
			return;
		}
	}
}
