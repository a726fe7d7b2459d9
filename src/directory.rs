//! The pub/sub directory: named endpoints, regex subscriptions and
//! route construction across a hierarchy of scopes.
//!
//! One directory runs in every process. Names published beyond the
//! process get a per-listing peer listener; subscriptions and
//! publications travel up to a shared higher-scope directory, which
//! matches them and tells the subscriber's home directory where to
//! connect. Once a loop is open, both applications hold ordinary
//! addresses and the directory steps out of the way.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use regex::Regex;
use uuid::Uuid;

use crate::address::Address;
use crate::address::Hop;
use crate::error::CodecError;
use crate::error::RegistrationError;
use crate::log::LogTag;
use crate::log::PointLog;
use crate::mailbox;
use crate::message::Ack;
use crate::message::Frame;
use crate::message::Message;
use crate::message::Portable;
use crate::message::Returned;
use crate::message::Stop;
use crate::message::field;
use crate::portable::PortableType;
use crate::registry::MessageFlags;
use crate::registry::MessageRegistry;
use crate::registry::Schema;
use crate::retry::RetryIntervals;
use crate::runtime::ObjectRecord;
use crate::runtime::Runtime;
use crate::teardown::TeardownToken;
use crate::transport::Abandoned;
use crate::transport::Accepted;
use crate::transport::Closed;
use crate::transport::ConnectStream;
use crate::transport::Connected;
use crate::transport::HostPort;
use crate::transport::ListenForStream;
use crate::transport::Listening;
use crate::transport::NotConnected;
use crate::transport::NotListening;
use crate::transport::StopListening;
use crate::value::Value;

/// Default well-known port for HOST and LAN directories.
pub const DIRECTORY_PORT: u16 = 32177;

/// The enum domain scope values travel under on the wire.
pub const SCOPE_DOMAIN: &str = "fabric.Scope";

/// A level in the directory hierarchy. The order is total; a listing
/// is visible to directories at scopes at or below its own.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Scope {
	#[default]
	Process,
	Group,
	Host,
	Lan,
	Wan,
}

impl Scope {
	pub const MEMBERS: [&'static str; 5] = ["PROCESS", "GROUP", "HOST", "LAN", "WAN"];

	pub fn as_name(&self) -> &'static str {
		match self {
			Scope::Process => "PROCESS",
			Scope::Group => "GROUP",
			Scope::Host => "HOST",
			Scope::Lan => "LAN",
			Scope::Wan => "WAN",
		}
	}

	pub fn from_name(name: &str) -> Option<Scope> {
		match name {
			"PROCESS" => Some(Scope::Process),
			"GROUP" => Some(Scope::Group),
			"HOST" => Some(Scope::Host),
			"LAN" => Some(Scope::Lan),
			"WAN" => Some(Scope::Wan),
			_ => None,
		}
	}
}

impl fmt::Display for Scope {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_name())
	}
}

/// The directory endpoints a federation agrees on. HOST listens on
/// loopback, LAN on all interfaces; a GROUP directory takes an
/// ephemeral loopback port and announces it to child processes through
/// the environment.
#[derive(Clone, Debug)]
pub struct WellKnown {
	pub host: HostPort,
	pub lan: HostPort,
	pub group: Option<HostPort>,
}

pub fn well_known() -> WellKnown {
	fn port(variable: &str, fallback: u16) -> u16 {
		std::env::var(variable)
			.ok()
			.and_then(|v| v.parse().ok())
			.unwrap_or(fallback)
	}
	WellKnown {
		host: HostPort::loopback(port("FABRIC_HOST_PORT", DIRECTORY_PORT)),
		lan: HostPort::all_interfaces(port("FABRIC_LAN_PORT", DIRECTORY_PORT)),
		group: std::env::var("FABRIC_GROUP_PORT")
			.ok()
			.and_then(|v| v.parse().ok())
			.map(HostPort::loopback),
	}
}

fn string_out(v: &String, _reg: &MessageRegistry) -> Result<Value, CodecError> {
	Ok(Value::Str(v.clone()))
}

fn string_in(v: &Value, _reg: &MessageRegistry) -> Result<String, CodecError> {
	Ok(v.as_str().unwrap_or_default().to_string())
}

fn scope_out(v: &Scope, _reg: &MessageRegistry) -> Result<Value, CodecError> {
	Ok(Value::Str(v.as_name().to_string()))
}

fn scope_in(v: &Value, _reg: &MessageRegistry) -> Result<Scope, CodecError> {
	Ok(Scope::from_name(v.as_str().unwrap_or_default()).unwrap_or_default())
}

fn uuid_out(v: &Uuid, _reg: &MessageRegistry) -> Result<Value, CodecError> {
	Ok(Value::Str(v.to_string()))
}

fn uuid_in(v: &Value, _reg: &MessageRegistry) -> Result<Uuid, CodecError> {
	Ok(v.as_str()
		.and_then(|s| Uuid::parse_str(s).ok())
		.unwrap_or(Uuid::nil()))
}

fn ipp_out(v: &HostPort, reg: &MessageRegistry) -> Result<Value, CodecError> {
	v.to_value(reg)
}

fn ipp_in(v: &Value, reg: &MessageRegistry) -> Result<HostPort, CodecError> {
	HostPort::from_value(v, reg)
}

fn address_out(v: &Address, _reg: &MessageRegistry) -> Result<Value, CodecError> {
	Ok(Value::Address(v.clone()))
}

fn address_in(v: &Value, _reg: &MessageRegistry) -> Result<Address, CodecError> {
	Ok(v.as_address().cloned().unwrap_or_else(Address::null))
}

macro_rules! directory_record {
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

fn scope_type() -> PortableType {
	PortableType::Enumeration(SCOPE_DOMAIN.to_string())
}

directory_record! {
	/// Claim a name. `address` is the object the name resolves to.
	PublishAs {
		name: String => PortableType::Str, string_out, string_in;
		scope: Scope => scope_type(), scope_out, scope_in;
		address: Address => PortableType::Address, address_out, address_in;
	} => "fabric.PublishAs"
}

directory_record! {
	/// The name is claimed. `listening_ipp` is the peer endpoint other
	/// processes connect to; null for a PROCESS-scope listing.
	Published {
		name: String => PortableType::Str, string_out, string_in;
		published_id: Uuid => PortableType::Uuid, uuid_out, uuid_in;
		listening_ipp: HostPort => PortableType::UserDefined(HostPort::NAME.to_string()), ipp_out, ipp_in;
		home_address: Address => PortableType::Address, address_out, address_in;
	} => "fabric.Published"
}

directory_record! {
	NotPublished {
		name: String => PortableType::Str, string_out, string_in;
		error: String => PortableType::Str, string_out, string_in;
	} => "fabric.NotPublished"
}

directory_record! {
	/// Watch for names matching `search`, a regular expression
	/// compiled at install time.
	SubscribeTo {
		search: String => PortableType::Str, string_out, string_in;
		scope: Scope => scope_type(), scope_out, scope_in;
		address: Address => PortableType::Address, address_out, address_in;
	} => "fabric.SubscribeTo"
}

directory_record! {
	Subscribed {
		search: String => PortableType::Str, string_out, string_in;
		subscribed_id: Uuid => PortableType::Uuid, uuid_out, uuid_in;
	} => "fabric.Subscribed"
}

directory_record! {
	NotSubscribed {
		search: String => PortableType::Str, string_out, string_in;
		error: String => PortableType::Str, string_out, string_in;
	} => "fabric.NotSubscribed"
}

directory_record! {
	ClearPublished {
		published_id: Uuid => PortableType::Uuid, uuid_out, uuid_in;
	} => "fabric.ClearPublished"
}

directory_record! {
	ClearSubscribed {
		subscribed_id: Uuid => PortableType::Uuid, uuid_out, uuid_in;
	} => "fabric.ClearSubscribed"
}

directory_record! {
	/// Retire every listing the sender installed.
	ClearListings {} => "fabric.ClearListings"
}

directory_record! {
	PublishedCleared {
		published_id: Uuid => PortableType::Uuid, uuid_out, uuid_in;
	} => "fabric.PublishedCleared"
}

directory_record! {
	SubscribedCleared {
		subscribed_id: Uuid => PortableType::Uuid, uuid_out, uuid_in;
	} => "fabric.SubscribedCleared"
}

directory_record! {
	/// One published name as it travels between directories.
	PublishedListing {
		name: String => PortableType::Str, string_out, string_in;
		scope: Scope => scope_type(), scope_out, scope_in;
		published_id: Uuid => PortableType::Uuid, uuid_out, uuid_in;
		listening_ipp: HostPort => PortableType::UserDefined(HostPort::NAME.to_string()), ipp_out, ipp_in;
		home_address: Address => PortableType::Address, address_out, address_in;
	} => "fabric.PublishedListing"
}

directory_record! {
	/// One subscription as it travels between directories. The regex
	/// is recompiled wherever the listing lands.
	SubscribedListing {
		search: String => PortableType::Str, string_out, string_in;
		scope: Scope => scope_type(), scope_out, scope_in;
		subscribed_id: Uuid => PortableType::Uuid, uuid_out, uuid_in;
		home_address: Address => PortableType::Address, address_out, address_in;
	} => "fabric.SubscribedListing"
}

directory_record! {
	/// The matching directory tells a subscriber's home directory
	/// where the publisher can be reached.
	RouteOverLoop {
		route_id: Uuid => PortableType::Uuid, uuid_out, uuid_in;
		scope: Scope => scope_type(), scope_out, scope_in;
		ipp: HostPort => PortableType::UserDefined(HostPort::NAME.to_string()), ipp_out, ipp_in;
		name: String => PortableType::Str, string_out, string_in;
		publisher_id: Uuid => PortableType::Uuid, uuid_out, uuid_in;
		subscriber_id: Uuid => PortableType::Uuid, uuid_out, uuid_in;
	} => "fabric.RouteOverLoop"
}

directory_record! {
	/// First message over a fresh peer connection; `address` is the
	/// subscriber object the publisher should talk back to.
	OpenLoop {
		route_id: Uuid => PortableType::Uuid, uuid_out, uuid_in;
		publisher_id: Uuid => PortableType::Uuid, uuid_out, uuid_in;
		address: Address => PortableType::Address, address_out, address_in;
	} => "fabric.OpenLoop"
}

directory_record! {
	/// The loop is up; `address` is the published object.
	LoopOpened {
		route_id: Uuid => PortableType::Uuid, uuid_out, uuid_in;
		address: Address => PortableType::Address, address_out, address_in;
	} => "fabric.LoopOpened"
}

directory_record! {
	/// Session notification to the subscriber application: the name it
	/// searched for is reachable at `publisher_address`.
	Available {
		name: String => PortableType::Str, string_out, string_in;
		route_id: Uuid => PortableType::Uuid, uuid_out, uuid_in;
		publisher_address: Address => PortableType::Address, address_out, address_in;
	} => "fabric.Available"
}

directory_record! {
	/// Session notification to the publisher application: a subscriber
	/// found the name and can be reached at `subscriber_address`.
	Delivered {
		name: String => PortableType::Str, string_out, string_in;
		route_id: Uuid => PortableType::Uuid, uuid_out, uuid_in;
		subscriber_address: Address => PortableType::Address, address_out, address_in;
	} => "fabric.Delivered"
}

directory_record! {
	/// The route went away; the application re-subscribes or waits.
	Dropped {
		name: String => PortableType::Str, string_out, string_in;
		route_id: Uuid => PortableType::Uuid, uuid_out, uuid_in;
	} => "fabric.Dropped"
}

/// Bulk push of listings to an upward directory: the consolidated
/// snapshot at (re)connection, single-entry deltas afterwards.
#[derive(Clone, Debug, Default)]
pub struct PublishedDirectory {
	pub published: Vec<PublishedListing>,
	pub subscribed: Vec<SubscribedListing>,
}

impl Message for PublishedDirectory {}

impl Portable for PublishedDirectory {
	const NAME: &'static str = "fabric.PublishedDirectory";

	fn schema() -> Schema {
		Schema::from([
			(
				"published".to_string(),
				PortableType::VectorOf(Box::new(PortableType::UserDefined(
					PublishedListing::NAME.to_string(),
				))),
			),
			(
				"subscribed".to_string(),
				PortableType::VectorOf(Box::new(PortableType::UserDefined(
					SubscribedListing::NAME.to_string(),
				))),
			),
		])
	}

	fn to_value(&self, reg: &MessageRegistry) -> Result<Value, CodecError> {
		let published = self
			.published
			.iter()
			.map(|l| l.to_value(reg))
			.collect::<Result<Vec<_>, _>>()?;
		let subscribed = self
			.subscribed
			.iter()
			.map(|l| l.to_value(reg))
			.collect::<Result<Vec<_>, _>>()?;
		Ok(Value::record([
			("published", Value::List(published)),
			("subscribed", Value::List(subscribed)),
		]))
	}

	fn from_value(value: &Value, reg: &MessageRegistry) -> Result<Self, CodecError> {
		let lists = |name: &str| -> Result<Vec<Value>, CodecError> {
			match field(value, name, Self::NAME)? {
				Value::List(items) => Ok(items.clone()),
				other => Err(CodecError::Mismatch {
					expected: "list".to_string(),
					found: other.kind().to_string(),
				}),
			}
		};
		Ok(PublishedDirectory {
			published: lists("published")?
				.iter()
				.map(|v| PublishedListing::from_value(v, reg))
				.collect::<Result<Vec<_>, _>>()?,
			subscribed: lists("subscribed")?
				.iter()
				.map(|v| SubscribedListing::from_value(v, reg))
				.collect::<Result<Vec<_>, _>>()?,
		})
	}

	fn default_message() -> Self {
		Self::default()
	}
}

// Local-only traffic between the directory and its children; never
// crosses a transport, so no registration.

#[derive(Clone, Debug)]
pub struct ServeAsDirectory {
	pub scope: Scope,
	pub ipp: HostPort,
}

impl Message for ServeAsDirectory {}

#[derive(Clone, Debug)]
pub struct ConnectToDirectory {
	pub scope: Scope,
	pub ipp: HostPort,
}

impl Message for ConnectToDirectory {}

#[derive(Debug)]
struct PeerListening {
	published_id: Uuid,
	listening_ipp: HostPort,
}

impl Message for PeerListening {}

#[derive(Debug)]
struct PeerListenFailed {
	published_id: Uuid,
	error: String,
}

impl Message for PeerListenFailed {}

#[derive(Debug)]
struct UplinkUp {
	proxy: Address,
}

impl Message for UplinkUp {}

#[derive(Debug)]
struct UplinkDown;

impl Message for UplinkDown {}

#[derive(Debug)]
struct PeerOut {
	ipp: HostPort,
}

impl Message for PeerOut {}

#[derive(Clone, Debug)]
struct OpenLoopRequest {
	route_id: Uuid,
	publisher_id: Uuid,
	subscriber_address: Address,
	name: String,
}

impl Message for OpenLoopRequest {}

pub(crate) fn bind(reg: &MessageRegistry) -> Result<(), RegistrationError> {
	reg.types.install_enum(SCOPE_DOMAIN, &Scope::MEMBERS);

	let quiet = MessageFlags {
		log_on_send: false,
		log_on_receive: false,
		..Default::default()
	};

	reg.bind::<PublishAs>(MessageFlags::default())?;
	reg.bind::<Published>(MessageFlags::default())?;
	reg.bind::<NotPublished>(MessageFlags::default())?;
	reg.bind::<SubscribeTo>(MessageFlags::default())?;
	reg.bind::<Subscribed>(MessageFlags::default())?;
	reg.bind::<NotSubscribed>(MessageFlags::default())?;
	reg.bind::<ClearPublished>(MessageFlags::default())?;
	reg.bind::<ClearSubscribed>(MessageFlags::default())?;
	reg.bind::<ClearListings>(MessageFlags::default())?;
	reg.bind::<PublishedCleared>(MessageFlags::default())?;
	reg.bind::<SubscribedCleared>(MessageFlags::default())?;
	reg.bind::<PublishedListing>(quiet.clone())?;
	reg.bind::<SubscribedListing>(quiet.clone())?;
	reg.bind::<PublishedDirectory>(quiet.clone())?;
	reg.bind::<RouteOverLoop>(quiet.clone())?;
	reg.bind::<OpenLoop>(quiet.clone())?;
	reg.bind::<LoopOpened>(quiet)?;
	reg.bind::<Available>(MessageFlags::default())?;
	reg.bind::<Delivered>(MessageFlags::default())?;
	reg.bind::<Dropped>(MessageFlags::default())?;
	Ok(())
}

/// Claim `name` for the calling object at `scope`. The directory
/// answers with `Published` or `NotPublished`.
pub fn publish(point: &crate::point::Point, name: &str, scope: Scope) {
	if let Some(directory) = point.runtime().directory_address() {
		point.send(
			PublishAs {
				name: name.to_string(),
				scope,
				address: point.address().clone(),
			},
			&directory,
		);
	}
}

/// Watch for names matching `search` at `scope`. The directory answers
/// with `Subscribed` or `NotSubscribed`, then `Available` per match.
pub fn subscribe(point: &crate::point::Point, search: &str, scope: Scope) {
	if let Some(directory) = point.runtime().directory_address() {
		point.send(
			SubscribeTo {
				search: search.to_string(),
				scope,
				address: point.address().clone(),
			},
			&directory,
		);
	}
}

/// Turn this process's directory into a shared one: it raises its
/// scope to `scope` and listens at `ipp` for downward peers.
pub fn serve(runtime: &Arc<Runtime>, scope: Scope, ipp: HostPort) {
	if let Some(directory) = runtime.directory_address() {
		runtime.post(
			Arc::new(ServeAsDirectory { scope, ipp }),
			directory,
			Address::null(),
		);
	}
}

/// Join a federation: connect this process's directory upward to the
/// shared directory of `scope` at `ipp`. Reconnects on loss with the
/// default retry plan.
pub fn connect_up(runtime: &Arc<Runtime>, scope: Scope, ipp: HostPort) {
	if let Some(directory) = runtime.directory_address() {
		runtime.post(
			Arc::new(ConnectToDirectory { scope, ipp }),
			directory,
			Address::null(),
		);
	}
}

struct PublishedEntry {
	listing: PublishedListing,
	/// The published object, when it lives in this process.
	address: Option<Address>,
	peer: Option<Hop>,
}

struct SubscribedEntry {
	listing: SubscribedListing,
	regex: Regex,
	/// The subscriber object, when it lives in this process.
	address: Option<Address>,
	peer: Option<Hop>,
}

#[derive(Clone)]
struct RouteCandidate {
	route_id: Uuid,
	scope: Scope,
	publisher_id: Uuid,
	/// Set for same-process routes.
	publisher_address: Option<Address>,
	/// Set for routes that need a peer connection.
	ipp: Option<HostPort>,
}

#[derive(Default)]
struct RouteSet {
	candidates: Vec<RouteCandidate>,
	acted: Option<Uuid>,
}

struct PendingPublish {
	request: PublishAs,
	reply_to: Address,
}

#[derive(Default)]
struct LearnedSet {
	published: HashSet<Uuid>,
	subscribed: HashSet<Uuid>,
}

struct Uplink {
	scope: Scope,
	child: Address,
	proxy: Option<Address>,
}

struct Directory {
	runtime: Arc<Runtime>,
	address: Address,
	scope: Scope,
	published: HashMap<Uuid, PublishedEntry>,
	subscribed: HashMap<Uuid, SubscribedEntry>,
	pending: HashMap<Uuid, PendingPublish>,
	listeners: HashMap<Uuid, Address>,
	peers: HashMap<String, Address>,
	routes: HashMap<(Uuid, String), RouteSet>,
	issued: HashMap<(Uuid, Uuid), Uuid>,
	learned: HashMap<Hop, LearnedSet>,
	accepted_hosts: HashMap<Hop, String>,
	uplink: Option<Uplink>,
}

pub(crate) fn boot(runtime: &Arc<Runtime>) -> Address {
	let hop = runtime.allocate();
	let address = Address::local(hop);
	let (tx, mut rx) = mailbox::mailbox();
	runtime.insert_object(ObjectRecord {
		address: address.clone(),
		queue: tx,
		parent: Address::null(),
		name: "directory".to_string(),
		group: None,
	});

	let token = runtime.tokens.directory.child();
	let mut state = Directory {
		runtime: runtime.clone(),
		address: address.clone(),
		scope: Scope::Process,
		published: HashMap::new(),
		subscribed: HashMap::new(),
		pending: HashMap::new(),
		listeners: HashMap::new(),
		peers: HashMap::new(),
		routes: HashMap::new(),
		issued: HashMap::new(),
		learned: HashMap::new(),
		accepted_hosts: HashMap::new(),
		uplink: None,
	};

	tokio::spawn(async move {
		loop {
			tokio::select! {
				_ = token.ended() => break,
				frame = rx.get() => {
					let Some(frame) = frame else { break };
					state.handle(&token, frame);
				}
			}
		}
		state.runtime.destroy_object(&state.address);
	});

	address
}

impl Directory {
	fn post<M: Message>(&self, message: M, to: &Address) {
		self.runtime
			.post(Arc::new(message), to.clone(), self.address.clone());
	}

	fn log(&self, tag: LogTag, text: String) {
		self.runtime.post_log(PointLog::new(
			tag,
			self.address.trailing().unwrap_or(0),
			"directory".to_string(),
			text,
		));
	}

	fn handle(&mut self, token: &TeardownToken, frame: Frame) {
		let message = frame.message.as_ref();
		let reply_to = frame.return_address.clone();

		if let Some(request) = message.downcast_ref::<PublishAs>() {
			self.publish(request.clone(), reply_to);
		} else if let Some(request) = message.downcast_ref::<SubscribeTo>() {
			self.subscribe(request.clone(), reply_to);
		} else if let Some(clear) = message.downcast_ref::<ClearPublished>() {
			self.remove_published(clear.published_id, Some(reply_to));
		} else if let Some(clear) = message.downcast_ref::<ClearSubscribed>() {
			self.remove_subscribed(clear.subscribed_id, Some(reply_to));
		} else if message.downcast_ref::<ClearListings>().is_some() {
			self.clear_listings(reply_to);
		} else if let Some(listings) = message.downcast_ref::<PublishedDirectory>() {
			self.learn(listings.clone(), &reply_to);
		} else if let Some(route) = message.downcast_ref::<RouteOverLoop>() {
			self.route_over_loop(route.clone());
		} else if let Some(up) = message.downcast_ref::<UplinkUp>() {
			self.uplink_up(up.proxy.clone());
		} else if message.downcast_ref::<UplinkDown>().is_some() {
			if let Some(uplink) = &mut self.uplink {
				uplink.proxy = None;
			}
		} else if let Some(out) = message.downcast_ref::<PeerOut>() {
			self.peer_out(out.ipp.clone());
		} else if let Some(listening) = message.downcast_ref::<PeerListening>() {
			self.peer_listening(listening.published_id, listening.listening_ipp.clone());
		} else if let Some(failed) = message.downcast_ref::<PeerListenFailed>() {
			self.peer_listen_failed(failed.published_id, failed.error.clone());
		} else if let Some(request) = message.downcast_ref::<ServeAsDirectory>() {
			self.serve(request.clone());
		} else if let Some(request) = message.downcast_ref::<ConnectToDirectory>() {
			self.connect_up(request.clone());
		} else if let Some(accepted) = message.downcast_ref::<Accepted>() {
			// A downward peer. Remember where it connected from; the
			// host overwrites whatever its listings advertise.
			if let Some(hop) = accepted.proxy.trailing() {
				self.accepted_hosts
					.insert(hop, accepted.accepted_ipp.host.clone());
			}
		} else if let Some(listening) = message.downcast_ref::<Listening>() {
			self.log(
				LogTag::Check,
				format!("serving at {}", listening.listening_ipp),
			);
		} else if let Some(refused) = message.downcast_ref::<NotListening>() {
			self.log(
				LogTag::Fault,
				format!("cannot serve at {}: {}", refused.requested_ipp, refused.error),
			);
		} else if message.downcast_ref::<Closed>().is_some()
			|| message.downcast_ref::<Abandoned>().is_some()
		{
			if let Some(hop) = reply_to.trailing() {
				self.peer_lost(hop);
			}
		} else if message.downcast_ref::<Returned>().is_some() {
			self.child_returned(&reply_to);
		} else if message.downcast_ref::<crate::message::Enquiry>().is_some() {
			self.post(Ack, &reply_to);
		} else if message.downcast_ref::<Stop>().is_some() {
			token.teardown("stopped");
			self.post(Ack, &reply_to);
		} else {
			tracing::trace!("directory dropped {message:?}");
		}
	}

	// Publication.

	fn publish(&mut self, request: PublishAs, reply_to: Address) {
		let published_id = Uuid::new_v4();
		if request.scope == Scope::Process {
			let listing = PublishedListing {
				name: request.name.clone(),
				scope: request.scope,
				published_id,
				listening_ipp: HostPort::default(),
				home_address: self.address.clone(),
			};
			self.post(
				Published {
					name: listing.name.clone(),
					published_id,
					listening_ipp: listing.listening_ipp.clone(),
					home_address: listing.home_address.clone(),
				},
				&reply_to,
			);
			self.install_published(listing, Some(request.address), None);
		} else {
			// The listing is only claimable once its peer listener is
			// up; the reply waits for the child.
			let child = self.start_listening_for_peer(
				published_id,
				request.scope,
				request.address.clone(),
				request.name.clone(),
			);
			self.listeners.insert(published_id, child);
			self.pending
				.insert(published_id, PendingPublish { request, reply_to });
		}
	}

	fn peer_listening(&mut self, published_id: Uuid, listening_ipp: HostPort) {
		let Some(pending) = self.pending.remove(&published_id) else {
			return;
		};
		let listing = PublishedListing {
			name: pending.request.name.clone(),
			scope: pending.request.scope,
			published_id,
			listening_ipp,
			home_address: self.address.clone(),
		};
		self.post(
			Published {
				name: listing.name.clone(),
				published_id,
				listening_ipp: listing.listening_ipp.clone(),
				home_address: listing.home_address.clone(),
			},
			&pending.reply_to,
		);
		self.install_published(listing, Some(pending.request.address), None);
	}

	fn peer_listen_failed(&mut self, published_id: Uuid, error: String) {
		self.listeners.remove(&published_id);
		let Some(pending) = self.pending.remove(&published_id) else {
			return;
		};
		self.post(
			NotPublished {
				name: pending.request.name,
				error,
			},
			&pending.reply_to,
		);
	}

	fn install_published(
		&mut self,
		listing: PublishedListing,
		address: Option<Address>,
		peer: Option<Hop>,
	) {
		let id = listing.published_id;
		self.push_up(Some(&listing), None);
		self.published.insert(
			id,
			PublishedEntry {
				listing,
				address,
				peer,
			},
		);
		self.match_published(id);
	}

	// Subscription.

	fn subscribe(&mut self, request: SubscribeTo, reply_to: Address) {
		let regex = match Regex::new(&request.search) {
			Ok(regex) => regex,
			Err(error) => {
				self.post(
					NotSubscribed {
						search: request.search,
						error: error.to_string(),
					},
					&reply_to,
				);
				return;
			}
		};
		let subscribed_id = Uuid::new_v4();
		self.post(
			Subscribed {
				search: request.search.clone(),
				subscribed_id,
			},
			&reply_to,
		);
		let listing = SubscribedListing {
			search: request.search,
			scope: request.scope,
			subscribed_id,
			home_address: self.address.clone(),
		};
		self.install_subscribed(listing, regex, Some(request.address), None);
	}

	fn install_subscribed(
		&mut self,
		listing: SubscribedListing,
		regex: Regex,
		address: Option<Address>,
		peer: Option<Hop>,
	) {
		let id = listing.subscribed_id;
		self.push_up(None, Some(&listing));
		self.subscribed.insert(
			id,
			SubscribedEntry {
				listing,
				regex,
				address,
				peer,
			},
		);
		self.match_subscribed(id);
	}

	// Matching and routes.

	fn match_published(&mut self, published_id: Uuid) {
		let Some(entry) = self.published.get(&published_id) else {
			return;
		};
		let name = entry.listing.name.clone();
		let matched: Vec<Uuid> = self
			.subscribed
			.iter()
			.filter(|(_, s)| s.regex.is_match(&name))
			.map(|(id, _)| *id)
			.collect();
		for subscribed_id in matched {
			self.make_route(published_id, subscribed_id);
		}
	}

	fn match_subscribed(&mut self, subscribed_id: Uuid) {
		let Some(entry) = self.subscribed.get(&subscribed_id) else {
			return;
		};
		let regex = entry.regex.clone();
		let matched: Vec<Uuid> = self
			.published
			.iter()
			.filter(|(_, p)| regex.is_match(&p.listing.name))
			.map(|(id, _)| *id)
			.collect();
		for published_id in matched {
			self.make_route(published_id, subscribed_id);
		}
	}

	fn make_route(&mut self, published_id: Uuid, subscribed_id: Uuid) {
		let (Some(p), Some(s)) = (
			self.published.get(&published_id),
			self.subscribed.get(&subscribed_id),
		) else {
			return;
		};
		let local_pair = p.address.is_some() && s.address.is_some();
		let scope = if local_pair { Scope::Process } else { self.scope };
		let name = p.listing.name.clone();
		let route_id = *self
			.issued
			.entry((published_id, subscribed_id))
			.or_insert_with(Uuid::new_v4);

		if s.address.is_some() {
			let candidate = RouteCandidate {
				route_id,
				scope,
				publisher_id: published_id,
				publisher_address: p.address.clone(),
				ipp: p.address.is_none().then(|| p.listing.listening_ipp.clone()),
			};
			if candidate.publisher_address.is_none()
				&& candidate.ipp.as_ref().map(|i| i.port == 0).unwrap_or(true)
			{
				// A learned listing with no reachable endpoint.
				return;
			}
			self.add_candidate(subscribed_id, name, candidate);
		} else {
			// The subscriber lives below: tell its home directory where
			// the publisher can be reached.
			let ipp = p.listing.listening_ipp.clone();
			if ipp.port == 0 {
				return;
			}
			let home = s.listing.home_address.clone();
			self.post(
				RouteOverLoop {
					route_id,
					scope,
					ipp,
					name,
					publisher_id: published_id,
					subscriber_id: subscribed_id,
				},
				&home,
			);
		}
	}

	fn route_over_loop(&mut self, route: RouteOverLoop) {
		let Some(entry) = self.subscribed.get(&route.subscriber_id) else {
			return;
		};
		if entry.address.is_none() {
			return;
		}
		self.add_candidate(
			route.subscriber_id,
			route.name.clone(),
			RouteCandidate {
				route_id: route.route_id,
				scope: route.scope,
				publisher_id: route.publisher_id,
				publisher_address: None,
				ipp: Some(route.ipp),
			},
		);
	}

	fn add_candidate(&mut self, subscribed_id: Uuid, name: String, candidate: RouteCandidate) {
		let set = self
			.routes
			.entry((subscribed_id, name.clone()))
			.or_default();
		if set
			.candidates
			.iter()
			.any(|c| c.route_id == candidate.route_id)
		{
			// A re-announcement of a route already known.
			return;
		}
		set.candidates.push(candidate);
		self.act_best(subscribed_id, name);
	}

	/// Act on the best candidate for this (subscriber, name) pair; the
	/// previously acted route, if different, is torn down first.
	fn act_best(&mut self, subscribed_id: Uuid, name: String) {
		let Some(subscriber_address) = self
			.subscribed
			.get(&subscribed_id)
			.and_then(|s| s.address.clone())
		else {
			return;
		};

		let (best, previous) = {
			let Some(set) = self.routes.get_mut(&(subscribed_id, name.clone())) else {
				return;
			};
			let Some(best) = set.candidates.iter().max_by_key(|c| c.scope).cloned() else {
				return;
			};
			if set.acted == Some(best.route_id) {
				return;
			}
			let previous = set.acted.replace(best.route_id);
			(best, previous)
		};

		if let Some(route_id) = previous {
			self.post(
				Dropped {
					name: name.clone(),
					route_id,
				},
				&subscriber_address,
			);
		}

		if let Some(publisher_address) = &best.publisher_address {
			// Same process: no connection to build.
			self.route_to_library(&name, &best, publisher_address, &subscriber_address);
		} else if let Some(ipp) = best.ipp.clone() {
			let peer = self.ensure_peer(ipp);
			self.post(
				OpenLoopRequest {
					route_id: best.route_id,
					publisher_id: best.publisher_id,
					subscriber_address,
					name,
				},
				&peer,
			);
		}
	}

	fn route_to_library(
		&self,
		name: &str,
		route: &RouteCandidate,
		publisher_address: &Address,
		subscriber_address: &Address,
	) {
		self.post(
			Available {
				name: name.to_string(),
				route_id: route.route_id,
				publisher_address: publisher_address.clone(),
			},
			subscriber_address,
		);
		self.post(
			Delivered {
				name: name.to_string(),
				route_id: route.route_id,
				subscriber_address: subscriber_address.clone(),
			},
			publisher_address,
		);
	}

	/// Drop every candidate `condemned` selects; acted routes among
	/// them emit `Dropped` and the next best, if any, takes over.
	fn sweep_routes(&mut self, condemned: impl Fn(&RouteCandidate) -> bool) {
		let mut drops: Vec<(Address, String, Uuid)> = Vec::new();
		let mut touched: Vec<(Uuid, String)> = Vec::new();

		for ((subscribed_id, name), set) in &mut self.routes {
			let before = set.candidates.len();
			let acted = set.acted;
			set.candidates.retain(|c| !condemned(c));
			if set.candidates.len() == before {
				continue;
			}
			if let Some(route_id) = acted {
				if !set.candidates.iter().any(|c| c.route_id == route_id) {
					set.acted = None;
					if let Some(address) = self
						.subscribed
						.get(subscribed_id)
						.and_then(|s| s.address.clone())
					{
						drops.push((address, name.clone(), route_id));
					}
				}
			}
			touched.push((*subscribed_id, name.clone()));
		}

		for (address, name, route_id) in drops {
			self.post(Dropped { name, route_id }, &address);
		}
		for (subscribed_id, name) in touched {
			self.act_best(subscribed_id, name);
		}
		self.routes.retain(|_, set| !set.candidates.is_empty());
	}

	// Listing teardown.

	fn remove_published(&mut self, published_id: Uuid, reply_to: Option<Address>) {
		if let Some(entry) = self.published.remove(&published_id) {
			if let Some(child) = self.listeners.remove(&published_id) {
				self.post(Stop, &child);
			}
			if let Some(hop) = entry.peer {
				if let Some(set) = self.learned.get_mut(&hop) {
					set.published.remove(&published_id);
				}
			}
			self.issued.retain(|(p, _), _| *p != published_id);
			self.sweep_routes(|c| c.publisher_id == published_id);
			if entry.address.is_some() {
				self.push_up_clear(Some(&entry.listing), None);
			}
		}
		if let Some(reply_to) = reply_to {
			self.post(PublishedCleared { published_id }, &reply_to);
		}
	}

	fn remove_subscribed(&mut self, subscribed_id: Uuid, reply_to: Option<Address>) {
		if let Some(entry) = self.subscribed.remove(&subscribed_id) {
			if let Some(hop) = entry.peer {
				if let Some(set) = self.learned.get_mut(&hop) {
					set.subscribed.remove(&subscribed_id);
				}
			}
			self.issued.retain(|(_, s), _| *s != subscribed_id);
			self.routes.retain(|(s, _), _| *s != subscribed_id);
			if entry.address.is_some() {
				self.push_up_clear(None, Some(&entry.listing));
			}
		}
		if let Some(reply_to) = reply_to {
			self.post(SubscribedCleared { subscribed_id }, &reply_to);
		}
	}

	fn clear_listings(&mut self, reply_to: Address) {
		let published: Vec<Uuid> = self
			.published
			.iter()
			.filter(|(_, e)| e.address.as_ref() == Some(&reply_to))
			.map(|(id, _)| *id)
			.collect();
		let subscribed: Vec<Uuid> = self
			.subscribed
			.iter()
			.filter(|(_, e)| e.address.as_ref() == Some(&reply_to))
			.map(|(id, _)| *id)
			.collect();
		for id in published {
			self.remove_published(id, Some(reply_to.clone()));
		}
		for id in subscribed {
			self.remove_subscribed(id, Some(reply_to.clone()));
		}
	}

	// Listings learned from downward peers.

	fn learn(&mut self, listings: PublishedDirectory, from: &Address) {
		let Some(peer_hop) = from.trailing() else {
			return;
		};
		let host = self.accepted_hosts.get(&peer_hop).cloned();

		for mut listing in listings.published {
			let id = listing.published_id;
			if self.published.contains_key(&id) {
				continue;
			}
			// The advertised host is whatever the publisher's process
			// could see; the address the peer actually connected from
			// is the one that routes.
			if let (Some(host), true) = (&host, listing.listening_ipp.port != 0) {
				listing.listening_ipp.host = host.clone();
			}
			self.learned.entry(peer_hop).or_default().published.insert(id);
			self.install_published(listing, None, Some(peer_hop));
		}

		for listing in listings.subscribed {
			let id = listing.subscribed_id;
			if self.subscribed.contains_key(&id) {
				continue;
			}
			let regex = match Regex::new(&listing.search) {
				Ok(regex) => regex,
				Err(error) => {
					self.log(
						LogTag::Warning,
						format!("learned search {:?} does not compile: {error}", listing.search),
					);
					continue;
				}
			};
			self.learned
				.entry(peer_hop)
				.or_default()
				.subscribed
				.insert(id);
			self.install_subscribed(listing, regex, None, Some(peer_hop));
		}
	}

	fn peer_lost(&mut self, peer_hop: Hop) {
		self.accepted_hosts.remove(&peer_hop);
		let Some(set) = self.learned.remove(&peer_hop) else {
			return;
		};
		for id in set.published {
			self.remove_published(id, None);
		}
		for id in set.subscribed {
			self.remove_subscribed(id, None);
		}
	}

	// Peer connections outward (subscriber side).

	fn ensure_peer(&mut self, ipp: HostPort) -> Address {
		let key = ipp.to_string();
		if let Some(child) = self.peers.get(&key) {
			return child.clone();
		}
		let child = self.start_connect_to_peer(ipp);
		self.peers.insert(key, child.clone());
		child
	}

	fn peer_out(&mut self, ipp: HostPort) {
		self.peers.remove(&ipp.to_string());
		let lost = ipp.to_string();
		self.sweep_routes(|c| {
			c.ipp
				.as_ref()
				.map(|i| i.to_string() == lost)
				.unwrap_or(false)
		});
	}

	// The uplink.

	fn serve(&mut self, request: ServeAsDirectory) {
		self.scope = request.scope;
		if let Some(connector) = self.runtime.connector_address() {
			self.post(
				ListenForStream {
					requested_ipp: request.ipp,
					encrypted: false,
					tunnel: false,
				},
				&connector,
			);
		}
	}

	fn connect_up(&mut self, request: ConnectToDirectory) {
		if let Some(previous) = self.uplink.take() {
			self.post(Stop, &previous.child);
		}
		let child = self.start_uplink(request.ipp);
		self.uplink = Some(Uplink {
			scope: request.scope,
			child,
			proxy: None,
		});
	}

	fn uplink_up(&mut self, proxy: Address) {
		let Some(uplink) = &mut self.uplink else {
			return;
		};
		uplink.proxy = Some(proxy.clone());
		let up_scope = uplink.scope;
		// The consolidated snapshot: everything visible at or above
		// the upward directory's scope.
		let snapshot = PublishedDirectory {
			published: self
				.published
				.values()
				.filter(|e| e.listing.scope >= up_scope)
				.map(|e| e.listing.clone())
				.collect(),
			subscribed: self
				.subscribed
				.values()
				.filter(|e| e.listing.scope >= up_scope)
				.map(|e| e.listing.clone())
				.collect(),
		};
		self.post(snapshot, &proxy);
	}

	fn push_up(&self, published: Option<&PublishedListing>, subscribed: Option<&SubscribedListing>) {
		let Some(uplink) = &self.uplink else {
			return;
		};
		let Some(proxy) = &uplink.proxy else {
			return;
		};
		let delta = PublishedDirectory {
			published: published
				.filter(|l| l.scope >= uplink.scope)
				.cloned()
				.into_iter()
				.collect(),
			subscribed: subscribed
				.filter(|l| l.scope >= uplink.scope)
				.cloned()
				.into_iter()
				.collect(),
		};
		if delta.published.is_empty() && delta.subscribed.is_empty() {
			return;
		}
		self.post(delta, proxy);
	}

	fn push_up_clear(
		&self,
		published: Option<&PublishedListing>,
		subscribed: Option<&SubscribedListing>,
	) {
		let Some(uplink) = &self.uplink else {
			return;
		};
		let Some(proxy) = &uplink.proxy else {
			return;
		};
		if let Some(listing) = published.filter(|l| l.scope >= uplink.scope) {
			self.post(
				ClearPublished {
					published_id: listing.published_id,
				},
				proxy,
			);
		}
		if let Some(listing) = subscribed.filter(|l| l.scope >= uplink.scope) {
			self.post(
				ClearSubscribed {
					subscribed_id: listing.subscribed_id,
				},
				proxy,
			);
		}
	}

	fn child_returned(&mut self, child: &Address) {
		self.listeners.retain(|_, address| address != child);
		self.peers.retain(|_, address| address != child);
		if let Some(uplink) = &self.uplink {
			if uplink.child == *child {
				self.uplink = None;
			}
		}
	}

	// Children.

	/// The per-listing peer listener: takes an ephemeral port, reports
	/// it, then answers `OpenLoop` for the life of the listing.
	fn start_listening_for_peer(
		&self,
		published_id: Uuid,
		scope: Scope,
		publisher_address: Address,
		name: String,
	) -> Address {
		let Some(connector) = self.runtime.connector_address() else {
			return Address::null();
		};
		let parent = self.address.clone();
		self.runtime.create_routine(
			"listening-for-peer",
			move |mut channel| async move {
				let requested = if scope >= Scope::Lan {
					HostPort::all_interfaces(0)
				} else {
					HostPort::loopback(0)
				};
				channel.send(
					ListenForStream {
						requested_ipp: requested,
						encrypted: false,
						tunnel: false,
					},
					&connector,
				);

				let frame = channel
					.select()
					.of::<Listening>()
					.of::<NotListening>()
					.of::<Stop>()
					.frame()
					.await?;
				let message = frame.message.clone();
				if let Some(refused) = message.downcast_ref::<NotListening>() {
					channel.send(
						PeerListenFailed {
							published_id,
							error: refused.error.clone(),
						},
						&parent,
					);
					return Ok(Arc::new(Ack) as Arc<dyn Message>);
				}
				let Some(listening) = message.downcast_ref::<Listening>() else {
					return Ok(Arc::new(Ack) as Arc<dyn Message>);
				};
				let assigned = listening.listening_ipp.clone();
				channel.send(
					PeerListening {
						published_id,
						listening_ipp: assigned.clone(),
					},
					&parent,
				);

				loop {
					let frame = channel.input().await?;
					let message = frame.message.clone();
					if let Some(open) = message.downcast_ref::<OpenLoop>() {
						channel.reply(LoopOpened {
							route_id: open.route_id,
							address: publisher_address.clone(),
						});
						channel.send(
							Delivered {
								name: name.clone(),
								route_id: open.route_id,
								subscriber_address: open.address.clone(),
							},
							&publisher_address,
						);
					} else if message.downcast_ref::<Stop>().is_some() {
						channel.send(
							StopListening {
								requested_ipp: assigned.clone(),
							},
							&connector,
						);
						return Ok(Arc::new(Ack) as Arc<dyn Message>);
					}
					// Accepted, Closed and Abandoned for individual
					// peer connections need nothing from us.
				}
			},
			self.address.clone(),
		)
	}

	/// The outward half of a loop: one connection per publisher
	/// endpoint, shared by every route that needs it.
	fn start_connect_to_peer(&self, ipp: HostPort) -> Address {
		let Some(connector) = self.runtime.connector_address() else {
			return Address::null();
		};
		let parent = self.address.clone();
		self.runtime.create_routine(
			"connect-to-peer",
			move |mut channel| async move {
				channel.send(
					ConnectStream {
						requested_ipp: ipp.clone(),
						encrypted: false,
						tunnel: false,
					},
					&connector,
				);

				let mut queued: Vec<OpenLoopRequest> = Vec::new();
				let proxy = loop {
					let frame = channel.input().await?;
					let message = frame.message.clone();
					if let Some(connected) = message.downcast_ref::<Connected>() {
						break connected.proxy.clone();
					}
					if message.downcast_ref::<NotConnected>().is_some() {
						channel.send(PeerOut { ipp: ipp.clone() }, &parent);
						return Ok(Arc::new(Ack) as Arc<dyn Message>);
					}
					if let Some(request) = message.downcast_ref::<OpenLoopRequest>() {
						queued.push(request.clone());
					} else if message.downcast_ref::<Stop>().is_some() {
						return Ok(Arc::new(Ack) as Arc<dyn Message>);
					}
				};

				let mut opens: HashMap<Uuid, (Address, String)> = HashMap::new();
				for request in queued {
					opens.insert(
						request.route_id,
						(request.subscriber_address.clone(), request.name.clone()),
					);
					channel.send(
						OpenLoop {
							route_id: request.route_id,
							publisher_id: request.publisher_id,
							address: request.subscriber_address,
						},
						&proxy,
					);
				}

				loop {
					let frame = channel.input().await?;
					let message = frame.message.clone();
					if let Some(request) = message.downcast_ref::<OpenLoopRequest>() {
						opens.insert(
							request.route_id,
							(request.subscriber_address.clone(), request.name.clone()),
						);
						channel.send(
							OpenLoop {
								route_id: request.route_id,
								publisher_id: request.publisher_id,
								address: request.subscriber_address.clone(),
							},
							&proxy,
						);
					} else if let Some(opened) = message.downcast_ref::<LoopOpened>() {
						if let Some((subscriber, name)) = opens.get(&opened.route_id) {
							channel.send(
								Available {
									name: name.clone(),
									route_id: opened.route_id,
									publisher_address: opened.address.clone(),
								},
								subscriber,
							);
						}
					} else if message.downcast_ref::<Closed>().is_some()
						|| message.downcast_ref::<Abandoned>().is_some()
					{
						channel.send(PeerOut { ipp: ipp.clone() }, &parent);
						return Ok(Arc::new(Ack) as Arc<dyn Message>);
					} else if message.downcast_ref::<Stop>().is_some() {
						channel.send(Stop, &proxy);
						return Ok(Arc::new(Ack) as Arc<dyn Message>);
					}
				}
			},
			self.address.clone(),
		)
	}

	/// The uplink: keeps a connection to the upward directory alive,
	/// announces it to the parent and relays whatever comes down.
	fn start_uplink(&self, ipp: HostPort) -> Address {
		let Some(connector) = self.runtime.connector_address() else {
			return Address::null();
		};
		let parent = self.address.clone();
		self.runtime.create_routine(
			"connect-to-directory",
			move |mut channel| async move {
				let plan = RetryIntervals::default();
				let mut intervals = plan.intervals();
				'connecting: loop {
					channel.send(
						ConnectStream {
							requested_ipp: ipp.clone(),
							encrypted: false,
							tunnel: false,
						},
						&connector,
					);
					let frame = channel
						.select()
						.of::<Connected>()
						.of::<NotConnected>()
						.of::<Stop>()
						.frame()
						.await?;
					let message = frame.message.clone();
					if message.downcast_ref::<Stop>().is_some() {
						return Ok(Arc::new(Ack) as Arc<dyn Message>);
					}
					if message.downcast_ref::<NotConnected>().is_some() {
						let Some(step) = intervals.next() else {
							channel.send(UplinkDown, &parent);
							return Ok(Arc::new(Ack) as Arc<dyn Message>);
						};
						let frame = channel
							.select()
							.of::<Stop>()
							.seconds(step.as_secs_f64())
							.frame()
							.await?;
						if frame.message.downcast_ref::<Stop>().is_some() {
							return Ok(Arc::new(Ack) as Arc<dyn Message>);
						}
						continue;
					}
					let Some(connected) = message.downcast_ref::<Connected>() else {
						continue;
					};
					let proxy = connected.proxy.clone();
					channel.send(
						UplinkUp {
							proxy: proxy.clone(),
						},
						&parent,
					);
					intervals = plan.intervals();

					loop {
						let frame = channel.input().await?;
						let message = frame.message.clone();
						if message.downcast_ref::<Closed>().is_some()
							|| message.downcast_ref::<Abandoned>().is_some()
						{
							channel.send(UplinkDown, &parent);
							continue 'connecting;
						}
						if message.downcast_ref::<Stop>().is_some() {
							channel.send(Stop, &proxy);
							return Ok(Arc::new(Ack) as Arc<dyn Message>);
						}
						// Everything else came from the upward
						// directory and belongs to ours.
						channel.forward_dyn(message, &parent, &frame.return_address);
					}
				}
			},
			self.address.clone(),
		)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn scopes_are_totally_ordered() {
		assert!(Scope::Process < Scope::Group);
		assert!(Scope::Group < Scope::Host);
		assert!(Scope::Host < Scope::Lan);
		assert!(Scope::Lan < Scope::Wan);
	}

	#[test]
	fn scope_names_round_trip() {
		for name in Scope::MEMBERS {
			let scope = Scope::from_name(name).unwrap();
			assert_eq!(scope.as_name(), name);
		}
		assert_eq!(Scope::from_name("GALAXY"), None);
	}

	#[test]
	fn well_known_interfaces() {
		let ports = well_known();
		assert_eq!(ports.host.host, "127.0.0.1");
		assert_eq!(ports.lan.host, "0.0.0.0");
	}

	#[test]
	fn listing_survives_its_value_form() {
		let reg = MessageRegistry::new();
		crate::message::bind_stock(&reg).unwrap();
		crate::transport::bind(&reg).unwrap();
		bind(&reg).unwrap();

		let listing = PublishedListing {
			name: "acme".to_string(),
			scope: Scope::Host,
			published_id: Uuid::new_v4(),
			listening_ipp: HostPort::loopback(4040),
			home_address: Address::local(12),
		};
		let value = listing.to_value(&reg).unwrap();
		let back = PublishedListing::from_value(&value, &reg).unwrap();
		assert_eq!(back.name, listing.name);
		assert_eq!(back.scope, listing.scope);
		assert_eq!(back.published_id, listing.published_id);
		assert_eq!(back.listening_ipp, listing.listening_ipp);
		assert_eq!(back.home_address, listing.home_address);
	}
}
