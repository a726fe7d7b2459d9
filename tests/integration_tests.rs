use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::OnceLock;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;

use chrono::DateTime;
use chrono::Utc;
use uuid::Uuid;

use runy_fabric::address::Address;
use runy_fabric::codec;
use runy_fabric::codec::Codec;
use runy_fabric::dispatch::Dispatch;
use runy_fabric::dispatch::Disposition;
use runy_fabric::dispatch::Next;
use runy_fabric::dispatch::StateMachine;
use runy_fabric::dispatch::StateTable;
use runy_fabric::dispatch::Stateless;
use runy_fabric::error::CodecError;
use runy_fabric::entry;
use runy_fabric::message::Aborted;
use runy_fabric::message::Ack;
use runy_fabric::message::Enquiry;
use runy_fabric::message::Faulted;
use runy_fabric::message::Incognito;
use runy_fabric::message::Message;
use runy_fabric::message::Nak;
use runy_fabric::message::Ping;
use runy_fabric::message::Portable;
use runy_fabric::message::Returned;
use runy_fabric::message::Stop;
use runy_fabric::message::field;
use runy_fabric::portable::PortableType;
use runy_fabric::registry::MessageFlags;
use runy_fabric::registry::MessageRegistry;
use runy_fabric::registry::Schema;
use runy_fabric::registry::TypeRegistry;
use runy_fabric::runtime::Runtime;
use runy_fabric::timer::SelectTimer;
use runy_fabric::value::Value;

// Selective receive: accepted types come through, saved types replay
// on the next select, everything else is dropped.
#[tokio::test]
async fn select_with_save_defers_and_replays() {
	let runtime = Runtime::start();
	let (mut channel, address) = runtime.open_channel("selector", Address::null());

	channel.send(Ack, &address);
	channel.send(Nak, &address);
	channel.send(Enquiry, &address);

	let frame = channel
		.select()
		.of::<Enquiry>()
		.saving::<Ack>()
		.frame()
		.await
		.unwrap();
	assert!(frame.message.downcast_ref::<Enquiry>().is_some());

	// The Ack was saved, the Nak was dropped.
	let frame = channel.select().of::<Ack>().seconds(2.0).frame().await.unwrap();
	assert!(frame.message.downcast_ref::<Ack>().is_some());

	runtime.tear_down();
}

// Descriptors intern to one instance per signature.
#[test]
fn installed_types_collapse_by_signature() {
	let types = TypeRegistry::new();
	let first = types.install(PortableType::VectorOf(Box::new(PortableType::Int8)));
	let second = types.install(PortableType::VectorOf(Box::new(PortableType::Int8)));
	assert!(Arc::ptr_eq(&first, &second));

	let found = types.lookup("vector<int8>").unwrap();
	assert!(Arc::ptr_eq(&found, &first));
	assert!(types.lookup("vector<int4>").is_none());
}

// Every schema attribute is present on a default-constructed instance.
#[test]
fn schema_covers_default_instances() {
	let reg = MessageRegistry::new();
	runy_fabric::message::bind_stock(&reg).unwrap();

	for name in ["fabric.Faulted", "fabric.TimedOut", "fabric.Blob"] {
		let meta = reg.find_name(name).unwrap();
		let instance = (meta.default)();
		let value = (meta.to_value)(instance.as_ref(), &reg).unwrap();
		for attribute in meta.schema.keys() {
			assert!(
				value.get(attribute).is_some(),
				"{name} default lacks {attribute}"
			);
		}
	}
}

// Sends to a destroyed address are dropped silently.
#[tokio::test]
async fn send_after_destroy_is_silent() {
	let runtime = Runtime::start();
	let (target, target_address) = runtime.open_channel("target", Address::null());
	let (sender, _) = runtime.open_channel("sender", Address::null());

	runtime.destroy_object(&target_address);
	assert!(runtime.find_object(&target_address).is_none());

	sender.send(Ack, &target_address);
	sender.send(Ack, &Address::null());

	drop(target);
	runtime.tear_down();
}

// A user type with every primitive and container shape survives the
// JSON wire form, and re-encoding is byte identical.

#[derive(Clone, Debug, PartialEq)]
struct Everything {
	flag: bool,
	count: i64,
	ratio: f64,
	glyph: String,
	data: Vec<u8>,
	text: String,
	when: DateTime<Utc>,
	span: chrono::Duration,
	id: Uuid,
	color: String,
	numbers: Vec<i64>,
	triple: [i64; 3],
	tags: Vec<String>,
	ranks: Vec<(String, i64)>,
	target: Address,
	extra: Value,
}

impl Default for Everything {
	fn default() -> Self {
		Everything {
			flag: false,
			count: 0,
			ratio: 0.0,
			glyph: " ".to_string(),
			data: Vec::new(),
			text: String::new(),
			when: DateTime::UNIX_EPOCH,
			span: chrono::Duration::zero(),
			id: Uuid::nil(),
			color: "RED".to_string(),
			numbers: Vec::new(),
			triple: [0; 3],
			tags: Vec::new(),
			ranks: Vec::new(),
			target: Address::null(),
			extra: Value::Null,
		}
	}
}

impl Message for Everything {}

impl Portable for Everything {
	const NAME: &'static str = "test.Everything";

	fn schema() -> Schema {
		Schema::from([
			("flag".to_string(), PortableType::Boolean),
			("count".to_string(), PortableType::Int8),
			("ratio".to_string(), PortableType::Float8),
			("glyph".to_string(), PortableType::Character),
			("data".to_string(), PortableType::Block),
			("text".to_string(), PortableType::Str),
			("when".to_string(), PortableType::Clock),
			("span".to_string(), PortableType::Span),
			("id".to_string(), PortableType::Uuid),
			(
				"color".to_string(),
				PortableType::Enumeration("test.Color".to_string()),
			),
			(
				"numbers".to_string(),
				PortableType::VectorOf(Box::new(PortableType::Int8)),
			),
			(
				"triple".to_string(),
				PortableType::ArrayOf(Box::new(PortableType::Int8), 3),
			),
			(
				"tags".to_string(),
				PortableType::SetOf(Box::new(PortableType::Str)),
			),
			(
				"ranks".to_string(),
				PortableType::MapOf(Box::new(PortableType::Str), Box::new(PortableType::Int8)),
			),
			("target".to_string(), PortableType::Address),
			("extra".to_string(), PortableType::Word),
		])
	}

	fn to_value(&self, _reg: &MessageRegistry) -> Result<Value, CodecError> {
		Ok(Value::record([
			("flag", Value::Bool(self.flag)),
			("count", Value::Int(self.count)),
			("ratio", Value::Float(self.ratio)),
			("glyph", Value::Str(self.glyph.clone())),
			("data", Value::Bytes(self.data.clone())),
			("text", Value::Str(self.text.clone())),
			(
				"when",
				Value::Str(runy_fabric::clock::clock_to_text(&self.when)),
			),
			(
				"span",
				Value::Str(runy_fabric::clock::span_to_text(&self.span)),
			),
			("id", Value::Str(self.id.to_string())),
			("color", Value::Str(self.color.clone())),
			(
				"numbers",
				Value::List(self.numbers.iter().map(|n| Value::Int(*n)).collect()),
			),
			(
				"triple",
				Value::List(self.triple.iter().map(|n| Value::Int(*n)).collect()),
			),
			(
				"tags",
				Value::List(self.tags.iter().map(|t| Value::Str(t.clone())).collect()),
			),
			(
				"ranks",
				Value::Map(
					self.ranks
						.iter()
						.map(|(k, v)| (Value::Str(k.clone()), Value::Int(*v)))
						.collect(),
				),
			),
			("target", Value::Address(self.target.clone())),
			("extra", self.extra.clone()),
		]))
	}

	fn from_value(value: &Value, _reg: &MessageRegistry) -> Result<Self, CodecError> {
		let of = Self::NAME;
		let text_field = |name: &str| -> Result<String, CodecError> {
			Ok(field(value, name, of)?
				.as_str()
				.unwrap_or_default()
				.to_string())
		};
		let ints = |name: &str| -> Result<Vec<i64>, CodecError> {
			match field(value, name, of)? {
				Value::List(items) => Ok(items.iter().filter_map(|v| v.as_int()).collect()),
				_ => Ok(Vec::new()),
			}
		};

		let numbers = ints("numbers")?;
		let triple_items = ints("triple")?;
		let mut triple = [0i64; 3];
		for (slot, item) in triple.iter_mut().zip(triple_items) {
			*slot = item;
		}

		let tags = match field(value, "tags", of)? {
			Value::List(items) => items
				.iter()
				.filter_map(|v| v.as_str().map(str::to_string))
				.collect(),
			_ => Vec::new(),
		};
		let ranks = match field(value, "ranks", of)? {
			Value::Map(pairs) => pairs
				.iter()
				.filter_map(|(k, v)| Some((k.as_str()?.to_string(), v.as_int()?)))
				.collect(),
			_ => Vec::new(),
		};

		Ok(Everything {
			flag: field(value, "flag", of)?.as_bool().unwrap_or_default(),
			count: field(value, "count", of)?.as_int().unwrap_or_default(),
			ratio: match field(value, "ratio", of)? {
				Value::Float(f) => *f,
				Value::Int(i) => *i as f64,
				_ => 0.0,
			},
			glyph: text_field("glyph")?,
			data: match field(value, "data", of)? {
				Value::Bytes(b) => b.clone(),
				_ => Vec::new(),
			},
			text: text_field("text")?,
			when: runy_fabric::clock::text_to_clock(&text_field("when")?)?,
			span: runy_fabric::clock::text_to_span(&text_field("span")?)?,
			id: Uuid::parse_str(&text_field("id")?).unwrap_or(Uuid::nil()),
			color: text_field("color")?,
			numbers,
			triple,
			tags,
			ranks,
			target: field(value, "target", of)?
				.as_address()
				.cloned()
				.unwrap_or_else(Address::null),
			extra: field(value, "extra", of)?.clone(),
		})
	}

	fn default_message() -> Self {
		Everything::default()
	}
}

fn everything_registry() -> MessageRegistry {
	let reg = MessageRegistry::new();
	runy_fabric::message::bind_stock(&reg).unwrap();
	reg.types
		.install_enum("test.Color", &["RED", "GREEN", "BLUE"]);
	reg.bind::<Everything>(MessageFlags::default()).unwrap();
	reg
}

fn sample_everything() -> Everything {
	Everything {
		flag: true,
		count: -42,
		ratio: 2.5,
		glyph: "x".to_string(),
		data: vec![0, 1, 2, 254, 255],
		text: "portable".to_string(),
		when: runy_fabric::clock::text_to_clock("2026-08-04T10:30:00.250000Z").unwrap(),
		span: chrono::Duration::seconds(3661) + chrono::Duration::microseconds(123_456),
		id: Uuid::parse_str("3f2a8c1e-0000-4000-8000-00000000abcd").unwrap(),
		color: "GREEN".to_string(),
		numbers: vec![1, 1, 2, 3, 5, 8],
		triple: [7, 8, 9],
		// Sets and maps render in canonical order; the instance holds
		// that order so re-encoding is byte identical.
		tags: vec!["alpha".to_string(), "beta".to_string()],
		ranks: vec![("first".to_string(), 1), ("second".to_string(), 2)],
		target: Address::from_hops(vec![5, 9]),
		extra: Value::record([("free", Value::Str("form".to_string()))]),
	}
}

#[test]
fn everything_round_trips_byte_identical() {
	let reg = everything_registry();
	let original = sample_everything();

	let (body, addresses) = codec::encode_body(&reg, &original).unwrap();
	let decoded = codec::decode_body(&reg, &body, &addresses).unwrap();
	let back = decoded.downcast_ref::<Everything>().unwrap();
	assert_eq!(back, &original);

	let (again, _) = codec::encode_body(&reg, back).unwrap();
	assert_eq!(body, again);
}

#[test]
fn unknown_enum_member_fails_to_encode() {
	let reg = everything_registry();
	let mut broken = sample_everything();
	broken.color = "MAUVE".to_string();
	let result = codec::encode_body(&reg, &broken);
	assert!(matches!(result, Err(CodecError::OutOfDomain { .. })));
}

// A pointer graph keeps shared identity: one emission in the side
// table, aliases everywhere else.
#[test]
fn pointer_graph_preserves_sharing() {
	let reg = MessageRegistry::new();
	let codec = Codec::new(&reg);
	let t = PortableType::VectorOf(Box::new(PortableType::PointerTo(Box::new(
		PortableType::Str,
	))));

	let arena = BTreeMap::from([("n1".to_string(), Value::Str("shared".to_string()))]);
	let value = Value::List(vec![
		Value::Alias("n1".to_string()),
		Value::Alias("n1".to_string()),
		Value::Null,
	]);

	let packed = codec.pack(&value, &arena, &t).unwrap();
	assert_eq!(packed.aliased.len(), 1);

	let unpacked = codec
		.unpack(&packed.value, &packed.aliased, &[], &t)
		.unwrap();
	assert_eq!(unpacked.value, value);
	assert_eq!(
		unpacked.aliased.get("n1"),
		Some(&Value::Str("shared".to_string()))
	);
}

// Arrays pad short wire forms and truncate long ones on decode; on
// encode the length must match exactly.
#[test]
fn array_wire_length_pads_and_truncates() {
	let reg = MessageRegistry::new();
	let codec = Codec::new(&reg);
	let t = PortableType::ArrayOf(Box::new(PortableType::Int8), 3);
	let arena = BTreeMap::new();

	let short = Value::List(vec![Value::Int(1), Value::Int(2)]);
	let unpacked = codec.unpack(&short, &arena, &[], &t).unwrap();
	assert_eq!(
		unpacked.value,
		Value::List(vec![Value::Int(1), Value::Int(2), Value::Int(0)])
	);

	let long = Value::List((0..5).map(Value::Int).collect());
	let unpacked = codec.unpack(&long, &arena, &[], &t).unwrap();
	assert_eq!(
		unpacked.value,
		Value::List(vec![Value::Int(0), Value::Int(1), Value::Int(2)])
	);

	let packed = codec.pack(&short, &arena, &t);
	assert!(matches!(packed, Err(CodecError::ArrayLength { .. })));
}

// An unknown wire type decodes to Incognito and re-encodes verbatim.
#[test]
fn incognito_survives_a_relay() {
	let reg = MessageRegistry::new();
	runy_fabric::message::bind_stock(&reg).unwrap();

	let envelope = Value::List(vec![
		Value::Str("acme.Custom".to_string()),
		Value::record([("weight", Value::Int(12))]),
	]);
	let decoded = codec::decode_any(&reg, &envelope).unwrap();
	let incognito = decoded.downcast_ref::<Incognito>().unwrap();
	assert_eq!(incognito.type_name, "acme.Custom");

	let re_encoded = codec::encode_any(&reg, incognito).unwrap();
	assert_eq!(re_encoded, envelope);
}

// A stateless machine on the shared dispatcher answers by type.

struct EchoMachine;

impl Stateless for EchoMachine {
	fn table() -> &'static Dispatch<Self> {
		static TABLE: OnceLock<Dispatch<EchoMachine>> = OnceLock::new();
		TABLE.get_or_init(|| {
			Dispatch::new()
				.on::<Enquiry>(|_machine, point, _| {
					point.reply(Ack);
					Disposition::Working
				})
				.on::<Stop>(|_machine, _point, _| Disposition::Complete(Arc::new(Aborted::new())))
		})
	}
}

#[tokio::test]
async fn stateless_machine_dispatches_by_type() {
	let runtime = Runtime::start();
	let (mut channel, _) = runtime.open_channel("probe", Address::null());
	let machine = channel.point.create(EchoMachine);

	channel.send(Enquiry, &machine);
	let frame = channel.select().of::<Ack>().seconds(5.0).frame().await.unwrap();
	assert!(frame.message.downcast_ref::<Ack>().is_some());

	channel.send(Stop, &machine);
	let frame = channel
		.select()
		.of::<Returned>()
		.seconds(5.0)
		.frame()
		.await
		.unwrap();
	let returned = frame.message.downcast_ref::<Returned>().unwrap();
	assert!(returned.value.downcast_ref::<Aborted>().is_some());
	assert!(runtime.find_object(&machine).is_none());

	runtime.tear_down();
}

// A panicking handler faults its own object; the dispatcher group and
// every other object on it keep running.

struct Grenade;

impl Stateless for Grenade {
	fn table() -> &'static Dispatch<Self> {
		static TABLE: OnceLock<Dispatch<Grenade>> = OnceLock::new();
		TABLE.get_or_init(|| {
			Dispatch::new().on::<Enquiry>(|_machine, _point, _| panic!("boom"))
		})
	}
}

#[tokio::test]
async fn panicking_handler_faults_the_object() {
	let runtime = Runtime::start();
	let (mut channel, _) = runtime.open_channel("witness", Address::null());
	let doomed = channel.point.create(Grenade);
	let survivor = channel.point.create(EchoMachine);

	channel.send(Enquiry, &doomed);
	let frame = channel
		.select()
		.of::<Returned>()
		.seconds(5.0)
		.frame()
		.await
		.unwrap();
	let returned = frame.message.downcast_ref::<Returned>().unwrap();
	assert!(returned.value.downcast_ref::<Faulted>().is_some());
	assert!(runtime.find_object(&doomed).is_none());

	// The group survived its tenant.
	channel.send(Enquiry, &survivor);
	let frame = channel.select().of::<Ack>().seconds(5.0).frame().await.unwrap();
	assert!(frame.message.downcast_ref::<Ack>().is_some());

	runtime.tear_down();
}

// A state machine defers saved types until a transition, then replays
// them.

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
enum Phase {
	Filling,
	Serving,
}

struct Gate {
	phase: Phase,
}

impl StateMachine for Gate {
	type State = Phase;

	fn state(&self) -> Phase {
		self.phase
	}

	fn set_state(&mut self, state: Phase) {
		self.phase = state;
	}

	fn table() -> &'static StateTable<Self> {
		static TABLE: OnceLock<StateTable<Gate>> = OnceLock::new();
		TABLE.get_or_init(|| {
			StateTable::new()
				.saving::<Enquiry>(Phase::Filling)
				.on::<Ack>(Phase::Filling, |_machine, _point, _| {
					Next::To(Phase::Serving)
				})
				.on::<Enquiry>(Phase::Serving, |_machine, point, _| {
					point.reply(Ack);
					Next::To(Phase::Serving)
				})
				.on::<Stop>(Phase::Filling, |_machine, _point, _| {
					Next::Complete(Arc::new(Aborted::new()))
				})
				.on::<Stop>(Phase::Serving, |_machine, _point, _| {
					Next::Complete(Arc::new(Aborted::new()))
				})
		})
	}
}

#[tokio::test]
async fn state_machine_saves_until_transition() {
	let runtime = Runtime::start();
	let (mut channel, _) = runtime.open_channel("opener", Address::null());
	let gate = channel.point.create_machine(Gate {
		phase: Phase::Filling,
	});

	// Deferred while Filling; replayed and answered once the Ack has
	// driven the transition to Serving.
	channel.send(Enquiry, &gate);
	channel.send(Ack, &gate);

	let frame = channel.select().of::<Ack>().seconds(5.0).frame().await.unwrap();
	assert!(frame.message.downcast_ref::<Ack>().is_some());

	channel.send(Stop, &gate);
	let frame = channel
		.select()
		.of::<Returned>()
		.seconds(5.0)
		.frame()
		.await
		.unwrap();
	assert!(frame.message.downcast_ref::<Returned>().is_some());

	runtime.tear_down();
}

// A routine's return value becomes a Returned to the parent; an
// on_return callback fires when the parent debriefs it.
#[tokio::test]
async fn routine_returns_to_parent_with_callback() {
	let runtime = Runtime::start();
	let (mut channel, _) = runtime.open_channel("parent", Address::null());

	let child = channel
		.point
		.create_routine("worker", |_channel| async move {
			Ok(Arc::new(Ack) as Arc<dyn Message>)
		});

	let hit = Arc::new(AtomicBool::new(false));
	let flag = hit.clone();
	channel.point.on_return(child.clone(), move |_point, value| {
		flag.store(value.downcast_ref::<Ack>().is_some(), Ordering::SeqCst);
	});
	assert!(channel.point.working());

	let frame = channel
		.select()
		.of::<Returned>()
		.seconds(5.0)
		.frame()
		.await
		.unwrap();
	let returned = frame.message.downcast_ref::<Returned>().unwrap().clone();
	assert!(channel.point.dispatch_return(&returned));
	assert!(hit.load(Ordering::SeqCst));
	assert!(!channel.point.working());

	runtime.tear_down();
}

// Abort stops assigned children and marks the point aborted.
#[tokio::test]
async fn abort_stops_assigned_children() {
	let runtime = Runtime::start();
	let (mut channel, _) = runtime.open_channel("boss", Address::null());

	let child = channel
		.point
		.create_routine("lingerer", |mut channel| async move {
			let _ = channel.select().of::<Stop>().frame().await;
			Ok(Arc::new(Aborted::new()) as Arc<dyn Message>)
		});
	channel
		.point
		.assign(child.clone(), Value::Str("job-1".to_string()));
	assert!(channel.point.working());

	channel.point.abort();
	assert!(channel.point.aborted());

	let frame = channel
		.select()
		.of::<Returned>()
		.seconds(5.0)
		.frame()
		.await
		.unwrap();
	let returned = frame.message.downcast_ref::<Returned>().unwrap();
	assert!(returned.value.downcast_ref::<Aborted>().is_some());
	assert!(channel.point.debrief(&child).is_some());

	runtime.tear_down();
}

// The process entry maps terminal values to exit statuses: clean
// values exit zero, faults carry their own status or the default.
#[tokio::test]
async fn run_root_maps_terminal_values_to_status() {
	let runtime = Runtime::start();

	let status = entry::run_root_on(
		&runtime,
		|_channel| async move { Ok(Arc::new(Ack) as Arc<dyn Message>) },
		false,
	)
	.await;
	assert_eq!(status, 0);

	let status = entry::run_root_on(
		&runtime,
		|_channel| async move {
			let fault = Faulted {
				condition: "broke".to_string(),
				explanation: None,
				code: None,
				exit_status: Some(9),
			};
			Ok(Arc::new(fault) as Arc<dyn Message>)
		},
		false,
	)
	.await;
	assert_eq!(status, 9);

	runtime.tear_down();
}

// The countdown service posts the timer class back to the requester;
// cancellation before expiry keeps it quiet.
#[tokio::test]
async fn timers_fire_and_cancel() {
	let runtime = Runtime::start();
	let (mut channel, _) = runtime.open_channel("ticker", Address::null());

	channel.point.start::<Ping>(0.05, false);
	let frame = channel.select().of::<Ping>().seconds(5.0).frame().await.unwrap();
	assert!(frame.message.downcast_ref::<Ping>().is_some());

	channel.point.start::<Ping>(0.2, false);
	channel.point.cancel::<Ping>();
	let frame = channel.select().of::<Ping>().seconds(0.5).frame().await.unwrap();
	assert!(
		frame.message.downcast_ref::<SelectTimer>().is_some(),
		"cancelled timer still fired"
	);

	runtime.tear_down();
}
