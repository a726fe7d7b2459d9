//! The countdown service: one task, many timers. Objects ask for a
//! timer class by name; on expiry the service posts a fresh default
//! instance of that class to the requester. Starting a timer that is
//! already running resets it; cancellation is best-effort because a
//! fired timer may already be in the requester's mailbox.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use crate::address::Address;
use crate::error::RegistrationError;
use crate::message::Message;
use crate::message::Portable;
use crate::registry::MessageFlags;
use crate::registry::MessageRegistry;
use crate::registry::Schema;
use crate::runtime::Runtime;
use crate::value::Value;

/// The timeout timer `select` arms for itself.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SelectTimer;

impl Message for SelectTimer {}

impl Portable for SelectTimer {
	const NAME: &'static str = "fabric.SelectTimer";

	fn schema() -> Schema {
		Schema::new()
	}

	fn to_value(&self, _reg: &MessageRegistry) -> Result<Value, crate::error::CodecError> {
		Ok(Value::Record(BTreeMap::new()))
	}

	fn from_value(
		_value: &Value,
		_reg: &MessageRegistry,
	) -> Result<Self, crate::error::CodecError> {
		Ok(SelectTimer)
	}

	fn default_message() -> Self {
		SelectTimer
	}
}

/// Service command; local-only, never crosses a transport.
#[derive(Debug)]
pub struct StartTimer {
	pub requester: Address,
	pub timer: String,
	pub seconds: f64,
	pub repeating: bool,
}

impl Message for StartTimer {}

#[derive(Debug)]
pub struct CancelTimer {
	pub requester: Address,
	pub timer: String,
}

impl Message for CancelTimer {}

pub(crate) fn bind(reg: &MessageRegistry) -> Result<(), RegistrationError> {
	reg.bind::<SelectTimer>(MessageFlags {
		log_on_send: false,
		log_on_receive: false,
		..Default::default()
	})?;
	Ok(())
}

struct Entry {
	deadline: Instant,
	period: Duration,
	repeating: bool,
}

pub(crate) fn boot(runtime: &Arc<Runtime>) -> Address {
	let hop = runtime.allocate();
	let address = Address::local(hop);
	let (tx, mut rx) = crate::mailbox::mailbox();
	runtime.insert_object(crate::runtime::ObjectRecord {
		address: address.clone(),
		queue: tx,
		parent: Address::null(),
		name: "timer".to_string(),
		group: None,
	});

	let token = runtime.tokens.timer.child();
	let runtime = runtime.clone();
	let service_address = address.clone();

	tokio::spawn(async move {
		let mut timers: HashMap<(Address, String), Entry> = HashMap::new();
		loop {
			let next = timers.values().map(|e| e.deadline).min();
			tokio::select! {
				_ = token.ended() => break,
				frame = rx.get() => {
					let Some(frame) = frame else { break };
					let message = frame.message.as_ref();
					if let Some(start) = message.downcast_ref::<StartTimer>() {
						let period = Duration::from_secs_f64(start.seconds.max(0.0));
						timers.insert(
							(start.requester.clone(), start.timer.clone()),
							Entry {
								deadline: Instant::now() + period,
								period,
								repeating: start.repeating,
							},
						);
					} else if let Some(cancel) = message.downcast_ref::<CancelTimer>() {
						timers.remove(&(cancel.requester.clone(), cancel.timer.clone()));
					}
				}
				_ = sleep_to(next) => {
					fire_due(&runtime, &service_address, &mut timers);
				}
			}
		}
		runtime.destroy_object(&service_address);
	});

	address
}

async fn sleep_to(deadline: Option<Instant>) {
	match deadline {
		Some(deadline) => tokio::time::sleep_until(deadline).await,
		None => std::future::pending().await,
	}
}

fn fire_due(
	runtime: &Arc<Runtime>,
	service: &Address,
	timers: &mut HashMap<(Address, String), Entry>,
) {
	let now = Instant::now();
	let due: Vec<(Address, String)> = timers
		.iter()
		.filter(|(_, entry)| entry.deadline <= now)
		.map(|(key, _)| key.clone())
		.collect();

	for key in due {
		let Some(entry) = timers.get_mut(&key) else {
			continue;
		};
		let repeating = entry.repeating;
		if repeating {
			entry.deadline = now + entry.period;
		} else {
			timers.remove(&key);
		}

		let (requester, timer) = &key;
		match runtime.registry().find_name(timer) {
			Some(message_runtime) => {
				let message = (message_runtime.default)();
				runtime.post(message, requester.clone(), service.clone());
			}
			None => {
				tracing::warn!(timer, "timer class is not registered; nothing to post");
			}
		}
	}
}
