//! The process runtime: the one place objects, groups and the
//! well-known services live. Everything an object can reach, it
//! reaches through the `Arc<Runtime>` its Point carries; there are no
//! process globals.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::AtomicI64;
use std::sync::atomic::Ordering;

use arc_swap::ArcSwapOption;
use futures::FutureExt;
use parking_lot::Mutex;

use crate::address::Address;
use crate::address::Hop;
use crate::dispatch::AsMachine;
use crate::dispatch::AsStateless;
use crate::dispatch::Dispatching;
use crate::dispatch::StateMachine;
use crate::dispatch::Stateless;
use crate::group;
use crate::group::GroupHandle;
use crate::log::LogTag;
use crate::log::PointLog;
use crate::mailbox::MailboxSender;
use crate::message::Frame;
use crate::message::Message;
use crate::point::Point;
use crate::registry::MessageRegistry;
use crate::teardown::TeardownToken;

/// The default shared dispatcher; machines that state no group land
/// here.
pub const OBJECT_DISPATCH: &str = "object-dispatch";

/// What the object map holds per live address.
#[derive(Clone)]
pub struct ObjectRecord {
	pub address: Address,
	/// Where frames for this object land. Group members share their
	/// group's queue; threaded objects own theirs.
	pub queue: MailboxSender,
	pub parent: Address,
	pub name: String,
	pub group: Option<String>,
}

/// Tokens for the runtime services, torn down leaves-first.
pub(crate) struct ServiceTokens {
	pub root: TeardownToken,
	pub timer: TeardownToken,
	pub directory: TeardownToken,
	pub transport: TeardownToken,
	pub groups: TeardownToken,
	pub log: TeardownToken,
}

pub struct Runtime {
	registry: Arc<MessageRegistry>,
	objects: Mutex<HashMap<Hop, ObjectRecord>>,
	next_id: AtomicI64,
	groups: Mutex<HashMap<String, GroupHandle>>,
	pub(crate) tokens: ServiceTokens,
	log_address: ArcSwapOption<Address>,
	timer_address: ArcSwapOption<Address>,
	directory_address: ArcSwapOption<Address>,
	connector_address: ArcSwapOption<Address>,
}

impl Runtime {
	/// Boot the runtime inside an active tokio context: stock types,
	/// log task, timer service, the default dispatcher group, the
	/// socket engine and the directory, in that order.
	pub fn start() -> Arc<Runtime> {
		let root = TeardownToken::new();
		let runtime = Arc::new(Runtime {
			registry: Arc::new(MessageRegistry::new()),
			objects: Mutex::new(HashMap::new()),
			next_id: AtomicI64::new(1),
			groups: Mutex::new(HashMap::new()),
			tokens: ServiceTokens {
				timer: root.child(),
				directory: root.child(),
				transport: root.child(),
				groups: root.child(),
				log: root.child(),
				root,
			},
			log_address: ArcSwapOption::empty(),
			timer_address: ArcSwapOption::empty(),
			directory_address: ArcSwapOption::empty(),
			connector_address: ArcSwapOption::empty(),
		});

		crate::message::bind_stock(&runtime.registry)
			.expect("stock types always bind");
		crate::log::bind(&runtime.registry).expect("log types always bind");
		crate::timer::bind(&runtime.registry).expect("timer types always bind");
		crate::transport::bind(&runtime.registry).expect("transport types always bind");
		crate::directory::bind(&runtime.registry).expect("directory types always bind");

		let log = crate::log::boot(&runtime);
		runtime.log_address.store(Some(Arc::new(log)));

		let timer = crate::timer::boot(&runtime);
		runtime.timer_address.store(Some(Arc::new(timer)));

		runtime.ensure_group(OBJECT_DISPATCH);

		let connector = crate::transport::boot(&runtime);
		runtime.connector_address.store(Some(Arc::new(connector)));

		let directory = crate::directory::boot(&runtime);
		runtime.directory_address.store(Some(Arc::new(directory)));

		runtime
	}

	/// Leaves-first teardown: timer, directory, sockets, dispatcher
	/// groups, then the log, then the object map itself.
	pub fn tear_down(&self) {
		self.tokens.timer.teardown("tear-down");
		self.tokens.directory.teardown("tear-down");
		self.tokens.transport.teardown("tear-down");
		self.tokens.groups.teardown("tear-down");
		self.tokens.log.teardown("tear-down");
		self.tokens.root.teardown("tear-down");
		self.objects.lock().clear();
		self.groups.lock().clear();
	}

	pub fn registry(&self) -> &Arc<MessageRegistry> {
		&self.registry
	}

	pub fn log_address(&self) -> Option<Address> {
		self.log_address.load_full().map(|a| (*a).clone())
	}

	pub fn timer_address(&self) -> Option<Address> {
		self.timer_address.load_full().map(|a| (*a).clone())
	}

	pub fn directory_address(&self) -> Option<Address> {
		self.directory_address.load_full().map(|a| (*a).clone())
	}

	pub fn connector_address(&self) -> Option<Address> {
		self.connector_address.load_full().map(|a| (*a).clone())
	}

	pub(crate) fn set_directory_address(&self, address: Address) {
		self.directory_address.store(Some(Arc::new(address)));
	}

	/// Addresses are never reused within a process lifetime.
	pub fn allocate(&self) -> Hop {
		self.next_id.fetch_add(1, Ordering::Relaxed)
	}

	pub(crate) fn insert_object(&self, record: ObjectRecord) {
		self.objects
			.lock()
			.insert(record.address.trailing().unwrap_or(0), record);
	}

	/// Remove an object from the map. Later sends to its address are
	/// dropped silently; the address itself is never recycled.
	pub fn destroy_object(&self, address: &Address) {
		let Some(hop) = address.trailing() else {
			return;
		};
		let removed = self.objects.lock().remove(&hop);
		if let Some(record) = removed {
			if let Some(group) = &record.group {
				if let Some(handle) = self.groups.lock().get(group) {
					handle.detach(hop);
				}
			}
			self.post_log(PointLog::new(
				LogTag::Destroyed,
				hop,
				record.name,
				String::new(),
			));
		}
	}

	pub fn find_object(&self, address: &Address) -> Option<ObjectRecord> {
		let hop = address.trailing()?;
		self.objects.lock().get(&hop).cloned()
	}

	/// Scoped access to a live record; the map lock is held for the
	/// duration of `f` and released on every path.
	pub fn with_object<R>(&self, address: &Address, f: impl FnOnce(&ObjectRecord) -> R) -> Option<R> {
		let hop = address.trailing()?;
		let objects = self.objects.lock();
		objects.get(&hop).map(f)
	}

	/// Route a message. The trailing hop names the mailbox it lands
	/// in: the object itself, its dispatcher group's queue, or a
	/// connection proxy for remote paths. A missing destination
	/// drops the frame silently.
	pub fn post(&self, message: Arc<dyn Message>, to: Address, return_address: Address) {
		if to.is_null() {
			tracing::trace!("dropped frame to the null address");
			return;
		}
		if to.is_broadcast() {
			// Broadcast-upward resolves at the transport; locally it
			// has nowhere to land.
			tracing::trace!("dropped frame to the broadcast address");
			return;
		}
		let queue = {
			let Some(hop) = to.trailing() else { return };
			let objects = self.objects.lock();
			match objects.get(&hop) {
				Some(record) => record.queue.clone(),
				None => {
					tracing::trace!(hop, "dropped frame to a destroyed address");
					return;
				}
			}
		};
		queue.put(Frame::new(message, to, return_address));
	}

	pub(crate) fn ensure_group(self: &Arc<Self>, name: &str) -> GroupHandle {
		if let Some(handle) = self.groups.lock().get(name) {
			return handle.clone();
		}
		let handle = group::start(self, name);
		self.groups
			.lock()
			.entry(name.to_string())
			.or_insert(handle)
			.clone()
	}

	fn create_on_group(
		self: &Arc<Self>,
		object: Box<dyn Dispatching>,
		parent: Address,
		name: String,
		group: &str,
	) -> Address {
		let handle = self.ensure_group(group);
		let hop = self.allocate();
		let address = Address::local(hop);
		self.insert_object(ObjectRecord {
			address: address.clone(),
			queue: handle.queue.clone(),
			parent: parent.clone(),
			name: name.clone(),
			group: Some(group.to_string()),
		});
		let point = Point::new(self.clone(), address.clone(), parent, name.clone());
		group::attach(&handle, hop, object, point);
		self.post_log(PointLog::new(LogTag::Created, hop, name, String::new()));
		address
	}

	pub fn create_stateless<M: Stateless>(self: &Arc<Self>, machine: M, parent: Address) -> Address {
		let group = M::group().unwrap_or(OBJECT_DISPATCH);
		self.create_on_group(
			Box::new(AsStateless { machine }),
			parent,
			short_type_name::<M>(),
			group,
		)
	}

	pub fn create_machine<M: StateMachine>(self: &Arc<Self>, machine: M, parent: Address) -> Address {
		let group = M::group().unwrap_or(OBJECT_DISPATCH);
		self.create_on_group(
			Box::new(AsMachine { machine }),
			parent,
			short_type_name::<M>(),
			group,
		)
	}

	/// Spawn a routine: a function body with its own task and
	/// channel. The return value becomes a `Returned` to the parent.
	pub fn create_routine<F, Fut>(self: &Arc<Self>, name: &str, body: F, parent: Address) -> Address
	where
		F: FnOnce(crate::channel::Channel) -> Fut + Send + 'static,
		Fut: std::future::Future<Output = anyhow::Result<Arc<dyn Message>>> + Send + 'static,
	{
		let (channel, address) = self.open_channel(name, parent.clone());
		let runtime = self.clone();
		let hop = address.trailing().unwrap_or(0);
		let task_address = address.clone();
		tokio::spawn(async move {
			runtime.post_log(PointLog::new(
				LogTag::Started,
				hop,
				channel.point.object_name().to_string(),
				String::new(),
			));
			let name = channel.point.object_name().to_string();
			let parent = channel.point.parent().clone();
			let outcome = std::panic::AssertUnwindSafe(body(channel))
				.catch_unwind()
				.await;
			let value: Arc<dyn Message> = match outcome {
				Ok(Ok(value)) => value,
				Ok(Err(error)) => Arc::new(crate::message::Faulted::explained(
					"routine failed",
					error.to_string(),
				)),
				Err(panic) => Arc::new(crate::message::Faulted::explained(
					"routine panicked",
					crate::dispatch::panic_text(panic.as_ref()),
				)),
			};
			runtime.post_log(PointLog::new(LogTag::Ended, hop, name, String::new()));
			runtime.destroy_object(&task_address);
			runtime.post(
				Arc::new(crate::message::Returned::new(value)),
				parent,
				task_address,
			);
		});
		address
	}

	/// Open a channel object: an address and mailbox for synchronous
	/// use from tests or task bodies.
	pub fn open_channel(self: &Arc<Self>, name: &str, parent: Address) -> (crate::channel::Channel, Address) {
		let hop = self.allocate();
		let address = Address::local(hop);
		let (tx, rx) = crate::mailbox::mailbox();
		self.insert_object(ObjectRecord {
			address: address.clone(),
			queue: tx,
			parent: parent.clone(),
			name: name.to_string(),
			group: None,
		});
		let point = Point::new(self.clone(), address.clone(), parent, name.to_string());
		self.post_log(PointLog::new(
			LogTag::Created,
			hop,
			name.to_string(),
			String::new(),
		));
		(crate::channel::Channel::new(point, rx), address)
	}

	pub fn post_log(&self, record: PointLog) {
		if let Some(log) = self.log_address.load_full() {
			self.post(Arc::new(record), (*log).clone(), Address::null());
		}
	}

	pub(crate) fn start_timer(&self, requester: Address, timer: &str, seconds: f64, repeating: bool) {
		if let Some(address) = self.timer_address() {
			self.post(
				Arc::new(crate::timer::StartTimer {
					requester,
					timer: timer.to_string(),
					seconds,
					repeating,
				}),
				address,
				Address::null(),
			);
		}
	}

	pub(crate) fn cancel_timer(&self, requester: &Address, timer: &str) {
		if let Some(address) = self.timer_address() {
			self.post(
				Arc::new(crate::timer::CancelTimer {
					requester: requester.clone(),
					timer: timer.to_string(),
				}),
				address,
				Address::null(),
			);
		}
	}
}

pub(crate) fn short_type_name<T>() -> String {
	std::any::type_name::<T>()
		.rsplit("::")
		.next()
		.unwrap_or("object")
		.to_string()
}
