//! The Point: everything an object can do to the world around it.
//!
//! Handlers and routines receive a `Point` (directly, or inside a
//! [`Channel`](crate::channel::Channel)). It knows the object's own
//! address, its parent, and the `to`/`return` of the message being
//! handled, and it fronts the runtime for sends, child creation,
//! timers, job tracking and logging.

use std::collections::HashMap;
use std::sync::Arc;

use crate::address::Address;
use crate::dispatch::Stateless;
use crate::dispatch::StateMachine;
use crate::log::LogTag;
use crate::log::PointLog;
use crate::message::Message;
use crate::message::Returned;
use crate::message::Stop;
use crate::registry::MessageRegistry;
use crate::runtime::Runtime;
use crate::value::Value;

/// Callback invoked when a child's `Returned` arrives; see
/// [`Point::on_return`].
pub type ReturnCallback = Box<dyn FnOnce(&mut Point, Arc<dyn Message>) + Send>;

/// Opaque per-child tag in the job table.
pub enum JobTag {
	Opaque(Value),
	Callback(ReturnCallback),
}

pub struct Point {
	runtime: Arc<Runtime>,
	address: Address,
	parent: Address,
	name: String,
	to: Address,
	return_address: Address,
	jobs: HashMap<Address, JobTag>,
	aborted_value: Option<Arc<dyn Message>>,
}

impl Point {
	pub(crate) fn new(
		runtime: Arc<Runtime>,
		address: Address,
		parent: Address,
		name: String,
	) -> Self {
		Self {
			runtime,
			address,
			parent,
			name,
			to: Address::null(),
			return_address: Address::null(),
			jobs: HashMap::new(),
			aborted_value: None,
		}
	}

	pub fn address(&self) -> &Address {
		&self.address
	}

	pub fn parent(&self) -> &Address {
		&self.parent
	}

	pub fn object_name(&self) -> &str {
		&self.name
	}

	pub fn runtime(&self) -> &Arc<Runtime> {
		&self.runtime
	}

	pub fn registry(&self) -> Arc<MessageRegistry> {
		self.runtime.registry().clone()
	}

	/// Set by the dispatcher before each handler call.
	pub(crate) fn arriving(&mut self, to: Address, return_address: Address) {
		self.to = to;
		self.return_address = return_address;
	}

	/// The address the current message was sent to (usually our own,
	/// but a proxy hop sees the longer path).
	pub fn to_address(&self) -> &Address {
		&self.to
	}

	/// The reply address of the current message.
	pub fn return_address(&self) -> &Address {
		&self.return_address
	}

	/// Send a message. Local addresses go straight to the owning
	/// mailbox; longer addresses land on the proxy named by their
	/// trailing hop, which serializes them onto its connection.
	pub fn send<M: Message>(&self, message: M, to: &Address) {
		self.send_dyn(Arc::new(message), to);
	}

	pub fn send_dyn(&self, message: Arc<dyn Message>, to: &Address) {
		self.post(message, to.clone(), self.address.clone());
	}

	/// `send` to the current return address.
	pub fn reply<M: Message>(&self, message: M) {
		self.reply_dyn(Arc::new(message));
	}

	pub fn reply_dyn(&self, message: Arc<dyn Message>) {
		self.post(message, self.return_address.clone(), self.address.clone());
	}

	/// Send with an arbitrary return address; the third leg of a
	/// relay drops out this way.
	pub fn forward<M: Message>(&self, message: M, to: &Address, return_address: &Address) {
		self.forward_dyn(Arc::new(message), to, return_address);
	}

	pub fn forward_dyn(
		&self,
		message: Arc<dyn Message>,
		to: &Address,
		return_address: &Address,
	) {
		self.post(message, to.clone(), return_address.clone());
	}

	fn post(&self, message: Arc<dyn Message>, to: Address, return_address: Address) {
		let registry = self.runtime.registry();
		let mut outgoing = message;
		if let Some(runtime) = registry.find_message(outgoing.as_ref()) {
			if runtime.flags.copy_before_send {
				outgoing = registry.deep_copy(&outgoing);
			}
			if runtime.flags.log_on_send {
				self.log(LogTag::Sent, format!("{} to {}", runtime.name, to));
			}
		}
		self.runtime.post(outgoing, to, return_address);
	}

	/// Create a child machine on its bound dispatcher group.
	pub fn create<M: Stateless>(&mut self, machine: M) -> Address {
		self.runtime
			.create_stateless(machine, self.address.clone())
	}

	pub fn create_machine<M: StateMachine>(&mut self, machine: M) -> Address {
		self.runtime.create_machine(machine, self.address.clone())
	}

	/// Create a child routine with its own task and channel.
	pub fn create_routine<F, Fut>(&mut self, name: &str, body: F) -> Address
	where
		F: FnOnce(crate::channel::Channel) -> Fut + Send + 'static,
		Fut: std::future::Future<Output = anyhow::Result<Arc<dyn Message>>> + Send + 'static,
	{
		self.runtime
			.create_routine(name, body, self.address.clone())
	}

	/// Ask the timer service for a `T` in `seconds` from now. A
	/// second start of the same timer class resets the countdown.
	pub fn start<T: crate::message::Portable>(&self, seconds: f64, repeating: bool) {
		self.runtime
			.start_timer(self.address.clone(), T::NAME, seconds, repeating);
	}

	/// Best-effort cancel; a timer already in flight may still land.
	pub fn cancel<T: crate::message::Portable>(&self) {
		self.runtime.cancel_timer(&self.address, T::NAME);
	}

	/// Track a child under an opaque tag.
	pub fn assign(&mut self, child: Address, tag: Value) {
		self.jobs.insert(child, JobTag::Opaque(tag));
	}

	/// Arrange `callback` to run when this child's `Returned` comes
	/// back through [`Point::on_return`].
	pub fn on_return(
		&mut self,
		child: Address,
		callback: impl FnOnce(&mut Point, Arc<dyn Message>) + Send + 'static,
	) {
		self.jobs.insert(child, JobTag::Callback(Box::new(callback)));
	}

	/// Remove and return the tag for a finished child.
	pub fn debrief(&mut self, child: &Address) -> Option<JobTag> {
		self.jobs.remove(child)
	}

	/// Run the stored callback for the child a `Returned` came from.
	/// Returns false when the child had no callback assigned.
	pub fn dispatch_return(&mut self, returned: &Returned) -> bool {
		let child = self.return_address.clone();
		match self.jobs.remove(&child) {
			Some(JobTag::Callback(callback)) => {
				callback(self, returned.value.clone());
				true
			}
			Some(tag) => {
				self.jobs.insert(child, tag);
				false
			}
			None => false,
		}
	}

	/// Any children still outstanding?
	pub fn working(&self) -> bool {
		!self.jobs.is_empty()
	}

	/// Stop every assigned child and record the aborted value used by
	/// the eventual completion.
	pub fn abort(&mut self) {
		let children: Vec<Address> = self.jobs.keys().cloned().collect();
		for child in children {
			self.send(Stop, &child);
		}
		self.aborted_value = Some(Arc::new(crate::message::Aborted::new()));
	}

	pub fn aborted(&self) -> bool {
		self.aborted_value.is_some()
	}

	/// The completion value override recorded by `abort`, if any.
	pub(crate) fn take_aborted_value(&mut self) -> Option<Arc<dyn Message>> {
		self.aborted_value.take()
	}

	// Logging family. Records land on the runtime log task.

	pub fn log(&self, tag: LogTag, text: impl Into<String>) {
		self.runtime.post_log(PointLog::new(
			tag,
			self.address.trailing().unwrap_or(0),
			self.name.clone(),
			text.into(),
		));
	}

	pub fn console(&self, text: impl Into<String>) {
		self.log(LogTag::Console, text);
	}

	pub fn trace(&self, text: impl Into<String>) {
		self.log(LogTag::Trace, text);
	}

	pub fn debug(&self, text: impl Into<String>) {
		self.log(LogTag::Debug, text);
	}

	pub fn sample(&self, text: impl Into<String>) {
		self.log(LogTag::Sample, text);
	}

	pub fn warning(&self, text: impl Into<String>) {
		self.log(LogTag::Warning, text);
	}

	pub fn fault(&self, text: impl Into<String>) {
		self.log(LogTag::Fault, text);
	}

	pub(crate) fn dropped(&self, message: &dyn Message) {
		self.trace(format!("dropped {message:?}"));
	}
}
