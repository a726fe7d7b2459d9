//! Dispatch tables, materialized at registration time.
//!
//! A machine declares its table once (a static built on first use);
//! the dispatcher resolves each delivered message through a
//! three-tier lookup: exact type, then the wire base-type walk, then
//! the `Unknown` fallback, and finally a logged drop.

use std::any::TypeId;
use std::collections::HashMap;
use std::collections::HashSet;
use std::hash::Hash;
use std::hash::Hasher;
use std::sync::Arc;

use crate::message::Message;
use crate::point::Point;
use crate::registry::MessageRegistry;

/// What a handler did with the object.
pub enum Disposition {
	/// Keep going; more messages expected.
	Working,
	/// The object is done; the value becomes a `Returned` to the
	/// parent and the object is destroyed.
	Complete(Arc<dyn Message>),
}

/// Handler outcome for state machines: the next state, or completion.
pub enum Next<S> {
	To(S),
	Complete(Arc<dyn Message>),
}

type Handler<M> = Box<dyn Fn(&mut M, &mut Point, &dyn Message) -> Disposition + Send + Sync>;

/// Message-type to handler, for machines with no state variable.
pub struct Dispatch<M> {
	handlers: HashMap<TypeId, Handler<M>>,
	unknown: Option<Handler<M>>,
}

impl<M: Send + 'static> Dispatch<M> {
	pub fn new() -> Self {
		Self {
			handlers: HashMap::new(),
			unknown: None,
		}
	}

	pub fn on<T: Message>(
		mut self,
		handler: impl Fn(&mut M, &mut Point, &T) -> Disposition + Send + Sync + 'static,
	) -> Self {
		self.handlers.insert(
			TypeId::of::<T>(),
			Box::new(move |machine, point, message| match message.downcast_ref::<T>() {
				Some(typed) => handler(machine, point, typed),
				None => Disposition::Working,
			}),
		);
		self
	}

	/// Fallback for any message the table has no entry for.
	pub fn otherwise(
		mut self,
		handler: impl Fn(&mut M, &mut Point, &dyn Message) -> Disposition + Send + Sync + 'static,
	) -> Self {
		self.unknown = Some(Box::new(handler));
		self
	}
}

impl<M: Send + 'static> Default for Dispatch<M> {
	fn default() -> Self {
		Self::new()
	}
}

/// A machine with a single behaviour: messages route by type alone.
pub trait Stateless: Send + 'static {
	fn table() -> &'static Dispatch<Self>
	where
		Self: Sized;

	/// Grouping name: all instances share the dispatcher of this
	/// name. None lands on the default "object-dispatch" group.
	fn group() -> Option<&'static str> {
		None
	}
}

type MachineHandler<M> =
	Box<dyn Fn(&mut M, &mut Point, &dyn Message) -> Next<<M as StateMachine>::State> + Send + Sync>;

/// `(state, message-type)` to handler, plus the per-state saved set.
pub struct StateTable<M: StateMachine> {
	handlers: HashMap<(M::State, TypeId), MachineHandler<M>>,
	saving: HashMap<M::State, HashSet<TypeId>>,
	unknown: HashMap<M::State, MachineHandler<M>>,
}

impl<M: StateMachine> StateTable<M> {
	pub fn new() -> Self {
		Self {
			handlers: HashMap::new(),
			saving: HashMap::new(),
			unknown: HashMap::new(),
		}
	}

	pub fn on<T: Message>(
		mut self,
		state: M::State,
		handler: impl Fn(&mut M, &mut Point, &T) -> Next<M::State> + Send + Sync + 'static,
	) -> Self {
		self.handlers.insert(
			(state, TypeId::of::<T>()),
			Box::new(move |machine, point, message| match message.downcast_ref::<T>() {
				Some(typed) => handler(machine, point, typed),
				None => Next::To(machine.state()),
			}),
		);
		self
	}

	/// Defer this message type while in `state`; it replays after the
	/// next transition.
	pub fn saving<T: Message>(mut self, state: M::State) -> Self {
		self.saving.entry(state).or_default().insert(TypeId::of::<T>());
		self
	}

	pub fn otherwise(
		mut self,
		state: M::State,
		handler: impl Fn(&mut M, &mut Point, &dyn Message) -> Next<M::State> + Send + Sync + 'static,
	) -> Self {
		self.unknown.insert(state, Box::new(handler));
		self
	}
}

impl<M: StateMachine> Default for StateTable<M> {
	fn default() -> Self {
		Self::new()
	}
}

/// A machine whose behaviour is keyed by an explicit state variable.
/// The dispatcher assigns the state a handler returns.
pub trait StateMachine: Send + 'static {
	type State: Copy + Eq + Hash + Send + Sync + std::fmt::Debug + 'static;

	fn state(&self) -> Self::State;
	fn set_state(&mut self, state: Self::State);

	fn table() -> &'static StateTable<Self>
	where
		Self: Sized;

	fn group() -> Option<&'static str> {
		None
	}
}

/// The dispatcher-facing face of any machine shape. Implemented by
/// the wrappers below; boxed into dispatcher groups.
pub trait Dispatching: Send + 'static {
	fn dispatch(&mut self, point: &mut Point, message: &Arc<dyn Message>) -> Disposition;

	/// Whether the current state defers this message for replay.
	fn saves(&self, message: &dyn Message) -> bool {
		let _ = message;
		false
	}

	/// Opaque token that changes when the state variable does; the
	/// dispatcher replays saved frames on change.
	fn phase(&self) -> u64 {
		0
	}
}

/// Best-effort text of a panic payload.
pub(crate) fn panic_text(panic: &(dyn std::any::Any + Send)) -> String {
	if let Some(text) = panic.downcast_ref::<&str>() {
		(*text).to_string()
	} else if let Some(text) = panic.downcast_ref::<String>() {
		text.clone()
	} else {
		"panic".to_string()
	}
}

/// Exact hit, then walk the wire base chain, then the fallback.
fn resolve<'t, M>(
	handlers: &'t HashMap<TypeId, Handler<M>>,
	reg: &MessageRegistry,
	message: &Arc<dyn Message>,
) -> Option<(&'t Handler<M>, Option<Arc<dyn Message>>)> {
	let type_id = message.as_any().type_id();
	if let Some(handler) = handlers.get(&type_id) {
		return Some((handler, None));
	}

	// Base walk: hand the handler the embedded parent value.
	let mut runtime = reg.find_type_id(type_id)?;
	let mut view: Arc<dyn Message> = message.clone();
	loop {
		let base_name = runtime.base.clone()?;
		let base_runtime = reg.find_name(&base_name)?;
		let base_value = (runtime.base_view)(view.as_ref())?;
		// Re-materialize the borrowed base so it can outlive the walk.
		let owned = (base_runtime.to_value)(base_value, reg)
			.and_then(|v| (base_runtime.from_value)(&v, reg))
			.ok()?;
		if let Some(handler) = handlers.get(&base_runtime.type_id) {
			return Some((handler, Some(owned)));
		}
		runtime = base_runtime;
		view = owned;
	}
}

pub(crate) struct AsStateless<M: Stateless> {
	pub machine: M,
}

impl<M: Stateless> Dispatching for AsStateless<M> {
	fn dispatch(&mut self, point: &mut Point, message: &Arc<dyn Message>) -> Disposition {
		let table = M::table();
		let reg = point.registry();
		match resolve(&table.handlers, &reg, message) {
			Some((handler, None)) => handler(&mut self.machine, point, message.as_ref()),
			Some((handler, Some(base))) => handler(&mut self.machine, point, base.as_ref()),
			None => match &table.unknown {
				Some(handler) => handler(&mut self.machine, point, message.as_ref()),
				None => {
					point.dropped(message.as_ref());
					Disposition::Working
				}
			},
		}
	}
}

pub(crate) struct AsMachine<M: StateMachine> {
	pub machine: M,
}

impl<M: StateMachine> AsMachine<M> {
	fn resolve_handler<'t>(
		table: &'t StateTable<M>,
		state: M::State,
		reg: &MessageRegistry,
		message: &Arc<dyn Message>,
	) -> Option<(&'t MachineHandler<M>, Option<Arc<dyn Message>>)> {
		let type_id = message.as_any().type_id();
		if let Some(handler) = table.handlers.get(&(state, type_id)) {
			return Some((handler, None));
		}
		let mut runtime = reg.find_type_id(type_id)?;
		let mut view: Arc<dyn Message> = message.clone();
		loop {
			let base_name = runtime.base.clone()?;
			let base_runtime = reg.find_name(&base_name)?;
			let base_value = (runtime.base_view)(view.as_ref())?;
			let owned = (base_runtime.to_value)(base_value, reg)
				.and_then(|v| (base_runtime.from_value)(&v, reg))
				.ok()?;
			if let Some(handler) = table.handlers.get(&(state, base_runtime.type_id)) {
				return Some((handler, Some(owned)));
			}
			runtime = base_runtime;
			view = owned;
		}
	}
}

impl<M: StateMachine> Dispatching for AsMachine<M> {
	fn dispatch(&mut self, point: &mut Point, message: &Arc<dyn Message>) -> Disposition {
		let table = M::table();
		let state = self.machine.state();
		let reg = point.registry();

		let next = match Self::resolve_handler(table, state, &reg, message) {
			Some((handler, None)) => handler(&mut self.machine, point, message.as_ref()),
			Some((handler, Some(base))) => handler(&mut self.machine, point, base.as_ref()),
			None => match table.unknown.get(&state) {
				Some(handler) => handler(&mut self.machine, point, message.as_ref()),
				None => {
					point.dropped(message.as_ref());
					return Disposition::Working;
				}
			},
		};

		match next {
			Next::To(state) => {
				self.machine.set_state(state);
				Disposition::Working
			}
			Next::Complete(value) => Disposition::Complete(value),
		}
	}

	fn saves(&self, message: &dyn Message) -> bool {
		let table = M::table();
		table
			.saving
			.get(&self.machine.state())
			.map(|set| set.contains(&message.as_any().type_id()))
			.unwrap_or(false)
	}

	fn phase(&self) -> u64 {
		let mut hasher = std::collections::hash_map::DefaultHasher::new();
		self.machine.state().hash(&mut hasher);
		hasher.finish()
	}
}
