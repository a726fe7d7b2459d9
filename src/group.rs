//! Shared dispatcher groups: one task multiplexing many machine
//! objects over a single queue, keyed by the trailing hop of each
//! frame's target address. Handlers run to completion on the group's
//! task; nothing here may block.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::Arc;

use tokio::sync::mpsc;

use crate::address::Hop;
use crate::dispatch::Dispatching;
use crate::dispatch::Disposition;
use crate::log::LogTag;
use crate::mailbox;
use crate::mailbox::MailboxSender;
use crate::message::Frame;
use crate::message::Returned;
use crate::point::Point;
use crate::runtime::Runtime;

/// Bounded replay of saved frames; a frame bounced more often than
/// this is discarded instead of live-locking the group.
pub const MAXIMUM_REPLAYS: u8 = 8;

pub(crate) enum Control {
	Attach {
		hop: Hop,
		object: Box<dyn Dispatching>,
		point: Point,
	},
	Detach {
		hop: Hop,
	},
}

#[derive(Clone)]
pub struct GroupHandle {
	pub name: String,
	pub queue: MailboxSender,
	control: mpsc::UnboundedSender<Control>,
}

impl GroupHandle {
	pub(crate) fn detach(&self, hop: Hop) {
		let _ = self.control.send(Control::Detach { hop });
	}
}

struct Slot {
	object: Box<dyn Dispatching>,
	point: Point,
	pending: VecDeque<Frame>,
	replaying: VecDeque<Frame>,
}

pub(crate) fn attach(handle: &GroupHandle, hop: Hop, object: Box<dyn Dispatching>, point: Point) {
	let _ = handle.control.send(Control::Attach { hop, object, point });
}

pub(crate) fn start(runtime: &Arc<Runtime>, name: &str) -> GroupHandle {
	let (queue_tx, mut queue_rx) = mailbox::mailbox();
	let (control_tx, mut control_rx) = mpsc::unbounded_channel();
	let token = runtime.tokens.groups.child();
	let runtime = runtime.clone();
	let group_name = name.to_string();

	tokio::spawn(async move {
		let mut slots: HashMap<Hop, Slot> = HashMap::new();
		loop {
			// Attachments drain ahead of frames, so an object's first
			// message can never beat its own attach.
			tokio::select! {
				biased;
				_ = token.ended() => break,
				control = control_rx.recv() => match control {
					Some(Control::Attach { hop, object, point }) => {
						slots.insert(hop, Slot {
							object,
							point,
							pending: VecDeque::new(),
							replaying: VecDeque::new(),
						});
					}
					Some(Control::Detach { hop }) => {
						slots.remove(&hop);
					}
					None => break,
				},
				frame = queue_rx.get() => match frame {
					Some(frame) => deliver(&runtime, &group_name, &mut slots, frame),
					None => break,
				},
			}
		}
		tracing::debug!(group = group_name, "dispatcher group ended");
	});

	GroupHandle {
		name: name.to_string(),
		queue: queue_tx,
		control: control_tx,
	}
}

fn deliver(runtime: &Arc<Runtime>, group: &str, slots: &mut HashMap<Hop, Slot>, frame: Frame) {
	let Some(hop) = frame.to.trailing() else {
		return;
	};
	let Some(slot) = slots.get_mut(&hop) else {
		tracing::trace!(group, hop, "frame for an object this group no longer runs");
		return;
	};

	if slot.object.saves(frame.message.as_ref()) {
		slot.pending.push_back(frame);
		return;
	}

	if run_one(runtime, slots, hop, frame) {
		// The object transitioned; saved frames get another pass.
		replay(runtime, slots, hop);
	}
}

/// Dispatch a single frame; true when the object survived and its
/// phase changed.
fn run_one(runtime: &Arc<Runtime>, slots: &mut HashMap<Hop, Slot>, hop: Hop, frame: Frame) -> bool {
	let Some(slot) = slots.get_mut(&hop) else {
		return false;
	};

	let registry = runtime.registry();
	if let Some(message_runtime) = registry.find_message(frame.message.as_ref()) {
		if message_runtime.flags.log_on_receive {
			slot.point
				.log(LogTag::Received, format!("{}", message_runtime.name));
		}
	}

	slot.point
		.arriving(frame.to.clone(), frame.return_address.clone());
	let before = slot.object.phase();
	// A panicking handler faults the object, never the group.
	let caught = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
		slot.object.dispatch(&mut slot.point, &frame.message)
	}));
	let disposition = match caught {
		Ok(disposition) => disposition,
		Err(panic) => {
			let text = crate::dispatch::panic_text(panic.as_ref());
			slot.point.fault(format!("handler panicked: {text}"));
			Disposition::Complete(Arc::new(crate::message::Faulted::explained(
				"handler panicked",
				text,
			)))
		}
	};

	match disposition {
		Disposition::Working => slot.object.phase() != before,
		Disposition::Complete(value) => {
			let value = slot.point.take_aborted_value().unwrap_or(value);
			let address = slot.point.address().clone();
			let parent = slot.point.parent().clone();
			// Removing the record also detaches the slot.
			runtime.destroy_object(&address);
			slots.remove(&hop);
			runtime.post(Arc::new(Returned::new(value)), parent, address);
			false
		}
	}
}

fn replay(runtime: &Arc<Runtime>, slots: &mut HashMap<Hop, Slot>, hop: Hop) {
	// Saved frames are harvested into the replay queue once per
	// transition; each harvest counts against the frame's replay
	// budget.
	let mut harvest = true;
	loop {
		let next = {
			let Some(slot) = slots.get_mut(&hop) else { return };
			if harvest {
				harvest = false;
				while let Some(mut frame) = slot.pending.pop_front() {
					frame.replays += 1;
					if frame.replays > MAXIMUM_REPLAYS {
						tracing::trace!(hop, "discarded a frame after too many replays");
						continue;
					}
					slot.replaying.push_back(frame);
				}
			}
			slot.replaying.pop_front()
		};

		let Some(frame) = next else { return };

		let still_saved = {
			let Some(slot) = slots.get_mut(&hop) else { return };
			if slot.object.saves(frame.message.as_ref()) {
				slot.pending.push_back(frame);
				true
			} else {
				false
			}
		};
		if still_saved {
			continue;
		}

		if run_one(runtime, slots, hop, frame) {
			// Another transition: saved frames earn another pass.
			harvest = true;
		}
	}
}
