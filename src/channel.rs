//! The synchronous face of the runtime: a mailbox you can `await`.
//!
//! Routines and test code own a `Channel`; machines on shared
//! dispatcher groups never do, which is what makes `select` safe:
//! it only ever blocks a task that owns its thread of control.

use std::any::TypeId;
use std::collections::VecDeque;
use std::ops::Deref;
use std::ops::DerefMut;
use std::sync::Arc;

use crate::error::SelectError;
use crate::group::MAXIMUM_REPLAYS;
use crate::log::LogTag;
use crate::mailbox::MailboxReceiver;
use crate::message::Frame;
use crate::message::Message;
use crate::point::Point;
use crate::timer::SelectTimer;

pub struct Channel {
	pub point: Point,
	receiver: MailboxReceiver,
	pending: VecDeque<Frame>,
	replaying: VecDeque<Frame>,
}

impl Channel {
	pub(crate) fn new(point: Point, receiver: MailboxReceiver) -> Self {
		Self {
			point,
			receiver,
			pending: VecDeque::new(),
			replaying: VecDeque::new(),
		}
	}

	/// The next frame, whatever it is. Saved frames do not replay
	/// through here; use `select` for that.
	pub async fn input(&mut self) -> Result<Frame, SelectError> {
		let frame = self.receiver.get().await.ok_or(SelectError::Closed)?;
		self.arrived(&frame);
		Ok(frame)
	}

	fn arrived(&mut self, frame: &Frame) {
		if let Some(runtime) = self
			.point
			.registry()
			.find_message(frame.message.as_ref())
		{
			if runtime.flags.log_on_receive {
				self.point.log(LogTag::Received, runtime.name.clone());
			}
		}
		self.point
			.arriving(frame.to.clone(), frame.return_address.clone());
	}

	/// Begin a selective receive.
	pub fn select(&mut self) -> Select<'_> {
		Select {
			channel: self,
			accepted: Vec::new(),
			saving: Vec::new(),
			seconds: None,
		}
	}
}

impl Deref for Channel {
	type Target = Point;

	fn deref(&self) -> &Self::Target {
		&self.point
	}
}

impl DerefMut for Channel {
	fn deref_mut(&mut self) -> &mut Self::Target {
		&mut self.point
	}
}

/// Builder for a selective receive: which types to take, which to
/// defer, and an optional timeout delivered as a [`SelectTimer`].
pub struct Select<'c> {
	channel: &'c mut Channel,
	accepted: Vec<TypeId>,
	saving: Vec<TypeId>,
	seconds: Option<f64>,
}

impl<'c> Select<'c> {
	pub fn of<T: Message>(mut self) -> Self {
		self.accepted.push(TypeId::of::<T>());
		self
	}

	pub fn saving<T: Message>(mut self) -> Self {
		self.saving.push(TypeId::of::<T>());
		self
	}

	pub fn seconds(mut self, seconds: f64) -> Self {
		self.seconds = Some(seconds);
		self
	}

	fn matches(list: &[TypeId], message: &dyn Message) -> bool {
		list.contains(&message.as_any().type_id())
	}

	/// Wait for a frame of an accepted type. Deferred frames queue
	/// for the next select; anything else is dropped. On timeout the
	/// `SelectTimer` itself is returned as an ordinary match.
	pub async fn frame(self) -> Result<Frame, SelectError> {
		let Select {
			channel,
			accepted,
			saving,
			seconds,
		} = self;

		let timer_type = TypeId::of::<SelectTimer>();
		let timed = seconds.is_some();
		if let Some(seconds) = seconds {
			channel.point.start::<SelectTimer>(seconds, false);
		}

		// Harvest previously saved frames that this select accepts.
		let mut keep = VecDeque::new();
		while let Some(mut frame) = channel.pending.pop_front() {
			if Self::matches(&accepted, frame.message.as_ref()) {
				frame.replays += 1;
				if frame.replays > MAXIMUM_REPLAYS {
					tracing::trace!("discarded a frame after too many replays");
					continue;
				}
				channel.replaying.push_back(frame);
			} else {
				keep.push_back(frame);
			}
		}
		channel.pending = keep;

		loop {
			if let Some(frame) = channel.replaying.pop_front() {
				if timed {
					channel.point.cancel::<SelectTimer>();
				}
				channel.arrived(&frame);
				return Ok(frame);
			}

			let frame = channel.receiver.get().await.ok_or(SelectError::Closed)?;
			let message = frame.message.as_ref();
			if Self::matches(&accepted, message) {
				if timed {
					channel.point.cancel::<SelectTimer>();
				}
				channel.arrived(&frame);
				return Ok(frame);
			}
			if message.as_any().type_id() == timer_type {
				if timed {
					channel.arrived(&frame);
					return Ok(frame);
				}
				// A cancelled timer that fired anyway; late and unwanted.
				continue;
			}
			if Self::matches(&saving, message) {
				channel.pending.push_back(frame);
				continue;
			}
			channel.point.dropped(message);
		}
	}

	/// Like [`Select::frame`] but unwraps the message.
	pub async fn go(self) -> Result<Arc<dyn Message>, SelectError> {
		Ok(self.frame().await?.message)
	}
}
