use tokio::sync::mpsc;

use crate::message::Frame;

/// The write side of a pump. Unbounded by default; the bounded
/// variant drops on overflow rather than blocking, because a put can
/// come from inside a synchronous handler that must not stall its
/// dispatcher.
#[derive(Clone, Debug)]
pub enum MailboxSender {
	Unbounded(mpsc::UnboundedSender<Frame>),
	Bounded(mpsc::Sender<Frame>),
}

impl MailboxSender {
	/// Enqueue a frame. Returns false when the frame was dropped
	/// (receiver gone or bounded queue full). Dropping is silent by
	/// contract; callers that care can count.
	pub fn put(&self, frame: Frame) -> bool {
		match self {
			MailboxSender::Unbounded(tx) => tx.send(frame).is_ok(),
			MailboxSender::Bounded(tx) => match tx.try_send(frame) {
				Ok(()) => true,
				Err(mpsc::error::TrySendError::Full(_)) => {
					metrics::counter!("fabric_mailbox_dropped").increment(1);
					false
				}
				Err(mpsc::error::TrySendError::Closed(_)) => false,
			},
		}
	}

	pub fn is_closed(&self) -> bool {
		match self {
			MailboxSender::Unbounded(tx) => tx.is_closed(),
			MailboxSender::Bounded(tx) => tx.is_closed(),
		}
	}
}

/// The read side of a pump, owned by exactly one dispatcher.
#[derive(Debug)]
pub enum MailboxReceiver {
	Unbounded(mpsc::UnboundedReceiver<Frame>),
	Bounded(mpsc::Receiver<Frame>),
}

impl MailboxReceiver {
	pub async fn get(&mut self) -> Option<Frame> {
		match self {
			MailboxReceiver::Unbounded(rx) => rx.recv().await,
			MailboxReceiver::Bounded(rx) => rx.recv().await,
		}
	}

	pub fn get_nowait(&mut self) -> Option<Frame> {
		match self {
			MailboxReceiver::Unbounded(rx) => rx.try_recv().ok(),
			MailboxReceiver::Bounded(rx) => rx.try_recv().ok(),
		}
	}

	pub fn close(&mut self) {
		match self {
			MailboxReceiver::Unbounded(rx) => rx.close(),
			MailboxReceiver::Bounded(rx) => rx.close(),
		}
	}
}

pub fn mailbox() -> (MailboxSender, MailboxReceiver) {
	let (tx, rx) = mpsc::unbounded_channel();
	(
		MailboxSender::Unbounded(tx),
		MailboxReceiver::Unbounded(rx),
	)
}

pub fn bounded_mailbox(capacity: usize) -> (MailboxSender, MailboxReceiver) {
	let (tx, rx) = mpsc::channel(capacity);
	(MailboxSender::Bounded(tx), MailboxReceiver::Bounded(rx))
}

#[cfg(test)]
mod tests {
	use std::sync::Arc;

	use super::*;
	use crate::address::Address;
	use crate::message::Ack;

	fn frame() -> Frame {
		Frame::new(Arc::new(Ack), Address::local(1), Address::null())
	}

	#[tokio::test]
	async fn bounded_pump_drops_on_overflow() {
		let (tx, mut rx) = bounded_mailbox(2);
		assert!(tx.put(frame()));
		assert!(tx.put(frame()));
		assert!(!tx.put(frame()));

		assert!(rx.get_nowait().is_some());
		assert!(rx.get_nowait().is_some());
		assert!(rx.get_nowait().is_none());
	}

	#[tokio::test]
	async fn closed_pump_refuses_frames() {
		let (tx, mut rx) = mailbox();
		rx.close();
		assert!(!tx.put(frame()));
		assert!(tx.is_closed());
	}
}
