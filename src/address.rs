use std::fmt;

use serde::Deserialize;
use serde::Serialize;

/// A single hop in a routing path. Allocated hops are always positive;
/// zero is the trombone marker and negatives are reserved sentinels.
pub type Hop = i64;

/// The trombone marker written in place of a matched return-proxy tail.
pub const TROMBONE: Hop = 0;

/// Sentinel hop of the broadcast-upward address.
pub const TO_EVERYONE: Hop = -1;

/// An object address: an ordered sequence of non-zero hops, read
/// right-to-left as a routing path. The trailing hop is the identity
/// within the current process; anything before it describes further
/// routing through proxies.
///
/// Two special values exist: the null address (never a valid
/// destination) and the broadcast-upward address.
#[derive(Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Address {
	hops: Vec<Hop>,
}

impl Address {
	pub fn null() -> Self {
		Self { hops: Vec::new() }
	}

	pub fn to_everyone() -> Self {
		Self {
			hops: vec![TO_EVERYONE],
		}
	}

	pub fn local(id: Hop) -> Self {
		debug_assert!(id != 0);
		Self { hops: vec![id] }
	}

	pub fn from_hops(hops: Vec<Hop>) -> Self {
		Self { hops }
	}

	pub fn hops(&self) -> &[Hop] {
		&self.hops
	}

	pub fn is_null(&self) -> bool {
		self.hops.is_empty()
	}

	pub fn is_broadcast(&self) -> bool {
		self.hops == [TO_EVERYONE]
	}

	/// A single-hop address resolves within this process without
	/// crossing a transport.
	pub fn is_local(&self) -> bool {
		self.hops.len() == 1
	}

	pub fn len(&self) -> usize {
		self.hops.len()
	}

	pub fn is_empty(&self) -> bool {
		self.hops.is_empty()
	}

	/// The hop that resolves in the current process, i.e. the mailbox
	/// the frame lands in next.
	pub fn trailing(&self) -> Option<Hop> {
		self.hops.last().copied()
	}

	/// Drop the trailing hop. Performed on arrival at each transport
	/// hop, so the remainder routes onward.
	pub fn peeled(&self) -> Address {
		let mut hops = self.hops.clone();
		hops.pop();
		Address { hops }
	}

	/// Extend the path so that subsequent sends route back through
	/// `proxy`.
	pub fn appended(&self, proxy: &Address) -> Address {
		let mut hops = self.hops.clone();
		hops.extend_from_slice(&proxy.hops);
		Address { hops }
	}

	pub fn ends_with(&self, tail: &Address) -> bool {
		!tail.is_empty() && self.hops.ends_with(&tail.hops)
	}

	/// Outbound rewrite: a path that would route back through
	/// `return_proxy` is shortened to the trombone marker so the far
	/// side can splice its own proxy back in.
	pub fn tromboned(&self, return_proxy: &Address) -> Address {
		if self.ends_with(return_proxy) {
			let keep = self.hops.len() - return_proxy.hops.len();
			let mut hops = self.hops[..keep].to_vec();
			hops.push(TROMBONE);
			Address { hops }
		} else {
			self.clone()
		}
	}

	/// Inbound rewrite: a trombone marker means the rest of the path
	/// is local to this side, so the marker is stripped; any other
	/// foreign address has the proxy appended so replies route back
	/// over this connection.
	pub fn arrived(&self, return_proxy: &Address) -> Address {
		match self.hops.last() {
			Some(&TROMBONE) => Address {
				hops: self.hops[..self.hops.len() - 1].to_vec(),
			},
			_ => self.appended(return_proxy),
		}
	}
}

impl fmt::Display for Address {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "[")?;
		for (i, hop) in self.hops.iter().enumerate() {
			if i > 0 {
				write!(f, ".")?;
			}
			write!(f, "{hop}")?;
		}
		write!(f, "]")
	}
}

impl fmt::Debug for Address {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		fmt::Display::fmt(self, f)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn trailing_and_peel() {
		let a = Address::from_hops(vec![7, 3]);
		assert_eq!(a.trailing(), Some(3));
		assert_eq!(a.peeled(), Address::local(7));
		assert!(!a.is_local());
		assert!(Address::local(7).is_local());
	}

	#[test]
	fn rewrite_is_round_trip_stable() {
		// A local address shipped out, learned by the peer, and sent
		// back through the matched proxy pair comes home unchanged.
		let ours = Address::local(5);
		let their_proxy = Address::local(9);
		let learned = ours.arrived(&their_proxy);
		assert_eq!(learned, Address::from_hops(vec![5, 9]));
		let returned = learned.tromboned(&their_proxy);
		assert_eq!(returned, Address::from_hops(vec![5, TROMBONE]));
		assert_eq!(returned.arrived(&Address::local(4)), ours);
	}

	#[test]
	fn foreign_address_gains_proxy() {
		let proxy = Address::local(4);
		let a = Address::local(11);
		assert_eq!(a.arrived(&proxy), Address::from_hops(vec![11, 4]));
	}

	#[test]
	fn null_is_never_a_destination() {
		let a = Address::null();
		assert!(a.is_null());
		assert_eq!(a.trailing(), None);
	}

	#[test]
	fn broadcast_is_its_own_shape() {
		let a = Address::to_everyone();
		assert!(a.is_broadcast());
		assert!(!a.is_null());
		assert!(!Address::local(3).is_broadcast());
	}
}
