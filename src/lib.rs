//! A distributed messaging fabric: addressed actors, portable typed
//! messages, framed sockets and a pub/sub directory.
//!
//! Objects hold a [`Point`] and talk to each other by address, whether
//! the destination is in the same process or across a network of
//! federated processes. The [`runtime::Runtime`] owns the object map
//! and the well-known services; the [`transport`] engine makes remote
//! objects look local; the [`directory`] resolves names to addresses
//! across process, group, host, LAN and WAN scopes.
//!
//! ```no_run
//! use runy_fabric::message::Ack;
//! use runy_fabric::runtime::Runtime;
//!
//! # async fn demo() {
//! let runtime = Runtime::start();
//! let (mut channel, address) = runtime.open_channel("demo", Default::default());
//! channel.send(Ack, &address);
//! let _frame = channel.select().of::<Ack>().frame().await.unwrap();
//! runtime.tear_down();
//! # }
//! ```

pub mod address;
pub mod channel;
pub mod clock;
pub mod codec;
pub mod directory;
pub mod dispatch;
pub mod entry;
pub mod error;
pub mod group;
pub mod log;
pub mod mailbox;
pub mod message;
pub mod point;
pub mod portable;
pub mod registry;
pub mod retry;
pub mod runtime;
pub mod seal;
pub mod teardown;
pub mod timer;
pub mod transport;
pub mod value;
pub mod wire;

pub mod prelude {
	pub use super::address::Address;
	pub use super::channel::Channel;
	pub use super::directory::Scope;
	pub use super::dispatch::Dispatch;
	pub use super::dispatch::Disposition;
	pub use super::dispatch::Next;
	pub use super::dispatch::StateMachine;
	pub use super::dispatch::StateTable;
	pub use super::dispatch::Stateless;
	pub use super::message::Message;
	pub use super::message::Portable;
	pub use super::point::Point;
	pub use super::runtime::Runtime;
}

pub use address::Address;
pub use channel::Channel;
pub use dispatch::Dispatch;
pub use dispatch::Disposition;
pub use dispatch::Next;
pub use dispatch::StateMachine;
pub use dispatch::StateTable;
pub use dispatch::Stateless;
pub use entry::run_root;
pub use point::Point;
pub use runtime::Runtime;
