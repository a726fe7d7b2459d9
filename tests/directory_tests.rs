use std::future::Future;
use std::time::Duration;

use runy_fabric::address::Address;
use runy_fabric::directory;
use runy_fabric::directory::Available;
use runy_fabric::directory::Delivered;
use runy_fabric::directory::Dropped;
use runy_fabric::directory::NotSubscribed;
use runy_fabric::directory::Published;
use runy_fabric::directory::PublishedCleared;
use runy_fabric::directory::Scope;
use runy_fabric::directory::Subscribed;
use runy_fabric::directory::SubscribedCleared;
use runy_fabric::message::Ack;
use runy_fabric::message::Enquiry;
use runy_fabric::runtime::Runtime;
use runy_fabric::transport::HostPort;

async fn within<T>(work: impl Future<Output = T>) -> T {
	tokio::time::timeout(Duration::from_secs(30), work)
		.await
		.expect("scenario stalled")
}

// Publisher and subscriber in one process: the directory wires them
// together without touching a socket.
#[tokio::test]
async fn publish_and_subscribe_in_process() {
	within(async {
		let runtime = Runtime::start();
		let (mut publisher, _) = runtime.open_channel("publisher", Address::null());
		let (mut subscriber, _) = runtime.open_channel("subscriber", Address::null());

		directory::publish(&publisher.point, "acme", Scope::Process);
		let frame = publisher.select().of::<Published>().frame().await.unwrap();
		let published = frame.message.downcast_ref::<Published>().unwrap();
		assert_eq!(published.name, "acme");

		directory::subscribe(&subscriber.point, "acme", Scope::Process);
		let frame = subscriber.select().of::<Subscribed>().frame().await.unwrap();
		assert!(frame.message.downcast_ref::<Subscribed>().is_some());

		let frame = subscriber.select().of::<Available>().frame().await.unwrap();
		let available = frame.message.downcast_ref::<Available>().unwrap().clone();
		assert_eq!(available.name, "acme");

		let frame = publisher.select().of::<Delivered>().frame().await.unwrap();
		let delivered = frame.message.downcast_ref::<Delivered>().unwrap();
		assert_eq!(delivered.name, "acme");

		// The published address answers like any other object.
		subscriber.send(Enquiry, &available.publisher_address);
		let frame = publisher.select().of::<Enquiry>().frame().await.unwrap();
		assert!(frame.message.downcast_ref::<Enquiry>().is_some());
		publisher.reply(Ack);
		let frame = subscriber.select().of::<Ack>().frame().await.unwrap();
		assert!(frame.message.downcast_ref::<Ack>().is_some());

		runtime.tear_down();
	})
	.await;
}

// Two processes meet through a shared host directory: a route is
// built over loopback, traffic flows end to end, and losing the
// publisher's process drops the subscriber's route.
#[tokio::test]
async fn route_through_a_host_directory() {
	within(async {
		let hub = Runtime::start();
		directory::serve(&hub, Scope::Host, HostPort::loopback(35021));

		let first = Runtime::start();
		let second = Runtime::start();
		directory::connect_up(&first, Scope::Host, HostPort::loopback(35021));
		directory::connect_up(&second, Scope::Host, HostPort::loopback(35021));

		let (mut publisher, _) = first.open_channel("publisher", Address::null());
		let (mut subscriber, _) = second.open_channel("subscriber", Address::null());

		directory::publish(&publisher.point, "acme", Scope::Host);
		let frame = publisher.select().of::<Published>().frame().await.unwrap();
		let published = frame.message.downcast_ref::<Published>().unwrap();
		assert_ne!(published.listening_ipp.port, 0);

		directory::subscribe(&subscriber.point, "acme", Scope::Host);
		let frame = subscriber.select().of::<Subscribed>().frame().await.unwrap();
		assert!(frame.message.downcast_ref::<Subscribed>().is_some());

		let frame = subscriber.select().of::<Available>().frame().await.unwrap();
		let available = frame.message.downcast_ref::<Available>().unwrap().clone();
		assert!(available.publisher_address.hops().len() > 1);

		let frame = publisher.select().of::<Delivered>().frame().await.unwrap();
		assert!(frame.message.downcast_ref::<Delivered>().is_some());

		subscriber.send(Enquiry, &available.publisher_address);
		let frame = publisher.select().of::<Enquiry>().frame().await.unwrap();
		assert!(frame.message.downcast_ref::<Enquiry>().is_some());
		publisher.reply(Ack);
		let frame = subscriber.select().of::<Ack>().frame().await.unwrap();
		assert!(frame.message.downcast_ref::<Ack>().is_some());

		// The publisher's process goes away; the subscriber learns.
		drop(publisher);
		first.tear_down();
		let frame = subscriber.select().of::<Dropped>().frame().await.unwrap();
		let dropped = frame.message.downcast_ref::<Dropped>().unwrap();
		assert_eq!(dropped.name, "acme");
		assert_eq!(dropped.route_id, available.route_id);

		second.tear_down();
		hub.tear_down();
	})
	.await;
}

// A search that does not compile is refused, not installed.
#[tokio::test]
async fn broken_search_is_not_subscribed() {
	within(async {
		let runtime = Runtime::start();
		let (mut subscriber, _) = runtime.open_channel("subscriber", Address::null());

		directory::subscribe(&subscriber.point, "(acme", Scope::Process);
		let frame = subscriber
			.select()
			.of::<Subscribed>()
			.of::<NotSubscribed>()
			.frame()
			.await
			.unwrap();
		let refused = frame.message.downcast_ref::<NotSubscribed>().unwrap();
		assert!(!refused.error.is_empty());

		runtime.tear_down();
	})
	.await;
}

// ClearListings retires everything the caller installed, with a
// confirmation per listing.
#[tokio::test]
async fn clear_listings_confirms_each() {
	within(async {
		let runtime = Runtime::start();
		let (mut party, _) = runtime.open_channel("party", Address::null());

		directory::publish(&party.point, "acme", Scope::Process);
		let frame = party.select().of::<Published>().frame().await.unwrap();
		let published = frame.message.downcast_ref::<Published>().unwrap().clone();

		directory::subscribe(&party.point, "other", Scope::Process);
		let frame = party.select().of::<Subscribed>().frame().await.unwrap();
		let subscribed = frame.message.downcast_ref::<Subscribed>().unwrap().clone();

		party.send(
			directory::ClearListings::default(),
			&runtime.directory_address().unwrap(),
		);
		let frame = party.select().of::<PublishedCleared>().frame().await.unwrap();
		let cleared = frame.message.downcast_ref::<PublishedCleared>().unwrap();
		assert_eq!(cleared.published_id, published.published_id);

		let frame = party
			.select()
			.of::<SubscribedCleared>()
			.frame()
			.await
			.unwrap();
		let cleared = frame.message.downcast_ref::<SubscribedCleared>().unwrap();
		assert_eq!(cleared.subscribed_id, subscribed.subscribed_id);

		runtime.tear_down();
	})
	.await;
}
