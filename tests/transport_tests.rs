use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use runy_fabric::address::Address;
use runy_fabric::message::Ack;
use runy_fabric::message::Enquiry;
use runy_fabric::message::TimedOut;
use runy_fabric::runtime::Runtime;
use runy_fabric::transport::Accepted;
use runy_fabric::transport::Close;
use runy_fabric::transport::Closed;
use runy_fabric::transport::ConnectStream;
use runy_fabric::transport::Connected;
use runy_fabric::transport::HostPort;
use runy_fabric::transport::ListenForStream;
use runy_fabric::transport::Listening;
use runy_fabric::transport::NotConnected;
use runy_fabric::transport::NotListening;

async fn within<T>(work: impl Future<Output = T>) -> T {
	tokio::time::timeout(Duration::from_secs(30), work)
		.await
		.expect("scenario stalled")
}

// Echo over TCP: connect, exchange Acks, close cleanly. Both sides
// see Closed; the listener saw Accepted first.
#[tokio::test]
async fn echo_over_tcp() {
	within(async {
		let server = Runtime::start();
		let client = Runtime::start();

		let (mut listener, _) = server.open_channel("listener", Address::null());
		listener.send(
			ListenForStream {
				requested_ipp: HostPort::loopback(5010),
				encrypted: false,
				tunnel: false,
			},
			&server.connector_address().unwrap(),
		);
		let frame = listener
			.select()
			.of::<Listening>()
			.of::<NotListening>()
			.frame()
			.await
			.unwrap();
		assert!(
			frame.message.downcast_ref::<Listening>().is_some(),
			"{:?}",
			frame.message
		);

		let (mut caller, _) = client.open_channel("caller", Address::null());
		caller.send(
			ConnectStream {
				requested_ipp: HostPort::loopback(5010),
				encrypted: false,
				tunnel: false,
			},
			&client.connector_address().unwrap(),
		);
		let frame = caller
			.select()
			.of::<Connected>()
			.of::<NotConnected>()
			.frame()
			.await
			.unwrap();
		let connected = frame
			.message
			.downcast_ref::<Connected>()
			.unwrap_or_else(|| panic!("{:?}", frame.message));
		let proxy = connected.proxy.clone();

		let frame = listener.select().of::<Accepted>().frame().await.unwrap();
		assert!(frame.message.downcast_ref::<Accepted>().is_some());

		// An Ack each way through the proxy.
		caller.send(Ack, &proxy);
		let frame = listener.select().of::<Ack>().frame().await.unwrap();
		assert!(frame.message.downcast_ref::<Ack>().is_some());
		listener.reply(Ack);
		let frame = caller.select().of::<Ack>().frame().await.unwrap();
		assert!(frame.message.downcast_ref::<Ack>().is_some());

		// A clean close carries its value out of both ends.
		caller.send(Close::new(Arc::new(Ack)), &proxy);
		let frame = caller.select().of::<Closed>().frame().await.unwrap();
		let closed = frame.message.downcast_ref::<Closed>().unwrap();
		assert!(closed.value.downcast_ref::<Ack>().is_some());

		let frame = listener.select().of::<Closed>().frame().await.unwrap();
		let closed = frame.message.downcast_ref::<Closed>().unwrap();
		assert!(closed.value.downcast_ref::<Ack>().is_some());

		client.tear_down();
		server.tear_down();
	})
	.await;
}

// Messages exchanged over an encrypted session read the same as over
// a clear one; the handshake never reaches the application.
#[tokio::test]
async fn encrypted_session_carries_messages() {
	within(async {
		let server = Runtime::start();
		let client = Runtime::start();

		let (mut listener, _) = server.open_channel("listener", Address::null());
		listener.send(
			ListenForStream {
				requested_ipp: HostPort::loopback(5012),
				encrypted: true,
				tunnel: false,
			},
			&server.connector_address().unwrap(),
		);
		let frame = listener.select().of::<Listening>().frame().await.unwrap();
		assert!(frame.message.downcast_ref::<Listening>().is_some());

		let (mut caller, _) = client.open_channel("caller", Address::null());
		caller.send(
			ConnectStream {
				requested_ipp: HostPort::loopback(5012),
				encrypted: true,
				tunnel: false,
			},
			&client.connector_address().unwrap(),
		);
		let frame = caller.select().of::<Connected>().frame().await.unwrap();
		let proxy = frame
			.message
			.downcast_ref::<Connected>()
			.unwrap()
			.proxy
			.clone();

		caller.send(Enquiry, &proxy);
		let frame = listener.select().of::<Enquiry>().frame().await.unwrap();
		assert!(frame.message.downcast_ref::<Enquiry>().is_some());
		listener.reply(Ack);
		let frame = caller.select().of::<Ack>().frame().await.unwrap();
		assert!(frame.message.downcast_ref::<Ack>().is_some());

		client.tear_down();
		server.tear_down();
	})
	.await;
}

// A peer that never answers the liveness probe costs the session:
// after the idle window and the response window, Closed{TimedOut}.
#[tokio::test(start_paused = true)]
async fn idle_transport_times_out() {
	let mute = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
	let port = mute.local_addr().unwrap().port();

	let client = Runtime::start();
	let (mut caller, _) = client.open_channel("caller", Address::null());
	caller.send(
		ConnectStream {
			requested_ipp: HostPort::loopback(port),
			encrypted: false,
			tunnel: false,
		},
		&client.connector_address().unwrap(),
	);

	// Accept and go silent; enquiries pile up unanswered.
	let (peer, _) = mute.accept().await.unwrap();

	let frame = caller.select().of::<Connected>().frame().await.unwrap();
	assert!(frame.message.downcast_ref::<Connected>().is_some());

	let frame = caller.select().of::<Closed>().frame().await.unwrap();
	let closed = frame.message.downcast_ref::<Closed>().unwrap();
	assert!(
		closed.value.downcast_ref::<TimedOut>().is_some(),
		"{:?}",
		closed.value
	);

	drop(peer);
	client.tear_down();
}

// Connecting to a port nobody listens on reports NotConnected with
// the platform's error text.
#[tokio::test]
async fn refused_connection_reports_not_connected() {
	within(async {
		let client = Runtime::start();
		let (mut caller, _) = client.open_channel("caller", Address::null());
		caller.send(
			ConnectStream {
				requested_ipp: HostPort::loopback(1),
				encrypted: false,
				tunnel: false,
			},
			&client.connector_address().unwrap(),
		);
		let frame = caller.select().of::<NotConnected>().frame().await.unwrap();
		let refused = frame.message.downcast_ref::<NotConnected>().unwrap();
		assert!(!refused.error.is_empty());
		client.tear_down();
	})
	.await;
}
