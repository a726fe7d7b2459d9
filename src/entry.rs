//! Process entry: run a root routine on a fresh runtime, wait for its
//! terminal value, render it and map it to an exit status.
//!
//! The terminal interrupt sends a `Stop` to the root, which is
//! expected to wind down and return; a second interrupt is left to the
//! platform. The embedding application calls `std::process::exit` with
//! what this module returns.

use std::future::Future;
use std::sync::Arc;

use crate::address::Address;
use crate::channel::Channel;
use crate::codec;
use crate::message::Aborted;
use crate::message::Faulted;
use crate::message::Message;
use crate::message::Returned;
use crate::message::Stop;
use crate::message::TimedOut;
use crate::runtime::Runtime;

/// Exit status for an uncaught fault with no status of its own.
pub const FAULTY_EXIT: i32 = 70;

/// Boot a runtime, run `body` as the root routine, tear everything
/// down and return the exit status for the terminal value. With
/// `full_output` the whole value prints as JSON; otherwise faults get
/// a single-line diagnostic on stderr and clean values stay quiet.
pub async fn run_root<F, Fut>(body: F, full_output: bool) -> i32
where
	F: FnOnce(Channel) -> Fut + Send + 'static,
	Fut: Future<Output = anyhow::Result<Arc<dyn Message>>> + Send + 'static,
{
	let runtime = Runtime::start();
	let status = run_root_on(&runtime, body, full_output).await;
	runtime.tear_down();
	status
}

/// Like [`run_root`] but on a runtime the caller owns; teardown stays
/// with the caller.
pub async fn run_root_on<F, Fut>(runtime: &Arc<Runtime>, body: F, full_output: bool) -> i32
where
	F: FnOnce(Channel) -> Fut + Send + 'static,
	Fut: Future<Output = anyhow::Result<Arc<dyn Message>>> + Send + 'static,
{
	let (mut monitor, monitor_address) = runtime.open_channel("root-monitor", Address::null());
	let root = runtime.create_routine("root", body, monitor_address);

	let mut interrupted = false;
	let value = loop {
		let frame = if interrupted {
			monitor.input().await
		} else {
			let mut interrupt = false;
			let frame = tokio::select! {
				_ = tokio::signal::ctrl_c() => {
					interrupt = true;
					None
				}
				frame = monitor.input() => Some(frame),
			};
			if interrupt {
				interrupted = true;
				monitor.point.send(Stop, &root);
				continue;
			}
			frame.unwrap_or(Err(crate::error::SelectError::Closed))
		};

		match frame {
			Ok(frame) => {
				if let Some(returned) = frame.message.downcast_ref::<Returned>() {
					break returned.value.clone();
				}
				// Anything else reaching the monitor is noise.
			}
			Err(_) => break Arc::new(Aborted::new()) as Arc<dyn Message>,
		}
	};

	render(runtime, value.as_ref(), full_output)
}

/// Print the terminal value per the conventions and pick the status.
fn render(runtime: &Arc<Runtime>, value: &dyn Message, full_output: bool) -> i32 {
	let fault = fault_of(value);

	if full_output {
		let json = codec::encode_any(runtime.registry(), value)
			.map(|v| codec::value_to_json(&v))
			.unwrap_or_else(|_| serde_json::json!(format!("{value:?}")));
		match serde_json::to_string_pretty(&json) {
			Ok(text) => println!("{text}"),
			Err(_) => println!("{json}"),
		}
	} else if let Some(fault) = &fault {
		match &fault.explanation {
			Some(explanation) => eprintln!("{}: {explanation}", fault.condition),
			None => eprintln!("{}", fault.condition),
		}
	}

	match fault {
		Some(fault) => fault
			.exit_status
			.map(|status| status as i32)
			.unwrap_or(FAULTY_EXIT),
		None => 0,
	}
}

fn fault_of(value: &dyn Message) -> Option<Faulted> {
	if let Some(fault) = value.downcast_ref::<Faulted>() {
		return Some(fault.clone());
	}
	if let Some(aborted) = value.downcast_ref::<Aborted>() {
		return Some(aborted.fault.clone());
	}
	if let Some(timed_out) = value.downcast_ref::<TimedOut>() {
		return Some(timed_out.fault.clone());
	}
	None
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn faults_pick_their_own_status() {
		let fault = Faulted {
			condition: "broke".to_string(),
			explanation: None,
			code: None,
			exit_status: Some(3),
		};
		assert_eq!(fault_of(&fault).unwrap().exit_status, Some(3));
	}

	#[test]
	fn derived_faults_are_faults() {
		assert!(fault_of(&Aborted::new()).is_some());
		assert!(fault_of(&TimedOut::new("SelectTimer")).is_some());
		assert!(fault_of(&crate::message::Ack).is_none());
	}
}
