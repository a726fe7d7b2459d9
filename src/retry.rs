use std::time::Duration;

use rand::Rng;

/// Reconnect pacing: a few quick first steps, then a regular step,
/// optionally jittered and truncated, up to a step limit. The
/// transport never retries on its own; directory glue and
/// applications drive these intervals.
#[derive(Clone, Debug)]
pub struct RetryIntervals {
	pub first_steps: Vec<f64>,
	pub regular_steps: f64,
	pub step_limit: Option<u32>,
	pub randomized: Option<f64>,
	pub truncated: Option<f64>,
}

impl RetryIntervals {
	pub fn new(regular_steps: f64) -> Self {
		Self {
			first_steps: Vec::new(),
			regular_steps,
			step_limit: None,
			randomized: None,
			truncated: None,
		}
	}

	pub fn first_steps(mut self, steps: impl IntoIterator<Item = f64>) -> Self {
		self.first_steps = steps.into_iter().collect();
		self
	}

	pub fn step_limit(mut self, limit: u32) -> Self {
		self.step_limit = Some(limit);
		self
	}

	/// Add up to `fraction` of the step as random jitter.
	pub fn randomized(mut self, fraction: f64) -> Self {
		self.randomized = Some(fraction);
		self
	}

	pub fn truncated(mut self, ceiling: f64) -> Self {
		self.truncated = Some(ceiling);
		self
	}

	pub fn intervals(&self) -> Intervals<'_> {
		Intervals {
			plan: self,
			step: 0,
		}
	}
}

impl Default for RetryIntervals {
	fn default() -> Self {
		RetryIntervals::new(30.0)
			.first_steps([1.0, 2.0, 4.0])
			.randomized(0.25)
	}
}

pub struct Intervals<'p> {
	plan: &'p RetryIntervals,
	step: u32,
}

impl Iterator for Intervals<'_> {
	type Item = Duration;

	fn next(&mut self) -> Option<Duration> {
		if let Some(limit) = self.plan.step_limit {
			if self.step >= limit {
				return None;
			}
		}
		let base = self
			.plan
			.first_steps
			.get(self.step as usize)
			.copied()
			.unwrap_or(self.plan.regular_steps);
		self.step += 1;

		let mut seconds = base;
		if let Some(fraction) = self.plan.randomized {
			let jitter = rand::thread_rng().gen_range(0.0..=fraction.max(0.0));
			seconds += base * jitter;
		}
		if let Some(ceiling) = self.plan.truncated {
			seconds = seconds.min(ceiling);
		}
		Some(Duration::from_secs_f64(seconds.max(0.0)))
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn first_steps_then_regular() {
		let plan = RetryIntervals::new(10.0).first_steps([1.0, 2.0]).step_limit(4);
		let steps: Vec<Duration> = plan.intervals().collect();
		assert_eq!(
			steps,
			vec![
				Duration::from_secs(1),
				Duration::from_secs(2),
				Duration::from_secs(10),
				Duration::from_secs(10),
			]
		);
	}

	#[test]
	fn truncation_caps_the_step() {
		let plan = RetryIntervals::new(60.0).truncated(5.0).step_limit(1);
		let steps: Vec<Duration> = plan.intervals().collect();
		assert_eq!(steps, vec![Duration::from_secs(5)]);
	}

	#[test]
	fn unlimited_plans_keep_stepping() {
		let plan = RetryIntervals::new(3.0);
		assert_eq!(plan.intervals().take(100).count(), 100);
	}
}
