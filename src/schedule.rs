//! Host-side scheduling of multi-pass reductions.
//!
//! A reduction starts with all values in the input buffer. Each pass reads
//! the current set of values from one slot and writes one partial sum per
//! work group into the other of two partials buffers, until the strategy
//! reports that the remaining partials should be finished on the host.

use crate::util::group_count;

/// Where a set of values lives during a reduction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Slot {
	/// The full input values buffer.
	Input,
	/// One of the two ping-pong partials buffers.
	Partials(usize),
}

impl Slot {
	/// Returns the partials buffer the next pass should write to when reading
	/// from this slot.
	fn next_destination(self) -> usize {
		match self {
			Self::Input => 0,
			Self::Partials(i) => 1 - i,
		}
	}
}

/// One planned reduction pass.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PassDescriptor {
	pub source: Slot,
	/// Index of the partials buffer to write to.
	pub destination: usize,
	/// Number of values read from `source`.
	pub source_len: u64,
	/// Number of work groups launched, and of partial sums written.
	pub group_count: u64,
}

/// The state of one reduction in progress.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReductionState {
	/// Number of values still to be reduced.
	pub remaining: u64,
	/// Where those values live.
	pub active: Slot,
	/// Number of passes issued so far.
	pub passes: u64,
}

impl ReductionState {
	fn new(vals_len: u64) -> Self {
		Self {
			remaining: vals_len,
			active: Slot::Input,
			passes: 0,
		}
	}

	fn apply(&mut self, pass: &PassDescriptor) {
		self.remaining = pass.group_count;
		self.active = Slot::Partials(pass.destination);
		self.passes += 1;
	}
}

/// Decides how far a reduction is driven on the device.
pub trait ReductionStrategy {
	/// Returns `true` once no further pass should be issued.
	fn is_done(&self, state: &ReductionState) -> bool;

	/// Plans the pass that follows `state`.
	fn plan_next_pass(
		&self,
		state: &ReductionState,
		work_group_size: u64,
		fan_in: u64,
	) -> PassDescriptor {
		PassDescriptor {
			source: state.active,
			destination: state.active.next_destination(),
			source_len: state.remaining,
			group_count: group_count(state.remaining, work_group_size, fan_in),
		}
	}
}

/// Drives the reduction on the device until a single value remains.
#[derive(Clone, Copy, Debug, Default)]
pub struct MultiPass;

impl ReductionStrategy for MultiPass {
	fn is_done(&self, state: &ReductionState) -> bool {
		state.remaining <= 1
	}
}

/// Issues a single pass and leaves its partial sums for the host.
#[derive(Clone, Copy, Debug, Default)]
pub struct SinglePass;

impl ReductionStrategy for SinglePass {
	fn is_done(&self, state: &ReductionState) -> bool {
		state.remaining <= 1 || state.passes >= 1
	}
}

/// Selects one of the built-in strategies.
#[derive(clap::ValueEnum, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Variant {
	/// Reduce on the device all the way down to one value.
	#[default]
	Full,
	/// Reduce once on the device and finish the partial sums on the host.
	Single,
}

impl Variant {
	pub fn strategy(self) -> &'static dyn ReductionStrategy {
		match self {
			Self::Full => &MultiPass,
			Self::Single => &SinglePass,
		}
	}
}

/// Issues one reduction pass, e.g. by recording a compute dispatch.
pub trait PassInvoker {
	type Error;

	fn invoke(&mut self, pass: &PassDescriptor) -> Result<(), Self::Error>;
}

/// Where the final partial set of a reduction lives.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Outcome {
	pub slot: Slot,
	pub len: u64,
	pub passes: u64,
}

/// Runs the pass loop for `vals_len` values, invoking `invoker` once per
/// planned pass.
///
/// `vals_len` must be non-zero.
pub fn schedule<S, I>(
	strategy: &S,
	work_group_size: u64,
	fan_in: u64,
	vals_len: u64,
	invoker: &mut I,
) -> Result<Outcome, I::Error>
where
	S: ReductionStrategy + ?Sized,
	I: PassInvoker,
{
	debug_assert!(vals_len > 0);

	let mut state = ReductionState::new(vals_len);
	while !strategy.is_done(&state) {
		let pass = strategy.plan_next_pass(&state, work_group_size, fan_in);
		debug_assert_ne!(pass.source, Slot::Partials(pass.destination));
		tracing::debug!(
			pass = state.passes,
			source = ?pass.source,
			destination = pass.destination,
			source_len = pass.source_len,
			group_count = pass.group_count,
			"planned reduction pass"
		);
		invoker.invoke(&pass)?;
		state.apply(&pass);
	}

	Ok(Outcome {
		slot: state.active,
		len: state.remaining,
		passes: state.passes,
	})
}

#[cfg(test)]
pub(crate) mod host {
	//! Host emulation of the reduction kernel, for testing the scheduler
	//! without a device.

	use super::*;

	pub(crate) struct HostKernel {
		pub(crate) vals: Vec<f64>,
		pub(crate) partials: [Vec<f64>; 2],
		pub(crate) work_group_size: u64,
		pub(crate) passes: Vec<PassDescriptor>,
	}

	impl HostKernel {
		pub(crate) fn new(vals: Vec<f64>, work_group_size: u64, partials_len: u64) -> Self {
			Self {
				vals,
				partials: std::array::from_fn(|_| vec![f64::NAN; partials_len as usize]),
				work_group_size,
				passes: Vec::new(),
			}
		}

		pub(crate) fn slot(&self, slot: Slot) -> &[f64] {
			match slot {
				Slot::Input => &self.vals,
				Slot::Partials(i) => &self.partials[i],
			}
		}
	}

	impl PassInvoker for HostKernel {
		type Error = String;

		// Mirrors `shaders/reduction.comp`: grid-stride accumulation per
		// invocation, then a sum per work group.
		fn invoke(&mut self, pass: &PassDescriptor) -> Result<(), String> {
			let [ping, pong] = &mut self.partials;
			let (src, dst) = match (pass.source, pass.destination) {
				(Slot::Input, 0) => (&self.vals[..], ping),
				(Slot::Input, _) => (&self.vals[..], pong),
				(Slot::Partials(0), 1) => (&ping[..], pong),
				(Slot::Partials(1), 0) => (&pong[..], ping),
				_ => return Err("source aliases destination".into()),
			};
			if (src.len() as u64) < pass.source_len {
				return Err("source too small".into());
			}
			if (dst.len() as u64) < pass.group_count {
				return Err("destination too small".into());
			}

			let wgs = self.work_group_size as usize;
			let invocations = pass.group_count as usize * wgs;
			let mut sums = vec![0.0; invocations];
			for (gid, sum) in sums.iter_mut().enumerate() {
				let mut i = gid;
				while i < pass.source_len as usize {
					*sum += src[i];
					i += invocations;
				}
			}
			for (group, chunk) in sums.chunks(wgs).enumerate() {
				dst[group] = chunk.iter().sum();
			}

			self.passes.push(*pass);
			Ok(())
		}
	}
}

#[cfg(test)]
mod tests {
	use rand::{Rng as _, SeedableRng as _, rngs::StdRng};

	use super::host::HostKernel;
	use super::*;
	use crate::finish::{host_sum, relative_error};

	const WGS: u64 = 256;
	const FAN_IN: u64 = 8;

	fn run(strategy: &dyn ReductionStrategy, vals: Vec<f64>) -> (Outcome, HostKernel) {
		let len = vals.len() as u64;
		let mut kernel = HostKernel::new(vals, WGS, group_count(len, WGS, FAN_IN));
		let outcome = schedule(strategy, WGS, FAN_IN, len, &mut kernel).unwrap();
		(outcome, kernel)
	}

	#[test]
	fn one_value_issues_no_passes() {
		for variant in [Variant::Full, Variant::Single] {
			let (outcome, kernel) = run(variant.strategy(), vec![42.5]);
			assert_eq!(
				outcome,
				Outcome {
					slot: Slot::Input,
					len: 1,
					passes: 0
				}
			);
			assert!(kernel.passes.is_empty());
			assert_eq!(kernel.slot(outcome.slot)[0], 42.5);
		}
	}

	#[test]
	fn ones_fit_a_single_group() {
		let (outcome, kernel) = run(&MultiPass, vec![1.0; 1024]);
		assert_eq!(
			outcome,
			Outcome {
				slot: Slot::Partials(0),
				len: 1,
				passes: 1
			}
		);
		assert_eq!(kernel.slot(outcome.slot)[0], 1024.0);
	}

	#[test]
	fn ping_pong() {
		let (outcome, kernel) = run(&MultiPass, vec![1.0; 1 << 23]);
		assert_eq!(outcome.passes, 3);
		assert_eq!(outcome.slot, Slot::Partials(0));

		let roles: Vec<_> = kernel
			.passes
			.iter()
			.map(|p| (p.source, p.destination, p.source_len, p.group_count))
			.collect();
		assert_eq!(
			roles,
			[
				(Slot::Input, 0, 1 << 23, 4096),
				(Slot::Partials(0), 1, 4096, 2),
				(Slot::Partials(1), 0, 2, 1),
			]
		);
		assert_eq!(kernel.slot(outcome.slot)[0], (1u64 << 23) as f64);
	}

	#[test]
	fn single_pass_leaves_partials() {
		let vals: Vec<f64> = (0..(1 << 20)).map(f64::from).collect();
		let (outcome, kernel) = run(&SinglePass, vals);
		assert_eq!(
			outcome,
			Outcome {
				slot: Slot::Partials(0),
				len: 512,
				passes: 1
			}
		);
		let partials = &kernel.slot(outcome.slot)[..outcome.len as usize];
		// Sum of 0..2^20, exactly representable.
		assert_eq!(host_sum(partials), 549_755_289_600.0);
	}

	#[test]
	fn trailing_values_are_kept() {
		let span = (WGS * FAN_IN) as usize;
		for len in [span - 1, span, span + 1, 3 * span, 3 * span + 1, 1 + WGS as usize] {
			let (outcome, kernel) = run(&MultiPass, vec![1.0; len]);
			assert_eq!(outcome.len, 1);
			assert_eq!(kernel.slot(outcome.slot)[0], len as f64, "len = {len}");
		}
	}

	#[test]
	fn source_never_aliases_destination() {
		let (_, kernel) = run(&MultiPass, vec![0.5; 1 << 22]);
		for pass in &kernel.passes {
			assert_ne!(pass.source, Slot::Partials(pass.destination));
		}
	}

	#[test]
	fn random_doubles_match_host_sum() {
		let mut rng = StdRng::seed_from_u64(8);
		let vals: Vec<f64> = (0..1 << 22).map(|_| rng.r#gen::<f64>()).collect();
		let expected = host_sum(&vals);

		for (variant, passes) in [(Variant::Full, 2), (Variant::Single, 1)] {
			let (outcome, kernel) = run(variant.strategy(), vals.clone());
			assert_eq!(outcome.passes, passes);
			let sum = host_sum(&kernel.slot(outcome.slot)[..outcome.len as usize]);
			assert!(
				relative_error(expected, sum) < 1e-9,
				"{variant:?}: {expected} vs {sum}"
			);
		}
	}

	#[test]
	fn invoker_errors_abort() {
		struct Failing(u64);

		impl PassInvoker for Failing {
			type Error = u64;

			fn invoke(&mut self, _: &PassDescriptor) -> Result<(), u64> {
				self.0 += 1;
				Err(self.0)
			}
		}

		let mut invoker = Failing(0);
		let result = schedule(&MultiPass, WGS, FAN_IN, 1 << 22, &mut invoker);
		assert_eq!(result, Err(1));
		assert_eq!(invoker.0, 1);
	}
}
