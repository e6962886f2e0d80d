/// Returns the number of work groups the next reduction pass launches for
/// `remaining` values, where each work group is `work_group_size` wide and
/// the launch grid is shrunk by `fan_in`.
///
/// Rounds up at both steps so trailing values are never dropped.
pub fn group_count(remaining: u64, work_group_size: u64, fan_in: u64) -> u64 {
	remaining.div_ceil(work_group_size).div_ceil(fan_in)
}

/// Helper methods for parallel reduction over multiple work groups.
pub(crate) trait ParallelReduceExt {
	/// How many work groups’ worth of values each launched work group
	/// accumulates before writing its partial result.
	const FAN_IN: u64;

	/// Returns the size of a work group.
	fn work_group_size(&self) -> u64;

	/// Returns the number of work groups (and hence partial results) needed
	/// to process the given number of values in one pass.
	fn group_count(&self, vals_len: u64) -> u64 {
		group_count(vals_len, self.work_group_size(), Self::FAN_IN)
	}

	/// Returns the length of each of the two ping-pong partials buffers for
	/// the given number of values. The first pass produces the most partial
	/// results; every later pass produces fewer.
	fn partials_buffer_len(&self, vals_len: u64) -> u64 {
		self.group_count(vals_len).max(1)
	}

	/// Returns whether the kernel's 32-bit grid-stride index can walk
	/// `vals_len` values without wrapping. The index steps once past the last
	/// value it reads, by a whole launch grid.
	fn fits_u32_indexing(&self, vals_len: u64) -> bool {
		let stride = self.group_count(vals_len) * self.work_group_size();
		vals_len.saturating_sub(1) + stride <= u32::MAX as u64
	}

	/// Returns the number of passes needed to reduce the given number of
	/// values all the way down to one.
	fn parallel_reduce_depth(&self, mut vals_len: u64) -> u64 {
		let mut depth = 0;
		while vals_len > 1 {
			depth += 1;
			vals_len = self.group_count(vals_len);
		}
		depth
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	const WGS: u64 = 256;
	const FAN_IN: u64 = 8;

	struct Fixed;

	impl ParallelReduceExt for Fixed {
		const FAN_IN: u64 = FAN_IN;

		fn work_group_size(&self) -> u64 {
			WGS
		}
	}

	#[test]
	fn at_least_one_group() {
		for remaining in 1..=20_000 {
			assert!(group_count(remaining, WGS, FAN_IN) >= 1);
		}
	}

	#[test]
	fn strictly_shrinks_above_one_group() {
		for remaining in (WGS * FAN_IN + 1)..=(WGS * FAN_IN * 20) {
			assert!(group_count(remaining, WGS, FAN_IN) < remaining);
		}
		assert!(group_count(1 << 25, WGS, FAN_IN) < 1 << 25);
	}

	#[test]
	fn single_group_up_to_capacity() {
		assert_eq!(group_count(1, WGS, FAN_IN), 1);
		assert_eq!(group_count(1024, WGS, FAN_IN), 1);
		assert_eq!(group_count(WGS * FAN_IN, WGS, FAN_IN), 1);
	}

	#[test]
	fn boundaries_round_up() {
		let span = WGS * FAN_IN;
		for k in 1..=64 {
			assert_eq!(group_count(k * span, WGS, FAN_IN), k);
			assert_eq!(group_count(k * span + 1, WGS, FAN_IN), k + 1);
		}
		// Crossing a work group, but not a fan-in span, adds no group.
		assert_eq!(group_count(span + WGS, WGS, FAN_IN), 2);
		assert_eq!(group_count(2 * span - 1, WGS, FAN_IN), 2);
	}

	#[test]
	fn depth() {
		assert_eq!(Fixed.parallel_reduce_depth(1), 0);
		assert_eq!(Fixed.parallel_reduce_depth(2), 1);
		assert_eq!(Fixed.parallel_reduce_depth(2048), 1);
		assert_eq!(Fixed.parallel_reduce_depth(2049), 2);
		// 2^22 → 2048 → 1
		assert_eq!(Fixed.parallel_reduce_depth(1 << 22), 2);
		// 2^25 → 16384 → 8 → 1
		assert_eq!(Fixed.parallel_reduce_depth(1 << 25), 3);
	}

	#[test]
	fn u32_indexing_bound() {
		assert!(Fixed.fits_u32_indexing(1));
		assert!(Fixed.fits_u32_indexing(1 << 25));
		// 1864135 fan-in spans: the last index plus one grid is 2^32 - 257.
		let largest = 1_864_135 * WGS * FAN_IN;
		assert!(Fixed.fits_u32_indexing(largest));
		assert!(!Fixed.fits_u32_indexing(largest + 1));
		assert!(!Fixed.fits_u32_indexing(u32::MAX as u64));
		assert!(!Fixed.fits_u32_indexing(u32::MAX as u64 + 1));
	}

	#[test]
	fn partials_buffer_len() {
		assert_eq!(Fixed.partials_buffer_len(1), 1);
		assert_eq!(Fixed.partials_buffer_len(1 << 22), 2048);
		assert_eq!(Fixed.partials_buffer_len((1 << 22) + 1), 2049);
	}
}
