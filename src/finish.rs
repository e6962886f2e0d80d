use crate::element::Element;

/// Sums `vals` sequentially on the host, in array order.
pub fn host_sum<T: Element>(vals: &[T]) -> T {
	vals.iter().fold(T::default(), |acc, &val| acc + val)
}

/// Returns `|host - device| / |host|`, or zero when both sums are equal.
pub fn relative_error(host: f64, device: f64) -> f64 {
	if host == device {
		return 0.0;
	}
	(host - device).abs() / host.abs()
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn empty_is_zero() {
		assert_eq!(host_sum::<f32>(&[]), 0.0);
		assert_eq!(host_sum::<f64>(&[]), 0.0);
	}

	#[test]
	fn array_order() {
		// Reordering would round differently in f32.
		let vals = [1.0e8f32, 1.0, -1.0e8, 1.0];
		assert_eq!(host_sum(&vals), 1.0);
	}

	#[test]
	fn deterministic() {
		let vals: Vec<f64> = (0..10_000).map(|i| (i as f64).sin() * 1e-3 + 0.1).collect();
		assert_eq!(host_sum(&vals).to_bits(), host_sum(&vals).to_bits());
	}

	#[test]
	fn relative() {
		assert_eq!(relative_error(1024.0, 1024.0), 0.0);
		assert_eq!(relative_error(0.0, 0.0), 0.0);
		assert_eq!(relative_error(-4.0, -3.0), 0.25);
		assert_eq!(relative_error(0.0, 1.0), f64::INFINITY);
	}
}
