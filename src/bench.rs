//! Timed end-to-end reductions, checked against a sequential host sum.

use std::{
	collections::TryReserveError,
	fmt,
	time::{Duration, Instant},
};

mod vk {
	pub(super) use vulkano::buffer::{
		AllocateBufferError, Buffer, BufferCreateInfo, BufferUsage, Subbuffer,
	};
	pub(super) use vulkano::command_buffer::CopyBufferInfo;
	pub(super) use vulkano::memory::allocator::{AllocationCreateInfo, MemoryTypeFilter};
	pub(super) use vulkano::sync::HostAccessError;
	pub(super) use vulkano::{Validated, ValidationError};
}

use rand::{Rng as _, SeedableRng as _, rngs::StdRng};

use crate::{
	context::{self, Context},
	element::Element,
	finish::{host_sum, relative_error},
	reduce::{self, Reduction},
	schedule::Variant,
};

/// How the host values are initialized.
#[derive(clap::ValueEnum, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Fill {
	/// Uniformly random in `[0, 1)`.
	#[default]
	Random,
	/// Each value equals its index.
	Index,
	/// All ones.
	Ones,
}

/// The element type to sum.
#[derive(clap::ValueEnum, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Precision {
	#[default]
	F64,
	F32,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BenchConfig {
	pub vals_len: u64,
	pub nloops: u32,
	pub variant: Variant,
	pub precision: Precision,
	pub fill: Fill,
	pub seed: u64,
	pub work_group_size: u32,
}

impl Default for BenchConfig {
	fn default() -> Self {
		Self {
			vals_len: 1 << 22,
			nloops: 1,
			variant: Variant::default(),
			precision: Precision::default(),
			fill: Fill::default(),
			seed: 8,
			work_group_size: 256,
		}
	}
}

/// The result of one benchmark run.
#[derive(Clone, Debug, PartialEq)]
pub struct Report {
	/// Mean wall-clock time of one timed loop iteration.
	pub elapsed: Duration,
	/// Input bytes per second, in GB/s.
	pub bandwidth: f64,
	pub sum_host: f64,
	pub sum_device: f64,
	pub relative_error: f64,
	/// Passes issued per reduction.
	pub passes: u64,
}

impl fmt::Display for Report {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		writeln!(f, "{:.6} s", self.elapsed.as_secs_f64())?;
		writeln!(f, "{:.6} GB/s", self.bandwidth)?;
		writeln!(f, "Sum CPU: {:e}", self.sum_host)?;
		writeln!(f, "Sum GPU: {:e}", self.sum_device)?;
		write!(f, "Relative Error: {:e}", self.relative_error)
	}
}

/// The error type that can be returned by [`run`].
#[derive(thiserror::Error, Debug)]
pub enum Error {
	#[error("At least one loop is required")]
	NoLoops,
	#[error("Failed to allocate host memory for the values")]
	HostAllocation(#[from] TryReserveError),
	#[error("Failed to allocate device memory")]
	DeviceAllocation(#[from] vk::Validated<vk::AllocateBufferError>),
	#[error("The device rejected a buffer transfer: {0}")]
	Transfer(#[from] Box<vk::ValidationError>),
	#[error(transparent)]
	HostAccess(#[from] vk::HostAccessError),
	#[error(transparent)]
	Reduce(#[from] reduce::Error),
	#[error(transparent)]
	Context(#[from] context::Error),
}

/// Runs `config.nloops` timed reductions on the context’s device at the
/// configured precision and checks the result against a host sum.
pub fn run(context: &Context, config: &BenchConfig) -> Result<Report, Error> {
	match config.precision {
		Precision::F64 => run_typed::<f64>(context, config),
		Precision::F32 => run_typed::<f32>(context, config),
	}
}

/// Like [`run`], but for an explicit element type.
///
/// The full variant times every pass of every loop including the readback
/// of the final value. The single variant times only its one pass per loop;
/// the readback happens afterwards.
pub fn run_typed<T: Element>(context: &Context, config: &BenchConfig) -> Result<Report, Error> {
	if config.nloops == 0 {
		return Err(Error::NoLoops);
	}
	if config.vals_len == 0 {
		return Err(reduce::Error::ValsEmpty.into());
	}

	tracing::info!(
		device = context.device_name(),
		vals_len = config.vals_len,
		nloops = config.nloops,
		variant = ?config.variant,
		precision = ?config.precision,
		fill = ?config.fill,
		"running reduction benchmark"
	);

	let reduction = Reduction::<T>::new(
		context.descriptor_set_allocator.clone(),
		config.work_group_size,
	)?;
	reduction.check_vals_len(config.vals_len)?;

	let vals = host_vals::<T>(config)?;
	let vals_buffer = upload(context, &vals)?;

	let partials_len = reduction.partials_buffer_len(config.vals_len);
	let partials_buffers = [
		device_buffer::<T>(context, partials_len)?,
		device_buffer::<T>(context, partials_len)?,
	];

	let plan = reduction.plan(vals_buffer, partials_buffers, config.variant.strategy())?;
	let outcome = plan.outcome();
	tracing::info!(
		passes = outcome.passes,
		final_len = outcome.len,
		"planned reduction"
	);

	let readback_buffer = vk::Buffer::new_slice::<T>(
		context.memory_allocator.clone(),
		vk::BufferCreateInfo {
			usage: vk::BufferUsage::TRANSFER_DST,
			..Default::default()
		},
		vk::AllocationCreateInfo {
			memory_type_filter: vk::MemoryTypeFilter::PREFER_HOST
				| vk::MemoryTypeFilter::HOST_RANDOM_ACCESS,
			..Default::default()
		},
		outcome.len,
	)?;
	let readback = || {
		vk::CopyBufferInfo::buffers(plan.final_partials().clone(), readback_buffer.clone())
	};

	let tic = Instant::now();
	let mut command_buffer_builder = context.command_buffer_builder()?;
	for _ in 0..config.nloops {
		plan.record(&mut command_buffer_builder)?;
		if config.variant == Variant::Full {
			command_buffer_builder.copy_buffer(readback())?;
		}
	}
	context.submit_and_wait(command_buffer_builder)?;
	let elapsed = tic.elapsed() / config.nloops;

	if config.variant == Variant::Single {
		let mut command_buffer_builder = context.command_buffer_builder()?;
		command_buffer_builder.copy_buffer(readback())?;
		context.submit_and_wait(command_buffer_builder)?;
	}

	let sum_device = host_sum(&readback_buffer.read()?[..]).to_f64();
	let sum_host = host_sum(&vals[..]).to_f64();

	let bytes = config.vals_len as f64 * size_of::<T>() as f64;
	Ok(Report {
		elapsed,
		bandwidth: bytes / 1e9 / elapsed.as_secs_f64(),
		sum_host,
		sum_device,
		relative_error: relative_error(sum_host, sum_device),
		passes: outcome.passes,
	})
}

/// Copies `vals` into a new device-local storage buffer through a
/// host-visible staging buffer, and waits for the copy to finish.
fn upload<T: Element>(context: &Context, vals: &[T]) -> Result<vk::Subbuffer<[T]>, Error> {
	let staging_buffer = vk::Buffer::from_iter(
		context.memory_allocator.clone(),
		vk::BufferCreateInfo {
			usage: vk::BufferUsage::TRANSFER_SRC,
			..Default::default()
		},
		vk::AllocationCreateInfo {
			memory_type_filter: vk::MemoryTypeFilter::PREFER_HOST
				| vk::MemoryTypeFilter::HOST_SEQUENTIAL_WRITE,
			..Default::default()
		},
		vals.iter().copied(),
	)?;

	let vals_buffer = vk::Buffer::new_slice::<T>(
		context.memory_allocator.clone(),
		vk::BufferCreateInfo {
			usage: vk::BufferUsage::STORAGE_BUFFER
				| vk::BufferUsage::TRANSFER_SRC
				| vk::BufferUsage::TRANSFER_DST,
			..Default::default()
		},
		vk::AllocationCreateInfo {
			memory_type_filter: vk::MemoryTypeFilter::PREFER_DEVICE,
			..Default::default()
		},
		vals.len() as u64,
	)?;

	let mut command_buffer_builder = context.command_buffer_builder()?;
	command_buffer_builder.copy_buffer(vk::CopyBufferInfo::buffers(
		staging_buffer,
		vals_buffer.clone(),
	))?;
	context.submit_and_wait(command_buffer_builder)?;

	Ok(vals_buffer)
}

fn device_buffer<T: Element>(context: &Context, len: u64) -> Result<vk::Subbuffer<[T]>, Error> {
	Ok(vk::Buffer::new_slice::<T>(
		context.memory_allocator.clone(),
		vk::BufferCreateInfo {
			usage: vk::BufferUsage::STORAGE_BUFFER | vk::BufferUsage::TRANSFER_SRC,
			..Default::default()
		},
		vk::AllocationCreateInfo {
			memory_type_filter: vk::MemoryTypeFilter::PREFER_DEVICE,
			..Default::default()
		},
		len,
	)?)
}

fn host_vals<T: Element>(config: &BenchConfig) -> Result<Vec<T>, Error> {
	let len = config.vals_len as usize;
	let mut vals = Vec::new();
	vals.try_reserve_exact(len)?;

	match config.fill {
		Fill::Random => {
			let mut rng = StdRng::seed_from_u64(config.seed);
			vals.extend((0..len).map(|_| T::from_f64(rng.r#gen::<f64>())));
		}
		Fill::Index => vals.extend((0..len).map(|i| T::from_f64(i as f64))),
		Fill::Ones => vals.extend(std::iter::repeat_n(T::from_f64(1.0), len)),
	}

	Ok(vals)
}
