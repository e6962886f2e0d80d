use std::{marker::PhantomData, sync::Arc};

mod vk {
	pub(super) use vulkano::buffer::Subbuffer;
	pub(super) use vulkano::command_buffer::AutoCommandBufferBuilder;
	pub(super) use vulkano::descriptor_set::{
		DescriptorSet, WriteDescriptorSet, allocator::DescriptorSetAllocator,
	};
	pub(super) use vulkano::pipeline::{
		ComputePipeline, PipelineBindPoint, PipelineLayout, PipelineShaderStageCreateInfo,
		compute::ComputePipelineCreateInfo, layout::PipelineDescriptorSetLayoutCreateInfo,
	};
	pub(super) use vulkano::shader::SpecializationConstant;
	pub(super) use vulkano::{Validated, ValidationError, VulkanError as Error};
}
use vulkano::{device::DeviceOwned as _, pipeline::Pipeline as _};

use crate::{
	element::Element,
	schedule::{self, Outcome, PassDescriptor, PassInvoker, ReductionStrategy, Slot},
	util::ParallelReduceExt,
};

/// A compute kernel that sums an array of floating-point values in one or
/// more passes, ping-ponging partial sums between two buffers.
pub struct Reduction<T: Element> {
	descriptor_set_allocator: Arc<dyn vk::DescriptorSetAllocator>,
	pipeline: Arc<vk::ComputePipeline>,
	work_group_size: u32,
	max_group_count: u64,
	_element: PhantomData<fn() -> T>,
}

/// The error type that can be returned by [`Reduction`]’s methods.
#[derive(thiserror::Error, Debug)]
pub enum Error {
	#[error("The values buffer is empty")]
	ValsEmpty,
	#[error("The values buffer has too many values for a single reduction")]
	TooManyVals,
	#[error("A partials buffer has invalid length")]
	InvalidPartialsLength,
	#[error("Invalid work group size {0}: must be a power of two within the device limits")]
	InvalidWorkGroupSize(u32),
	#[error("The device does not support 64-bit floats in shaders")]
	Float64Unsupported,
	#[error("The device rejected the reduction: {0}")]
	Dispatch(#[from] Box<vk::ValidationError>),
	#[error(transparent)]
	Vulkan(#[from] vk::Error),
}

impl From<vk::Validated<vk::Error>> for Error {
	fn from(e: vk::Validated<vk::Error>) -> Self {
		match e {
			vk::Validated::Error(e) => Self::Vulkan(e),
			vk::Validated::ValidationError(e) => Self::Dispatch(e),
		}
	}
}

impl<T: Element> Reduction<T> {
	/// Constructs a new instance of [`Reduction`] with the given work group
	/// size, which must be a power of two.
	pub fn new(
		descriptor_set_allocator: Arc<dyn vk::DescriptorSetAllocator>,
		work_group_size: u32,
	) -> Result<Self, Error> {
		let device = descriptor_set_allocator.device();
		let properties = device.physical_device().properties();

		let shared_memory_size = work_group_size as u64 * size_of::<T>() as u64;
		if !work_group_size.is_power_of_two()
			|| work_group_size > properties.max_compute_work_group_size[0]
			|| work_group_size > properties.max_compute_work_group_invocations
			|| shared_memory_size > properties.max_compute_shared_memory_size as u64
		{
			return Err(Error::InvalidWorkGroupSize(work_group_size));
		}

		if T::NEEDS_FLOAT64 && !device.enabled_features().shader_float64 {
			return Err(Error::Float64Unsupported);
		}

		let shader = T::load_shader(device.clone())?;
		let specialized_shader = shader.specialize({
			use foldhash::HashMapExt as _;
			let mut constants = foldhash::HashMap::new();
			constants.insert(0, vk::SpecializationConstant::U32(work_group_size));
			constants
		})?;
		let entry_point = specialized_shader.entry_point("main").unwrap();

		let stage = vk::PipelineShaderStageCreateInfo::new(entry_point);
		let layout = vk::PipelineLayout::new(
			device.clone(),
			vk::PipelineDescriptorSetLayoutCreateInfo::from_stages([&stage])
				.into_pipeline_layout_create_info(device.clone())
				.map_err(|e| e.error)?,
		)?;

		let pipeline = vk::ComputePipeline::new(
			device.clone(),
			None,
			vk::ComputePipelineCreateInfo::stage_layout(stage, layout),
		)?;

		Ok(Self {
			max_group_count: properties.max_compute_work_group_count[0] as u64,
			descriptor_set_allocator,
			pipeline,
			work_group_size,
			_element: PhantomData,
		})
	}

	pub fn work_group_size(&self) -> u32 {
		self.work_group_size
	}

	/// Returns the required length of each of the two partials buffers for
	/// the given input values length.
	pub fn partials_buffer_len(&self, vals_len: u64) -> u64 {
		ParallelReduceExt::partials_buffer_len(self, vals_len)
	}

	/// Checks that `vals_len` values can be reduced on this device: the first
	/// pass must fit the work group count limit, and the kernel indexes
	/// values with 32-bit integers.
	pub fn check_vals_len(&self, vals_len: u64) -> Result<(), Error> {
		if vals_len == 0 {
			return Err(Error::ValsEmpty);
		}
		if !self.fits_u32_indexing(vals_len) || self.group_count(vals_len) > self.max_group_count {
			return Err(Error::TooManyVals);
		}
		Ok(())
	}

	/// Plans the passes `strategy` needs to reduce `vals_buffer`, binding each
	/// pass to its source and destination buffers.
	///
	/// The number of values is derived from the length of `vals_buffer`, so it
	/// must be sized exactly. `partials_buffers` are allowed to be larger than
	/// strictly necessary. Nothing is recorded yet; see
	/// [`ReductionPlan::record`].
	pub fn plan<S>(
		&self,
		vals_buffer: vk::Subbuffer<[T]>,
		partials_buffers: [vk::Subbuffer<[T]>; 2],
		strategy: &S,
	) -> Result<ReductionPlan<T>, Error>
	where
		S: ReductionStrategy + ?Sized,
	{
		let vals_len = vals_buffer.len();
		self.check_vals_len(vals_len)?;

		let min_partials_len = self.partials_buffer_len(vals_len);
		if partials_buffers.iter().any(|b| b.len() < min_partials_len) {
			return Err(Error::InvalidPartialsLength);
		}

		let mut binder = PassBinder {
			reduction: self,
			vals_buffer: &vals_buffer,
			partials_buffers: &partials_buffers,
			dispatches: Vec::new(),
		};
		let outcome = schedule::schedule(
			strategy,
			self.work_group_size as u64,
			Self::FAN_IN,
			vals_len,
			&mut binder,
		)?;
		let dispatches = binder.dispatches;
		debug_assert_eq!(dispatches.len() as u64, outcome.passes);

		let final_partials = match outcome.slot {
			Slot::Input => vals_buffer,
			Slot::Partials(i) => partials_buffers[i].clone(),
		}
		.slice(..outcome.len);

		Ok(ReductionPlan {
			pipeline: self.pipeline.clone(),
			dispatches,
			outcome,
			final_partials,
		})
	}

	/// Plans and records the reduction onto the given command buffer
	/// (multiple passes if `strategy` asks for them).
	///
	/// Returns the plan, whose [`final_partials`] hold the partial sums left
	/// for the host after execution.
	///
	/// [`final_partials`]: ReductionPlan::final_partials
	pub fn record<L, S>(
		&self,
		command_buffer_builder: &mut vk::AutoCommandBufferBuilder<L>,
		vals_buffer: vk::Subbuffer<[T]>,
		partials_buffers: [vk::Subbuffer<[T]>; 2],
		strategy: &S,
	) -> Result<ReductionPlan<T>, Error>
	where
		S: ReductionStrategy + ?Sized,
	{
		assert_eq!(
			command_buffer_builder.device(),
			self.descriptor_set_allocator.device()
		);

		let plan = self.plan(vals_buffer, partials_buffers, strategy)?;
		plan.record(command_buffer_builder)?;
		Ok(plan)
	}
}

impl<T: Element> ParallelReduceExt for Reduction<T> {
	const FAN_IN: u64 = 8;

	fn work_group_size(&self) -> u64 {
		self.work_group_size as u64
	}
}

/// Binds each scheduled pass to a descriptor set.
struct PassBinder<'a, T: Element> {
	reduction: &'a Reduction<T>,
	vals_buffer: &'a vk::Subbuffer<[T]>,
	partials_buffers: &'a [vk::Subbuffer<[T]>; 2],
	dispatches: Vec<Dispatch>,
}

impl<T: Element> PassInvoker for PassBinder<'_, T> {
	type Error = Error;

	fn invoke(&mut self, pass: &PassDescriptor) -> Result<(), Error> {
		let source = match pass.source {
			Slot::Input => self.vals_buffer,
			Slot::Partials(i) => &self.partials_buffers[i],
		};
		let destination = &self.partials_buffers[pass.destination];

		let pipeline = &self.reduction.pipeline;
		let descriptor_set = vk::DescriptorSet::new(
			self.reduction.descriptor_set_allocator.clone(),
			pipeline.layout().set_layouts()[0].clone(),
			[
				vk::WriteDescriptorSet::buffer(0, source.clone().slice(..pass.source_len)),
				vk::WriteDescriptorSet::buffer(
					1,
					destination.clone().slice(..pass.group_count),
				),
			],
			[],
		)?;

		self.dispatches.push(Dispatch {
			num_work_groups: pass.group_count as u32,
			vals_len: pass.source_len as u32,
			descriptor_set,
		});
		Ok(())
	}
}

struct Dispatch {
	num_work_groups: u32,
	vals_len: u32,
	descriptor_set: Arc<vk::DescriptorSet>,
}

/// The passes of one reduction, bound to their buffers and ready to be
/// recorded any number of times.
pub struct ReductionPlan<T: Element> {
	pipeline: Arc<vk::ComputePipeline>,
	dispatches: Vec<Dispatch>,
	outcome: Outcome,
	final_partials: vk::Subbuffer<[T]>,
}

impl<T: Element> ReductionPlan<T> {
	/// Returns where the final partial sums end up, and how many passes it
	/// takes to get them there.
	pub fn outcome(&self) -> Outcome {
		self.outcome
	}

	/// Returns the slice of the values or partials buffer holding the final
	/// partial sums after execution. Its length is `outcome().len`.
	pub fn final_partials(&self) -> &vk::Subbuffer<[T]> {
		&self.final_partials
	}

	/// Records the planned passes onto the given command buffer, in order.
	/// Does nothing if no passes were needed.
	pub fn record<L>(
		&self,
		command_buffer_builder: &mut vk::AutoCommandBufferBuilder<L>,
	) -> Result<(), Error> {
		if self.dispatches.is_empty() {
			return Ok(());
		}

		command_buffer_builder.bind_pipeline_compute(self.pipeline.clone())?;
		for dispatch in &self.dispatches {
			command_buffer_builder
				.bind_descriptor_sets(
					vk::PipelineBindPoint::Compute,
					self.pipeline.layout().clone(),
					0,
					dispatch.descriptor_set.clone(),
				)?
				.push_constants(self.pipeline.layout().clone(), 0, dispatch.vals_len)?;
			unsafe { command_buffer_builder.dispatch([dispatch.num_work_groups, 1, 1]) }?;
		}

		Ok(())
	}
}
