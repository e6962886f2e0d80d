use std::sync::Arc;

mod vk {
	pub(super) use vulkano::command_buffer::{
		AutoCommandBufferBuilder, CommandBufferUsage, PrimaryAutoCommandBuffer,
		allocator::{StandardCommandBufferAllocator, StandardCommandBufferAllocatorCreateInfo},
	};
	pub(super) use vulkano::descriptor_set::allocator::StandardDescriptorSetAllocator;
	pub(super) use vulkano::device::{
		Device, DeviceCreateInfo, DeviceFeatures, Queue, QueueCreateInfo, QueueFlags,
		physical::PhysicalDevice,
	};
	pub(super) use vulkano::instance::{Instance, InstanceCreateFlags, InstanceCreateInfo};
	pub(super) use vulkano::library::{LoadingError, VulkanLibrary as Library};
	pub(super) use vulkano::memory::allocator::StandardMemoryAllocator;
	pub(super) use vulkano::{Validated, ValidationError, VulkanError as Error};
}
use vulkano::{command_buffer::PrimaryCommandBufferAbstract as _, sync::GpuFuture as _};

/// A Vulkan device with a compute queue and the allocators the reduction
/// needs.
pub struct Context {
	pub device: Arc<vk::Device>,
	pub queue: Arc<vk::Queue>,
	pub memory_allocator: Arc<vk::StandardMemoryAllocator>,
	pub descriptor_set_allocator: Arc<vk::StandardDescriptorSetAllocator>,
	pub command_buffer_allocator: Arc<vk::StandardCommandBufferAllocator>,
}

/// The error type that can be returned by [`Context`]’s methods.
#[derive(thiserror::Error, Debug)]
pub enum Error {
	#[error("Failed to load the Vulkan library")]
	Loading(#[from] vk::LoadingError),
	#[error("No Vulkan device with a compute queue was found")]
	NoDevice,
	#[error(transparent)]
	Validation(#[from] Box<vk::ValidationError>),
	#[error(transparent)]
	Vulkan(#[from] vk::Error),
}

impl From<vk::Validated<vk::Error>> for Error {
	fn from(e: vk::Validated<vk::Error>) -> Self {
		match e {
			vk::Validated::Error(e) => Self::Vulkan(e),
			vk::Validated::ValidationError(e) => Self::Validation(e),
		}
	}
}

impl Context {
	/// Creates a context on the physical device at `device_index`, or on the
	/// first device with a compute queue if `None`.
	pub fn new(device_index: Option<usize>) -> Result<Self, Error> {
		let library = vk::Library::new()?;
		let instance = vk::Instance::new(
			library,
			vk::InstanceCreateInfo {
				flags: vk::InstanceCreateFlags::ENUMERATE_PORTABILITY,
				..Default::default()
			},
		)?;

		let mut candidates = instance
			.enumerate_physical_devices()?
			.enumerate()
			.filter(|(i, _)| device_index.is_none_or(|index| index == *i))
			.filter_map(|(_, physical_device)| {
				let queue_family_index = compute_queue_family_index(&physical_device)?;
				Some((physical_device, queue_family_index))
			});
		let Some((physical_device, queue_family_index)) = candidates.next() else {
			return Err(Error::NoDevice);
		};

		let properties = physical_device.properties();
		let shader_float64 = physical_device.supported_features().shader_float64;
		tracing::info!(
			name = %properties.device_name,
			device_type = ?properties.device_type,
			api_version = %physical_device.api_version(),
			max_work_group_size = properties.max_compute_work_group_size[0],
			shader_float64,
			"selected Vulkan device"
		);

		let (device, mut queues) = vk::Device::new(
			physical_device.clone(),
			vk::DeviceCreateInfo {
				queue_create_infos: vec![vk::QueueCreateInfo {
					queue_family_index,
					..Default::default()
				}],
				enabled_features: vk::DeviceFeatures {
					shader_float64,
					..vk::DeviceFeatures::empty()
				},
				..Default::default()
			},
		)?;
		let queue = queues.next().ok_or(Error::NoDevice)?;

		let memory_allocator = Arc::new(vk::StandardMemoryAllocator::new_default(device.clone()));
		let descriptor_set_allocator = Arc::new(vk::StandardDescriptorSetAllocator::new(
			device.clone(),
			Default::default(),
		));
		let command_buffer_allocator = Arc::new(vk::StandardCommandBufferAllocator::new(
			device.clone(),
			vk::StandardCommandBufferAllocatorCreateInfo {
				secondary_buffer_count: 1,
				..Default::default()
			},
		));

		Ok(Self {
			device,
			queue,
			memory_allocator,
			descriptor_set_allocator,
			command_buffer_allocator,
		})
	}

	/// Returns the name of the underlying physical device.
	pub fn device_name(&self) -> &str {
		&self.device.physical_device().properties().device_name
	}

	/// Returns whether the device was created with 64-bit float support in
	/// shaders.
	pub fn supports_float64(&self) -> bool {
		self.device.enabled_features().shader_float64
	}

	/// Returns a new one-time-submit primary command buffer builder for this
	/// context’s queue.
	pub fn command_buffer_builder(
		&self,
	) -> Result<vk::AutoCommandBufferBuilder<vk::PrimaryAutoCommandBuffer>, Error> {
		Ok(vk::AutoCommandBufferBuilder::primary(
			self.command_buffer_allocator.clone(),
			self.queue.queue_family_index(),
			vk::CommandBufferUsage::OneTimeSubmit,
		)?)
	}

	/// Builds and submits the recorded commands, then blocks until the device
	/// has finished executing all of them.
	pub fn submit_and_wait(
		&self,
		command_buffer_builder: vk::AutoCommandBufferBuilder<vk::PrimaryAutoCommandBuffer>,
	) -> Result<(), Error> {
		command_buffer_builder
			.build()?
			.execute(self.queue.clone())?
			.then_signal_fence_and_flush()?
			.wait(None)?;

		Ok(())
	}
}

fn compute_queue_family_index(physical_device: &vk::PhysicalDevice) -> Option<u32> {
	physical_device
		.queue_family_properties()
		.iter()
		.position(|queue_family_properties| {
			queue_family_properties
				.queue_flags
				.contains(vk::QueueFlags::COMPUTE)
		})
		.map(|i| i as u32)
}
