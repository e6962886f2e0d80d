use std::{fmt, ops::Add, sync::Arc};

mod vk {
	pub(super) use vulkano::buffer::BufferContents;
	pub(super) use vulkano::device::Device;
	pub(super) use vulkano::shader::ShaderModule;
	pub(super) use vulkano::{Validated, VulkanError as Error};
}

mod f32_shader {
	vulkano_shaders::shader! {
		ty: "compute",
		path: "src/shaders/reduction.comp",
		define: [("ELEM", "float")],
		vulkan_version: "1.3",
		spirv_version: "1.3",
	}
}

mod f64_shader {
	vulkano_shaders::shader! {
		ty: "compute",
		path: "src/shaders/reduction.comp",
		define: [("ELEM", "double")],
		vulkan_version: "1.3",
		spirv_version: "1.3",
	}
}

/// A floating-point type that can be summed by [`Reduction`].
///
/// `Default::default()` must be the additive identity.
///
/// [`Reduction`]: crate::reduce::Reduction
pub trait Element:
	vk::BufferContents
	+ Copy
	+ Default
	+ PartialEq
	+ Add<Output = Self>
	+ fmt::Debug
	+ Send
	+ Sync
	+ 'static
{
	/// Whether the reduction shader needs the `shader_float64` device feature.
	const NEEDS_FLOAT64: bool;

	fn from_f64(val: f64) -> Self;

	fn to_f64(self) -> f64;

	/// Loads the reduction shader specialized for this type.
	fn load_shader(
		device: Arc<vk::Device>,
	) -> Result<Arc<vk::ShaderModule>, vk::Validated<vk::Error>>;
}

impl Element for f32 {
	const NEEDS_FLOAT64: bool = false;

	fn from_f64(val: f64) -> Self {
		val as f32
	}

	fn to_f64(self) -> f64 {
		self as f64
	}

	fn load_shader(
		device: Arc<vk::Device>,
	) -> Result<Arc<vk::ShaderModule>, vk::Validated<vk::Error>> {
		f32_shader::load(device)
	}
}

impl Element for f64 {
	const NEEDS_FLOAT64: bool = true;

	fn from_f64(val: f64) -> Self {
		val
	}

	fn to_f64(self) -> f64 {
		self
	}

	fn load_shader(
		device: Arc<vk::Device>,
	) -> Result<Arc<vk::ShaderModule>, vk::Validated<vk::Error>> {
		f64_shader::load(device)
	}
}
