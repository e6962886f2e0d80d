pub mod bench;
pub mod context;
pub mod element;
pub mod finish;
pub mod reduce;
pub mod schedule;
mod util;

pub use util::group_count;

#[cfg(test)]
mod vk {
	pub(super) use vulkano::command_buffer::{AutoCommandBufferBuilder, PrimaryAutoCommandBuffer};
}

/// Records commands with `record`, submits them and waits for completion,
/// then passes `record`’s result to `check`.
#[cfg(test)]
fn immediate_submit<R>(
	record: impl FnOnce(
		&context::Context,
		&mut vk::AutoCommandBufferBuilder<vk::PrimaryAutoCommandBuffer>,
	) -> R,
	check: impl FnOnce(R),
) {
	let context = context::Context::new(None).unwrap();

	let mut command_buffer_builder = context.command_buffer_builder().unwrap();

	let result = record(&context, &mut command_buffer_builder);

	context.submit_and_wait(command_buffer_builder).unwrap();

	check(result);
}
