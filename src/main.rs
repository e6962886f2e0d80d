//! Sums `N` values on a Vulkan device `NLOOPS` times and reports the mean
//! time per reduction, the achieved bandwidth and the error against a host
//! sum.
//!
//! ```text
//! vulkano-reduce 4194304 10000
//! vulkano-reduce 33554432 100 --precision f32 --variant single
//! ```

use anyhow::{Context as _, Result};
use clap::Parser;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use vulkano_reduce::{
	bench::{self, BenchConfig, Fill, Precision},
	context::Context,
	schedule::Variant,
};

#[derive(Parser, Debug)]
#[command(name = "vulkano-reduce", version)]
#[command(about = "Multi-pass parallel sum reduction on a Vulkan device")]
struct Args {
	/// Number of values to sum
	#[arg(value_parser = clap::value_parser!(u64).range(1..=u32::MAX as u64))]
	n: u64,

	/// Number of timed reductions
	#[arg(value_parser = clap::value_parser!(u32).range(1..))]
	nloops: u32,

	/// Reduce on the device down to one value, or once and finish on the host
	#[arg(long, value_enum, default_value_t)]
	variant: Variant,

	/// Element type
	#[arg(long, value_enum, default_value_t)]
	precision: Precision,

	/// Initial values
	#[arg(long, value_enum, default_value_t)]
	fill: Fill,

	/// Seed for `--fill random`
	#[arg(long, default_value_t = 8)]
	seed: u64,

	/// Work group size; must be a power of two
	#[arg(long, default_value_t = 256, value_parser = parse_work_group_size)]
	work_group_size: u32,

	/// Index of the physical device to use (default: first with a compute queue)
	#[arg(long)]
	device: Option<usize>,
}

fn parse_work_group_size(s: &str) -> Result<u32, String> {
	let size: u32 = s.parse().map_err(|e| e.to_string())?;
	if !size.is_power_of_two() {
		return Err(format!("{size} is not a power of two"));
	}
	Ok(size)
}

impl Args {
	fn bench_config(&self) -> BenchConfig {
		BenchConfig {
			vals_len: self.n,
			nloops: self.nloops,
			variant: self.variant,
			precision: self.precision,
			fill: self.fill,
			seed: self.seed,
			work_group_size: self.work_group_size,
		}
	}
}

fn main() -> Result<()> {
	tracing_subscriber::registry()
		.with(fmt::layer().with_writer(std::io::stderr))
		.with(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
		.init();

	let args = Args::parse();

	let context = Context::new(args.device).context("failed to initialise Vulkan")?;
	let report = bench::run(&context, &args.bench_config())?;
	println!("{report}");

	Ok(())
}
