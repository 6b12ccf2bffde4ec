use std::path::Path;
use std::time::Instant;
use JaggedCut::algorithms::{ExecutionPolicy, JaggedPartitioner, SearchPolicy};
use JaggedCut::gen_weights::gen_uniform_weights;
use JaggedCut::imbalance::imbalance;
use JaggedCut::io::{read_points_file, write_partition_data_to_file};
use JaggedCut::plan::PartitionPlan;
use JaggedCut::Partition;
use clap::Parser;

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Path of the points file (one point per line, whitespace-separated
    /// coordinates, optional trailing weight column with --weighted)
    points_filepath: String,

    /// Number of Partitions
    num_of_partitions: usize,

    /// Imbalance Tolerance
    imbalance_tolerance: f64,

    /// Filename where the partition mapping can be stored
    partition_file: String,

    /// Comma-separated per-level sub-part counts, overriding the total
    #[arg(short, long)]
    levels: Option<String>,

    /// Number of parts refined concurrently in one communication round
    #[arg(short, long, default_value_t = 16)]
    concurrent_parts: usize,

    /// Read a weight column after the coordinates
    #[arg(short, long, default_value_t = false)]
    weighted: bool,

    /// Keep points sharing a cut coordinate on one side of the cut
    #[arg(long, default_value_t = false)]
    rectilinear: bool,

    /// Run the thread tier sequentially
    #[arg(long, default_value_t = false)]
    sequential: bool,

    /// Classify points by linear scan instead of binary search
    #[arg(long, default_value_t = false)]
    linear_search: bool,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let args = Args::parse();

    let (points, weights) = read_points_file(Path::new(&args.points_filepath), args.weighted)?;
    let weights = weights.unwrap_or_else(|| gen_uniform_weights(points.len()));
    let plan = match &args.levels {
        Some(levels) => PartitionPlan::Explicit(
            levels
                .split(',')
                .map(|count| count.trim().parse::<usize>())
                .collect::<Result<_, _>>()?,
        ),
        None => PartitionPlan::TotalParts(args.num_of_partitions),
    };

    let num_of_partitions = plan.total_parts();
    let mut partition = vec![0; points.len()];
    let start = Instant::now();
    let metadata = JaggedPartitioner {
        plan,
        imbalance_tolerance: args.imbalance_tolerance,
        concurrent_part_count: args.concurrent_parts,
        allow_non_rectilinear: !args.rectilinear,
        execution: if args.sequential {
            ExecutionPolicy::Sequential
        } else {
            ExecutionPolicy::Parallel
        },
        search: if args.linear_search {
            SearchPolicy::Linear
        } else {
            SearchPolicy::Binary
        },
        ..Default::default()
    }
    .partition(&mut partition, (&points, weights.as_slice()))?;
    let elapsed_time = start.elapsed();

    let imbalance_of_partition = imbalance(num_of_partitions, &partition, &weights);
    write_partition_data_to_file(&partition, &args.partition_file)?;
    println!("Solver iterations {:?}", metadata.solver_iterations);
    println!("Collective rounds {:?}", metadata.collective_rounds);
    println!("Imbalance {:?}", imbalance_of_partition);
    println!("Execution time {:?}", elapsed_time);
    Ok(())
}
