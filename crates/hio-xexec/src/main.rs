mod cli;
mod pattern;

use std::process::ExitCode;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use clap::Parser;
use log::{error, info, LevelFilter};

use hio_backend_posix::PosixFactory;
use hio_core::local::{local_endpoints, LocalEndpoint};
use hio_core::types::{DatasetFlags, DatasetMode};
use hio_core::{Context, HioResult};

use cli::{parse_size, CliArgs};

fn main() -> ExitCode {
    let args = CliArgs::parse();

    let level = match args.verbose {
        0 => LevelFilter::Warn,
        1 => LevelFilter::Info,
        2 | 3 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };
    env_logger::Builder::new().filter_level(level).init();

    let failures = Arc::new(AtomicUsize::new(0));
    let handles: Vec<_> = local_endpoints(args.ranks, args.ranks_per_node.max(1))
        .into_iter()
        .map(|endpoint| {
            let args = args.clone();
            let failures = Arc::clone(&failures);
            std::thread::spawn(move || {
                if let Err(e) = run_rank(endpoint, &args, &failures) {
                    eprintln!("ERROR: rank failed: {e}");
                    failures.fetch_add(1, Ordering::Relaxed);
                }
            })
        })
        .collect();
    for handle in handles {
        let _ = handle.join();
    }

    let total = failures.load(Ordering::Relaxed);
    if total > 0 {
        eprintln!("xexec: {total} failures");
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}

fn run_rank(endpoint: LocalEndpoint, args: &CliArgs, failures: &AtomicUsize) -> HioResult<()> {
    let ctx = Context::builder(&args.name)
        .world_comm(Arc::new(endpoint.world))
        .node_comm(Arc::new(endpoint.node))
        .factory(Arc::new(PosixFactory::default()))
        .set("data_roots", &args.data_roots)?
        .set("dataset_file_mode", &args.file_mode)?
        .set("dataset_block_size", &parse_size(&args.block_size).to_string())?
        .set("dataset_buffer_size", &parse_size(&args.buffer_size).to_string())?
        .set("verbose", &args.verbose.to_string())?
        .build()?;

    let mode = DatasetMode::parse(&args.mode)?;
    let write_size = parse_size(&args.write_size) as usize;
    let rank = ctx.rank();
    // in shared mode every rank writes its own slice of each element
    let offset = |r: i32| match mode {
        DatasetMode::Shared => r as u64 * write_size as u64,
        DatasetMode::Unique => 0,
    };

    // write phase
    let mut ds = ctx.dataset_alloc(
        &args.dataset,
        args.id,
        DatasetFlags::WRITE | DatasetFlags::CREATE | DatasetFlags::TRUNCATE,
        mode,
    )?;
    ctx.dataset_open(&mut ds)?;
    let mut buf = vec![0u8; write_size];
    for e in 0..args.elements {
        let elem = ctx.element_open(&mut ds, &format!("e{e}"))?;
        pattern::fill_pattern(&mut buf, rank, e);
        ctx.element_write(&mut ds, elem, offset(rank), &buf)?;
        ctx.element_close(&mut ds, elem)?;
    }
    ctx.dataset_close(&mut ds)?;
    info!(
        "rank {rank}: wrote {} bytes to {}::{}",
        ds.bytes_written(),
        ds.name(),
        ds.id()
    );
    ctx.dataset_free(ds)?;

    // read phase
    let mut ds = ctx.dataset_alloc(&args.dataset, args.id, DatasetFlags::READ, mode)?;
    ctx.dataset_open(&mut ds)?;
    for e in 0..args.elements {
        if args.quit_on_fail > 0 && failures.load(Ordering::Relaxed) >= args.quit_on_fail {
            break;
        }
        let elem = ctx.element_open(&mut ds, &format!("e{e}"))?;
        let mut readback = vec![0u8; write_size];
        let n = ctx.element_read(&mut ds, elem, offset(rank), &mut readback)?;

        let mut errors = pattern::verify_pattern(&readback, rank, e);
        if n as usize != write_size {
            errors += 1;
        }
        if errors > 0 {
            error!("rank {rank}: element e{e}: {errors} verification errors");
            failures.fetch_add(errors, Ordering::Relaxed);
        }
        ctx.element_close(&mut ds, elem)?;
    }
    ctx.dataset_close(&mut ds)?;
    info!("rank {rank}: read {} bytes back", ds.bytes_read());
    ctx.dataset_free(ds)?;

    ctx.comm().barrier()?;
    if rank == 0 && !args.keep {
        ctx.dataset_unlink(&args.dataset, args.id)?;
    }
    Ok(())
}
