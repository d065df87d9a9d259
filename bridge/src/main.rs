use clap::Parser as ClapParser;
use std::{process, thread};

use bridge::workload::{Workload, churn};
use bridge::{HeapSettings, Runtime, RuntimeSettings, SharedRuntime};

#[derive(ClapParser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Size of one semispace in KiB
    #[arg(long, default_value_t = 4096)]
    space_kib: usize,

    /// Initial handle table capacity
    #[arg(long, default_value_t = 256)]
    handle_capacity: usize,

    /// Objects each worker hands to native code per round
    #[arg(long, default_value_t = 10_000)]
    objects: usize,

    /// Force a collection after this many objects (0 = only when full)
    #[arg(long, default_value_t = 1_000)]
    collect_every: usize,

    /// Rounds each worker runs
    #[arg(long, default_value_t = 4)]
    rounds: usize,

    /// Workers sharing one runtime behind a lock
    #[arg(long, default_value_t = 1)]
    threads: usize,

    #[arg(long, default_value_t = 0x5EED)]
    seed: u64,
}

fn run_worker(runtime: SharedRuntime, worker: usize, cli: &Cli) -> bridge::Result<usize> {
    let mut checked = 0;
    for round in 0..cli.rounds {
        let workload = Workload {
            objects: cli.objects,
            collect_every: cli.collect_every,
            seed: cli.seed ^ ((worker as u64) << 32) ^ round as u64,
        };
        // one round is one mutator critical section
        let report = churn(&mut runtime.lock(), &workload)?;
        checked += report.handles_checked;
        log::info!("worker {worker}: round {round} done, {report:?}");
    }
    Ok(checked)
}

fn main() {
    env_logger::init();
    let cli = Cli::parse();

    let settings = RuntimeSettings {
        heap: HeapSettings {
            space_size: cli.space_kib * 1024,
        },
        handle_capacity: cli.handle_capacity,
    };
    let runtime = match Runtime::new(settings) {
        Ok(runtime) => runtime.into_shared(),
        Err(err) => {
            eprintln!("Error creating runtime: {err}");
            process::exit(1);
        }
    };

    let results: Vec<_> = thread::scope(|scope| {
        let workers: Vec<_> = (0..cli.threads.max(1))
            .map(|worker| {
                let runtime = runtime.clone();
                let cli = &cli;
                scope.spawn(move || run_worker(runtime, worker, cli))
            })
            .collect();
        workers.into_iter().map(|w| w.join()).collect()
    });

    let mut checked = 0;
    for result in results {
        match result {
            Ok(Ok(n)) => checked += n,
            Ok(Err(err)) => {
                eprintln!("Error: {err}");
                process::exit(1);
            }
            Err(_) => {
                eprintln!("Error: worker panicked");
                process::exit(2);
            }
        }
    }

    let runtime = runtime.lock();
    let gc = runtime.gc_stats();
    let handles = runtime.handle_stats();
    println!("handles checked:   {checked}");
    println!("collections:       {}", gc.cycles);
    println!("objects copied:    {}", gc.objects_copied);
    println!("bytes reclaimed:   {}", gc.bytes_reclaimed);
    println!("handles created:   {}", handles.created);
    println!("handles disposed:  {}", handles.disposed);
    println!("live handles:      {}", handles.live);
    println!("table capacity:    {} ({} growths)", handles.capacity, handles.growths);
}
