mod args;

use std::process;
use std::thread;
use std::time::{Duration, Instant};

use clap::Parser;
#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};
use steady_scheduler::{Actor, ActorHandle, SchedulerBuilder, StepResult};

use crate::args::Args;

/// Burns a fixed slice of CPU on every step and always reports progress.
struct BusyActor {
    name: String,
    work: Duration,
}

impl BusyActor {
    fn new(index: usize, work: Duration) -> Self {
        BusyActor { name: format!("busy-{}", index), work }
    }
}

impl Actor for BusyActor {
    fn step(&mut self) -> StepResult {
        let start = Instant::now();
        while start.elapsed() < self.work {
            std::hint::spin_loop();
        }
        Ok(true)
    }

    fn name(&self) -> &str {
        &self.name
    }
}

fn main() {
    let opt = Args::parse();
    if let Err(e) = steady_scheduler::init_logging(&opt.loglevel) {
        //do not use logger to report logger could not start
        eprint!("Warning: Logger initialization failed with {:?}. There will be no logging.", e);
    }

    if let Err(e) = run(&opt) {
        error!("{}", e);
        process::exit(1);
    }
}

fn run(opt: &Args) -> steady_scheduler::Result<()> {
    let scheduler = SchedulerBuilder::new()
        .thread_count(opt.threads)
        .imbalance_threshold(opt.imbalance)
        .initial_backoff(Duration::from_millis(100))
        .max_backoff(Duration::from_secs(1))
        .build()?;

    // everything starts on runner 0 so the balancer has work to do
    let handles = (0..opt.actors)
        .map(|i| {
            let work = Duration::from_micros(50 + 25 * (i % 4) as u64);
            scheduler.schedule_on(0, BusyActor::new(i, work))
        })
        .collect::<steady_scheduler::Result<Vec<ActorHandle>>>()?;
    info!("scheduled {} actors on runner 0", handles.len());

    let end = Instant::now() + Duration::from_secs(opt.run_seconds);
    loop {
        let now = Instant::now();
        if now >= end {
            break;
        }
        thread::sleep((end - now).min(Duration::from_secs(1)));
        info!("{}", scheduler);
    }

    handles.iter().for_each(|h| h.cancel());
    scheduler.close();
    let steps: u64 = handles.iter().map(|h| h.invocation_count()).sum();
    info!("{} steps across {} actors, {} migrations", steps, handles.len(), scheduler.migrations());
    Ok(())
}
