//! Benchmark commands: measure hook dispatch alone, or parsing plus
//! dispatch, over the complete input.

use std::fs::File;
use std::io::Read;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use anyhow::Context;

use logtap_runtime::{RecordHandle, Sandbox};
use logtap_types::{Parser, Record};

const MIN_BENCH_TIME: Duration = Duration::from_secs(3);

/// What the benchmark loop repeats per iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Input is parsed once up front; iterations only dispatch hooks.
    ScriptOnly,
    /// Every iteration re-parses the input before dispatching.
    FullPipeline,
}

pub async fn execute(script: PathBuf, file: PathBuf, mode: Mode) -> anyhow::Result<()> {
    let sandbox = Sandbox::new();
    {
        let sandbox = sandbox.clone();
        let script = script.clone();
        tokio::task::spawn_blocking(move || sandbox.init(&script))
            .await?
            .context("failed to initialize sandbox")?;
    }

    let mut data = Vec::new();
    File::open(&file)
        .with_context(|| format!("failed to open input file {}", file.display()))?
        .read_to_end(&mut data)
        .context("failed to read input")?;

    let outcome = {
        let sandbox = sandbox.clone();
        tokio::task::spawn_blocking(move || run_bench(&sandbox, &data, mode)).await?
    };
    tokio::task::spawn_blocking(move || sandbox.close()).await?;

    let report = outcome?;
    report.print();
    Ok(())
}

struct Report {
    iterations: u64,
    logs_per_iteration: u64,
    bytes_per_iteration: u64,
    elapsed: Duration,
}

impl Report {
    fn print(&self) {
        let total_logs = self.iterations * self.logs_per_iteration;
        let seconds = self.elapsed.as_secs_f64();
        let logs_per_sec = total_logs as f64 / seconds;
        let mb_per_sec =
            (self.iterations * self.bytes_per_iteration) as f64 / 1_000_000.0 / seconds;
        let per_iter = self.elapsed / u32::try_from(self.iterations).unwrap_or(u32::MAX);

        eprintln!();
        eprintln!("{:>30}", "Benchmark results");
        eprintln!("{:>30}", "-----------------");
        eprintln!("{:>20}\titerations", self.iterations);
        eprintln!("{:>20}\tlogs", total_logs);
        eprintln!("{:>20.1}\tsec", seconds);
        eprintln!("{:>20}\tlogs/iter", self.logs_per_iteration);
        eprintln!("{:>20?}\ttime/iter", per_iter);
        eprintln!("{:>20.1}\tlogs/sec", logs_per_sec);
        eprintln!("{:>20.1}\tprocessed_MB/sec", mb_per_sec);
        eprintln!();
    }
}

fn run_bench(sandbox: &Sandbox, data: &[u8], mode: Mode) -> anyhow::Result<Report> {
    let mut parser = Parser::new();
    let mut records: Vec<Record> = Vec::new();
    parser.parse(data, &mut records);
    let logs_per_iteration = records.len() as u64;

    let handles: Vec<RecordHandle> = records.into_iter().map(RecordHandle::new).collect();

    let started = Instant::now();
    let mut iterations: u64 = 0;
    match mode {
        Mode::ScriptOnly => {
            while started.elapsed() < MIN_BENCH_TIME {
                for handle in &handles {
                    sandbox.call_on_log(handle)?;
                }
                iterations += 1;
            }
        }
        Mode::FullPipeline => {
            let mut scratch: Vec<Record> = Vec::new();
            while started.elapsed() < MIN_BENCH_TIME {
                let mut parser = Parser::new();
                parser.parse(data, &mut scratch);
                for record in scratch.drain(..) {
                    sandbox.call_on_log(&RecordHandle::new(record))?;
                }
                iterations += 1;
            }
        }
    }

    Ok(Report {
        iterations: iterations.max(1),
        logs_per_iteration,
        bytes_per_iteration: data.len() as u64,
        elapsed: started.elapsed(),
    })
}
