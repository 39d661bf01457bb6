//! The `run` command: drive the pipeline with a script.

use std::fs::File;
use std::io::{BufReader, Read};
use std::path::PathBuf;

use anyhow::Context;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{error, info};

use logtap_engine::{pipeline, DirReader};
use logtap_runtime::Sandbox;

fn open_input(file: &PathBuf, dirs: &[PathBuf]) -> anyhow::Result<Box<dyn Read + Send>> {
    if dirs.is_empty() {
        let input = File::open(file)
            .with_context(|| format!("failed to open input file {}", file.display()))?;
        return Ok(Box::new(BufReader::new(input)));
    }

    let mut reader = DirReader::new().context("failed to create directory watcher")?;
    for dir in dirs {
        reader
            .watch(dir)
            .with_context(|| format!("failed to watch directory {}", dir.display()))?;
    }
    Ok(Box::new(reader))
}

// SIGUSR1 reloads the script in place; pending I/O is flushed by the
// re-initialization.
fn spawn_reload_handler(sandbox: Sandbox, script: PathBuf) -> anyhow::Result<()> {
    let mut usr1 = signal(SignalKind::user_defined1()).context("failed to install SIGUSR1")?;
    tokio::spawn(async move {
        while usr1.recv().await.is_some() {
            info!(script = %script.display(), "received SIGUSR1, reloading script");
            let sandbox = sandbox.clone();
            let script = script.clone();
            let outcome = tokio::task::spawn_blocking(move || sandbox.init(&script)).await;
            match outcome {
                Ok(Ok(())) => info!("script reloaded"),
                Ok(Err(e)) => error!(error = %e, "script reload failed"),
                Err(e) => error!(error = %e, "reload task panicked"),
            }
        }
    });
    Ok(())
}

pub async fn execute(script: PathBuf, file: PathBuf, dirs: Vec<PathBuf>) -> anyhow::Result<()> {
    let sandbox = Sandbox::new();
    {
        let sandbox = sandbox.clone();
        let script = script.clone();
        tokio::task::spawn_blocking(move || sandbox.init(&script))
            .await?
            .context("failed to initialize sandbox")?;
    }

    spawn_reload_handler(sandbox.clone(), script)?;

    let mut reader = open_input(&file, &dirs)?;
    let result = {
        let sandbox = sandbox.clone();
        tokio::task::spawn_blocking(move || pipeline::run(&sandbox, &mut *reader)).await?
    };

    tokio::task::spawn_blocking(move || sandbox.close()).await?;

    let processed = result.context("pipeline failed")?;
    info!(processed, "pipeline finished");
    Ok(())
}
