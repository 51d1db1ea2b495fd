//! hybridswap smoke driver.
//!
//! Stores synthetic pages for a handful of owners, pushes them to the
//! backing device, faults a sample back and verifies it, then promotes and
//! tears the owners down while logging what each step did.

use std::sync::Arc;
use std::time::Instant;

use anyhow::{bail, Context};
use clap::Parser;
use tracing::{info, warn};

use hybridswap::config::{Cli, Config};
use hybridswap::io::{BackingDevice, MemDevice};
use hybridswap::{Engine, ObjectId, OwnerId};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse CLI arguments.
    let cli = Cli::parse();

    // Initialize tracing/logging.
    let filter = if cli.verbose {
        "hybridswap=debug"
    } else {
        "hybridswap=info"
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| filter.into()),
        )
        .with_target(true)
        .init();

    info!("hybridswap v{}", env!("CARGO_PKG_VERSION"));

    if cli.owners == 0 || cli.pages_per_owner == 0 {
        bail!("need at least one owner and one page per owner");
    }

    // Load configuration and make room for the workload.
    let mut config = Config::load(&cli.config)?;
    let g = &mut config.geometry;
    g.owner_count = g.owner_count.max(usize::from(cli.owners));
    g.object_count = g
        .object_count
        .max(usize::from(cli.owners) * cli.pages_per_owner);

    info!(
        page_size = g.page_size,
        extent_size = g.extent_size,
        extents = g.extent_count,
        objects = g.object_count,
        device_bytes = g.device_bytes(),
        "Configuration loaded"
    );

    let device: Arc<dyn BackingDevice> = match &cli.device {
        #[cfg(unix)]
        Some(path) => Arc::new(
            hybridswap::io::FileDevice::open(path, config.geometry.device_bytes(), &config.io)
                .with_context(|| format!("opening backing device {}", path.display()))?,
        ),
        #[cfg(not(unix))]
        Some(_) => bail!("file-backed devices need a unix platform"),
        None => Arc::new(MemDevice::new(config.geometry.device_bytes(), &config.io)?),
    };

    let engine = Arc::new(Engine::new(config, device)?);
    let pages = cli.pages_per_owner;
    let started = Instant::now();

    // One blocking task per owner: fill, then force everything to disk.
    let mut tasks = Vec::new();
    for owner in 1..=cli.owners {
        let engine = engine.clone();
        tasks.push(tokio::task::spawn_blocking(move || {
            drive_owner(&engine, owner, pages)
        }));
    }
    for task in tasks {
        task.await??;
    }
    info!(elapsed_ms = started.elapsed().as_millis() as u64, "Reclaim phase done");

    // Fault a sample back and check the bytes.
    let verify = engine.clone();
    let checked = tokio::task::spawn_blocking(move || {
        verify_sample(&verify, cli.owners, pages)
    })
    .await??;
    info!(checked, "Fault-in verified");

    // Bring half of each owner back in bulk, then tear owners down.
    let teardown = engine.clone();
    tokio::task::spawn_blocking(move || -> anyhow::Result<()> {
        for owner in 1..=cli.owners {
            let disk = teardown
                .owner_stats(owner)
                .map(|s| s.disk_bytes)
                .unwrap_or_default();
            match teardown.batch_out(owner, disk / 2) {
                Ok(report) => info!(owner, bytes = report.bytes, extents = report.extents, "Batch-out"),
                Err(err) => warn!(owner, error = %err, "Batch-out skipped"),
            }
            let report = teardown.destroy_owner(owner)?;
            info!(
                owner,
                promoted = report.promoted,
                released = report.released,
                "Owner drained"
            );
        }
        teardown.sync_frees();
        teardown.assert_consistent();
        Ok(())
    })
    .await??;

    let stats = engine.stats();
    info!(
        elapsed_ms = started.elapsed().as_millis() as u64,
        stats = %serde_json::to_string(&stats)?,
        "Run complete"
    );
    Ok(())
}

fn object_id(owner: OwnerId, index: usize, pages: usize) -> ObjectId {
    (usize::from(owner) - 1) * pages + index
}

/// Compressible page tagged with its owner and index; every eighth page is
/// all zeroes.
fn synthetic_page(page_size: usize, owner: OwnerId, index: usize) -> Vec<u8> {
    if index % 8 == 7 {
        return vec![0; page_size];
    }
    let tag = format!("owner={owner} page={index};");
    tag.bytes().cycle().take(page_size).collect()
}

fn drive_owner(engine: &Engine, owner: OwnerId, pages: usize) -> anyhow::Result<()> {
    let page_size = engine.page_size();
    for index in 0..pages {
        let page = synthetic_page(page_size, owner, index);
        engine.store(owner, object_id(owner, index, pages), &page)?;
    }
    let report = engine.reclaim_in(owner, true)?;
    info!(
        owner,
        bytes = report.bytes,
        objects = report.objects,
        extents = report.extents,
        out_of_space = report.out_of_space,
        "Owner reclaimed"
    );
    if let Some(failure) = report.failure {
        bail!("write-back failed for owner {owner}: {failure}");
    }
    Ok(())
}

fn verify_sample(engine: &Engine, owners: u16, pages: usize) -> anyhow::Result<usize> {
    let page_size = engine.page_size();
    let step = (pages / 16).max(1);
    let mut checked = 0;
    for owner in 1..=owners {
        for index in (0..pages).step_by(step) {
            let id = object_id(owner, index, pages);
            let got = engine.load(id)?;
            if got != synthetic_page(page_size, owner, index) {
                bail!("object {id} of owner {owner} came back corrupted");
            }
            checked += 1;
        }
    }
    Ok(checked)
}
