use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::EnvFilter;

mod bench;
mod cli;
mod config;
mod factory;
mod remote;
mod semantic;

use cli::Command;
use factory::AppFactory;
use semantic::{ServiceStatus, SimilarItem};

fn init_logging(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn print_status(status: &ServiceStatus) {
    println!("cache: {}", status.cache);
    if let Some(reason) = &status.failure {
        println!("failure: {reason}");
    }
    println!("snapshot: {}", status.snapshot_path.display());
    println!("pairs: {}", status.cached_pairs);
    match status.last_updated {
        Some(ts) => println!("last updated: {}", ts.to_rfc3339()),
        None => println!("last updated: never"),
    }
    println!("model loaded: {}", status.model_loaded);
    if !status.dimensions_match() {
        println!(
            "dimension mismatch: model {:?}, cache {:?}",
            status.model_dimensions, status.cache_dimensions
        );
    }
}

fn print_results(results: &[SimilarItem]) {
    if results.is_empty() {
        println!("no similar pairs found");
        return;
    }

    for (rank, item) in results.iter().enumerate() {
        println!(
            "{:>3}. [{:.4}] {} vs {} (#{})",
            rank + 1,
            item.similarity,
            item.item1,
            item.item2,
            item.id
        );
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = cli::Args::parse();
    init_logging(args.verbose);

    let config = AppFactory::create_config().context("failed to load configuration")?;

    match args.command {
        Command::Similar { pair, k, json } => {
            let service = AppFactory::create_service(&config)?;
            let k = k.unwrap_or(config.semantic_search.default_k);

            let results = service.get_similar(&pair, k).await;
            service.shutdown();
            let results = results?;

            if json {
                println!("{}", serde_json::to_string_pretty(&results)?);
            } else {
                print_results(&results);
            }
            Ok(())
        }

        Command::Warm {} => {
            let service = AppFactory::create_service(&config)?;
            let status = service.warm_up().await;
            service.shutdown();
            print_status(&status);
            Ok(())
        }

        Command::Refresh {} => {
            let service = AppFactory::create_service(&config)?;
            let status = service.refresh().await;
            service.shutdown();
            print_status(&status);
            Ok(())
        }

        Command::Status {} => {
            let storage = semantic::SnapshotStorage::new(config.snapshot_path());
            match storage.load() {
                Ok(Some(snapshot)) => {
                    let fresh = snapshot.is_fresh(config.ttl(), chrono::Utc::now());
                    println!("snapshot: {}", storage.path().display());
                    println!("pairs: {}", snapshot.len());
                    println!("dimensions: {}", snapshot.embeddings().dimensions());
                    println!("last updated: {}", snapshot.last_updated().to_rfc3339());
                    println!("state: {}", if fresh { "fresh" } else { "stale" });
                }
                Ok(None) => println!("no snapshot at {}", storage.path().display()),
                Err(err) => println!("unreadable snapshot at {}: {err}", storage.path().display()),
            }
            Ok(())
        }

        Command::Embed { text } => {
            let model = AppFactory::create_model(&config);
            let vector = model.encode_one(&text).await.context("could not embed text")?;
            println!("{}", semantic::codec::encode_vector(&vector));
            Ok(())
        }

        Command::BenchFetch { counts, concurrency } => {
            let remote = remote::PairsRemote::new(
                &config.backend.base_url,
                config.backend.token(),
                Duration::from_secs(config.backend.request_timeout_secs),
            )?;

            let rows = bench::bench_fetch(
                Arc::new(remote),
                &counts,
                &concurrency,
                Duration::from_secs(config.fetch.page_timeout_secs),
            )
            .await;

            for row in rows {
                println!("{row}");
            }
            Ok(())
        }
    }
}
