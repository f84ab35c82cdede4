//! `planctx status`: Show configuration and database status.

use planctx_config::AppConfig;
use std::path::Path;

use super::{CliResult, load_config};

fn describe_db(path: &Path) -> String {
    match std::fs::metadata(path) {
        Ok(meta) => format!("{} ({:.1} KB)", path.display(), meta.len() as f64 / 1024.0),
        Err(_) => format!("{} (not created yet)", path.display()),
    }
}

pub async fn run() -> CliResult {
    let config = load_config()?;
    let hnsw = &config.store.hnsw;

    println!("🧭 planctx Status");
    println!("=================");
    println!("  Config dir:   {}", AppConfig::config_dir().display());
    println!("  Store:        {}", config.store.backend);
    if config.store.backend == "sqlite" {
        println!("  Store DB:     {}", describe_db(&config.store_path()));
    }
    println!("  Dimension:    {}", config.store.dimension);
    println!(
        "  HNSW:         m={}, ef_construction={}, ef_search={}",
        hnsw.m, hnsw.ef_construction, hnsw.ef_search
    );
    println!("  Max tokens:   {}", config.context.max_tokens);
    println!(
        "  Memory query: top_k={}, threshold={:.2}",
        config.context.memory_top_k, config.context.memory_threshold
    );
    println!("  Jobs:         {}", config.jobs.backend);
    if config.jobs.backend == "sqlite" {
        println!("  Jobs DB:      {}", describe_db(&config.jobs_path()));
    }
    println!(
        "  Retries:      {} (handler timeout {}s)",
        config.jobs.max_retries, config.jobs.handler_timeout_secs
    );

    let config_path = AppConfig::config_dir().join("config.toml");
    if config_path.exists() {
        println!("\n  ✅ Config file found");
    } else {
        println!("\n  ⚠️  No config file, running on defaults. Example:");
        println!();
        println!("{}", AppConfig::default_toml());
    }

    Ok(())
}
