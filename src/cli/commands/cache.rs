//! Cache command - inspect and maintain the binary cache

use crate::cache::CacheStore;
use crate::cli::args::{CacheAction, CacheArgs};
use crate::config::{Config, ConfigManager};
use crate::error::KilnResult;
use console::style;
use std::io::{self, BufRead, Write};
use std::path::PathBuf;

/// Execute the cache command
pub fn execute(args: CacheArgs, config: &Config) -> KilnResult<()> {
    let dir = cache_dir(config);
    let store = CacheStore::new(Some(dir.clone()), config.cache.budget_bytes());

    match args.action {
        CacheAction::Stats => show_stats(&store),
        CacheAction::Gc => gc(&store),
        CacheAction::Clear { yes } => clear(&store, yes),
        CacheAction::Path => {
            println!("{}", dir.display());
            Ok(())
        }
    }
}

fn cache_dir(config: &Config) -> PathBuf {
    config
        .cache
        .dir
        .clone()
        .unwrap_or_else(ConfigManager::default_cache_dir)
}

fn show_stats(store: &CacheStore) -> KilnResult<()> {
    let usage = store.usage();

    println!("{:<12} {}", "entries", usage.entries);
    println!("{:<12} {}", "used", format_bytes(usage.used_bytes));
    println!("{:<12} {}", "budget", format_bytes(usage.budget_bytes));

    if usage.used_bytes > usage.budget_bytes {
        println!(
            "{} cache is over budget; run `kiln cache gc`",
            style("note:").yellow()
        );
    }

    Ok(())
}

fn gc(store: &CacheStore) -> KilnResult<()> {
    let before = store.usage();
    store.prune(&[], Vec::new())?;
    let after = store.usage();

    println!(
        "{} {} entries, freed {}",
        style("Evicted").green().bold(),
        before.entries.saturating_sub(after.entries),
        format_bytes(before.used_bytes.saturating_sub(after.used_bytes))
    );
    Ok(())
}

fn clear(store: &CacheStore, yes: bool) -> KilnResult<()> {
    let usage = store.usage();
    if usage.entries == 0 {
        println!("Cache is already empty.");
        return Ok(());
    }

    if !yes {
        print!(
            "Remove all {} cached entries ({})? [y/N] ",
            usage.entries,
            format_bytes(usage.used_bytes)
        );
        io::stdout().flush().ok();

        let mut answer = String::new();
        io::stdin().lock().read_line(&mut answer).ok();
        if !matches!(answer.trim(), "y" | "Y" | "yes") {
            println!("Aborted.");
            return Ok(());
        }
    }

    store.prune_to(0, &[], Vec::new())?;
    println!("{} {} entries", style("Removed").green().bold(), usage.entries);
    Ok(())
}

fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KiB", "MiB", "GiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} {}", bytes, UNITS[0])
    } else {
        format!("{:.1} {}", value, UNITS[unit])
    }
}
