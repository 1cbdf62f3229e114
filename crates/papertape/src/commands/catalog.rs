//! Decode and summarize a catalog file.

use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;

use clap::Args;

use papertape::catalog;

/// Decode and summarize a catalog file
#[derive(Args, Debug)]
pub struct CatalogArgs {
    /// Catalog file to decode
    catalog_file: PathBuf,

    /// Print every entry instead of the summary alone
    #[arg(long, short = 'l')]
    list: bool,
}

pub fn run(args: CatalogArgs) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let text = fs::read_to_string(&args.catalog_file)?;
    let decoded = catalog::decode(text.lines());

    let mut units: BTreeMap<u64, usize> = BTreeMap::new();
    for entry in &decoded.entries {
        *units.entry(entry.unit_index).or_default() += 1;
    }

    println!("run: {}", decoded.run_id);
    println!("items: {}", decoded.last_item_index);
    println!("units: {}", units.len());
    for (unit_index, count) in &units {
        println!("  unit {unit_index}: {count} records");
    }

    if args.list {
        for entry in &decoded.entries {
            let hash = decoded
                .hash_by_path
                .get(&entry.path)
                .map(String::as_str)
                .unwrap_or("-");
            println!(
                "{}:{}:{}:{}",
                entry.unit_index, entry.archive_index, hash, entry.path
            );
        }
    }
    Ok(())
}
