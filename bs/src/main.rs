use clap::Parser;
use eyre::{Context, Result};

use boardstore::Store;
use boardstore::cli::{Cli, Command};

fn main() -> Result<()> {
    let cli = Cli::parse();
    let store = Store::open(&cli.store).context("Failed to open store")?;

    match cli.command {
        Command::Collections => {
            let collections = store.collections()?;
            if collections.is_empty() {
                println!("No collections found");
            } else {
                for c in collections {
                    println!("{:40} {}", c.name, c.count);
                }
            }
        }
        Command::List { collection, limit } => {
            for value in store.raw_list(&collection, limit)? {
                println!("{}", serde_json::to_string(&value)?);
            }
        }
        Command::Get { collection, id } => match store.raw_get(&collection, &id)? {
            Some(value) => println!("{}", serde_json::to_string_pretty(&value)?),
            None => {
                eprintln!("Record not found: {}/{}", collection, id);
                std::process::exit(1);
            }
        },
    }

    Ok(())
}
