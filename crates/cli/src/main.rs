//! g8r: command-line front end for the gubernator build tool.
//!
//! `g8r [MODULE [TARGET]]` evaluates the Lua module, freezes the requested
//! target into a derivation graph, builds whatever the cache is missing, and
//! prints the absolute cache path of the artifact on stdout. Logs go to
//! stderr so the printed path stays machine-consumable.

use std::path::Path;

use anyhow::{Context, Result, anyhow};
use clap::Parser;
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

use gubernator::hash::new_sha256;
use gubernator::lua::Evaluator;
use gubernator::store::Store;
use gubernator::{build_recursive, consts, freeze, workspace};

#[derive(Parser)]
#[command(name = "g8r", version, about = "Reproducible incremental builds driven by Lua targets")]
struct Cli {
  /// Module to evaluate: "pkg:module", a path relative to the workspace
  /// root, or "." for the root's default.lua
  #[arg(default_value = consts::DEFAULT_MODULE)]
  module: String,

  /// Target symbol to build
  #[arg(default_value = consts::DEFAULT_TARGET)]
  target: String,

  /// Enable verbose output
  #[arg(short, long)]
  verbose: bool,
}

fn main() -> Result<()> {
  let cli = Cli::parse();

  let level = if cli.verbose { Level::DEBUG } else { Level::INFO };
  FmtSubscriber::builder()
    .with_max_level(level)
    .with_target(false)
    .without_time()
    .with_writer(std::io::stderr)
    .init();

  let root = workspace::find_root(Path::new(consts::DEFAULT_MODULE))?;

  let home = dirs::home_dir().ok_or_else(|| anyhow!("cannot determine the home directory"))?;
  let store = Store::open(home.join(".cache").join(consts::CACHE_DIR_NAME))?;

  let packages = workspace::load_packages(&root).context("loading packages")?;
  let evaluator = Evaluator::new(root.clone(), packages)?;
  let target = evaluator.target(&cli.module, &cli.target)?;

  let derivation = freeze(&root, &new_sha256, &store, &target).context("freezing target")?;

  // The cache root doubles as the temp base so builder outputs can be
  // renamed into the cache; system temp dirs are often a separate tmpfs.
  build_recursive(&store, &derivation, store.root())?;

  println!("{}", store.root().join(&derivation.id).display());
  Ok(())
}
