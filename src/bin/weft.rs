// src/bin/weft.rs

use clap::Parser;
use colored::Colorize;
use weft::cli::{Cli, dispatch};

fn main() {
    let cli = Cli::parse();
    env_logger::Builder::new()
        .filter_level(if cli.debug {
            log::LevelFilter::Debug
        } else {
            log::LevelFilter::Info
        })
        .format_timestamp(None)
        .format_target(false)
        .init();

    if let Err(e) = dispatch(cli) {
        eprintln!("{}: {e:#}", "error".red().bold());
        std::process::exit(1);
    }
}
