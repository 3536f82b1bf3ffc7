// src/main.rs

use anyhow::Result;
use clap::{CommandFactory, Parser};
use tracing_subscriber::EnvFilter;

mod cli;
mod commands;

use cli::{Cli, Commands, RootCommands};
use commands::Context;

fn main() -> Result<()> {
    let cli = Cli::parse();

    // RUST_LOG wins over -v
    let default_level = match cli.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    let Some(command) = cli.command else {
        println!("cefs v{}", env!("CARGO_PKG_VERSION"));
        println!("Run 'cefs --help' for usage information");
        return Ok(());
    };

    if let Commands::Completions { shell } = command {
        clap_complete::generate(shell, &mut Cli::command(), "cefs", &mut std::io::stdout());
        return Ok(());
    }

    let ctx = Context::load(cli.config.as_deref())?;

    match command {
        Commands::Install {
            staged,
            destination,
            name,
            description,
        } => commands::cmd_install(
            &ctx,
            &staged,
            &destination,
            name.as_deref(),
            description.as_deref(),
        ),
        Commands::Convert {
            paths,
            force,
            dry_run,
        } => commands::cmd_convert(&ctx, &paths, force, dry_run),
        Commands::Gc {
            min_age,
            roots,
            dry_run,
            json,
        } => commands::cmd_gc(&ctx, min_age, &roots, dry_run, json),
        Commands::Root(root_cmd) => match root_cmd {
            RootCommands::Create { base_image, path } => {
                commands::cmd_root_create(&ctx, &base_image, &path)
            }
            RootCommands::Show { path } => commands::cmd_root_show(&ctx, &path),
            RootCommands::Link {
                root,
                entry,
                target,
                message,
            } => commands::cmd_root_link(&ctx, &root, &entry, &target, message.as_deref()),
        },
        Commands::Describe { target } => commands::cmd_describe(&ctx, &target),
        Commands::Stats { json } => commands::cmd_stats(&ctx, json),
        Commands::Consolidate { dry_run } => commands::cmd_consolidate(&ctx, dry_run),
        Commands::Completions { .. } => Ok(()),
    }
}
