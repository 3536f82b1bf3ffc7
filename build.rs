// build.rs

use clap::{Arg, ArgAction, Command};
use clap_mangen::Man;
use std::env;
use std::fs;
use std::path::PathBuf;
use std::process;

/// Common argument: configuration file
fn config_arg() -> Arg {
    Arg::new("config")
        .short('c')
        .long("config")
        .value_name("PATH")
        .global(true)
        .help("Configuration file (default: $CEFS_CONFIG or /etc/cefs/config.toml)")
}

fn dry_run_arg(help: &'static str) -> Arg {
    Arg::new("dry_run")
        .long("dry-run")
        .action(ArgAction::SetTrue)
        .help(help)
}

fn json_arg() -> Arg {
    Arg::new("json")
        .long("json")
        .action(ArgAction::SetTrue)
        .help("Print as JSON")
}

fn build_cli() -> Command {
    Command::new("cefs")
        .version(env!("CARGO_PKG_VERSION"))
        .author("cefs contributors")
        .about("Content-addressed filesystem store")
        .subcommand_required(false)
        .arg(config_arg())
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .action(ArgAction::Count)
                .global(true)
                .help("More logging (-v debug, -vv trace)"),
        )
        .subcommand(
            Command::new("install")
                .about("Build a staged directory into an archive and symlink it into place")
                .arg(Arg::new("staged").required(true).help("Directory holding the content"))
                .arg(Arg::new("destination").required(true).help("Path to expose the content at"))
                .arg(Arg::new("name").long("name").help("Logical component name"))
                .arg(Arg::new("description").long("description").help("Manifest description")),
        )
        .subcommand(
            Command::new("convert")
                .about("Convert legacy install directories to store-backed symlinks")
                .arg(
                    Arg::new("paths")
                        .required(true)
                        .num_args(1..)
                        .help("Legacy install paths"),
                )
                .arg(
                    Arg::new("force")
                        .long("force")
                        .action(ArgAction::SetTrue)
                        .help("Re-convert paths that are already symlinks"),
                )
                .arg(dry_run_arg("Show what would be converted without changing anything")),
        )
        .subcommand(
            Command::new("gc")
                .about("Delete archives no longer referenced by any root")
                .arg(Arg::new("min_age").long("min-age").help("Minimum age, e.g. 1h or 2d"))
                .arg(
                    Arg::new("root")
                        .long("root")
                        .action(ArgAction::Append)
                        .help("Additional root to scan"),
                )
                .arg(dry_run_arg("Report without deleting"))
                .arg(json_arg()),
        )
        .subcommand(
            Command::new("root")
                .about("Root pointer management")
                .subcommand_required(true)
                .subcommand(
                    Command::new("create")
                        .about("Create a root pointer designating an existing catalog image")
                        .arg(Arg::new("base_image").required(true).help("Catalog image directory"))
                        .arg(Arg::new("path").required(true).help("Root pointer path")),
                )
                .subcommand(
                    Command::new("show")
                        .about("Show where a root pointer leads and what its catalog holds")
                        .arg(Arg::new("path").required(true).help("Root pointer path")),
                )
                .subcommand(
                    Command::new("link")
                        .about("Link an entry into the root's catalog and publish the result")
                        .arg(Arg::new("root").required(true).help("Root pointer path"))
                        .arg(Arg::new("entry").required(true).help("Entry path inside the catalog"))
                        .arg(Arg::new("target").required(true).help("Store path to point at"))
                        .arg(Arg::new("message").long("message").help("Metadata log line")),
                ),
        )
        .subcommand(
            Command::new("describe")
                .about("Show the manifest of an archive")
                .arg(
                    Arg::new("target")
                        .required(true)
                        .help("Digest, archive path, mounted path or symlink into the store"),
                ),
        )
        .subcommand(
            Command::new("stats")
                .about("Show archive usage statistics")
                .arg(json_arg()),
        )
        .subcommand(
            Command::new("consolidate")
                .about("Fold small single-component archives into composites")
                .arg(dry_run_arg("Show the planned batches without building anything")),
        )
        .subcommand(
            Command::new("completions")
                .about("Generate shell completion scripts")
                .arg(
                    Arg::new("shell")
                        .required(true)
                        .value_parser(["bash", "zsh", "fish", "powershell", "elvish"])
                        .help("Shell type"),
                ),
        )
}

/// Revision recorded in manifests
fn git_sha() -> String {
    process::Command::new("git")
        .args(["rev-parse", "HEAD"])
        .output()
        .ok()
        .filter(|out| out.status.success())
        .and_then(|out| String::from_utf8(out.stdout).ok())
        .map(|sha| sha.trim().to_string())
        .filter(|sha| !sha.is_empty())
        .unwrap_or_else(|| "unknown".to_string())
}

fn main() {
    println!("cargo:rerun-if-changed=build.rs");
    println!("cargo:rerun-if-changed=.git/HEAD");
    println!("cargo:rustc-env=CEFS_GIT_SHA={}", git_sha());

    // Create man directory - use CARGO_MANIFEST_DIR which is always set by cargo
    let manifest_dir = match env::var("CARGO_MANIFEST_DIR") {
        Ok(dir) => PathBuf::from(dir),
        Err(e) => {
            println!("cargo:warning=CARGO_MANIFEST_DIR not set: {}", e);
            return;
        }
    };
    let man_dir = manifest_dir.join("man");

    if let Err(e) = fs::create_dir_all(&man_dir) {
        println!("cargo:warning=Failed to create man directory: {}", e);
        return;
    }

    let man = Man::new(build_cli());
    let mut buffer = Vec::new();

    if let Err(e) = man.render(&mut buffer) {
        println!("cargo:warning=Failed to render man page: {}", e);
        return;
    }

    let man_path = man_dir.join("cefs.1");
    if let Err(e) = fs::write(&man_path, buffer) {
        println!("cargo:warning=Failed to write man page: {}", e);
    }
}
