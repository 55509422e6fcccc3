use anyhow::Context as _;
use owo_colors::OwoColorize as _;
use structopt::StructOpt;

use std::{collections::BTreeMap, path::PathBuf};

use redirector::{config::Manifest, enumeration, path, scanner, RedirectionManager};

/// inspects redirect manifests without attaching to a process
#[derive(Debug, StructOpt)]
enum Config {
    /// resolves paths against a manifest
    Resolve {
        /// the manifest describing the redirects
        manifest: PathBuf,
        /// the paths to resolve
        paths: Vec<String>,
    },
    /// lists the merged view of a directory
    List {
        /// the manifest describing the redirects
        manifest: PathBuf,
        /// the directory whose merged contents to show
        directory: String,
        /// only show entries matching the wildcard pattern
        #[structopt(short = "p", long)]
        pattern: Option<String>,
    },
    /// prints the scanned contents of an overlay folder
    Scan {
        /// the overlay folder to scan
        target: PathBuf,
    },
}

/// The main function that executes when the program is launched.
fn main() {
    fn run_and_handle_errors() {
        firestorm::profile_fn!(main);

        tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .init();

        let config = Config::from_args();

        match run(config) {
            Ok(()) => (),
            Err(err) => eprintln!("{err:?}"),
        }
    }

    if firestorm::enabled() {
        firestorm::bench("./target", run_and_handle_errors).unwrap();
    } else {
        run_and_handle_errors()
    }
}

/// Runs the program.
fn run(config: Config) -> anyhow::Result<()> {
    match config {
        Config::Resolve { manifest, paths } => {
            let manager = load_manager(&manifest)?;

            for requested in &paths {
                match manager.resolve_file(requested) {
                    Some(redirected) => {
                        println!("{requested} -> {}", redirected.green());
                    }
                    None => println!("{requested} -> {}", "unchanged".dimmed()),
                }
            }

            Ok(())
        }
        Config::List {
            manifest,
            directory,
            pattern,
        } => {
            let manager = load_manager(&manifest)?;
            list_merged(&manager, &directory, pattern.as_deref())
        }
        Config::Scan { target } => {
            let groups = scanner::scan_folder(&target)
                .with_context(|| format!("failed scanning {}", target.display()))?;

            for group in groups {
                let key = if group.relative_key.is_empty() {
                    "<root>"
                } else {
                    group.relative_key.as_str()
                };
                println!("{key}");
                for entry in group.entries {
                    if entry.is_directory {
                        println!("  {}", entry.name.blue());
                    } else {
                        println!("  {}", entry.name);
                    }
                }
            }

            Ok(())
        }
    }
}

/// Builds an optimised manager from a manifest file.
fn load_manager(manifest: &PathBuf) -> anyhow::Result<RedirectionManager> {
    let manifest = Manifest::from_file(manifest)
        .with_context(|| format!("failed loading manifest {}", manifest.display()))?;

    let manager = RedirectionManager::new();
    manifest
        .apply(&manager)
        .context("failed applying the manifest")?;
    manager.optimise();

    Ok(manager)
}

/// Prints the merged view of a directory: the base contents plus overlay
/// entries, overlay injections marked.
fn list_merged(
    manager: &RedirectionManager,
    directory: &str,
    pattern: Option<&str>,
) -> anyhow::Result<()> {
    let folded_pattern = pattern.map(path::normalize);
    let matches = |name: &str| match &folded_pattern {
        Some(pattern) => enumeration::matches_pattern(pattern, &path::normalize(name)),
        None => true,
    };

    // Base contents first; the directory may exist only inside an overlay.
    let mut entries: BTreeMap<String, bool> = BTreeMap::new();
    if let Ok(base) = std::fs::read_dir(directory) {
        for entry in base.flatten() {
            let name = entry.file_name().to_string_lossy().into_owned();
            if matches(&name) {
                entries.insert(name, false);
            }
        }
    }

    let overlay = manager.overlay_entries(directory).unwrap_or_default();
    for (name, _) in overlay {
        if matches(&name) {
            // A base entry with the same name shadows the overlay record,
            // exactly as the enumeration merger would.
            let shadowed = entries
                .keys()
                .any(|existing| path::normalize(existing) == name);
            if !shadowed {
                entries.insert(name, true);
            }
        }
    }

    for (name, injected) in entries {
        if injected {
            println!("{}  {}", name.green(), "(overlay)".dimmed());
        } else {
            println!("{name}");
        }
    }

    Ok(())
}
