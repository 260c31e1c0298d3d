use anyhow::{bail, Context, Result};
use serde::Serialize;
use std::path::PathBuf;
use std::time::Duration;

use facesort::scanner::collect_uploads;
use facesort::{logging, Config, IngestItem, Library};

enum Command {
    Ingest(Vec<PathBuf>),
    Rebuild,
    Groups,
    Group(i64),
    Photo {
        id: String,
        out: PathBuf,
        width: Option<u32>,
    },
    Cover {
        id: i64,
        out: PathBuf,
        size: Option<u32>,
    },
    Threshold(Option<(String, f32)>),
    Stats,
    Clear,
}

struct Cli {
    config_path: Option<PathBuf>,
    json: bool,
    command: Command,
}

fn usage_error(msg: &str) -> ! {
    eprintln!("Error: {}", msg);
    eprintln!("Run `facesort --help` for usage.");
    std::process::exit(1);
}

fn parse_number<T: std::str::FromStr>(value: Option<&String>, what: &str) -> T {
    match value.map(|v| v.parse::<T>()) {
        Some(Ok(n)) => n,
        Some(Err(_)) => usage_error(&format!("{} must be a number", what)),
        None => usage_error(&format!("missing {}", what)),
    }
}

fn parse_args() -> Cli {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let mut config_path = None;
    let mut json = false;
    let mut out = None;
    let mut width = None;
    let mut size = None;
    let mut positional = Vec::new();

    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "--help" | "-h" => {
                print_help();
                std::process::exit(0);
            }
            "--version" | "-V" => {
                println!("facesort {}", env!("CARGO_PKG_VERSION"));
                std::process::exit(0);
            }
            "--config" | "-c" => {
                i += 1;
                match args.get(i) {
                    Some(path) => config_path = Some(PathBuf::from(path)),
                    None => usage_error("--config requires a path argument"),
                }
            }
            "--json" => json = true,
            "--out" | "-o" => {
                i += 1;
                match args.get(i) {
                    Some(path) => out = Some(PathBuf::from(path)),
                    None => usage_error("--out requires a path argument"),
                }
            }
            "--width" | "-w" => {
                i += 1;
                width = Some(parse_number(args.get(i), "--width"));
            }
            "--size" | "-s" => {
                i += 1;
                size = Some(parse_number(args.get(i), "--size"));
            }
            flag if flag.starts_with('-') && flag.len() > 1 => {
                usage_error(&format!("unknown option: {}", flag));
            }
            _ => positional.push(args[i].clone()),
        }
        i += 1;
    }

    let Some((name, rest)) = positional.split_first() else {
        print_help();
        std::process::exit(1);
    };

    let require_out = |out: Option<PathBuf>| out.unwrap_or_else(|| usage_error("--out is required"));

    let command = match name.as_str() {
        "ingest" => {
            if rest.is_empty() {
                usage_error("ingest needs at least one file or directory");
            }
            Command::Ingest(rest.iter().map(PathBuf::from).collect())
        }
        "rebuild" => Command::Rebuild,
        "groups" => Command::Groups,
        "group" => Command::Group(parse_number(rest.first(), "group id")),
        "photo" => Command::Photo {
            id: rest
                .first()
                .cloned()
                .unwrap_or_else(|| usage_error("missing photo id")),
            out: require_out(out),
            width,
        },
        "cover" => Command::Cover {
            id: parse_number(rest.first(), "group id"),
            out: require_out(out),
            size,
        },
        "threshold" => match rest {
            [] => Command::Threshold(None),
            [metric, value] => Command::Threshold(Some((metric.clone(), parse_number(Some(value), "threshold")))),
            _ => usage_error("usage: threshold [METRIC VALUE]"),
        },
        "stats" | "status" => Command::Stats,
        "clear" => Command::Clear,
        other => usage_error(&format!("unknown command: {}", other)),
    };

    Cli {
        config_path,
        json,
        command,
    }
}

fn print_help() {
    println!(
        r#"facesort - group a photo collection by the people in it

USAGE:
    facesort [OPTIONS] <COMMAND>

COMMANDS:
    ingest PATH...              Store photos and group their faces (directories are walked)
    rebuild                     Recluster every face with the current thresholds
    groups                      List person groups, largest first
    group ID                    List the photos in a group
    photo ID --out FILE         Write a photo, optionally downscaled with --width N
    cover ID --out FILE         Write a group's face thumbnail, at most --size N pixels
    threshold [METRIC VALUE]    Show or set a match threshold (cosine, euclidean)
    stats                       Show task status and library totals
    clear                       Delete all photos, faces and groups

OPTIONS:
    --config, -c PATH   Path to config file
    --json              Print machine-readable output
    --version, -V       Show version
    --help, -h          Show this help message

ENVIRONMENT:
    FACESORT_CONFIG               Path to config file (overrides default location)
    FACESORT_LOG                  Log level (trace, debug, info, warn, error)
    FACESORT_COSINE_THRESHOLD     Cosine similarity threshold override
    FACESORT_EUCLIDEAN_THRESHOLD  Euclidean distance threshold override

Config file location: $XDG_CONFIG_HOME/facesort/config.toml"#
    );
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn load_items(paths: &[PathBuf], config: &Config) -> Result<Vec<IngestItem>> {
    let files = collect_uploads(paths, &config.ingest.image_extensions)?;
    let mut items = Vec::with_capacity(files.len());
    for path in files {
        match IngestItem::from_path(&path) {
            Ok(item) => items.push(item),
            Err(e) => {
                tracing::warn!(path = ?path, error = %e, "Skipping unreadable file");
                eprintln!("Skipping {}: {}", path.display(), e);
            }
        }
    }
    Ok(items)
}

async fn run_ingest(library: &Library, items: Vec<IngestItem>, json: bool) -> Result<()> {
    if items.is_empty() {
        bail!("no photos to ingest");
    }

    let job = library.start_ingest(items)?;
    while !job.is_finished() {
        let task = library.status()?.task;
        if !json {
            eprint!(
                "\r[{:>3}%] {}/{} {}",
                task.percent(),
                task.processed,
                task.total,
                task.current_item.as_deref().unwrap_or("")
            );
        }
        tokio::time::sleep(Duration::from_millis(250)).await;
    }
    let summary = job.await.context("ingestion worker panicked")?;
    let task = library.status()?.task;

    if json {
        return print_json(&task);
    }

    eprintln!();
    println!(
        "Processed {} photos: {} indexed, {} already known, {} failed, {} faces",
        summary.processed, summary.indexed, summary.duplicates, summary.failed, summary.faces
    );
    if task.photos_without_faces > 0 {
        println!("{} photos had no faces", task.photos_without_faces);
    }
    if task.observations_skipped > 0 {
        println!("{} faces skipped (incompatible embeddings)", task.observations_skipped);
    }
    for error in &task.errors {
        println!("  error: {}", error);
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = parse_args();

    // Initialize logging (uses journald on Linux, file fallback otherwise)
    let _ = logging::init(Some(Config::config_dir().join("logs")));

    let config = match &cli.config_path {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };

    let library = Library::open(config).context("failed to open library")?;

    match cli.command {
        Command::Ingest(paths) => {
            let items = load_items(&paths, library.config())?;
            run_ingest(&library, items, cli.json).await?;
        }
        Command::Rebuild => {
            let summary = library.rebuild().await?;
            println!(
                "Rebuilt {} groups from {} faces ({} skipped)",
                summary.groups, summary.observations, summary.skipped
            );
        }
        Command::Groups => {
            let groups = library.groups()?;
            if cli.json {
                print_json(&groups)?;
            } else if groups.is_empty() {
                println!("No groups yet");
            } else {
                println!("{:>6}  {:>5}  {:<12}  REPRESENTATIVE PHOTO", "GROUP", "FACES", "ENGINE");
                for g in groups {
                    println!(
                        "{:>6}  {:>5}  {:<12}  {}",
                        g.group_id, g.size, g.engine_name, g.representative_photo_id
                    );
                }
            }
        }
        Command::Group(id) => {
            let photos = library.group_photos(id)?;
            if cli.json {
                print_json(&photos)?;
            } else {
                for photo_id in photos {
                    let photo = library.photo(&photo_id)?;
                    println!("{}  {}", photo.photo_id, photo.original_filename);
                }
            }
        }
        Command::Photo { id, out, width } => {
            let bytes = library.photo_bytes(&id, width)?;
            std::fs::write(&out, bytes).with_context(|| format!("failed to write {}", out.display()))?;
            println!("Wrote {}", out.display());
        }
        Command::Cover { id, out, size } => {
            let bytes = library.face_thumbnail(id, size)?;
            std::fs::write(&out, bytes).with_context(|| format!("failed to write {}", out.display()))?;
            println!("Wrote {}", out.display());
        }
        Command::Threshold(None) => {
            let t = library.thresholds();
            if cli.json {
                print_json(&t)?;
            } else {
                println!("cosine     {}", t.cosine);
                println!("euclidean  {}", t.euclidean);
            }
        }
        Command::Threshold(Some((metric, value))) => {
            library.set_threshold(&metric, value)?;
            println!("Set {} threshold to {}. Run `facesort rebuild` to apply it to existing groups.", metric, value);
        }
        Command::Stats => {
            let status = library.status()?;
            if cli.json {
                print_json(&status)?;
            } else {
                println!("Engine:        {}", status.engine.as_deref().unwrap_or("unavailable"));
                println!("Photos:        {}", status.library.total_photos);
                println!("  no faces:    {}", status.library.photos_without_faces);
                println!("Faces:         {}", status.library.total_faces);
                println!("Groups:        {}", status.library.total_groups);
                println!("Thresholds:    cosine {}, euclidean {}", status.thresholds.cosine, status.thresholds.euclidean);
                if let Some(reason) = status.engine_error {
                    println!();
                    println!("{}", reason);
                }
            }
        }
        Command::Clear => {
            library.clear_cache()?;
            println!("Library cleared");
        }
    }

    Ok(())
}
