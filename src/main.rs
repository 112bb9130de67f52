use anyhow::{anyhow, bail, Result};
use std::path::PathBuf;

use bijutsu::config::Config;
use bijutsu::db::{ContentHash, Database, FamilyId};
use bijutsu::family::{manual, FamilyResolver};
use bijutsu::logging;
use bijutsu::scanner::Ingestor;

enum Command {
    Init,
    Ingest { paths: Vec<PathBuf>, tags: Vec<String> },
    Resolve { file: ContentHash },
    Families { json: bool },
    FamilyCreate { parent: ContentHash },
    FamilyAdd { family: FamilyId, child: ContentHash },
    FamilyRemove { family: FamilyId, child: ContentHash },
    FamilyDelete { family: FamilyId },
}

struct Cli {
    config_path: Option<PathBuf>,
    command: Command,
}

fn parse_args() -> Result<Cli> {
    let args: Vec<String> = std::env::args().collect();
    let mut config_path = None;
    let mut positional = Vec::new();
    let mut tags = Vec::new();
    let mut json = false;

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--help" | "-h" => {
                print_help();
                std::process::exit(0);
            }
            "--version" | "-V" => {
                println!("bijutsu {}", env!("CARGO_PKG_VERSION"));
                std::process::exit(0);
            }
            "--config" | "-c" => {
                if i + 1 < args.len() {
                    config_path = Some(PathBuf::from(&args[i + 1]));
                    i += 1;
                } else {
                    bail!("--config requires a path argument");
                }
            }
            "--tag" | "-t" => {
                if i + 1 < args.len() {
                    tags.push(args[i + 1].clone());
                    i += 1;
                } else {
                    bail!("--tag requires a name");
                }
            }
            "--json" => json = true,
            arg if arg.starts_with('-') => bail!("Unknown argument: {}", arg),
            arg => positional.push(arg.to_string()),
        }
        i += 1;
    }

    let mut positional = positional.into_iter();
    let command = match positional.next().as_deref() {
        Some("init") => Command::Init,
        Some("ingest") => {
            let paths: Vec<PathBuf> = positional.by_ref().map(PathBuf::from).collect();
            if paths.is_empty() {
                bail!("ingest requires at least one path");
            }
            Command::Ingest { paths, tags }
        }
        Some("resolve") => Command::Resolve {
            file: content_hash(positional.next())?,
        },
        Some("families") => Command::Families { json },
        Some("family") => match positional.next().as_deref() {
            Some("create") => Command::FamilyCreate {
                parent: content_hash(positional.next())?,
            },
            Some("add") => Command::FamilyAdd {
                family: family_id(positional.next())?,
                child: content_hash(positional.next())?,
            },
            Some("remove") => Command::FamilyRemove {
                family: family_id(positional.next())?,
                child: content_hash(positional.next())?,
            },
            Some("delete") => Command::FamilyDelete {
                family: family_id(positional.next())?,
            },
            Some(other) => bail!("Unknown family subcommand: {}", other),
            None => bail!("family requires a subcommand (create, add, remove, delete)"),
        },
        Some(other) => bail!("Unknown command: {}", other),
        None => {
            print_help();
            std::process::exit(1);
        }
    };

    if let Some(extra) = positional.next() {
        bail!("Unexpected argument: {}", extra);
    }

    Ok(Cli {
        config_path,
        command,
    })
}

fn content_hash(arg: Option<String>) -> Result<ContentHash> {
    let arg = arg.ok_or_else(|| anyhow!("missing SHA256 argument"))?;
    ContentHash::parse(&arg).ok_or_else(|| anyhow!("not a SHA256 digest: {}", arg))
}

fn family_id(arg: Option<String>) -> Result<FamilyId> {
    let arg = arg.ok_or_else(|| anyhow!("missing family id"))?;
    let id = arg
        .parse::<i64>()
        .map_err(|_| anyhow!("not a family id: {}", arg))?;
    Ok(FamilyId(id))
}

fn print_help() {
    println!(
        r#"bijutsu - media archive with visual-similarity families

USAGE:
    bijutsu [OPTIONS] <COMMAND>

COMMANDS:
    init                            Create the database schema
    ingest <PATH>... [--tag NAME]   Ingest files or directories
    resolve <SHA256>                Re-run family resolution for a stored file
    families [--json]               List families with their members
    family create <SHA256>          Create a family with the given parent
    family add <ID> <SHA256>        Add a child to a family
    family remove <ID> <SHA256>     Remove a child from a family
    family delete <ID>              Delete a family (files are kept)

OPTIONS:
    --config, -c PATH   Path to config file
    --tag, -t NAME      Tag applied to every ingested file (repeatable)
    --json              Machine-readable output
    --version, -V       Show version
    --help, -h          Show this help message

ENVIRONMENT:
    BIJUTSU_CONFIG      Path to config file (overrides default location)
    BIJUTSU_LOG         Log filter (trace, debug, info, warn, error)

Config file location: $XDG_CONFIG_HOME/bijutsu/config.toml"#
    );
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = match parse_args() {
        Ok(cli) => cli,
        Err(e) => {
            eprintln!("Error: {}", e);
            eprintln!("Run `bijutsu --help` for usage.");
            std::process::exit(2);
        }
    };

    // Initialize logging (uses journald on Linux, file fallback otherwise)
    let _ = logging::init(None);

    let config = match cli.config_path {
        Some(path) => Config::load_from(&path)?,
        None => Config::load()?,
    };

    let mut db = Database::open(&config.database)?;
    db.initialize()?;

    match cli.command {
        Command::Init => {
            println!("Database ready");
        }
        Command::Ingest { paths, tags } => {
            let ingestor = Ingestor::new(config, db.connector()?);
            let report = ingestor.ingest(&paths, &tags, None).await?;
            println!(
                "Ingested {} files ({} duplicates, {} failed)",
                report.ingested, report.duplicates, report.failed
            );
            for (file, resolution) in report.resolutions.iter().filter(|(_, r)| r.changed()) {
                println!("  {}: {}", file.short(), resolution);
            }
        }
        Command::Resolve { file } => {
            let record = db
                .get_file(&file)?
                .ok_or_else(|| anyhow!("file {} is not stored", file))?;
            let hash = record
                .perceptual_hash
                .ok_or_else(|| anyhow!("file {} has no perceptual hash", file))?;
            let mut resolver = FamilyResolver::new(db).with_threshold(config.similarity.threshold);
            let resolution = resolver.resolve(&file, hash)?;
            println!("{}: {}", file.short(), resolution);
        }
        Command::Families { json } => {
            let families = db.list_families()?;
            if json {
                println!("{}", serde_json::to_string_pretty(&families)?);
            } else if families.is_empty() {
                println!("No families");
            } else {
                for family in families {
                    println!("family {} parent {}", family.id, family.parent);
                    for child in family.children {
                        println!("    {}", child);
                    }
                }
            }
        }
        Command::FamilyCreate { parent } => {
            let family = manual::create_family(&mut db, &parent)?;
            println!("Created family {}", family.id);
        }
        Command::FamilyAdd { family, child } => {
            manual::add_child(&mut db, family, &child)?;
            println!("Added {} to family {}", child.short(), family);
        }
        Command::FamilyRemove { family, child } => {
            manual::remove_child(&mut db, family, &child)?;
            println!("Removed {} from family {}", child.short(), family);
        }
        Command::FamilyDelete { family } => {
            let unlinked = manual::delete_family(&mut db, family)?;
            println!("Deleted family {} ({} children unlinked)", family, unlinked);
        }
    }

    Ok(())
}
