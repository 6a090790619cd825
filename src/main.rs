//! Pupistry CLI
//!
//! Entry point for the `pupistry` command-line tool. This is the only place
//! that decides process exit status.

use clap::{Parser, Subcommand};
use pupistry::bootstrap;
use pupistry::cache::{CacheGc, RetentionPolicy};
use pupistry::config::StoreBackend;
use pupistry::tools::{CommandFetcher, CommandSecrets, Ed25519Signer, Signer, TarArchiver};
use pupistry::{
    ApplyOutcome, ArtifactFetcher, BuildOutcome, Builder, Cache, Config, ConfigError, Error,
    Installer, Mode, PublishOutcome, Publisher, ReadBack, Result, VersionId, VersionSelector,
};
use pupistry_store::{AwsCliStore, DirectoryStore, ObjectStore, Profile};
use serde_json::json;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "pupistry")]
#[command(about = "Build, publish and install signed configuration artifacts", version)]
struct Cli {
    /// Settings file (default: ~/.config/pupistry/settings.toml)
    #[arg(long, short = 'c', global = true)]
    config: Option<PathBuf>,

    /// Override the cache root
    #[arg(long, global = true)]
    cache_dir: Option<PathBuf>,

    /// Override the install target
    #[arg(long, global = true)]
    target: Option<PathBuf>,

    /// Increase log verbosity (-v info, -vv debug)
    #[arg(long, short = 'v', action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Fetch sources and build a new artifact version
    Build,

    /// Sign and upload a built version (default: local latest)
    Push {
        version: Option<String>,
    },

    /// Download a published version into the cache (default: latest)
    Fetch {
        version: Option<String>,
    },

    /// Fetch, verify and install a version into the target
    Apply {
        version: Option<String>,

        /// Reinstall even if the target already runs this version
        #[arg(long)]
        force: bool,
    },

    /// Show cached, latest and installed versions
    Status {
        /// Also list versions published to the store
        #[arg(long)]
        remote: bool,
    },

    /// Remove scratch directories and superseded cached versions
    Gc {
        /// Versions to keep besides latest (default: general.gc_keep)
        #[arg(long)]
        keep: Option<usize>,

        #[arg(long)]
        dry_run: bool,
    },

    /// Signing key management
    Keys {
        #[command(subcommand)]
        action: KeysCommands,
    },

    /// Print an agent bootstrap script
    Bootstrap {
        /// Handlebars template replacing the built-in script
        #[arg(long)]
        template: Option<PathBuf>,

        /// Settings directory on the agent
        #[arg(long)]
        config_dir: Option<PathBuf>,
    },

    /// Configuration commands
    Config {
        #[command(subcommand)]
        action: ConfigCommands,
    },
}

#[derive(Subcommand)]
enum KeysCommands {
    /// Generate an Ed25519 signing key pair
    Generate {
        #[arg(long)]
        out: PathBuf,
    },
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// Print the effective configuration with secrets masked
    Show,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let default_level = match cli.verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {}", e);
            let mut source = std::error::Error::source(&e);
            while let Some(cause) = source {
                eprintln!("  caused by: {}", cause);
                source = std::error::Error::source(cause);
            }
            ExitCode::from(e.exit_code())
        }
    }
}

fn run(cli: Cli) -> Result<()> {
    let overrides = json!({
        "general": { "cache_dir": cli.cache_dir },
        "agent": { "target": cli.target },
    });
    let config = Config::load(cli.config.as_deref(), Some(overrides))?;

    match cli.command {
        Commands::Build => run_build(&config),
        Commands::Push { version } => run_push(&config, version.as_deref()),
        Commands::Fetch { version } => run_fetch(&config, version.as_deref()),
        Commands::Apply { version, force } => run_apply(&config, version.as_deref(), force),
        Commands::Status { remote } => run_status(&config, remote),
        Commands::Gc { keep, dry_run } => run_gc(&config, keep, dry_run),
        Commands::Keys {
            action: KeysCommands::Generate { out },
        } => run_keys_generate(&out),
        Commands::Bootstrap {
            template,
            config_dir,
        } => {
            config.validate_for(Mode::Bootstrap)?;
            let config_dir = config_dir.unwrap_or_else(bootstrap::default_config_dir);
            print!("{}", bootstrap::render(&config, template.as_deref(), &config_dir)?);
            Ok(())
        }
        Commands::Config {
            action: ConfigCommands::Show,
        } => {
            let rendered = serde_json::to_string_pretty(&config.redacted())
                .map_err(|e| ConfigError::Invalid(e.to_string()))?;
            println!("{}", rendered);
            Ok(())
        }
    }
}

fn run_build(config: &Config) -> Result<()> {
    config.validate_for(Mode::Build)?;
    let cache = Cache::open(&config.general.cache_dir)?;
    let fetcher = CommandFetcher::new(config.build.fetch_command.clone());
    let archiver = TarArchiver::new();
    let secrets = CommandSecrets::from_config(&config.build.secrets);

    match Builder::new(config, &cache, &fetcher, &archiver, &secrets).build()? {
        BuildOutcome::Built(version) => println!("built version {}", version),
        BuildOutcome::Unchanged(version) => {
            println!("no changes: version {} already built, nothing to do", version)
        }
    }
    Ok(())
}

fn run_push(config: &Config, version: Option<&str>) -> Result<()> {
    config.validate_for(Mode::Publish)?;
    let selector = VersionSelector::from_arg(version)?;
    let cache = Cache::open(&config.general.cache_dir)?;
    let store = open_store(config, Profile::Build)?;

    let signer = if config.signing.enabled {
        Some(load_signer(config, true)?)
    } else {
        None
    };
    let agent_store = match config.credentials(Profile::Agent) {
        Some(_) => Some(open_store(config, Profile::Agent)?),
        None => None,
    };

    let mut publisher = Publisher::new(config, &cache, &store);
    if let Some(ref signer) = signer {
        publisher = publisher.with_signer(signer as &dyn Signer);
    }
    if let Some(ref agent_store) = agent_store {
        publisher = publisher.with_agent_store(agent_store);
    }

    match publisher.publish(&selector)? {
        PublishOutcome::Published {
            version,
            signed,
            readback,
        } => {
            let signed = if signed { "signed" } else { "UNSIGNED" };
            println!("published version {} ({}) to {}", version, signed, store.describe());
            match readback {
                ReadBack::Passed => println!("agent credentials can fetch {}", version),
                ReadBack::Failed(reason) => {
                    println!("warning: agent credentials cannot fetch {}: {}", version, reason)
                }
                ReadBack::Skipped => {}
            }
        }
        PublishOutcome::AlreadyPublished(version) => {
            println!("version {} is already published as latest, nothing to do", version)
        }
    }
    Ok(())
}

fn run_fetch(config: &Config, version: Option<&str>) -> Result<()> {
    config.validate_for(Mode::Fetch)?;
    let selector = VersionSelector::from_arg(version)?;
    let cache = Cache::open(&config.general.cache_dir)?;
    let store = open_store(config, Profile::Agent)?;

    let version = ArtifactFetcher::new(&cache, &store).fetch(&selector)?;
    println!("fetched version {}", version);
    Ok(())
}

fn run_apply(config: &Config, version: Option<&str>, force: bool) -> Result<()> {
    config.validate_for(Mode::Install)?;
    let selector = VersionSelector::from_arg(version)?;
    let cache = Cache::open(&config.general.cache_dir)?;
    let store = open_store(config, Profile::Agent)?;
    let archiver = TarArchiver::new();
    let secrets = CommandSecrets::from_config(&config.build.secrets);

    let verifier = if config.agent.verify_signatures {
        Some(load_signer(config, false)?)
    } else {
        None
    };

    let mut installer = Installer::new(config, &cache, &archiver, &secrets);
    if let Some(ref verifier) = verifier {
        installer = installer.with_verifier(verifier as &dyn Signer);
    }

    let fetcher = ArtifactFetcher::new(&cache, &store);
    match installer.apply(&fetcher, &selector, force)? {
        ApplyOutcome::Applied(version) => println!("installed version {}", version),
        ApplyOutcome::AlreadyInstalled(version) => {
            println!("version {} already installed, nothing to do", version)
        }
    }
    Ok(())
}

fn run_status(config: &Config, remote: bool) -> Result<()> {
    let cache = Cache::open(&config.general.cache_dir)?;
    let archiver = TarArchiver::new();
    let secrets = CommandSecrets::disabled();
    let installer = Installer::new(config, &cache, &archiver, &secrets);

    let show = |v: Option<VersionId>| v.map(|v| v.to_string()).unwrap_or_else(|| "none".to_string());
    println!("cache:     {}", cache.root().display());
    println!("latest:    {}", show(installer.latest_fetched()?));
    println!("installed: {}", show(installer.installed_version()?));

    let versions = cache.versions()?;
    println!("cached:    {} version(s)", versions.len());
    for version in &versions {
        let marker = if cache.has_version(version) { "" } else { " (incomplete)" };
        println!("  {}{}", version, marker);
    }

    if remote {
        config.validate_for(Mode::Fetch)?;
        let store = open_store(config, Profile::Agent)?;
        let keys = store
            .list()
            .map_err(|e| Error::store("list", store.describe(), e))?;
        let published: Vec<&str> = keys
            .iter()
            .filter_map(|k| k.strip_prefix("manifest.")?.strip_suffix(".yaml"))
            .filter(|id| VersionId::parse(id).is_ok())
            .collect();
        println!("published: {} version(s) in {}", published.len(), store.describe());
        for id in published {
            println!("  {}", id);
        }
    }
    Ok(())
}

fn run_gc(config: &Config, keep: Option<usize>, dry_run: bool) -> Result<()> {
    let cache = Cache::open(&config.general.cache_dir)?;
    let mut policy = RetentionPolicy::keep_last_n(keep.unwrap_or(config.general.gc_keep));
    if dry_run {
        policy = policy.with_dry_run();
    }

    let result = CacheGc::new(&cache, policy).run()?;
    let verb = if dry_run { "would remove" } else { "removed" };
    println!(
        "{} {} version(s) and {} scratch dir(s), {} bytes",
        verb,
        result.removed_versions.len(),
        result.removed_scratch,
        result.bytes_reclaimed
    );
    for version in &result.removed_versions {
        println!("  {}", version);
    }
    for error in &result.errors {
        eprintln!("warning: {}", error);
    }
    Ok(())
}

fn run_keys_generate(out: &std::path::Path) -> Result<()> {
    let (private, public) = Ed25519Signer::write_keypair(out)
        .map_err(|e| Error::tool("key generation", e.into()))?;
    let signer = Ed25519Signer::from_key_files(Some(&private), &public)
        .map_err(|e| Error::tool("key generation", e.into()))?;
    println!("private key: {}", private.display());
    println!("public key:  {}", public.display());
    println!("fingerprint: {}", signer.fingerprint());
    Ok(())
}

/// Load signing keys; agents only need the public half.
fn load_signer(config: &Config, with_private: bool) -> Result<Ed25519Signer> {
    let public = config
        .signing
        .public_key
        .as_deref()
        .ok_or_else(|| ConfigError::Missing {
            key: "signing.public_key".to_string(),
        })?;
    let private = if with_private {
        Some(config.signing.private_key.as_deref().ok_or_else(|| ConfigError::Missing {
            key: "signing.private_key".to_string(),
        })?)
    } else {
        None
    };
    Ed25519Signer::from_key_files(private, public).map_err(|e| Error::tool("loading signing keys", e.into()))
}

fn open_store(config: &Config, profile: Profile) -> Result<Box<dyn ObjectStore>> {
    let location = config.store_location()?;
    let store: Box<dyn ObjectStore> = match config.store.backend {
        StoreBackend::Directory => {
            let root = config.store.root.as_deref().ok_or_else(|| ConfigError::Missing {
                key: "store.root".to_string(),
            })?;
            Box::new(DirectoryStore::new(root, location))
        }
        StoreBackend::AwsCli => Box::new(
            AwsCliStore::new(location, profile)
                .with_credentials(config.credentials(profile).cloned())
                .with_endpoint(config.store.endpoint.clone()),
        ),
    };
    tracing::debug!("using store {} with {} profile", store.describe(), profile.as_str());
    Ok(store)
}
