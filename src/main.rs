use balancer_bridge::{
    Bridge, BridgeConfig, BridgeError, BulkOptions, Capability, Credentials, EpisodeKey,
    ManifestEncoding, Provider, ProviderKind, RetryPolicy, StreamSet, TranslationChoice,
};
use clap::{Args, Parser, Subcommand};
use indexmap::IndexMap;
use serde::Serialize;
use std::io::{self, Write};
use std::path::PathBuf;
use std::process;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "balancer-bridge")]
#[command(about = "Resolve playable stream links from video balancer sites", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    #[arg(long, global = true, help = "Print machine-readable JSON")]
    json: bool,

    #[arg(short, long, global = true, help = "Enable debug logging")]
    verbose: bool,

    #[command(flatten)]
    upstream: UpstreamArgs,
}

#[derive(Args)]
struct UpstreamArgs {
    #[arg(long, global = true, env = "BALANCER_BRIDGE_REZKA_HOST", default_value = "rezka.fi")]
    rezka_host: String,

    #[arg(long, global = true, env = "REZKA_EMAIL", help = "Portal login")]
    rezka_email: Option<String>,

    #[arg(long, global = true, env = "REZKA_PASSWORD", hide_env_values = true)]
    rezka_password: Option<String>,

    #[arg(long, global = true, help = "Drop cached portal cookies and log in again")]
    relogin: bool,

    #[arg(long, global = true, env = "BALANCER_BRIDGE_CATALOG_URL")]
    catalog_url: Option<String>,

    #[arg(long, global = true, env = "BALANCER_BRIDGE_DISCOVERY_URL")]
    discovery_url: Option<String>,

    #[arg(long, global = true, env = "BALANCER_BRIDGE_TIMEOUT", default_value = "30", help = "Request timeout in seconds")]
    timeout: u64,

    #[arg(long, global = true, env = "BALANCER_BRIDGE_MANIFEST_ENCODING", default_value = "auto",
          help = "auto, plain, obfuscated, obfuscated-latin1")]
    manifest_encoding: ManifestEncoding,

    #[arg(long, global = true, env = "BALANCER_BRIDGE_WORKERS", default_value = "6")]
    workers: usize,

    #[arg(long, global = true, env = "BALANCER_BRIDGE_RETRIES", default_value = "2", help = "Attempts per episode")]
    retries: u32,

    #[arg(long, global = true, env = "BALANCER_BRIDGE_RETRY_FOREVER", help = "Retry failing episodes without limit")]
    retry_forever: bool,

    #[arg(long, global = true, env = "BALANCER_BRIDGE_BACKOFF_MS", default_value = "1000")]
    backoff_ms: u64,

    #[arg(long, global = true, env = "BALANCER_BRIDGE_PACING_MS", default_value = "500")]
    pacing_ms: u64,

    #[arg(long, global = true, env = "BALANCER_BRIDGE_CACHE_DIR")]
    cache_dir: Option<PathBuf>,
}

impl UpstreamArgs {
    fn into_config(self) -> BridgeConfig {
        let credentials = match (self.rezka_email, self.rezka_password) {
            (Some(login), Some(password)) => Some(Credentials { login, password }),
            _ => None,
        };
        let retry = RetryPolicy {
            max_attempts: (!self.retry_forever).then_some(self.retries),
            backoff: Duration::from_millis(self.backoff_ms),
        };
        let defaults = BridgeConfig::default();

        BridgeConfig {
            rezka_host: self.rezka_host,
            credentials,
            relogin: self.relogin,
            catalog_base_url: self.catalog_url,
            discovery_url: self.discovery_url.unwrap_or(defaults.discovery_url),
            timeout: Duration::from_secs(self.timeout),
            manifest_encoding: self.manifest_encoding,
            bulk: BulkOptions {
                workers: self.workers,
                retry,
            },
            pacing: Duration::from_millis(self.pacing_ms),
            cache_dir: self.cache_dir,
        }
    }
}

/// Which content to work on
#[derive(Args)]
struct Target {
    #[arg(long, help = "Portal page URL", conflicts_with_all = ["provider", "id"])]
    url: Option<String>,

    #[arg(long, help = "Provider name (hdrezka, vibix, turbo)", requires = "id")]
    provider: Option<ProviderKind>,

    #[arg(long, help = "Cross-reference id from the catalog")]
    id: Option<String>,

    #[arg(long, help = "Title, used to find the content on the portal")]
    query: Option<String>,
}

#[derive(Args)]
struct Selection {
    #[arg(long, short, help = "Translation id or label (default: the first one)")]
    translation: Option<String>,

    #[arg(long, short)]
    season: Option<String>,

    #[arg(long, short)]
    episode: Option<String>,
}

#[derive(Subcommand)]
enum Command {
    #[command(about = "Search the catalog")]
    Search { query: String },

    #[command(about = "List the providers serving a catalog id")]
    Providers {
        #[arg(long)]
        id: String,
        #[arg(long)]
        query: Option<String>,
    },

    #[command(about = "List translations")]
    Translations {
        #[command(flatten)]
        target: Target,
        #[arg(long, short)]
        season: Option<String>,
        #[arg(long, short)]
        episode: Option<String>,
    },

    #[command(about = "List seasons")]
    Seasons {
        #[command(flatten)]
        target: Target,
        #[arg(long, short)]
        translation: Option<String>,
    },

    #[command(about = "List the episodes of a season")]
    Episodes {
        #[command(flatten)]
        target: Target,
        #[arg(long, short)]
        translation: Option<String>,
        #[arg(long, short)]
        season: String,
    },

    #[command(about = "Resolve the streams of a movie or an episode")]
    Streams {
        #[command(flatten)]
        target: Target,
        #[command(flatten)]
        selection: Selection,
    },

    #[command(about = "Resolve every episode of a season")]
    SeasonStreams {
        #[command(flatten)]
        target: Target,
        #[arg(long, short)]
        translation: Option<String>,
        #[arg(long, short)]
        season: String,
    },

    #[command(about = "Look up the current catalog API host")]
    RefreshDomain,
}

fn main() {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_writer(io::stderr)
        .init();

    if let Err(e) = run(cli) {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}

fn run(cli: Cli) -> Result<(), BridgeError> {
    let json = cli.json;
    let mut bridge = Bridge::new(cli.upstream.into_config())?;

    match cli.command {
        Command::Search { query } => {
            let hits = bridge.search(&query)?;
            print(json, &hits, |out| {
                for hit in &hits {
                    writeln!(out, "{}\t{}", hit.id, hit.title)?;
                }
                Ok(())
            })
        }
        Command::Providers { id, query } => {
            let kinds = bridge.providers(&id, query.as_deref())?;
            print(json, &kinds, |out| {
                for kind in &kinds {
                    writeln!(out, "{kind}")?;
                }
                Ok(())
            })
        }
        Command::Translations {
            target,
            season,
            episode,
        } => {
            let provider = open(&bridge, &target, Capability::Translations)?;
            let at = episode_key(season, episode);
            let translations = provider.translations(at.as_ref())?;
            print(json, &translations, |out| print_pairs(out, translations.iter()))
        }
        Command::Seasons {
            target,
            translation,
        } => {
            let provider = open(&bridge, &target, Capability::Seasons)?;
            let (_, id) = provider
                .translations(None)?
                .resolve(&choice(translation.as_deref()))?;
            let seasons = provider.seasons(&id)?;
            print(json, &seasons, |out| print_map(out, &seasons))
        }
        Command::Episodes {
            target,
            translation,
            season,
        } => {
            let provider = open(&bridge, &target, Capability::Episodes)?;
            let (_, id) = provider
                .translations(None)?
                .resolve(&choice(translation.as_deref()))?;
            let episodes = provider.episodes(&id, &season)?;
            print(json, &episodes, |out| print_map(out, &episodes))
        }
        Command::Streams { target, selection } => {
            let provider = open(&bridge, &target, Capability::Streams)?;
            let at = episode_key(selection.season, selection.episode);
            let translation = choice(selection.translation.as_deref());
            let streams = provider.streams(&translation, at.as_ref())?;
            let streams = playable(&provider, streams);
            print(json, &streams, |out| print_streams(out, &streams))
        }
        Command::SeasonStreams {
            target,
            translation,
            season,
        } => {
            let provider = open(&bridge, &target, Capability::Streams)?;
            let translation = choice(translation.as_deref());
            let results = bridge.season_streams(&provider, &translation, &season, |done, total| {
                eprintln!("{done}/{total}");
            })?;
            let results: IndexMap<String, Option<StreamSet>> = results
                .into_iter()
                .map(|(episode, streams)| (episode, streams.map(|s| playable(&provider, s))))
                .collect();
            print(json, &results, |out| {
                for (episode, streams) in &results {
                    writeln!(out, "Episode {episode}")?;
                    match streams {
                        Some(streams) => print_streams(out, streams)?,
                        None => writeln!(out, "  unavailable")?,
                    }
                }
                Ok(())
            })
        }
        Command::RefreshDomain => {
            let base_url = bridge.refresh_domain()?;
            print(json, &base_url, |out| writeln!(out, "{base_url}"))
        }
    }
}

/// Opens the target and checks that it offers `needed`
fn open(bridge: &Bridge, target: &Target, needed: Capability) -> Result<Provider, BridgeError> {
    let provider = match &target.url {
        Some(url) => bridge.open_rezka_url(url)?,
        None => {
            let id = target.id.as_deref().ok_or_else(|| {
                balancer_bridge::ProviderError::NotFound(
                    "either --url or --id is required".to_string(),
                )
            })?;
            let kind = target.provider.unwrap_or(ProviderKind::Rezka);
            bridge.open_provider(kind, id, target.query.as_deref())?
        }
    };
    provider.require(needed)?;
    Ok(provider)
}

fn episode_key(season: Option<String>, episode: Option<String>) -> Option<EpisodeKey> {
    match (season, episode) {
        (Some(season), Some(episode)) => Some(EpisodeKey::new(season, episode)),
        _ => None,
    }
}

/// The first translation unless the user named one
fn choice(input: Option<&str>) -> TranslationChoice {
    input
        .map(TranslationChoice::from_user)
        .unwrap_or_default()
}

/// Rewrites every stream URL into the form set-top clients can play
fn playable(provider: &Provider, mut streams: StreamSet) -> StreamSet {
    if !provider.supports(Capability::PlayableUrl) {
        return streams;
    }
    for url in streams.resolutions.values_mut() {
        *url = provider.playable_url(url);
    }
    streams
}

fn print<T, F>(json: bool, value: &T, plain: F) -> Result<(), BridgeError>
where
    T: Serialize + ?Sized,
    F: FnOnce(&mut dyn Write) -> io::Result<()>,
{
    let stdout = io::stdout();
    write_output(&mut stdout.lock(), json, value, plain)
}

fn write_output<T, F>(out: &mut dyn Write, json: bool, value: &T, plain: F) -> Result<(), BridgeError>
where
    T: Serialize + ?Sized,
    F: FnOnce(&mut dyn Write) -> io::Result<()>,
{
    let written = if json {
        serde_json::to_string_pretty(value)
            .map_err(io::Error::other)
            .and_then(|text| writeln!(out, "{text}"))
    } else {
        plain(out)
    };

    // broken pipes (output piped into `head`) are ignored
    match written {
        Err(e) if e.kind() != io::ErrorKind::BrokenPipe => Err(BridgeError::Output(e)),
        _ => Ok(()),
    }
}

fn print_pairs<'a>(
    out: &mut dyn Write,
    pairs: impl Iterator<Item = (&'a str, &'a str)>,
) -> io::Result<()> {
    for (label, id) in pairs {
        writeln!(out, "{id}\t{label}")?;
    }
    Ok(())
}

fn print_map(out: &mut dyn Write, map: &IndexMap<String, String>) -> io::Result<()> {
    print_pairs(out, map.iter().map(|(id, label)| (label.as_str(), id.as_str())))
}

fn print_streams(out: &mut dyn Write, streams: &StreamSet) -> io::Result<()> {
    for (resolution, url) in &streams.resolutions {
        writeln!(out, "  {resolution}\t{url}")?;
    }
    for (code, track) in streams.subtitles.iter() {
        writeln!(out, "  subtitles {code} ({})\t{}", track.label, track.url)?;
    }
    Ok(())
}
