//! CLI parsing and orchestration. Parses args, runs site extraction -> cover -> EPUB, or flushes the cache. Maps errors to exit codes.

use crate::config::{self, Config};
use crate::cover::make_cover;
use crate::epub::{build_files, epub_meta, write_epub, EpubError, EpubVersion, WriteOptions};
use crate::fetch::{CookieJar, FetchError, Fetcher, ResponseCache, RetryPolicy, Session, DEFAULT_MAX_AGE};
use crate::options::{defaults_for, parse_overrides, OptionKind, OptionLayers, OptionMap, SiteOption};
use crate::sites::{open_story, Registry, RunState, Site, SiteContext, SiteError, DEFAULT_IMAGE_MAX_BYTES};
use clap::parser::ValueSource;
use clap::{ArgAction, ArgMatches, CommandFactory, FromArgMatches, Parser, Subcommand};
use serde_json::Value;
use std::cell::RefCell;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

const DEFAULT_COOKIE_FILE: &str = "storyleech.cookies";

/// CLI error carrying exit code and message.
#[derive(Debug, Error)]
pub enum CliRunError {
    #[error("{0}")]
    InvalidInput(String),

    #[error("{0}")]
    Site(#[from] SiteError),

    #[error("{0}")]
    Fetch(#[from] FetchError),

    #[error("{0}")]
    Epub(#[from] EpubError),
}

impl CliRunError {
    pub fn exit_code(&self) -> i32 {
        match self {
            CliRunError::InvalidInput(_) => 1,
            CliRunError::Site(_) | CliRunError::Fetch(_) => 2,
            CliRunError::Epub(_) => 3,
        }
    }
}

#[derive(Parser, Debug)]
#[command(name = "storyleech")]
#[command(about = "Harvest serialized fiction from the web into EPUB")]
#[command(
    after_help = "Config file keys (output_dir, user_agent, request_delay_secs, timeout_secs, retries, retry_delay_secs, cache_dir, cache_max_age_secs, cookie_file, epub3, image_max_bytes, [logins.<Site>], [site_options.<Site>], [cover]) are read from ./storyleech.toml or the user config dir. CLI flags override config."
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Debug logging and the full error chain on failure.
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Download a story and write it as an EPUB (the default when only a URL is given).
    Download(DownloadArgs),
    /// Delete every cached response.
    Flush,
}

#[derive(clap::Args, Debug)]
pub struct DownloadArgs {
    /// Story URL, or the path of a JSON site definition.
    pub url: String,

    /// JSON object of site options, applied over config values.
    #[arg(long, value_name = "JSON")]
    pub site_options: Option<String>,

    /// Serve fresh pages from the response cache (default).
    #[arg(long, overrides_with = "no_cache")]
    pub cache: bool,

    /// Fetch every page from the network. Responses are still cached.
    #[arg(long, overrides_with = "cache")]
    pub no_cache: bool,

    /// Output directory. Default: config output_dir, else the current directory.
    #[arg(short = 'o', long = "output-dir")]
    pub output_dir: Option<PathBuf>,

    /// Write EPUB 3 instead of EPUB 2.
    #[arg(long)]
    pub epub3: bool,

    /// Replace an existing book of the same name instead of merging into it.
    #[arg(long)]
    pub no_merge: bool,
}

/// Parsed command line plus the site flags the user actually typed.
#[derive(Debug)]
pub struct Invocation {
    pub cli: Cli,
    pub site_flags: OptionMap,
}

const SUBCOMMANDS: &[&str] = &["download", "flush", "help"];

/// Insert `download` when the first argument is not a subcommand or a help/version flag.
pub fn normalize_args(mut args: Vec<OsString>) -> Vec<OsString> {
    let Some(first) = args.get(1).and_then(|a| a.to_str()) else {
        return args;
    };
    let passthrough = SUBCOMMANDS.contains(&first)
        || matches!(first, "-h" | "--help" | "-V" | "--version");
    if !passthrough {
        args.insert(1, OsString::from("download"));
    }
    args
}

fn site_arg(def: &SiteOption) -> clap::Arg {
    let arg = clap::Arg::new(def.flag).long(def.flag).help(def.help);
    match &def.kind {
        OptionKind::Bool => {
            let arg = arg.action(ArgAction::SetTrue);
            match def.negated_flag {
                Some(neg) => arg.overrides_with(neg),
                None => arg,
            }
        }
        OptionKind::Int => arg.value_parser(clap::value_parser!(i64)).value_name("N"),
        OptionKind::Str => arg.value_name("VALUE"),
        OptionKind::Choice(choices) => arg
            .value_parser(clap::builder::PossibleValuesParser::new(choices.iter().copied()))
            .value_name("MODE"),
    }
}

fn negated_arg(def: &SiteOption, neg: &'static str) -> clap::Arg {
    clap::Arg::new(neg)
        .long(neg)
        .action(ArgAction::SetTrue)
        .overrides_with(def.flag)
        .help(format!("Turn off --{}.", def.flag))
}

/// The full command, with every exposed site option added to `download`.
pub fn command(defs: &[SiteOption]) -> clap::Command {
    Cli::command().mut_subcommand("download", |mut sub| {
        for def in defs.iter().filter(|d| d.exposed) {
            sub = sub.arg(site_arg(def));
            if let Some(neg) = def.negated_flag {
                sub = sub.arg(negated_arg(def, neg));
            }
        }
        sub
    })
}

fn typed(matches: &ArgMatches, id: &str) -> bool {
    matches.value_source(id) == Some(ValueSource::CommandLine)
}

/// Values of site flags present on the command line. Untyped flags are absent.
fn site_flags(matches: &ArgMatches, defs: &[SiteOption]) -> OptionMap {
    let mut flags = OptionMap::new();
    for def in defs.iter().filter(|d| d.exposed) {
        let value = match &def.kind {
            OptionKind::Bool => {
                if typed(matches, def.flag) {
                    Some(Value::Bool(true))
                } else if def.negated_flag.is_some_and(|neg| typed(matches, neg)) {
                    Some(Value::Bool(false))
                } else {
                    None
                }
            }
            OptionKind::Int if typed(matches, def.flag) => {
                matches.get_one::<i64>(def.flag).map(|n| Value::from(*n))
            }
            OptionKind::Str | OptionKind::Choice(_) if typed(matches, def.flag) => matches
                .get_one::<String>(def.flag)
                .map(|s| Value::String(s.clone())),
            _ => None,
        };
        if let Some(value) = value {
            flags.insert(def.name.to_string(), value);
        }
    }
    flags
}

pub fn try_parse_from<I, T>(args: I, registry: &Registry) -> Result<Invocation, clap::Error>
where
    I: IntoIterator<Item = T>,
    T: Into<OsString>,
{
    let defs = registry.all_option_defs();
    let args = normalize_args(args.into_iter().map(Into::into).collect());
    let matches = command(&defs).try_get_matches_from(args)?;
    let cli = Cli::from_arg_matches(&matches)?;
    let site_flags = matches
        .subcommand_matches("download")
        .map(|m| site_flags(m, &defs))
        .unwrap_or_default();
    Ok(Invocation { cli, site_flags })
}

/// Parse the process arguments, exiting with clap's usage message on error.
pub fn parse(registry: &Registry) -> Invocation {
    try_parse_from(std::env::args_os(), registry).unwrap_or_else(|e| e.exit())
}

/// Option layers for one site. Flags belonging to other sites are dropped.
fn site_layers(
    site: &dyn Site,
    config: &Config,
    overrides: Option<&str>,
    flags: &OptionMap,
) -> Result<OptionLayers, CliRunError> {
    let defs = site.option_defs();
    let overrides = match overrides {
        Some(json) => parse_overrides(json).map_err(|e| CliRunError::InvalidInput(e.to_string()))?,
        None => OptionMap::new(),
    };
    let mut own = OptionMap::new();
    for (name, value) in flags {
        if defs.iter().any(|d| d.name == name) {
            own.insert(name.clone(), value.clone());
        } else {
            debug!("--{} does not apply to {}; ignored", name, site.key());
        }
    }
    Ok(OptionLayers {
        defaults: defaults_for(&defs),
        config: config.site_options_for(site.key()),
        overrides,
        flags: own,
    })
}

/// Ensure the output directory exists.
fn validate_output_dir(dir: &Path) -> Result<(), CliRunError> {
    if !dir.as_os_str().is_empty() && !dir.is_dir() {
        return Err(CliRunError::InvalidInput(format!(
            "Cannot write output: {}: directory does not exist.",
            dir.display()
        )));
    }
    Ok(())
}

fn open_cache(config: &Config) -> Result<ResponseCache, FetchError> {
    let dir = config
        .cache_dir
        .clone()
        .unwrap_or_else(ResponseCache::default_dir);
    let max_age = config
        .cache_max_age_secs
        .map(Duration::from_secs)
        .unwrap_or(DEFAULT_MAX_AGE);
    ResponseCache::open(dir, max_age)
}

fn build_session(config: &Config, use_cache: bool) -> Result<Session, CliRunError> {
    let cookie_file = config
        .cookie_file
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_COOKIE_FILE));
    let mut builder = Fetcher::builder()
        .cache(open_cache(config)?)
        .cookies(CookieJar::load(cookie_file));
    if let Some(delay) = config.request_delay_secs {
        builder = builder.delay(Duration::from_secs(delay));
    }
    if let Some(timeout) = config.timeout_secs {
        builder = builder.timeout_secs(timeout);
    }
    if let Some(ua) = &config.user_agent {
        builder = builder.user_agent(ua.clone());
    }
    let fetcher = builder
        .build()
        .map_err(|e| CliRunError::InvalidInput(e.to_string()))?;

    let defaults = RetryPolicy::default();
    let retry = RetryPolicy {
        retries: config.retries.unwrap_or(defaults.retries),
        default_delay: config
            .retry_delay_secs
            .map(Duration::from_secs)
            .unwrap_or(defaults.default_delay),
        ..defaults
    };
    Ok(Session::new(fetcher, retry).with_cache(use_cache))
}

fn spinner_message(state: RunState) -> Option<String> {
    match state {
        RunState::FetchingIndex => Some("Fetching index".to_string()),
        RunState::FetchingChapter {
            number,
            total: Some(total),
        } => Some(format!("Fetching chapter {}/{}", number, total)),
        RunState::FetchingChapter { number, total: None } => {
            Some(format!("Fetching chapter {}", number))
        }
        RunState::Idle | RunState::Done | RunState::Failed => None,
    }
}

fn download(
    args: &DownloadArgs,
    site_flags: &OptionMap,
    registry: &Registry,
    config: &Config,
) -> Result<(), CliRunError> {
    let (site, url) = registry.resolve(&args.url).map_err(|e| match e {
        SiteError::InvalidUrl { .. } | SiteError::NoHandler { .. } => CliRunError::InvalidInput(
            format!(
                "{}. Expected a story URL such as https://www.royalroad.com/fiction/12345, or a site definition .json file.",
                e
            ),
        ),
        other => CliRunError::Site(other),
    })?;

    let layers = site_layers(site, config, args.site_options.as_deref(), site_flags)?;
    let output_dir = args
        .output_dir
        .clone()
        .or_else(|| config.output_dir.clone())
        .unwrap_or_else(|| PathBuf::from("."));
    validate_output_dir(&output_dir)?;

    let mut session = build_session(config, !args.no_cache)?;

    let progress_state: RefCell<Option<indicatif::ProgressBar>> = RefCell::new(None);
    let progress_cb = |state: RunState| {
        let mut pb = progress_state.borrow_mut();
        match spinner_message(state) {
            Some(msg) => {
                let bar = pb.get_or_insert_with(|| {
                    let bar = indicatif::ProgressBar::new_spinner();
                    let style = indicatif::ProgressStyle::default_spinner()
                        .template("{spinner} {msg} ({elapsed})")
                        .unwrap_or_else(|_| indicatif::ProgressStyle::default_spinner())
                        .tick_chars("⠋⠙⠹⠸⠼⠴⠦⠧⠇⠏ ");
                    bar.set_style(style);
                    bar.enable_steady_tick(Duration::from_millis(80));
                    bar
                });
                bar.set_message(msg);
            }
            None => {
                if let Some(bar) = pb.take() {
                    bar.finish_and_clear();
                }
            }
        }
    };

    let creds = config.credentials_for(site.key());
    let image_limit = config.image_max_bytes.unwrap_or(DEFAULT_IMAGE_MAX_BYTES);
    let story = {
        let mut ctx = SiteContext::new(&mut session, layers.resolve())
            .with_progress(&progress_cb)
            .with_image_limit(image_limit);
        open_story(site, &mut ctx, &url, creds.as_ref())?
    };
    info!(
        "{} by {}: {} chapter(s)",
        story.title,
        story.author,
        story.chapters().len()
    );

    let cover = make_cover(&mut session, &story, &config.cover);
    let files = build_files(&story, cover, chrono::Utc::now());
    let version = if args.epub3 || config.epub3 == Some(true) {
        EpubVersion::Epub3
    } else {
        EpubVersion::Epub2
    };
    let opts = WriteOptions {
        output_dir,
        version,
        merge: !args.no_merge,
    };
    let path = write_epub(&story.title, &files, &epub_meta(&story), &opts)?;
    eprintln!("Wrote {}", path.display());
    Ok(())
}

fn flush(config: &Config) -> Result<(), CliRunError> {
    let cache = open_cache(config)?;
    let report = cache.flush()?;
    info!(
        "Flushed {} cached page(s), {} bytes, from {}",
        report.entries,
        report.bytes,
        cache.dir().display()
    );
    Ok(())
}

/// Entry point for the CLI. Returns Ok(()) on success; Err with exit code and message on failure.
pub fn run(invocation: &Invocation, registry: &Registry) -> Result<(), CliRunError> {
    let config = config::load_config()
        .map_err(CliRunError::InvalidInput)?
        .unwrap_or_default();
    match &invocation.cli.command {
        Command::Download(args) => download(args, &invocation.site_flags, registry, &config),
        Command::Flush => flush(&config),
    }
}
