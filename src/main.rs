//! a3s-serp CLI - scrape search engine result pages.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use a3s_serp::{
    build_jobs, scheduler, CacheStore, DefaultTransportFactory, LogFormat, OutputWriter,
    ProxyPool, ScrapeConfig, ScrapeError, ScrapeMethod, Scheduler, SearchType, SerpStore,
};

/// a3s-serp - multi engine search results scraper
#[derive(Parser)]
#[command(name = "a3s-serp")]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// TOML configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Increase log verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Log output format
    #[arg(long, global = true)]
    log_format: Option<LogFormatArg>,
}

#[derive(Subcommand)]
enum Commands {
    /// Scrape result pages for the configured keywords
    Scrape(Overrides),

    /// Print the effective configuration as TOML
    ShowConfig(Overrides),

    /// Probe every configured proxy and report its status
    CheckProxies(Overrides),

    /// Remove expired (or all) cached pages
    PurgeCache {
        /// Remove every entry, not only expired ones
        #[arg(long)]
        all: bool,

        #[command(flatten)]
        overrides: Overrides,
    },
}

/// Command line settings that take precedence over the config file.
#[derive(Args, Default)]
struct Overrides {
    /// Single keyword to search for
    #[arg(short = 'q', long)]
    keyword: Option<String>,

    /// Keywords to search for (comma-separated)
    #[arg(long, value_delimiter = ',')]
    keywords: Vec<String>,

    /// Keyword file: one query per line, or a JSON job list
    #[arg(long)]
    keyword_file: Option<PathBuf>,

    /// Search engines (comma-separated, `*` for all)
    #[arg(short = 'e', long)]
    search_engines: Option<String>,

    /// Transport: http, http-async or selenium
    #[arg(short = 'm', long)]
    scrape_method: Option<ScrapeMethod>,

    /// Result pages to fetch per keyword
    #[arg(short = 'p', long)]
    num_pages_for_keyword: Option<u32>,

    /// Results per page
    #[arg(short = 'n', long)]
    num_results_per_page: Option<u32>,

    /// normal, image, video or news
    #[arg(short = 't', long)]
    search_type: Option<SearchType>,

    /// Parallel workers for http and selenium
    #[arg(short = 'w', long)]
    num_workers: Option<usize>,

    /// Requests in flight for http-async
    #[arg(long)]
    max_concurrent_requests: Option<usize>,

    /// Proxy file (`protocol host:port [user:pass]` per line)
    #[arg(long)]
    proxy_file: Option<PathBuf>,

    /// Never scrape from the local IP
    #[arg(long)]
    no_own_ip: bool,

    /// Skip the proxy health check
    #[arg(long)]
    no_proxy_check: bool,

    /// Output file; the extension selects CSV or JSON
    #[arg(short = 'o', long)]
    output_filename: Option<PathBuf>,

    /// SQLite database URL
    #[arg(long)]
    database_url: Option<String>,

    /// Disable the page cache
    #[arg(long)]
    no_caching: bool,

    /// Cache directory
    #[arg(long)]
    cachedir: Option<PathBuf>,

    /// Show the browser window
    #[arg(long)]
    show_browser: bool,

    /// Prompt for captchas instead of giving up
    #[arg(long)]
    manual_captcha_solving: bool,

    /// Print the plan and exit without network traffic
    #[arg(long)]
    simulate: bool,
}

impl Overrides {
    fn apply(self, config: &mut ScrapeConfig) {
        if self.keyword.is_some() {
            config.keyword = self.keyword;
        }
        if !self.keywords.is_empty() {
            config.keywords = self.keywords;
        }
        if self.keyword_file.is_some() {
            config.keyword_file = self.keyword_file;
        }
        if let Some(engines) = self.search_engines {
            config.search_engines = engines.split(',').map(|s| s.trim().to_string()).collect();
        }
        if let Some(method) = self.scrape_method {
            config.scrape_method = method;
        }
        if let Some(pages) = self.num_pages_for_keyword {
            config.num_pages_for_keyword = pages;
        }
        if let Some(n) = self.num_results_per_page {
            config.num_results_per_page = n;
        }
        if let Some(search_type) = self.search_type {
            config.search_type = search_type;
        }
        if let Some(n) = self.num_workers {
            config.num_workers = n;
        }
        if let Some(n) = self.max_concurrent_requests {
            config.max_concurrent_requests = n;
        }
        if self.proxy_file.is_some() {
            config.proxy_file = self.proxy_file;
        }
        if self.no_own_ip {
            config.use_own_ip = false;
        }
        if self.no_proxy_check {
            config.check_proxies = false;
        }
        if self.output_filename.is_some() {
            config.output_filename = self.output_filename;
        }
        if let Some(url) = self.database_url {
            config.database_url = url;
        }
        if self.no_caching {
            config.do_caching = false;
        }
        if let Some(dir) = self.cachedir {
            config.cachedir = dir;
        }
        if self.show_browser {
            config.headless = false;
        }
        if self.manual_captcha_solving {
            config.manual_captcha_solving = true;
        }
        if self.simulate {
            config.simulate = true;
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum LogFormatArg {
    /// Multi-line human-readable output
    Pretty,
    /// Single-line output
    Compact,
    /// Newline-delimited JSON
    Json,
}

impl From<LogFormatArg> for LogFormat {
    fn from(arg: LogFormatArg) -> Self {
        match arg {
            LogFormatArg::Pretty => LogFormat::Pretty,
            LogFormatArg::Compact => LogFormat::Compact,
            LogFormatArg::Json => LogFormat::Json,
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            let config_error = e
                .downcast_ref::<ScrapeError>()
                .is_some_and(ScrapeError::is_config);
            ExitCode::from(if config_error { 2 } else { 1 })
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    let mut config = match &cli.config {
        Some(path) => ScrapeConfig::read(path)?,
        None => ScrapeConfig::default(),
    };
    if cli.verbose > 0 {
        config.verbosity = cli.verbose;
    }
    if let Some(format) = cli.log_format {
        config.log_format = format.into();
    }

    match cli.command {
        Commands::Scrape(overrides) => {
            overrides.apply(&mut config);
            init_tracing(&config)?;
            scrape(config).await
        }
        Commands::ShowConfig(overrides) => {
            overrides.apply(&mut config);
            print!("{}", config.to_toml()?);
            Ok(())
        }
        Commands::CheckProxies(overrides) => {
            overrides.apply(&mut config);
            init_tracing(&config)?;
            check_proxies(&config).await
        }
        Commands::PurgeCache { all, overrides } => {
            overrides.apply(&mut config);
            init_tracing(&config)?;
            purge_cache(&config, all).await
        }
    }
}

fn init_tracing(config: &ScrapeConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_filter()));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    match config.log_format {
        LogFormat::Pretty => builder.pretty().try_init(),
        LogFormat::Compact => builder.compact().try_init(),
        LogFormat::Json => builder.json().try_init(),
    }
    .map_err(|e| anyhow::anyhow!("Failed to install logger: {}", e))
}

async fn load_proxies(config: &ScrapeConfig) -> Result<ProxyPool> {
    let pool = ProxyPool::from_config(config).await?;
    if config.check_proxies && !pool.is_empty().await {
        let summary = pool
            .check_all(
                &config.proxy_info_url,
                &config.proxy_check_url,
                config.request_timeout(),
                config.proxy_check_policy,
            )
            .await;
        info!(
            "Proxy check: {} healthy, {} unhealthy, {} removed",
            summary.healthy, summary.unhealthy, summary.removed
        );
    }
    Ok(pool)
}

async fn scrape(config: ScrapeConfig) -> Result<()> {
    config.validate()?;
    let jobs = build_jobs(&config)?;
    let pool = load_proxies(&config).await?;
    let proxies = pool.endpoints().await?;

    if config.simulate {
        let plan = scheduler::simulate(&config, jobs, &proxies).await;
        print!("{}", plan);
        return Ok(());
    }

    let output = OutputWriter::open(&config.output_target()?)?;
    let store = Arc::new(
        SerpStore::connect(&config.database_url)
            .await
            .with_context(|| format!("Failed to open {}", config.database_url))?,
    );
    let factory = Arc::new(DefaultTransportFactory::from_config(&config));

    let cancel = CancellationToken::new();
    let interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, finishing in-flight requests");
            interrupt.cancel();
        }
    });

    let report = Scheduler::new(Arc::new(config), factory, Arc::clone(&store))
        .with_proxies(proxies)
        .with_output(output)
        .with_cancel(cancel)
        .run(jobs)
        .await?;
    store.close().await;

    eprintln!("{}", report.summary());
    report.status()?;
    Ok(())
}

async fn check_proxies(config: &ScrapeConfig) -> Result<()> {
    let pool = ProxyPool::from_config(config).await?;
    if pool.is_empty().await {
        println!("No proxies configured");
        return Ok(());
    }
    pool.check_all(
        &config.proxy_info_url,
        &config.proxy_check_url,
        config.request_timeout(),
        a3s_serp::proxy::ProxyCheckPolicy::Log,
    )
    .await;

    for entry in pool.entries().await {
        let probe = entry.last_probe.unwrap_or_default();
        println!(
            "{:<28} {:<10} {:<16} {}",
            entry.proxy.to_string(),
            format!("{:?}", entry.status).to_lowercase(),
            probe.ip.as_deref().unwrap_or("-"),
            probe
                .country
                .as_deref()
                .or(probe.error.as_deref())
                .unwrap_or("")
        );
    }
    Ok(())
}

async fn purge_cache(config: &ScrapeConfig, all: bool) -> Result<()> {
    let cache = CacheStore::new(
        &config.cachedir,
        config.compress_cached_files,
        config.cache_ttl(),
    );
    let removed = if all {
        cache.clear().await?
    } else {
        cache.purge_expired().await?
    };
    println!("Removed {} cached pages from {}", removed, cache.dir().display());
    Ok(())
}
