use std::sync::Arc;

use camino::{Utf8Path, Utf8PathBuf};
use clap::{Parser, ValueEnum};
use sitepipe::{Config, Site, SiteError};

#[derive(ValueEnum, Debug, Clone, Copy)]
enum Mode {
    /// Build the site once.
    Build,
    /// Build, serve the output with live-reload and rebuild on changes.
    Watch,
    /// Remove the build directory.
    Clean,
}

#[derive(Parser, Debug, Clone)]
#[command(version, about)]
struct Args {
    #[clap(value_enum, index = 1, default_value = "build")]
    mode: Mode,

    /// Config file, `sitepipe.toml` in the working directory by default.
    #[clap(long)]
    config: Option<Utf8PathBuf>,

    /// Log debug output (overridden by `SITEPIPE_LOG`).
    #[clap(short, long)]
    verbose: bool,

    /// HTTP port of the development server.
    #[clap(long)]
    port: Option<u16>,

    /// Directory holding templates and static assets.
    #[clap(long)]
    source: Option<Utf8PathBuf>,

    /// Output directory.
    #[clap(long)]
    build: Option<Utf8PathBuf>,
}

impl Args {
    fn config(&self) -> Result<Config, SiteError> {
        let mut config = Config::load(self.config.as_deref())?;

        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(source) = &self.source {
            config.rebase_source(source);
        }
        if let Some(build) = &self.build {
            config.build_dir = build.clone();
        }

        Ok(config)
    }
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    sitepipe::utils::init_logging(args.verbose)?;

    let config = args.config()?;
    let root = Utf8PathBuf::try_from(std::env::current_dir()?.canonicalize()?)?;
    let site = Arc::new(Site::new(config, &root)?);

    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(SiteError::RuntimeBuild)?;

    rt.block_on(run(args.mode, site, &root))?;

    Ok(())
}

async fn run(mode: Mode, site: Arc<Site>, root: &Utf8Path) -> anyhow::Result<()> {
    tracing::debug!(%root, ?mode, "starting");

    match mode {
        Mode::Build => site.build().await?,
        Mode::Clean => site.clean().await?,
        #[cfg(feature = "live")]
        Mode::Watch => site.watch().await?,
        #[cfg(not(feature = "live"))]
        Mode::Watch => anyhow::bail!("watch mode needs the `live` feature"),
    }

    Ok(())
}
