//! The pipeline itself: which tasks exist, how a full build is sequenced and
//! what each incremental action does to the build tree.

use std::collections::HashSet;
use std::sync::Arc;
#[cfg(feature = "live")]
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};

use crate::config::Config;
use crate::error::{ConfigError, TaskError};
use crate::event::{Action, Classifier};
use crate::graph::{Step, TaskGraph};
use crate::render::{Renderer, render_all, render_one};
use crate::utils::paint_path;
use crate::{io, styles};

/// Outputs touched by one incremental action.
#[derive(Debug, Default)]
pub struct Applied {
    pub outputs: Vec<Utf8PathBuf>,
    /// Only stylesheets changed.
    pub live_css: bool,
}

pub struct Site {
    #[cfg_attr(not(feature = "live"), allow(dead_code))]
    config: Config,
    classifier: Classifier,
    renderer: Renderer,
    source_dir: Utf8PathBuf,
    build_dir: Utf8PathBuf,
    styles_dir: Utf8PathBuf,
    styles_dest: Utf8PathBuf,
}

impl Site {
    /// Resolve `config` against the project `root`. Every path the site
    /// works with afterwards is absolute.
    pub fn new(config: Config, root: &Utf8Path) -> Result<Self, ConfigError> {
        let classifier = Classifier::new(&config, root)
            .map_err(|e| ConfigError::Pattern(root.to_string(), e))?;

        Ok(Self {
            renderer: Renderer::from_config(&config),
            source_dir: root.join(&config.source_dir),
            build_dir: root.join(&config.build_dir),
            styles_dir: root.join(&config.styles_dir),
            styles_dest: root.join(config.styles_dest()),
            classifier,
            config,
        })
    }

    pub fn with_renderer(mut self, renderer: Renderer) -> Self {
        self.renderer = renderer;
        self
    }

    pub fn classifier(&self) -> &Classifier {
        &self.classifier
    }

    pub fn build_dir(&self) -> &Utf8Path {
        &self.build_dir
    }

    /// Task graph of the pipeline: `clean`, `copy`, `render` and `styles`.
    pub fn tasks(self: &Arc<Self>) -> TaskGraph {
        let mut graph = TaskGraph::new();

        let site = self.clone();
        graph.register("clean", &[], move || {
            let site = site.clone();
            async move {
                io::clear_dist(&site.build_dir)?;
                Ok(())
            }
        });

        let site = self.clone();
        graph.register("copy", &[], move || {
            let site = site.clone();
            async move {
                tokio::task::spawn_blocking(move || {
                    io::copy(site.classifier.statics(), &site.source_dir, &site.build_dir)
                })
                .await??;
                Ok(())
            }
        });

        let site = self.clone();
        graph.register("render", &[], move || {
            let site = site.clone();
            async move {
                let sources = site.classifier.template_files()?;
                render_all(&site.renderer, sources, &site.source_dir, &site.build_dir).await;
                Ok(())
            }
        });

        let site = self.clone();
        graph.register("styles", &[], move || {
            let site = site.clone();
            async move {
                tokio::task::spawn_blocking(move || {
                    styles::compile_all(site.classifier.styles(), &site.styles_dir, &site.styles_dest)
                })
                .await??;
                Ok(())
            }
        });

        graph
    }

    /// Clean, copy static assets, then render templates and compile styles
    /// side by side.
    pub async fn build(self: &Arc<Self>) -> Result<(), TaskError> {
        let sequence = [
            Step::from("clean"),
            Step::from("copy"),
            Step::from(["render", "styles"]),
        ];

        self.tasks().run(sequence).await
    }

    pub async fn clean(self: &Arc<Self>) -> Result<(), TaskError> {
        self.tasks().run(["clean"]).await
    }

    /// Carry out one incremental action. Failures are logged, never returned,
    /// so the watch loop keeps going.
    pub async fn apply(self: &Arc<Self>, action: Action) -> Applied {
        match action {
            Action::Rerender(source) => {
                let written =
                    render_one(&self.renderer, &source, &self.source_dir, &self.build_dir).await;

                Applied {
                    outputs: written.into_iter().collect(),
                    live_css: false,
                }
            }
            Action::RecompileStyles => {
                let site = self.clone();
                let report = tokio::task::spawn_blocking(move || {
                    styles::compile_all(site.classifier.styles(), &site.styles_dir, &site.styles_dest)
                })
                .await;

                let outputs = match report {
                    Ok(Ok(report)) => report.compiled.into_iter().map(|file| file.css).collect(),
                    Ok(Err(e)) => {
                        tracing::error!("couldn't compile stylesheets: {e}");
                        Vec::new()
                    }
                    Err(e) => {
                        tracing::error!("stylesheet worker stopped: {e}");
                        Vec::new()
                    }
                };

                Applied {
                    outputs,
                    live_css: true,
                }
            }
            Action::Recopy(source) => {
                if !source.is_file() {
                    tracing::debug!(path = %source, "not a regular file, skipping copy");
                    return Applied::default();
                }

                let site = self.clone();
                let path = source.clone();
                let copied = tokio::task::spawn_blocking(move || {
                    io::copy_file(&path, &site.source_dir, &site.build_dir)
                })
                .await;

                let outputs = match copied {
                    Ok(Ok(Some(written))) => {
                        tracing::info!("Copied {}", paint_path(&written));
                        vec![written]
                    }
                    Ok(Ok(None)) => Vec::new(),
                    Ok(Err(e)) => {
                        tracing::error!(path = %source, "{e}");
                        Vec::new()
                    }
                    Err(e) => {
                        tracing::error!(path = %source, "copy worker stopped: {e}");
                        Vec::new()
                    }
                };

                Applied {
                    outputs,
                    live_css: false,
                }
            }
            Action::Delete { source, output } => {
                match io::remove_output(&output) {
                    Ok(()) => tracing::info!(
                        "{} was removed, removing {}",
                        paint_path(&source),
                        paint_path(&output)
                    ),
                    Err(e) => tracing::error!(path = %output, "couldn't remove output: {e}"),
                }

                Applied {
                    outputs: vec![output],
                    live_css: false,
                }
            }
        }
    }

    /// URL path of a file inside the build tree.
    pub fn href(&self, output: &Utf8Path) -> String {
        match output.strip_prefix(&self.build_dir) {
            Ok(relative) => format!("/{relative}"),
            Err(_) => output.to_string(),
        }
    }

    /// Directories that have to be watched to see every glob group.
    pub fn watch_roots(&self) -> Vec<Utf8PathBuf> {
        let includes = self
            .classifier
            .templates()
            .includes()
            .chain(self.classifier.styles().includes())
            .chain(self.classifier.statics().includes());

        let mut roots = HashSet::new();
        for glob in includes {
            let root = crate::utils::glob_root(glob);
            if root.exists() {
                roots.insert(root);
            } else {
                tracing::warn!("not watching {}, it doesn't exist", paint_path(&root));
            }
        }

        crate::utils::collapse_watch_paths(roots)
    }

    /// Build once, then serve the build tree and rebuild incrementally on
    /// every change until interrupted.
    #[cfg(feature = "live")]
    pub async fn watch(self: Arc<Self>) -> Result<(), crate::error::SiteError> {
        use crate::error::WatchError;
        use crate::server::{DevServer, Reload};

        self.build().await?;

        let server = DevServer::start(
            self.build_dir.clone(),
            self.config.port,
            self.config.reload_port,
        )
        .await
        .map_err(WatchError::Io)?;

        let reload = server.reload_handle();
        reload.notify(Reload::page("/"));

        let (_handle, events) = crate::watch::subscribe(
            Arc::new(self.classifier.clone()),
            &self.watch_roots(),
            Duration::from_millis(self.config.debounce_ms),
        )?;

        tracing::info!(
            "Serving {} on port {}, live-reload on {}",
            paint_path(&self.build_dir),
            server.port,
            server.reload_port
        );

        tokio::select! {
            _ = crate::watch::dispatch(events, self.clone(), reload) => {}
            signal = tokio::signal::ctrl_c() => {
                signal.map_err(WatchError::Io)?;
                tracing::info!("Interrupted, stopping watch");
            }
        }

        Ok(())
    }
}
