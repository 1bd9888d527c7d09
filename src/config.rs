use std::fs;

use camino::{Utf8Path, Utf8PathBuf};
use serde::Deserialize;

use crate::error::ConfigError;

/// File looked up in the working directory when no `--config` is given.
pub const CONFIG_FILE: &str = "sitepipe.toml";

/// Pipeline settings. Every field has a default, so an empty (or missing)
/// config file describes the classic `source/` + `sass/` -> `build/` layout.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Root of templates and static assets.
    pub source_dir: Utf8PathBuf,
    /// Root of the build output tree.
    pub build_dir: Utf8PathBuf,
    /// Root of the stylesheet sources.
    pub styles_dir: Utf8PathBuf,
    pub styles_glob: String,
    pub templates_glob: String,
    /// Static assets; the templates glob is always excluded on top of these.
    pub static_include: Vec<String>,
    pub static_exclude: Vec<String>,
    pub template_ext: String,
    pub output_ext: String,
    /// Subdirectory of `build_dir` receiving compiled styles.
    pub styles_out: Utf8PathBuf,
    pub port: u16,
    pub reload_port: u16,
    pub interpreter: InterpreterConfig,
    pub debounce_ms: u64,
}

/// External template interpreter. `{dir}` inside `args` is replaced with the
/// directory the rendered file lives in.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct InterpreterConfig {
    pub program: String,
    pub args: Vec<String>,
}

impl Default for InterpreterConfig {
    fn default() -> Self {
        Self {
            program: "php".into(),
            args: vec!["-d".into(), "include_path={dir}".into()],
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            source_dir: "source".into(),
            build_dir: "build".into(),
            styles_dir: "sass".into(),
            styles_glob: "sass/**/*.scss".into(),
            templates_glob: "source/**/*.php".into(),
            static_include: vec!["source/**".into()],
            static_exclude: vec![],
            template_ext: "php".into(),
            output_ext: "html".into(),
            styles_out: "css".into(),
            port: 9001,
            reload_port: 35729,
            interpreter: InterpreterConfig::default(),
            debounce_ms: 250,
        }
    }
}

impl Config {
    /// Load the config from `path`, or from [`CONFIG_FILE`] when it exists.
    /// An explicitly requested file must exist.
    pub fn load(path: Option<&Utf8Path>) -> Result<Self, ConfigError> {
        let (path, required) = match path {
            Some(path) => (path.to_path_buf(), true),
            None => (Utf8PathBuf::from(CONFIG_FILE), false),
        };

        if !required && !path.exists() {
            return Ok(Self::default());
        }

        let text = fs::read_to_string(&path).map_err(|e| ConfigError::Read(path.clone(), e))?;
        Self::parse(&path, &text)
    }

    pub fn parse(path: &Utf8Path, text: &str) -> Result<Self, ConfigError> {
        let config: Config =
            toml::from_str(text).map_err(|e| ConfigError::Parse(path.to_path_buf(), e))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let globs = [&self.styles_glob, &self.templates_glob]
            .into_iter()
            .chain(&self.static_include)
            .chain(&self.static_exclude);

        for glob in globs {
            glob::Pattern::new(glob).map_err(|e| ConfigError::Pattern(glob.clone(), e))?;
        }

        Ok(())
    }

    /// Static exclude patterns, templates first.
    pub fn static_excludes(&self) -> Vec<String> {
        let mut excludes = vec![self.templates_glob.clone()];
        excludes.extend(self.static_exclude.iter().cloned());
        excludes
    }

    /// Move the source root, carrying along the globs rooted in it.
    pub fn rebase_source(&mut self, source_dir: &Utf8Path) {
        let old = self.source_dir.as_str().trim_end_matches('/').to_string();
        let rebase = |glob: &mut String| {
            if let Some(rest) = glob.strip_prefix(old.as_str())
                && rest.starts_with('/')
            {
                *glob = format!("{source_dir}{rest}");
            }
        };

        rebase(&mut self.templates_glob);
        self.static_include.iter_mut().for_each(&rebase);
        self.static_exclude.iter_mut().for_each(&rebase);
        self.source_dir = source_dir.to_path_buf();
    }

    /// Where compiled styles land.
    pub fn styles_dest(&self) -> Utf8PathBuf {
        self.build_dir.join(&self.styles_out)
    }
}
