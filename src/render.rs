//! Rendering of template sources through an out-of-process interpreter.
//!
//! Every source file gets its own interpreter process: the file is streamed
//! into the process's stdin while stdout (the rendered page) and stderr
//! (diagnostics) are collected concurrently. The exit code is advisory only.
//! A render that produced no output is a *drop*: nothing is written for it.

use std::io;
use std::process::Stdio;
use std::sync::{Arc, LazyLock};
use std::time::{Duration, Instant};

use camino::{Utf8Path, Utf8PathBuf};
use regex::Regex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio::task::JoinSet;

use crate::config::{Config, InterpreterConfig};
use crate::error::RenderError;
use crate::utils::{fmt_duration, paint_num, paint_path};

/// Anything that can be started as a process reading a template on stdin and
/// writing the rendered page to stdout and diagnostics to stderr.
pub trait Interpreter: Send + Sync {
    /// Name used in logs and errors.
    fn name(&self) -> &str;

    /// Start the process for a file living in `context`. All three standard
    /// streams of the returned child must be piped.
    fn spawn(&self, context: &Utf8Path) -> io::Result<Child>;
}

/// An interpreter started from a program and an argument list. Occurrences of
/// `{dir}` in the arguments are replaced with the context directory, which is
/// how `php -d include_path={dir}` resolves relative includes.
#[derive(Debug, Clone)]
pub struct CommandInterpreter {
    program: String,
    args: Vec<String>,
}

impl CommandInterpreter {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }
}

impl From<&InterpreterConfig> for CommandInterpreter {
    fn from(config: &InterpreterConfig) -> Self {
        CommandInterpreter::new(&config.program).args(config.args.iter().cloned())
    }
}

impl Interpreter for CommandInterpreter {
    fn name(&self) -> &str {
        &self.program
    }

    fn spawn(&self, context: &Utf8Path) -> io::Result<Child> {
        Command::new(&self.program)
            .args(self.args.iter().map(|arg| arg.replace("{dir}", context.as_str())))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
    }
}

/// A single diagnostic parsed from the interpreter's stderr.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostic {
    pub severity: String,
    pub message: String,
    pub path: String,
    pub line: usize,
}

impl Diagnostic {
    fn log(&self, source: &Utf8Path) {
        let at = format!("{}:{}", paint_path(&self.path), paint_num(self.line));
        let severity = self.severity.to_ascii_lowercase();

        if severity.contains("error") {
            tracing::error!(source = %source, severity = %self.severity, "{at} {}", self.message);
        } else if severity.contains("warning") {
            tracing::warn!(source = %source, severity = %self.severity, "{at} {}", self.message);
        } else {
            tracing::info!(source = %source, severity = %self.severity, "{at} {}", self.message);
        }
    }
}

static DIAGNOSTIC: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^(?:PHP )?(?P<severity>[A-Z][A-Za-z ]*?):\s+(?P<message>.+) in (?P<path>.+?)(?: on line |:)(?P<line>\d+)\s*$",
    )
    .expect("diagnostic pattern is valid")
});

/// Parse interpreter stderr into diagnostics, one per matching line. Lines
/// that don't look like a diagnostic (stack traces, blank lines, noise) are
/// skipped.
pub fn parse_diagnostics(text: &str) -> Vec<Diagnostic> {
    text.lines()
        .filter_map(|line| {
            let caps = DIAGNOSTIC.captures(line.trim_end())?;
            Some(Diagnostic {
                severity: caps["severity"].trim().to_string(),
                message: caps["message"].trim().to_string(),
                path: caps["path"].to_string(),
                line: caps["line"].parse().ok()?,
            })
        })
        .collect()
}

/// Outcome of one interpreter run.
#[derive(Debug, Clone)]
pub struct RenderResult {
    pub source: Utf8PathBuf,
    /// Destination relative to the build root.
    pub destination: Utf8PathBuf,
    pub output: Vec<u8>,
    pub diagnostics: Vec<Diagnostic>,
    pub exit_code: Option<i32>,
    pub elapsed: Duration,
}

impl RenderResult {
    /// Empty output means the caller must not write (or keep) a destination.
    pub fn is_dropped(&self) -> bool {
        self.output.is_empty()
    }
}

/// Swap the extension of a source path relative to the source root.
pub fn output_path(relative: &Utf8Path, output_ext: &str) -> Utf8PathBuf {
    relative.with_extension(output_ext)
}

#[derive(Clone)]
pub struct Renderer {
    interpreter: Arc<dyn Interpreter>,
    output_ext: String,
}

impl Renderer {
    pub fn new(interpreter: Arc<dyn Interpreter>, output_ext: impl Into<String>) -> Self {
        Self {
            interpreter,
            output_ext: output_ext.into(),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(
            Arc::new(CommandInterpreter::from(&config.interpreter)),
            &config.output_ext,
        )
    }

    /// Render `source`, which must live under `base`. The interpreter runs
    /// with the source's own directory as its context.
    pub async fn render(
        &self,
        source: &Utf8Path,
        base: &Utf8Path,
    ) -> Result<RenderResult, RenderError> {
        let start = Instant::now();

        let relative = source
            .strip_prefix(base)
            .map_err(|_| RenderError::OutsideBase(source.to_path_buf(), base.to_path_buf()))?;
        let destination = output_path(relative, &self.output_ext);

        let input = tokio::fs::read(source)
            .await
            .map_err(|e| RenderError::Io(source.to_path_buf(), e))?;

        let context = match source.parent() {
            Some(parent) if !parent.as_str().is_empty() => parent,
            _ => Utf8Path::new("."),
        };

        let mut child = self.interpreter.spawn(context).map_err(|e| {
            RenderError::Spawn(self.interpreter.name().into(), source.to_path_buf(), e)
        })?;

        let stdin = child.stdin.take();
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let feed = async move {
            if let Some(mut stdin) = stdin {
                // The interpreter may exit without reading everything.
                if let Err(e) = stdin.write_all(&input).await {
                    tracing::debug!(path = %source, "interpreter closed stdin early: {e}");
                }
            }
        };

        let (_, output, diagnostics) = tokio::join!(feed, drain(stdout), drain(stderr));
        let output = output.map_err(|e| RenderError::Io(source.to_path_buf(), e))?;
        let diagnostics = diagnostics.map_err(|e| RenderError::Io(source.to_path_buf(), e))?;

        let status = child
            .wait()
            .await
            .map_err(|e| RenderError::Io(source.to_path_buf(), e))?;

        let diagnostics = if diagnostics.is_empty() {
            Vec::new()
        } else {
            parse_diagnostics(&String::from_utf8_lossy(&diagnostics))
        };

        Ok(RenderResult {
            source: source.to_path_buf(),
            destination,
            output,
            diagnostics,
            exit_code: status.code(),
            elapsed: start.elapsed(),
        })
    }
}

async fn drain<R>(stream: Option<R>) -> io::Result<Vec<u8>>
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut buffer = Vec::new();
    if let Some(mut stream) = stream {
        stream.read_to_end(&mut buffer).await?;
    }
    Ok(buffer)
}

/// Log the result and write it under `build_dir`. Returns the written path,
/// or `None` when the render was dropped.
pub async fn write_result(
    result: &RenderResult,
    build_dir: &Utf8Path,
) -> io::Result<Option<Utf8PathBuf>> {
    for diagnostic in &result.diagnostics {
        diagnostic.log(&result.source);
    }

    if result.is_dropped() {
        tracing::info!(
            "Dropping {} because the interpreter returned no content after {}",
            paint_path(&result.source),
            paint_num(fmt_duration(result.elapsed)),
        );
        return Ok(None);
    }

    let path = build_dir.join(&result.destination);
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(&path, &result.output).await?;

    tracing::info!(
        "Rendered {} to {} after {}",
        paint_path(&result.source),
        paint_path(&result.destination),
        paint_num(fmt_duration(result.elapsed)),
    );

    Ok(Some(path))
}

/// Render and write one file. Failures are logged and swallowed so a broken
/// template never takes down the batch or the watch loop.
pub async fn render_one(
    renderer: &Renderer,
    source: &Utf8Path,
    base: &Utf8Path,
    build_dir: &Utf8Path,
) -> Option<Utf8PathBuf> {
    let result = match renderer.render(source, base).await {
        Ok(result) => result,
        Err(e) => {
            tracing::error!(path = %source, "{e}");
            return None;
        }
    };

    match write_result(&result, build_dir).await {
        Ok(written) => written,
        Err(e) => {
            tracing::error!(path = %result.destination, "couldn't write rendered page: {e}");
            None
        }
    }
}

/// Render every source concurrently, one interpreter process per file.
/// Returns the paths that were written.
pub async fn render_all(
    renderer: &Renderer,
    sources: Vec<Utf8PathBuf>,
    base: &Utf8Path,
    build_dir: &Utf8Path,
) -> Vec<Utf8PathBuf> {
    let mut running = JoinSet::new();

    for source in sources {
        let renderer = renderer.clone();
        let base = base.to_path_buf();
        let build_dir = build_dir.to_path_buf();
        running.spawn(async move { render_one(&renderer, &source, &base, &build_dir).await });
    }

    let mut written = Vec::new();
    while let Some(joined) = running.join_next().await {
        match joined {
            Ok(Some(path)) => written.push(path),
            Ok(None) => {}
            Err(e) => tracing::error!("render worker stopped: {e}"),
        }
    }

    written
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_php_style_diagnostics() {
        let stderr = "\
PHP Warning:  include(missing.php): failed to open stream: No such file or directory in /site/source/index.php on line 3
PHP Stack trace:
PHP   1. {main}() /site/source/index.php:0
PHP Parse error:  syntax error, unexpected '}' in Standard input code on line 12

random noise
Fatal error: Uncaught Exception: boom in /site/source/a.php:7
";

        let diagnostics = parse_diagnostics(stderr);

        assert_eq!(diagnostics.len(), 3);
        assert_eq!(diagnostics[0].severity, "Warning");
        assert_eq!(diagnostics[0].path, "/site/source/index.php");
        assert_eq!(diagnostics[0].line, 3);
        assert!(diagnostics[0].message.starts_with("include(missing.php)"));

        assert_eq!(diagnostics[1].severity, "Parse error");
        assert_eq!(diagnostics[1].path, "Standard input code");
        assert_eq!(diagnostics[1].line, 12);

        assert_eq!(diagnostics[2].severity, "Fatal error");
        assert_eq!(diagnostics[2].path, "/site/source/a.php");
        assert_eq!(diagnostics[2].line, 7);
    }

    #[test]
    fn test_malformed_blocks_are_skipped() {
        assert!(parse_diagnostics("Warning: no location here\n\n#0 {main}\n").is_empty());
    }

    #[test]
    fn test_output_path_swaps_extension() {
        assert_eq!(
            output_path(Utf8Path::new("blog/post.php"), "html"),
            Utf8Path::new("blog/post.html")
        );
    }

    #[cfg(unix)]
    mod process {
        use super::super::*;

        fn sh(script: &str) -> Renderer {
            Renderer::new(
                Arc::new(CommandInterpreter::new("sh").arg("-c").arg(script)),
                "html",
            )
        }

        fn site() -> (tempfile::TempDir, Utf8PathBuf) {
            let dir = tempfile::tempdir().unwrap();
            let root = Utf8PathBuf::try_from(dir.path().to_path_buf()).unwrap();
            std::fs::create_dir_all(root.join("source/blog")).unwrap();
            std::fs::write(root.join("source/blog/post.php"), "<p>hello</p>").unwrap();
            (dir, root)
        }

        #[tokio::test]
        async fn test_stdin_is_streamed_to_stdout() {
            let (_dir, root) = site();
            let renderer = Renderer::new(Arc::new(CommandInterpreter::new("cat")), "html");

            let result = renderer
                .render(&root.join("source/blog/post.php"), &root.join("source"))
                .await
                .unwrap();

            assert_eq!(result.output, b"<p>hello</p>");
            assert_eq!(result.destination, Utf8Path::new("blog/post.html"));
            assert!(result.diagnostics.is_empty());
            assert!(!result.is_dropped());
        }

        #[tokio::test]
        async fn test_context_dir_is_passed() {
            let (_dir, root) = site();
            let interpreter = CommandInterpreter::new("sh")
                .arg("-c")
                .arg("cat >/dev/null; printf %s \"$0\"")
                .arg("{dir}");
            let renderer = Renderer::new(Arc::new(interpreter), "html");

            let result = renderer
                .render(&root.join("source/blog/post.php"), &root.join("source"))
                .await
                .unwrap();

            assert_eq!(
                String::from_utf8(result.output).unwrap(),
                root.join("source/blog").as_str()
            );
        }

        #[tokio::test]
        async fn test_empty_output_is_dropped_and_not_written() {
            let (_dir, root) = site();
            let renderer = sh("cat >/dev/null");
            let build = root.join("build");

            let written = render_one(
                &renderer,
                &root.join("source/blog/post.php"),
                &root.join("source"),
                &build,
            )
            .await;

            assert!(written.is_none());
            assert!(!build.join("blog/post.html").exists());
        }

        #[tokio::test]
        async fn test_diagnostics_do_not_block_output() {
            let (_dir, root) = site();
            let renderer = sh(
                "cat; echo 'PHP Notice:  Undefined variable: x in /s/post.php on line 2' >&2; exit 255",
            );
            let build = root.join("build");

            let result = renderer
                .render(&root.join("source/blog/post.php"), &root.join("source"))
                .await
                .unwrap();

            assert_eq!(result.exit_code, Some(255));
            assert_eq!(result.diagnostics.len(), 1);
            assert_eq!(result.diagnostics[0].line, 2);

            let written = write_result(&result, &build).await.unwrap();
            assert_eq!(written, Some(build.join("blog/post.html")));
            assert_eq!(
                std::fs::read(build.join("blog/post.html")).unwrap(),
                b"<p>hello</p>"
            );
        }

        /// Runs `cat`, except for files living in a `broken` directory.
        struct BrokenIn;

        impl Interpreter for BrokenIn {
            fn name(&self) -> &str {
                "broken-in"
            }

            fn spawn(&self, context: &Utf8Path) -> io::Result<Child> {
                if context.ends_with("broken") {
                    return Err(io::Error::new(io::ErrorKind::NotFound, "no interpreter"));
                }
                CommandInterpreter::new("cat").spawn(context)
            }
        }

        #[tokio::test]
        async fn test_spawn_failure_is_per_file() {
            let (_dir, root) = site();
            std::fs::create_dir_all(root.join("source/broken")).unwrap();
            std::fs::write(root.join("source/broken/other.php"), "x").unwrap();
            let renderer = Renderer::new(Arc::new(BrokenIn), "html");

            let err = renderer
                .render(&root.join("source/broken/other.php"), &root.join("source"))
                .await
                .unwrap_err();
            assert!(matches!(err, RenderError::Spawn(..)));

            let written = render_all(
                &renderer,
                vec![
                    root.join("source/broken/other.php"),
                    root.join("source/blog/post.php"),
                ],
                &root.join("source"),
                &root.join("build"),
            )
            .await;

            assert_eq!(written, vec![root.join("build/blog/post.html")]);
            assert!(!root.join("build/broken/other.html").exists());
        }

        #[tokio::test]
        async fn test_render_all_writes_every_page() {
            let (_dir, root) = site();
            std::fs::write(root.join("source/index.php"), "<h1>home</h1>").unwrap();
            let renderer = Renderer::new(Arc::new(CommandInterpreter::new("cat")), "html");

            let mut written = render_all(
                &renderer,
                vec![
                    root.join("source/index.php"),
                    root.join("source/blog/post.php"),
                ],
                &root.join("source"),
                &root.join("build"),
            )
            .await;
            written.sort();

            assert_eq!(
                written,
                vec![
                    root.join("build/blog/post.html"),
                    root.join("build/index.html"),
                ]
            );
        }
    }
}
