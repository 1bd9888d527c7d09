use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use std::time::Instant;

use camino::{Utf8Component, Utf8Path, Utf8PathBuf};
use rayon::iter::{IntoParallelIterator, ParallelIterator};

use crate::error::{CopyError, StyleError};
use crate::io::GlobSet;
use crate::utils::{fmt_duration, paint_num, paint_path};

/// A compiled entry point and the files written for it.
#[derive(Debug, Clone)]
pub struct CompiledStyleFile {
    pub source: Utf8PathBuf,
    pub css: Utf8PathBuf,
    pub map: Utf8PathBuf,
    /// Every stylesheet the compiler read for this entry, entry first.
    pub sources: Vec<Utf8PathBuf>,
}

#[derive(Debug, Default)]
pub struct StyleReport {
    pub compiled: Vec<CompiledStyleFile>,
    pub errors: Vec<StyleError>,
}

impl StyleReport {
    /// Output files written by this run (stylesheets and their maps).
    pub fn emitted(&self) -> impl Iterator<Item = &Utf8Path> {
        self.compiled
            .iter()
            .flat_map(|file| [file.css.as_path(), file.map.as_path()])
    }
}

/// Filesystem adapter that remembers every file the compiler reads, which is
/// the import graph of the entry being compiled.
#[derive(Debug, Default)]
struct RecordingFs {
    read: Mutex<Vec<PathBuf>>,
}

impl grass::Fs for RecordingFs {
    fn is_dir(&self, path: &Path) -> bool {
        path.is_dir()
    }

    fn is_file(&self, path: &Path) -> bool {
        path.is_file()
    }

    fn read(&self, path: &Path) -> io::Result<Vec<u8>> {
        self.read
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(path.to_path_buf());
        fs::read(path)
    }
}

/// Log a compile error the way sass reporters do: `path:line:column message`.
pub fn report_error(err: &StyleError) {
    tracing::error!(
        path = %err.path,
        line = err.line,
        column = err.column,
        "{} {}:{}:{} {}",
        console::style("Sass Error:").red(),
        paint_path(&err.path),
        paint_num(err.line),
        paint_num(err.column),
        err.message,
    );
}

/// Compile every entry point of the set into `dest_dir`, logging errors.
pub fn compile_all(
    sources: &GlobSet,
    base_dir: &Utf8Path,
    dest_dir: &Utf8Path,
) -> Result<StyleReport, CopyError> {
    compile_all_with(sources, base_dir, dest_dir, report_error)
}

/// Compile every entry point of the set. Files whose name starts with `_` are
/// partials and only reach the output through imports. A malformed entry
/// produces one [`StyleError`] passed to `on_error`; the others still compile.
pub fn compile_all_with<F>(
    sources: &GlobSet,
    base_dir: &Utf8Path,
    dest_dir: &Utf8Path,
    on_error: F,
) -> Result<StyleReport, CopyError>
where
    F: Fn(&StyleError) + Sync,
{
    let s = Instant::now();

    let entries: Vec<Utf8PathBuf> = sources
        .files()?
        .into_iter()
        .filter(|path| !path.file_name().is_some_and(|name| name.starts_with('_')))
        .collect();

    let results: Vec<Result<CompiledStyleFile, StyleError>> = entries
        .into_par_iter()
        .map(|entry| compile(&entry, base_dir, dest_dir))
        .collect();

    let mut report = StyleReport::default();
    for result in results {
        match result {
            Ok(file) => {
                tracing::info!("Sass: compiled {}", paint_path(&file.css));
                report.compiled.push(file);
            }
            Err(err) => {
                on_error(&err);
                report.errors.push(err);
            }
        }
    }

    tracing::info!(
        "Compiled {} stylesheets ({} failed) after {}",
        paint_num(report.compiled.len()),
        paint_num(report.errors.len()),
        paint_num(fmt_duration(s.elapsed()))
    );

    Ok(report)
}

fn compile(
    entry: &Utf8Path,
    base_dir: &Utf8Path,
    dest_dir: &Utf8Path,
) -> Result<CompiledStyleFile, StyleError> {
    let recorder = RecordingFs::default();
    let options = grass::Options::default()
        .style(grass::OutputStyle::Compressed)
        .fs(&recorder);

    let css = grass::from_path(entry, &options).map_err(|err| to_style_error(entry, err))?;

    let relative = entry.strip_prefix(base_dir).unwrap_or(entry);
    let css_path = dest_dir.join(relative).with_extension("css");
    let map_path = dest_dir.join(relative).with_extension("css.map");

    let mut sources: Vec<Utf8PathBuf> = Vec::new();
    for path in recorder.read.into_inner().unwrap_or_else(PoisonError::into_inner) {
        if let Ok(path) = Utf8PathBuf::try_from(path)
            && !sources.contains(&path)
        {
            sources.push(path);
        }
    }

    if let Some(parent) = css_path.parent() {
        fs::create_dir_all(parent).map_err(|e| io_error(entry, parent, e))?;
    }

    let map = source_map(&css_path, &sources);
    let file_name = map_path.file_name().unwrap_or_default();
    let css = format!("{css}\n/*# sourceMappingURL={file_name} */\n");

    fs::write(&css_path, css.as_bytes()).map_err(|e| io_error(entry, &css_path, e))?;
    fs::write(&map_path, map.as_bytes()).map_err(|e| io_error(entry, &map_path, e))?;

    Ok(CompiledStyleFile {
        source: entry.to_path_buf(),
        css: css_path,
        map: map_path,
        sources,
    })
}

fn io_error(entry: &Utf8Path, path: &Utf8Path, err: io::Error) -> StyleError {
    StyleError {
        path: entry.to_path_buf(),
        line: 0,
        column: 0,
        message: format!("couldn't write {path}: {err}"),
    }
}

fn to_style_error(entry: &Utf8Path, err: Box<grass::Error>) -> StyleError {
    let text = err.to_string();

    match (*err).kind() {
        grass::ErrorKind::ParseError { message, loc, .. } => StyleError {
            path: Utf8PathBuf::from(loc.file.name()),
            line: loc.begin.line + 1,
            column: loc.begin.column + 1,
            message,
        },
        _ => StyleError {
            path: entry.to_path_buf(),
            line: 0,
            column: 0,
            message: text,
        },
    }
}

/// Version 3 source map naming the files the stylesheet was built from. The
/// compiler doesn't track output positions, so `mappings` stays empty.
fn source_map(css_path: &Utf8Path, sources: &[Utf8PathBuf]) -> String {
    let css_dir = css_path.parent().unwrap_or(Utf8Path::new(""));

    let sources: Vec<String> = sources
        .iter()
        .map(|source| relative_to(source, css_dir).into_string())
        .collect();

    let map = serde_json::json!({
        "version": 3,
        "file": css_path.file_name().unwrap_or_default(),
        "sources": sources,
        "names": [],
        "mappings": "",
    });

    map.to_string()
}

/// Path of `path` as seen from directory `base`.
fn relative_to(path: &Utf8Path, base: &Utf8Path) -> Utf8PathBuf {
    let absolute = |p: &Utf8Path| {
        p.canonicalize_utf8()
            .ok()
            .or_else(|| {
                let cwd = std::env::current_dir().ok()?;
                Some(Utf8PathBuf::try_from(cwd).ok()?.join(p))
            })
            .unwrap_or_else(|| p.to_path_buf())
    };

    let path = absolute(path);
    let base = absolute(base);

    let path_parts: Vec<Utf8Component> = path.components().collect();
    let base_parts: Vec<Utf8Component> = base.components().collect();
    let common = path_parts
        .iter()
        .zip(&base_parts)
        .take_while(|(a, b)| a == b)
        .count();

    let mut relative = Utf8PathBuf::new();
    for _ in common..base_parts.len() {
        relative.push("..");
    }
    for part in &path_parts[common..] {
        relative.push(part.as_str());
    }
    relative
}

#[cfg(test)]
mod tests {
    use super::*;

    fn styles() -> (tempfile::TempDir, Utf8PathBuf, GlobSet) {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::try_from(dir.path().to_path_buf()).unwrap();
        let sass = root.join("sass");
        fs::create_dir_all(sass.join("pages")).unwrap();
        fs::write(sass.join("main.scss"), "@import 'colors';\nbody { color: $fg; }\n").unwrap();
        fs::write(sass.join("_colors.scss"), "$fg: #ff0000;\n").unwrap();
        fs::write(sass.join("pages/about.scss"), "h1 { margin: 0; }\n").unwrap();
        let set = GlobSet::new([format!("{sass}/**/*.scss")], Vec::<String>::new()).unwrap();
        (dir, root, set)
    }

    #[test]
    fn test_compile_follows_imports_and_skips_partials() {
        let (_dir, root, set) = styles();
        let dest = root.join("build/css");

        let report = compile_all(&set, &root.join("sass"), &dest).unwrap();

        assert!(report.errors.is_empty());
        assert_eq!(report.compiled.len(), 2);
        assert!(!dest.join("_colors.css").exists());

        let css = fs::read_to_string(dest.join("main.css")).unwrap();
        assert!(css.contains("color:red") || css.contains("color:#ff0000") || css.contains("color:#f00"));
        assert!(css.contains("sourceMappingURL=main.css.map"));
        assert!(dest.join("pages/about.css").exists());

        let main = report
            .compiled
            .iter()
            .find(|file| file.css.ends_with("main.css"))
            .unwrap();
        assert_eq!(main.sources.len(), 2);
        assert!(main.sources[0].ends_with("main.scss"));
        assert!(main.sources[1].ends_with("_colors.scss"));

        let map: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(dest.join("main.css.map")).unwrap()).unwrap();
        assert_eq!(map["version"], 3);
        assert_eq!(map["file"], "main.css");
        assert_eq!(map["sources"][0], "../../sass/main.scss");
        assert_eq!(report.emitted().count(), 4);
    }

    #[test]
    fn test_one_error_per_malformed_file() {
        let (_dir, root, set) = styles();
        fs::write(root.join("sass/broken.scss"), "a {\n  color: red;\n").unwrap();

        let reported = Mutex::new(Vec::new());
        let report = compile_all_with(&set, &root.join("sass"), &root.join("build/css"), |e| {
            reported.lock().unwrap().push(e.clone())
        })
        .unwrap();

        assert_eq!(report.compiled.len(), 2);
        assert_eq!(report.errors.len(), 1);
        assert_eq!(reported.into_inner().unwrap(), report.errors);

        let err = &report.errors[0];
        assert!(err.path.ends_with("broken.scss"));
        assert!(err.line >= 1);
        assert!(!root.join("build/css/broken.css").exists());
    }

    #[test]
    fn test_relative_to() {
        assert_eq!(
            relative_to(Utf8Path::new("/a/sass/x.scss"), Utf8Path::new("/a/build/css")),
            Utf8Path::new("../../sass/x.scss")
        );
        assert_eq!(
            relative_to(Utf8Path::new("/a/b/c.scss"), Utf8Path::new("/a/b")),
            Utf8Path::new("c.scss")
        );
    }
}
