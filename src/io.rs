use std::fs;
use std::io::ErrorKind;
use std::time::Instant;

use camino::{Utf8Path, Utf8PathBuf};
use glob::{MatchOptions, Pattern};
use rayon::iter::{IntoParallelRefIterator, ParallelIterator};

use crate::error::{CopyError, StepClearError};
use crate::utils::{fmt_duration, paint_num, paint_path};

/// 32 bytes length content hash, used to skip rewriting unchanged files.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, Debug)]
struct Hash32([u8; 32]);

impl Hash32 {
    fn hash_file(path: impl AsRef<std::path::Path>) -> std::io::Result<Self> {
        Ok(Hash32(
            blake3::Hasher::new()
                .update_reader(fs::File::open(path)?)?
                .finalize()
                .into(),
        ))
    }
}

/// Delete the entire build directory if it exists.
pub fn clear_dist(build_dir: &Utf8Path) -> Result<(), StepClearError> {
    let s = Instant::now();

    match fs::remove_dir_all(build_dir) {
        Ok(()) => {}
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }

    tracing::info!(
        "Cleaned {} after {}",
        paint_path(build_dir),
        paint_num(fmt_duration(s.elapsed()))
    );

    Ok(())
}

/// Include/exclude glob set. A path belongs to the set when it matches any
/// include and no exclude; excludes always win.
#[derive(Debug, Clone)]
pub struct GlobSet {
    include: Vec<Pattern>,
    exclude: Vec<Pattern>,
}

const MATCH: MatchOptions = MatchOptions {
    case_sensitive: true,
    require_literal_separator: true,
    require_literal_leading_dot: false,
};

impl GlobSet {
    pub fn new<I, E>(include: I, exclude: E) -> Result<Self, glob::PatternError>
    where
        I: IntoIterator,
        I::Item: AsRef<str>,
        E: IntoIterator,
        E::Item: AsRef<str>,
    {
        Ok(Self {
            include: include
                .into_iter()
                .map(|p| Pattern::new(p.as_ref()))
                .collect::<Result<_, _>>()?,
            exclude: exclude
                .into_iter()
                .map(|p| Pattern::new(p.as_ref()))
                .collect::<Result<_, _>>()?,
        })
    }

    pub fn matches(&self, path: &Utf8Path) -> bool {
        self.include
            .iter()
            .any(|p| p.matches_with(path.as_str(), MATCH))
            && !self.is_excluded(path)
    }

    /// Include patterns as written.
    pub fn includes(&self) -> impl Iterator<Item = &str> {
        self.include.iter().map(Pattern::as_str)
    }

    pub fn is_excluded(&self, path: &Utf8Path) -> bool {
        self.exclude
            .iter()
            .any(|p| p.matches_with(path.as_str(), MATCH))
    }

    /// Regular files currently on disk belonging to the set, sorted.
    pub fn files(&self) -> Result<Vec<Utf8PathBuf>, CopyError> {
        let mut files = Vec::new();

        for pattern in &self.include {
            for entry in glob::glob_with(&walk_pattern(pattern.as_str()), MATCH)? {
                let path = Utf8PathBuf::try_from(entry?)?;
                if path.is_file() && self.matches(&path) {
                    files.push(path);
                }
            }
        }

        files.sort();
        files.dedup();
        Ok(files)
    }
}

/// Pattern used to walk the disk. A trailing `**` only yields directories
/// when walking, so it is widened to every file below them.
fn walk_pattern(pattern: &str) -> String {
    match pattern.strip_suffix("**") {
        Some(prefix) if prefix.is_empty() || prefix.ends_with('/') => format!("{pattern}/*"),
        _ => pattern.to_string(),
    }
}

/// Mirror every file of `sources` into `dest_dir`, keeping paths relative to
/// `base_dir`. Returns the destination paths that were (re)written.
pub fn copy(
    sources: &GlobSet,
    base_dir: &Utf8Path,
    dest_dir: &Utf8Path,
) -> Result<Vec<Utf8PathBuf>, CopyError> {
    let s = Instant::now();
    let files = sources.files()?;

    let written: Vec<Option<Utf8PathBuf>> = files
        .par_iter()
        .map(|file| copy_file(file, base_dir, dest_dir))
        .collect::<Result<_, _>>()?;

    let written: Vec<Utf8PathBuf> = written.into_iter().flatten().collect();

    tracing::info!(
        "Copied {} of {} static files after {}",
        paint_num(written.len()),
        paint_num(files.len()),
        paint_num(fmt_duration(s.elapsed()))
    );

    Ok(written)
}

/// Copy a single file to its mirrored destination. Returns `None` when the
/// destination already holds identical bytes.
pub fn copy_file(
    file: &Utf8Path,
    base_dir: &Utf8Path,
    dest_dir: &Utf8Path,
) -> Result<Option<Utf8PathBuf>, CopyError> {
    let relative = file
        .strip_prefix(base_dir)
        .map_err(|_| CopyError::OutsideBase(file.to_path_buf(), base_dir.to_path_buf()))?;
    let dest = dest_dir.join(relative);

    if dest.is_file() && same_contents(file, &dest) {
        return Ok(None);
    }

    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent).map_err(|e| CopyError::Io(dest.clone(), e))?;
    }

    fs::copy(file, &dest).map_err(|e| CopyError::Io(file.to_path_buf(), e))?;
    tracing::debug!(from = %file, to = %dest, "copied");

    Ok(Some(dest))
}

fn same_contents(a: &Utf8Path, b: &Utf8Path) -> bool {
    match (fs::metadata(a), fs::metadata(b)) {
        (Ok(ma), Ok(mb)) if ma.len() != mb.len() => return false,
        (Ok(_), Ok(_)) => {}
        _ => return false,
    }

    match (Hash32::hash_file(a), Hash32::hash_file(b)) {
        (Ok(ha), Ok(hb)) => ha == hb,
        _ => false,
    }
}

/// Remove a file (or a whole directory) from the build output. A path that is
/// already gone counts as removed.
pub fn remove_output(path: &Utf8Path) -> std::io::Result<()> {
    let result = match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => fs::remove_dir_all(path),
        Ok(_) => fs::remove_file(path),
        Err(e) => Err(e),
    };

    match result {
        Err(e) if e.kind() != ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;

    fn tree(root: &Utf8Path) -> BTreeMap<Utf8PathBuf, Vec<u8>> {
        let pattern = format!("{root}/**/*");
        glob::glob(&pattern)
            .unwrap()
            .map(|p| Utf8PathBuf::try_from(p.unwrap()).unwrap())
            .filter(|p| p.is_file())
            .map(|p| (p.strip_prefix(root).unwrap().to_path_buf(), fs::read(&p).unwrap()))
            .collect()
    }

    fn site() -> (tempfile::TempDir, Utf8PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::try_from(dir.path().to_path_buf()).unwrap();
        let src = root.join("source");
        fs::create_dir_all(src.join("img/icons")).unwrap();
        fs::write(src.join("robots.txt"), "User-agent: *").unwrap();
        fs::write(src.join("img/logo.png"), [0u8, 1, 2, 3]).unwrap();
        fs::write(src.join("img/icons/a.svg"), "<svg/>").unwrap();
        fs::write(src.join("index.php"), "<?php echo 1;").unwrap();
        fs::write(src.join("img/icons/inc.php"), "<?php").unwrap();
        (dir, root)
    }

    fn statics(root: &Utf8Path) -> GlobSet {
        GlobSet::new(
            [format!("{root}/source/**")],
            [format!("{root}/source/**/*.php")],
        )
        .unwrap()
    }

    #[test]
    fn test_copy_mirrors_relative_paths_and_honours_excludes() {
        let (_dir, root) = site();

        copy(&statics(&root), &root.join("source"), &root.join("build")).unwrap();

        let built = tree(&root.join("build"));
        let keys: Vec<_> = built.keys().map(|k| k.as_str()).collect();
        assert_eq!(keys, vec!["img/icons/a.svg", "img/logo.png", "robots.txt"]);
        assert_eq!(built[Utf8Path::new("img/logo.png")], vec![0u8, 1, 2, 3]);
    }

    #[test]
    fn test_copy_is_idempotent() {
        let (_dir, root) = site();
        let set = statics(&root);

        let first = copy(&set, &root.join("source"), &root.join("build")).unwrap();
        let before = tree(&root.join("build"));
        let second = copy(&set, &root.join("source"), &root.join("build")).unwrap();

        assert_eq!(first.len(), 3);
        assert!(second.is_empty());
        assert_eq!(before, tree(&root.join("build")));
    }

    #[test]
    fn test_changed_file_is_recopied() {
        let (_dir, root) = site();
        let set = statics(&root);
        copy(&set, &root.join("source"), &root.join("build")).unwrap();

        fs::write(root.join("source/robots.txt"), "Disallow: /").unwrap();
        let written = copy(&set, &root.join("source"), &root.join("build")).unwrap();

        assert_eq!(written, vec![root.join("build/robots.txt")]);
        assert_eq!(
            fs::read_to_string(root.join("build/robots.txt")).unwrap(),
            "Disallow: /"
        );
    }

    #[test]
    fn test_trailing_double_star_lists_files_at_every_depth() {
        let (_dir, root) = site();

        let files = statics(&root).files().unwrap();
        let files: Vec<_> = files
            .iter()
            .map(|p| p.strip_prefix(root.join("source")).unwrap().as_str())
            .collect();

        assert_eq!(files, vec!["img/icons/a.svg", "img/logo.png", "robots.txt"]);
        assert_eq!(walk_pattern("src/**"), "src/**/*");
        assert_eq!(walk_pattern("src/**/*.php"), "src/**/*.php");
        assert_eq!(walk_pattern("src/a**"), "src/a**");
    }

    #[test]
    fn test_exclude_wins_over_include() {
        let set = GlobSet::new(["src/**/*.txt"], ["src/secret/**"]).unwrap();
        assert!(set.matches(Utf8Path::new("src/a/b.txt")));
        assert!(!set.matches(Utf8Path::new("src/secret/b.txt")));
        assert!(!set.matches(Utf8Path::new("other/b.txt")));
    }

    #[test]
    fn test_clear_and_remove_tolerate_missing_paths() {
        let (_dir, root) = site();
        clear_dist(&root.join("build")).unwrap();
        remove_output(&root.join("build/nothing.html")).unwrap();

        copy(&statics(&root), &root.join("source"), &root.join("build")).unwrap();
        remove_output(&root.join("build/img")).unwrap();
        assert!(!root.join("build/img").exists());
        assert!(root.join("build/robots.txt").exists());

        clear_dist(&root.join("build")).unwrap();
        assert!(!root.join("build").exists());
    }
}
