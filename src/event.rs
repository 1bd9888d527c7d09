//! Classification of filesystem changes into incremental build actions.
//!
//! Rules, in precedence order:
//! - template sources are re-rendered (or their page removed when deleted),
//! - any stylesheet change recompiles the whole stylesheet set, because
//!   entries import each other,
//! - static assets are re-copied when added or changed,
//! - deleted static assets have their mirrored copy removed.

use camino::{Utf8Path, Utf8PathBuf};

use crate::config::Config;
use crate::error::CopyError;
use crate::io::GlobSet;
use crate::render::output_path;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Change {
    Added,
    Changed,
    Deleted,
}

/// Which glob group a changed path belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Group {
    Templates,
    Styles,
    Static,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEvent {
    pub kind: Change,
    pub path: Utf8PathBuf,
    pub group: Group,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    Rerender(Utf8PathBuf),
    RecompileStyles,
    Recopy(Utf8PathBuf),
    Delete {
        source: Utf8PathBuf,
        output: Utf8PathBuf,
    },
}

/// Glob groups resolved against an absolute project root, so they can be
/// matched directly against paths reported by the OS.
#[derive(Debug, Clone)]
pub struct Classifier {
    templates: GlobSet,
    styles: GlobSet,
    statics: GlobSet,
    source_dir: Utf8PathBuf,
    build_dir: Utf8PathBuf,
    template_ext: String,
    output_ext: String,
}

impl Classifier {
    pub fn new(config: &Config, root: &Utf8Path) -> Result<Self, glob::PatternError> {
        let abs = |glob: &String| root.join(glob).into_string();

        Ok(Self {
            templates: GlobSet::new([abs(&config.templates_glob)], Vec::<String>::new())?,
            styles: GlobSet::new([abs(&config.styles_glob)], Vec::<String>::new())?,
            statics: GlobSet::new(
                config.static_include.iter().map(abs),
                config.static_excludes().iter().map(abs),
            )?,
            source_dir: root.join(&config.source_dir),
            build_dir: root.join(&config.build_dir),
            template_ext: config.template_ext.clone(),
            output_ext: config.output_ext.clone(),
        })
    }

    pub fn templates(&self) -> &GlobSet {
        &self.templates
    }

    /// A renderable source: inside the templates glob and carrying the
    /// template extension.
    pub fn is_template(&self, path: &Utf8Path) -> bool {
        path.extension() == Some(self.template_ext.as_str()) && self.templates.matches(path)
    }

    /// Renderable sources currently on disk.
    pub fn template_files(&self) -> Result<Vec<Utf8PathBuf>, CopyError> {
        let mut files = self.templates.files()?;
        files.retain(|path| path.extension() == Some(self.template_ext.as_str()));
        Ok(files)
    }

    pub fn styles(&self) -> &GlobSet {
        &self.styles
    }

    pub fn statics(&self) -> &GlobSet {
        &self.statics
    }

    pub fn group(&self, path: &Utf8Path) -> Option<Group> {
        if self.is_template(path) {
            Some(Group::Templates)
        } else if self.styles.matches(path) {
            Some(Group::Styles)
        } else if self.statics.matches(path) {
            Some(Group::Static)
        } else {
            None
        }
    }

    /// Attach a group to a raw change; paths outside every group yield `None`.
    pub fn event(&self, kind: Change, path: Utf8PathBuf) -> Option<FileEvent> {
        let group = self.group(&path)?;
        Some(FileEvent { kind, path, group })
    }

    /// Decide the single action an event triggers. `None` when the mirrored
    /// output can't be computed (the path is outside the source root).
    pub fn action(&self, event: &FileEvent) -> Option<Action> {
        match (event.group, event.kind) {
            (Group::Templates, Change::Added | Change::Changed) => {
                Some(Action::Rerender(event.path.clone()))
            }
            (Group::Styles, _) => Some(Action::RecompileStyles),
            (Group::Static, Change::Added | Change::Changed) => {
                Some(Action::Recopy(event.path.clone()))
            }
            (group, Change::Deleted) => {
                let relative = event.path.strip_prefix(&self.source_dir).ok()?;
                let relative = match group {
                    Group::Templates => output_path(relative, &self.output_ext),
                    _ => relative.to_path_buf(),
                };

                Some(Action::Delete {
                    source: event.path.clone(),
                    output: self.build_dir.join(relative),
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn classifier() -> Classifier {
        Classifier::new(&Config::default(), Utf8Path::new("/site")).unwrap()
    }

    fn act(kind: Change, path: &str) -> Option<Action> {
        let classifier = classifier();
        let event = classifier.event(kind, path.into())?;
        classifier.action(&event)
    }

    #[test]
    fn test_groups_follow_precedence() {
        let c = classifier();
        assert_eq!(c.group(Utf8Path::new("/site/source/index.php")), Some(Group::Templates));
        assert_eq!(c.group(Utf8Path::new("/site/source/a/b.php")), Some(Group::Templates));
        assert_eq!(c.group(Utf8Path::new("/site/sass/_vars.scss")), Some(Group::Styles));
        assert_eq!(c.group(Utf8Path::new("/site/source/img/x.png")), Some(Group::Static));
        assert_eq!(c.group(Utf8Path::new("/site/build/index.html")), None);
        assert_eq!(c.group(Utf8Path::new("/site/README.md")), None);
    }

    #[test]
    fn test_template_extension_is_required() {
        let config = Config {
            templates_glob: "source/pages/**".into(),
            template_ext: "phtml".into(),
            ..Config::default()
        };
        let c = Classifier::new(&config, Utf8Path::new("/site")).unwrap();

        assert_eq!(c.group(Utf8Path::new("/site/source/pages/a.phtml")), Some(Group::Templates));
        assert!(!c.is_template(Utf8Path::new("/site/source/pages/notes.txt")));
        assert!(!c.is_template(Utf8Path::new("/site/source/index.phtml")));
    }

    #[test]
    fn test_template_actions() {
        assert_eq!(
            act(Change::Changed, "/site/source/blog/post.php"),
            Some(Action::Rerender("/site/source/blog/post.php".into()))
        );
        assert_eq!(
            act(Change::Added, "/site/source/new.php"),
            Some(Action::Rerender("/site/source/new.php".into()))
        );
        assert_eq!(
            act(Change::Deleted, "/site/source/blog/post.php"),
            Some(Action::Delete {
                source: "/site/source/blog/post.php".into(),
                output: "/site/build/blog/post.html".into(),
            })
        );
    }

    #[test]
    fn test_any_style_change_recompiles_everything() {
        for kind in [Change::Added, Change::Changed, Change::Deleted] {
            assert_eq!(
                act(kind, "/site/sass/_partial.scss"),
                Some(Action::RecompileStyles)
            );
        }
    }

    #[test]
    fn test_static_actions_keep_extension() {
        assert_eq!(
            act(Change::Changed, "/site/source/css/vendor.css"),
            Some(Action::Recopy("/site/source/css/vendor.css".into()))
        );
        assert_eq!(
            act(Change::Deleted, "/site/source/img/logo.png"),
            Some(Action::Delete {
                source: "/site/source/img/logo.png".into(),
                output: "/site/build/img/logo.png".into(),
            })
        );
    }

    #[test]
    fn test_unrelated_paths_are_ignored() {
        assert_eq!(act(Change::Changed, "/site/build/index.html"), None);
        assert_eq!(act(Change::Deleted, "/elsewhere/source/x.png"), None);
    }
}
