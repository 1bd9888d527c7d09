//! Watch mode.
//!
//! A debounced `notify` watcher observes the static roots of every glob
//! group. Its callback turns raw OS events into [`FileEvent`]s and pushes them
//! onto a channel; a single dispatch loop consumes the channel, picks the
//! incremental [`Action`](crate::event::Action) for each event and spawns it.
//! Actions are not awaited by the loop, so two renders of the same file may
//! overlap; whichever finishes last wins. Every finished action sends a
//! reload notification.

use std::sync::Arc;
use std::time::Duration;

use camino::Utf8PathBuf;
use notify::event::{ModifyKind, RenameMode};
use notify::{EventKind, RecommendedWatcher, RecursiveMode};
use notify_debouncer_full::{DebounceEventResult, Debouncer, RecommendedCache, new_debouncer};
use tokio::sync::mpsc::{UnboundedReceiver, unbounded_channel};

use crate::error::WatchError;
use crate::event::{Change, Classifier, FileEvent};
use crate::server::{Reload, ReloadHandle};
use crate::site::Site;
use crate::utils::paint_path;

/// Live subscription; dropping it stops the watcher.
pub struct WatchHandle {
    _debouncer: Debouncer<RecommendedWatcher, RecommendedCache>,
}

/// Start watching `roots` recursively. Events outside every glob group are
/// filtered out before they reach the channel.
pub fn subscribe(
    classifier: Arc<Classifier>,
    roots: &[Utf8PathBuf],
    debounce: Duration,
) -> Result<(WatchHandle, UnboundedReceiver<FileEvent>), WatchError> {
    let (tx, rx) = unbounded_channel();

    let mut debouncer = new_debouncer(debounce, None, move |result: DebounceEventResult| {
        match result {
            Ok(events) => {
                for de in events {
                    for (kind, path) in changes(&de.event) {
                        let Some(event) = classifier.event(kind, path) else {
                            continue;
                        };
                        if tx.send(event).is_err() {
                            return;
                        }
                    }
                }
            }
            Err(errors) => {
                for e in errors {
                    tracing::error!("watch error: {e:?}");
                }
            }
        }
    })?;

    for root in roots {
        tracing::info!("watching {}", paint_path(root));
        debouncer.watch(root, RecursiveMode::Recursive)?;
    }

    Ok((
        WatchHandle {
            _debouncer: debouncer,
        },
        rx,
    ))
}

/// Translate one OS event into changes. Renames become a deletion of the old
/// path and an addition of the new one.
fn changes(event: &notify::Event) -> Vec<(Change, Utf8PathBuf)> {
    let paths: Vec<Utf8PathBuf> = event
        .paths
        .iter()
        .filter_map(|path| Utf8PathBuf::try_from(path.clone()).ok())
        .collect();

    let all = |kind: Change| paths.iter().map(|p| (kind, p.clone())).collect::<Vec<_>>();

    match event.kind {
        EventKind::Create(_) => all(Change::Added),
        EventKind::Remove(_) => all(Change::Deleted),
        EventKind::Modify(ModifyKind::Name(RenameMode::From)) => all(Change::Deleted),
        EventKind::Modify(ModifyKind::Name(RenameMode::To)) => all(Change::Added),
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => match paths.as_slice() {
            [from, to] => vec![(Change::Deleted, from.clone()), (Change::Added, to.clone())],
            _ => Vec::new(),
        },
        EventKind::Modify(ModifyKind::Name(_)) => paths
            .iter()
            .map(|p| {
                let kind = if p.exists() {
                    Change::Added
                } else {
                    Change::Deleted
                };
                (kind, p.clone())
            })
            .collect(),
        EventKind::Modify(_) => all(Change::Changed),
        _ => Vec::new(),
    }
}

/// Consume events until the channel closes, spawning one action per event.
pub async fn dispatch(
    mut events: UnboundedReceiver<FileEvent>,
    site: Arc<Site>,
    reload: ReloadHandle,
) {
    while let Some(event) = events.recv().await {
        let Some(action) = site.classifier().action(&event) else {
            tracing::debug!(path = %event.path, "no action for event");
            continue;
        };

        tracing::debug!(?event, ?action, "dispatching");

        let site = site.clone();
        let reload = reload.clone();
        tokio::spawn(async move {
            let applied = site.apply(action).await;

            if applied.outputs.is_empty() {
                reload.notify(Reload::page("/"));
            }

            for output in &applied.outputs {
                let href = site.href(output);
                if applied.live_css {
                    reload.notify(Reload::stylesheet(href));
                } else {
                    reload.notify(Reload::page(href));
                }
            }
        });
    }

    tracing::info!("watch channel closed");
}
