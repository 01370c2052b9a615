//! Polling file watcher.
//!
//! The engine consumes an abstract event stream; this is the binary's
//! concrete implementation of that stream. It periodically re-stats the
//! graph's watchable surface and emits one event per observed difference
//! burst. Unreadable paths simply read as absent, so transient I/O errors
//! cannot kill the watch loop.

use std::{collections::BTreeMap, time::Duration};

use futures::Stream;
use tracing::{trace, warn};

use wireit::{
    glob::PatternSet,
    manifest::{self, FileManifestEntry},
    watch::{WatchEvent, WatchSources},
};

/// One comparable snapshot of everything watched.
type Snapshot = BTreeMap<String, FileManifestEntry>;

async fn snapshot(sources: &WatchSources) -> Snapshot {
    let mut state = Snapshot::new();

    for (package, globs) in &sources.package_globs {
        let set = match PatternSet::parse(globs) {
            Ok(set) => set,
            Err(error) => {
                warn!(?error, ?package, "skipping unparsable watch globs");
                continue;
            }
        };
        match manifest::gather(package, &set).await {
            Ok(gathered) => {
                for (relative, entry) in gathered {
                    state.insert(format!("{}\0{relative}", package.display()), entry);
                }
            }
            Err(error) => {
                trace!(?error, ?package, "watch snapshot incomplete");
            }
        }
    }

    for file in &sources.files {
        if let Ok(Some(metadata)) = wireit::fs::symlink_metadata_optional(file).await {
            state.insert(
                format!("{}", file.display()),
                FileManifestEntry::from_metadata(&metadata),
            );
        }
    }

    state
}

/// Emit a [`WatchEvent`] whenever consecutive snapshots differ.
pub fn poll_events(
    sources: WatchSources,
    interval: Duration,
) -> impl Stream<Item = WatchEvent> + Unpin {
    let (sender, receiver) = flume::bounded::<WatchEvent>(1);

    tokio::spawn(async move {
        let mut previous = snapshot(&sources).await;
        loop {
            tokio::time::sleep(interval).await;
            let current = snapshot(&sources).await;
            if current != previous {
                trace!("watched files changed");
                previous = current;
                if sender.send_async(WatchEvent::default()).await.is_err() {
                    return;
                }
            }
        }
    });

    receiver.into_stream()
}
