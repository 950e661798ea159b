use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
    time::{Duration, SystemTime},
};

use tracing::{info, warn};

pub async fn prepare_storage_root(root: &Path) -> std::io::Result<()> {
    tokio::fs::create_dir_all(root).await
}

/// Deletes `path` once `after` has elapsed. A zero delay keeps the file.
pub fn schedule_removal(path: PathBuf, after: Duration) {
    if after.is_zero() {
        return;
    }

    tokio::spawn(async move {
        tokio::time::sleep(after).await;
        if let Err(error) = tokio::fs::remove_file(&path).await
            && error.kind() != ErrorKind::NotFound
        {
            warn!(path = %path.display(), %error, "could not remove downloaded file");
        }
    });
}

/// Removes every file in `root` whose name starts with `prefix`, including
/// partial downloads. Returns how many were removed.
pub async fn remove_prefixed(root: &Path, prefix: &str) -> usize {
    let mut entries = match tokio::fs::read_dir(root).await {
        Ok(entries) => entries,
        Err(error) => {
            if error.kind() != ErrorKind::NotFound {
                warn!(root = %root.display(), %error, "could not open storage root for cleanup");
            }
            return 0;
        }
    };

    let mut removed = 0;
    while let Ok(Some(entry)) = entries.next_entry().await {
        let matches_prefix = entry
            .file_name()
            .to_str()
            .is_some_and(|name| name.starts_with(prefix));
        if !matches_prefix {
            continue;
        }
        match tokio::fs::remove_file(entry.path()).await {
            Ok(()) => removed += 1,
            Err(error) if error.kind() == ErrorKind::NotFound => {}
            Err(error) => {
                warn!(path = %entry.path().display(), %error, "could not remove job file");
            }
        }
    }
    removed
}

/// Removes entries of `root` last modified more than `older_than` ago.
/// Returns how many were removed.
pub async fn cleanup_stale_downloads(root: &Path, older_than: Duration) -> usize {
    if older_than.is_zero() {
        return 0;
    }

    let mut entries = match tokio::fs::read_dir(root).await {
        Ok(entries) => entries,
        Err(error) => {
            if error.kind() != ErrorKind::NotFound {
                warn!(root = %root.display(), %error, "could not open storage root for cleanup");
            }
            return 0;
        }
    };

    let now = SystemTime::now();
    let mut removed = 0;

    loop {
        let entry = match entries.next_entry().await {
            Ok(Some(entry)) => entry,
            Ok(None) => break,
            Err(error) => {
                warn!(%error, "could not iterate storage root for cleanup");
                break;
            }
        };

        let path = entry.path();
        let metadata = match entry.metadata().await {
            Ok(metadata) => metadata,
            Err(error) => {
                warn!(path = %path.display(), %error, "could not read metadata");
                continue;
            }
        };

        let age = metadata
            .modified()
            .ok()
            .and_then(|modified| now.duration_since(modified).ok())
            .unwrap_or_default();
        if age < older_than {
            continue;
        }

        let result = if metadata.is_dir() {
            tokio::fs::remove_dir_all(&path).await
        } else {
            tokio::fs::remove_file(&path).await
        };
        match result {
            Ok(()) => removed += 1,
            Err(error) if error.kind() == ErrorKind::NotFound => {}
            Err(error) => warn!(path = %path.display(), %error, "could not remove stale entry"),
        }
    }

    if removed > 0 {
        info!(removed, root = %root.display(), "removed stale downloads");
    }
    removed
}
