// Utility functions shared across the engine

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

/// Convert a path string to a Path reference.
///
/// Reduces the `Path::new(&project_path)` boilerplate found throughout the
/// command handlers.
#[inline]
pub fn as_path(path: &str) -> &Path {
    Path::new(path)
}

/// Lock a mutex, recovering from poisoning.
///
/// A poisoned mutex means a holder panicked; the data is still usable for our
/// purposes (all guarded state is valid-on-every-write), so recover instead of
/// propagating the panic.
pub fn lock_mutex_recover<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => {
            log::warn!("Mutex was poisoned, recovering: {}", poisoned);
            poisoned.into_inner()
        }
    }
}

/// Slugify a display name for use in branch names.
///
/// Lowercases, maps runs of non-alphanumeric characters to single dashes, and
/// trims leading/trailing dashes.
pub fn slugify(name: &str) -> String {
    let mut slug = String::with_capacity(name.len());
    let mut last_dash = true;
    for ch in name.chars() {
        if ch.is_ascii_alphanumeric() {
            slug.push(ch.to_ascii_lowercase());
            last_dash = false;
        } else if !last_dash {
            slug.push('-');
            last_dash = true;
        }
    }
    while slug.ends_with('-') {
        slug.pop();
    }
    if slug.is_empty() {
        slug.push_str("project");
    }
    slug
}

/// Current time as an RFC 3339 string (the format used in all persisted logs).
pub fn now_iso() -> String {
    chrono::Utc::now().to_rfc3339()
}

/// Derive the repository directory name from a remote URL.
///
/// `https://github.com/owner/name.git` and `git@github.com:owner/name` both
/// yield `name`.
pub fn repo_name_from_url(url: &str) -> String {
    let tail = url
        .trim_end_matches('/')
        .rsplit(&['/', ':'][..])
        .next()
        .unwrap_or(url);
    let name = tail.trim_end_matches(".git");
    if name.is_empty() {
        "repo".to_string()
    } else {
        name.to_string()
    }
}
