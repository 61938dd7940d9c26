//! Resolution of avatar/frame asset URLs per §6: first matching extension
//! wins, user-data directory takes precedence over the bundled defaults.

use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::warn;

/// Extension preference order for avatar and frame images.
const EXT_ORDER: [&str; 6] = ["svg", "png", "apng", "gif", "webp", "avif"];

#[derive(Debug, Clone)]
pub struct AssetUrls {
    pub avatar_idle: String,
    pub avatar_talk: String,
    pub frame_idle: String,
    pub frame_talk: String,
}

/// Wire shape of [`AssetUrls`] for the `/state.json` response.
#[derive(Debug, Clone, Serialize)]
pub struct AssetUrlsJson {
    pub avatar_idle: String,
    pub avatar_talk: String,
    pub frame_idle: String,
    pub frame_talk: String,
}

impl From<AssetUrls> for AssetUrlsJson {
    fn from(u: AssetUrls) -> Self {
        Self {
            avatar_idle: u.avatar_idle,
            avatar_talk: u.avatar_talk,
            frame_idle: u.frame_idle,
            frame_talk: u.frame_talk,
        }
    }
}

/// Resolves asset URLs against a user-data assets directory with a bundled
/// defaults directory as fallback, and seeds freshly created per-user
/// directories from `users/example/`.
#[derive(Debug, Clone)]
pub struct AssetResolver {
    user_assets_dir: PathBuf,
    default_assets_dir: PathBuf,
}

impl AssetResolver {
    pub fn new(user_assets_dir: PathBuf, default_assets_dir: PathBuf) -> Self {
        Self {
            user_assets_dir,
            default_assets_dir,
        }
    }

    /// Ensures `users/<uid>/` exists under the user-data assets directory,
    /// seeding it from `users/example/` in the bundled defaults on first
    /// creation. Best-effort: failures are logged, never fatal.
    pub fn ensure_user_dir(&self, uid: &str) {
        if uid.is_empty() {
            return;
        }
        let dir = self.user_assets_dir.join("users").join(uid);
        if dir.is_dir() {
            return;
        }
        if let Err(e) = std::fs::create_dir_all(&dir) {
            warn!(uid, error = %e, "failed to create user asset directory");
            return;
        }
        let example = self.default_assets_dir.join("users").join("example");
        let Ok(entries) = std::fs::read_dir(&example) else {
            return;
        };
        for entry in entries.flatten() {
            let src = entry.path();
            if !src.is_file() {
                continue;
            }
            if let Some(name) = src.file_name() {
                let _ = std::fs::copy(&src, dir.join(name));
            }
        }
    }

    pub fn urls_for(&self, uid: &str) -> AssetUrls {
        let user_dir = self.user_assets_dir.join("users").join(uid);
        let default_dir = self.default_assets_dir.join("users").join(uid);
        let example_dir = self.default_assets_dir.join("users").join("example");

        AssetUrls {
            avatar_idle: self.resolve(
                &[&user_dir, &default_dir, &example_dir],
                "avatar",
                &format!("/assets/users/{uid}/avatar.svg"),
            ),
            avatar_talk: self.resolve(
                &[&user_dir, &default_dir, &example_dir],
                "avatar_talk",
                &format!("/assets/users/{uid}/avatar_talk.svg"),
            ),
            frame_idle: self.resolve(
                &[&self.user_assets_dir, &self.default_assets_dir],
                "frame",
                "/assets/frame.svg",
            ),
            frame_talk: self.resolve(
                &[&self.user_assets_dir, &self.default_assets_dir],
                "frame_talk",
                "/assets/frame_talk.svg",
            ),
        }
    }

    /// Scans `candidates` in order, each with the full extension preference
    /// list, returning the first existing file's root-relative URL. Falls
    /// back to `default_url` (pointing at the first candidate, unverified)
    /// if nothing exists yet.
    fn resolve(&self, candidates: &[&Path], stem: &str, default_url: &str) -> String {
        for dir in candidates {
            for ext in EXT_ORDER {
                let path = dir.join(format!("{stem}.{ext}"));
                if path.is_file() {
                    if let Some(url) = self.to_asset_url(&path) {
                        return url;
                    }
                }
            }
        }
        default_url.to_string()
    }

    fn to_asset_url(&self, path: &Path) -> Option<String> {
        for root in [&self.user_assets_dir, &self.default_assets_dir] {
            if let Ok(rel) = path.strip_prefix(root) {
                let rel = rel.to_string_lossy().replace('\\', "/");
                return Some(format!("/assets/{rel}"));
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write(path: &Path, contents: &str) {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, contents).unwrap();
    }

    #[test]
    fn prefers_user_dir_over_defaults() {
        let tmp = tempfile::tempdir().unwrap();
        let user_dir = tmp.path().join("user-data/assets");
        let default_dir = tmp.path().join("defaults/assets");
        write(&user_dir.join("users/u1/avatar.png"), "x");
        write(&default_dir.join("users/u1/avatar.svg"), "x");

        let resolver = AssetResolver::new(user_dir, default_dir);
        let urls = resolver.urls_for("u1");
        assert_eq!(urls.avatar_idle, "/assets/users/u1/avatar.png");
    }

    #[test]
    fn falls_back_to_defaults_when_user_file_absent() {
        let tmp = tempfile::tempdir().unwrap();
        let user_dir = tmp.path().join("user-data/assets");
        let default_dir = tmp.path().join("defaults/assets");
        write(&default_dir.join("users/u1/avatar.gif"), "x");

        let resolver = AssetResolver::new(user_dir, default_dir);
        let urls = resolver.urls_for("u1");
        assert_eq!(urls.avatar_idle, "/assets/users/u1/avatar.gif");
    }

    #[test]
    fn extension_order_prefers_svg_over_png() {
        let tmp = tempfile::tempdir().unwrap();
        let user_dir = tmp.path().join("user-data/assets");
        let default_dir = tmp.path().join("defaults/assets");
        write(&user_dir.join("users/u1/avatar.png"), "x");
        write(&user_dir.join("users/u1/avatar.svg"), "x");

        let resolver = AssetResolver::new(user_dir, default_dir);
        let urls = resolver.urls_for("u1");
        assert_eq!(urls.avatar_idle, "/assets/users/u1/avatar.svg");
    }

    #[test]
    fn missing_everywhere_yields_conventional_default_url() {
        let tmp = tempfile::tempdir().unwrap();
        let resolver = AssetResolver::new(
            tmp.path().join("user-data/assets"),
            tmp.path().join("defaults/assets"),
        );
        let urls = resolver.urls_for("ghost");
        assert_eq!(urls.avatar_idle, "/assets/users/ghost/avatar.svg");
    }

    #[test]
    fn ensure_user_dir_seeds_from_example() {
        let tmp = tempfile::tempdir().unwrap();
        let user_dir = tmp.path().join("user-data/assets");
        let default_dir = tmp.path().join("defaults/assets");
        write(&default_dir.join("users/example/avatar.svg"), "example-svg");

        let resolver = AssetResolver::new(user_dir.clone(), default_dir);
        resolver.ensure_user_dir("new-uid");
        let copied = user_dir.join("users/new-uid/avatar.svg");
        assert!(copied.is_file());
        assert_eq!(std::fs::read_to_string(copied).unwrap(), "example-svg");
    }
}
