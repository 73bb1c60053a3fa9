//! Serving a directory tree.

use std::path::{Component, Path, PathBuf};

use crate::config::Config;
use crate::host::Host;
use crate::http::file::AsyncFileResponse;
use crate::http::message::Message;
use crate::http::response::{HttpResponse, RedirectResponse};

/// A [`Host`] that serves files below a document root, with the
/// authentication policy taken from the configuration.
pub struct StaticSite {
    document_root: Option<PathBuf>,
    index_files: Vec<String>,
    buffer_size: usize,
    auth: crate::config::AuthConfig,
}

impl StaticSite {
    pub fn new(cfg: &Config) -> Self {
        Self {
            document_root: cfg.document_root.clone(),
            index_files: cfg.index_files.clone(),
            buffer_size: cfg.limits.file_buffer_size,
            auth: cfg.auth.clone(),
        }
    }

    /// File-system path for a URL path, `None` if it would leave the root.
    pub fn file_path_for(&self, url_path: &str) -> Option<PathBuf> {
        let mut pb = self.document_root.clone()?;
        for comp in Path::new(url_path.trim_start_matches('/')).components() {
            match comp {
                Component::Normal(s) => pb.push(s),
                Component::CurDir => {}
                _ => return None,
            }
        }
        Some(pb)
    }

    fn index_file(&self, dir: &Path) -> Option<PathBuf> {
        self.index_files
            .iter()
            .map(|name| dir.join(name))
            .find(|p| p.is_file())
    }
}

// `/private` covers `/private` and `/private/a` but not `/privateer`.
fn covers(prefix: &str, path: &str) -> bool {
    match path.strip_prefix(prefix) {
        Some(rest) => rest.is_empty() || rest.starts_with('/') || prefix.ends_with('/'),
        None => false,
    }
}

impl Host for StaticSite {
    fn is_password_protected(&self, path: &str) -> bool {
        self.auth
            .protected_paths
            .iter()
            .any(|prefix| covers(prefix, path))
    }

    fn use_digest_access_authentication(&self) -> bool {
        self.auth.digest
    }

    fn realm(&self) -> String {
        self.auth.realm.clone()
    }

    fn password_for_user(&self, username: &str) -> Option<String> {
        self.auth.users.get(username).cloned()
    }

    // Stats and opens files; runs on the blocking pool.
    fn response_for(&self, _request: &Message, path: &str) -> Option<HttpResponse> {
        let mut file = self.file_path_for(path)?;

        if file.is_dir() {
            if !path.ends_with('/') {
                return Some(HttpResponse::Redirect(RedirectResponse::permanent(format!(
                    "{}/",
                    path
                ))));
            }
            file = self.index_file(&file)?;
        }

        match AsyncFileResponse::open(&file, self.buffer_size) {
            Ok(response) => Some(HttpResponse::File(response)),
            Err(e) => {
                tracing::debug!(path = %file.display(), error = %e, "Cannot open file");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn site(root: &Path) -> StaticSite {
        let cfg = Config {
            document_root: Some(root.to_path_buf()),
            ..Config::default()
        };
        StaticSite::new(&cfg)
    }

    #[test]
    fn map_path_prevents_traversal() {
        let s = site(Path::new("/srv/www"));
        assert!(s.file_path_for("/../etc/passwd").is_none());
        assert_eq!(
            s.file_path_for("/a/./b.txt"),
            Some(PathBuf::from("/srv/www/a/b.txt"))
        );
    }

    #[test]
    fn nothing_served_without_root() {
        let s = StaticSite::new(&Config::default());
        assert!(s.file_path_for("/index.html").is_none());
    }

    #[test]
    fn protected_prefixes() {
        let mut cfg = Config::default();
        cfg.auth.protected_paths = vec!["/private".to_string()];
        let s = StaticSite::new(&cfg);
        assert!(s.is_password_protected("/private"));
        assert!(s.is_password_protected("/private/a.txt"));
        assert!(!s.is_password_protected("/privateer/a.txt"));
        assert!(!s.is_password_protected("/public/a.txt"));
    }
}
