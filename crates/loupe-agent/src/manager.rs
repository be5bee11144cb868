use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use loupe_core::cache::SymbolCache;
use loupe_core::lang::Language;
use loupe_core::{Error, Result};
use loupe_lsp::{LanguageServer, LanguageServerOptions};
use tokio::sync::{Mutex, watch};
use tokio::task::JoinSet;
use tokio::time::{Duration, timeout};
use tracing::{info, warn};

use crate::registry::ServerRegistry;

const SHUTDOWN_DEADLINE: Duration = Duration::from_secs(5);

enum Slot {
    /// Startup in flight; the receiver wakes when the slot resolves.
    Starting(watch::Receiver<()>),
    Ready(Arc<LanguageServer>),
    Failed(String),
}

/// Owns the per-project language-server fleet. Servers start lazily on
/// the first request for their language; concurrent first-callers coalesce
/// onto one in-flight start, and different languages start in parallel.
/// A failed entry fails fast until the project is reactivated.
pub struct LanguageServerManager {
    project_root: PathBuf,
    registry: ServerRegistry,
    cache: Arc<SymbolCache>,
    servers: Arc<Mutex<HashMap<Language, Slot>>>,
    initialize_timeout: Duration,
    request_timeout: Duration,
}

impl LanguageServerManager {
    pub fn new(
        project_root: PathBuf,
        registry: ServerRegistry,
        cache: Arc<SymbolCache>,
    ) -> Self {
        Self {
            project_root,
            registry,
            cache,
            servers: Arc::new(Mutex::new(HashMap::new())),
            initialize_timeout: Duration::from_secs(20),
            request_timeout: Duration::from_secs(60),
        }
    }

    pub fn project_root(&self) -> &Path {
        &self.project_root
    }

    pub fn cache(&self) -> &Arc<SymbolCache> {
        &self.cache
    }

    /// Whether a language server is configured for this file's language.
    pub fn supports(&self, path: &Path) -> bool {
        Language::from_path(path)
            .map(|l| self.registry.lookup(l).is_some())
            .unwrap_or(false)
    }

    pub async fn server_for(&self, path: &Path) -> Result<Arc<LanguageServer>> {
        let Some(language) = Language::from_path(path) else {
            return Err(Error::UnsupportedLanguage {
                path: path.to_path_buf(),
            });
        };
        if self.registry.lookup(language).is_none() {
            return Err(Error::UnsupportedLanguage {
                path: path.to_path_buf(),
            });
        }
        self.server_for_language(language).await
    }

    pub async fn server_for_language(&self, language: Language) -> Result<Arc<LanguageServer>> {
        loop {
            let mut waiter = {
                let mut slots = self.servers.lock().await;
                let existing = match slots.get(&language) {
                    Some(Slot::Ready(server)) => return Ok(server.clone()),
                    Some(Slot::Failed(message)) => {
                        return Err(Error::StartupFailed(message.clone()));
                    }
                    Some(Slot::Starting(rx)) => Some(rx.clone()),
                    None => None,
                };
                match existing {
                    Some(rx) => rx,
                    None => {
                        let (tx, rx) = watch::channel(());
                        slots.insert(language, Slot::Starting(rx.clone()));
                        self.spawn_start(language, tx);
                        rx
                    }
                }
            };
            let _ = waiter.changed().await;

            // The sender is dropped once the slot resolves. If the slot is
            // somehow still Starting the startup task died without
            // reporting; record that instead of spinning.
            let mut slots = self.servers.lock().await;
            let stuck = matches!(slots.get(&language), Some(Slot::Starting(_)));
            if stuck {
                slots.insert(
                    language,
                    Slot::Failed("language server startup was interrupted".to_string()),
                );
            }
        }
    }

    /// Register an externally started server, e.g. one attached over a
    /// custom transport.
    pub async fn adopt(&self, language: Language, server: Arc<LanguageServer>) {
        self.servers.lock().await.insert(language, Slot::Ready(server));
    }

    /// Startup runs detached so a caller-side timeout cannot abandon a
    /// half-spawned subprocess.
    fn spawn_start(&self, language: Language, tx: watch::Sender<()>) {
        let Some(launch) = self.registry.lookup(language).cloned() else {
            // server_for checked this; keep the slot sane anyway.
            let servers = self.servers.clone();
            tokio::spawn(async move {
                let mut slots = servers.lock().await;
                slots.insert(
                    language,
                    Slot::Failed(format!("no server registered for {language}")),
                );
                drop(tx);
            });
            return;
        };

        let options = LanguageServerOptions {
            ls_id: launch.ls_id.clone(),
            language,
            command: launch.command.clone(),
            args: launch.args.clone(),
            workspace_root: self.project_root.clone(),
            initialize_timeout: self.initialize_timeout,
            request_timeout: self.request_timeout,
            initialize_options: launch.initialize_options.clone(),
        };
        let cache = self.cache.clone();
        let servers = self.servers.clone();

        tokio::spawn(async move {
            info!("starting {} for {language}", launch.ls_id);
            let result = LanguageServer::start(options, cache).await;
            let mut slots = servers.lock().await;
            match result {
                Ok(server) => {
                    slots.insert(language, Slot::Ready(Arc::new(server)));
                }
                Err(err) => {
                    warn!("{} failed to start: {err}", launch.ls_id);
                    slots.insert(language, Slot::Failed(err.to_string()));
                }
            }
            drop(slots);
            drop(tx);
        });
    }

    /// Fan out shutdown across the fleet, join with a bounded deadline and
    /// log stragglers. The fleet map is drained either way.
    pub async fn shutdown_all(&self) {
        let drained: Vec<(Language, Slot)> = {
            let mut slots = self.servers.lock().await;
            slots.drain().collect()
        };

        let mut set = JoinSet::new();
        for (language, slot) in drained {
            if let Slot::Ready(server) = slot {
                set.spawn(async move {
                    if timeout(SHUTDOWN_DEADLINE, server.shutdown()).await.is_err() {
                        warn!("language server for {language} ignored shutdown; killed");
                    }
                });
            }
        }
        while set.join_next().await.is_some() {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn manager(root: &Path) -> LanguageServerManager {
        let cache = Arc::new(SymbolCache::for_project(root));
        LanguageServerManager::new(root.to_path_buf(), ServerRegistry::builtin(), cache)
    }

    #[tokio::test]
    async fn unsupported_language_is_rejected() {
        let dir = TempDir::new().unwrap();
        let m = manager(dir.path());
        let err = m.server_for(&dir.path().join("notes.txt")).await.unwrap_err();
        assert!(matches!(err, Error::UnsupportedLanguage { .. }));
        assert!(!m.supports(&dir.path().join("notes.txt")));
        assert!(m.supports(&dir.path().join("a.py")));
    }

    #[tokio::test]
    async fn failed_start_is_recorded_and_fails_fast() {
        let dir = TempDir::new().unwrap();
        let mut registry = ServerRegistry::builtin();
        registry.set(
            Language::Python,
            crate::registry::LsLaunch {
                ls_id: "missing".to_string(),
                command: "loupe-test-definitely-missing-binary".to_string(),
                args: Vec::new(),
                initialize_options: None,
            },
        );
        let cache = Arc::new(SymbolCache::for_project(dir.path()));
        let m = LanguageServerManager::new(dir.path().to_path_buf(), registry, cache);

        let err = m.server_for(&dir.path().join("a.py")).await.unwrap_err();
        assert!(matches!(err, Error::StartupFailed(_)));

        // Second caller fails fast from the recorded slot.
        let err = m.server_for(&dir.path().join("b.py")).await.unwrap_err();
        assert!(matches!(err, Error::StartupFailed(_)));
    }

    #[tokio::test]
    async fn shutdown_all_drains_the_fleet() {
        let dir = TempDir::new().unwrap();
        let m = manager(dir.path());
        // Nothing started; must return promptly and leave the map empty.
        m.shutdown_all().await;
        assert!(m.servers.lock().await.is_empty());
    }
}
