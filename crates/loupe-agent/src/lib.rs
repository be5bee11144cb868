mod edit;
mod manager;
mod registry;
mod retriever;
pub mod rpc;
pub mod tools;

#[cfg(test)]
mod testutil;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use loupe_core::cache::SymbolCache;
use loupe_core::{Error, Result};
use tokio::sync::Mutex;
use tracing::info;

pub use edit::{EditEngine, EditOutcome, RenameOutcome};
pub use manager::LanguageServerManager;
pub use registry::{LsLaunch, ServerRegistry};
pub use retriever::{
    EnclosingSymbol, FindOptions, OverviewRow, ReferenceHit, ResolvedSymbol, SymbolHit,
    SymbolRetriever,
};

struct ActiveProject {
    root: PathBuf,
    manager: Arc<LanguageServerManager>,
    retriever: Arc<SymbolRetriever>,
    engine: Arc<EditEngine>,
}

/// The explicit value threaded through the tool layer: one agent, at most
/// one active project, one language-server fleet. No process-wide
/// singletons.
pub struct Agent {
    registry: ServerRegistry,
    active: Mutex<Option<ActiveProject>>,
}

impl Agent {
    pub fn new(registry: ServerRegistry) -> Self {
        Self {
            registry,
            active: Mutex::new(None),
        }
    }

    /// Activate `root`. Re-activating the same root is a no-op; switching
    /// roots first drains the previous fleet completely.
    pub async fn activate_project(&self, root: &Path) -> Result<()> {
        let root = root
            .canonicalize()
            .with_context(|| format!("project root does not exist: {}", root.display()))?;
        if !root.is_dir() {
            return Err(Error::InvalidInput(format!(
                "project root is not a directory: {}",
                root.display()
            )));
        }

        let mut active = self.active.lock().await;
        if let Some(project) = active.as_ref()
            && project.root == root
        {
            return Ok(());
        }
        if let Some(previous) = active.take() {
            info!("deactivating project {}", previous.root.display());
            previous.manager.shutdown_all().await;
        }

        *active = Some(build_project(&self.registry, root));
        Ok(())
    }

    /// Tear down and rebuild the active project's fleet. This is the
    /// explicit recovery path after a server failure: failed entries are
    /// not restarted behind the caller's back.
    pub async fn reactivate_project(&self) -> Result<()> {
        let mut active = self.active.lock().await;
        let Some(previous) = active.take() else {
            return Err(Error::InvalidInput("no active project".to_string()));
        };
        let root = previous.root.clone();
        previous.manager.shutdown_all().await;
        info!("reactivating project {}", root.display());
        *active = Some(build_project(&self.registry, root));
        Ok(())
    }

    pub async fn deactivate(&self) {
        let mut active = self.active.lock().await;
        if let Some(previous) = active.take() {
            previous.manager.shutdown_all().await;
        }
    }

    pub async fn project_root(&self) -> Result<PathBuf> {
        Ok(self.require_active().await?.root.clone())
    }

    pub async fn manager(&self) -> Result<Arc<LanguageServerManager>> {
        Ok(self.require_active().await?.manager.clone())
    }

    pub async fn retriever(&self) -> Result<Arc<SymbolRetriever>> {
        Ok(self.require_active().await?.retriever.clone())
    }

    pub async fn engine(&self) -> Result<Arc<EditEngine>> {
        Ok(self.require_active().await?.engine.clone())
    }

    async fn require_active(&self) -> Result<ProjectHandles> {
        let active = self.active.lock().await;
        match active.as_ref() {
            Some(project) => Ok(ProjectHandles {
                root: project.root.clone(),
                manager: project.manager.clone(),
                retriever: project.retriever.clone(),
                engine: project.engine.clone(),
            }),
            None => Err(Error::InvalidInput(
                "no active project; activate one first".to_string(),
            )),
        }
    }
}

struct ProjectHandles {
    root: PathBuf,
    manager: Arc<LanguageServerManager>,
    retriever: Arc<SymbolRetriever>,
    engine: Arc<EditEngine>,
}

fn build_project(registry: &ServerRegistry, root: PathBuf) -> ActiveProject {
    info!("activating project {}", root.display());
    let cache = Arc::new(SymbolCache::for_project(&root));
    let manager = Arc::new(LanguageServerManager::new(
        root.clone(),
        registry.clone(),
        cache,
    ));
    let retriever = Arc::new(SymbolRetriever::new(manager.clone()));
    let engine = Arc::new(EditEngine::new(manager.clone()));
    ActiveProject {
        root,
        manager,
        retriever,
        engine,
    }
}
