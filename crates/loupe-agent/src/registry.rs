use std::collections::HashMap;

use loupe_core::lang::Language;
use serde_json::Value;

/// How to launch the language server that handles one language.
#[derive(Debug, Clone)]
pub struct LsLaunch {
    /// Stable identifier used in cache keys and logs.
    pub ls_id: String,
    pub command: String,
    pub args: Vec<String>,
    pub initialize_options: Option<Value>,
}

impl LsLaunch {
    fn new(ls_id: &str, command: &str, args: &[&str]) -> Self {
        Self {
            ls_id: ls_id.to_string(),
            command: command.to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
            initialize_options: None,
        }
    }
}

/// Language -> launch-spec table. Project descriptors may override single
/// entries; everything else falls back to the stock commands below.
#[derive(Debug, Clone, Default)]
pub struct ServerRegistry {
    entries: HashMap<Language, LsLaunch>,
}

impl ServerRegistry {
    pub fn builtin() -> Self {
        let mut entries = HashMap::new();
        entries.insert(
            Language::Python,
            LsLaunch::new("pyright", "pyright-langserver", &["--stdio"]),
        );
        entries.insert(
            Language::Rust,
            LsLaunch::new("rust-analyzer", "rust-analyzer", &[]),
        );
        entries.insert(
            Language::TypeScript,
            LsLaunch::new(
                "typescript-language-server",
                "typescript-language-server",
                &["--stdio"],
            ),
        );
        entries.insert(
            Language::JavaScript,
            LsLaunch::new(
                "typescript-language-server",
                "typescript-language-server",
                &["--stdio"],
            ),
        );
        entries.insert(Language::Go, LsLaunch::new("gopls", "gopls", &[]));
        entries.insert(Language::Java, LsLaunch::new("jdtls", "jdtls", &[]));
        entries.insert(
            Language::CSharp,
            LsLaunch::new("omnisharp", "omnisharp", &["-lsp"]),
        );
        entries.insert(Language::Cpp, LsLaunch::new("clangd", "clangd", &[]));
        entries.insert(
            Language::Ruby,
            LsLaunch::new("solargraph", "solargraph", &["stdio"]),
        );
        entries.insert(
            Language::Php,
            LsLaunch::new("intelephense", "intelephense", &["--stdio"]),
        );
        Self { entries }
    }

    pub fn lookup(&self, language: Language) -> Option<&LsLaunch> {
        self.entries.get(&language)
    }

    pub fn set(&mut self, language: Language, launch: LsLaunch) {
        self.entries.insert(language, launch);
    }

    pub fn languages(&self) -> impl Iterator<Item = (Language, &LsLaunch)> {
        self.entries.iter().map(|(l, s)| (*l, s))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_covers_core_languages() {
        let registry = ServerRegistry::builtin();
        assert_eq!(registry.lookup(Language::Python).unwrap().ls_id, "pyright");
        assert_eq!(
            registry.lookup(Language::Rust).unwrap().command,
            "rust-analyzer"
        );
        assert!(registry.lookup(Language::Go).is_some());
    }

    #[test]
    fn overrides_replace_builtin_entries() {
        let mut registry = ServerRegistry::builtin();
        registry.set(
            Language::Python,
            LsLaunch::new("jedi", "jedi-language-server", &[]),
        );
        assert_eq!(registry.lookup(Language::Python).unwrap().ls_id, "jedi");
    }
}
