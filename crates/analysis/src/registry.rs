use std::collections::HashMap;
use std::sync::Arc;

use crate::provider::{AnalysisProvider, TaskError};

/// Name-indexed set of analysis providers.
///
/// Lookup tries an exact match on [`crate::TaskConfig::provider`] first and
/// falls back to a provider registered under `"*"`.
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    providers: HashMap<String, Arc<dyn AnalysisProvider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `provider` under `name`, replacing any previous entry.
    pub fn register(&mut self, name: impl Into<String>, provider: Arc<dyn AnalysisProvider>) {
        self.providers.insert(name.into(), provider);
    }

    pub fn with(mut self, name: impl Into<String>, provider: Arc<dyn AnalysisProvider>) -> Self {
        self.register(name, provider);
        self
    }

    pub fn resolve(&self, name: &str) -> Result<Arc<dyn AnalysisProvider>, TaskError> {
        self.providers
            .get(name)
            .or_else(|| self.providers.get("*"))
            .cloned()
            .ok_or_else(|| TaskError::UnknownProvider(name.to_string()))
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.providers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }
}

impl std::fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderRegistry")
            .field("providers", &self.names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;

    use super::*;
    use crate::provider::TaskConfig;

    struct Named(&'static str);

    #[async_trait]
    impl AnalysisProvider for Named {
        fn name(&self) -> &str {
            self.0
        }

        async fn analyze(&self, _text: &str, _config: &TaskConfig) -> Result<String, TaskError> {
            Ok(self.0.to_string())
        }
    }

    #[test]
    fn exact_match_wins_over_wildcard() {
        let registry = ProviderRegistry::new()
            .with("*", Arc::new(Named("fallback")))
            .with("openai", Arc::new(Named("openai")));

        assert_eq!(registry.resolve("openai").unwrap().name(), "openai");
        assert_eq!(registry.resolve("ollama").unwrap().name(), "fallback");
    }

    #[test]
    fn unknown_provider_without_wildcard_fails() {
        let registry = ProviderRegistry::new().with("openai", Arc::new(Named("openai")));

        let err = registry.resolve("anthropic").err().unwrap();
        assert_eq!(err, TaskError::UnknownProvider("anthropic".to_string()));
    }

    #[test]
    fn names_are_sorted() {
        let registry = ProviderRegistry::new()
            .with("b", Arc::new(Named("b")))
            .with("a", Arc::new(Named("a")));
        assert_eq!(registry.names(), vec!["a", "b"]);
    }
}
