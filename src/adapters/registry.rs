use crate::adapters::adapter::LanguageAdapter;
use crate::adapters::languages::{
    cpp::CppAdapter, java::JavaAdapter, javascript::JavaScriptAdapter, python::PythonAdapter,
};
use crate::config::types::{EngineError, Language, Result};
use std::collections::BTreeMap;

pub fn adapter_for(language: Language) -> Box<dyn LanguageAdapter> {
    match language {
        Language::Python => Box::new(PythonAdapter),
        Language::JavaScript => Box::new(JavaScriptAdapter),
        Language::Java => Box::new(JavaAdapter),
        Language::Cpp => Box::new(CppAdapter),
    }
}

/// One adapter per language, registered at engine start.
pub struct AdapterRegistry {
    adapters: BTreeMap<Language, Box<dyn LanguageAdapter>>,
}

impl AdapterRegistry {
    pub fn builtin() -> Self {
        let mut registry = Self {
            adapters: BTreeMap::new(),
        };
        for language in Language::ALL {
            registry.register(adapter_for(language));
        }
        registry
    }

    pub fn register(&mut self, adapter: Box<dyn LanguageAdapter>) {
        self.adapters.insert(adapter.language(), adapter);
    }

    pub fn get(&self, language: Language) -> Result<&dyn LanguageAdapter> {
        self.adapters
            .get(&language)
            .map(|adapter| adapter.as_ref())
            .ok_or_else(|| EngineError::UnsupportedLanguage(language.to_string()))
    }
}
