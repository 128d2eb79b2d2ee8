// Runtime configuration: which image and interpreter run a program
use anyhow::{anyhow, bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use tracing::info;

pub const PYTHON: &str = "python";
pub const JAVASCRIPT: &str = "javascript";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Runtime {
    pub name: String,
    pub image: String,
    /// Name the program is written under inside the code directory
    pub file_name: String,
    /// Interpreter invocation; the program path is appended
    pub interpreter: Vec<String>,
}

impl Runtime {
    pub fn python() -> Self {
        Self {
            name: PYTHON.to_string(),
            image: "python:3.12-slim".to_string(),
            file_name: "submission_code.py".to_string(),
            interpreter: vec!["python".to_string()],
        }
    }

    pub fn javascript() -> Self {
        Self {
            name: JAVASCRIPT.to_string(),
            image: "node:18-slim".to_string(),
            file_name: "submission_code.js".to_string(),
            interpreter: vec!["node".to_string()],
        }
    }

    /// Full command line for a program mounted at `code_dir`
    pub fn command(&self, code_dir: &str) -> Vec<String> {
        let mut command = self.interpreter.clone();
        command.push(format!("{}/{}", code_dir, self.file_name));
        command
    }

    fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() || self.image.trim().is_empty() {
            bail!("runtime entries need a name and an image");
        }
        if self.interpreter.is_empty() {
            bail!("runtime `{}` has no interpreter command", self.name);
        }
        if self.file_name.is_empty() || self.file_name.contains('/') {
            bail!("runtime `{}` has an invalid file name `{}`", self.name, self.file_name);
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct LanguagesJson {
    languages: Vec<Runtime>,
}

/// Runtimes by name
#[derive(Debug, Clone)]
pub struct RuntimeRegistry {
    runtimes: HashMap<String, Runtime>,
}

impl RuntimeRegistry {
    pub fn builtin() -> Self {
        Self::from_runtimes(vec![Runtime::python(), Runtime::javascript()])
    }

    fn from_runtimes(runtimes: Vec<Runtime>) -> Self {
        Self {
            runtimes: runtimes.into_iter().map(|rt| (rt.name.clone(), rt)).collect(),
        }
    }

    /// Load runtimes from a languages.json file
    pub fn load(config_path: &Path) -> Result<Self> {
        let content = fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read {}", config_path.display()))?;
        Self::parse(&content).with_context(|| format!("Failed to parse {}", config_path.display()))
    }

    pub fn parse(content: &str) -> Result<Self> {
        let languages: LanguagesJson = serde_json::from_str(content)?;
        for runtime in &languages.languages {
            runtime.validate()?;
        }

        let registry = Self::from_runtimes(languages.languages);
        if !registry.runtimes.contains_key(PYTHON) {
            bail!("no `{}` runtime configured; grading requires it", PYTHON);
        }
        Ok(registry)
    }

    /// Load `config_path` when it exists, otherwise use the built-in runtimes
    pub fn load_or_builtin(config_path: &Path) -> Result<Self> {
        if config_path.exists() {
            Self::load(config_path)
        } else {
            info!(path = %config_path.display(), "Language config not found, using built-in runtimes");
            Ok(Self::builtin())
        }
    }

    pub fn get(&self, name: &str) -> Result<&Runtime> {
        self.runtimes
            .get(name)
            .ok_or_else(|| anyhow!("No runtime configured for language: {}", name))
    }

    /// The runtime used for grading
    pub fn python(&self) -> Result<&Runtime> {
        self.get(PYTHON)
    }

    pub fn list_languages(&self) -> Vec<String> {
        let mut names: Vec<String> = self.runtimes.keys().cloned().collect();
        names.sort();
        names
    }
}
