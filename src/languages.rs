//! Toolchain registry: language configuration for compilation and execution
//!
//! The registry is built once at startup from TOML and never mutated
//! afterwards, so it can be shared across pipelines without locking.

use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::path::Path;

use anyhow::Context;
use serde::Deserialize;

use crate::error::RunnerError;

const BUNDLED_LANGUAGES: &str =
    include_str!(concat!(env!("CARGO_MANIFEST_DIR"), "/files/languages.toml"));

/// One command of a toolchain
#[derive(Debug, Clone)]
pub struct Step {
    /// Command template; `{source}`, `{workspace}` and `{memory_mb}` are substituted
    pub command: Vec<String>,
    /// Per-step CPU time limit in milliseconds
    pub time_limit_ms: Option<u32>,
    /// Per-step memory limit in MB
    pub memory_limit_mb: Option<u32>,
}

/// Values substituted into a step's command template
#[derive(Debug, Clone, Copy)]
pub struct TemplateContext<'a> {
    pub source_file: &'a str,
    pub workspace: &'a Path,
    pub memory_mb: u32,
}

impl Step {
    /// Render the command template for a concrete workspace
    ///
    /// A program given as `./name` is resolved inside the workspace so it does
    /// not depend on how the OS interprets relative paths after `chdir`.
    pub fn render(&self, ctx: &TemplateContext<'_>) -> Vec<String> {
        let workspace = ctx.workspace.to_string_lossy();
        let memory = ctx.memory_mb.to_string();

        self.command
            .iter()
            .enumerate()
            .map(|(idx, part)| {
                let rendered = part
                    .replace("{source}", ctx.source_file)
                    .replace("{workspace}", &workspace)
                    .replace("{memory_mb}", &memory);
                match rendered.strip_prefix("./") {
                    Some(rest) if idx == 0 => ctx.workspace.join(rest).to_string_lossy().into_owned(),
                    _ => rendered,
                }
            })
            .collect()
    }
}

/// Configuration for a supported programming language
#[derive(Debug, Clone)]
pub struct ToolchainSpec {
    /// Canonical language identifier
    pub language: String,
    /// Name of the source file (e.g., "main.cpp")
    pub source_file: String,
    compile_steps: Vec<Step>,
    run_step: Step,
    /// Extra environment for every step (KEY=VALUE)
    pub env: Vec<String>,
    /// Time limit multiplier and bonus: (multiplier, bonus_seconds)
    /// actual_time = base_time * multiplier + bonus
    pub time_limit: Option<(u32, u32)>,
    /// Memory limit multiplier and bonus: (multiplier, bonus_mb)
    /// actual_memory = base_memory * multiplier + bonus
    pub memory_limit: Option<(u32, u32)>,
}

impl ToolchainSpec {
    pub fn new(
        language: impl Into<String>,
        source_file: impl Into<String>,
        compile_steps: Vec<Step>,
        run_step: Step,
    ) -> Self {
        Self {
            language: language.into(),
            source_file: source_file.into(),
            compile_steps,
            run_step,
            env: Vec::new(),
            time_limit: None,
            memory_limit: None,
        }
    }

    pub fn compile_steps(&self) -> &[Step] {
        &self.compile_steps
    }

    pub fn run_step(&self) -> &Step {
        &self.run_step
    }

    /// Interpreted languages have no compile step
    pub fn is_compiled(&self) -> bool {
        !self.compile_steps.is_empty()
    }

    /// Adjusted run time limit in milliseconds for a base limit
    pub fn calculate_time_limit(&self, base_time_ms: u32) -> u32 {
        match self.time_limit {
            Some((multiplier, bonus_seconds)) => base_time_ms
                .saturating_mul(multiplier)
                .saturating_add(bonus_seconds.saturating_mul(1000)),
            None => base_time_ms,
        }
    }

    /// Adjusted run memory limit in MB for a base limit
    pub fn calculate_memory_limit(&self, base_memory_mb: u32) -> u32 {
        match self.memory_limit {
            Some((multiplier, bonus_mb)) => base_memory_mb
                .saturating_mul(multiplier)
                .saturating_add(bonus_mb),
            None => base_memory_mb,
        }
    }
}

/// Raw TOML configuration for a language
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawLanguageConfig {
    source_file: String,
    compile_command: Option<String>,
    #[serde(default)]
    compile_commands: Vec<String>,
    run_command: String,
    compile_time_limit_ms: Option<u32>,
    compile_memory_limit_mb: Option<u32>,
    run_time_limit_ms: Option<u32>,
    run_memory_limit_mb: Option<u32>,
    #[serde(default)]
    time_limit: Vec<u32>,
    #[serde(default)]
    memory_limit: Vec<u32>,
    #[serde(default)]
    env: Vec<String>,
    #[serde(default)]
    aliases: Vec<String>,
}

/// Read-only language → toolchain mapping
#[derive(Debug, Default)]
pub struct ToolchainRegistry {
    toolchains: HashMap<String, ToolchainSpec>,
    /// Alias (and canonical name) → canonical name
    names: HashMap<String, String>,
}

impl ToolchainRegistry {
    /// Load from a TOML file, or from the bundled configuration when no path is given
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        match path {
            Some(path) => {
                let content = fs::read_to_string(path)
                    .with_context(|| format!("Failed to read languages config {:?}", path))?;
                Self::from_toml_str(&content)
                    .with_context(|| format!("Invalid languages config {:?}", path))
            }
            None => Self::from_toml_str(BUNDLED_LANGUAGES).context("Invalid bundled languages.toml"),
        }
    }

    pub fn from_toml_str(content: &str) -> anyhow::Result<Self> {
        let raw_configs: HashMap<String, RawLanguageConfig> = toml::from_str(content)?;
        let mut registry = Self::default();

        for (name, mut raw) in raw_configs {
            let aliases = std::mem::take(&mut raw.aliases);
            let spec = build_spec(&name, raw)?;
            registry.insert(spec, &aliases)?;
        }

        if registry.is_empty() {
            anyhow::bail!("No languages configured");
        }

        Ok(registry)
    }

    /// Register a toolchain under its language id and the given aliases
    pub fn insert(&mut self, spec: ToolchainSpec, aliases: &[String]) -> anyhow::Result<()> {
        let canonical = spec.language.to_lowercase();

        for name in std::iter::once(&canonical).chain(aliases.iter()) {
            let key = name.to_lowercase();
            if let Some(existing) = self.names.get(&key) {
                anyhow::bail!(
                    "Language name {:?} is registered twice ({} and {})",
                    key,
                    existing,
                    canonical
                );
            }
            self.names.insert(key, canonical.clone());
        }

        self.toolchains.insert(canonical, spec);
        Ok(())
    }

    /// Look up a toolchain by language identifier or alias
    pub fn resolve(&self, language: &str) -> Result<&ToolchainSpec, RunnerError> {
        self.names
            .get(&language.trim().to_lowercase())
            .and_then(|canonical| self.toolchains.get(canonical))
            .ok_or_else(|| RunnerError::UnknownLanguage(language.to_string()))
    }

    /// Canonical identifiers of all supported languages, sorted
    pub fn languages(&self) -> Vec<String> {
        self.toolchains
            .keys()
            .cloned()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.toolchains.len()
    }

    pub fn is_empty(&self) -> bool {
        self.toolchains.is_empty()
    }
}

fn build_spec(name: &str, raw: RawLanguageConfig) -> anyhow::Result<ToolchainSpec> {
    let language = name.to_lowercase();

    if raw.source_file.is_empty()
        || raw.source_file.contains('/')
        || raw.source_file.starts_with('.')
    {
        anyhow::bail!("Invalid source_file for {}: {:?}", language, raw.source_file);
    }

    let parse_limit = |raw_limit: &[u32], kind: &str| -> anyhow::Result<Option<(u32, u32)>> {
        match raw_limit {
            [] => Ok(None),
            [multiplier, offset] => Ok(Some((*multiplier, *offset))),
            _ => anyhow::bail!("Invalid {} limit for {}: {:?}", kind, language, raw_limit),
        }
    };

    let compile_templates: Vec<String> = match (raw.compile_command, raw.compile_commands) {
        (Some(_), commands) if !commands.is_empty() => anyhow::bail!(
            "{} sets both compile_command and compile_commands",
            language
        ),
        (Some(command), _) => vec![command],
        (None, commands) => commands,
    };

    let compile_steps = compile_templates
        .iter()
        .map(|template| {
            Ok(Step {
                command: into_command(template)
                    .with_context(|| format!("Empty compile command for {}", language))?,
                time_limit_ms: raw.compile_time_limit_ms,
                memory_limit_mb: raw.compile_memory_limit_mb,
            })
        })
        .collect::<anyhow::Result<Vec<_>>>()?;

    let run_step = Step {
        command: into_command(&raw.run_command)
            .with_context(|| format!("Empty run command for {}", language))?,
        time_limit_ms: raw.run_time_limit_ms,
        memory_limit_mb: raw.run_memory_limit_mb,
    };

    if let Some(entry) = raw.env.iter().find(|entry| !entry.contains('=')) {
        anyhow::bail!("Invalid env entry for {}: {:?}", language, entry);
    }

    let mut spec = ToolchainSpec::new(&language, raw.source_file, compile_steps, run_step);
    spec.env = raw.env;
    spec.time_limit = parse_limit(&raw.time_limit, "time")?;
    spec.memory_limit = parse_limit(&raw.memory_limit, "memory")?;
    Ok(spec)
}

fn into_command(command: &str) -> Option<Vec<String>> {
    let parts: Vec<String> = command.split_whitespace().map(|s| s.to_string()).collect();
    if parts.is_empty() {
        None
    } else {
        Some(parts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEST_CONFIG: &str = r#"
[c]
source_file = "main.c"
compile_command = "gcc -o main {source}"
run_command = "./main"
time_limit = [1, 0]

[python]
source_file = "main.py"
run_command = "python3 {source}"
aliases = ["py", "Python3"]

[kotlin]
source_file = "Main.kt"
compile_commands = ["kotlinc {source} -d out", "jar cf main.jar -C out ."]
compile_time_limit_ms = 60000
run_command = "java -Xmx{memory_mb}m -cp main.jar MainKt"
run_memory_limit_mb = 512
memory_limit = [2, 64]
env = ["JAVA_TOOL_OPTIONS=-Xss64m"]
"#;

    #[test]
    fn test_load_languages() {
        let registry = ToolchainRegistry::from_toml_str(TEST_CONFIG).unwrap();

        assert_eq!(registry.languages(), vec!["c", "kotlin", "python"]);
        assert!(registry.resolve("c").unwrap().is_compiled());
        assert!(!registry.resolve("python").unwrap().is_compiled());
    }

    #[test]
    fn test_resolve_aliases_case_insensitive() {
        let registry = ToolchainRegistry::from_toml_str(TEST_CONFIG).unwrap();

        assert_eq!(registry.resolve("PY").unwrap().language, "python");
        assert_eq!(registry.resolve("python3").unwrap().language, "python");
        assert_eq!(registry.resolve(" C ").unwrap().language, "c");
    }

    #[test]
    fn test_resolve_unknown_language() {
        let registry = ToolchainRegistry::from_toml_str(TEST_CONFIG).unwrap();

        match registry.resolve("brainfuck") {
            Err(RunnerError::UnknownLanguage(name)) => assert_eq!(name, "brainfuck"),
            other => panic!("expected UnknownLanguage, got {:?}", other.map(|s| &s.language)),
        }
    }

    #[test]
    fn test_multiple_compile_steps_in_order() {
        let registry = ToolchainRegistry::from_toml_str(TEST_CONFIG).unwrap();
        let kotlin = registry.resolve("kotlin").unwrap();

        assert_eq!(kotlin.compile_steps().len(), 2);
        assert_eq!(kotlin.compile_steps()[0].command[0], "kotlinc");
        assert_eq!(kotlin.compile_steps()[1].command[0], "jar");
        assert_eq!(kotlin.compile_steps()[1].time_limit_ms, Some(60_000));
        assert_eq!(kotlin.env, vec!["JAVA_TOOL_OPTIONS=-Xss64m"]);
    }

    #[test]
    fn test_run_step_limits() {
        let registry = ToolchainRegistry::from_toml_str(TEST_CONFIG).unwrap();

        let kotlin = registry.resolve("kotlin").unwrap();
        assert_eq!(kotlin.run_step().memory_limit_mb, Some(512));
        assert_eq!(kotlin.run_step().time_limit_ms, None);
        // Compile limits do not leak into the run step
        assert_eq!(kotlin.compile_steps()[0].time_limit_ms, Some(60_000));

        let python = registry.resolve("python").unwrap();
        assert_eq!(python.run_step().memory_limit_mb, None);
    }

    #[test]
    fn test_calculate_limits() {
        let registry = ToolchainRegistry::from_toml_str(TEST_CONFIG).unwrap();

        let kotlin = registry.resolve("kotlin").unwrap();
        assert_eq!(kotlin.calculate_memory_limit(256), 576);
        assert_eq!(kotlin.calculate_time_limit(1000), 1000);

        let mut c = registry.resolve("c").unwrap().clone();
        c.time_limit = Some((3, 2));
        assert_eq!(c.calculate_time_limit(1000), 5000);
        assert_eq!(c.calculate_time_limit(u32::MAX), u32::MAX);
    }

    #[test]
    fn test_render_template() {
        let registry = ToolchainRegistry::from_toml_str(TEST_CONFIG).unwrap();
        let ctx = TemplateContext {
            source_file: "main.c",
            workspace: Path::new("/tmp/run-1"),
            memory_mb: 128,
        };

        let c = registry.resolve("c").unwrap();
        assert_eq!(
            c.compile_steps()[0].render(&ctx),
            vec!["gcc", "-o", "main", "main.c"]
        );
        assert_eq!(c.run_step().render(&ctx), vec!["/tmp/run-1/main"]);

        let kotlin = registry.resolve("kotlin").unwrap();
        assert_eq!(kotlin.run_step().render(&ctx)[1], "-Xmx128m");
    }

    #[test]
    fn test_invalid_configs_rejected() {
        let bad_limit = r#"
[c]
source_file = "main.c"
run_command = "./main"
time_limit = [1, 2, 3]
"#;
        assert!(ToolchainRegistry::from_toml_str(bad_limit).is_err());

        let traversal = r#"
[c]
source_file = "../main.c"
run_command = "./main"
"#;
        assert!(ToolchainRegistry::from_toml_str(traversal).is_err());

        let empty_run = r#"
[c]
source_file = "main.c"
run_command = "   "
"#;
        assert!(ToolchainRegistry::from_toml_str(empty_run).is_err());

        let duplicate_alias = r#"
[python]
source_file = "main.py"
run_command = "python3 main.py"
aliases = ["py"]

[pypy]
source_file = "main.py"
run_command = "pypy3 main.py"
aliases = ["py"]
"#;
        assert!(ToolchainRegistry::from_toml_str(duplicate_alias).is_err());
    }

    #[test]
    fn test_bundled_languages() {
        let registry = ToolchainRegistry::load(None).unwrap();

        for language in ["c", "cpp", "c++", "java", "python", "py", "javascript", "js"] {
            assert!(registry.resolve(language).is_ok(), "missing {}", language);
        }
        assert_eq!(registry.resolve("java").unwrap().source_file, "Main.java");
    }
}
