//! Language configuration for compilation and execution

use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, ExecError};
use crate::limits::{ResourceLimits, MIB};

/// Languages the worker knows how to build and run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    C,
    Cpp,
    Java,
    Python,
    JavaScript,
    Php,
    Ruby,
    Perl,
    Bash,
    Lua,
}

impl Language {
    pub const ALL: [Language; 10] = [
        Language::C,
        Language::Cpp,
        Language::Java,
        Language::Python,
        Language::JavaScript,
        Language::Php,
        Language::Ruby,
        Language::Perl,
        Language::Bash,
        Language::Lua,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Language::C => "c",
            Language::Cpp => "cpp",
            Language::Java => "java",
            Language::Python => "python",
            Language::JavaScript => "javascript",
            Language::Php => "php",
            Language::Ruby => "ruby",
            Language::Perl => "perl",
            Language::Bash => "bash",
            Language::Lua => "lua",
        }
    }

    /// Detect language from a file extension
    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.to_lowercase().as_str() {
            "c" => Some(Language::C),
            "cpp" | "cc" | "cxx" => Some(Language::Cpp),
            "java" => Some(Language::Java),
            "py" => Some(Language::Python),
            "js" | "mjs" => Some(Language::JavaScript),
            "php" => Some(Language::Php),
            "rb" => Some(Language::Ruby),
            "pl" => Some(Language::Perl),
            "sh" | "bash" => Some(Language::Bash),
            "lua" => Some(Language::Lua),
            _ => None,
        }
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Language {
    type Err = ExecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.to_lowercase();
        Language::ALL
            .into_iter()
            .find(|lang| lang.name() == lower)
            .ok_or_else(|| ExecError::UnsupportedLanguage(s.to_string()))
    }
}

/// Configuration for a supported programming language
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LanguageConfig {
    pub language: Language,
    /// Name of the source file (e.g., "main.cpp")
    pub source_file: String,
    /// Compile command (None for interpreted languages)
    pub compile_command: Option<Vec<String>>,
    pub run_command: Vec<String>,
    /// Time limit multiplier and bonus: (multiplier, bonus_seconds)
    /// actual_time = base_time * multiplier + bonus
    pub time_limit: Option<(u32, u32)>,
    /// Memory limit multiplier and bonus: (multiplier, bonus_mb)
    /// actual_memory = base_memory * multiplier + bonus
    pub memory_limit: Option<(u32, u32)>,
    /// Apply RLIMIT_AS in addition to the memory watchdog
    pub limit_address_space: bool,
}

impl LanguageConfig {
    /// Adjusted time limit in seconds
    pub fn calculate_time_limit(&self, base_seconds: u64) -> u64 {
        match self.time_limit {
            Some((multiplier, bonus_seconds)) => base_seconds
                .saturating_mul(multiplier as u64)
                .saturating_add(bonus_seconds as u64),
            None => base_seconds,
        }
    }

    /// Adjusted memory limit in bytes
    pub fn calculate_memory_limit(&self, base_bytes: u64) -> u64 {
        match self.memory_limit {
            Some((multiplier, bonus_mb)) => base_bytes
                .saturating_mul(multiplier as u64)
                .saturating_add((bonus_mb as u64).saturating_mul(MIB)),
            None => base_bytes,
        }
    }

    /// Apply this language's factors to resolved run limits
    pub fn scale_limits(&self, base: &ResourceLimits) -> ResourceLimits {
        ResourceLimits {
            cpu_seconds: self.calculate_time_limit(base.cpu_seconds),
            wall_seconds: self.calculate_time_limit(base.wall_seconds),
            memory_bytes: self.calculate_memory_limit(base.memory_bytes),
            ..*base
        }
    }

    pub fn needs_compile(&self) -> bool {
        self.compile_command.is_some()
    }
}

/// Raw TOML configuration for a language
#[derive(Debug, Deserialize)]
struct RawLanguageConfig {
    source_file: String,
    compile_command: Option<String>,
    run_command: String,
    #[serde(default)]
    time_limit: Vec<String>,
    #[serde(default)]
    memory_limit: Vec<String>,
    #[serde(default = "default_limit_address_space")]
    limit_address_space: bool,
    #[serde(default)]
    aliases: Vec<String>,
}

fn default_limit_address_space() -> bool {
    true
}

/// Loaded toolchain table, keyed by language with alias lookup
#[derive(Debug, Clone)]
pub struct LanguageTable {
    configs: HashMap<Language, LanguageConfig>,
    aliases: HashMap<String, Language>,
}

impl LanguageTable {
    /// The table compiled into the binary
    pub fn embedded() -> Result<Self, ConfigError> {
        Self::from_toml_str(include_str!(concat!(
            env!("CARGO_MANIFEST_DIR"),
            "/files/languages.toml"
        )))
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let raw_configs: HashMap<String, RawLanguageConfig> = toml::from_str(content)?;

        let mut configs = HashMap::new();
        let mut aliases = HashMap::new();

        for (name, raw) in raw_configs {
            let language: Language = name
                .parse()
                .map_err(|_| ConfigError::invalid("language", &name, "unknown language"))?;

            let run_command = into_command(&raw.run_command);
            if run_command.is_empty() {
                return Err(ConfigError::invalid(
                    "run_command",
                    raw.run_command,
                    format!("empty run command for {}", name),
                ));
            }
            if !is_plain_file_name(&raw.source_file) {
                return Err(ConfigError::invalid(
                    "source_file",
                    raw.source_file,
                    format!("must be a plain file name for {}", name),
                ));
            }

            let config = LanguageConfig {
                language,
                source_file: raw.source_file,
                compile_command: raw
                    .compile_command
                    .map(|cmd| into_command(&cmd))
                    .filter(|cmd| !cmd.is_empty()),
                run_command,
                time_limit: parse_limit(&name, raw.time_limit, "time_limit")?,
                memory_limit: parse_limit(&name, raw.memory_limit, "memory_limit")?,
                limit_address_space: raw.limit_address_space,
            };

            for alias in raw.aliases {
                aliases.insert(alias.to_lowercase(), language);
            }
            configs.insert(language, config);
        }

        Ok(Self { configs, aliases })
    }

    /// Resolve a language name or alias to a configured language
    pub fn resolve(&self, name: &str) -> Option<Language> {
        let lower = name.to_lowercase();
        let language = match lower.parse::<Language>() {
            Ok(language) => language,
            Err(_) => *self.aliases.get(&lower)?,
        };
        self.configs.contains_key(&language).then_some(language)
    }

    pub fn get(&self, language: Language) -> Option<&LanguageConfig> {
        self.configs.get(&language)
    }

    /// Configured languages in a stable order
    pub fn supported(&self) -> Vec<Language> {
        Language::ALL
            .into_iter()
            .filter(|lang| self.configs.contains_key(lang))
            .collect()
    }
}

fn parse_limit(
    name: &str,
    raw_limit: Vec<String>,
    kind: &str,
) -> Result<Option<(u32, u32)>, ConfigError> {
    if raw_limit.is_empty() {
        return Ok(None);
    }
    if raw_limit.len() != 2 {
        return Err(ConfigError::invalid(
            kind,
            format!("{:?}", raw_limit),
            format!("expected [multiplier, bonus] for {}", name),
        ));
    }
    let parse = |value: &str| {
        value.parse::<u32>().map_err(|e| {
            ConfigError::invalid(kind, value, format!("{} for {}", e, name))
        })
    };
    let multiplier = parse(&raw_limit[0])?;
    if multiplier == 0 {
        return Err(ConfigError::invalid(kind, &raw_limit[0], "multiplier must be positive"));
    }
    Ok(Some((multiplier, parse(&raw_limit[1])?)))
}

fn into_command(command: &str) -> Vec<String> {
    command.split_whitespace().map(|s| s.to_string()).collect()
}

pub(crate) fn is_plain_file_name(name: &str) -> bool {
    !name.is_empty()
        && name != "."
        && name != ".."
        && !name.contains('/')
        && !name.contains('\0')
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn create_test_config() -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[c]
source_file = "main.c"
compile_command = "gcc -o main main.c"
run_command = "./main"

[python]
source_file = "main.py"
run_command = "python3 main.py"
time_limit = ["3", "2"]
memory_limit = ["2", "32"]
aliases = ["py", "python3"]
"#
        )
        .unwrap();
        file
    }

    #[test]
    fn test_load_languages() {
        let config_file = create_test_config();
        let table = LanguageTable::load(config_file.path()).unwrap();

        assert_eq!(table.supported(), vec![Language::C, Language::Python]);
        assert_eq!(table.resolve("PY"), Some(Language::Python));
        assert_eq!(table.resolve("c"), Some(Language::C));
        // known language, but not in this table
        assert_eq!(table.resolve("java"), None);
        assert_eq!(table.resolve("cobol"), None);

        let c = table.get(Language::C).unwrap();
        assert_eq!(
            c.compile_command,
            Some(into_command("gcc -o main main.c"))
        );
        assert!(c.limit_address_space);
    }

    #[test]
    fn test_scale_limits() {
        let table = LanguageTable::load(create_test_config().path()).unwrap();
        let python = table.get(Language::Python).unwrap();
        let base = ResourceLimits::default();

        let scaled = python.scale_limits(&base);
        assert_eq!(scaled.cpu_seconds, base.cpu_seconds * 3 + 2);
        assert_eq!(scaled.wall_seconds, base.wall_seconds * 3 + 2);
        assert_eq!(scaled.memory_bytes, base.memory_bytes * 2 + 32 * MIB);
        assert_eq!(scaled.output_bytes, base.output_bytes);

        let c = table.get(Language::C).unwrap();
        assert_eq!(c.scale_limits(&base), base);
    }

    #[test]
    fn test_scaling_saturates_instead_of_overflowing() {
        let table = LanguageTable::load(create_test_config().path()).unwrap();
        let python = table.get(Language::Python).unwrap();

        assert_eq!(python.calculate_time_limit(u64::MAX / 2), u64::MAX);
        assert_eq!(python.calculate_memory_limit(u64::MAX), u64::MAX);
    }

    #[test]
    fn test_embedded_table_covers_all_languages() {
        let table = LanguageTable::embedded().unwrap();
        assert_eq!(table.supported(), Language::ALL.to_vec());
        assert_eq!(table.resolve("c++"), Some(Language::Cpp));
        assert_eq!(table.resolve("js"), Some(Language::JavaScript));
        assert!(!table.get(Language::Java).unwrap().limit_address_space);
        assert_eq!(table.get(Language::Java).unwrap().source_file, "Main.java");
        assert!(table.get(Language::Cpp).unwrap().needs_compile());
        assert!(!table.get(Language::Python).unwrap().needs_compile());
    }

    #[test]
    fn test_unknown_language_rejected() {
        let err = LanguageTable::from_toml_str(
            r#"
[cobol]
source_file = "main.cob"
run_command = "cobc main.cob"
"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("cobol"));
    }

    #[test]
    fn test_source_file_must_be_plain() {
        let err = LanguageTable::from_toml_str(
            r#"
[c]
source_file = "../main.c"
run_command = "./main"
"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("source_file"));
    }

    #[test]
    fn test_from_extension() {
        assert_eq!(Language::from_extension("CPP"), Some(Language::Cpp));
        assert_eq!(Language::from_extension("py"), Some(Language::Python));
        assert_eq!(Language::from_extension("txt"), None);
    }

    #[test]
    fn test_language_serde_names() {
        let json = serde_json::to_string(&Language::JavaScript).unwrap();
        assert_eq!(json, r#""javascript""#);
        let lang: Language = serde_json::from_str(r#""cpp""#).unwrap();
        assert_eq!(lang, Language::Cpp);
    }
}
