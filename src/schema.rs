//! Provider schema tables: loading, merging, validation and the process-wide cache.
//!
//! Two JSON tables drive normalization and extraction:
//!
//! * `base_arg_match.json` maps generic argument names to provider field names and
//!   declares where text, usage and metadata live in provider responses;
//! * `escape_table.json` declares the type expression of each provider field.
//!
//! Each table has a system copy (embedded, or read from a system directory) and an
//! optional user override. Overrides replace whole top-level entries. When the merged
//! tables are inconsistent the store falls back to the system tables and logs a warning.

use std::collections::{BTreeMap, HashMap};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, OnceLock};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::BridgeError;

/// File name of the argument-mapping table.
pub const ARGUMENT_TABLE_FILE: &str = "base_arg_match.json";
/// File name of the escape (field type) table.
pub const ESCAPE_TABLE_FILE: &str = "escape_table.json";

/// Generic fields every provider must map when the system table does not say otherwise.
pub const DEFAULT_BASED_ARGS: [&str; 4] = ["messages", "model", "stream", "max_tokens"];
/// Generic fields every request must carry when the tables do not say otherwise.
pub const DEFAULT_ESSENTIAL_ARGS: [&str; 2] = ["model", "messages"];

const SYSTEM_ARGUMENT_TABLE: &str = include_str!("../config/sys_conf/base_arg_match.json");
const SYSTEM_ESCAPE_TABLE: &str = include_str!("../config/sys_conf/escape_table.json");

const BASED_ARGS_KEY: &str = "based_args";
const ESSENTIAL_ARGS_KEY: &str = "essential_args";

/// One or several extraction paths.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PathSpec {
    One(String),
    Many(Vec<String>),
}

impl PathSpec {
    /// Iterates the configured paths in declaration order.
    pub fn paths(&self) -> impl Iterator<Item = &str> {
        let slice: &[String] = match self {
            Self::One(path) => std::slice::from_ref(path),
            Self::Many(paths) => paths,
        };
        slice.iter().map(String::as_str)
    }
}

/// Where auxiliary response metadata lives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetadataPaths {
    /// The resolved value is returned as-is.
    Path(PathSpec),
    /// Each name resolves independently into a mapping.
    Named(BTreeMap<String, String>),
}

/// Output extraction paths for one response shape.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputPaths {
    #[serde(default)]
    pub text: Option<PathSpec>,
    #[serde(default)]
    pub usage: Option<PathSpec>,
    #[serde(default)]
    pub metadata: Option<MetadataPaths>,
    /// Separator placed between text fragments. Newline when absent.
    #[serde(default)]
    pub text_join: Option<String>,
    /// Keys whose values hold text inside mappings. `content`, `text`, `refusal` when absent.
    #[serde(default)]
    pub content_keys: Option<Vec<String>>,
}

/// Selects stream output paths when the value at `path` equals `equals`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamMatch {
    pub path: String,
    pub equals: Value,
}

/// Argument-mapping entry for one provider.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct ProviderMapping {
    #[serde(default)]
    input: BTreeMap<String, String>,
    #[serde(default)]
    essential: Vec<String>,
    #[serde(default)]
    defaults: Map<String, Value>,
    #[serde(default)]
    output: OutputPaths,
    #[serde(default)]
    stream_output: Option<OutputPaths>,
    #[serde(default)]
    stream_match: Option<StreamMatch>,
}

/// Escape-table entry for one provider.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct ProviderTypes {
    #[serde(default, alias = "input")]
    input_types: Map<String, Value>,
}

/// Merged view of one provider across both tables.
#[derive(Debug, Clone, Default)]
pub struct ProviderSchema {
    /// Generic field name to provider field name. An empty target marks a field the
    /// provider does not accept.
    pub input: BTreeMap<String, String>,
    /// Provider field name to raw type expression.
    pub input_types: Map<String, Value>,
    /// Generic fields this provider additionally requires.
    pub essential: Vec<String>,
    /// Generic values injected when the caller omits them.
    pub defaults: Map<String, Value>,
    pub output: OutputPaths,
    pub stream_output: Option<OutputPaths>,
    pub stream_match: Option<StreamMatch>,
}

impl ProviderSchema {
    /// Picks the output paths for `response`, preferring stream paths for stream chunks.
    pub fn output_for(&self, response: &Value) -> &OutputPaths {
        let Some(stream_output) = &self.stream_output else {
            return &self.output;
        };
        let is_chunk = match &self.stream_match {
            Some(rule) => {
                crate::response::get_nested_value(response, &rule.path).as_ref() == Some(&rule.equals)
            }
            None => response.get("object").and_then(Value::as_str) == Some("chat.completion.chunk"),
        };
        if is_chunk { stream_output } else { &self.output }
    }
}

/// Identity of a configuration source. Also the cache key.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct ConfigPaths {
    /// Directory holding system tables. The embedded tables are used when unset or
    /// when a file is missing.
    pub system_dir: Option<PathBuf>,
    /// Directory holding user override tables.
    pub user_dir: Option<PathBuf>,
}

impl ConfigPaths {
    /// Environment variable naming the configuration root.
    pub const ENV_VAR: &'static str = "LLM_BRIDGE_CONFIG_DIR";

    /// `<root>/sys_conf` and `<root>/user_conf`.
    pub fn under_root(root: impl AsRef<Path>) -> Self {
        let root = root.as_ref();
        Self {
            system_dir: Some(root.join("sys_conf")),
            user_dir: Some(root.join("user_conf")),
        }
    }

    /// Reads [`ConfigPaths::ENV_VAR`]; embedded system tables only when unset.
    pub fn from_env() -> Self {
        env::var_os(Self::ENV_VAR)
            .map(Self::under_root)
            .unwrap_or_default()
    }
}

/// Validated, immutable provider schemas.
#[derive(Debug, Clone)]
pub struct SchemaStore {
    based_args: Vec<String>,
    essential_args: Vec<String>,
    providers: BTreeMap<String, ProviderSchema>,
    used_fallback: bool,
}

static GLOBAL_STORE: OnceLock<Arc<SchemaStore>> = OnceLock::new();
static KEYED_STORES: OnceLock<Mutex<HashMap<ConfigPaths, Arc<SchemaStore>>>> = OnceLock::new();

impl SchemaStore {
    /// Returns the process-wide store for [`ConfigPaths::from_env`].
    ///
    /// The first call loads and validates the tables; later calls read the cached
    /// store without locking.
    pub fn global() -> Result<Arc<SchemaStore>, BridgeError> {
        if let Some(store) = GLOBAL_STORE.get() {
            return Ok(store.clone());
        }
        let store = Self::cached(&ConfigPaths::from_env())?;
        Ok(GLOBAL_STORE.get_or_init(|| store).clone())
    }

    /// Returns the store for `paths`, loading it at most once per process.
    pub fn cached(paths: &ConfigPaths) -> Result<Arc<SchemaStore>, BridgeError> {
        let stores = KEYED_STORES.get_or_init(|| Mutex::new(HashMap::new()));
        let mut guard = stores.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(store) = guard.get(paths) {
            return Ok(store.clone());
        }
        let store = Arc::new(Self::load(paths)?);
        guard.insert(paths.clone(), store.clone());
        Ok(store)
    }

    /// Loads, merges and validates the tables named by `paths` without caching.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::Config`] when a system table cannot be read or parsed and
    /// [`BridgeError::ConfigValidation`] when the system tables themselves are
    /// inconsistent. Problems in user overrides never fail the load.
    pub fn load(paths: &ConfigPaths) -> Result<Self, BridgeError> {
        let system_arguments =
            read_system_table(paths.system_dir.as_deref(), ARGUMENT_TABLE_FILE, SYSTEM_ARGUMENT_TABLE)?;
        let system_escape =
            read_system_table(paths.system_dir.as_deref(), ESCAPE_TABLE_FILE, SYSTEM_ESCAPE_TABLE)?;
        let standard_args = standard_args(&system_arguments)?;

        let user_tables = paths.user_dir.as_deref().map(read_user_tables);

        match user_tables {
            None | Some(Ok((None, None))) => {
                Self::from_tables(system_arguments, system_escape, &standard_args)
            }
            Some(Ok((user_arguments, user_escape))) => {
                let merged_arguments = shallow_merge(&system_arguments, user_arguments);
                let merged_escape = shallow_merge(&system_escape, user_escape);
                match Self::from_tables(merged_arguments, merged_escape, &standard_args) {
                    Ok(store) => Ok(store),
                    Err(err) => {
                        tracing::warn!(error = %err, "user schema override rejected, using system tables");
                        Self::fallback(system_arguments, system_escape, &standard_args)
                    }
                }
            }
            Some(Err(err)) => {
                tracing::warn!(error = %err, "user schema override unreadable, using system tables");
                Self::fallback(system_arguments, system_escape, &standard_args)
            }
        }
    }

    fn fallback(
        arguments: Map<String, Value>,
        escape: Map<String, Value>,
        standard_args: &[String],
    ) -> Result<Self, BridgeError> {
        let mut store = Self::from_tables(arguments, escape, standard_args)?;
        store.used_fallback = true;
        Ok(store)
    }

    /// Builds a store from already-merged tables and validates their consistency.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::ConfigValidation`] when the tables do not parse, when
    /// `based_args` differs from `standard_args`, when a provider lacks a mapping for a
    /// based argument, or when a mapping target has no declared type.
    pub fn from_tables(
        arguments: Map<String, Value>,
        escape: Map<String, Value>,
        standard_args: &[String],
    ) -> Result<Self, BridgeError> {
        let mut arguments = arguments;
        let based_args = take_string_list(&mut arguments, BASED_ARGS_KEY)?
            .unwrap_or_else(|| DEFAULT_BASED_ARGS.map(String::from).to_vec());
        let essential_args = take_string_list(&mut arguments, ESSENTIAL_ARGS_KEY)?
            .unwrap_or_else(|| DEFAULT_ESSENTIAL_ARGS.map(String::from).to_vec());

        if based_args != standard_args {
            return Err(invalid(format!(
                "based_args {based_args:?} does not match the system standard {standard_args:?}"
            )));
        }

        let mut mappings: BTreeMap<String, ProviderMapping> = BTreeMap::new();
        for (provider, entry) in arguments {
            let mapping = serde_json::from_value(entry).map_err(|err| {
                invalid(format!("argument entry for provider {provider} is malformed: {err}"))
            })?;
            mappings.insert(provider, mapping);
        }
        let mut types: BTreeMap<String, ProviderTypes> = BTreeMap::new();
        for (provider, entry) in escape {
            let declared = serde_json::from_value(entry).map_err(|err| {
                invalid(format!("escape entry for provider {provider} is malformed: {err}"))
            })?;
            types.insert(provider, declared);
        }

        let names: Vec<String> = mappings.keys().chain(types.keys()).cloned().collect();
        let mut providers = BTreeMap::new();
        for name in names {
            if providers.contains_key(&name) {
                continue;
            }
            let mapping = mappings.remove(&name).unwrap_or_default();
            let declared = types.remove(&name).unwrap_or_default();
            verify_provider(&name, &mapping, &declared, &based_args)?;
            providers.insert(
                name,
                ProviderSchema {
                    input: mapping.input,
                    input_types: declared.input_types,
                    essential: mapping.essential,
                    defaults: mapping.defaults,
                    output: mapping.output,
                    stream_output: mapping.stream_output,
                    stream_match: mapping.stream_match,
                },
            );
        }

        Ok(Self {
            based_args,
            essential_args,
            providers,
            used_fallback: false,
        })
    }

    /// Looks up a provider.
    pub fn provider(&self, name: &str) -> Result<&ProviderSchema, BridgeError> {
        self.providers
            .get(name)
            .ok_or_else(|| BridgeError::unsupported(name))
    }

    /// Names of every known provider, sorted.
    pub fn provider_names(&self) -> Vec<&str> {
        self.providers.keys().map(String::as_str).collect()
    }

    /// Generic fields every provider maps.
    pub fn based_args(&self) -> &[String] {
        &self.based_args
    }

    /// Generic fields every request must carry.
    pub fn essential_args(&self) -> &[String] {
        &self.essential_args
    }

    /// `true` when a user override was rejected and the system tables are in use.
    pub fn used_fallback(&self) -> bool {
        self.used_fallback
    }
}

fn verify_provider(
    name: &str,
    mapping: &ProviderMapping,
    declared: &ProviderTypes,
    based_args: &[String],
) -> Result<(), BridgeError> {
    for arg in based_args {
        if !mapping.input.contains_key(arg) {
            return Err(invalid(format!(
                "provider {name} has no input mapping for based arg '{arg}'"
            )));
        }
    }
    for (generic, target) in &mapping.input {
        if !target.is_empty() && !declared.input_types.contains_key(target) {
            return Err(invalid(format!(
                "provider {name} maps '{generic}' to '{target}', which has no declared type"
            )));
        }
    }
    Ok(())
}

fn invalid(reason: String) -> BridgeError {
    BridgeError::ConfigValidation { reason }
}

fn take_string_list(
    table: &mut Map<String, Value>,
    key: &str,
) -> Result<Option<Vec<String>>, BridgeError> {
    match table.remove(key) {
        None => Ok(None),
        Some(value) => serde_json::from_value(value)
            .map(Some)
            .map_err(|err| invalid(format!("{key} must be a list of strings: {err}"))),
    }
}

fn standard_args(system_arguments: &Map<String, Value>) -> Result<Vec<String>, BridgeError> {
    match system_arguments.get(BASED_ARGS_KEY) {
        None => Ok(DEFAULT_BASED_ARGS.map(String::from).to_vec()),
        Some(value) => serde_json::from_value(value.clone())
            .map_err(|err| invalid(format!("system based_args must be a list of strings: {err}"))),
    }
}

/// `{**system, **user}`: user entries replace whole top-level entries.
fn shallow_merge(system: &Map<String, Value>, user: Option<Map<String, Value>>) -> Map<String, Value> {
    let mut merged = system.clone();
    if let Some(user) = user {
        for (key, value) in user {
            merged.insert(key, value);
        }
    }
    merged
}

fn read_system_table(
    dir: Option<&Path>,
    file_name: &str,
    embedded: &str,
) -> Result<Map<String, Value>, BridgeError> {
    if let Some(table) = dir.map(|dir| dir.join(file_name)).and_then(|path| {
        path.exists().then(|| read_table(&path))
    }) {
        return table;
    }
    parse_table(embedded, &format!("<embedded>/{file_name}"))
}

type UserTables = (Option<Map<String, Value>>, Option<Map<String, Value>>);

fn read_user_tables(dir: &Path) -> Result<UserTables, BridgeError> {
    Ok((
        read_optional_table(&dir.join(ARGUMENT_TABLE_FILE))?,
        read_optional_table(&dir.join(ESCAPE_TABLE_FILE))?,
    ))
}

fn read_optional_table(path: &Path) -> Result<Option<Map<String, Value>>, BridgeError> {
    if !path.exists() {
        return Ok(None);
    }
    read_table(path).map(Some)
}

fn read_table(path: &Path) -> Result<Map<String, Value>, BridgeError> {
    let text = fs::read_to_string(path).map_err(|err| BridgeError::Config {
        path: path.display().to_string(),
        message: err.to_string(),
    })?;
    parse_table(&text, &path.display().to_string())
}

fn parse_table(text: &str, origin: &str) -> Result<Map<String, Value>, BridgeError> {
    match serde_json::from_str::<Value>(text) {
        Ok(Value::Object(table)) => Ok(table),
        Ok(other) => Err(BridgeError::Config {
            path: origin.to_string(),
            message: format!("expected a JSON object, found {}", crate::validate::value_type_name(&other)),
        }),
        Err(err) => Err(BridgeError::Config {
            path: origin.to_string(),
            message: err.to_string(),
        }),
    }
}
