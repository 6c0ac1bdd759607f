//! Addon metadata descriptors.
//!
//! Parses the `addon.toml` descriptor found at the root of every bundle
//! into an immutable [`AddonMetadata`].

use std::collections::BTreeMap;

use serde::Serialize;

use super::error::MetadataError;
use crate::version::Version;

/// Descriptor file name inside a bundle.
pub const DESCRIPTOR_NAME: &str = "addon.toml";

/// Maximum number of dependency tokens per list.
const MAX_DEPENDENCIES: usize = 256;

/// Maximum length of an addon id.
const MAX_ID_LEN: usize = 128;

/// Flat key-value view of a descriptor.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Descriptor {
    values: BTreeMap<String, String>,
}

impl Descriptor {
    /// Parses descriptor text.
    ///
    /// Strings, integers, booleans and arrays of strings are accepted;
    /// arrays are joined with `,`. Nested tables are rejected.
    pub fn parse(text: &str) -> Result<Self, MetadataError> {
        let table: toml::Table =
            toml::from_str(text).map_err(|e| MetadataError::Malformed(e.to_string()))?;

        let mut values = BTreeMap::new();
        for (key, value) in table {
            let flat = match value {
                toml::Value::String(s) => s,
                toml::Value::Integer(i) => i.to_string(),
                toml::Value::Boolean(b) => b.to_string(),
                toml::Value::Array(items) => {
                    let mut parts = Vec::with_capacity(items.len());
                    for item in items {
                        match item {
                            toml::Value::String(s) => parts.push(s),
                            other => {
                                return Err(MetadataError::Malformed(format!(
                                    "key '{}' contains a non-string item: {}",
                                    key, other
                                )));
                            }
                        }
                    }
                    parts.join(",")
                }
                other => {
                    return Err(MetadataError::Malformed(format!(
                        "key '{}' has unsupported value type {}",
                        key,
                        other.type_str()
                    )));
                }
            };
            values.insert(key, flat);
        }

        Ok(Self { values })
    }

    /// Builds a descriptor from key-value pairs.
    #[must_use]
    pub fn from_pairs<'a>(pairs: impl IntoIterator<Item = (&'a str, &'a str)>) -> Self {
        Self {
            values: pairs
                .into_iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        }
    }

    /// Returns a trimmed, non-empty value.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.values
            .get(key)
            .map(|v| v.trim())
            .filter(|v| !v.is_empty())
    }

    fn require(&self, key: &'static str) -> Result<&str, MetadataError> {
        self.get(key).ok_or(MetadataError::MissingKey(key))
    }
}

/// A single `id` or `id>=version` dependency token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DependencySpec {
    /// Dependency addon id.
    pub id: String,
    /// Minimum acceptable version, if any.
    pub min_version: Option<Version>,
}

impl DependencySpec {
    /// Parses one token.
    pub fn parse(token: &str) -> Result<Self, MetadataError> {
        let (id, min_version) = match token.split_once(">=") {
            Some((id, version)) => (id.trim(), Some(Version::parse(version)?)),
            None => (token.trim(), None),
        };
        validate_id(id).map_err(|reason| MetadataError::InvalidValue {
            key: "dependencies",
            reason: format!("'{}': {}", token, reason),
        })?;
        Ok(Self {
            id: id.to_string(),
            min_version,
        })
    }

    /// Returns true if `version` meets the minimum.
    #[must_use]
    pub fn accepts(&self, version: &Version) -> bool {
        self.min_version
            .as_ref()
            .is_none_or(|min| version.satisfies_min(min))
    }
}

/// Parses a comma/semicolon/whitespace separated dependency list.
pub fn parse_dependency_list(text: &str) -> Result<Vec<DependencySpec>, MetadataError> {
    let tokens: Vec<&str> = text
        .split(|c: char| c == ',' || c == ';' || c.is_whitespace())
        .filter(|t| !t.is_empty())
        .collect();

    if tokens.len() > MAX_DEPENDENCIES {
        return Err(MetadataError::InvalidValue {
            key: "dependencies",
            reason: format!("more than {} entries", MAX_DEPENDENCIES),
        });
    }

    // `id >= 1.0` with spaces splits into three tokens; glue them back.
    let mut specs = Vec::with_capacity(tokens.len());
    let mut i = 0;
    while i < tokens.len() {
        let token = tokens[i];
        if token.ends_with(">=") && i + 1 < tokens.len() {
            specs.push(DependencySpec::parse(&format!("{}{}", token, tokens[i + 1]))?);
            i += 2;
        } else if i + 2 < tokens.len() && tokens[i + 1] == ">=" {
            specs.push(DependencySpec::parse(&format!("{}>={}", token, tokens[i + 2]))?);
            i += 3;
        } else if i + 1 < tokens.len() && tokens[i + 1].starts_with(">=") {
            specs.push(DependencySpec::parse(&format!("{}{}", token, tokens[i + 1]))?);
            i += 2;
        } else {
            specs.push(DependencySpec::parse(token)?);
            i += 1;
        }
    }
    Ok(specs)
}

/// Checks that an id only uses `[A-Za-z0-9_.-]` with at most one `:`.
fn validate_id(id: &str) -> Result<(), &'static str> {
    if id.is_empty() {
        return Err("empty id");
    }
    if id.len() > MAX_ID_LEN {
        return Err("id too long");
    }
    if id.matches(':').count() > 1 {
        return Err("at most one ':' namespace separator is allowed");
    }
    if id.starts_with(':') || id.ends_with(':') {
        return Err("empty namespace or sub-id");
    }
    if !id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.' | ':'))
    {
        return Err("id contains unsupported characters");
    }
    Ok(())
}

/// Immutable addon metadata, built once at discovery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AddonMetadata {
    /// Unique addon id, optionally `namespace:sub` qualified.
    pub id: String,
    /// Declared version.
    pub version: Version,
    /// Declared contract level.
    pub contract_level: u32,
    /// Fully qualified entry symbol.
    pub entry: String,
    /// Required dependencies with optional minimum versions.
    pub required: BTreeMap<String, Option<Version>>,
    /// Optional dependencies with optional minimum versions.
    pub optional: BTreeMap<String, Option<Version>>,
    /// Sub-namespace the addon publishes to others.
    pub api_namespace: String,
    /// Display name.
    pub name: Option<String>,
    /// Description.
    pub description: Option<String>,
}

impl AddonMetadata {
    /// Builds metadata from a parsed descriptor.
    pub fn from_descriptor(descriptor: &Descriptor) -> Result<Self, MetadataError> {
        let id = descriptor.require("id")?;
        validate_id(id).map_err(|reason| MetadataError::InvalidValue {
            key: "id",
            reason: reason.to_string(),
        })?;

        let version = Version::parse(descriptor.require("version")?)?;

        let contract_level = descriptor
            .require("contract-level")?
            .parse::<u32>()
            .map_err(|e| MetadataError::InvalidValue {
                key: "contract-level",
                reason: e.to_string(),
            })?;

        let entry = descriptor.require("entry")?;
        validate_symbol(entry).map_err(|reason| MetadataError::InvalidValue {
            key: "entry",
            reason: reason.to_string(),
        })?;

        // The legacy unversioned list only applies when no versioned list exists.
        let required_text = descriptor
            .get("dependencies")
            .or_else(|| descriptor.get("depends"))
            .unwrap_or("");
        let optional_text = descriptor.get("optional-dependencies").unwrap_or("");

        let mut required = BTreeMap::new();
        for spec in parse_dependency_list(required_text)? {
            merge_min(&mut required, spec);
        }
        let mut optional = BTreeMap::new();
        for spec in parse_dependency_list(optional_text)? {
            if !required.contains_key(&spec.id) {
                merge_min(&mut optional, spec);
            }
        }

        let root = root_prefix_of(entry);
        let api_namespace = match descriptor.get("api-namespace") {
            Some(ns) => {
                let ns = if ns.ends_with('.') {
                    ns.to_string()
                } else {
                    format!("{}.", ns)
                };
                if !ns.starts_with(root) {
                    return Err(MetadataError::InvalidValue {
                        key: "api-namespace",
                        reason: format!("must live under the entry root '{}'", root),
                    });
                }
                ns
            }
            None => format!("{}api.", root),
        };

        Ok(Self {
            id: id.to_string(),
            version,
            contract_level,
            entry: entry.to_string(),
            required,
            optional,
            api_namespace,
            name: descriptor.get("name").map(str::to_string),
            description: descriptor.get("description").map(str::to_string),
        })
    }

    /// Namespace part of the id (`namespace` in `namespace:sub`).
    #[must_use]
    pub fn namespace(&self) -> &str {
        self.id.split(':').next().unwrap_or(&self.id)
    }

    /// Root symbol prefix, e.g. `com.acme.storage.` for
    /// `com.acme.storage.StorageAddon`.
    #[must_use]
    pub fn root_prefix(&self) -> &str {
        root_prefix_of(&self.entry)
    }

    /// Rejects an entry root that contains or lies inside the shared-contract
    /// prefix. Such a root would claim host symbols as the addon's own.
    pub fn check_outside_contract(&self, contract_prefix: &str) -> Result<(), MetadataError> {
        let root = self.root_prefix();
        if contract_prefix.starts_with(root) || root.starts_with(contract_prefix) {
            return Err(MetadataError::InvalidValue {
                key: "entry",
                reason: format!("root '{}' overlaps the shared contract '{}'", root, contract_prefix),
            });
        }
        Ok(())
    }

    /// Returns true if `other` is a declared required or optional dependency.
    #[must_use]
    pub fn declares_dependency(&self, other: &str) -> bool {
        self.required.contains_key(other) || self.optional.contains_key(other)
    }
}

/// Keeps the highest minimum when an id is listed more than once.
fn merge_min(map: &mut BTreeMap<String, Option<Version>>, spec: DependencySpec) {
    let slot = map.entry(spec.id).or_insert(None);
    if let Some(min) = spec.min_version {
        let raise = slot
            .as_ref()
            .is_none_or(|current| min.cmp_precedence(current).is_gt());
        if raise {
            *slot = Some(min);
        }
    }
}

fn root_prefix_of(entry: &str) -> &str {
    match entry.rfind('.') {
        Some(idx) => &entry[..=idx],
        None => "",
    }
}

/// Checks a dotted, package-qualified symbol name.
pub(crate) fn validate_symbol(symbol: &str) -> Result<(), &'static str> {
    if symbol.is_empty() {
        return Err("empty symbol");
    }
    if !symbol.contains('.') {
        return Err("symbol must be package-qualified");
    }
    for segment in symbol.split('.') {
        let mut chars = segment.chars();
        match chars.next() {
            Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
            _ => return Err("each segment must start with a letter or '_'"),
        }
        if !chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '$') {
            return Err("symbol contains unsupported characters");
        }
    }
    Ok(())
}

#[cfg(test)]
#[allow(clippy::expect_used)]
mod tests {
    use super::*;

    fn descriptor(text: &str) -> Descriptor {
        Descriptor::parse(text).expect("parse descriptor")
    }

    #[test]
    fn test_parse_full_descriptor() {
        let d = descriptor(
            r#"
id = "acme:storage"
version = "1.5.0"
contract-level = 3
entry = "com.acme.storage.StorageAddon"
dependencies = "logging>=1.0.0; metrics"
optional-dependencies = ["ui>=2.0", "cache"]
"#,
        );
        let meta = AddonMetadata::from_descriptor(&d).expect("metadata");

        assert_eq!(meta.id, "acme:storage");
        assert_eq!(meta.namespace(), "acme");
        assert_eq!(meta.version, Version::new(1, 5, 0));
        assert_eq!(meta.contract_level, 3);
        assert_eq!(meta.root_prefix(), "com.acme.storage.");
        assert_eq!(meta.api_namespace, "com.acme.storage.api.");
        assert_eq!(meta.required.get("logging"), Some(&Some(Version::new(1, 0, 0))));
        assert_eq!(meta.required.get("metrics"), Some(&None));
        assert_eq!(meta.optional.get("ui"), Some(&Some(Version::new(2, 0, 0))));
        assert_eq!(meta.optional.get("cache"), Some(&None));
    }

    #[test]
    fn test_legacy_depends_used_only_as_fallback() {
        let legacy = descriptor(
            r#"
id = "a"
version = "1.0.0"
contract-level = 1
entry = "a.Main"
depends = "b c"
"#,
        );
        let meta = AddonMetadata::from_descriptor(&legacy).expect("metadata");
        assert_eq!(meta.required.keys().collect::<Vec<_>>(), vec!["b", "c"]);

        let both = descriptor(
            r#"
id = "a"
version = "1.0.0"
contract-level = 1
entry = "a.Main"
dependencies = "d>=1.0.0"
depends = "b c"
"#,
        );
        let meta = AddonMetadata::from_descriptor(&both).expect("metadata");
        assert_eq!(meta.required.keys().collect::<Vec<_>>(), vec!["d"]);
    }

    #[test]
    fn test_required_wins_over_optional() {
        let d = Descriptor::from_pairs([
            ("id", "a"),
            ("version", "1.0.0"),
            ("contract-level", "1"),
            ("entry", "a.Main"),
            ("dependencies", "b>=1.0.0"),
            ("optional-dependencies", "b>=3.0.0"),
        ]);
        let meta = AddonMetadata::from_descriptor(&d).expect("metadata");
        assert!(meta.required.contains_key("b"));
        assert!(!meta.optional.contains_key("b"));
    }

    #[test]
    fn test_duplicate_token_keeps_highest_minimum() {
        let d = Descriptor::from_pairs([
            ("id", "a"),
            ("version", "1.0.0"),
            ("contract-level", "1"),
            ("entry", "a.Main"),
            ("dependencies", "b>=1.0.0,b>=1.2.0,b"),
        ]);
        let meta = AddonMetadata::from_descriptor(&d).expect("metadata");
        assert_eq!(meta.required.get("b"), Some(&Some(Version::new(1, 2, 0))));
    }

    #[test]
    fn test_spaced_operator_tokens() {
        let specs = parse_dependency_list("b >= 1.0.0, c>= 2.0.0 d >=3").expect("parse");
        assert_eq!(specs.len(), 3);
        assert_eq!(specs[0].id, "b");
        assert_eq!(specs[1].min_version, Some(Version::new(2, 0, 0)));
        assert_eq!(specs[2].min_version, Some(Version::new(3, 0, 0)));
    }

    #[test]
    fn test_missing_keys_rejected() {
        let d = Descriptor::from_pairs([("id", "a"), ("version", "1.0.0")]);
        assert!(matches!(
            AddonMetadata::from_descriptor(&d),
            Err(MetadataError::MissingKey("contract-level"))
        ));
    }

    #[test]
    fn test_invalid_values_rejected() {
        let base = [("version", "1.0.0"), ("contract-level", "1"), ("entry", "a.Main")];
        for id in ["a:b:c", "bad id", ":a"] {
            let mut pairs = vec![("id", id)];
            pairs.extend(base);
            assert!(AddonMetadata::from_descriptor(&Descriptor::from_pairs(pairs)).is_err());
        }

        let unqualified = Descriptor::from_pairs([
            ("id", "a"),
            ("version", "1.0.0"),
            ("contract-level", "1"),
            ("entry", "Main"),
        ]);
        assert!(AddonMetadata::from_descriptor(&unqualified).is_err());
    }

    #[test]
    fn test_self_dependency_is_left_to_the_resolver() {
        let d = Descriptor::from_pairs([
            ("id", "a"),
            ("version", "1.0.0"),
            ("contract-level", "1"),
            ("entry", "a.Main"),
            ("dependencies", "a"),
        ]);
        let meta = AddonMetadata::from_descriptor(&d).expect("metadata");
        assert!(meta.required.contains_key("a"));
    }

    #[test]
    fn test_entry_root_must_stay_outside_the_contract() {
        let meta_for = |entry: &str| {
            let d = Descriptor::from_pairs([
                ("id", "a"),
                ("version", "1.0.0"),
                ("contract-level", "1"),
                ("entry", entry),
            ]);
            AddonMetadata::from_descriptor(&d).expect("metadata")
        };

        assert!(meta_for("com.a.Main").check_outside_contract("engine.api.").is_ok());
        assert!(meta_for("engine.apix.Main").check_outside_contract("engine.api.").is_ok());
        for entry in ["engine.Evil", "engine.api.Main", "engine.api.deep.Main"] {
            assert!(
                matches!(
                    meta_for(entry).check_outside_contract("engine.api."),
                    Err(MetadataError::InvalidValue { key: "entry", .. })
                ),
                "{}",
                entry
            );
        }
    }

    #[test]
    fn test_nested_tables_rejected() {
        assert!(Descriptor::parse("[section]\nkey = 1").is_err());
        assert!(Descriptor::parse("not = = toml").is_err());
    }

    #[test]
    fn test_api_namespace_override_must_stay_under_root() {
        let ok = Descriptor::from_pairs([
            ("id", "a"),
            ("version", "1.0.0"),
            ("contract-level", "1"),
            ("entry", "com.a.Main"),
            ("api-namespace", "com.a.published"),
        ]);
        let meta = AddonMetadata::from_descriptor(&ok).expect("metadata");
        assert_eq!(meta.api_namespace, "com.a.published.");

        let escaping = Descriptor::from_pairs([
            ("id", "a"),
            ("version", "1.0.0"),
            ("contract-level", "1"),
            ("entry", "com.a.Main"),
            ("api-namespace", "com.b.api"),
        ]);
        assert!(AddonMetadata::from_descriptor(&escaping).is_err());
    }
}
