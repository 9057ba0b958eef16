//! Method configuration: ACLs, backend mappings, and dispatch filters.
//!
//! A [`Policy`] is an immutable snapshot built from a TOML file. The daemon
//! swaps snapshots atomically on reload; calls in flight keep using the
//! snapshot they were dispatched against.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;

use anyhow::{Context, Result, bail};
use serde::Deserialize;

/// ACL name every principal implicitly belongs to.
pub const PUBLIC_ACL: &str = "public";

/// Maximum depth of transitive `+name` ACL inclusion.
const MAX_ACL_DEPTH: usize = 10;

/// An ACL reference: either a single name or a list of names.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum AclSpec {
    One(String),
    Many(Vec<String>),
}

impl AclSpec {
    pub fn names(&self) -> &[String] {
        match self {
            AclSpec::One(name) => std::slice::from_ref(name),
            AclSpec::Many(names) => names,
        }
    }
}

/// A callable method and the backend it maps to.
#[derive(Debug, Clone)]
pub struct MethodEntry {
    pub backend: String,
    pub doc: Option<String>,
}

/// A method-table value in the config file: either a full record or a
/// backend prefix ending in `.`, to which the short method name is appended.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum MethodSpec {
    Shorthand(String),
    Full {
        backend: String,
        #[serde(default)]
        doc: Option<String>,
    },
}

#[derive(Debug, Default, Deserialize)]
struct PolicyFile {
    #[serde(default)]
    acl: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    method2acl: BTreeMap<String, AclSpec>,
    #[serde(default)]
    backend2acl: BTreeMap<String, AclSpec>,
    #[serde(default)]
    backendfilter: BTreeMap<String, String>,
    #[serde(default)]
    methods: BTreeMap<String, MethodSpec>,
}

/// Immutable method-configuration snapshot.
#[derive(Debug, Default)]
pub struct Policy {
    /// Resolved ACL membership, inclusions expanded.
    acl: HashMap<String, HashSet<String>>,
    /// Inverted form: principal to the ACLs naming it (plus `public`).
    who2acl: HashMap<String, HashSet<String>>,
    method2acl: HashMap<String, AclSpec>,
    backend2acl: HashMap<String, AclSpec>,
    backendfilter: HashMap<String, String>,
    methods: HashMap<String, MethodEntry>,
}

/// Split a fully-qualified method name into namespace and short name.
/// Both parts must be non-empty.
pub fn split_namespace(method: &str) -> Option<(&str, &str)> {
    let (ns, name) = method.split_once('.')?;
    if ns.is_empty() || name.is_empty() {
        return None;
    }
    Some((ns, name))
}

fn wildcard_lookup<'a, T>(map: &'a HashMap<String, T>, method: &str) -> Option<&'a T> {
    if let Some(value) = map.get(method) {
        return Some(value);
    }
    let (ns, _) = split_namespace(method)?;
    map.get(&format!("{ns}.*"))
}

impl Policy {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read method config {}", path.display()))?;
        Self::from_toml_str(&content)
            .with_context(|| format!("Failed to load method config {}", path.display()))
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let file: PolicyFile = toml::from_str(content).context("Failed to parse method config")?;
        Self::resolve(file)
    }

    fn resolve(file: PolicyFile) -> Result<Self> {
        let mut acl = HashMap::new();
        for name in file.acl.keys() {
            if name == PUBLIC_ACL {
                bail!("ACL '{PUBLIC_ACL}' is reserved and cannot be redefined");
            }
            let members = expand_acl(name, &file.acl, 0)?;
            acl.insert(name.clone(), members);
        }

        let mut who2acl: HashMap<String, HashSet<String>> = HashMap::new();
        for (name, members) in &acl {
            for who in members {
                let acls = who2acl.entry(who.clone()).or_default();
                acls.insert(name.clone());
                acls.insert(PUBLIC_ACL.to_string());
            }
        }

        for (table, specs) in [("method2acl", &file.method2acl), ("backend2acl", &file.backend2acl)] {
            for (method, spec) in specs {
                for referenced in spec.names() {
                    if referenced != PUBLIC_ACL && !acl.contains_key(referenced) {
                        bail!("{table} entry '{method}' references unknown ACL '{referenced}'");
                    }
                }
            }
        }

        let mut methods = HashMap::new();
        for (name, spec) in file.methods {
            let (_, short) = split_namespace(&name)
                .with_context(|| format!("method '{name}' lacks a namespace"))?;
            let entry = match spec {
                MethodSpec::Shorthand(prefix) => {
                    if !prefix.ends_with('.') {
                        bail!("method '{name}': shorthand backend '{prefix}' must end in '.'");
                    }
                    MethodEntry {
                        backend: format!("{prefix}{short}"),
                        doc: None,
                    }
                }
                MethodSpec::Full { backend, doc } => MethodEntry { backend, doc },
            };
            methods.insert(name, entry);
        }

        Ok(Policy {
            acl,
            who2acl,
            method2acl: file.method2acl.into_iter().collect(),
            backend2acl: file.backend2acl.into_iter().collect(),
            backendfilter: file.backendfilter.into_iter().collect(),
            methods,
        })
    }

    /// Resolved membership of an ACL, after inclusion expansion.
    pub fn acl_members(&self, name: &str) -> Option<&HashSet<String>> {
        self.acl.get(name)
    }

    /// True iff `who` is in any of the ACLs the spec names.
    pub fn check_acl(&self, spec: &AclSpec, who: &str) -> bool {
        let acls = self.who2acl.get(who);
        spec.names()
            .iter()
            .any(|name| name == PUBLIC_ACL || acls.is_some_and(|set| set.contains(name)))
    }

    /// ACL governing calls to `method`, falling back to the `ns.*` entry.
    pub fn method_acl(&self, method: &str) -> Option<&AclSpec> {
        wildcard_lookup(&self.method2acl, method)
    }

    /// ACL governing announcements of `backend`, falling back to `ns.*`.
    pub fn backend_acl(&self, backend: &str) -> Option<&AclSpec> {
        wildcard_lookup(&self.backend2acl, backend)
    }

    /// Filter key required for `backend`, falling back to `ns.*`.
    pub fn filter_key(&self, backend: &str) -> Option<&str> {
        wildcard_lookup(&self.backendfilter, backend).map(String::as_str)
    }

    pub fn method(&self, name: &str) -> Option<&MethodEntry> {
        self.methods.get(name)
    }

    pub fn methods(&self) -> &HashMap<String, MethodEntry> {
        &self.methods
    }
}

fn expand_acl(
    name: &str,
    raw: &BTreeMap<String, Vec<String>>,
    depth: usize,
) -> Result<HashSet<String>> {
    if depth > MAX_ACL_DEPTH {
        bail!("ACL inclusion depth exceeded while expanding '{name}' (cycle?)");
    }
    let members = raw
        .get(name)
        .with_context(|| format!("unknown ACL '{name}' in inclusion"))?;

    let mut out = HashSet::new();
    for member in members {
        match member.strip_prefix('+') {
            Some(included) => out.extend(expand_acl(included, raw, depth + 1)?),
            None => {
                out.insert(member.clone());
            }
        }
    }
    Ok(out)
}
