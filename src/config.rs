//! Task-graph configuration loader.
//!
//! The graph file is an INI-style document: a `[mode]` section carrying
//! global defaults (`threads`, `retry`, `monitor_resource`,
//! `monitor_time_step`, `check_resource_before_run`) and one section per
//! task. Per-task keys missing from a section inherit from `[mode]`.
//! Values may reference other values with `${section:key}` (or `${key}`
//! within the same section); `$$` escapes a literal dollar sign.

use std::collections::{HashMap, HashSet};
use std::path::Path;

use thiserror::Error;

/// Default wall-clock bound for a task: ten days.
pub const DEFAULT_TIMEOUT_SECS: u64 = 3600 * 24 * 10;

/// Interpolation references may chain; this bounds the chain length.
const MAX_INTERPOLATION_DEPTH: usize = 10;

/// Load-time failures. All of these abort before any task runs.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{path}:{line}: expected `[section]` or `key = value`, got `{text}`")]
    Syntax {
        path: String,
        line: usize,
        text: String,
    },

    #[error("duplicate section [{0}]")]
    DuplicateSection(String),

    #[error("missing required section [mode]")]
    MissingMode,

    #[error("section [{section}] is missing required key `{key}`")]
    MissingKey { section: String, key: String },

    #[error("[{section}] {key} = `{value}`: expected {expected}")]
    BadValue {
        section: String,
        key: String,
        value: String,
        expected: &'static str,
    },

    #[error("step \"{depend}\" required by [{section}] is not in the pipeline, a spelling mistake?")]
    UnknownDependency { section: String, depend: String },

    #[error("dependency cycle involving [{0}]")]
    Cycle(String),

    #[error("[{section}] {key}: unresolvable reference `{reference}`")]
    BadReference {
        section: String,
        key: String,
        reference: String,
    },

    #[error("[{section}] {key}: interpolation depth limit exceeded")]
    InterpolationDepth { section: String, key: String },
}

/// One task as declared in the graph file, with defaults filled in.
#[derive(Debug, Clone)]
pub struct TaskSpec {
    pub name: String,
    /// Shell command line, run via `sh -c`.
    pub cmd: String,
    /// Names of predecessor tasks; empty for orphans.
    pub depend: Vec<String>,
    /// Declared need in fractional cores.
    pub cpu: f64,
    /// Declared need in bytes.
    pub mem: u64,
    /// Additional attempts after the first failure.
    pub retry: u32,
    /// Wall-clock bound in seconds.
    pub timeout: u64,
    pub monitor_resource: bool,
    /// Sampling interval in seconds.
    pub monitor_time_step: u64,
    pub check_resource_before_run: bool,
}

/// The parsed task graph: an acyclic dependency relation over named shell
/// commands plus the global worker count.
#[derive(Debug, Clone)]
pub struct TaskGraph {
    names: Vec<String>,
    tasks: HashMap<String, TaskSpec>,
    threads: usize,
}

impl TaskGraph {
    /// Parse and validate a graph file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::parse(&text, &path.display().to_string())
    }

    /// Parse graph text. `path` is only used in error messages.
    pub fn parse(text: &str, path: &str) -> Result<Self, ConfigError> {
        let raw = RawIni::parse(text, path)?;
        if !raw.has_section("mode") {
            return Err(ConfigError::MissingMode);
        }

        let threads = raw.resolve("mode", "threads")?.ok_or_else(|| missing("mode", "threads"))?;
        let threads = parse_num::<usize>("mode", "threads", &threads)?;

        let names: Vec<String> = raw
            .section_names()
            .filter(|s| *s != "mode")
            .map(str::to_string)
            .collect();
        let name_set: HashSet<&str> = names.iter().map(String::as_str).collect();

        let mut tasks = HashMap::with_capacity(names.len());
        for name in &names {
            let spec = build_task(&raw, name, &name_set)?;
            tasks.insert(name.clone(), spec);
        }

        let graph = TaskGraph {
            names,
            tasks,
            threads,
        };
        graph.check_acyclic()?;
        Ok(graph)
    }

    /// Task names in file order.
    pub fn names(&self) -> &[String] {
        &self.names
    }

    /// Tasks with no predecessors; these may run immediately.
    pub fn orphans(&self) -> Vec<&str> {
        self.names
            .iter()
            .filter(|n| self.tasks[n.as_str()].depend.is_empty())
            .map(String::as_str)
            .collect()
    }

    /// Predecessor names of `name`. Empty when the task is an orphan.
    pub fn dependency(&self, name: &str) -> &[String] {
        self.tasks
            .get(name)
            .map(|t| t.depend.as_slice())
            .unwrap_or(&[])
    }

    pub fn task(&self, name: &str) -> Option<&TaskSpec> {
        self.tasks.get(name)
    }

    pub fn threads(&self) -> usize {
        self.threads
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// Reject cyclic dependency relations. The scheduler would otherwise
    /// wait forever for a task that can never become ready.
    fn check_acyclic(&self) -> Result<(), ConfigError> {
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            White,
            Grey,
            Black,
        }
        let mut marks: HashMap<&str, Mark> =
            self.names.iter().map(|n| (n.as_str(), Mark::White)).collect();

        for start in &self.names {
            if marks[start.as_str()] != Mark::White {
                continue;
            }
            // Iterative DFS; (node, next-edge-index) pairs.
            let mut stack: Vec<(&str, usize)> = vec![(start.as_str(), 0)];
            marks.insert(start.as_str(), Mark::Grey);
            while let Some((node, idx)) = stack.pop() {
                let deps = self.dependency(node);
                if idx < deps.len() {
                    stack.push((node, idx + 1));
                    let next = deps[idx].as_str();
                    match marks[next] {
                        Mark::Grey => return Err(ConfigError::Cycle(next.to_string())),
                        Mark::White => {
                            marks.insert(next, Mark::Grey);
                            stack.push((next, 0));
                        }
                        Mark::Black => {}
                    }
                } else {
                    marks.insert(node, Mark::Black);
                }
            }
        }
        Ok(())
    }
}

fn missing(section: &str, key: &str) -> ConfigError {
    ConfigError::MissingKey {
        section: section.to_string(),
        key: key.to_string(),
    }
}

fn build_task(raw: &RawIni, name: &str, names: &HashSet<&str>) -> Result<TaskSpec, ConfigError> {
    let cmd = raw.resolve(name, "cmd")?.ok_or_else(|| missing(name, "cmd"))?;

    let depend = match raw.resolve(name, "depend")? {
        None => Vec::new(),
        Some(csv) => csv
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect(),
    };
    for dep in &depend {
        if !names.contains(dep.as_str()) {
            return Err(ConfigError::UnknownDependency {
                section: name.to_string(),
                depend: dep.clone(),
            });
        }
    }

    // Numeric needs default to zero: such a task is admitted unconditionally.
    let cpu = match raw.resolve(name, "cpu")? {
        Some(v) => parse_num::<f64>(name, "cpu", &v)?,
        None => 0.0,
    };
    let mem = match raw.resolve(name, "mem")? {
        Some(v) => parse_num::<u64>(name, "mem", &v)?,
        None => 0,
    };
    let timeout = match raw.resolve(name, "timeout")? {
        Some(v) => parse_num::<u64>(name, "timeout", &v)?,
        None => DEFAULT_TIMEOUT_SECS,
    };

    // The remaining knobs inherit from [mode] when a task does not set them.
    let retry = inherited(raw, name, "retry")?;
    let retry = parse_num::<u32>(name, "retry", &retry)?;
    let monitor_resource = parse_bool(name, "monitor_resource", &inherited(raw, name, "monitor_resource")?)?;
    let monitor_time_step = parse_num::<u64>(
        name,
        "monitor_time_step",
        &inherited(raw, name, "monitor_time_step")?,
    )?;
    let check_resource_before_run = parse_bool(
        name,
        "check_resource_before_run",
        &inherited(raw, name, "check_resource_before_run")?,
    )?;

    Ok(TaskSpec {
        name: name.to_string(),
        cmd,
        depend,
        cpu,
        mem,
        retry,
        timeout,
        monitor_resource,
        monitor_time_step,
        check_resource_before_run,
    })
}

/// Task value, falling back to the `[mode]` default. Absence from both is a
/// load-time error attributed to `[mode]`.
fn inherited(raw: &RawIni, section: &str, key: &str) -> Result<String, ConfigError> {
    if let Some(v) = raw.resolve(section, key)? {
        return Ok(v);
    }
    raw.resolve("mode", key)?.ok_or_else(|| missing("mode", key))
}

fn parse_num<T: std::str::FromStr>(
    section: &str,
    key: &str,
    value: &str,
) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::BadValue {
        section: section.to_string(),
        key: key.to_string(),
        value: value.to_string(),
        expected: "a number",
    })
}

fn parse_bool(section: &str, key: &str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "yes" | "true" | "on" => Ok(true),
        "0" | "no" | "false" | "off" => Ok(false),
        _ => Err(ConfigError::BadValue {
            section: section.to_string(),
            key: key.to_string(),
            value: value.to_string(),
            expected: "a boolean (true/false, yes/no, on/off, 1/0)",
        }),
    }
}

/// Sections and raw (uninterpolated) key/value pairs, in file order.
struct RawIni {
    order: Vec<String>,
    sections: HashMap<String, HashMap<String, String>>,
}

impl RawIni {
    fn parse(text: &str, path: &str) -> Result<Self, ConfigError> {
        let mut order = Vec::new();
        let mut sections: HashMap<String, HashMap<String, String>> = HashMap::new();
        let mut current: Option<String> = None;

        for (idx, raw_line) in text.lines().enumerate() {
            let line = raw_line.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
                continue;
            }
            let syntax = || ConfigError::Syntax {
                path: path.to_string(),
                line: idx + 1,
                text: line.to_string(),
            };

            if let Some(name) = line.strip_prefix('[') {
                let name = name.strip_suffix(']').ok_or_else(syntax)?.trim().to_string();
                if name.is_empty() {
                    return Err(syntax());
                }
                if sections.contains_key(&name) {
                    return Err(ConfigError::DuplicateSection(name));
                }
                sections.insert(name.clone(), HashMap::new());
                order.push(name.clone());
                current = Some(name);
                continue;
            }

            // `key = value` or `key : value`; the first separator wins.
            let sep = line
                .char_indices()
                .find(|(_, c)| *c == '=' || *c == ':')
                .map(|(i, _)| i)
                .ok_or_else(syntax)?;
            let key = line[..sep].trim();
            let value = line[sep + 1..].trim();
            if key.is_empty() {
                return Err(syntax());
            }
            let section = current.as_ref().ok_or_else(syntax)?;
            sections
                .get_mut(section)
                .unwrap()
                .insert(key.to_string(), value.to_string());
        }

        Ok(RawIni { order, sections })
    }

    fn has_section(&self, name: &str) -> bool {
        self.sections.contains_key(name)
    }

    fn section_names(&self) -> impl Iterator<Item = &str> {
        self.order.iter().map(String::as_str)
    }

    fn get(&self, section: &str, key: &str) -> Option<&str> {
        self.sections.get(section)?.get(key).map(String::as_str)
    }

    /// Look up `section.key` and expand `${...}` references. Returns
    /// `Ok(None)` when the key is absent.
    fn resolve(&self, section: &str, key: &str) -> Result<Option<String>, ConfigError> {
        match self.get(section, key) {
            None => Ok(None),
            Some(value) => self.expand(section, key, value, 0).map(Some),
        }
    }

    fn expand(
        &self,
        section: &str,
        key: &str,
        value: &str,
        depth: usize,
    ) -> Result<String, ConfigError> {
        if depth > MAX_INTERPOLATION_DEPTH {
            return Err(ConfigError::InterpolationDepth {
                section: section.to_string(),
                key: key.to_string(),
            });
        }
        if !value.contains('$') {
            return Ok(value.to_string());
        }

        let bad_ref = |reference: &str| ConfigError::BadReference {
            section: section.to_string(),
            key: key.to_string(),
            reference: reference.to_string(),
        };

        let mut out = String::with_capacity(value.len());
        let mut rest = value;
        while let Some(pos) = rest.find('$') {
            out.push_str(&rest[..pos]);
            rest = &rest[pos..];
            if let Some(tail) = rest.strip_prefix("$$") {
                out.push('$');
                rest = tail;
            } else if let Some(tail) = rest.strip_prefix("${") {
                let end = tail.find('}').ok_or_else(|| bad_ref(rest))?;
                let reference = &tail[..end];
                let (ref_section, ref_key) = match reference.split_once(':') {
                    Some((s, k)) => (s, k),
                    None => (section, reference),
                };
                let raw = self
                    .get(ref_section, ref_key)
                    .ok_or_else(|| bad_ref(reference))?;
                out.push_str(&self.expand(ref_section, ref_key, raw, depth + 1)?);
                rest = &tail[end + 1..];
            } else {
                return Err(bad_ref(rest));
            }
        }
        out.push_str(rest);
        Ok(out)
    }
}

// ---------- Unit tests ----------
