//! ---
//! shem_section: "02-module-messaging"
//! shem_subsection: "module"
//! shem_type: "source"
//! shem_scope: "code"
//! shem_description: "Subscription matching and message fan-out between modules."
//! shem_version: "v0.1.0"
//! shem_owner: "tbd"
//! ---
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::Mutex;
use shem_config::ConfigStore;
use shem_msg::{validate_name_part, Message};
use thiserror::Error;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::{debug, error, warn};

/// Handle to a running module's input stream, locked per child so concurrent
/// deliveries never interleave inside a frame.
pub type ModuleInput = Arc<tokio::sync::Mutex<Box<dyn AsyncWrite + Send + Unpin>>>;

/// Narrow capability the supervisor hands to the router: resolve a running
/// module's input stream by name. The router needs nothing else from the
/// supervisor.
pub trait InputSinks: Send + Sync {
    fn lookup(&self, module: &str) -> Option<ModuleInput>;
}

/// Errors for a single `inputs` line. The line is skipped; the module keeps
/// its remaining patterns.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PatternError {
    #[error("expected 'MODULE.VAR [LOCAL]', got {0:?}")]
    Malformed(String),
    #[error("pattern field {0:?} is not a valid name or wildcard")]
    InvalidField(String),
    #[error("local name {0:?} is not a valid name")]
    InvalidLocal(String),
    #[error("wildcards are not allowed when a local name is given")]
    WildcardWithLocal,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum PatternField {
    Any,
    Name(String),
}

impl PatternField {
    fn parse(field: &str) -> Result<Self, PatternError> {
        if field == "*" {
            return Ok(Self::Any);
        }
        validate_name_part(field).map_err(|_| PatternError::InvalidField(field.to_owned()))?;
        Ok(Self::Name(field.to_owned()))
    }

    fn matches(&self, value: &str) -> bool {
        match self {
            Self::Any => !value.is_empty(),
            Self::Name(name) => name == value,
        }
    }
}

/// One parsed `inputs` line: `MODULE.VAR [LOCAL]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionPattern {
    module: PatternField,
    variable: PatternField,
    local: Option<String>,
}

impl SubscriptionPattern {
    pub fn parse(line: &str) -> Result<Self, PatternError> {
        let mut fields = line.split_whitespace();
        let (selector, local) = match (fields.next(), fields.next(), fields.next()) {
            (Some(selector), local, None) => (selector, local),
            _ => return Err(PatternError::Malformed(line.to_owned())),
        };

        let (module, variable) = selector
            .split_once('.')
            .ok_or_else(|| PatternError::Malformed(line.to_owned()))?;
        let module = PatternField::parse(module)?;
        let variable = PatternField::parse(variable)?;

        let local = match local {
            None => None,
            Some(local) => {
                if module == PatternField::Any || variable == PatternField::Any {
                    return Err(PatternError::WildcardWithLocal);
                }
                validate_name_part(local)
                    .map_err(|_| PatternError::InvalidLocal(local.to_owned()))?;
                Some(local.to_owned())
            }
        };

        Ok(Self {
            module,
            variable,
            local,
        })
    }

    fn matches(&self, source_module: &str, variable: &str) -> bool {
        self.module.matches(source_module) && self.variable.matches(variable)
    }

    /// The module this pattern targets, when it is not a wildcard.
    fn target_module(&self) -> Option<&str> {
        match &self.module {
            PatternField::Name(name) => Some(name),
            PatternField::Any => None,
        }
    }
}

struct SubscriberEntry {
    /// Raw `inputs` content, kept to detect changes between reloads.
    raw: String,
    patterns: Vec<SubscriptionPattern>,
}

#[derive(Default)]
struct Table {
    subscribers: HashMap<String, SubscriberEntry>,
    known_modules: HashSet<String>,
}

/// Fans qualified messages out to subscribing modules' input streams.
pub struct Router {
    sinks: Arc<dyn InputSinks>,
    table: Mutex<Table>,
}

impl Router {
    pub fn new(sinks: Arc<dyn InputSinks>) -> Self {
        Self {
            sinks,
            table: Mutex::new(Table::default()),
        }
    }

    /// Reload subscriptions for the given module set. A module's `inputs`
    /// file is re-parsed (and its diagnostics re-emitted) only when its
    /// content changed; unknown-target warnings are re-checked when the
    /// module set changed. A blank or absent `inputs` file is the empty
    /// subscription list.
    pub fn reload(&self, store: &ConfigStore, modules: &[String]) {
        let module_set: HashSet<String> = modules.iter().cloned().collect();

        // Read the inputs files before taking the table lock.
        let mut raw_inputs: Vec<(&String, String)> = Vec::with_capacity(modules.len());
        for name in modules {
            match store.module(name).and_then(|config| config.get_or("inputs", "")) {
                Ok(raw) => raw_inputs.push((name, raw)),
                Err(err) => {
                    error!(module = %name, error = %err, "failed to read inputs file");
                }
            }
        }

        let mut table = self.table.lock();
        let modules_changed = table.known_modules != module_set;

        table
            .subscribers
            .retain(|name, _| module_set.contains(name));

        for (name, raw) in raw_inputs {
            let changed = table
                .subscribers
                .get(name)
                .map_or(true, |entry| entry.raw != raw);
            if changed {
                let patterns = parse_inputs(name, &raw);
                warn_unknown_targets(name, &patterns, &module_set);
                table
                    .subscribers
                    .insert(name.clone(), SubscriberEntry { raw, patterns });
            } else if modules_changed {
                if let Some(entry) = table.subscribers.get(name) {
                    warn_unknown_targets(name, &entry.patterns, &module_set);
                }
            }
        }

        table.known_modules = module_set;
    }

    /// Deliver a qualified message from `source_module` to every matching
    /// subscriber, once per matching pattern. Messages are re-encoded, never
    /// forwarded verbatim.
    pub async fn route(&self, source_module: &str, message: &Message) {
        let (_, variable) = shem_msg::split_name(&message.name);

        // Snapshot deliveries under the lock, then write without it.
        let deliveries: Vec<(String, String)> = {
            let table = self.table.lock();
            table
                .subscribers
                .iter()
                .flat_map(|(subscriber, entry)| {
                    entry
                        .patterns
                        .iter()
                        .filter(|pattern| pattern.matches(source_module, variable))
                        .map(|pattern| {
                            let delivered_name = pattern
                                .local
                                .clone()
                                .unwrap_or_else(|| message.name.clone());
                            (subscriber.clone(), delivered_name)
                        })
                })
                .collect()
        };

        for (subscriber, delivered_name) in deliveries {
            let Some(sink) = self.sinks.lookup(&subscriber) else {
                debug!(
                    subscriber = %subscriber,
                    name = %message.name,
                    "subscriber not running, dropping message"
                );
                continue;
            };

            let frame = message.with_name(delivered_name.clone()).encode_framed();
            let mut sink = sink.lock().await;
            if let Err(err) = write_frame(&mut sink, &frame).await {
                warn!(
                    subscriber = %subscriber,
                    name = %delivered_name,
                    error = %err,
                    "failed to deliver message"
                );
            }
        }
    }
}

async fn write_frame(
    sink: &mut Box<dyn AsyncWrite + Send + Unpin>,
    frame: &[u8],
) -> std::io::Result<()> {
    sink.write_all(frame).await?;
    sink.flush().await
}

fn parse_inputs(module: &str, raw: &str) -> Vec<SubscriptionPattern> {
    let mut patterns = Vec::new();
    for line in raw.lines() {
        if line.trim().is_empty() {
            continue;
        }
        match SubscriptionPattern::parse(line) {
            Ok(pattern) => patterns.push(pattern),
            Err(err) => {
                error!(module = %module, line = %line, error = %err, "invalid subscription pattern");
            }
        }
    }
    patterns
}

fn warn_unknown_targets(
    module: &str,
    patterns: &[SubscriptionPattern],
    known: &HashSet<String>,
) {
    for pattern in patterns {
        if let Some(target) = pattern.target_module() {
            if !known.contains(target) {
                warn!(
                    module = %module,
                    target = %target,
                    "subscription references unknown module"
                );
            }
        }
    }
}
