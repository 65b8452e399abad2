//! Durable rule store backed by a CSV file.
//!
//! Record shape is a compatibility contract: first line is the header
//! `RoutingName,EnterPort,RoutingDestination,RoutingPort,Description`, one
//! record per rule, ports as decimal integers.
//!
//! The full rule set is cached in memory at open; mutations update the cache
//! and the file together under the cache lock. The proxy core never calls
//! back into this store — it is consulted once at startup to seed the
//! registry, and by the API layer to persist `add`/`delete` after the
//! registry call succeeded.

use portroute_core::{RouteError, RouteResult, RouteRule};
use serde::{Deserialize, Serialize};
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::info;

/// Column order of the persisted record.
const HEADER: [&str; 5] = [
    "RoutingName",
    "EnterPort",
    "RoutingDestination",
    "RoutingPort",
    "Description",
];

/// On-disk record shape. Field names map to the CSV header columns.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RuleRecord {
    routing_name: String,
    enter_port: u16,
    routing_destination: String,
    routing_port: u16,
    description: String,
}

impl From<&RouteRule> for RuleRecord {
    fn from(rule: &RouteRule) -> Self {
        Self {
            routing_name: rule.name.clone(),
            enter_port: rule.enter_port,
            routing_destination: rule.destination_host.clone(),
            routing_port: rule.destination_port,
            description: rule.description.clone(),
        }
    }
}

impl From<RuleRecord> for RouteRule {
    fn from(record: RuleRecord) -> Self {
        RouteRule::new(
            record.routing_name,
            record.enter_port,
            record.routing_destination,
            record.routing_port,
            record.description,
        )
    }
}

/// CSV-file rule repository with an in-memory cache.
pub struct CsvRuleRepository {
    path: PathBuf,
    cache: Mutex<Vec<RouteRule>>,
}

impl CsvRuleRepository {
    /// Open the repository at `path`, creating an empty file (header only)
    /// when none exists, and load every record into the cache.
    ///
    /// # Errors
    ///
    /// Returns [`RouteError::Repository`] on malformed records, or an I/O
    /// error when the file cannot be created or read.
    pub fn open(path: impl AsRef<Path>) -> RouteResult<Self> {
        let path = path.as_ref().to_path_buf();

        if !path.exists() {
            info!(path = %path.display(), "rules file not found, creating empty store");
            write_all(&path, &[])?;
        }

        let rules = read_all(&path)?;
        info!(path = %path.display(), rules = rules.len(), "rules loaded");

        Ok(Self {
            path,
            cache: Mutex::new(rules),
        })
    }

    /// Snapshot of every stored rule.
    pub fn list_all(&self) -> Vec<RouteRule> {
        self.cache.lock().expect("repository cache poisoned").clone()
    }

    /// First stored rule with the given name, if any.
    pub fn find_by_name(&self, name: &str) -> Option<RouteRule> {
        self.cache
            .lock()
            .expect("repository cache poisoned")
            .iter()
            .find(|rule| rule.name == name)
            .cloned()
    }

    /// Persist a new rule by appending a record.
    ///
    /// # Errors
    ///
    /// Returns [`RouteError::DuplicateRule`] when a stored rule already has
    /// the same identity triple, regardless of name or description.
    pub fn create(&self, rule: &RouteRule) -> RouteResult<()> {
        let mut cache = self.cache.lock().expect("repository cache poisoned");
        let key = rule.key();
        if cache.iter().any(|stored| stored.key() == key) {
            return Err(RouteError::DuplicateRule(key));
        }

        let file = OpenOptions::new().append(true).open(&self.path)?;
        let mut writer = csv::WriterBuilder::new().has_headers(false).from_writer(file);
        writer
            .serialize(RuleRecord::from(rule))
            .map_err(|e| RouteError::Repository(e.to_string()))?;
        writer
            .flush()
            .map_err(|e| RouteError::Repository(e.to_string()))?;

        cache.push(rule.clone());
        Ok(())
    }

    /// Delete every stored rule with the given name and rewrite the file.
    ///
    /// # Errors
    ///
    /// Returns [`RouteError::NotFound`] when no stored rule has that name.
    pub fn delete(&self, name: &str) -> RouteResult<()> {
        let mut cache = self.cache.lock().expect("repository cache poisoned");
        if !cache.iter().any(|rule| rule.name == name) {
            return Err(RouteError::NotFound(name.to_string()));
        }

        let remaining: Vec<RouteRule> = cache
            .iter()
            .filter(|rule| rule.name != name)
            .cloned()
            .collect();
        write_all(&self.path, &remaining)?;

        *cache = remaining;
        Ok(())
    }

    /// Render the stored rules as CSV text with the contract header.
    pub fn render_csv(&self) -> RouteResult<String> {
        let rules = self.list_all();
        let mut writer = csv::WriterBuilder::new()
            .has_headers(false)
            .from_writer(Vec::new());
        writer
            .write_record(HEADER)
            .map_err(|e| RouteError::Repository(e.to_string()))?;
        for rule in &rules {
            writer
                .serialize(RuleRecord::from(rule))
                .map_err(|e| RouteError::Repository(e.to_string()))?;
        }
        let bytes = writer
            .into_inner()
            .map_err(|e| RouteError::Repository(e.to_string()))?;
        String::from_utf8(bytes).map_err(|e| RouteError::Repository(e.to_string()))
    }
}

fn read_all(path: &Path) -> RouteResult<Vec<RouteRule>> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .from_path(path)
        .map_err(|e| RouteError::Repository(e.to_string()))?;

    let mut rules = Vec::new();
    for result in reader.deserialize::<RuleRecord>() {
        let record = result.map_err(|e| RouteError::Repository(e.to_string()))?;
        rules.push(RouteRule::from(record));
    }
    Ok(rules)
}

/// Rewrite the whole file: header first, then one record per rule.
fn write_all(path: &Path, rules: &[RouteRule]) -> RouteResult<()> {
    let mut writer = csv::WriterBuilder::new()
        .has_headers(false)
        .from_path(path)
        .map_err(|e| RouteError::Repository(e.to_string()))?;
    writer
        .write_record(HEADER)
        .map_err(|e| RouteError::Repository(e.to_string()))?;
    for rule in rules {
        writer
            .serialize(RuleRecord::from(rule))
            .map_err(|e| RouteError::Repository(e.to_string()))?;
    }
    writer
        .flush()
        .map_err(|e| RouteError::Repository(e.to_string()))?;
    Ok(())
}
