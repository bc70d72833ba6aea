//! Storage schemas: ordered rules matching metric names to retention
//! configurations.
//!
//! A rule's retention is written `<precision>:<points>` where either side
//! takes an optional unit suffix (`s`, `m`, `h`, `d`, `y`). A united
//! points field is a total duration divided by the precision, truncating.
//! The table is scanned in configured order, first match wins, and a final
//! default rule always matches.

use std::{
    collections::HashSet,
    fs,
    path::{
        Path,
        PathBuf,
    },
    time::SystemTime,
};

use anyhow::Context;
use parking_lot::Mutex;
use regex::Regex;

fn unit_multiplier(unit: char) -> anyhow::Result<u32> {
    match unit {
        's' => Ok(1),
        'm' => Ok(60),
        'h' => Ok(60 * 60),
        'd' => Ok(60 * 60 * 24),
        'y' => Ok(60 * 60 * 24 * 365),
        _ => anyhow::bail!("Invalid unit: '{unit}'"),
    }
}

fn parse_united(field: &str) -> anyhow::Result<(u32, Option<u32>)> {
    anyhow::ensure!(!field.is_empty(), "Empty retention field");
    if field.chars().all(|c| c.is_ascii_digit()) {
        return Ok((field.parse()?, None));
    }
    let mut chars = field.chars();
    let Some(unit) = chars.next_back() else {
        anyhow::bail!("Empty retention field");
    };
    let count: u32 = chars.as_str().parse().context("Invalid retention count")?;
    Ok((count, Some(unit_multiplier(unit)?)))
}

/// One retention level: `points` samples at `seconds_per_point` precision.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct Archive {
    pub seconds_per_point: u32,
    pub points: u32,
}

impl Archive {
    pub fn new(seconds_per_point: u32, points: u32) -> Self {
        Self {
            seconds_per_point,
            points,
        }
    }

    /// Parse a retention definition like `10s:6h`, `60:10080`, or `1m:7d`.
    pub fn from_retention_def(def: &str) -> anyhow::Result<Self> {
        let (precision_field, points_field) = def
            .trim()
            .split_once(':')
            .with_context(|| format!("Retention '{def}' is not <precision>:<points>"))?;
        let (precision, precision_unit) = parse_united(precision_field)?;
        let seconds_per_point = precision * precision_unit.unwrap_or(1);
        let (points, points_unit) = parse_united(points_field)?;
        let points = match points_unit {
            // A united points field is a total duration.
            Some(multiplier) => points * multiplier / seconds_per_point,
            None => points,
        };
        Ok(Self {
            seconds_per_point,
            points,
        })
    }

    /// Total seconds of history this archive holds.
    pub fn retention(&self) -> u64 {
        self.seconds_per_point as u64 * self.points as u64
    }
}

/// The node configuration derived from a schema's archives, handed to the
/// storage engine on node creation.
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct StorageConfig {
    /// `(seconds_per_point, points)` pairs, ascending by precision.
    pub archives: Vec<(u32, u32)>,
    /// Precision of the finest archive.
    pub time_step: u32,
}

impl StorageConfig {
    /// Validate the storage engine's archive preconditions: every coarser
    /// precision must be a multiple of the finest's neighbor, and coarser
    /// archives must retain at least as much history. Violations are
    /// configuration errors and fatal to the caller.
    pub fn new(archives: &[Archive]) -> anyhow::Result<Self> {
        anyhow::ensure!(!archives.is_empty(), "A schema needs at least one archive");
        let mut ordered = archives.to_vec();
        ordered.sort();
        for pair in ordered.windows(2) {
            let (finer, coarser) = (pair[0], pair[1]);
            anyhow::ensure!(
                coarser.seconds_per_point % finer.seconds_per_point == 0,
                "Archive precision {}s does not divide {}s",
                finer.seconds_per_point,
                coarser.seconds_per_point,
            );
            anyhow::ensure!(
                coarser.retention() >= finer.retention(),
                "Archive {}s:{} retains less than the finer {}s:{}",
                coarser.seconds_per_point,
                coarser.points,
                finer.seconds_per_point,
                finer.points,
            );
        }
        Ok(Self {
            time_step: ordered[0].seconds_per_point,
            archives: ordered
                .into_iter()
                .map(|a| (a.seconds_per_point, a.points))
                .collect(),
        })
    }
}

/// An allowlist file backing a `list =` rule. Reloaded whenever the file's
/// mtime advances, checked on each match call.
pub struct ListFile {
    name: String,
    path: PathBuf,
    state: Mutex<ListState>,
}

struct ListState {
    mtime: Option<SystemTime>,
    members: HashSet<String>,
}

impl ListFile {
    pub fn open(lists_dir: &Path, name: &str) -> Self {
        let list = Self {
            name: name.to_owned(),
            path: lists_dir.join(name),
            state: Mutex::new(ListState {
                mtime: None,
                members: HashSet::new(),
            }),
        };
        list.reload_if_stale();
        list
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn reload_if_stale(&self) {
        let Ok(metadata) = fs::metadata(&self.path) else {
            return;
        };
        let Ok(mtime) = metadata.modified() else {
            return;
        };
        let mut state = self.state.lock();
        if state.mtime.is_some_and(|seen| mtime <= seen) {
            return;
        }
        match fs::read(&self.path)
            .map_err(anyhow::Error::from)
            .and_then(|bytes| Ok(serde_json::from_slice::<Vec<String>>(&bytes)?))
        {
            Ok(members) => {
                state.mtime = Some(mtime);
                state.members = members.into_iter().collect();
            },
            Err(e) => {
                tracing::warn!("Failed to reload list file {:?}: {e:#}", self.path);
            },
        }
    }

    pub fn contains(&self, metric: &str) -> bool {
        self.reload_if_stale();
        self.state.lock().members.contains(metric)
    }
}

pub enum SchemaPredicate {
    MatchAll,
    Pattern(Regex),
    List(ListFile),
}

pub struct Schema {
    name: String,
    predicate: SchemaPredicate,
    config: StorageConfig,
}

impl Schema {
    pub fn new(
        name: impl Into<String>,
        predicate: SchemaPredicate,
        archives: Vec<Archive>,
    ) -> anyhow::Result<Self> {
        Ok(Self {
            name: name.into(),
            predicate,
            config: StorageConfig::new(&archives)?,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn matches(&self, metric: &str) -> bool {
        match &self.predicate {
            SchemaPredicate::MatchAll => true,
            SchemaPredicate::Pattern(regex) => regex.is_match(metric),
            SchemaPredicate::List(list) => list.contains(metric),
        }
    }

    pub fn config(&self) -> &StorageConfig {
        &self.config
    }

    /// A short description for node-creation logging.
    pub fn config_string(&self) -> String {
        let archives: Vec<String> = self
            .config
            .archives
            .iter()
            .map(|(spp, points)| format!("{spp}:{points}"))
            .collect();
        format!(
            "{} archives=[{}] timeStep={}",
            self.name,
            archives.join(","),
            self.config.time_step,
        )
    }
}

/// Default retention for unclassified metrics: 7 days of minutely data.
fn default_schema() -> Schema {
    Schema::new(
        "default",
        SchemaPredicate::MatchAll,
        vec![Archive::new(60, 60 * 24 * 7)],
    )
    .expect("the default schema is statically valid")
}

/// An ordered rule table terminated by the always-matching default.
pub struct SchemaTable {
    schemas: Vec<Schema>,
}

impl SchemaTable {
    pub fn new(mut schemas: Vec<Schema>) -> Self {
        schemas.push(default_schema());
        Self { schemas }
    }

    pub fn default_table() -> Self {
        Self::new(Vec::new())
    }

    /// First schema whose predicate matches. Total because of the trailing
    /// default; a miss would mean the table was constructed without it,
    /// which is a programming error worth dying over.
    pub fn match_metric(&self, metric: &str) -> &Schema {
        self.schemas
            .iter()
            .find(|schema| schema.matches(metric))
            .expect("schema table is missing its default rule")
    }

    pub fn len(&self) -> usize {
        self.schemas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.schemas.is_empty()
    }

    /// Load a rule file: INI-style ordered sections, each carrying a
    /// `retentions =` list and exactly one of `match-all =`, `pattern =`,
    /// or `list =`.
    pub fn load(config_path: &Path, lists_dir: &Path) -> anyhow::Result<Self> {
        let contents = fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read schema config {config_path:?}"))?;
        let mut schemas = Vec::new();
        for (section, options) in parse_ini(&contents)? {
            let retentions = options
                .iter()
                .find(|(k, _)| k == "retentions")
                .map(|(_, v)| v.as_str())
                .with_context(|| format!("Schema '{section}' has no retentions"))?;
            let archives = retentions
                .split(',')
                .map(Archive::from_retention_def)
                .collect::<anyhow::Result<Vec<_>>>()?;
            let option = |key: &str| {
                options
                    .iter()
                    .find(|(k, _)| k == key)
                    .map(|(_, v)| v.as_str())
            };
            let predicate = if option("match-all").is_some() {
                SchemaPredicate::MatchAll
            } else if let Some(pattern) = option("pattern") {
                SchemaPredicate::Pattern(
                    Regex::new(pattern)
                        .with_context(|| format!("Schema '{section}' has a bad pattern"))?,
                )
            } else if let Some(list_name) = option("list") {
                SchemaPredicate::List(ListFile::open(lists_dir, list_name))
            } else {
                anyhow::bail!("Schema '{section}' has no pattern or list parameter configured");
            };
            schemas.push(Schema::new(section, predicate, archives)?);
        }
        Ok(Self::new(schemas))
    }
}

/// Minimal ordered-section INI parsing: `[section]` headers and
/// `key = value` lines, `#` and `;` comments.
fn parse_ini(contents: &str) -> anyhow::Result<Vec<(String, Vec<(String, String)>)>> {
    let mut sections: Vec<(String, Vec<(String, String)>)> = Vec::new();
    for (number, raw_line) in contents.lines().enumerate() {
        let line = raw_line.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
            continue;
        }
        if let Some(name) = line.strip_prefix('[').and_then(|l| l.strip_suffix(']')) {
            sections.push((name.trim().to_owned(), Vec::new()));
            continue;
        }
        let (key, value) = line
            .split_once('=')
            .with_context(|| format!("Malformed config line {}: '{raw_line}'", number + 1))?;
        let section = sections
            .last_mut()
            .with_context(|| format!("Config line {} precedes any section", number + 1))?;
        section
            .1
            .push((key.trim().to_owned(), value.trim().to_owned()));
    }
    Ok(sections)
}
