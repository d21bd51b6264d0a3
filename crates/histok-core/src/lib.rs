use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::format_description::BorrowedFormatItem;
use time::macros::format_description;
use time::Date;

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum HistoError {
    #[error("shape error: {0}")]
    Shape(String),
    #[error("resolution error: {0}")]
    Resolution(String),
    #[error("configuration error: {0}")]
    Configuration(String),
}

/// Accumulates non-fatal errors across a run. The final process exit code
/// is the number of recorded errors; a single bad report file must not
/// abort the remaining files.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ErrorCollector {
    messages: Vec<String>,
    total: i32,
}

impl ErrorCollector {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, message: impl Into<String>) {
        self.messages.push(message.into());
        self.total += 1;
    }

    #[must_use]
    pub fn count(&self) -> i32 {
        self.total
    }

    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.total == 0
    }

    #[must_use]
    pub fn messages(&self) -> &[String] {
        &self.messages
    }

    /// Renders the recorded messages as a human-readable summary.
    #[must_use]
    pub fn summary(&self) -> String {
        let mut out = format!("total errors: {}", self.total);
        for message in &self.messages {
            out.push_str("\n- ");
            out.push_str(message);
        }
        out
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum Periodicity {
    Daily,
    Monthly,
}

impl Periodicity {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Daily => "daily",
            Self::Monthly => "monthly",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "daily" => Some(Self::Daily),
            "monthly" => Some(Self::Monthly),
            _ => None,
        }
    }
}

/// Decides whether a flag written on `flag_date` still covers `today`.
/// Daily flags match the exact calendar day; monthly flags match the
/// calendar month.
#[must_use]
pub fn flag_satisfied(flag_date: Date, today: Date, periodicity: Periodicity) -> bool {
    match periodicity {
        Periodicity::Daily => flag_date == today,
        Periodicity::Monthly => {
            flag_date.year() == today.year() && flag_date.month() == today.month()
        }
    }
}

const ISO_DATE: &[BorrowedFormatItem<'static>] = format_description!("[year]-[month]-[day]");

/// Parses an ISO-8601 calendar date (`YYYY-MM-DD`).
///
/// # Errors
/// Returns [`HistoError::Shape`] when the input is not a valid date.
pub fn parse_iso_date(value: &str) -> Result<Date, HistoError> {
    Date::parse(value.trim(), ISO_DATE)
        .map_err(|err| HistoError::Shape(format!("invalid ISO date {value:?}: {err}")))
}

/// Formats a calendar date as `YYYY-MM-DD`.
///
/// # Errors
/// Returns [`HistoError::Shape`] when formatting fails.
pub fn format_iso_date(value: Date) -> Result<String, HistoError> {
    value
        .format(ISO_DATE)
        .map_err(|err| HistoError::Shape(format!("failed to format date: {err}")))
}

#[must_use]
pub fn first_of_month(value: Date) -> Date {
    value.replace_day(1).unwrap_or(value)
}

/// First day of the month preceding `value`'s month.
#[must_use]
pub fn previous_month(value: Date) -> Date {
    let first = first_of_month(value);
    match first.previous_day() {
        Some(last_of_previous) => first_of_month(last_of_previous),
        None => first,
    }
}

/// First day of the month `months` calendar months before `value`'s month.
/// Used to compute retention cutoffs.
#[must_use]
pub fn months_before(value: Date, months: u32) -> Date {
    let mut cursor = first_of_month(value);
    for _ in 0..months {
        cursor = previous_month(cursor);
    }
    cursor
}

/// Column set every daily report extraction must provide.
pub const REQUIRED_COLUMNS: [&str; 5] = [
    "indicateur",
    "indicateur_parent",
    "maille",
    "maille_parent",
    "valeur",
];

/// Verifies that an extraction result carries the required column set.
///
/// # Errors
/// Returns [`HistoError::Shape`] listing the missing columns.
pub fn check_required_columns(columns: &[String]) -> Result<(), HistoError> {
    let present: HashSet<&str> = columns.iter().map(String::as_str).collect();
    let missing: Vec<&str> = REQUIRED_COLUMNS
        .iter()
        .copied()
        .filter(|name| !present.contains(name))
        .collect();
    if missing.is_empty() {
        Ok(())
    } else {
        Err(HistoError::Shape(format!(
            "missing required columns: {}",
            missing.join(", ")
        )))
    }
}

/// Treats empty or whitespace-only labels as absent. Report queries
/// routinely emit `''` for "no parent".
#[must_use]
pub fn normalize_label(value: Option<String>) -> Option<String> {
    match value {
        Some(raw) if !raw.trim().is_empty() => Some(raw),
        _ => None,
    }
}

/// One row of a daily report extraction, after column normalization.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RawRow {
    pub indicateur: String,
    pub indicateur_parent: Option<String>,
    pub maille: String,
    pub maille_parent: Option<String>,
    pub valeur: Option<f64>,
}

/// Structural dimension row. `id_parent == 0` marks a root. Rows are
/// append-only: labels are never renamed or deleted by the engine.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MailleRow {
    pub id_maille: i64,
    pub label: String,
    pub id_parent: i64,
}

/// Indicator dimension row, tagged with the reports that reference it and
/// a foreign key into the maille dimension.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CalcRow {
    pub id_calc: i64,
    pub label: String,
    pub id_parent: i64,
    pub id_maille_groupe: i64,
    pub rapports: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JourFact {
    pub id_calc: i64,
    pub id_maille: i64,
    pub date: Date,
    pub valeur: f64,
}

/// Monthly fact: `date` is the first day of the month and `valeur` the
/// mean of the month's daily values for the (calc, maille) pair.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MoisFact {
    pub id_calc: i64,
    pub id_maille: i64,
    pub date: Date,
    pub valeur: f64,
}

/// Resolves new maille labels against the persisted dimension snapshot,
/// returning only the rows to insert.
///
/// Two-pass insertion order: the first pass synthesizes a parent-only row
/// for every referenced parent label not yet known (single-level lookback,
/// no deeper ancestry); the second pass assigns each remaining child its
/// surrogate id, wiring the parent id from the extended label map
/// (0 when still unknown). Ids are seeded at `max(existing) + 1`, so the
/// output never collides with `existing` and parents always precede their
/// children in the output sequence.
#[must_use]
pub fn resolve_mailles(new_rows: &[RawRow], existing: &[MailleRow]) -> Vec<MailleRow> {
    let mut label_to_id: HashMap<String, i64> = existing
        .iter()
        .map(|row| (row.label.clone(), row.id_maille))
        .collect();
    let mut next_id = existing.iter().map(|row| row.id_maille).max().unwrap_or(0);

    // Deduplicate by child label, first occurrence wins, then drop labels
    // that already exist in the dimension.
    let mut seen: HashSet<&str> = HashSet::new();
    let fresh: Vec<&RawRow> = new_rows
        .iter()
        .filter(|row| seen.insert(row.maille.as_str()))
        .filter(|row| !label_to_id.contains_key(&row.maille))
        .collect();

    let mut inserted = Vec::new();

    for row in &fresh {
        if let Some(parent) = row.maille_parent.as_deref() {
            if !label_to_id.contains_key(parent) {
                next_id += 1;
                label_to_id.insert(parent.to_string(), next_id);
                inserted.push(MailleRow {
                    id_maille: next_id,
                    label: parent.to_string(),
                    id_parent: 0,
                });
            }
        }
    }

    for row in &fresh {
        if label_to_id.contains_key(&row.maille) {
            // Already materialized as someone's parent in the first pass.
            continue;
        }
        next_id += 1;
        let id_parent = row
            .maille_parent
            .as_deref()
            .and_then(|parent| label_to_id.get(parent))
            .copied()
            .unwrap_or(0);
        label_to_id.insert(row.maille.clone(), next_id);
        inserted.push(MailleRow {
            id_maille: next_id,
            label: row.maille.clone(),
            id_parent,
        });
    }

    inserted
}

/// Resolves new indicator labels against the persisted calc snapshot.
///
/// Same two-pass scheme as [`resolve_mailles`], with two additions: every
/// produced row carries the deduplicated `rapports` list, and
/// `id_maille_groupe` is looked up in the already-resolved maille
/// dimension from the referencing row's `maille_parent` label (0 when
/// unknown).
#[must_use]
pub fn resolve_calcs(
    new_rows: &[RawRow],
    existing: &[CalcRow],
    mailles: &[MailleRow],
    rapports: &[String],
) -> Vec<CalcRow> {
    let mut label_to_id: HashMap<String, i64> = existing
        .iter()
        .map(|row| (row.label.clone(), row.id_calc))
        .collect();
    let maille_label_to_id: HashMap<&str, i64> = mailles
        .iter()
        .map(|row| (row.label.as_str(), row.id_maille))
        .collect();
    let mut next_id = existing.iter().map(|row| row.id_calc).max().unwrap_or(0);

    let mut distinct_rapports: Vec<String> = Vec::new();
    for name in rapports {
        if !distinct_rapports.contains(name) {
            distinct_rapports.push(name.clone());
        }
    }

    let mut seen: HashSet<&str> = HashSet::new();
    let fresh: Vec<&RawRow> = new_rows
        .iter()
        .filter(|row| seen.insert(row.indicateur.as_str()))
        .filter(|row| !label_to_id.contains_key(&row.indicateur))
        .collect();

    let mut inserted = Vec::new();

    let maille_group = |label: Option<&str>| {
        label
            .and_then(|name| maille_label_to_id.get(name))
            .copied()
            .unwrap_or(0)
    };

    for row in &fresh {
        if let Some(parent) = row.indicateur_parent.as_deref() {
            if !label_to_id.contains_key(parent) {
                next_id += 1;
                label_to_id.insert(parent.to_string(), next_id);
                inserted.push(CalcRow {
                    id_calc: next_id,
                    label: parent.to_string(),
                    id_parent: 0,
                    id_maille_groupe: maille_group(row.maille_parent.as_deref()),
                    rapports: distinct_rapports.clone(),
                });
            }
        }
    }

    for row in &fresh {
        if label_to_id.contains_key(&row.indicateur) {
            continue;
        }
        next_id += 1;
        let id_parent = row
            .indicateur_parent
            .as_deref()
            .and_then(|parent| label_to_id.get(parent))
            .copied()
            .unwrap_or(0);
        label_to_id.insert(row.indicateur.clone(), next_id);
        inserted.push(CalcRow {
            id_calc: next_id,
            label: row.indicateur.clone(),
            id_parent,
            id_maille_groupe: maille_group(row.maille_parent.as_deref()),
            rapports: distinct_rapports.clone(),
        });
    }

    inserted
}

/// Joins extraction rows against the resolved dimensions to produce
/// insert-ready daily facts.
///
/// Dimension snapshots are deduplicated by label (first occurrence wins)
/// to guard against accidental duplicate rows. Extraction rows that fail
/// to resolve an id on either axis, or that carry no value, are dropped.
/// No value-range validation is performed.
#[must_use]
pub fn prepare_jour_facts(
    raw: &[RawRow],
    calcs: &[CalcRow],
    mailles: &[MailleRow],
    date: Date,
) -> Vec<JourFact> {
    let mut calc_ids: HashMap<&str, i64> = HashMap::new();
    for row in calcs {
        calc_ids.entry(row.label.as_str()).or_insert(row.id_calc);
    }
    let mut maille_ids: HashMap<&str, i64> = HashMap::new();
    for row in mailles {
        maille_ids.entry(row.label.as_str()).or_insert(row.id_maille);
    }

    raw.iter()
        .filter_map(|row| {
            let id_calc = *calc_ids.get(row.indicateur.as_str())?;
            let id_maille = *maille_ids.get(row.maille.as_str())?;
            let valeur = row.valeur?;
            Some(JourFact {
                id_calc,
                id_maille,
                date,
                valeur,
            })
        })
        .collect()
}

/// Synthesizes monthly facts from daily facts when a report directory has
/// no explicit monthly query.
///
/// Daily facts are restricted to `month` (any day within the same
/// calendar month) and to calcs whose `rapports` contains `report`, then
/// grouped by `(id_calc, id_maille)` and averaged. Output is
/// deterministically ordered by `(id_calc, id_maille)` and dated with the
/// first day of the month.
#[must_use]
pub fn aggregate_monthly(
    facts: &[JourFact],
    calcs: &[CalcRow],
    report: &str,
    month: Date,
) -> Vec<MoisFact> {
    let member_ids: HashSet<i64> = calcs
        .iter()
        .filter(|row| row.rapports.iter().any(|name| name == report))
        .map(|row| row.id_calc)
        .collect();
    let month_start = first_of_month(month);

    let mut groups: BTreeMap<(i64, i64), (f64, u32)> = BTreeMap::new();
    for fact in facts {
        if fact.date.year() != month_start.year() || fact.date.month() != month_start.month() {
            continue;
        }
        if !member_ids.contains(&fact.id_calc) {
            continue;
        }
        let entry = groups.entry((fact.id_calc, fact.id_maille)).or_insert((0.0, 0));
        entry.0 += fact.valeur;
        entry.1 += 1;
    }

    groups
        .into_iter()
        .map(|((id_calc, id_maille), (sum, count))| MoisFact {
            id_calc,
            id_maille,
            date: month_start,
            valeur: sum / f64::from(count),
        })
        .collect()
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TableNames {
    pub mailles: String,
    pub calc: String,
    pub jours: String,
    pub mois: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct Retention {
    pub daily_retention_months: u32,
    pub monthly_retention_months: u32,
}

/// Process configuration, constructed once at startup and passed by
/// reference into every component. No ambient lookup.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HistoConfig {
    pub database_path: PathBuf,
    pub sql_path: PathBuf,
    pub flag_file_daily: PathBuf,
    pub flag_file_monthly: PathBuf,
    #[serde(default = "default_monthly_query")]
    pub monthly_query: String,
    pub tables: TableNames,
    pub retention: Retention,
}

fn default_monthly_query() -> String {
    "indic_mois_kpi.sql".to_string()
}

impl HistoConfig {
    #[must_use]
    pub fn example() -> Self {
        Self {
            database_path: PathBuf::from("./histok.sqlite3"),
            sql_path: PathBuf::from("./sql"),
            flag_file_daily: PathBuf::from("./JOUR.flag"),
            flag_file_monthly: PathBuf::from("./MOIS.flag"),
            monthly_query: default_monthly_query(),
            tables: TableNames {
                mailles: "hok_mailles".to_string(),
                calc: "hok_calc".to_string(),
                jours: "hok_jours".to_string(),
                mois: "hok_mois".to_string(),
            },
            retention: Retention {
                daily_retention_months: 13,
                monthly_retention_months: 36,
            },
        }
    }

    /// Validates path and retention invariants.
    ///
    /// # Errors
    /// Returns [`HistoError::Configuration`] when a field is empty or a
    /// retention window is zero.
    pub fn validate(&self) -> Result<(), HistoError> {
        for (name, value) in [
            ("tables.mailles", &self.tables.mailles),
            ("tables.calc", &self.tables.calc),
            ("tables.jours", &self.tables.jours),
            ("tables.mois", &self.tables.mois),
            ("monthly_query", &self.monthly_query),
        ] {
            if value.trim().is_empty() {
                return Err(HistoError::Configuration(format!(
                    "{name} MUST be non-empty"
                )));
            }
        }

        if self.sql_path.as_os_str().is_empty() {
            return Err(HistoError::Configuration(
                "sql_path MUST be non-empty".to_string(),
            ));
        }

        if self.retention.daily_retention_months == 0
            || self.retention.monthly_retention_months == 0
        {
            return Err(HistoError::Configuration(
                "retention windows MUST be >= 1 month".to_string(),
            ));
        }

        Ok(())
    }

    /// Decodes and validates a configuration from JSON.
    ///
    /// # Errors
    /// Returns [`HistoError::Configuration`] when decoding fails or the
    /// decoded values violate constraints.
    pub fn from_json(value: &Value) -> Result<Self, HistoError> {
        let config: Self = serde_json::from_value(value.clone()).map_err(|err| {
            HistoError::Configuration(format!("invalid configuration JSON: {err}"))
        })?;
        config.validate()?;
        Ok(config)
    }
}

#[must_use]
pub fn today_utc() -> Date {
    time::OffsetDateTime::now_utc().date()
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::date;

    fn must<T, E: std::fmt::Display>(result: Result<T, E>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("expected Ok(..), got error: {err}"),
        }
    }

    fn raw(indicateur: &str, maille: &str, valeur: f64) -> RawRow {
        RawRow {
            indicateur: indicateur.to_string(),
            indicateur_parent: None,
            maille: maille.to_string(),
            maille_parent: None,
            valeur: Some(valeur),
        }
    }

    fn raw_maille(maille: &str, parent: Option<&str>) -> RawRow {
        RawRow {
            indicateur: String::new(),
            indicateur_parent: None,
            maille: maille.to_string(),
            maille_parent: parent.map(str::to_string),
            valeur: None,
        }
    }

    fn raw_calc(indicateur: &str, parent: Option<&str>, maille_parent: Option<&str>) -> RawRow {
        RawRow {
            indicateur: indicateur.to_string(),
            indicateur_parent: parent.map(str::to_string),
            maille: String::new(),
            maille_parent: maille_parent.map(str::to_string),
            valeur: None,
        }
    }

    #[test]
    fn resolver_synthesizes_root_before_child() {
        let new_rows = vec![raw_maille("child", Some("root")), raw_maille("root", None)];
        let inserted = resolve_mailles(&new_rows, &[]);

        assert_eq!(
            inserted,
            vec![
                MailleRow {
                    id_maille: 1,
                    label: "root".to_string(),
                    id_parent: 0,
                },
                MailleRow {
                    id_maille: 2,
                    label: "child".to_string(),
                    id_parent: 1,
                },
            ]
        );
    }

    #[test]
    fn resolver_is_idempotent() {
        let new_rows = vec![
            raw_maille("site-a", Some("region")),
            raw_maille("site-b", Some("region")),
        ];
        let first = resolve_mailles(&new_rows, &[]);
        assert_eq!(first.len(), 3);

        let second = resolve_mailles(&new_rows, &first);
        assert!(second.is_empty());
    }

    #[test]
    fn resolver_ids_are_unique_and_monotonic() {
        let existing = vec![
            MailleRow {
                id_maille: 7,
                label: "old".to_string(),
                id_parent: 0,
            },
            MailleRow {
                id_maille: 3,
                label: "older".to_string(),
                id_parent: 0,
            },
        ];
        let new_rows = vec![
            raw_maille("fresh", Some("old")),
            raw_maille("newer", Some("unseen")),
        ];
        let inserted = resolve_mailles(&new_rows, &existing);

        let mut ids: HashSet<i64> = existing.iter().map(|row| row.id_maille).collect();
        for row in &inserted {
            assert!(row.id_maille > 7, "new ids must exceed max existing id");
            assert!(ids.insert(row.id_maille), "duplicate surrogate id");
        }
    }

    #[test]
    fn resolver_parent_before_child_holds_for_all_outputs() {
        let new_rows = vec![
            raw_maille("leaf-1", Some("mid")),
            raw_maille("mid", Some("top")),
            raw_maille("leaf-2", Some("mid")),
        ];
        let inserted = resolve_mailles(&new_rows, &[]);

        let mut known: HashSet<i64> = HashSet::new();
        for row in &inserted {
            if row.id_parent != 0 {
                assert!(
                    known.contains(&row.id_parent),
                    "parent {} of {} not yet emitted",
                    row.id_parent,
                    row.label
                );
            }
            known.insert(row.id_maille);
        }
    }

    #[test]
    fn resolver_dedupes_new_rows_first_occurrence_wins() {
        let new_rows = vec![
            raw_maille("dup", Some("first-parent")),
            raw_maille("dup", Some("second-parent")),
        ];
        let inserted = resolve_mailles(&new_rows, &[]);

        // first-parent synthesized, then dup wired to it; second-parent ignored
        assert_eq!(inserted.len(), 2);
        assert_eq!(inserted[0].label, "first-parent");
        assert_eq!(inserted[1].label, "dup");
        assert_eq!(inserted[1].id_parent, inserted[0].id_maille);
    }

    #[test]
    fn resolver_empty_input_is_noop() {
        let existing = vec![MailleRow {
            id_maille: 1,
            label: "a".to_string(),
            id_parent: 0,
        }];
        assert!(resolve_mailles(&[], &existing).is_empty());
    }

    #[test]
    fn calc_resolver_wires_maille_group_and_rapports() {
        let mailles = vec![
            MailleRow {
                id_maille: 1,
                label: "region".to_string(),
                id_parent: 0,
            },
        ];
        let new_rows = vec![raw_calc("cpu_load", Some("infra"), Some("region"))];
        let rapports = vec!["R035".to_string(), "R035".to_string()];
        let inserted = resolve_calcs(&new_rows, &[], &mailles, &rapports);

        assert_eq!(inserted.len(), 2);
        assert_eq!(inserted[0].label, "infra");
        assert_eq!(inserted[0].id_parent, 0);
        assert_eq!(inserted[0].id_maille_groupe, 1);
        assert_eq!(inserted[1].label, "cpu_load");
        assert_eq!(inserted[1].id_parent, inserted[0].id_calc);
        assert_eq!(inserted[1].id_maille_groupe, 1);
        // duplicated report names collapse
        assert_eq!(inserted[1].rapports, vec!["R035".to_string()]);
    }

    #[test]
    fn calc_resolver_unknown_maille_defaults_to_zero() {
        let inserted = resolve_calcs(
            &[raw_calc("kpi", None, Some("nowhere"))],
            &[],
            &[],
            &["R001".to_string()],
        );
        assert_eq!(inserted.len(), 1);
        assert_eq!(inserted[0].id_maille_groupe, 0);
    }

    #[test]
    fn jour_facts_join_on_both_axes() {
        let calcs = vec![CalcRow {
            id_calc: 4,
            label: "cpu".to_string(),
            id_parent: 0,
            id_maille_groupe: 0,
            rapports: vec!["R001".to_string()],
        }];
        let mailles = vec![MailleRow {
            id_maille: 9,
            label: "paris".to_string(),
            id_parent: 0,
        }];
        let day = date!(2024 - 03 - 05);

        let rows = vec![
            raw("cpu", "paris", 0.75),
            raw("cpu", "unknown-site", 1.0),
            raw("unknown-kpi", "paris", 1.0),
            RawRow {
                valeur: None,
                ..raw("cpu", "paris", 0.0)
            },
        ];
        let facts = prepare_jour_facts(&rows, &calcs, &mailles, day);

        assert_eq!(
            facts,
            vec![JourFact {
                id_calc: 4,
                id_maille: 9,
                date: day,
                valeur: 0.75,
            }]
        );
    }

    #[test]
    fn jour_facts_duplicate_dimension_rows_first_wins() {
        let calcs = vec![
            CalcRow {
                id_calc: 1,
                label: "cpu".to_string(),
                id_parent: 0,
                id_maille_groupe: 0,
                rapports: vec![],
            },
            CalcRow {
                id_calc: 2,
                label: "cpu".to_string(),
                id_parent: 0,
                id_maille_groupe: 0,
                rapports: vec![],
            },
        ];
        let mailles = vec![MailleRow {
            id_maille: 1,
            label: "site".to_string(),
            id_parent: 0,
        }];
        let facts = prepare_jour_facts(
            &[raw("cpu", "site", 5.0)],
            &calcs,
            &mailles,
            date!(2024 - 01 - 01),
        );
        assert_eq!(facts.len(), 1);
        assert_eq!(facts[0].id_calc, 1);
    }

    #[test]
    fn monthly_aggregation_averages_the_month() {
        let calcs = vec![CalcRow {
            id_calc: 1,
            label: "cpu".to_string(),
            id_parent: 0,
            id_maille_groupe: 0,
            rapports: vec!["R035".to_string()],
        }];
        let facts = vec![
            JourFact {
                id_calc: 1,
                id_maille: 1,
                date: date!(2024 - 02 - 01),
                valeur: 10.0,
            },
            JourFact {
                id_calc: 1,
                id_maille: 1,
                date: date!(2024 - 02 - 15),
                valeur: 20.0,
            },
            // outside the target month
            JourFact {
                id_calc: 1,
                id_maille: 1,
                date: date!(2024 - 03 - 01),
                valeur: 99.0,
            },
        ];

        let monthly = aggregate_monthly(&facts, &calcs, "R035", date!(2024 - 02 - 10));
        assert_eq!(
            monthly,
            vec![MoisFact {
                id_calc: 1,
                id_maille: 1,
                date: date!(2024 - 02 - 01),
                valeur: 15.0,
            }]
        );
    }

    #[test]
    fn monthly_aggregation_respects_report_membership() {
        let calcs = vec![
            CalcRow {
                id_calc: 1,
                label: "mine".to_string(),
                id_parent: 0,
                id_maille_groupe: 0,
                rapports: vec!["R035".to_string()],
            },
            CalcRow {
                id_calc: 2,
                label: "theirs".to_string(),
                id_parent: 0,
                id_maille_groupe: 0,
                rapports: vec!["R099".to_string()],
            },
        ];
        let facts = vec![
            JourFact {
                id_calc: 1,
                id_maille: 1,
                date: date!(2024 - 02 - 01),
                valeur: 1.0,
            },
            JourFact {
                id_calc: 2,
                id_maille: 1,
                date: date!(2024 - 02 - 01),
                valeur: 2.0,
            },
        ];

        let monthly = aggregate_monthly(&facts, &calcs, "R035", date!(2024 - 02 - 01));
        assert_eq!(monthly.len(), 1);
        assert_eq!(monthly[0].id_calc, 1);
    }

    #[test]
    fn daily_flag_matches_exact_day_only() {
        let satisfied_on = date!(2024 - 03 - 05);
        assert!(flag_satisfied(satisfied_on, satisfied_on, Periodicity::Daily));
        assert!(!flag_satisfied(
            satisfied_on,
            date!(2024 - 03 - 06),
            Periodicity::Daily
        ));
    }

    #[test]
    fn monthly_flag_matches_whole_calendar_month() {
        let satisfied_on = date!(2024 - 03 - 05);
        assert!(flag_satisfied(
            satisfied_on,
            date!(2024 - 03 - 31),
            Periodicity::Monthly
        ));
        assert!(!flag_satisfied(
            satisfied_on,
            date!(2024 - 04 - 01),
            Periodicity::Monthly
        ));
        assert!(!flag_satisfied(
            satisfied_on,
            date!(2025 - 03 - 05),
            Periodicity::Monthly
        ));
    }

    #[test]
    fn previous_month_crosses_year_boundary() {
        assert_eq!(previous_month(date!(2024 - 01 - 15)), date!(2023 - 12 - 01));
        assert_eq!(previous_month(date!(2024 - 03 - 01)), date!(2024 - 02 - 01));
    }

    #[test]
    fn months_before_walks_back_whole_months() {
        assert_eq!(
            months_before(date!(2024 - 03 - 15), 13),
            date!(2023 - 02 - 01)
        );
    }

    #[test]
    fn iso_date_round_trip() {
        let parsed = must(parse_iso_date("2024-02-29"));
        assert_eq!(parsed, date!(2024 - 02 - 29));
        assert_eq!(must(format_iso_date(parsed)), "2024-02-29");
        assert!(parse_iso_date("2024-02-30").is_err());
    }

    #[test]
    fn required_columns_check_reports_missing_names() {
        let columns: Vec<String> = vec!["indicateur".to_string(), "valeur".to_string()];
        let err = check_required_columns(&columns);
        match err {
            Err(HistoError::Shape(message)) => {
                assert!(message.contains("maille"));
                assert!(message.contains("indicateur_parent"));
            }
            other => panic!("expected shape error, got {other:?}"),
        }

        let all: Vec<String> = REQUIRED_COLUMNS.iter().map(|s| (*s).to_string()).collect();
        assert!(check_required_columns(&all).is_ok());
    }

    #[test]
    fn normalize_label_drops_blank_parents() {
        assert_eq!(normalize_label(Some("  ".to_string())), None);
        assert_eq!(normalize_label(Some(String::new())), None);
        assert_eq!(
            normalize_label(Some("region".to_string())),
            Some("region".to_string())
        );
        assert_eq!(normalize_label(None), None);
    }

    #[test]
    fn config_validation_rejects_zero_retention() {
        let mut config = HistoConfig::example();
        assert!(config.validate().is_ok());

        config.retention.daily_retention_months = 0;
        assert!(matches!(
            config.validate(),
            Err(HistoError::Configuration(_))
        ));
    }

    #[test]
    fn config_from_json_round_trip() {
        let config = HistoConfig::example();
        let value = must(serde_json::to_value(&config));
        let decoded = must(HistoConfig::from_json(&value));
        assert_eq!(decoded, config);
    }

    #[test]
    fn error_collector_accumulates_and_summarizes() {
        let mut collector = ErrorCollector::new();
        assert!(collector.is_clean());

        collector.record("first failure");
        collector.record("second failure".to_string());

        assert_eq!(collector.count(), 2);
        let summary = collector.summary();
        assert!(summary.starts_with("total errors: 2"));
        assert!(summary.contains("- first failure"));
    }
}
