#![allow(clippy::missing_errors_doc)]

use std::path::Path;

use anyhow::{anyhow, Context, Result};
use histok_core::{
    check_required_columns, format_iso_date, normalize_label, parse_iso_date, CalcRow, HistoError,
    JourFact, MailleRow, MoisFact, Periodicity, RawRow, TableNames,
};
use rusqlite::{params, Connection};
use time::Date;
use tracing::{info, warn};

/// How an insert treats pre-existing rows in the target table.
#[derive(Debug, Clone, Copy, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum InsertMode {
    Append,
    Replace,
    Fail,
}

impl InsertMode {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Append => "append",
            Self::Replace => "replace",
            Self::Fail => "fail",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "append" => Some(Self::Append),
            "replace" => Some(Self::Replace),
            "fail" => Some(Self::Fail),
            _ => None,
        }
    }
}

/// Relational adapter for the historization tables. Table names come from
/// configuration, so the schema statements are rendered at migration time
/// rather than kept as a static batch.
pub struct SqliteHistoStore {
    conn: Connection,
    tables: TableNames,
}

impl SqliteHistoStore {
    pub fn open(path: &Path, tables: TableNames) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn, tables })
    }

    pub fn migrate(&self) -> Result<()> {
        let schema = format!(
            "CREATE TABLE IF NOT EXISTS {mailles} (
                id_maille INTEGER PRIMARY KEY,
                label TEXT NOT NULL UNIQUE,
                id_parent INTEGER NOT NULL DEFAULT 0
             );

             CREATE TABLE IF NOT EXISTS {calc} (
                id_calc INTEGER PRIMARY KEY,
                label TEXT NOT NULL UNIQUE,
                id_parent INTEGER NOT NULL DEFAULT 0,
                id_maille_groupe INTEGER NOT NULL DEFAULT 0,
                rapports TEXT NOT NULL DEFAULT '[]'
             );

             CREATE TABLE IF NOT EXISTS {jours} (
                id_calc INTEGER NOT NULL,
                id_maille INTEGER NOT NULL,
                date TEXT NOT NULL,
                valeur REAL NOT NULL
             );
             CREATE INDEX IF NOT EXISTS idx_{jours}_date ON {jours}(date);

             CREATE TABLE IF NOT EXISTS {mois} (
                id_calc INTEGER NOT NULL,
                id_maille INTEGER NOT NULL,
                date TEXT NOT NULL,
                valeur REAL NOT NULL
             );
             CREATE INDEX IF NOT EXISTS idx_{mois}_date ON {mois}(date);",
            mailles = self.tables.mailles,
            calc = self.tables.calc,
            jours = self.tables.jours,
            mois = self.tables.mois,
        );

        self.conn
            .execute_batch(&schema)
            .context("failed to apply historization schema")?;

        Ok(())
    }

    /// Runs an extraction query and maps its result to [`RawRow`]s after
    /// verifying the required column set.
    pub fn read_raw_rows(&self, sql: &str) -> Result<Vec<RawRow>> {
        let mut stmt = self
            .conn
            .prepare(sql)
            .context("failed to prepare extraction query")?;

        let columns: Vec<String> = stmt.column_names().iter().map(ToString::to_string).collect();
        check_required_columns(&columns)?;

        let rows = stmt.query_map([], |row| {
            let indicateur: String = row.get("indicateur")?;
            let indicateur_parent: Option<String> = row.get("indicateur_parent")?;
            let maille: String = row.get("maille")?;
            let maille_parent: Option<String> = row.get("maille_parent")?;
            let valeur: Option<f64> = row.get("valeur")?;
            Ok(RawRow {
                indicateur,
                indicateur_parent: normalize_label(indicateur_parent),
                maille,
                maille_parent: normalize_label(maille_parent),
                valeur,
            })
        })?;

        collect_rows(rows).context("failed to read extraction rows")
    }

    /// Extraction from a `.sql` file on disk.
    pub fn read_report_file(&self, path: &Path) -> Result<Vec<RawRow>> {
        let sql = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read report query {}", path.display()))?;
        self.read_raw_rows(&sql)
            .with_context(|| format!("extraction failed for {}", path.display()))
    }

    /// Runs an explicit monthly query. Expected columns:
    /// `id_calc, id_maille, date, valeur`.
    pub fn read_mois_rows(&self, sql: &str) -> Result<Vec<MoisFact>> {
        let mut stmt = self
            .conn
            .prepare(sql)
            .context("failed to prepare monthly query")?;

        let rows = stmt.query_map([], |row| {
            let date_raw: String = row.get("date")?;
            Ok(MoisFact {
                id_calc: row.get("id_calc")?,
                id_maille: row.get("id_maille")?,
                date: parse_iso_date(&date_raw).map_err(to_sql_error)?,
                valeur: row.get("valeur")?,
            })
        })?;

        collect_rows(rows).context("failed to read monthly rows")
    }

    pub fn read_mois_file(&self, path: &Path) -> Result<Vec<MoisFact>> {
        let sql = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read monthly query {}", path.display()))?;
        self.read_mois_rows(&sql)
            .with_context(|| format!("monthly extraction failed for {}", path.display()))
    }

    /// Full maille dimension snapshot, ordered by surrogate id.
    pub fn maille_rows(&self) -> Result<Vec<MailleRow>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT id_maille, label, id_parent FROM {} ORDER BY id_maille ASC",
            self.tables.mailles
        ))?;

        let rows = stmt.query_map([], |row| {
            Ok(MailleRow {
                id_maille: row.get(0)?,
                label: row.get(1)?,
                id_parent: row.get(2)?,
            })
        })?;

        collect_rows(rows).context("failed to read maille dimension")
    }

    /// Full calc dimension snapshot, ordered by surrogate id. `rapports`
    /// is persisted as a JSON array in a TEXT column.
    pub fn calc_rows(&self) -> Result<Vec<CalcRow>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT id_calc, label, id_parent, id_maille_groupe, rapports
             FROM {} ORDER BY id_calc ASC",
            self.tables.calc
        ))?;

        let rows = stmt.query_map([], |row| {
            let rapports_json: String = row.get(4)?;
            let rapports: Vec<String> = serde_json::from_str(&rapports_json).map_err(|err| {
                rusqlite::Error::FromSqlConversionFailure(
                    4,
                    rusqlite::types::Type::Text,
                    Box::new(std::io::Error::new(
                        std::io::ErrorKind::InvalidData,
                        format!("invalid rapports JSON: {err}"),
                    )),
                )
            })?;
            Ok(CalcRow {
                id_calc: row.get(0)?,
                label: row.get(1)?,
                id_parent: row.get(2)?,
                id_maille_groupe: row.get(3)?,
                rapports,
            })
        })?;

        collect_rows(rows).context("failed to read calc dimension")
    }

    pub fn insert_mailles(&mut self, rows: &[MailleRow], mode: InsertMode) -> Result<()> {
        if rows.is_empty() {
            return Ok(());
        }
        let table = self.tables.mailles.clone();
        self.apply_mode(&table, mode)?;

        let tx = self
            .conn
            .transaction()
            .context("failed to start maille insert transaction")?;
        {
            let mut stmt = tx.prepare(&format!(
                "INSERT INTO {table}(id_maille, label, id_parent) VALUES (?1, ?2, ?3)"
            ))?;
            for row in rows {
                stmt.execute(params![row.id_maille, row.label, row.id_parent])
                    .with_context(|| format!("failed to insert maille {}", row.label))?;
            }
        }
        tx.commit().context("failed to commit maille insert")?;

        info!(table = %table, count = rows.len(), "inserted maille rows");
        Ok(())
    }

    pub fn insert_calcs(&mut self, rows: &[CalcRow], mode: InsertMode) -> Result<()> {
        if rows.is_empty() {
            return Ok(());
        }
        let table = self.tables.calc.clone();
        self.apply_mode(&table, mode)?;

        let tx = self
            .conn
            .transaction()
            .context("failed to start calc insert transaction")?;
        {
            let mut stmt = tx.prepare(&format!(
                "INSERT INTO {table}(id_calc, label, id_parent, id_maille_groupe, rapports)
                 VALUES (?1, ?2, ?3, ?4, ?5)"
            ))?;
            for row in rows {
                let rapports = serde_json::to_string(&row.rapports)
                    .context("failed to serialize rapports list")?;
                stmt.execute(params![
                    row.id_calc,
                    row.label,
                    row.id_parent,
                    row.id_maille_groupe,
                    rapports,
                ])
                .with_context(|| format!("failed to insert calc {}", row.label))?;
            }
        }
        tx.commit().context("failed to commit calc insert")?;

        info!(table = %table, count = rows.len(), "inserted calc rows");
        Ok(())
    }

    pub fn insert_jour_facts(&mut self, rows: &[JourFact], mode: InsertMode) -> Result<()> {
        if rows.is_empty() {
            warn!("no daily facts to insert");
            return Ok(());
        }
        let table = self.tables.jours.clone();
        self.apply_mode(&table, mode)?;

        let tx = self
            .conn
            .transaction()
            .context("failed to start daily fact transaction")?;
        {
            let mut stmt = tx.prepare(&format!(
                "INSERT INTO {table}(id_calc, id_maille, date, valeur) VALUES (?1, ?2, ?3, ?4)"
            ))?;
            for row in rows {
                stmt.execute(params![
                    row.id_calc,
                    row.id_maille,
                    format_iso_date(row.date)?,
                    row.valeur,
                ])
                .context("failed to insert daily fact")?;
            }
        }
        tx.commit().context("failed to commit daily fact insert")?;

        info!(table = %table, count = rows.len(), "inserted daily facts");
        Ok(())
    }

    pub fn insert_mois_facts(&mut self, rows: &[MoisFact], mode: InsertMode) -> Result<()> {
        if rows.is_empty() {
            warn!("no monthly facts to insert");
            return Ok(());
        }
        let table = self.tables.mois.clone();
        self.apply_mode(&table, mode)?;

        let tx = self
            .conn
            .transaction()
            .context("failed to start monthly fact transaction")?;
        {
            let mut stmt = tx.prepare(&format!(
                "INSERT INTO {table}(id_calc, id_maille, date, valeur) VALUES (?1, ?2, ?3, ?4)"
            ))?;
            for row in rows {
                stmt.execute(params![
                    row.id_calc,
                    row.id_maille,
                    format_iso_date(row.date)?,
                    row.valeur,
                ])
                .context("failed to insert monthly fact")?;
            }
        }
        tx.commit().context("failed to commit monthly fact insert")?;

        info!(table = %table, count = rows.len(), "inserted monthly facts");
        Ok(())
    }

    /// Deletes the daily facts of one calendar day. Returns the number of
    /// deleted rows.
    pub fn delete_day(&self, date: Date) -> Result<usize> {
        let deleted = self
            .conn
            .execute(
                &format!("DELETE FROM {} WHERE date = ?1", self.tables.jours),
                params![format_iso_date(date)?],
            )
            .context("failed to delete daily facts")?;
        info!(table = %self.tables.jours, count = deleted, "deleted daily facts");
        Ok(deleted)
    }

    /// Deletes the monthly facts of one calendar month.
    pub fn delete_month(&self, year: i32, month: u8) -> Result<usize> {
        let deleted = self
            .conn
            .execute(
                &format!(
                    "DELETE FROM {} WHERE strftime('%Y-%m', date) = ?1",
                    self.tables.mois
                ),
                params![month_key(year, month)],
            )
            .context("failed to delete monthly facts")?;
        info!(table = %self.tables.mois, count = deleted, "deleted monthly facts");
        Ok(deleted)
    }

    /// Retention cleanup: drops fact rows strictly older than `cutoff`
    /// from the table matching `periodicity`.
    pub fn clean_old(&self, periodicity: Periodicity, cutoff: Date) -> Result<usize> {
        let table = match periodicity {
            Periodicity::Daily => &self.tables.jours,
            Periodicity::Monthly => &self.tables.mois,
        };
        let deleted = self
            .conn
            .execute(
                &format!("DELETE FROM {table} WHERE date < ?1"),
                params![format_iso_date(cutoff)?],
            )
            .context("failed to clean old facts")?;
        if deleted > 0 {
            info!(table = %table, count = deleted, cutoff = %format_iso_date(cutoff)?, "cleaned old facts");
        }
        Ok(deleted)
    }

    /// Daily facts of one calendar month, deterministically ordered.
    pub fn jour_facts_for_month(&self, year: i32, month: u8) -> Result<Vec<JourFact>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT id_calc, id_maille, date, valeur
             FROM {}
             WHERE strftime('%Y-%m', date) = ?1
             ORDER BY id_calc ASC, id_maille ASC, date ASC",
            self.tables.jours
        ))?;

        let rows = stmt.query_map(params![month_key(year, month)], |row| {
            let date_raw: String = row.get(2)?;
            Ok(JourFact {
                id_calc: row.get(0)?,
                id_maille: row.get(1)?,
                date: parse_iso_date(&date_raw).map_err(to_sql_error)?,
                valeur: row.get(3)?,
            })
        })?;

        collect_rows(rows).context("failed to read daily facts for month")
    }

    fn apply_mode(&self, table: &str, mode: InsertMode) -> Result<()> {
        match mode {
            InsertMode::Append => Ok(()),
            InsertMode::Replace => {
                let deleted = self
                    .conn
                    .execute(&format!("DELETE FROM {table}"), [])
                    .with_context(|| format!("failed to truncate {table}"))?;
                if deleted > 0 {
                    warn!(table = %table, count = deleted, "replace mode truncated table");
                }
                Ok(())
            }
            InsertMode::Fail => {
                let count = self.table_row_count(table)?;
                if count > 0 {
                    Err(anyhow!("table {table} already holds {count} rows"))
                } else {
                    Ok(())
                }
            }
        }
    }

    fn table_row_count(&self, table: &str) -> Result<usize> {
        let count = self
            .conn
            .query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| {
                row.get::<_, i64>(0)
            })
            .with_context(|| format!("failed to count rows in {table}"))?;
        usize::try_from(count).with_context(|| format!("invalid row count: {count}"))
    }
}

fn month_key(year: i32, month: u8) -> String {
    format!("{year:04}-{month:02}")
}

#[allow(clippy::needless_pass_by_value)]
fn to_sql_error(err: HistoError) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        0,
        rusqlite::types::Type::Text,
        Box::new(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            err.to_string(),
        )),
    )
}

fn collect_rows<T>(
    rows: rusqlite::MappedRows<'_, impl FnMut(&rusqlite::Row<'_>) -> rusqlite::Result<T>>,
) -> Result<Vec<T>> {
    let mut values = Vec::new();
    for row in rows {
        values.push(row?);
    }
    Ok(values)
}
