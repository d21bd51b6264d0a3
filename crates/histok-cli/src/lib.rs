//! Command surface and orchestration for the historization pipeline.
//!
//! The binary stays thin: [`run_cli`] loads the configuration, opens the
//! store, and drives a [`Pipeline`]. Every action returns the accumulated
//! error count, which becomes the process exit code.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use histok_core::{
    aggregate_monthly, flag_satisfied, format_iso_date, months_before, parse_iso_date,
    prepare_jour_facts, previous_month, resolve_calcs, resolve_mailles, today_utc, ErrorCollector,
    HistoConfig, Periodicity,
};
use histok_store_sqlite::{InsertMode, SqliteHistoStore};
use time::Date;
use tracing::{info, warn};

#[derive(Debug, Parser)]
#[command(name = "histok")]
#[command(about = "Incremental KPI historization pipeline")]
pub struct Cli {
    #[arg(long, default_value = "./config.json")]
    pub config: PathBuf,

    /// Overrides the database path from the configuration file.
    #[arg(long)]
    pub db: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Daily run, skipped when the daily flag is already satisfied.
    Run(DateArg),
    /// Forced recompute of one day: delete its facts, clear flags, rerun.
    Jour(DateArg),
    /// Forced recompute of yesterday.
    Veille,
    /// Delete one day's facts and clear flags without recomputing.
    Sup(DateArg),
    /// Monthly historization for the previous calendar month.
    Mois,
    /// Process a single report directory, ignoring the daily flag.
    Rapport(RapportArgs),
}

#[derive(Debug, Args)]
pub struct DateArg {
    /// ISO-8601 date (`YYYY-MM-DD`), defaults to today.
    #[arg(long)]
    pub date: Option<String>,
}

#[derive(Debug, Args)]
pub struct RapportArgs {
    /// Report directory holding the `.sql` extraction files.
    pub dir: PathBuf,
}

/// On-disk completion flags. A flag file holds a single ISO-8601 date;
/// the flag path for an input file is the input path with its extension
/// replaced by `flag`.
#[derive(Debug, Default, Clone, Copy)]
pub struct FlagStore;

impl FlagStore {
    /// True when the flag exists and its date satisfies the periodicity
    /// predicate for `today`.
    pub fn check(self, path: &Path, periodicity: Periodicity, today: Date) -> Result<bool> {
        if !path.exists() {
            return Ok(false);
        }
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read flag {}", path.display()))?;
        let flag_date = parse_iso_date(content.trim())
            .with_context(|| format!("invalid flag content in {}", path.display()))?;
        Ok(flag_satisfied(flag_date, today, periodicity))
    }

    /// Writes today's date, overwriting any previous content.
    pub fn create(self, path: &Path, today: Date) -> Result<()> {
        std::fs::write(path, format_iso_date(today)?)
            .with_context(|| format!("failed to write flag {}", path.display()))?;
        info!(flag = %path.display(), "flag created");
        Ok(())
    }

    /// No-op when the flag is absent.
    pub fn remove(self, path: &Path) -> Result<()> {
        if path.exists() {
            std::fs::remove_file(path)
                .with_context(|| format!("failed to remove flag {}", path.display()))?;
            info!(flag = %path.display(), "flag removed");
        }
        Ok(())
    }

    /// Deletes every `*.flag` file under `root`, recursively. Returns the
    /// number of removed flags.
    pub fn remove_all(self, root: &Path) -> Result<usize> {
        let mut removed = 0;
        for entry in walkdir::WalkDir::new(root) {
            let entry = entry.with_context(|| format!("failed to walk {}", root.display()))?;
            let path = entry.path();
            if path.is_file() && path.extension().is_some_and(|ext| ext == "flag") {
                std::fs::remove_file(path)
                    .with_context(|| format!("failed to remove flag {}", path.display()))?;
                removed += 1;
            }
        }
        if removed > 0 {
            info!(root = %root.display(), count = removed, "per-file flags removed");
        }
        Ok(removed)
    }
}

#[must_use]
pub fn flag_path(path: &Path) -> PathBuf {
    path.with_extension("flag")
}

/// Drives one invocation of the pipeline. Errors are accumulated, never
/// fatal; the action methods return the running error count.
pub struct Pipeline<'a> {
    config: &'a HistoConfig,
    store: SqliteHistoStore,
    flags: FlagStore,
    collector: ErrorCollector,
    today: Date,
}

impl<'a> Pipeline<'a> {
    #[must_use]
    pub fn new(config: &'a HistoConfig, store: SqliteHistoStore, today: Date) -> Self {
        Self {
            config,
            store,
            flags: FlagStore,
            collector: ErrorCollector::new(),
            today,
        }
    }

    #[must_use]
    pub fn collector(&self) -> &ErrorCollector {
        &self.collector
    }

    /// Daily run over every report directory. Without a date override the
    /// run is skipped entirely when the daily flag is satisfied, and a
    /// clean pass ends by creating the daily flag.
    pub fn run_default(&mut self, date: Option<Date>) -> i32 {
        if date.is_none() {
            match self
                .flags
                .check(&self.config.flag_file_daily, Periodicity::Daily, self.today)
            {
                Ok(true) => {
                    info!("daily flag satisfied, nothing to do");
                    return self.collector.count();
                }
                Ok(false) => {}
                Err(err) => self.collector.record(format!("{err:#}")),
            }
        }

        if let Err(err) = self.store.clean_old(
            Periodicity::Daily,
            months_before(self.today, self.config.retention.daily_retention_months),
        ) {
            self.collector.record(format!("{err:#}"));
        }

        for dir in self.report_dirs() {
            self.process_report_dir(&dir, date);
        }

        if date.is_none() && self.collector.is_clean() {
            if let Err(err) = self.flags.create(&self.config.flag_file_daily, self.today) {
                self.collector.record(format!("{err:#}"));
            }
        }

        self.collector.count()
    }

    /// Forced recompute of one day: facts deleted, daily and per-file
    /// flags cleared, then a full dated run.
    pub fn jour(&mut self, date: Option<Date>) -> i32 {
        let target = date.unwrap_or(self.today);
        info!(date = %target, "forcing daily recompute");

        if let Err(err) = self.store.delete_day(target) {
            self.collector.record(format!("{err:#}"));
        }
        if let Err(err) = self.flags.remove(&self.config.flag_file_daily) {
            self.collector.record(format!("{err:#}"));
        }
        if let Err(err) = self.flags.remove_all(&self.config.sql_path) {
            self.collector.record(format!("{err:#}"));
        }

        self.run_default(Some(target))
    }

    /// Forced recompute of yesterday.
    pub fn veille(&mut self) -> i32 {
        let yesterday = self.today.previous_day().unwrap_or(self.today);
        self.jour(Some(yesterday))
    }

    /// Deletes one day's facts and clears the flags without recomputing.
    pub fn sup(&mut self, date: Option<Date>) -> i32 {
        let target = date.unwrap_or(self.today);
        info!(date = %target, "deleting daily facts without recompute");

        if let Err(err) = self.store.delete_day(target) {
            self.collector.record(format!("{err:#}"));
        }
        if let Err(err) = self.flags.remove(&self.config.flag_file_daily) {
            self.collector.record(format!("{err:#}"));
        }
        if let Err(err) = self.flags.remove_all(&self.config.sql_path) {
            self.collector.record(format!("{err:#}"));
        }

        self.collector.count()
    }

    /// Monthly historization for the previous calendar month: the month's
    /// rows are replaced, retention applied, then each report directory
    /// contributes either its explicit monthly query or a synthesized
    /// aggregation of its daily facts.
    pub fn mois(&mut self) -> i32 {
        let target = previous_month(self.today);
        let month = u8::from(target.month());
        info!(month = %format!("{:04}-{:02}", target.year(), month), "monthly historization");

        if let Err(err) = self.store.delete_month(target.year(), month) {
            self.collector.record(format!("{err:#}"));
        }
        if let Err(err) = self.flags.remove(&self.config.flag_file_monthly) {
            self.collector.record(format!("{err:#}"));
        }
        if let Err(err) = self.store.clean_old(
            Periodicity::Monthly,
            months_before(self.today, self.config.retention.monthly_retention_months),
        ) {
            self.collector.record(format!("{err:#}"));
        }

        for dir in self.report_dirs() {
            if let Err(err) = self.process_monthly_dir(&dir, target) {
                self.collector.record(format!("{err:#}"));
            }
        }

        if self.collector.is_clean() {
            if let Err(err) = self.flags.create(&self.config.flag_file_monthly, self.today) {
                self.collector.record(format!("{err:#}"));
            }
        }

        self.collector.count()
    }

    /// Runs the per-file pipeline for exactly one report directory,
    /// ignoring the daily flag. Retention cleanup still applies.
    pub fn rapport(&mut self, dir: &Path) -> i32 {
        if let Err(err) = self.store.clean_old(
            Periodicity::Daily,
            months_before(self.today, self.config.retention.daily_retention_months),
        ) {
            self.collector.record(format!("{err:#}"));
        }

        self.process_report_dir(dir, None);
        self.collector.count()
    }

    fn process_report_dir(&mut self, dir: &Path, date: Option<Date>) {
        let report = report_name(dir);
        info!(report = %report, dir = %dir.display(), "processing report directory");

        for file in self.sql_files(dir) {
            let flag = flag_path(&file);
            match self.flags.check(&flag, Periodicity::Daily, self.today) {
                Ok(true) => {
                    warn!(file = %file.display(), "already processed today, skipping");
                    continue;
                }
                Ok(false) => {}
                Err(err) => {
                    self.collector.record(format!("{err:#}"));
                    continue;
                }
            }

            match self.process_report_file(&file, &report, date) {
                Ok(true) => {
                    if let Err(err) = self.flags.create(&flag, self.today) {
                        self.collector.record(format!("{err:#}"));
                    }
                }
                Ok(false) => {}
                Err(err) => {
                    self.collector
                        .record(format!("{}: {err:#}", file.display()));
                }
            }
        }

        self.process_monthly_if_due(dir);
    }

    /// Monthly work inside a scan is gated by the global monthly flag,
    /// never a per-file flag: the first directory due performs it and
    /// flags the month, so it runs at most once per run.
    fn process_monthly_if_due(&mut self, dir: &Path) {
        match self.flags.check(
            &self.config.flag_file_monthly,
            Periodicity::Monthly,
            self.today,
        ) {
            Ok(true) => {}
            Ok(false) => {
                let month = previous_month(self.today);
                match self.process_monthly_dir(dir, month) {
                    Ok(()) => {
                        if let Err(err) =
                            self.flags.create(&self.config.flag_file_monthly, self.today)
                        {
                            self.collector.record(format!("{err:#}"));
                        }
                    }
                    Err(err) => self.collector.record(format!("{err:#}")),
                }
            }
            Err(err) => self.collector.record(format!("{err:#}")),
        }
    }

    /// Returns whether the file was historized. An empty extraction
    /// inserts nothing and reports `false` so the caller leaves the file
    /// unflagged and a later run can retry it.
    fn process_report_file(&mut self, file: &Path, report: &str, date: Option<Date>) -> Result<bool> {
        let raw = self.store.read_report_file(file)?;
        if raw.is_empty() {
            warn!(file = %file.display(), "extraction returned no rows, leaving file unflagged");
            return Ok(false);
        }

        let mailles = resolve_mailles(&raw, &self.store.maille_rows()?);
        self.store.insert_mailles(&mailles, InsertMode::Append)?;

        let maille_snapshot = self.store.maille_rows()?;
        let rapports = vec![report.to_string()];
        let calcs = resolve_calcs(&raw, &self.store.calc_rows()?, &maille_snapshot, &rapports);
        self.store.insert_calcs(&calcs, InsertMode::Append)?;

        let calc_snapshot = self.store.calc_rows()?;
        let target = date.unwrap_or(self.today);
        let facts = prepare_jour_facts(&raw, &calc_snapshot, &maille_snapshot, target);
        self.store.insert_jour_facts(&facts, InsertMode::Append)?;

        info!(
            file = %file.display(),
            mailles = mailles.len(),
            calcs = calcs.len(),
            facts = facts.len(),
            "report file historized"
        );
        Ok(true)
    }

    fn process_monthly_dir(&mut self, dir: &Path, month: Date) -> Result<()> {
        let report = report_name(dir);
        let monthly_file = dir.join(&self.config.monthly_query);

        let rows = if monthly_file.is_file() {
            self.store.read_mois_file(&monthly_file)?
        } else {
            let facts = self
                .store
                .jour_facts_for_month(month.year(), u8::from(month.month()))?;
            let calcs = self.store.calc_rows()?;
            aggregate_monthly(&facts, &calcs, &report, month)
        };

        info!(report = %report, rows = rows.len(), "monthly rows prepared");
        self.store.insert_mois_facts(&rows, InsertMode::Append)
    }

    /// Report subdirectories of the configured reports root, sorted.
    fn report_dirs(&mut self) -> Vec<PathBuf> {
        let mut dirs = Vec::new();
        let entries = match std::fs::read_dir(&self.config.sql_path) {
            Ok(entries) => entries,
            Err(err) => {
                self.collector.record(format!(
                    "failed to scan reports root {}: {err}",
                    self.config.sql_path.display()
                ));
                return dirs;
            }
        };
        for entry in entries {
            match entry {
                Ok(entry) if entry.path().is_dir() => dirs.push(entry.path()),
                Ok(_) => {}
                Err(err) => self.collector.record(format!(
                    "failed to scan reports root {}: {err}",
                    self.config.sql_path.display()
                )),
            }
        }
        dirs.sort();
        dirs
    }

    /// Daily `.sql` files of one directory, sorted; the monthly query file
    /// is handled by the monthly path and excluded here.
    fn sql_files(&mut self, dir: &Path) -> Vec<PathBuf> {
        let mut files = Vec::new();
        let entries = match std::fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(err) => {
                self.collector
                    .record(format!("failed to scan {}: {err}", dir.display()));
                return files;
            }
        };
        for entry in entries {
            match entry {
                Ok(entry) => {
                    let path = entry.path();
                    let is_sql = path.is_file()
                        && path.extension().is_some_and(|ext| ext == "sql")
                        && path
                            .file_name()
                            .is_some_and(|name| name != self.config.monthly_query.as_str());
                    if is_sql {
                        files.push(path);
                    }
                }
                Err(err) => self
                    .collector
                    .record(format!("failed to scan {}: {err}", dir.display())),
            }
        }
        files.sort();
        files
    }
}

/// Report name convention: the directory name, uppercased.
#[must_use]
pub fn report_name(dir: &Path) -> String {
    dir.file_name()
        .map(|name| name.to_string_lossy().to_uppercase())
        .unwrap_or_default()
}

/// Loads and validates the JSON configuration file.
pub fn load_config(path: &Path) -> Result<HistoConfig> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read configuration {}", path.display()))?;
    let value: serde_json::Value = serde_json::from_str(&text)
        .with_context(|| format!("invalid JSON in {}", path.display()))?;
    Ok(HistoConfig::from_json(&value)?)
}

/// Executes the parsed CLI. Returns the accumulated error count, which the
/// binary uses as its exit code. Only configuration and store-open
/// failures abort the run.
pub fn run_cli(cli: Cli) -> Result<i32> {
    let mut config = load_config(&cli.config)?;
    if let Some(db) = cli.db {
        config.database_path = db;
    }

    let store = SqliteHistoStore::open(&config.database_path, config.tables.clone())?;
    store.migrate()?;

    let mut pipeline = Pipeline::new(&config, store, today_utc());
    let code = match cli.command {
        None => pipeline.run_default(None),
        Some(Command::Run(args)) => {
            let date = parse_optional_date(args.date.as_deref())?;
            pipeline.run_default(date)
        }
        Some(Command::Jour(args)) => {
            let date = parse_optional_date(args.date.as_deref())?;
            pipeline.jour(date)
        }
        Some(Command::Veille) => pipeline.veille(),
        Some(Command::Sup(args)) => {
            let date = parse_optional_date(args.date.as_deref())?;
            pipeline.sup(date)
        }
        Some(Command::Mois) => pipeline.mois(),
        Some(Command::Rapport(args)) => pipeline.rapport(&args.dir),
    };

    if code != 0 {
        eprintln!("{}", pipeline.collector().summary());
    }

    Ok(code)
}

fn parse_optional_date(value: Option<&str>) -> Result<Option<Date>> {
    match value {
        Some(raw) => Ok(Some(parse_iso_date(raw)?)),
        None => Ok(None),
    }
}
