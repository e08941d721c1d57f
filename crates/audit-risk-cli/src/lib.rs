//! Command surface for the audit risk register.
//!
//! Hosts embed the register through:
//! - [`run_cli`] for full parsed CLI execution.
//! - [`run_with_db`] for direct [`Command`] execution against a DB path.
//! - [`run_command`] for execution against an existing [`SqliteRiskStore`].

use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use audit_risk_core::{
    heat_map, next_statuses, parse_impact, parse_likelihood, parse_rfc3339_utc, risk_profile,
    AssessmentInput, AssessmentKind, ComplianceBandTable, HeatMapCell, KraProgressInput,
    KraStatus, LegalReference, NewEngagement, NewRisk, NewRiskEvent, Priority, PsapScorecard,
    RatingBandTable, RiskAssessment, RiskEventStatus, SourceType, REGISTER_TABLE,
};
use audit_risk_store_sqlite::{RegisterCheck, RiskEventFilter, RiskFilter, SqliteRiskStore};
use clap::{ArgAction, Args, Parser, Subcommand, ValueEnum};
use serde::Serialize;
use tracing::debug;
use ulid::Ulid;

#[derive(Debug, Parser)]
#[command(name = "arc")]
#[command(about = "Audit risk register CLI")]
pub struct Cli {
    #[arg(long, default_value = "./audit_risk.sqlite3", global = true)]
    db: PathBuf,

    /// Increase log verbosity (-v info, -vv debug, -vvv trace).
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

impl Cli {
    #[must_use]
    pub fn verbosity(&self) -> u8 {
        self.verbose
    }
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Score a likelihood/impact pair against a band table.
    Score(ScoreArgs),
    /// Print the 5x5 matrix for a band table.
    HeatMap(HeatMapArgs),
    Bands {
        #[command(subcommand)]
        command: Box<BandsCommand>,
    },
    Event {
        #[command(subcommand)]
        command: Box<EventCommand>,
    },
    Engagement {
        #[command(subcommand)]
        command: Box<EngagementCommand>,
    },
    Risk {
        #[command(subcommand)]
        command: Box<RiskCommand>,
    },
    Kra {
        #[command(subcommand)]
        command: Box<KraCommand>,
    },
    Psap {
        #[command(subcommand)]
        command: Box<PsapCommand>,
    },
}

#[derive(Debug, Args)]
pub struct ScoreArgs {
    /// 1-5 or a label such as "Likely".
    #[arg(long)]
    likelihood: String,
    /// 1-5 or a label such as "Major".
    #[arg(long)]
    impact: String,
    #[arg(long, default_value = REGISTER_TABLE)]
    table: String,
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
pub struct HeatMapArgs {
    #[arg(long, default_value = REGISTER_TABLE)]
    table: String,
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Subcommand)]
pub enum BandsCommand {
    List,
    Show(BandsShowArgs),
    /// Store a band table from a JSON document.
    Import(BandsImportArgs),
}

#[derive(Debug, Args)]
pub struct BandsShowArgs {
    #[arg(long)]
    name: String,
}

#[derive(Debug, Args)]
pub struct BandsImportArgs {
    #[arg(long)]
    file: PathBuf,
}

#[derive(Debug, Subcommand)]
pub enum EventCommand {
    Create(EventCreateArgs),
    Show(IdArgs),
    List(EventListArgs),
    Transition(EventTransitionArgs),
    /// List the statuses an event may move to next.
    Next(IdArgs),
}

#[derive(Debug, Args)]
pub struct EventCreateArgs {
    #[arg(long)]
    title: String,
    #[arg(long)]
    description: Option<String>,
    #[arg(long, value_enum)]
    source: SourceArg,
    #[arg(long, value_enum, default_value_t = PriorityArg::Medium)]
    priority: PriorityArg,
    #[arg(long = "override")]
    is_override: bool,
}

#[derive(Debug, Args)]
pub struct IdArgs {
    #[arg(long)]
    id: String,
}

#[derive(Debug, Args)]
pub struct EventListArgs {
    #[arg(long)]
    status: Option<String>,
    #[arg(long, value_enum)]
    source: Option<SourceArg>,
    #[arg(long)]
    search: Option<String>,
    /// RFC3339 UTC lower bound on creation time.
    #[arg(long)]
    from: Option<String>,
    /// RFC3339 UTC upper bound on creation time.
    #[arg(long)]
    to: Option<String>,
    #[arg(long)]
    limit: Option<usize>,
}

#[derive(Debug, Args)]
pub struct EventTransitionArgs {
    #[arg(long)]
    id: String,
    /// Target status, e.g. `under_review` or "Under Review".
    #[arg(long)]
    to: String,
}

#[derive(Debug, Subcommand)]
pub enum EngagementCommand {
    Create(EngagementCreateArgs),
    List(EngagementListArgs),
}

#[derive(Debug, Args)]
pub struct EngagementCreateArgs {
    #[arg(long)]
    risk_event_id: String,
    #[arg(long)]
    title: String,
    #[arg(long)]
    lead_auditor: Option<String>,
}

#[derive(Debug, Args)]
pub struct EngagementListArgs {
    #[arg(long)]
    risk_event_id: Option<String>,
}

#[derive(Debug, Subcommand)]
pub enum RiskCommand {
    Create(RiskCreateArgs),
    Show(IdArgs),
    List(RiskListArgs),
    Update(RiskUpdateArgs),
    /// Compare stored scores and ratings with their recomputed values.
    Check(CheckArgs),
    /// Rewrite drifted scores and ratings from the raw inputs.
    Rescore,
    /// Count register entries per rating band.
    Profile(RiskProfileArgs),
}

#[derive(Debug, Args)]
pub struct AssessmentArgs {
    #[arg(long)]
    likelihood: String,
    #[arg(long)]
    impact: String,
    #[arg(long)]
    residual_likelihood: Option<String>,
    #[arg(long)]
    residual_impact: Option<String>,
}

#[derive(Debug, Args)]
pub struct RiskCreateArgs {
    #[arg(long)]
    title: String,
    #[arg(long)]
    category: String,
    #[arg(long, default_value = REGISTER_TABLE)]
    table: String,
    #[command(flatten)]
    assessment: AssessmentArgs,
    /// `instrument` or `instrument#section`; repeat for several references.
    #[arg(long = "legal-ref")]
    legal_refs: Vec<String>,
}

#[derive(Debug, Args)]
pub struct RiskListArgs {
    #[arg(long)]
    category: Option<String>,
    #[arg(long)]
    rating: Option<String>,
    #[arg(long)]
    search: Option<String>,
    #[arg(long)]
    limit: Option<usize>,
}

#[derive(Debug, Args)]
pub struct RiskUpdateArgs {
    #[arg(long)]
    id: String,
    #[command(flatten)]
    assessment: AssessmentArgs,
}

#[derive(Debug, Args)]
pub struct CheckArgs {
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
pub struct RiskProfileArgs {
    #[arg(long, default_value = REGISTER_TABLE)]
    table: String,
    #[arg(long)]
    category: Option<String>,
}

#[derive(Debug, Subcommand)]
pub enum KraCommand {
    Upsert(KraUpsertArgs),
    List(KraListArgs),
}

#[derive(Debug, Args)]
pub struct KraUpsertArgs {
    #[arg(long)]
    activity: String,
    #[arg(long)]
    financial_year: String,
    #[arg(long)]
    quarter: u8,
    #[arg(long)]
    target: f64,
    #[arg(long)]
    actual: f64,
    #[arg(long, value_enum)]
    status: KraStatusArg,
    #[arg(long)]
    comment: Option<String>,
}

#[derive(Debug, Args)]
pub struct KraListArgs {
    #[arg(long)]
    financial_year: Option<String>,
    #[arg(long)]
    quarter: Option<u8>,
}

#[derive(Debug, Subcommand)]
pub enum PsapCommand {
    /// Weight a PSAP scorecard JSON file and rate the total.
    Score(PsapScoreArgs),
}

#[derive(Debug, Args)]
pub struct PsapScoreArgs {
    #[arg(long)]
    file: PathBuf,
    /// Optional compliance band table JSON replacing the built-in PSAP bands.
    #[arg(long)]
    bands: Option<PathBuf>,
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum SourceArg {
    Planned,
    Secretary,
    Management,
    Request,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum PriorityArg {
    Low,
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum KraStatusArg {
    NotStarted,
    OnTrack,
    Behind,
    Completed,
}

#[derive(Debug, Serialize)]
struct ScoreOutput {
    contract_version: &'static str,
    band_table: String,
    assessment: RiskAssessment,
}

#[derive(Debug, Serialize)]
struct NextStatusesOutput {
    id: Ulid,
    status: RiskEventStatus,
    next: Vec<RiskEventStatus>,
}

/// Executes the parsed top-level CLI command graph.
///
/// # Errors
/// Returns an error when store open/migrate or command execution fails.
pub fn run_cli(cli: Cli) -> Result<()> {
    run_with_db(&cli.db, cli.command)
}

/// Executes a parsed command using the provided `SQLite` DB path.
///
/// # Errors
/// Returns an error when store open/migrate fails or the requested command fails.
pub fn run_with_db(db_path: &Path, command: Command) -> Result<()> {
    match command {
        Command::Psap { command } => run_psap(*command),
        Command::Score(args) if !db_path.exists() => {
            run_score(&args, &builtin_table(&args.table)?)
        }
        Command::HeatMap(args) if !db_path.exists() => {
            run_heat_map(&args, &builtin_table(&args.table)?)
        }
        command => {
            debug!(db = %db_path.display(), "opening register database");
            let mut store = SqliteRiskStore::open(db_path)?;
            store.migrate()?;
            run_command(command, &mut store)
        }
    }
}

/// Executes a parsed command against an existing store handle.
///
/// # Errors
/// Returns an error when input validation, a workflow guard, or persistence
/// fails.
pub fn run_command(command: Command, store: &mut SqliteRiskStore) -> Result<()> {
    match command {
        Command::Score(args) => run_score(&args, &require_table(store, &args.table)?),
        Command::HeatMap(args) => run_heat_map(&args, &require_table(store, &args.table)?),
        Command::Bands { command } => run_bands(*command, store),
        Command::Event { command } => run_event(*command, store),
        Command::Engagement { command } => run_engagement(*command, store),
        Command::Risk { command } => run_risk(*command, store),
        Command::Kra { command } => run_kra(*command, store),
        Command::Psap { command } => run_psap(*command),
    }
}

fn run_score(args: &ScoreArgs, table: &RatingBandTable) -> Result<()> {
    let input = AssessmentInput {
        likelihood: parse_likelihood(&args.likelihood)?,
        impact: parse_impact(&args.impact)?,
    };
    let assessment = RiskAssessment::assess(AssessmentKind::ProfileItem, input, table)?;
    if args.json {
        print_json(&ScoreOutput {
            contract_version: "score.v1",
            band_table: table.name().to_string(),
            assessment,
        })
    } else {
        println!("score={} rating={}", assessment.score(), assessment.rating());
        Ok(())
    }
}

fn run_heat_map(args: &HeatMapArgs, table: &RatingBandTable) -> Result<()> {
    let cells = heat_map(table)?;
    if args.json {
        print_json(&cells)
    } else {
        print_heat_map(table, &cells);
        Ok(())
    }
}

fn run_bands(command: BandsCommand, store: &SqliteRiskStore) -> Result<()> {
    match command {
        BandsCommand::List => {
            let tables: Vec<RatingBandTable> = store.list_band_tables()?.into_values().collect();
            print_json(&tables)
        }
        BandsCommand::Show(args) => print_json(&require_table(store, &args.name)?),
        BandsCommand::Import(args) => {
            let value = read_json_file(&args.file)?;
            let table = RatingBandTable::from_json(&value)?;
            store.upsert_band_table(&table)?;
            print_json(&table)
        }
    }
}

fn run_event(command: EventCommand, store: &mut SqliteRiskStore) -> Result<()> {
    match command {
        EventCommand::Create(args) => {
            let event = store.create_risk_event(&NewRiskEvent {
                title: args.title,
                description: args.description,
                source_type: map_source(args.source),
                priority: map_priority(args.priority),
                is_override: args.is_override,
            })?;
            print_json(&event)
        }
        EventCommand::Show(args) => {
            let id = parse_id(&args.id)?;
            let event = store
                .get_risk_event(id)?
                .ok_or_else(|| anyhow!("risk event {id} not found"))?;
            print_json(&event)
        }
        EventCommand::List(args) => {
            let filter = RiskEventFilter {
                status: args.status.as_deref().map(parse_status).transpose()?,
                source_type: args.source.map(map_source),
                search: args.search,
                created_from: parse_optional_utc(args.from.as_deref())?,
                created_to: parse_optional_utc(args.to.as_deref())?,
                limit: args.limit,
            };
            print_json(&store.list_risk_events(&filter)?)
        }
        EventCommand::Transition(args) => {
            let event = store.transition_risk_event(parse_id(&args.id)?, parse_status(&args.to)?)?;
            print_json(&event)
        }
        EventCommand::Next(args) => {
            let id = parse_id(&args.id)?;
            let event = store
                .get_risk_event(id)?
                .ok_or_else(|| anyhow!("risk event {id} not found"))?;
            print_json(&NextStatusesOutput {
                id,
                status: event.status,
                next: next_statuses(event.status).into_iter().collect(),
            })
        }
    }
}

fn run_engagement(command: EngagementCommand, store: &mut SqliteRiskStore) -> Result<()> {
    match command {
        EngagementCommand::Create(args) => {
            let engagement = store.create_engagement(&NewEngagement {
                risk_event_id: parse_id(&args.risk_event_id)?,
                title: args.title,
                lead_auditor: args.lead_auditor,
            })?;
            print_json(&engagement)
        }
        EngagementCommand::List(args) => {
            let risk_event_id = args.risk_event_id.as_deref().map(parse_id).transpose()?;
            print_json(&store.list_engagements(risk_event_id)?)
        }
    }
}

fn run_risk(command: RiskCommand, store: &mut SqliteRiskStore) -> Result<()> {
    match command {
        RiskCommand::Create(args) => {
            let (inherent, residual) = parse_assessment_args(&args.assessment)?;
            let legal_references = args
                .legal_refs
                .iter()
                .map(|raw| LegalReference::parse(raw).map_err(Into::into))
                .collect::<Result<Vec<_>>>()?;
            let entry = store.create_risk(&NewRisk {
                title: args.title,
                category: args.category,
                band_table: args.table,
                inherent,
                residual,
                legal_references,
            })?;
            print_json(&entry)
        }
        RiskCommand::Show(args) => {
            let id = parse_id(&args.id)?;
            let entry = store
                .get_risk(id)?
                .ok_or_else(|| anyhow!("risk {id} not found"))?;
            print_json(&entry)
        }
        RiskCommand::List(args) => print_json(&store.list_risks(&RiskFilter {
            category: args.category,
            rating: args.rating,
            search: args.search,
            limit: args.limit,
        })?),
        RiskCommand::Update(args) => {
            let (inherent, residual) = parse_assessment_args(&args.assessment)?;
            let entry = store.update_risk_assessment(parse_id(&args.id)?, inherent, residual)?;
            print_json(&entry)
        }
        RiskCommand::Check(args) => {
            let check = store.register_check()?;
            if args.json {
                print_json(&check)?;
            } else {
                print_register_check(&check);
            }

            if !check.healthy {
                return Err(anyhow!(
                    "register check failed: {}",
                    check
                        .drifted
                        .iter()
                        .map(|item| format!("{}:{}", item.risk_id, item.kind.as_str()))
                        .collect::<Vec<_>>()
                        .join("; ")
                ));
            }
            Ok(())
        }
        RiskCommand::Rescore => print_json(&store.rescore_register()?),
        RiskCommand::Profile(args) => {
            let table = require_table(store, &args.table)?;
            let entries = store.list_risks(&RiskFilter {
                category: args.category,
                ..RiskFilter::default()
            })?;
            let inputs: Vec<AssessmentInput> =
                entries.iter().map(|entry| entry.inherent.input()).collect();
            print_json(&risk_profile(&inputs, &table)?)
        }
    }
}

fn run_kra(command: KraCommand, store: &mut SqliteRiskStore) -> Result<()> {
    match command {
        KraCommand::Upsert(args) => {
            let progress = store.upsert_kra_progress(&KraProgressInput {
                kra_activity_id: args.activity,
                financial_year: args.financial_year,
                quarter: args.quarter,
                target: args.target,
                actual: args.actual,
                status: map_kra_status(args.status),
                comment: args.comment,
            })?;
            print_json(&progress)
        }
        KraCommand::List(args) => print_json(
            &store.list_kra_progress(args.financial_year.as_deref(), args.quarter)?,
        ),
    }
}

/// Scores a PSAP scorecard. Does not touch the database.
///
/// # Errors
/// Returns an error when the scorecard or band file cannot be read or fails
/// validation.
pub fn run_psap(command: PsapCommand) -> Result<()> {
    match command {
        PsapCommand::Score(args) => {
            let scorecard: PsapScorecard = serde_json::from_value(read_json_file(&args.file)?)
                .with_context(|| format!("invalid PSAP scorecard in {}", args.file.display()))?;
            let table = match args.bands.as_deref() {
                Some(path) => ComplianceBandTable::from_json(&read_json_file(path)?)?,
                None => ComplianceBandTable::psap(),
            };
            let result = scorecard.evaluate(&table)?;
            if args.json {
                print_json(&result)
            } else {
                println!(
                    "weighted_total={:.2}/{:.0} label={}",
                    result.weighted_total, result.max_total, result.label
                );
                Ok(())
            }
        }
    }
}

fn require_table(store: &SqliteRiskStore, name: &str) -> Result<RatingBandTable> {
    store
        .get_band_table(name)?
        .ok_or_else(|| anyhow!("unknown band table {name}"))
}

fn builtin_table(name: &str) -> Result<RatingBandTable> {
    RatingBandTable::builtin(name).ok_or_else(|| anyhow!("unknown band table {name}"))
}

fn parse_assessment_args(
    args: &AssessmentArgs,
) -> Result<(AssessmentInput, Option<AssessmentInput>)> {
    let inherent = AssessmentInput {
        likelihood: parse_likelihood(&args.likelihood)?,
        impact: parse_impact(&args.impact)?,
    };
    let residual = match (
        args.residual_likelihood.as_deref(),
        args.residual_impact.as_deref(),
    ) {
        (Some(likelihood), Some(impact)) => Some(AssessmentInput {
            likelihood: parse_likelihood(likelihood)?,
            impact: parse_impact(impact)?,
        }),
        (None, None) => None,
        _ => {
            return Err(anyhow!(
                "residual assessment requires both --residual-likelihood and --residual-impact"
            ))
        }
    };
    Ok((inherent, residual))
}

fn parse_id(raw: &str) -> Result<Ulid> {
    Ulid::from_string(raw).with_context(|| format!("invalid ULID: {raw}"))
}

fn parse_status(raw: &str) -> Result<RiskEventStatus> {
    RiskEventStatus::parse(raw).ok_or_else(|| anyhow!("unknown risk event status: {raw}"))
}

fn parse_optional_utc(raw: Option<&str>) -> Result<Option<time::OffsetDateTime>> {
    raw.map(|value| parse_rfc3339_utc(value).map_err(|err| anyhow!("invalid timestamp: {err}")))
        .transpose()
}

fn read_json_file(path: &Path) -> Result<serde_json::Value> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed reading {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("{} must be valid JSON", path.display()))
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn map_source(value: SourceArg) -> SourceType {
    match value {
        SourceArg::Planned => SourceType::Planned,
        SourceArg::Secretary => SourceType::Secretary,
        SourceArg::Management => SourceType::Management,
        SourceArg::Request => SourceType::Request,
    }
}

fn map_priority(value: PriorityArg) -> Priority {
    match value {
        PriorityArg::Low => Priority::Low,
        PriorityArg::Medium => Priority::Medium,
        PriorityArg::High => Priority::High,
        PriorityArg::Critical => Priority::Critical,
    }
}

fn map_kra_status(value: KraStatusArg) -> KraStatus {
    match value {
        KraStatusArg::NotStarted => KraStatus::NotStarted,
        KraStatusArg::OnTrack => KraStatus::OnTrack,
        KraStatusArg::Behind => KraStatus::Behind,
        KraStatusArg::Completed => KraStatus::Completed,
    }
}

fn print_heat_map(table: &RatingBandTable, cells: &[HeatMapCell]) {
    println!("table: {}", table.name());
    println!(
        "{:<10} {:<14} {:<14} {:<14} {:<14} {:<14}",
        "L \\ I", "1", "2", "3", "4", "5"
    );
    println!("{}", "-".repeat(86));

    for row in cells.chunks(5) {
        let Some(first) = row.first() else {
            continue;
        };
        let rendered = row
            .iter()
            .map(|cell| format!("{:<14}", format!("{} {}", cell.score, cell.rating)))
            .collect::<Vec<_>>()
            .join(" ");
        println!("{:<10} {rendered}", first.likelihood);
    }
}

fn print_register_check(check: &RegisterCheck) {
    println!("contract={}", check.contract_version);
    println!("scanned={}", check.scanned);
    println!("healthy={}", if check.healthy { "yes" } else { "no" });
    if !check.drifted.is_empty() {
        println!(
            "{:<28} {:<9} {:<14} {:<20} {:<14} expected_rating",
            "risk_id", "kind", "stored_score", "stored_rating", "expected_score"
        );
        println!("{}", "-".repeat(110));
        for drift in &check.drifted {
            println!(
                "{:<28} {:<9} {:<14} {:<20} {:<14} {}",
                drift.risk_id,
                drift.kind.as_str(),
                drift
                    .stored_score
                    .map_or_else(|| "-".to_string(), |value| value.to_string()),
                drift.stored_rating.as_deref().unwrap_or("-"),
                drift.expected_score,
                drift.expected_rating
            );
        }
        println!("hint=run `arc risk rescore` to rewrite drifted rows");
    }
}
