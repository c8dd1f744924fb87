//! vgraph - change-set scoped infrastructure graph CLI
//!
//! The `vgraph` command edits a component graph inside change sets and runs
//! the graph's functions (code generation, qualification, refresh, fixes).
//!
//! ## Commands
//!
//! - `change-set`: create, apply, cancel or list change sets
//! - `component`: create, inspect, edit or delete components
//! - `connect`: place a component inside a frame
//! - `qualify` / `codegen`: re-run a component's functions
//! - `refresh` / `fix`: observe or act on real resources
//! - `history`: every stored version of a component

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;
use serde_json::Value;
use tracing::{info, Level};
use vgraph_core::{
    ComponentId, EngineConfig, FixRequest, GraphEngine, PropagationReport, Scheduled, Scope,
    TokioCommandRunner,
};
use vgraph_state::handle::{self, DEFAULT_DATABASE, DEFAULT_NAMESPACE};
use vgraph_state::{ChangeSetPk, SurrealFixLedger, SurrealRowStore, Tenancy};

#[derive(Debug, Parser)]
#[command(name = "vgraph")]
#[command(author = "Stevedores Org")]
#[command(version = vgraph_core::VERSION)]
#[command(about = "Change-set scoped infrastructure graph", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json: bool,

    /// Result format on stdout
    #[arg(long, global = true, value_enum, default_value_t = OutputFormat::Text)]
    output: OutputFormat,

    /// Engine config file (TOML)
    #[arg(long, global = true, env = "VGRAPH_CONFIG")]
    config: Option<PathBuf>,

    /// Database URL (`mem://`, `surrealkv://path`, `ws://host:port`)
    #[arg(long, global = true, env = "VGRAPH_DB")]
    db: Option<String>,

    /// Change set to work in (`HEAD` or a change-set pk)
    #[arg(long = "change-set", short = 'c', global = true, env = "VGRAPH_CHANGE_SET", default_value = "HEAD")]
    change_set: ChangeSetPk,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Manage change sets
    ChangeSet {
        #[command(subcommand)]
        action: ChangeSetAction,
    },

    /// Manage components
    Component {
        #[command(subcommand)]
        action: ComponentAction,
    },

    /// Place a component inside a frame and wire matching sockets
    Connect {
        /// Component to place
        child: ComponentId,

        /// Frame to place it in
        frame: ComponentId,
    },

    /// Show every stored version of a component
    History {
        component: ComponentId,
    },

    /// Re-run a component's qualifications
    Qualify {
        component: ComponentId,
    },

    /// Re-run a component's code generation
    Codegen {
        component: ComponentId,
    },

    /// Observe a component's real resource
    Refresh {
        component: ComponentId,

        /// Refresh function to run
        #[arg(long)]
        func: String,
    },

    /// Run a fix batch
    Fix {
        /// Components to fix
        #[arg(required = true)]
        components: Vec<ComponentId>,

        /// Fix function to run against each component
        #[arg(long)]
        func: String,
    },

    /// List the schema variants components can be created from
    Variants,

    /// Manage installed packages
    Pkg {
        #[command(subcommand)]
        action: PkgAction,
    },
}

#[derive(Debug, Subcommand)]
enum ChangeSetAction {
    /// Open a new change set
    Create { name: String },
    /// Merge a change set into HEAD
    Apply { pk: ChangeSetPk },
    /// Discard a change set
    Cancel { pk: ChangeSetPk },
    /// List change sets
    List,
}

#[derive(Debug, Subcommand)]
enum ComponentAction {
    /// Create a component
    Create {
        name: String,

        /// Schema variant to instantiate
        #[arg(long)]
        variant: String,

        /// Domain properties as a JSON object
        #[arg(long, default_value = "{}")]
        domain: String,
    },
    /// List components visible in the change set
    List,
    /// Show a component and its attribute values
    Show { component: ComponentId },
    /// Set one domain property (JSON, or a bare string)
    Set {
        component: ComponentId,
        prop: String,
        value: String,
    },
    /// Delete a component
    Delete { component: ComponentId },
}

#[derive(Debug, Subcommand)]
enum PkgAction {
    /// Record a package file as installed
    Install {
        path: PathBuf,

        /// Package name (default: file stem)
        #[arg(long)]
        name: Option<String>,
    },
    /// List installed packages
    List,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    vgraph_core::init_tracing(cli.json, level);

    let config = load_config(cli.config.as_deref())?;
    let engine = open_engine(config, cli.db.as_deref())
        .await
        .context("Failed to open vgraph database")?;
    let scope = Scope::new(Tenancy::new_universal(), cli.change_set);
    let out = cli.output;

    match cli.command {
        Commands::ChangeSet { action } => match action {
            ChangeSetAction::Create { name } => cmd_change_set_create(&engine, &name, out).await,
            ChangeSetAction::Apply { pk } => cmd_change_set_apply(&engine, pk, out).await,
            ChangeSetAction::Cancel { pk } => cmd_change_set_cancel(&engine, pk, out).await,
            ChangeSetAction::List => cmd_change_set_list(&engine, out).await,
        },
        Commands::Component { action } => match action {
            ComponentAction::Create {
                name,
                variant,
                domain,
            } => cmd_component_create(&engine, &scope, &name, &variant, &domain, out).await,
            ComponentAction::List => cmd_component_list(&engine, &scope, out).await,
            ComponentAction::Show { component } => {
                cmd_component_show(&engine, &scope, component, out).await
            }
            ComponentAction::Set {
                component,
                prop,
                value,
            } => cmd_component_set(&engine, &scope, component, &prop, &value, out).await,
            ComponentAction::Delete { component } => {
                cmd_component_delete(&engine, &scope, component).await
            }
        },
        Commands::Connect { child, frame } => cmd_connect(&engine, &scope, child, frame, out).await,
        Commands::History { component } => cmd_history(&engine, &scope, component, out).await,
        Commands::Qualify { component } => cmd_qualify(&engine, &scope, component, out).await,
        Commands::Codegen { component } => cmd_codegen(&engine, &scope, component, out).await,
        Commands::Refresh { component, func } => {
            cmd_refresh(&engine, &scope, component, &func, out).await
        }
        Commands::Fix { components, func } => {
            cmd_fix(&engine, &scope, &components, &func, out).await
        }
        Commands::Variants => cmd_variants(&engine, out),
        Commands::Pkg { action } => match action {
            PkgAction::Install { path, name } => {
                cmd_pkg_install(&engine, &scope, &path, name.as_deref(), out).await
            }
            PkgAction::List => cmd_pkg_list(&engine, &scope, out).await,
        },
    }
}

// ========== Setup ==========

fn load_config(path: Option<&Path>) -> Result<EngineConfig> {
    let config = match path {
        Some(path) => EngineConfig::load(path)?,
        None => EngineConfig::default(),
    };
    Ok(config.apply_env_overrides()?)
}

/// Open the SurrealDB-backed engine. `--db` beats `[storage] url`, which
/// beats the SurrealDB environment chain.
async fn open_engine(config: EngineConfig, db_url: Option<&str>) -> Result<GraphEngine> {
    let url = db_url.map(str::to_string).or_else(|| config.storage.url.clone());
    let db = match url {
        Some(url) => {
            let namespace = config.storage.namespace.as_deref().unwrap_or(DEFAULT_NAMESPACE);
            let database = config.storage.database.as_deref().unwrap_or(DEFAULT_DATABASE);
            handle::connect_url(&url, namespace, database).await?
        }
        None => handle::connect_from_env().await?,
    };

    let rows = Arc::new(SurrealRowStore::new(db.clone()));
    let ledger = Arc::new(SurrealFixLedger::new(db));
    Ok(GraphEngine::new(
        rows,
        ledger,
        Arc::new(TokioCommandRunner),
        config,
    ))
}

// ========== Output ==========

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn short(id: &str) -> &str {
    &id[..8.min(id.len())]
}

/// Parse a property value: JSON when it parses, otherwise a bare string.
fn parse_value(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

fn parse_domain(raw: &str) -> Result<Value> {
    let domain: Value = serde_json::from_str(raw).context("--domain is not valid JSON")?;
    if !domain.is_object() {
        bail!("--domain must be a JSON object");
    }
    Ok(domain)
}

#[derive(Serialize)]
struct ScheduledOutput<T: Serialize> {
    #[serde(flatten)]
    value: T,
    propagation: PropagationReport,
}

/// Wait for an edit's propagation and print both.
async fn settle_and_print<T, F>(scheduled: Scheduled<T>, out: OutputFormat, text: F) -> Result<()>
where
    T: Serialize,
    F: FnOnce(&T),
{
    let (value, report) = scheduled.settle().await?;
    if out == OutputFormat::Json {
        return print_json(&ScheduledOutput {
            value,
            propagation: report,
        });
    }
    text(&value);
    print_report(&report);
    Ok(())
}

fn print_report(report: &PropagationReport) {
    println!(
        "propagation: {} resolved, {} unresolved, {} failed",
        report.resolved.len(),
        report.unresolved.len(),
        report.failed.len()
    );
}

// ========== Change Sets ==========

async fn cmd_change_set_create(engine: &GraphEngine, name: &str, out: OutputFormat) -> Result<()> {
    let record = engine
        .create_change_set(&Tenancy::new_universal(), name)
        .await?;
    info!(change_set_pk = %record.pk, "change set created");
    match out {
        OutputFormat::Json => print_json(&record),
        OutputFormat::Text => {
            println!("Created change set '{}' ({})", record.name, record.pk);
            Ok(())
        }
    }
}

async fn cmd_change_set_apply(engine: &GraphEngine, pk: ChangeSetPk, out: OutputFormat) -> Result<()> {
    let record = engine
        .apply_change_set(&Tenancy::new_universal(), pk)
        .await
        .with_context(|| format!("Failed to apply change set {pk}"))?;
    match out {
        OutputFormat::Json => print_json(&record),
        OutputFormat::Text => {
            println!("Applied '{}' into HEAD", record.name);
            Ok(())
        }
    }
}

async fn cmd_change_set_cancel(engine: &GraphEngine, pk: ChangeSetPk, out: OutputFormat) -> Result<()> {
    let record = engine
        .cancel_change_set(&Tenancy::new_universal(), pk)
        .await
        .with_context(|| format!("Failed to cancel change set {pk}"))?;
    match out {
        OutputFormat::Json => print_json(&record),
        OutputFormat::Text => {
            println!("Canceled '{}'", record.name);
            Ok(())
        }
    }
}

async fn cmd_change_set_list(engine: &GraphEngine, out: OutputFormat) -> Result<()> {
    let records = engine.list_change_sets().await?;
    if out == OutputFormat::Json {
        return print_json(&records);
    }
    if records.is_empty() {
        println!("No change sets.");
        return Ok(());
    }
    for record in records {
        println!(
            "{} {:<9} {} {}",
            record.pk,
            record.status.as_str(),
            record.created_at.format("%Y-%m-%d %H:%M:%S UTC"),
            record.name
        );
    }
    Ok(())
}

// ========== Components ==========

async fn cmd_component_create(
    engine: &GraphEngine,
    scope: &Scope,
    name: &str,
    variant: &str,
    domain: &str,
    out: OutputFormat,
) -> Result<()> {
    let domain = parse_domain(domain)?;
    let scheduled = engine.create_component(scope, name, variant, domain).await?;
    settle_and_print(scheduled, out, |c| {
        println!("Created {} '{}' ({})", c.schema_variant, c.name, c.id);
    })
    .await
}

async fn cmd_component_list(engine: &GraphEngine, scope: &Scope, out: OutputFormat) -> Result<()> {
    let components = engine.components(scope).await?;
    if out == OutputFormat::Json {
        return print_json(&components);
    }
    if components.is_empty() {
        println!("No components in {}.", scope.change_set_pk);
        return Ok(());
    }
    for c in components {
        println!("{} {:<20} {}", c.id, c.name, c.schema_variant);
    }
    Ok(())
}

#[derive(Serialize)]
struct ComponentView {
    component: vgraph_core::Component,
    values: Vec<vgraph_core::AttributeValue>,
}

async fn cmd_component_show(
    engine: &GraphEngine,
    scope: &Scope,
    id: ComponentId,
    out: OutputFormat,
) -> Result<()> {
    let component = engine.component(scope, id).await?;
    let mut values = engine.attribute_values(scope, id).await?;
    values.sort_by(|a, b| a.path.cmp(&b.path));
    if out == OutputFormat::Json {
        return print_json(&ComponentView { component, values });
    }

    println!("{} '{}' ({})", component.schema_variant, component.name, component.id);
    println!("domain:   {}", component.domain);
    println!("resource: {}", component.resource);
    for av in values {
        let status = serde_json::to_value(av.status)?;
        println!(
            "  {:<36} {:<9} {}",
            av.path,
            status.as_str().unwrap_or_default(),
            av.value
        );
        if let Some(message) = av.message {
            println!("  {:<36} {}", "", message);
        }
    }
    Ok(())
}

async fn cmd_component_set(
    engine: &GraphEngine,
    scope: &Scope,
    id: ComponentId,
    prop: &str,
    raw: &str,
    out: OutputFormat,
) -> Result<()> {
    let scheduled = engine
        .set_domain_property(scope, id, prop, parse_value(raw))
        .await?;
    settle_and_print(scheduled, out, |c| {
        println!("Set {}.{} = {}", c.name, prop, c.domain[prop]);
    })
    .await
}

async fn cmd_component_delete(engine: &GraphEngine, scope: &Scope, id: ComponentId) -> Result<()> {
    engine
        .delete_component(scope, id)
        .await
        .with_context(|| format!("Failed to delete component {id}"))?;
    println!("Deleted {}", id);
    Ok(())
}

async fn cmd_connect(
    engine: &GraphEngine,
    scope: &Scope,
    child: ComponentId,
    frame: ComponentId,
    out: OutputFormat,
) -> Result<()> {
    let scheduled = engine.connect_component_to_frame(scope, child, frame).await?;
    let (connection, report) = scheduled.settle().await?;
    if out == OutputFormat::Json {
        return print_json(&serde_json::json!({
            "edges": connection.edges,
            "upstream": connection.upstream,
            "propagation": report,
        }));
    }
    println!(
        "Connected {} to frame {} ({} edge(s))",
        short(&child.to_string()),
        short(&frame.to_string()),
        connection.edges.len()
    );
    print_report(&report);
    Ok(())
}

async fn cmd_history(
    engine: &GraphEngine,
    scope: &Scope,
    id: ComponentId,
    out: OutputFormat,
) -> Result<()> {
    let rows = engine.history(scope, id).await?;
    if out == OutputFormat::Json {
        return print_json(&rows);
    }
    if rows.is_empty() {
        println!("No history for {}", id);
        return Ok(());
    }
    for row in rows {
        let deleted = if row.visibility.is_deleted() { " (deleted)" } else { "" };
        println!(
            "{} {}{} {}",
            row.updated_at.format("%Y-%m-%d %H:%M:%S UTC"),
            row.visibility.change_set_pk,
            deleted,
            row.object["domain"]
        );
    }
    Ok(())
}

// ========== Functions ==========

async fn cmd_qualify(
    engine: &GraphEngine,
    scope: &Scope,
    id: ComponentId,
    out: OutputFormat,
) -> Result<()> {
    let values = engine.qualify(scope, id).await?;
    if out == OutputFormat::Json {
        return print_json(&values);
    }
    if values.is_empty() {
        println!("No qualifications for {}", id);
    }
    for av in values {
        let mark = if av.value["qualified"] == Value::Bool(true) {
            "ok  "
        } else {
            "FAIL"
        };
        println!("{} {}", mark, av.path);
        if let Some(message) = av.value["message"].as_str().or(av.message.as_deref()) {
            println!("     {}", message);
        }
    }
    Ok(())
}

async fn cmd_codegen(
    engine: &GraphEngine,
    scope: &Scope,
    id: ComponentId,
    out: OutputFormat,
) -> Result<()> {
    let values = engine.codegen(scope, id).await?;
    if out == OutputFormat::Json {
        return print_json(&values);
    }
    for av in values {
        println!("# {}", av.path);
        match av.value["code"].as_str() {
            Some(code) => println!("{}", code),
            None => println!("(no code: {})", av.message.as_deref().unwrap_or("not generated")),
        }
    }
    Ok(())
}

async fn cmd_refresh(
    engine: &GraphEngine,
    scope: &Scope,
    id: ComponentId,
    func: &str,
    out: OutputFormat,
) -> Result<()> {
    let result = engine.refresh_resource(scope, id, func).await?;
    if out == OutputFormat::Json {
        return print_json(&result);
    }
    if result.is_ok() {
        println!("resource: {}", result.value);
    } else {
        println!(
            "refresh failed: {}",
            result.message.as_deref().unwrap_or("unknown error")
        );
    }
    Ok(())
}

async fn cmd_fix(
    engine: &GraphEngine,
    scope: &Scope,
    components: &[ComponentId],
    func: &str,
    out: OutputFormat,
) -> Result<()> {
    let fixes = components
        .iter()
        .map(|id| FixRequest::new(*id, func))
        .collect();
    let batch = engine.run_fixes(scope, fixes).await?;
    if out == OutputFormat::Json {
        return print_json(&batch);
    }
    println!("batch {}", batch.batch_id);
    for member in &batch.members {
        let outcome = member
            .outcome
            .map(|o| o.to_string())
            .unwrap_or_else(|| "pending".to_string());
        println!(
            "  {} {:<8} {}",
            short(&member.component_id),
            outcome,
            member.message.as_deref().unwrap_or("")
        );
    }
    Ok(())
}

fn cmd_variants(engine: &GraphEngine, out: OutputFormat) -> Result<()> {
    let variants: Vec<_> = engine.variants().collect();
    if out == OutputFormat::Json {
        return print_json(&variants);
    }
    for variant in variants {
        println!("{} ({})", variant.name, variant.component_type.label());
    }
    Ok(())
}

// ========== Packages ==========

async fn cmd_pkg_install(
    engine: &GraphEngine,
    scope: &Scope,
    path: &Path,
    name: Option<&str>,
    out: OutputFormat,
) -> Result<()> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read package {}", path.display()))?;
    let name = match name {
        Some(name) => name.to_string(),
        None => path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .context("package path has no file name")?,
    };
    let pkg = engine.install_pkg(scope, &name, &contents).await?;
    match out {
        OutputFormat::Json => print_json(&pkg),
        OutputFormat::Text => {
            println!("Installed '{}' {}", pkg.name, short(&pkg.root_hash));
            Ok(())
        }
    }
}

async fn cmd_pkg_list(engine: &GraphEngine, scope: &Scope, out: OutputFormat) -> Result<()> {
    let pkgs = engine.installed_pkgs(scope).await?;
    if out == OutputFormat::Json {
        return print_json(&pkgs);
    }
    for pkg in pkgs {
        println!("{} {}", short(&pkg.root_hash), pkg.name);
    }
    Ok(())
}
