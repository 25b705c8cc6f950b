use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use dloop_api::{checkout_project, ExecutionInput, Scope, ServiceSelector, Services};
use dloop_apply::{load_manifest, Manifest, ReconcileReport, TeardownReport};
use dloop_client::{ClientConfig, HttpPlatform, Platform};
use dloop_core::{Service, TriggerResource};
use dloop_ops::LogQuery;
use dloop_persist::{Session, SqliteStore};
use metrics::counter;
use tokio::signal;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "dloopctl", version, about = "dloop CLI: deploy and operate platform services")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Project id (default: checked-out project)
    #[arg(short = 'p', long = "project", global = true, env = "DLOOP_PROJECT")]
    project: Option<String>,

    /// API base URL
    #[arg(long = "base-url", global = true, env = "DLOOP_BASE_URL")]
    base_url: Option<String>,

    /// Bearer token
    #[arg(long = "token", global = true, env = "DLOOP_TOKEN", hide_env_values = true)]
    token: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum ExecResource { Item, Dataset, Annotation }

impl From<ExecResource> for TriggerResource {
    fn from(r: ExecResource) -> Self {
        match r {
            ExecResource::Item => TriggerResource::Item,
            ExecResource::Dataset => TriggerResource::Dataset,
            ExecResource::Annotation => TriggerResource::Annotation,
        }
    }
}

#[derive(clap::Args, Debug, Clone)]
struct Target {
    /// Service id
    #[arg(long = "id")]
    id: Option<String>,
    /// Service name (default: checked-out service)
    #[arg(long = "name")]
    name: Option<String>,
}

impl Target {
    fn selector(&self) -> ServiceSelector {
        ServiceSelector::from_parts(self.id.clone(), self.name.clone())
    }
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Write a default service.json into a directory
    Init {
        #[arg(default_value = ".")]
        dir: PathBuf,
    },
    /// Deploy a service.json (single service or pipeline array)
    Deploy {
        /// File or directory holding service.json
        #[arg(default_value = ".")]
        path: PathBuf,
        /// Bot email used for new services
        #[arg(long = "bot")]
        bot: Option<String>,
        /// Check out the deployed service (single form only)
        #[arg(long = "checkout", action = ArgAction::SetTrue)]
        checkout: bool,
    },
    /// Delete services and triggers named in a service.json
    Teardown {
        #[arg(default_value = ".")]
        path: PathBuf,
    },
    /// List services of the project
    Ls {
        #[arg(long = "name")]
        name: Option<String>,
        #[arg(long = "package-id")]
        package_id: Option<String>,
    },
    /// Show one service
    Get {
        #[command(flatten)]
        target: Target,
    },
    /// Make a service the current one
    Checkout {
        #[command(flatten)]
        target: Target,
    },
    /// Project commands
    Project {
        #[command(subcommand)]
        command: ProjectCommands,
    },
    /// Service runtime status
    Status {
        #[command(flatten)]
        target: Target,
    },
    /// Delete a service
    Rm {
        #[command(flatten)]
        target: Target,
    },
    /// Stream service logs until the server stops or Ctrl-C
    Logs {
        #[command(flatten)]
        target: Target,
        /// Page size
        #[arg(long = "size")]
        size: Option<u32>,
        /// ISO start time (default: today 00:00:00)
        #[arg(long = "start")]
        start: Option<String>,
        /// ISO end time
        #[arg(long = "end")]
        end: Option<String>,
    },
    /// Run a service function
    Exec {
        #[command(flatten)]
        target: Target,
        /// Function name (default: run)
        #[arg(long = "function")]
        function: Option<String>,
        /// Resource kind for the input shortcut
        #[arg(long = "resource", value_enum, requires = "resource_id")]
        resource: Option<ExecResource>,
        /// Id of the item/dataset/annotation
        #[arg(long = "resource-id")]
        resource_id: Option<String>,
        /// Raw JSON input
        #[arg(long = "input", conflicts_with = "resource")]
        input: Option<String>,
        /// Wait for the execution to finish
        #[arg(long = "sync", action = ArgAction::SetTrue)]
        sync: bool,
    },
}

#[derive(Subcommand, Debug)]
enum ProjectCommands {
    /// Make a project the current one
    Checkout { id: String },
}

fn init_tracing() {
    let env = std::env::var("DLOOP_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(std::io::stderr).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("DLOOP_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid DLOOP_METRICS_ADDR; expected host:port");
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();
    match run(cli).await {
        Ok(true) => Ok(()),
        Ok(false) => {
            counter!("cli_failed_total", 1u64);
            std::process::exit(1);
        }
        Err(e) => {
            counter!("cli_failed_total", 1u64);
            error!(error = %e, "command failed");
            eprintln!("error: {}", e);
            std::process::exit(1);
        }
    }
}

struct Ctx {
    platform: Arc<dyn Platform>,
    session: Arc<Session>,
    config: ClientConfig,
    project: Option<String>,
}

impl Ctx {
    fn new(cli: &Cli) -> Result<Self> {
        let mut config = ClientConfig::from_env().with_token(cli.token.clone());
        if let Some(url) = &cli.base_url {
            config = config.with_base_url(url.clone());
        }
        let platform: Arc<dyn Platform> = Arc::new(HttpPlatform::new(&config)?);
        let session = Arc::new(Session::new(SqliteStore::open_default()?));
        Ok(Self { platform, session, config, project: cli.project.clone() })
    }

    async fn services(&self) -> Result<Services> {
        let scope = Scope { project_id: self.project.clone(), package: None };
        Ok(Services::connect(self.platform.clone(), self.session.clone(), self.config.clone(), scope).await?)
    }
}

/// `Ok(false)` means the command ran but something it applied failed.
async fn run(cli: Cli) -> Result<bool> {
    let out = cli.output;
    if let Commands::Init { dir } = &cli.command {
        let path = Services::generate_services_json(dir)?;
        println!("{}", path.display());
        return Ok(true);
    }
    let ctx = Ctx::new(&cli)?;

    match cli.command {
        Commands::Init { .. } => Ok(true),
        Commands::Project { command: ProjectCommands::Checkout { id } } => {
            let project = checkout_project(ctx.platform.as_ref(), &ctx.session, &id).await?;
            match out {
                Output::Human => println!("checked out project {} ({})", project.name, project.id),
                Output::Json => println!("{}", serde_json::to_string_pretty(&project)?),
            }
            Ok(true)
        }
        Commands::Deploy { path, bot, checkout } => {
            let services = ctx.services().await?;
            let bot = bot.as_deref().map(Into::into);
            match load_manifest(&path)? {
                Manifest::Single(single) => {
                    let svc = services.deploy(single, bot, checkout).await?;
                    print_service(out, &svc)?;
                    Ok(true)
                }
                pipeline @ Manifest::Pipeline(_) => {
                    if checkout {
                        warn!("--checkout ignored for pipeline manifests");
                    }
                    let report = services.deploy_manifest(pipeline, bot).await?;
                    print_report(out, &report)?;
                    Ok(!report.has_failures())
                }
            }
        }
        Commands::Teardown { path } => {
            let report = ctx.services().await?.tear_down(&path).await?;
            print_teardown(out, &report)?;
            Ok(!report.has_failures())
        }
        Commands::Ls { name, package_id } => {
            let list = ctx.services().await?.list(name.as_deref(), package_id.as_deref()).await?;
            match out {
                Output::Human => {
                    println!("{:<26} {:<32} {:<12} BOT", "ID", "NAME", "POD");
                    for s in &list {
                        println!("{:<26} {:<32} {:<12} {}", s.id, s.name, s.pod_type().unwrap_or("-"), s.bot_user_name.as_deref().unwrap_or("-"));
                    }
                }
                Output::Json => println!("{}", serde_json::to_string_pretty(&list)?),
            }
            Ok(true)
        }
        Commands::Get { target } => {
            let svc = ctx.services().await?.get(&target.selector()).await?;
            print_service(out, &svc)?;
            Ok(true)
        }
        Commands::Checkout { target } => {
            let svc = ctx.services().await?.checkout(&target.selector()).await?;
            match out {
                Output::Human => println!("checked out service {} ({})", svc.name, svc.id),
                Output::Json => println!("{}", serde_json::to_string_pretty(&svc)?),
            }
            Ok(true)
        }
        Commands::Status { target } => {
            let status = ctx.services().await?.status(&target.selector()).await?;
            println!("{}", serde_json::to_string_pretty(&status)?);
            Ok(true)
        }
        Commands::Rm { target } => {
            ctx.services().await?.delete(&target.selector()).await?;
            if out == Output::Human {
                println!("deleted");
            }
            Ok(true)
        }
        Commands::Logs { target, size, start, end } => {
            let services = ctx.services().await?;
            let q = LogQuery { size, checkpoint: None, start, end };
            let mut handle = services.follow(&target.selector(), q).await?;
            loop {
                tokio::select! {
                    next = handle.rx.recv() => {
                        match next {
                            Some(Ok(chunk)) => println!("{}", chunk.line),
                            Some(Err(e)) => return Err(e.into()),
                            None => break,
                        }
                    }
                    _ = signal::ctrl_c() => {
                        info!("Ctrl-C received; stopping log stream");
                        handle.cancel.cancel();
                        break;
                    }
                }
            }
            Ok(true)
        }
        Commands::Exec { target, function, resource, resource_id, input, sync } => {
            let input = exec_input(resource, resource_id, input)?;
            let ex = ctx.services().await?.execute(&target.selector(), function, input, sync).await?;
            match out {
                Output::Human => println!("execution {} status {}", ex.id, status_text(ex.status.as_ref())),
                Output::Json => println!("{}", serde_json::to_string_pretty(&ex)?),
            }
            Ok(true)
        }
    }
}

fn exec_input(resource: Option<ExecResource>, resource_id: Option<String>, raw: Option<String>) -> Result<ExecutionInput> {
    if let Some(text) = raw {
        return Ok(ExecutionInput::Raw(serde_json::from_str(&text).map_err(|e| anyhow!("--input is not JSON: {}", e))?));
    }
    match (resource, resource_id) {
        (Some(r), Some(id)) => ExecutionInput::for_resource(r.into(), id).ok_or_else(|| anyhow!("unsupported resource {:?}", r)),
        (None, Some(_)) => Err(anyhow!("--resource-id needs --resource")),
        _ => Ok(ExecutionInput::None),
    }
}

fn status_text(status: Option<&serde_json::Value>) -> String {
    match status {
        Some(serde_json::Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
        None => "-".to_string(),
    }
}

fn print_service(out: Output, svc: &Service) -> Result<()> {
    match out {
        Output::Human => {
            println!("id:       {}", svc.id);
            println!("name:     {}", svc.name);
            println!("package:  {}", svc.package_id.as_deref().unwrap_or("-"));
            println!("module:   {}", svc.module_name.as_deref().unwrap_or("-"));
            println!("pod:      {}", svc.pod_type().unwrap_or("-"));
            println!("bot:      {}", svc.bot_user_name.as_deref().unwrap_or("-"));
        }
        Output::Json => println!("{}", serde_json::to_string_pretty(svc)?),
    }
    Ok(())
}

fn print_report(out: Output, report: &ReconcileReport) -> Result<()> {
    match out {
        Output::Human => {
            for e in &report.entries {
                println!("{}: {}", e.name, e.outcome);
                for t in &e.triggers {
                    println!("  trigger {}: {}", t.name, t.outcome);
                }
            }
            println!("{}", report.summary());
        }
        Output::Json => println!("{}", serde_json::to_string_pretty(report)?),
    }
    Ok(())
}

fn print_teardown(out: Output, report: &TeardownReport) -> Result<()> {
    match out {
        Output::Human => {
            for (what, reason) in &report.failures {
                println!("{}: failed: {}", what, reason);
            }
            println!("{}", report.summary());
        }
        Output::Json => println!("{}", serde_json::to_string_pretty(report)?),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_parses_deploy_and_exec() {
        let cli = Cli::try_parse_from(["dloopctl", "-o", "json", "deploy", "./svc", "--bot", "b@x", "--checkout"]).unwrap();
        assert_eq!(cli.output, Output::Json);
        match cli.command {
            Commands::Deploy { path, bot, checkout } => {
                assert_eq!(path, PathBuf::from("./svc"));
                assert_eq!(bot.as_deref(), Some("b@x"));
                assert!(checkout);
            }
            other => panic!("unexpected {:?}", other),
        }

        let cli = Cli::try_parse_from(["dloopctl", "exec", "--name", "svc", "--resource", "item", "--resource-id", "i1", "--sync"]).unwrap();
        let Commands::Exec { target, resource, resource_id, sync, .. } = cli.command else { panic!("expected exec") };
        assert_eq!(target.selector(), ServiceSelector::Name("svc".into()));
        assert_eq!(resource, Some(ExecResource::Item));
        assert_eq!(resource_id.as_deref(), Some("i1"));
        assert!(sync);
    }

    #[test]
    fn exec_input_shapes() {
        let i = exec_input(Some(ExecResource::Dataset), Some("d".into()), None).unwrap();
        assert_eq!(i, ExecutionInput::Dataset("d".into()));
        let raw = exec_input(None, None, Some(r#"{"a":1}"#.into())).unwrap();
        assert_eq!(raw, ExecutionInput::Raw(serde_json::json!({"a": 1})));
        assert!(exec_input(None, Some("x".into()), None).is_err());
        assert!(exec_input(None, None, Some("{".into())).is_err());
    }

    #[test]
    fn project_checkout_parses() {
        let cli = Cli::try_parse_from(["dloopctl", "project", "checkout", "p1"]).unwrap();
        assert!(matches!(cli.command, Commands::Project { command: ProjectCommands::Checkout { ref id } } if id == "p1"));
    }
}
