use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use miette::{IntoDiagnostic, Result};
use tracing_subscriber::{fmt, EnvFilter};

use rolegate::credential::{Hs256Verifier, Identity};
use rolegate::discovery;
use rolegate::errors::GateError;
use rolegate::policy::{codec, compiler, matcher, path, Edge, PolicyHandle};
use rolegate::settings::Settings;
use rolegate::web::{self, AppState};

#[derive(Parser, Debug)]
#[command(
    name = "rolegate",
    version,
    about = "Role-to-route access gate"
)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "rolegate.toml")]
    config: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the forward-auth gate and the admin policy API
    Serve,
    /// Compile an edge list (JSON array of {from, to}) into the policy artifact
    Compile {
        /// Edge list exported from the graph editor
        edges: PathBuf,
        /// Output artifact; defaults to policy.artifact from the configuration
        #[arg(short, long)]
        out: Option<PathBuf>,
    },
    /// Check whether a role may reach a path under the current artifact
    Check {
        #[arg(long)]
        role: String,
        #[arg(long)]
        path: String,
    },
    /// List page routes found under discovery.pages_dir
    Pages,
    /// Sign a development credential with keys.jwt_secret
    MintToken {
        #[arg(long)]
        subject: String,
        #[arg(long)]
        role: String,
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        email: Option<String>,
        /// Mark the identity as having passed verification
        #[arg(long)]
        verified: bool,
        #[arg(long, default_value_t = 3600)]
        ttl_secs: u64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // logging
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(env_filter).init();

    let cli = Cli::parse();

    // load settings
    let settings = Settings::load(&cli.config)?;
    tracing::info!(?settings, "Loaded configuration");

    match cli.command {
        Command::Serve => {
            let state = AppState::from_settings(settings)?;
            web::serve(state).await?;
        }
        Command::Compile { edges, out } => {
            let contents = std::fs::read_to_string(&edges).into_diagnostic()?;
            let edges: Vec<Edge> = serde_json::from_str(&contents).map_err(GateError::from)?;
            let report = compiler::compile(&edges);

            let out = out.or(settings.policy.artifact).ok_or_else(|| {
                GateError::Misconfigured("no output given and policy.artifact is unset".into())
            })?;
            codec::save(&out, &report.table)?;
            println!(
                "{}: {} roles, {} grants ({} skipped, {} duplicate edges)",
                out.display(),
                report.table.role_count(),
                report.table.grant_count(),
                report.skipped,
                report.duplicates
            );
        }
        Command::Check { role, path: raw } => {
            let table = PolicyHandle::from_settings(&settings.policy)?.snapshot();
            let normalized = path::normalize(&raw);
            let verdict = match table.routes_for(&role) {
                None => "unknown role".to_string(),
                Some(routes) if matcher::is_allowed(&normalized, routes) => "allowed".to_string(),
                Some(_) => "denied".to_string(),
            };
            println!("{role} -> /{normalized}: {verdict}");
        }
        Command::Pages => {
            for page in discovery::discover_pages(&settings.discovery)? {
                println!("{page}");
            }
        }
        Command::MintToken {
            subject,
            role,
            name,
            email,
            verified,
            ttl_secs,
        } => {
            let verifier = Hs256Verifier::from_keys(&settings.keys)?;
            let identity = Identity {
                subject_id: subject,
                role,
                display_name: name,
                email,
                verified,
            };
            println!("{}", verifier.issue(&identity, Duration::from_secs(ttl_secs))?);
        }
    }
    Ok(())
}
