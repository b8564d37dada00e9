//! tern CLI - binary entry point.
//!
//! Two subcommands: `run` evaluates a script under a context granting
//! exactly what its `require` block declares (when `-p required` is
//! passed); `repl` loads the startup script and enters the raw-mode
//! shell. Logging goes to the `.debug.txt` append log in the cwd so the
//! raw-mode terminal is never written to by anything but the shell.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

use tern_engine::{requirements, ScriptEngine, State, SurfaceEngine, Value};
use tern_repl::{Repl, ReplConfig};
use tern_runtime::{Context, Limiter, Permission};

const DEBUG_LOG: &str = ".debug.txt";
const DEFAULT_STARTUP: &str = "startup.tn";

#[derive(Parser)]
#[command(name = "tern", version, about = "Host runtime for the tern scripting language")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Parse, check and evaluate a script.
    Run {
        script: PathBuf,
        /// Grant the permissions the script declares; the only accepted
        /// value is `required`.
        #[arg(short = 'p')]
        perms: Option<String>,
        /// Forwarded to the script's global `args` when it declares
        /// `read cli-args: true`.
        args: Vec<String>,
    },
    /// Enter the interactive shell.
    Repl {
        /// Startup script path (default: $HOME/startup.tn).
        #[arg(short = 'c')]
        startup: Option<PathBuf>,
    },
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info"))
        .unwrap_or_else(|_| EnvFilter::new("warn"));

    let Ok(file) = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(DEBUG_LOG)
    else {
        // No log file is better than corrupting the raw-mode screen.
        return;
    };
    let _ = tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_ansi(false)
                .with_writer(std::sync::Mutex::new(file)),
        )
        .with(env_filter)
        .try_init();
}

/// `read cli-args: true` is honored by the CLI itself; other custom
/// declarations pass through as plain custom permissions.
fn custom_permission(kind: &str, name: &str, value: &serde_json::Value) -> Option<Permission> {
    let _ = (kind, name, value);
    None
}

fn wants_cli_args(decls: &[requirements::RequirementDecl]) -> bool {
    decls.iter().any(|d| {
        matches!(
            d,
            requirements::RequirementDecl::Custom { kind, name, value }
                if kind == "read" && name == "cli-args" && value == &serde_json::Value::Bool(true)
        )
    })
}

async fn cmd_run(script: PathBuf, perms: Option<String>, args: Vec<String>) -> anyhow::Result<()> {
    if let Some(flag) = &perms
        && flag != "required"
    {
        anyhow::bail!("unknown -p value '{flag}' (expected 'required')");
    }

    let source = std::fs::read_to_string(&script)
        .map_err(|e| anyhow::anyhow!("cannot read {}: {e}", script.display()))?;
    let engine: Arc<dyn ScriptEngine> = Arc::new(SurfaceEngine::new());
    let module = engine.parse(&source, &script.display().to_string())?;
    engine.check(&module)?;

    let cwd = std::env::current_dir()?;
    let (required, limits) = requirements::permissions_and_limits(
        &module.requirements,
        &[],
        &custom_permission,
        &cwd,
    )?;

    let granted = if perms.is_some() {
        required
    } else if required.is_empty() {
        Vec::new()
    } else {
        anyhow::bail!(
            "script requires {} permission(s); pass '-p required' to grant them",
            required.len()
        );
    };

    let ctx = Context::new(granted, Limiter::new(limits));
    let mut state = State::new();
    tern_verbs::install(&mut state, Arc::clone(&engine), cwd);
    if wants_cli_args(&module.requirements) {
        state.set("args", Value::list(args.into_iter().map(Value::Str)));
    }

    let result = engine.eval(&module, &mut state, &ctx).await;
    ctx.cancel();
    match result {
        Ok(value) => {
            if !value.is_blank() {
                println!("{value}");
            }
            Ok(())
        }
        Err(err) => Err(err.into()),
    }
}

/// Evaluate the startup script and fold its returned record into a shell
/// configuration plus the context its `require` block asks for.
async fn load_startup(
    engine: &Arc<dyn ScriptEngine>,
    path: &PathBuf,
    cwd: &std::path::Path,
) -> anyhow::Result<(ReplConfig, Context)> {
    let source = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("cannot read startup script {}: {e}", path.display()))?;
    let module = engine.parse(&source, &path.display().to_string())?;
    engine.check(&module)?;

    let (granted, limits) = requirements::permissions_and_limits(
        &module.requirements,
        &[],
        &custom_permission,
        cwd,
    )?;
    let ctx = Context::new(granted, Limiter::new(limits));

    let mut state = State::new();
    tern_verbs::install(&mut state, Arc::clone(engine), cwd.to_path_buf());
    let value = engine.eval(&module, &mut state, &ctx).await?;
    let config = ReplConfig::from_value(&value)?;
    Ok((config, ctx))
}

async fn cmd_repl(startup: Option<PathBuf>) -> anyhow::Result<()> {
    let engine: Arc<dyn ScriptEngine> = Arc::new(SurfaceEngine::new());
    let cwd = std::env::current_dir()?;

    let explicit = startup.is_some();
    let path = startup.or_else(|| dirs::home_dir().map(|h| h.join(DEFAULT_STARTUP)));

    let (config, ctx) = match path {
        Some(path) if path.exists() || explicit => load_startup(&engine, &path, &cwd).await?,
        _ => (
            ReplConfig::default(),
            Context::new(Vec::new(), Limiter::default()),
        ),
    };

    let mut state = State::new();
    tern_verbs::install(&mut state, Arc::clone(&engine), cwd);

    let mut repl = Repl::new(Arc::clone(&engine), state, ctx.clone(), config)?;
    let result = repl.run().await;
    // Stop spawned servers and KV persisters with the session.
    ctx.cancel();
    result?;
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing();
    let cli = Cli::parse();
    let outcome = match cli.command {
        Command::Run {
            script,
            perms,
            args,
        } => cmd_run(script, perms, args).await,
        Command::Repl { startup } => cmd_repl(startup).await,
    };
    match outcome {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("tern: {err}");
            ExitCode::FAILURE
        }
    }
}
