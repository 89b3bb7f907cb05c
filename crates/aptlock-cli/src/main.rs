mod commands;

use aptlock_core::BuilderConfig;
use aptlock_schema::{LOCK_FILENAME, MANIFEST_FILENAME};
use clap::{Parser, Subcommand};
use clap_complete::Shell;
use commands::{Context, Failure, EXIT_FAILURE};
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

/// Time given to in-flight container cleanup after an interrupt.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Parser)]
#[command(
    name = "aptlock",
    version,
    about = "Lockfiles and reproducible builds for Debian container images"
)]
struct Cli {
    /// Directory containing the manifest and lock file.
    #[arg(short, long, default_value = ".", global = true)]
    dir: PathBuf,

    /// Manifest file name, relative to --dir.
    #[arg(short, long, default_value = MANIFEST_FILENAME, global = true)]
    manifest: String,

    /// Lock file name, relative to --dir.
    #[arg(short, long, default_value = LOCK_FILENAME, global = true)]
    lockfile: String,

    /// Builder config file (default: $APTLOCK_CONFIG or ~/.config/aptlock/config.toml).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log level.
    #[arg(
        long,
        default_value = "info",
        global = true,
        value_parser = ["error", "warn", "info", "debug", "trace"]
    )]
    log_level: String,

    /// Shortcut for --log-level debug.
    #[arg(short, long, default_value_t = false, global = true)]
    verbose: bool,

    /// Output results as structured JSON.
    #[arg(long, default_value_t = false, global = true)]
    json: bool,

    /// Overall deadline in seconds (overrides config).
    #[arg(long, global = true)]
    timeout: Option<u64>,

    /// Caching HTTP proxy used during package downloads (overrides config).
    #[arg(long, global = true)]
    proxy: Option<String>,

    /// Echo build output to stderr.
    #[arg(long, default_value_t = false, global = true)]
    progress: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Build the final image, pinned by the lock file when present.
    Build,
    /// Rebuild the package set and rewrite the lock file.
    #[command(alias = "lock")]
    Update {
        /// Ignore the existing lock file while resolving.
        #[arg(long, default_value_t = false)]
        fresh: bool,
    },
    /// Build the image and import its root filesystem under the manifest's image name.
    Export {
        /// Also write the root filesystem tarball here.
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Print the generated build specification.
    Dockerfile,
    /// Generate shell completions for bash, zsh, fish, elvish, or powershell.
    Completions {
        /// Shell to generate completions for.
        shell: Shell,
    },
    /// Generate man pages in the specified directory.
    ManPages {
        /// Output directory for man pages.
        #[arg(default_value = "man")]
        dir: PathBuf,
    },
}

fn main() -> ExitCode {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        let msg = info.to_string();
        if msg.contains("Broken pipe")
            || msg.contains("broken pipe")
            || msg.contains("os error 32")
            || msg.contains("failed printing to stdout")
        {
            std::process::exit(0);
        }
        default_hook(info);
    }));

    let cli = Cli::parse();

    let default_level = if cli.verbose {
        "debug"
    } else {
        cli.log_level.as_str()
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_env("APTLOCK_LOG")
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let result = match &cli.command {
        Commands::Completions { shell } => commands::completions::run::<Cli>(*shell),
        Commands::ManPages { dir } => commands::man_pages::run::<Cli>(dir),
        _ => context(&cli).and_then(|ctx| dispatch(&cli.command, &ctx)),
    };

    match result {
        Ok(code) => ExitCode::from(code),
        Err(failure) => {
            eprintln!("error: {failure}");
            ExitCode::from(failure.code)
        }
    }
}

fn context(cli: &Cli) -> Result<Context, Failure> {
    let mut config = BuilderConfig::resolve(cli.config.as_deref())?;
    if let Some(secs) = cli.timeout {
        config.timeout_secs = secs;
    }
    if let Some(proxy) = &cli.proxy {
        config.proxy = Some(proxy.clone());
    }
    config.validate()?;
    tracing::debug!(?config, "resolved builder config");

    Ok(Context {
        dir: cli.dir.clone(),
        manifest_name: cli.manifest.clone(),
        lock_name: cli.lockfile.clone(),
        config,
        json: cli.json,
        progress: cli.progress,
    })
}

fn dispatch(command: &Commands, ctx: &Context) -> Result<u8, Failure> {
    match command {
        Commands::Dockerfile => commands::dockerfile::run(ctx),
        Commands::Completions { .. } | Commands::ManPages { .. } => Err(Failure::new(
            EXIT_FAILURE,
            "command does not take a project context",
        )),
        Commands::Build | Commands::Update { .. } | Commands::Export { .. } => {
            run_with_engine(command, ctx)
        }
    }
}

/// Run an engine-backed command to completion or until Ctrl-C.
///
/// Dropping the operation on interrupt hands its containers to cleanup tasks,
/// which get a short grace period before the runtime shuts down.
fn run_with_engine(command: &Commands, ctx: &Context) -> Result<u8, Failure> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| Failure::new(EXIT_FAILURE, format!("starting async runtime: {e}")))?;

    let result = runtime.block_on(async {
        let builder = match ctx.builder() {
            Ok(builder) => builder,
            Err(failure) => return Err(failure),
        };
        let operation = async {
            match command {
                Commands::Build => commands::build::run(ctx, &builder).await,
                Commands::Update { fresh } => commands::update::run(ctx, &builder, *fresh).await,
                Commands::Export { output } => {
                    commands::export::run(ctx, &builder, output.as_deref()).await
                }
                _ => Err(Failure::new(EXIT_FAILURE, "command does not use a build engine")),
            }
        };
        let result = tokio::select! {
            result = operation => result,
            _ = tokio::signal::ctrl_c() => {
                tracing::warn!("interrupted, cleaning up");
                Err(Failure::new(EXIT_FAILURE, "interrupted"))
            }
        };
        builder.finish_cleanup(SHUTDOWN_GRACE).await;
        result
    });
    runtime.shutdown_timeout(SHUTDOWN_GRACE);
    result
}
