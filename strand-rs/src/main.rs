use std::time::Duration;

use tracing_subscriber::EnvFilter;

use strand::cli::{self, InitScript};
use strand::engine::{ExecutionContext, Scheduler, ScriptingDomain, StartOptions};
use strand::host;

#[tokio::main(flavor = "current_thread")]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = match cli::parse_args() {
        Ok(a) => a,
        Err(e) => {
            eprintln!("strand: {e}");
            eprintln!("Usage: strand [-f[<file>]] [-t<seconds>] [-c<expr>] [-q] [<script-file>]");
            std::process::exit(1);
        }
    };

    if !args.quiet {
        let ver = env!("CARGO_PKG_VERSION");
        eprintln!("strand {ver} — resumable scripting engine");
    }

    let domain = ScriptingDomain::with_standard_functions();
    host::register_host_functions(&domain);
    let ctx = ExecutionContext::new(domain);
    let scheduler = Scheduler::new();

    // ── Init script ───────────────────────────────────────────────────────
    let init_path = match &args.init {
        InitScript::Skip => None,
        InitScript::Explicit(path) => Some(path.clone()),
        InitScript::Search => cli::find_init_script(),
    };
    if let Some(path) = init_path {
        match std::fs::read_to_string(&path) {
            Ok(src) => {
                let result = scheduler.evaluate(&src, &ctx);
                if result.is_error() {
                    eprintln!("strand: error in {}:", path.display());
                    host::report_result(&result, &src);
                }
            }
            Err(e) => eprintln!("strand: warning: {}: {e}", path.display()),
        }
    }

    let time_limit = args.time_limit.map(Duration::from_secs_f64);

    // ── One-shot expression (-c) ──────────────────────────────────────────
    if let Some(expr) = args.command {
        let result = scheduler.evaluate(&expr, &ctx);
        host::report_result(&result, &expr);
        std::process::exit(if result.is_error() { 1 } else { 0 });
    }

    // ── Script file ───────────────────────────────────────────────────────
    if let Some(path) = args.script {
        let src = match std::fs::read_to_string(&path) {
            Ok(s) => s,
            Err(e) => {
                eprintln!("strand: {}: {e}", path.display());
                std::process::exit(1);
            }
        };
        // Keep variables so the init script's definitions stay visible.
        let mut options = StartOptions { keep_vars: true, ..StartOptions::default() };
        if time_limit.is_some() {
            options.max_run_time = time_limit;
        }
        match host::run_source(&scheduler, &src, &ctx, options).await {
            Ok(result) => {
                host::report_result(&result, &src);
                if result.is_error() {
                    std::process::exit(1);
                }
            }
            Err(e) => {
                eprintln!("strand: {e}");
                std::process::exit(1);
            }
        }
        return;
    }

    // ── Interactive ───────────────────────────────────────────────────────
    if !args.quiet {
        eprintln!("Type an expression, or 'exit' to quit.");
    }
    if let Err(e) = host::repl(&scheduler, &ctx, time_limit).await {
        eprintln!("strand: {e}");
        std::process::exit(1);
    }
}
