//! Command-line argument parsing.
//!
//! Usage:
//!   strand [-f[<file>]] [-t<seconds>] [-c<expr>] [-q] [<script-file>]

use std::path::PathBuf;

use directories::ProjectDirs;

// ── Public types ──────────────────────────────────────────────────────────

/// Parsed command-line arguments.
#[derive(Debug, Default)]
pub struct CliArgs {
    /// Init-script specification (`-f[<file>]`).
    pub init: InitScript,
    /// Expression to evaluate and print (`-c<expr>`).
    pub command: Option<String>,
    /// Total run-time limit in seconds (`-t<seconds>`).
    pub time_limit: Option<f64>,
    /// Suppress the banner (`-q`).
    pub quiet: bool,
    /// Script file to run (positional).
    pub script: Option<PathBuf>,
}

/// How to choose the init script evaluated before anything else.
#[derive(Debug, Default, PartialEq, Eq)]
pub enum InitScript {
    /// Search the standard locations (default).
    #[default]
    Search,
    /// `-f` with no file argument: skip the init script.
    Skip,
    /// `-f<file>`: load this specific file.
    Explicit(PathBuf),
}

// ── Parsing ───────────────────────────────────────────────────────────────

/// Parse `std::env::args()` and return [`CliArgs`] or an error message.
pub fn parse_args() -> Result<CliArgs, String> {
    let raw: Vec<String> = std::env::args().collect();
    parse_argv(&raw[1..])
}

/// Parse a slice of argument strings (exposed for testing).
pub fn parse_argv(argv: &[String]) -> Result<CliArgs, String> {
    let mut args = CliArgs::default();
    let mut positional: Vec<String> = Vec::new();
    let mut i = 0;

    while i < argv.len() {
        let arg = argv[i].as_str();

        // `--` ends flag processing.
        if arg == "--" {
            i += 1;
            positional.extend(argv[i..].iter().cloned());
            break;
        }

        // Non-flag argument.
        if !arg.starts_with('-') || arg == "-" {
            positional.push(arg.to_owned());
            i += 1;
            continue;
        }

        // Flag argument: iterate over characters after the leading `-`.
        let chars: Vec<char> = arg[1..].chars().collect();
        let mut j = 0;
        while j < chars.len() {
            match chars[j] {
                'q' => args.quiet = true,

                // -f[<file>]
                'f' => {
                    if j + 1 < chars.len() {
                        // Embedded: -f<file>
                        let file: String = chars[j + 1..].iter().collect();
                        args.init = InitScript::Explicit(PathBuf::from(file));
                        j = chars.len(); // consumed rest of this arg
                    } else if i + 1 < argv.len() && !argv[i + 1].starts_with('-') {
                        // Separate: -f <file>
                        i += 1;
                        args.init = InitScript::Explicit(PathBuf::from(&argv[i]));
                    } else {
                        // -f alone → skip the init script
                        args.init = InitScript::Skip;
                    }
                }

                // -c<expr>
                'c' => {
                    let expr = if j + 1 < chars.len() {
                        let s: String = chars[j + 1..].iter().collect();
                        j = chars.len();
                        s
                    } else if i + 1 < argv.len() {
                        i += 1;
                        argv[i].clone()
                    } else {
                        return Err("-c requires an expression argument".to_owned());
                    };
                    args.command = Some(expr);
                }

                // -t<seconds>
                't' => {
                    let secs = if j + 1 < chars.len() {
                        let s: String = chars[j + 1..].iter().collect();
                        j = chars.len();
                        s
                    } else if i + 1 < argv.len() {
                        i += 1;
                        argv[i].clone()
                    } else {
                        return Err("-t requires a seconds argument".to_owned());
                    };
                    let secs: f64 = secs
                        .parse()
                        .map_err(|_| format!("invalid time limit: {secs}"))?;
                    if secs <= 0.0 {
                        return Err(format!("time limit must be positive: {secs}"));
                    }
                    args.time_limit = Some(secs);
                }

                c => return Err(format!("unknown option: -{c}")),
            }
            j += 1;
        }
        i += 1;
    }

    // Positional argument → script file.
    match positional.len() {
        0 => {}
        1 => args.script = Some(PathBuf::from(positional.remove(0))),
        n => return Err(format!("too many arguments ({n})")),
    }

    Ok(args)
}

// ── Path helpers ──────────────────────────────────────────────────────────

/// Search for the init script in the standard locations.
/// Returns the first path that exists, or `None`.
pub fn find_init_script() -> Option<PathBuf> {
    if let Some(dirs) = ProjectDirs::from("", "", "strand") {
        let path = dirs.config_dir().join("init.strand");
        if path.exists() {
            return Some(path);
        }
    }
    let home = std::env::var("HOME").unwrap_or_default();
    [format!("{home}/.strandrc"), "./.strandrc".to_owned()]
        .into_iter()
        .map(PathBuf::from)
        .find(|p| p.exists())
}

// ── Tests ─────────────────────────────────────────────────────────────────
