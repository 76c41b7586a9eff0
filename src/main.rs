use clap::{Args, Parser, Subcommand, ValueEnum};
use exectest::config::{self, SandboxDir};
use exectest::harness::Harness;
use exectest::runner::{self, SchemeResult};
use exectest::scheme::{self, Strictness};
use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;

#[derive(Clone, Copy, Default, ValueEnum)]
enum OutputFormat {
    /// Human-readable output with checkmarks
    #[default]
    Human,
    /// Machine-readable JSON output
    Json,
    /// JUnit XML output for CI systems
    Junit,
}

#[derive(Parser)]
#[command(name = "exectest")]
#[command(about = "Declarative tests for executables, written as scheme files")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Args, Clone, Copy)]
struct StrictnessArgs {
    /// Reject unknown directives and repeated declarations
    #[arg(long, conflicts_with = "warn")]
    strict: bool,
    /// Report unknown directives and repeated declarations as warnings
    #[arg(long)]
    warn: bool,
}

impl StrictnessArgs {
    fn resolve(self, configured: Strictness) -> Strictness {
        if self.strict {
            Strictness::Strict
        } else if self.warn {
            Strictness::Warn
        } else {
            configured
        }
    }
}

#[derive(Subcommand)]
enum Command {
    /// Run scheme files against a program
    Run {
        /// Path to scheme files (file or directory)
        path: PathBuf,
        /// Program under test (overrides suite config)
        #[arg(short, long)]
        program: Option<String>,
        /// Output format
        #[arg(short, long, default_value = "human")]
        output: OutputFormat,
        /// Filter schemes by file name (substring match)
        #[arg(short, long)]
        filter: Option<String>,
        /// Show verbose output (warnings, plan summary)
        #[arg(short, long)]
        verbose: bool,
        /// Directory for fixture roots (overrides suite config).
        /// Use "local" for .exectest/<timestamp>/, or specify a path.
        #[arg(long)]
        sandbox_dir: Option<String>,
        #[command(flatten)]
        strictness: StrictnessArgs,
    },
    /// Parse scheme files without running them
    Validate {
        /// Path to scheme files (file or directory)
        path: PathBuf,
        #[command(flatten)]
        strictness: StrictnessArgs,
    },
    /// Print the parsed plan of one scheme as JSON
    Plan {
        /// Scheme file
        file: PathBuf,
    },
    /// Scaffold a new scheme file
    Init {
        /// Output path for the new scheme file
        #[arg(default_value = "tests/example.scheme")]
        path: PathBuf,
    },
    /// Output the suite configuration schema
    Schema,
}

fn main() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .try_init();

    let cli = Cli::parse();

    match cli.command {
        Command::Run {
            path,
            program,
            output,
            filter,
            verbose,
            sandbox_dir,
            strictness,
        } => run(RunArgs {
            path,
            program,
            output,
            filter,
            verbose,
            sandbox_dir,
            strictness,
        }),
        Command::Validate { path, strictness } => validate(&path, strictness),
        Command::Plan { file } => {
            let scheme = read_or_exit(&file);
            match scheme::parse(&scheme, Path::new(exectest::vars::DIR_PLACEHOLDER)) {
                Ok(plan) => {
                    let json =
                        serde_json::to_string_pretty(&plan).expect("Failed to serialize plan");
                    println!("{json}");
                }
                Err(e) => {
                    eprintln!("✗ {}: {e}", file.display());
                    std::process::exit(1);
                }
            }
        }
        Command::Init { path } => {
            let template = r#"--file:input.txt
hello
--arg:input.txt
--stdout
hello
--return-code:0
"#;
            if path.exists() {
                eprintln!("Error: file already exists: {}", path.display());
                std::process::exit(1);
            }
            if let Some(parent) = path.parent()
                && !parent.as_os_str().is_empty()
                && !parent.exists()
                && let Err(e) = fs::create_dir_all(parent)
            {
                eprintln!("Error creating directory: {e}");
                std::process::exit(1);
            }
            if let Err(e) = fs::write(&path, template) {
                eprintln!("Error writing file: {e}");
                std::process::exit(1);
            }
            println!("Created: {}", path.display());
        }
        Command::Schema => {
            let schema = config::generate_schema();
            let json = serde_json::to_string_pretty(&schema).expect("Failed to serialize schema");
            println!("{json}");
        }
    }
}

struct RunArgs {
    path: PathBuf,
    program: Option<String>,
    output: OutputFormat,
    filter: Option<String>,
    verbose: bool,
    sandbox_dir: Option<String>,
    strictness: StrictnessArgs,
}

fn run(args: RunArgs) {
    if args.verbose
        && let Some(ref f) = args.filter
    {
        eprintln!("Filtering schemes by: {f:?}");
    }

    let test_root = test_root(&args.path);
    let mut suite_config = match config::load_suite_config(&test_root) {
        Ok(config) => config.unwrap_or_default(),
        Err(e) => {
            eprintln!("Error loading suite config: {e}");
            std::process::exit(1);
        }
    };
    if let Some(dir) = args.sandbox_dir {
        suite_config.sandbox_dir = Some(SandboxDir::from(dir));
    }

    let Some(program) = args.program.or_else(|| suite_config.program.clone()) else {
        eprintln!("Error: no program given (use --program or set `program` in the suite config)");
        std::process::exit(1);
    };
    let program = runner::resolve_program(&program, &test_root);

    let mut scheme_paths = find_or_exit(&args.path);
    if let Some(ref f) = args.filter {
        scheme_paths.retain(|p| p.file_name().is_some_and(|n| n.to_string_lossy().contains(f)));
    }
    if scheme_paths.is_empty() {
        eprintln!("No scheme files found at: {}", args.path.display());
        std::process::exit(1);
    }

    let harness = Harness::new()
        .strictness(args.strictness.resolve(suite_config.strictness))
        .roots(suite_config.roots(&test_root));

    let run_start = Instant::now();
    let results = runner::run_schemes(&harness, &suite_config, &program, &scheme_paths);
    let total_time = run_start.elapsed();

    let total_passed = results.iter().filter(|r| r.passed).count();
    let total_failed = results.len() - total_passed;

    match args.output {
        OutputFormat::Human => {
            for result in &results {
                print_human(result, args.verbose);
            }
            println!("\n{total_passed} passed, {total_failed} failed");
        }
        OutputFormat::Json => {
            let output = serde_json::json!({
                "passed": total_passed,
                "failed": total_failed,
                "results": results,
            });
            println!(
                "{}",
                serde_json::to_string_pretty(&output).expect("Failed to serialize")
            );
        }
        OutputFormat::Junit => {
            print!("{}", format_junit_xml(&results, total_time));
        }
    }

    if total_failed > 0 {
        std::process::exit(1);
    }
}

fn print_human(result: &SchemeResult, verbose: bool) {
    if result.passed {
        println!("✓ {} ({:.2?})", result.name, result.duration);
    } else {
        println!("✗ {} ({:.2?})", result.name, result.duration);
        for failure in &result.failures {
            for line in failure.lines() {
                println!("    {line}");
            }
        }
    }
    if !verbose {
        return;
    }
    for warning in &result.warnings {
        println!("    warning: {warning}");
    }
    if let Some(ref plan) = result.plan {
        println!(
            "    plan: {} file(s), args {:?}, return code {}",
            plan.files.len(),
            plan.args,
            plan.return_code
        );
    }
}

fn validate(path: &Path, strictness: StrictnessArgs) {
    let configured = match config::load_suite_config(&test_root(path)) {
        Ok(config) => config.map(|c| c.strictness).unwrap_or_default(),
        Err(e) => {
            eprintln!("Error loading suite config: {e}");
            std::process::exit(1);
        }
    };
    let strictness = strictness.resolve(configured);

    let schemes = find_or_exit(path);
    if schemes.is_empty() {
        eprintln!("No scheme files found at: {}", path.display());
        std::process::exit(1);
    }

    let mut errors = 0;
    for scheme_path in &schemes {
        let text = match fs::read(scheme_path) {
            Ok(text) => text,
            Err(e) => {
                eprintln!("✗ {}: {e}", scheme_path.display());
                errors += 1;
                continue;
            }
        };
        let root = Path::new(exectest::vars::DIR_PLACEHOLDER);
        match scheme::parse_with(&text, root, strictness) {
            Ok(parsed) => {
                println!("✓ {}", scheme_path.display());
                for warning in &parsed.warnings {
                    println!("    warning: {warning}");
                }
            }
            Err(e) => {
                eprintln!("✗ {}: {e}", scheme_path.display());
                errors += 1;
            }
        }
    }

    if errors > 0 {
        eprintln!("\n{errors} scheme(s) failed validation");
        std::process::exit(1);
    }
    println!("\nAll {} scheme(s) valid", schemes.len());
}

/// Directory holding the suite config for `path`.
fn test_root(path: &Path) -> PathBuf {
    let root = if path.is_file() {
        path.parent().unwrap_or(path)
    } else {
        path
    };
    std::path::absolute(root).unwrap_or_else(|_| root.to_path_buf())
}

fn find_or_exit(path: &Path) -> Vec<PathBuf> {
    match config::find_schemes(path) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("Error finding schemes: {e}");
            std::process::exit(1);
        }
    }
}

fn read_or_exit(path: &Path) -> Vec<u8> {
    match fs::read(path) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("Error reading {}: {e}", path.display());
            std::process::exit(1);
        }
    }
}

/// Format scheme results as JUnit XML, one testsuite with a testcase per file.
fn format_junit_xml(results: &[SchemeResult], total_time: Duration) -> String {
    let mut xml = String::new();
    xml.push_str("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n");

    let tests = results.len();
    let failures = results.iter().filter(|r| !r.passed).count();

    let _ = writeln!(
        xml,
        "<testsuites tests=\"{tests}\" failures=\"{failures}\" time=\"{:.3}\">",
        total_time.as_secs_f64()
    );
    let _ = writeln!(
        xml,
        "  <testsuite name=\"exectest\" tests=\"{tests}\" failures=\"{failures}\" time=\"{:.3}\">",
        total_time.as_secs_f64()
    );

    for result in results {
        let _ = writeln!(
            xml,
            "    <testcase name=\"{}\" time=\"{:.3}\">",
            escape_xml(&result.name),
            result.duration.as_secs_f64()
        );

        if !result.passed {
            let message = result
                .failures
                .first()
                .and_then(|s| s.lines().next())
                .unwrap_or("Scheme failed");
            let _ = writeln!(xml, "      <failure message=\"{}\">", escape_xml(message));
            for failure in &result.failures {
                let _ = writeln!(xml, "{}", escape_xml(failure));
            }
            xml.push_str("      </failure>\n");
        }

        if !result.warnings.is_empty() {
            let _ = writeln!(
                xml,
                "      <system-out>{}</system-out>",
                escape_xml(&result.warnings.join("\n"))
            );
        }

        xml.push_str("    </testcase>\n");
    }

    xml.push_str("  </testsuite>\n");
    xml.push_str("</testsuites>\n");
    xml
}

/// Escape special XML characters.
fn escape_xml(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&apos;")
}
