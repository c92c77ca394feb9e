//! codespeak - infer Python function bodies from their stubs
//!
//! Thin CLI over the library: run a managed function through the engine, inspect what the
//! model would be told, clean stale artifacts, or store an API key.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use codespeak::config::{Config, Environment};
use codespeak::declaration::TestFunction;
use codespeak::execute::{Invocation, Receiver};
use codespeak::store::MetadataLoad;
use codespeak::{CodespeakError, Engine};
use serde_json::Value;
use std::collections::BTreeMap;
use std::io::{self, BufRead};
use std::path::{Path, PathBuf};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(
    name = "codespeak",
    about = "Infer, cache and self-correct Python function bodies",
    version
)]
struct Args {
    /// Root of the Python project (defaults to current directory)
    #[arg(long, global = true, default_value = ".")]
    project_root: PathBuf,

    /// Debug logging, including full prompts
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Run committed artifacts only, never generate
    #[arg(long, global = true)]
    prod: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Call a managed function, generating its body if needed
    Infer {
        /// Dotted module path, e.g. `shop.api`
        module: String,
        /// Qualified name inside the module, e.g. `Cart.total`
        qualname: String,
        /// Positional arguments as a JSON array
        #[arg(long)]
        args: Option<String>,
        /// Keyword arguments as a JSON object
        #[arg(long)]
        kwargs: Option<String>,
        /// Receiver for methods: {"module": .., "class": .., "state": {..}}
        #[arg(long)]
        receiver: Option<String>,
        /// Attach a test, `tests/test_file.py::test_name` (repeatable)
        #[arg(long = "test")]
        tests: Vec<String>,
        /// Generate without executing
        #[arg(long)]
        no_exec: bool,
    },
    /// Show the incomplete file, custom types and cache state of a function
    Inspect { module: String, qualname: String },
    /// Remove artifacts whose functions no longer exist
    Clean,
    /// Read an OpenAI API key from stdin and store it in the OS keychain
    SetKey,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.verbose);

    if let Command::SetKey = args.command {
        return set_key();
    }

    let root = args
        .project_root
        .canonicalize()
        .with_context(|| format!("project root {} not found", args.project_root.display()))?;
    let mut config = Config::load(&root)?;
    config.verbose |= args.verbose;
    if args.prod {
        config.environment = Environment::Prod;
    }
    let engine = Engine::from_config(config)?;

    match args.command {
        Command::Infer {
            module,
            qualname,
            args: positional,
            kwargs,
            receiver,
            tests,
            no_exec,
        } => {
            let invocation = if no_exec {
                None
            } else {
                Some(parse_invocation(positional, kwargs, receiver)?)
            };
            infer(&engine, &root, &module, &qualname, &tests, invocation).await
        }
        Command::Inspect { module, qualname } => inspect(&engine, &module, &qualname),
        Command::Clean => {
            let removed = engine.clean();
            println!("removed {} unused artifact(s)", removed);
            Ok(())
        }
        Command::SetKey => Ok(()),
    }
}

fn init_tracing(verbose: bool) {
    let filter = if verbose { "codespeak=debug" } else { "codespeak=info" };
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into()))
        .with(tracing_subscriber::fmt::layer().without_time().with_writer(io::stderr))
        .init();
}

fn parse_invocation(
    positional: Option<String>,
    kwargs: Option<String>,
    receiver: Option<String>,
) -> Result<Invocation> {
    let args: Vec<Value> = match positional {
        Some(text) => serde_json::from_str(&text).context("--args must be a JSON array")?,
        None => Vec::new(),
    };
    let kwargs: BTreeMap<String, Value> = match kwargs {
        Some(text) => serde_json::from_str(&text).context("--kwargs must be a JSON object")?,
        None => BTreeMap::new(),
    };
    let receiver: Option<Receiver> = receiver
        .map(|text| serde_json::from_str(&text))
        .transpose()
        .context("--receiver must be {\"module\", \"class\", \"state\"}")?;
    Ok(Invocation {
        args,
        kwargs,
        receiver,
    })
}

async fn infer(
    engine: &Engine,
    root: &Path,
    module: &str,
    qualname: &str,
    tests: &[String],
    invocation: Option<Invocation>,
) -> Result<()> {
    let mut function = engine.manage(module, qualname)?;
    for target in tests {
        function = function.with_test(TestFunction::from_target(root, target)?);
    }

    match engine.call(&mut function, invocation).await {
        Ok(Some(value)) => {
            println!("{}", serde_json::to_string_pretty(&value)?);
            Ok(())
        }
        Ok(None) => {
            println!("{}", function.paths.logic.display());
            Ok(())
        }
        Err(CodespeakError::Intentional(inner)) => {
            eprintln!("{}", inner);
            std::process::exit(1);
        }
        Err(err) => Err(err.into()),
    }
}

fn inspect(engine: &Engine, module: &str, qualname: &str) -> Result<()> {
    let function = engine.manage(module, qualname)?;
    let declaration = &function.declaration;

    println!("# incomplete file\n{}", declaration.as_incomplete_file());
    println!("# custom types\n{}\n", declaration.custom_types_json()?);
    println!("# digest");
    println!("source_hash: {}", function.digest.source_hash);
    println!("deep_hash:   {}\n", function.digest.deep_hash);

    println!("# artifact");
    println!("logic: {}", function.paths.logic.display());
    match engine.store().load_metadata(&function.paths) {
        MetadataLoad::Missing => println!("metadata: none"),
        MetadataLoad::Corrupt(reason) => println!("metadata: unreadable ({})", reason),
        MetadataLoad::Loaded(metadata) => {
            println!(
                "metadata: did_execute={} has_tests={} did_pass_tests={} updated_at={}",
                metadata.did_execute,
                metadata.has_tests,
                metadata.did_pass_tests,
                metadata.updated_at.to_rfc3339()
            );
        }
    }
    println!(
        "regeneration required: {}",
        engine.needs_codegen(&function, true)
    );
    Ok(())
}

fn set_key() -> Result<()> {
    eprintln!("Paste your OpenAI API key and press Enter:");
    let mut line = String::new();
    io::stdin()
        .lock()
        .read_line(&mut line)
        .context("failed to read API key from stdin")?;
    Config::set_api_key(&line)?;
    println!("  + API key stored in the OS keychain");
    Ok(())
}
