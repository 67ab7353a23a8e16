use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Result;
use clap::Parser;
use vn_translator_rust::{GlossaryMode, RunState};

#[derive(Parser, Debug)]
#[command(
    name = "vn-translator-rust",
    version,
    about = "Translate extracted visual novel strings through batched LLM/MT APIs"
)]
struct Cli {
    /// Extracted strings (JSON array or {"strings": [...]})
    #[arg(short = 'i', long = "input")]
    input: PathBuf,

    /// Output mapping file (default: <input>.<lang>.json)
    #[arg(short = 'o', long = "output")]
    output: Option<PathBuf>,

    /// Target language (e.g. english, french, ja)
    #[arg(short = 'l', long = "lang")]
    lang: Option<String>,

    /// Source language. Use "auto" to let the provider detect it.
    #[arg(short = 'L', long = "source-lang")]
    source_lang: Option<String>,

    /// Provider or provider:model (openai, claude, deepl)
    #[arg(short = 'p', long = "provider")]
    provider: Option<String>,

    /// Fallback provider[:model], tried in order; repeat for a longer chain
    #[arg(long = "fallback")]
    fallback: Vec<String>,

    /// API key; repeat to rotate across several keys
    #[arg(short = 'k', long = "key")]
    key: Vec<String>,

    /// Maximum strings per request
    #[arg(long = "batch")]
    batch: Option<usize>,

    /// Maximum characters per request
    #[arg(long = "max-chars")]
    max_chars: Option<usize>,

    /// Concurrent requests
    #[arg(short = 'w', long = "workers")]
    workers: Option<usize>,

    /// Glossary file (JSON or CSV)
    #[arg(short = 'g', long = "glossary")]
    glossary: Option<PathBuf>,

    /// Glossary handling: mask, hint or off
    #[arg(long = "glossary-mode")]
    glossary_mode: Option<GlossaryMode>,

    /// Post-processing rules (JSON or sed-style lines)
    #[arg(long = "postprocess")]
    postprocess: Option<PathBuf>,

    /// Tera template replacing the built-in system prompt
    #[arg(long = "prompt-template")]
    prompt_template: Option<PathBuf>,

    /// Directory holding the translation cache
    #[arg(long = "cache-dir")]
    cache_dir: Option<PathBuf>,

    /// Remember strings that fail placeholder checks and skip them next time
    #[arg(long = "skip-invalid")]
    skip_invalid: bool,

    /// Read extra settings from a local TOML file
    #[arg(short = 'r', long = "read-settings")]
    read_settings: Option<String>,

    /// Enable verbose logging
    #[arg(long = "verbose")]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    vn_translator_rust::logging::init(cli.verbose)?;

    let report = vn_translator_rust::run(vn_translator_rust::Config {
        input: cli.input,
        output: cli.output,
        lang: cli.lang,
        source_lang: cli.source_lang,
        provider: cli.provider,
        fallbacks: cli.fallback,
        keys: cli.key,
        batch: cli.batch,
        max_chars: cli.max_chars,
        workers: cli.workers,
        glossary: cli.glossary,
        glossary_mode: cli.glossary_mode,
        postprocess: cli.postprocess,
        prompt_template: cli.prompt_template,
        cache_dir: cli.cache_dir,
        skip_invalid: cli.skip_invalid,
        settings_path: cli.read_settings,
    })
    .await?;

    println!("{}", report.format_summary());
    Ok(match report.state {
        RunState::Completed if report.failed == 0 => ExitCode::SUCCESS,
        RunState::Completed => ExitCode::from(1),
        RunState::Stopped => ExitCode::from(130),
        _ => ExitCode::from(2),
    })
}
