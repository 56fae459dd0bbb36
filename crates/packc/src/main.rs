use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use packc::c_backend::CBackend;
use packc::config::GenerationConfig;
use packc::diagnostics::Report;
use packc::emit::RecordingBackend;
use packc::generate::{CompilationContext, GenerateRequest};
use packc::options::{resolve_unit, OptionsCache};
use packc::schema::SchemaDoc;

#[derive(Parser)]
#[command(name = "packc")]
#[command(about = "Schema-driven bitpack code generator (schema JSON -> C).", long_about = None)]
struct Cli {
    #[command(subcommand)]
    cmd: Cmd,
}

#[derive(Subcommand)]
enum Cmd {
    /// Resolve every field and report diagnostics without generating code.
    Check {
        #[arg(long)]
        schema: PathBuf,
        #[arg(long)]
        config: Option<PathBuf>,
        #[arg(long)]
        report_json: bool,
    },
    /// Generate serialization procedures.
    Generate {
        #[arg(long)]
        schema: PathBuf,
        #[arg(long)]
        config: Option<PathBuf>,
        /// Name of the top-level decode procedure.
        #[arg(long)]
        read_proc: Option<String>,
        /// Name of the top-level encode procedure.
        #[arg(long)]
        write_proc: Option<String>,
        /// Target-language type of the root value (defaults to the root
        /// type name).
        #[arg(long)]
        value_type: Option<String>,
        #[arg(long)]
        out: Option<PathBuf>,
        #[arg(long)]
        report_json: bool,
    },
    /// Compute the layout and answer field-location queries.
    Query {
        #[arg(long)]
        schema: PathBuf,
        #[arg(long)]
        config: Option<PathBuf>,
        /// Dotted field path, e.g. `party[2].hp`. Repeatable.
        #[arg(long = "path")]
        paths: Vec<String>,
    },
}

fn main() -> std::process::ExitCode {
    match try_main() {
        Ok(code) => code,
        Err(err) => {
            eprintln!("{err:#}");
            std::process::ExitCode::from(2)
        }
    }
}

fn load_inputs(
    schema_path: &PathBuf,
    config_path: &Option<PathBuf>,
) -> Result<(SchemaDoc, GenerationConfig)> {
    let schema_bytes = std::fs::read(schema_path)
        .with_context(|| format!("read schema: {}", schema_path.display()))?;
    let schema = SchemaDoc::from_json_bytes(&schema_bytes)
        .map_err(|e| anyhow::anyhow!("{}: {e}", schema_path.display()))?;
    let config = match config_path {
        Some(path) => {
            let bytes = std::fs::read(path)
                .with_context(|| format!("read config: {}", path.display()))?;
            GenerationConfig::from_json_bytes(&bytes)
                .map_err(|e| anyhow::anyhow!("{}: {e}", path.display()))?
        }
        None => GenerationConfig::default(),
    };
    Ok((schema, config))
}

fn emit_report(report: &Report, as_json: bool) -> Result<()> {
    if as_json {
        println!("{}", report.to_json_string());
    } else {
        for d in &report.diagnostics {
            match &d.path {
                Some(path) => eprintln!("{}: {} ({})", d.code, d.message, path),
                None => eprintln!("{}: {}", d.code, d.message),
            }
        }
    }
    Ok(())
}

fn try_main() -> Result<std::process::ExitCode> {
    let cli = Cli::parse();

    match cli.cmd {
        Cmd::Check {
            schema,
            config,
            report_json,
        } => {
            let (schema, config) = load_inputs(&schema, &config)?;
            let mut cache = OptionsCache::new();
            let mut diags = Vec::new();
            let ok = resolve_unit(&mut cache, &config, &schema, &mut diags);
            let report = Report::ok().with_diagnostics(diags);
            emit_report(&report, report_json)?;
            Ok(if ok {
                std::process::ExitCode::SUCCESS
            } else {
                std::process::ExitCode::from(1)
            })
        }
        Cmd::Generate {
            schema,
            config,
            read_proc,
            write_proc,
            value_type,
            out,
            report_json,
        } => {
            let (schema, config) = load_inputs(&schema, &config)?;
            let request = GenerateRequest {
                read_proc,
                write_proc,
                value_type,
            };
            let mut ctx = CompilationContext::new(config.clone());
            let mut backend = CBackend::new(&config);
            match ctx.generate(&schema, &request, &mut backend) {
                Ok(output) => {
                    let mut src = CBackend::prelude(&config);
                    src.push_str(&backend.finish());
                    match out {
                        Some(path) => {
                            if let Some(parent) = path.parent() {
                                std::fs::create_dir_all(parent).with_context(|| {
                                    format!("create output dir: {}", parent.display())
                                })?;
                            }
                            std::fs::write(&path, src.as_bytes())
                                .with_context(|| format!("write: {}", path.display()))?;
                        }
                        None => print!("{src}"),
                    }
                    if report_json {
                        println!("{}", ctx.report(Some(&output)).to_json_string());
                    }
                    Ok(std::process::ExitCode::SUCCESS)
                }
                Err(err) => {
                    if report_json {
                        println!("{}", ctx.report(None).to_json_string());
                        return Ok(std::process::ExitCode::from(1));
                    }
                    emit_report(&ctx.report(None), false)?;
                    anyhow::bail!("{err}");
                }
            }
        }
        Cmd::Query {
            schema,
            config,
            paths,
        } => {
            let (schema, config) = load_inputs(&schema, &config)?;
            let request = GenerateRequest {
                read_proc: Some("packc_read".to_string()),
                ..GenerateRequest::default()
            };
            let mut ctx = CompilationContext::new(config);
            let mut backend = RecordingBackend::new();
            ctx.generate(&schema, &request, &mut backend)
                .map_err(|e| anyhow::anyhow!("{e}"))?;
            let layout = ctx
                .layout_query()
                .ok_or_else(|| anyhow::anyhow!("internal error: layout cache missing"))?;
            let mut ok = true;
            let mut results = Vec::new();
            for path in &paths {
                match layout.query(path) {
                    Some(loc) => results.push(serde_json::json!({
                        "path": path,
                        "sector": loc.sector,
                        "bit_offset": loc.bit_offset,
                        "bit_size": loc.bit_size,
                    })),
                    None => {
                        ok = false;
                        results.push(serde_json::json!({
                            "path": path,
                            "error": "no such field in the layout",
                        }));
                    }
                }
            }
            println!("{}", serde_json::to_string_pretty(&results)?);
            Ok(if ok {
                std::process::ExitCode::SUCCESS
            } else {
                std::process::ExitCode::from(1)
            })
        }
    }
}
