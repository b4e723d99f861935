use std::fs;
use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use pdfrag::api::excerpt;
use pdfrag::config::PipelineArgs;
use pdfrag::context::{BatchReport, SkippedFile};
use pdfrag::rag::DEFAULT_TOP_K;
use pdfrag::{history, telemetry, AppContext, ConversationTurn, ScoredSegment};

#[derive(Parser, Debug)]
#[command(
    name = "pdfrag",
    about = "Index PDFs and ask questions about them from the terminal"
)]
struct RagCli {
    #[command(subcommand)]
    command: Command,

    #[command(flatten)]
    pipeline: PipelineArgs,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Add PDF files to the index; unreadable files are skipped
    Ingest {
        /// PDF files to index
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },
    /// Answer a single question
    Ask {
        /// Question to answer from the indexed documents
        question: String,

        /// Number of segments placed in the prompt
        #[arg(long, default_value_t = DEFAULT_TOP_K)]
        k: usize,

        /// Only print the rendered prompt (skip LLM call)
        #[arg(long, default_value_t = false)]
        dry_run: bool,
    },
    /// Interactive multi-turn session (/save [name], /clear, /exit)
    Chat {
        /// Resume from a saved history file
        #[arg(long)]
        history: Option<PathBuf>,

        /// Directory `/save` writes history files to
        #[arg(long, env = "PDFRAG_HISTORY_DIR", default_value = "./chat_history")]
        history_dir: PathBuf,
    },
    /// Show the nearest segments without generating an answer
    Similar {
        /// Search text
        query: String,

        /// Number of segments to return
        #[arg(long, default_value_t = DEFAULT_TOP_K)]
        k: usize,
    },
    /// Print index and model status
    Status,
    /// Delete every indexed document
    Clear,
}

fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    telemetry::init_tracing();
    let cli = RagCli::parse();
    let settings = cli.pipeline.build_settings()?;
    let context = AppContext::initialize(&settings).context("failed to initialise the pipeline")?;

    match cli.command {
        Command::Ingest { files } => ingest(&context, &files),
        Command::Ask {
            question,
            k,
            dry_run,
        } => ask(&context, &question, k, dry_run),
        Command::Chat {
            history,
            history_dir,
        } => chat(&context, history, &history_dir),
        Command::Similar { query, k } => {
            let hits = context.similar(&query, k)?;
            print_segments(&hits);
            Ok(())
        }
        Command::Status => {
            let status = context.status()?;
            println!("{}", serde_json::to_string_pretty(&status)?);
            Ok(())
        }
        Command::Clear => {
            context.clear()?;
            println!("All documents cleared");
            Ok(())
        }
    }
}

fn ingest(context: &AppContext, files: &[PathBuf]) -> Result<()> {
    let mut loaded = Vec::new();
    let mut report = BatchReport::default();
    for path in files {
        let name = path
            .file_name()
            .and_then(|name| name.to_str())
            .unwrap_or_default()
            .to_string();
        match fs::read(path) {
            Ok(bytes) => loaded.push((name, bytes)),
            Err(err) => report.skipped.push(SkippedFile {
                filename: path.display().to_string(),
                reason: format!("failed to read file: {err}"),
            }),
        }
    }
    let batch = context.ingest_batch(
        loaded
            .iter()
            .map(|(name, bytes)| (name.as_str(), bytes.as_slice())),
    );
    report.ingested = batch.ingested;
    report.skipped.extend(batch.skipped);

    for item in &report.ingested {
        println!(
            "indexed {} ({} bytes, {} chunks, crc32 {:08x})",
            item.filename, item.byte_size, item.chunk_count, item.checksum
        );
    }
    for item in &report.skipped {
        println!("skipped {}: {}", item.filename, item.reason);
    }
    if report.ingested.is_empty() {
        anyhow::bail!("no documents were indexed");
    }
    Ok(())
}

fn ask(context: &AppContext, question: &str, k: usize, dry_run: bool) -> Result<()> {
    if dry_run {
        let prepared = context.prepare(question, &[], k)?;
        println!("--- Prompt ---\n{}\n", prepared.prompt);
        println!("dry-run enabled; skipping LLM call.");
        return Ok(());
    }
    let answer = context.ask(question, k)?;
    println!("--- Answer ---\n{}\n", answer.answer);
    println!("--- Sources ---");
    print_segments(&answer.cited_segments);
    Ok(())
}

fn chat(context: &AppContext, resume: Option<PathBuf>, history_dir: &Path) -> Result<()> {
    let mut turns: Vec<ConversationTurn> = resume
        .as_deref()
        .map(history::load)
        .unwrap_or_default();
    if !turns.is_empty() {
        println!("resumed {} previous turns", turns.len());
    }
    println!("Ask a question, or use /save [name], /clear, /exit.");

    let stdin = io::stdin();
    let mut lines = stdin.lock().lines();
    loop {
        print!("> ");
        io::stdout().flush().context("failed to flush stdout")?;
        let Some(line) = lines.next() else {
            break;
        };
        let line = line.context("failed to read from stdin")?;
        let input = line.trim();
        match input {
            "" => continue,
            "/exit" | "/quit" => break,
            "/clear" => {
                turns.clear();
                println!("history cleared");
            }
            _ if input.starts_with("/save") => {
                let name = input.trim_start_matches("/save").trim();
                let name = (!name.is_empty()).then_some(name);
                let path = history::save(history_dir, &turns, name)?;
                println!("saved {} turns to {}", turns.len(), path.display());
            }
            question => match context.chat(question, &turns) {
                Ok(answer) => {
                    println!("{}\n", answer.answer);
                    for hit in &answer.cited_segments {
                        println!(
                            "  [{} chunk {}] {}",
                            hit.segment.source,
                            hit.segment.sequence_index,
                            excerpt(&hit.segment.text, 80).replace('\n', " ")
                        );
                    }
                    turns = answer.updated_turns;
                }
                Err(err) => eprintln!("error: {err}"),
            },
        }
    }
    Ok(())
}

fn print_segments(hits: &[ScoredSegment]) {
    if hits.is_empty() {
        println!("(no matching segments)");
        return;
    }
    for (idx, hit) in hits.iter().enumerate() {
        println!(
            "{}. {} chunk {} (distance {:.4})\n{}\n---",
            idx + 1,
            hit.segment.source,
            hit.segment.sequence_index,
            hit.distance,
            excerpt(&hit.segment.text, 300)
        );
    }
}
