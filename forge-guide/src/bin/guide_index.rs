//! Build the token index of a regex and print it.

use std::path::PathBuf;

use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use forge_guide::hf::HfTokenizer;
use forge_guide::{Guide, GuideConfig, Instruction, RegexGuide, Vocabulary};

#[derive(Parser)]
#[command(name = "guide-index", about = "Compile a regex into a token-level index")]
struct Cli {
    /// Regular expression the generated text must match
    pattern: String,

    /// Path to a Hugging Face tokenizer.json
    #[arg(long, required_unless_present = "vocabulary", conflicts_with = "vocabulary")]
    tokenizer: Option<PathBuf>,

    /// Path to a plain JSON vocabulary
    #[arg(long)]
    vocabulary: Option<PathBuf>,

    /// Guide configuration (JSON)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Print the whole index as JSON instead of a summary
    #[arg(long)]
    json: bool,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => GuideConfig::from_file(path)?,
        None => GuideConfig::default(),
    };

    let guide = match (&cli.tokenizer, &cli.vocabulary) {
        (Some(path), _) => {
            info!("Loading tokenizer from {}", path.display());
            let tokenizer = HfTokenizer::from_file(path)?;
            RegexGuide::from_regex_with_config(&cli.pattern, &tokenizer, &config)?
        }
        (None, Some(path)) => {
            info!("Loading vocabulary from {}", path.display());
            let vocabulary = Vocabulary::from_file(path)?;
            RegexGuide::from_regex_with_config(&cli.pattern, &vocabulary, &config)?
        }
        (None, None) => anyhow::bail!("either --tokenizer or --vocabulary is required"),
    };

    let index = guide.index();
    if cli.json {
        println!("{}", serde_json::to_string_pretty(index)?);
        return Ok(());
    }

    println!(
        "{} states, {} transitions, {} final",
        index.len(),
        index.num_transitions(),
        index.final_states().len()
    );
    let start = guide.start_state();
    match guide.next_instruction(start) {
        Instruction::Generate(Some(tokens)) => {
            println!("start state {start}: {} allowed tokens", tokens.len())
        }
        Instruction::Generate(None) => println!("start state {start}: unconstrained"),
        Instruction::Write(tokens) => println!("start state {start}: write {tokens:?}"),
    }
    Ok(())
}
