//! Command-line decoder: load models, recognize WAV files, print N-best.

use anyhow::{bail, Context};
use asr_decoder_rs::audio::WavFileSource;
use asr_decoder_rs::config::DecoderConfig;
use asr_decoder_rs::dict::WordLexicon;
use asr_decoder_rs::engine::Engine;
use asr_decoder_rs::hmm::binio::read_binhmm;
use asr_decoder_rs::lm::arpa::model_from_arpa;
use asr_decoder_rs::lm::dfa::{DfaGrammar, GrammarSet};
use asr_decoder_rs::lm::LangModel;
use clap::Parser;
use std::fs;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(
    name = "asr-decoder",
    about = "Two-pass continuous speech recognition decoder"
)]
struct Args {
    /// Binary acoustic model (BINHMM/BINHMMV2)
    #[arg(long)]
    hmm: PathBuf,

    /// Optional HMMList file mapping logical to physical models
    #[arg(long)]
    hmmlist: Option<PathBuf>,

    /// Word dictionary
    #[arg(long)]
    dict: PathBuf,

    /// Forward ARPA n-gram
    #[arg(long)]
    nlr: Option<PathBuf>,

    /// Backward (reverse) ARPA n-gram for pass 2
    #[arg(long)]
    nrl: Option<PathBuf>,

    /// DFA grammar file (grammar mode)
    #[arg(long)]
    dfa: Option<PathBuf>,

    /// Number of sentences to output
    #[arg(long, default_value_t = 1)]
    nbest: usize,

    /// Pass-1 rank beam width (0 = auto)
    #[arg(long, default_value_t = 0)]
    beam: usize,

    /// LM weights and insertion penalties: pass 1
    #[arg(long, default_value_t = 8.0)]
    lm_weight: f32,
    #[arg(long, default_value_t = -2.0)]
    lm_penalty: f32,

    /// LM weights and insertion penalties: pass 2
    #[arg(long, default_value_t = 8.0)]
    lm_weight2: f32,
    #[arg(long, default_value_t = -2.0)]
    lm_penalty2: f32,

    /// Reject inputs shorter than this many milliseconds
    #[arg(long, default_value_t = 0)]
    reject_short_ms: u32,

    /// CMN/CVN state file to load before and save after decoding
    #[arg(long)]
    cmn: Option<PathBuf>,

    /// Disable monophone-to-triphone conversion in the dictionary
    #[arg(long)]
    no_triphone: bool,

    /// Input WAV files (16-bit mono at the configured rate)
    #[arg(required = true)]
    inputs: Vec<PathBuf>,
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let args = Args::parse();

    let mut config = DecoderConfig::default();
    config.search.nbest = args.nbest;
    config.search.beam_width = args.beam;
    config.search.lm_weight = args.lm_weight;
    config.search.lm_penalty = args.lm_penalty;
    config.search.lm_weight2 = args.lm_weight2;
    config.search.lm_penalty2 = args.lm_penalty2;
    config.reject.reject_short_ms = args.reject_short_ms;

    let mut file = fs::File::open(&args.hmm)
        .with_context(|| format!("cannot open acoustic model {}", args.hmm.display()))?;
    let mut hmm = read_binhmm(&mut file).context("failed to read acoustic model")?;
    if let Some(para) = &hmm.embedded_analysis {
        config.analysis = para.clone();
    }
    match &args.hmmlist {
        Some(path) => {
            let content = fs::read_to_string(path)
                .with_context(|| format!("cannot read {}", path.display()))?;
            hmm.load_hmmlist(&content)?;
        }
        None => hmm.define_logical_from_physical(),
    }

    let dict_text = fs::read_to_string(&args.dict)
        .with_context(|| format!("cannot read dictionary {}", args.dict.display()))?;
    let mut dict = WordLexicon::parse(&dict_text, &mut hmm, !args.no_triphone)
        .map_err(anyhow::Error::msg)?;

    let lm = match (&args.nlr, &args.nrl, &args.dfa) {
        (_, _, Some(dfa_path)) => {
            let dfa_text = fs::read_to_string(dfa_path)
                .with_context(|| format!("cannot read grammar {}", dfa_path.display()))?;
            let dfa = DfaGrammar::parse(&dfa_text)?;
            let mut set = GrammarSet::default();
            set.add_grammar(dfa, 0, dict.num_words() as u32);
            // grammar dictionaries carry the category number in the first
            // field
            let cats: Vec<(u32, u32)> = dict
                .words()
                .filter_map(|(w, word)| word.name.parse::<u32>().ok().map(|c| (w, c)))
                .collect();
            if cats.len() != dict.num_words() {
                bail!("grammar dictionary entries must start with a category number");
            }
            for (w, c) in cats {
                dict.set_category(w, c);
            }
            LangModel::Grammar(set)
        }
        (nlr, nrl, None) => {
            if nlr.is_none() && nrl.is_none() {
                bail!("either an n-gram (--nlr/--nrl) or a grammar (--dfa) is required");
            }
            let fw = nlr
                .as_ref()
                .map(fs::read_to_string)
                .transpose()
                .context("cannot read forward n-gram")?;
            let bw = nrl
                .as_ref()
                .map(fs::read_to_string)
                .transpose()
                .context("cannot read backward n-gram")?;
            let model = model_from_arpa(fw.as_deref(), bw.as_deref())?;
            let _ = dict.set_silence_words("<s>", "</s>");
            LangModel::Ngram(model)
        }
    };

    let mut engine = Engine::new(hmm, dict, lm, config)?;
    if let Some(path) = &args.cmn {
        if path.exists() {
            let content = fs::read_to_string(path)?;
            engine.load_cmn(&content)?;
            log::info!("loaded CMN state from {}", path.display());
        }
    }

    for input in &args.inputs {
        println!("### {}", input.display());
        let mut source = WavFileSource::open(input)
            .map_err(|e| anyhow::anyhow!("cannot open {}: {}", input.display(), e))?;
        let results = engine.run_stream(&mut source)?;
        for res in &results {
            println!("status: {} ({} frames)", res.status, res.num_frames);
            for (rank, sentence) in res.sentences.iter().enumerate() {
                println!(
                    "#{}: {} (score {:.2})",
                    rank + 1,
                    sentence.text(),
                    sentence.score
                );
                for w in &sentence.words {
                    let cm = w
                        .confidence
                        .map(|c| format!(" cm={:.3}", c))
                        .unwrap_or_default();
                    println!(
                        "    {:<16} am={:<10.2} lm={:<8.2}{}",
                        if w.output.is_empty() { "(sil)" } else { &w.output },
                        w.am_score,
                        w.lm_score,
                        cm
                    );
                }
            }
        }
    }

    if let Some(path) = &args.cmn {
        fs::write(path, engine.save_cmn())?;
        log::info!("saved CMN state to {}", path.display());
    }
    Ok(())
}
