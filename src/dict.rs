//! Word dictionary.
//!
//! One word per line:
//!
//! ```text
//! name [OutputString|{TransparentOutput}] [@classprob] [:weight] phone1 phone2 ...
//! ```
//!
//! Monophone pronunciations are converted to word-internal context-dependent
//! names at load (`a-k+i` style), with word-initial and word-final phones
//! left as biphones for cross-word resolution during decoding. Entries whose
//! phones cannot be mapped onto the acoustic model are skipped with a
//! warning, matching the tolerant loader behavior of the rest of the stack.

use crate::hmm::{add_left_context, add_right_context, HmmSet, LogId};

pub type WordId = u32;

const LN10: f32 = std::f32::consts::LN_10;

/// A dictionary word.
#[derive(Debug, Clone)]
pub struct Word {
    /// LM entity name (first dictionary field).
    pub name: String,
    /// Output string reported in results.
    pub output: String,
    /// Transparent words are skipped in LM context histories.
    pub transparent: bool,
    /// In-class log probability (natural log), 0.0 when absent.
    pub class_prob: f32,
    /// Extra per-word insertion weight (natural log), 0.0 when absent.
    pub weight: f32,
    /// Grammar category id, set when loaded as part of a grammar.
    pub category: Option<u32>,
    /// Context-converted pronunciation as logical model ids.
    pub phones: Vec<LogId>,
    /// Base phone names as written in the dictionary.
    pub base_phones: Vec<String>,
}

/// The loaded vocabulary.
#[derive(Debug, Default)]
pub struct WordLexicon {
    words: Vec<Word>,
    head_sil: Option<WordId>,
    tail_sil: Option<WordId>,
}

impl WordLexicon {
    pub fn num_words(&self) -> usize {
        self.words.len()
    }

    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }

    pub fn word(&self, id: WordId) -> &Word {
        &self.words[id as usize]
    }

    pub fn words(&self) -> impl Iterator<Item = (WordId, &Word)> {
        self.words
            .iter()
            .enumerate()
            .map(|(i, w)| (i as WordId, w))
    }

    /// First word with the given LM name.
    pub fn lookup(&self, name: &str) -> Option<WordId> {
        self.words
            .iter()
            .position(|w| w.name == name)
            .map(|i| i as WordId)
    }

    /// Sentence-head silence word (`<s>`).
    pub fn head_sil(&self) -> Option<WordId> {
        self.head_sil
    }

    /// Sentence-tail silence word (`</s>`).
    pub fn tail_sil(&self) -> Option<WordId> {
        self.tail_sil
    }

    /// Mark the sentence head/tail silence words by LM name.
    pub fn set_silence_words(&mut self, head: &str, tail: &str) -> Result<(), String> {
        self.head_sil = self.lookup(head);
        self.tail_sil = self.lookup(tail);
        match (self.head_sil, self.tail_sil) {
            (Some(_), Some(_)) => Ok(()),
            (None, _) => Err(format!("sentence head word {} not in dictionary", head)),
            (_, None) => Err(format!("sentence tail word {} not in dictionary", tail)),
        }
    }

    /// Base name of a word's final phone.
    pub fn last_phone_base(&self, id: WordId) -> &str {
        self.words[id as usize].base_phones.last().unwrap()
    }

    /// Base name of a word's first phone.
    pub fn first_phone_base(&self, id: WordId) -> &str {
        self.words[id as usize].base_phones.first().unwrap()
    }

    /// Add a programmatically built word; pronunciation is converted the
    /// same way as for file loading.
    pub fn add_word(
        &mut self,
        name: &str,
        output: &str,
        base_phones: &[&str],
        hmm: &mut HmmSet,
        triphone: bool,
    ) -> Result<WordId, String> {
        let phones = convert_pronunciation(
            name,
            &base_phones
                .iter()
                .map(|s| s.to_string())
                .collect::<Vec<_>>(),
            hmm,
            triphone,
        )?;
        let id = self.words.len() as WordId;
        self.words.push(Word {
            name: name.to_string(),
            output: output.to_string(),
            transparent: false,
            class_prob: 0.0,
            weight: 0.0,
            category: None,
            phones,
            base_phones: base_phones.iter().map(|s| s.to_string()).collect(),
        });
        Ok(id)
    }

    pub fn set_category(&mut self, id: WordId, category: u32) {
        self.words[id as usize].category = Some(category);
    }

    pub fn set_transparent(&mut self, id: WordId, transparent: bool) {
        self.words[id as usize].transparent = transparent;
    }

    /// Parse dictionary text. `triphone` enables implicit monophone →
    /// triphone conversion.
    pub fn parse(content: &str, hmm: &mut HmmSet, triphone: bool) -> Result<Self, String> {
        let mut lex = WordLexicon::default();
        let mut skipped = 0usize;
        for (lineno, line) in content.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            match parse_line(line) {
                Ok(entry) => {
                    if entry.phones.is_empty() {
                        log::warn!("dict line {}: no phones, skipped", lineno + 1);
                        skipped += 1;
                        continue;
                    }
                    match convert_pronunciation(&entry.name, &entry.phones, hmm, triphone) {
                        Ok(phones) => {
                            lex.words.push(Word {
                                output: entry
                                    .output
                                    .clone()
                                    .unwrap_or_else(|| entry.name.clone()),
                                name: entry.name,
                                transparent: entry.transparent,
                                class_prob: entry.class_prob,
                                weight: entry.weight,
                                category: None,
                                phones,
                                base_phones: entry.phones,
                            });
                        }
                        Err(e) => {
                            log::warn!("dict line {}: {}, skipped", lineno + 1, e);
                            skipped += 1;
                        }
                    }
                }
                Err(e) => {
                    log::warn!("dict line {}: {}, skipped", lineno + 1, e);
                    skipped += 1;
                }
            }
        }
        if lex.words.is_empty() {
            return Err("dictionary contains no usable words".to_string());
        }
        log::info!(
            "dictionary: {} words loaded, {} skipped",
            lex.words.len(),
            skipped
        );
        Ok(lex)
    }
}

struct DictEntry {
    name: String,
    output: Option<String>,
    transparent: bool,
    class_prob: f32,
    weight: f32,
    phones: Vec<String>,
}

fn parse_line(line: &str) -> Result<DictEntry, String> {
    let mut rest = line.trim_start();
    let name_end = rest
        .find(char::is_whitespace)
        .ok_or_else(|| "missing pronunciation".to_string())?;
    let name = rest[..name_end].to_string();
    rest = rest[name_end..].trim_start();

    let mut output = None;
    let mut transparent = false;
    let mut class_prob = 0.0f32;
    let mut weight = 0.0f32;

    loop {
        let first = match rest.chars().next() {
            Some(c) => c,
            None => break,
        };
        match first {
            '[' | '{' => {
                let close = if first == '[' { ']' } else { '}' };
                let end = rest
                    .find(close)
                    .ok_or_else(|| format!("unterminated output string: {}", rest))?;
                output = Some(rest[1..end].to_string());
                transparent = first == '{';
                rest = rest[end + 1..].trim_start();
            }
            '@' => {
                let end = rest.find(char::is_whitespace).unwrap_or(rest.len());
                let v: f32 = rest[1..end]
                    .parse()
                    .map_err(|_| format!("bad class probability: {}", &rest[..end]))?;
                class_prob = v * LN10;
                rest = rest[end..].trim_start();
            }
            ':' => {
                let end = rest.find(char::is_whitespace).unwrap_or(rest.len());
                let v: f32 = rest[1..end]
                    .parse()
                    .map_err(|_| format!("bad word weight: {}", &rest[..end]))?;
                weight = v * LN10;
                rest = rest[end..].trim_start();
            }
            _ => break,
        }
    }

    let phones: Vec<String> = rest.split_whitespace().map(|s| s.to_string()).collect();
    Ok(DictEntry {
        name,
        output,
        transparent,
        class_prob,
        weight,
        phones,
    })
}

/// Convert a monophone pronunciation to word-internal context-dependent
/// logical models: head phone as `c+r` biphone, tail as `l-c`, interior as
/// full triphones. Falls back to the base phone (with a warning) when a
/// context-dependent name resolves to nothing.
fn convert_pronunciation(
    word: &str,
    phones: &[String],
    hmm: &mut HmmSet,
    triphone: bool,
) -> Result<Vec<LogId>, String> {
    let n = phones.len();
    let mut out = Vec::with_capacity(n);
    for i in 0..n {
        let name = if !triphone || n == 1 {
            phones[i].clone()
        } else if i == 0 {
            add_right_context(&phones[i], &phones[i + 1])
        } else if i == n - 1 {
            add_left_context(&phones[i], &phones[i - 1])
        } else {
            add_right_context(&add_left_context(&phones[i], &phones[i - 1]), &phones[i + 1])
        };
        let id = match hmm.logical_or_pseudo(&name) {
            Some(id) => id,
            None => {
                if name != phones[i] {
                    log::warn!(
                        "word {}: model {} not found, falling back to {}",
                        word,
                        name,
                        phones[i]
                    );
                }
                hmm.logical_or_pseudo(&phones[i])
                    .ok_or_else(|| format!("phone {} not in acoustic model", phones[i]))?
            }
        };
        out.push(id);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hmm::binio::left_to_right_trans;
    use crate::hmm::{Gaussian, HmmState, MixturePdf};

    fn model_with_phones(names: &[&str]) -> HmmSet {
        let mut set = HmmSet::new(2);
        let d = set.add_density(Gaussian::from_variance(vec![0.0, 0.0], vec![1.0, 1.0]));
        let s = set.add_state(HmmState {
            streams: vec![MixturePdf {
                weights: vec![0.0],
                dens: vec![d],
            }],
            stream_weights: vec![1.0],
        });
        for name in names {
            let t = set.add_transition(left_to_right_trans(3, 0.5));
            set.add_physical(name, vec![s, s, s], t).unwrap();
        }
        set.define_logical_from_physical();
        set
    }

    #[test]
    fn parses_fields_and_phones() {
        let mut hmm = model_with_phones(&["y", "eh", "s", "sil"]);
        let dict = "\
yes  [yes] y eh s
<s>  {} sil
no   [no] @-0.3 y eh
";
        let lex = WordLexicon::parse(dict, &mut hmm, false).unwrap();
        assert_eq!(lex.num_words(), 3);

        let yes = lex.word(0);
        assert_eq!(yes.name, "yes");
        assert_eq!(yes.output, "yes");
        assert_eq!(yes.base_phones, vec!["y", "eh", "s"]);
        assert!(!yes.transparent);

        let sil = lex.word(1);
        assert!(sil.transparent);
        assert_eq!(sil.output, "");

        let no = lex.word(2);
        assert!((no.class_prob - (-0.3 * LN10)).abs() < 1e-6);
    }

    #[test]
    fn triphone_conversion_shapes_names() {
        let mut hmm = model_with_phones(&["y+eh", "y-eh+s", "eh-s", "a"]);
        let lex = WordLexicon::parse("yes [yes] y eh s\n", &mut hmm, true).unwrap();
        let w = lex.word(0);
        assert_eq!(hmm.logical(w.phones[0]).name, "y+eh");
        assert_eq!(hmm.logical(w.phones[1]).name, "y-eh+s");
        assert_eq!(hmm.logical(w.phones[2]).name, "eh-s");
    }

    #[test]
    fn unknown_phone_skips_word() {
        let mut hmm = model_with_phones(&["a"]);
        let dict = "good a\nbad q\n";
        let lex = WordLexicon::parse(dict, &mut hmm, false).unwrap();
        assert_eq!(lex.num_words(), 1);
        assert_eq!(lex.word(0).name, "good");
    }

    #[test]
    fn silence_word_marking() {
        let mut hmm = model_with_phones(&["sil", "a"]);
        let dict = "<s> {} sil\n</s> {} sil\nword a\n";
        let mut lex = WordLexicon::parse(dict, &mut hmm, false).unwrap();
        lex.set_silence_words("<s>", "</s>").unwrap();
        assert_eq!(lex.head_sil(), Some(0));
        assert_eq!(lex.tail_sil(), Some(1));
        assert!(lex.set_silence_words("<s>", "<missing>").is_err());
    }
}
