//! Label-sequence decoding (CTC greedy collapse)

use ndarray::{ArrayView3, Axis};

use super::error::{VisionError, VisionResult};

/// Characters understood by the default recognition model
pub const DEFAULT_VOCAB: &str = "0123456789abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ!\"#$%&'()*+,-./:;<=>?@[\\]^_`{|}~°£€¥¢฿àâéèêëîïôùûüçÀÂÉÈÊËÎÏÔÙÛÜÇ";

/// Index-to-character table; the blank label sits one past the last character
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Vocabulary {
    chars: Vec<char>,
}

impl Vocabulary {
    pub fn new(chars: &str) -> Self {
        Self {
            chars: chars.chars().collect(),
        }
    }

    /// Reserved blank label index
    pub fn blank(&self) -> usize {
        self.chars.len()
    }

    pub fn len(&self) -> usize {
        self.chars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chars.is_empty()
    }

    pub fn char_at(&self, index: usize) -> Option<char> {
        self.chars.get(index).copied()
    }

    /// Reverse lookup, first match wins
    pub fn index_of(&self, ch: char) -> Option<usize> {
        self.chars.iter().position(|&c| c == ch)
    }
}

impl Default for Vocabulary {
    fn default() -> Self {
        Self::new(DEFAULT_VOCAB)
    }
}

/// Stateless CTC greedy decoder
#[derive(Debug, Clone, Default)]
pub struct SequenceDecoder {
    vocab: Vocabulary,
}

impl SequenceDecoder {
    pub fn new(vocab: Vocabulary) -> Self {
        Self { vocab }
    }

    pub fn vocabulary(&self) -> &Vocabulary {
        &self.vocab
    }

    /// Decode one string per label sequence, in input order
    pub fn decode(&self, label_sequences: &[Vec<usize>]) -> Vec<String> {
        label_sequences.iter().map(|seq| self.decode_one(seq)).collect()
    }

    /// Collapse a single label sequence
    ///
    /// Repeats collapse unless separated by a blank. Indices past the blank
    /// are dropped.
    pub fn decode_one(&self, labels: &[usize]) -> String {
        let blank = self.vocab.blank();
        let mut text = String::with_capacity(labels.len());
        let mut last: Option<usize> = None;

        for &label in labels {
            if label == blank {
                last = None;
                continue;
            }
            if last == Some(label) {
                continue;
            }
            if let Some(ch) = self.vocab.char_at(label) {
                text.push(ch);
            }
            last = Some(label);
        }

        text
    }
}

/// Reduce `[batch, steps, classes]` logits to best-path label sequences
pub fn best_path(logits: ArrayView3<f32>) -> Vec<Vec<usize>> {
    logits
        .axis_iter(Axis(0))
        .map(|sample| {
            sample
                .axis_iter(Axis(0))
                .map(|step| {
                    step.iter()
                        .enumerate()
                        .fold((0usize, f32::NEG_INFINITY), |best, (i, &v)| {
                            if v > best.1 { (i, v) } else { best }
                        })
                        .0
                })
                .collect()
        })
        .collect()
}

/// Check that the class axis can address every label of the vocabulary
pub fn validate_class_count(classes: usize, vocab: &Vocabulary) -> VisionResult<()> {
    if classes < vocab.blank() + 1 {
        return Err(VisionError::UnexpectedOutputShape(format!(
            "{} classes cannot cover vocabulary of {} plus blank",
            classes,
            vocab.len()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array3;

    /// 126-symbol vocabulary with 'A' at index 5
    fn vocab_with_a_at_5() -> Vocabulary {
        let mut chars: Vec<char> = DEFAULT_VOCAB.chars().collect();
        chars[5] = 'A';
        Vocabulary::new(&chars.into_iter().collect::<String>())
    }

    #[test]
    fn test_default_vocab_blank() {
        let vocab = Vocabulary::default();
        assert_eq!(vocab.len(), 126);
        assert_eq!(vocab.blank(), 126);
        assert_eq!(vocab.char_at(0), Some('0'));
        assert_eq!(vocab.char_at(125), Some('Ç'));
        assert_eq!(vocab.char_at(126), None);
    }

    #[test]
    fn test_repeat_across_blank_is_kept() {
        let decoder = SequenceDecoder::new(vocab_with_a_at_5());
        assert_eq!(decoder.decode_one(&[5, 5, 126, 5]), "AA");
        assert_eq!(decoder.decode_one(&[5, 5, 5]), "A");
    }

    #[test]
    fn test_blank_only_is_empty() {
        let decoder = SequenceDecoder::default();
        assert_eq!(decoder.decode_one(&[126, 126, 126]), "");
        assert_eq!(decoder.decode_one(&[]), "");
    }

    #[test]
    fn test_out_of_range_dropped() {
        let decoder = SequenceDecoder::default();
        assert_eq!(decoder.decode_one(&[1, 200, 2]), "12");
    }

    #[test]
    fn test_one_string_per_sequence() {
        let decoder = SequenceDecoder::default();
        let out = decoder.decode(&[vec![10, 11], vec![126], vec![12, 12, 126, 12]]);
        assert_eq!(out, vec!["ab".to_string(), String::new(), "cc".to_string()]);
    }

    #[test]
    fn test_decode_identity_without_repeats() {
        let vocab = Vocabulary::default();
        let decoder = SequenceDecoder::new(vocab.clone());
        for word in ["World", "a1b2c3", "€42", "Ça-va?"] {
            let labels: Vec<usize> = word.chars().map(|c| vocab.index_of(c).unwrap()).collect();
            assert_eq!(decoder.decode_one(&labels), word);
        }
    }

    #[test]
    fn test_best_path() {
        let mut logits = Array3::<f32>::zeros((2, 3, 4));
        logits[[0, 0, 1]] = 5.0;
        logits[[0, 1, 3]] = 2.0;
        logits[[0, 2, 1]] = 1.0;
        logits[[1, 0, 2]] = 0.5;
        logits[[1, 1, 0]] = 0.1;
        logits[[1, 2, 3]] = 9.0;

        let paths = best_path(logits.view());
        assert_eq!(paths, vec![vec![1, 3, 1], vec![2, 0, 3]]);
    }

    #[test]
    fn test_validate_class_count() {
        let vocab = Vocabulary::default();
        assert!(validate_class_count(127, &vocab).is_ok());
        assert!(validate_class_count(126, &vocab).is_err());
    }
}
