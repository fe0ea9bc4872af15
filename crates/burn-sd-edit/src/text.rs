//! Prompt tokens and attention weights

use burn::prelude::*;

use crate::components::Tokenizer;
use crate::error::UsageError;

/// Longest token sequence the text encoder accepts, specials included
pub const MAX_PROMPT_LENGTH: usize = 77;

pub const START_OF_TEXT: u32 = 49406;

/// Also used as padding
pub const END_OF_TEXT: u32 = 49407;

/// Tokens of the empty prompt: start, then end-of-text padding
pub fn unconditional_tokens() -> Vec<u32> {
    let mut tokens = vec![END_OF_TEXT; MAX_PROMPT_LENGTH];
    tokens[0] = START_OF_TEXT;
    tokens
}

/// Pad token ids to 77 with end-of-text
pub fn pad_tokens(mut tokens: Vec<u32>) -> Result<Vec<u32>, UsageError> {
    if tokens.len() > MAX_PROMPT_LENGTH {
        return Err(UsageError::PromptTooLong {
            tokens: tokens.len(),
            max: MAX_PROMPT_LENGTH,
        });
    }
    tokens.resize(MAX_PROMPT_LENGTH, END_OF_TEXT);
    Ok(tokens)
}

/// Padded ids of `prompt`
pub fn tokenize_prompt(tokenizer: &impl Tokenizer, prompt: &str) -> Result<Vec<u32>, UsageError> {
    pad_tokens(tokenizer.encode(prompt))
}

/// `[1, len]` Int tensor of token ids
pub fn token_tensor<B: Backend>(tokens: &[u32], device: &B::Device) -> Tensor<B, 2, Int> {
    let ids: Vec<i64> = tokens.iter().map(|&t| i64::from(t)).collect();
    Tensor::from_data(TensorData::new(ids, [1, tokens.len()]), device)
}

/// `[[0, 1, ..., 76]]`
pub fn position_ids<B: Backend>(device: &B::Device) -> Tensor<B, 2, Int> {
    Tensor::<B, 1, Int>::arange(0..MAX_PROMPT_LENGTH as i64, device).reshape([1, MAX_PROMPT_LENGTH])
}

/// Per-token attention multipliers for `prompt`
///
/// Every position starts at 1.0. For each `(word, weight)`, the word's tokens
/// (without start/end) are located in the padded prompt and every occurrence
/// takes `weight`.
pub fn create_attention_weights(
    tokenizer: &impl Tokenizer,
    prompt: &str,
    word_weights: &[(&str, f32)],
) -> Result<Vec<f32>, UsageError> {
    let tokens = tokenize_prompt(tokenizer, prompt)?;
    let mut weights = vec![1.0f32; MAX_PROMPT_LENGTH];

    for &(word, weight) in word_weights {
        let word_tokens = strip_specials(tokenizer.encode(word));
        if word_tokens.is_empty() {
            return Err(UsageError::WordNotInPrompt(word.to_string()));
        }

        // yields no windows when the phrase outgrows the padded prompt
        let mut found = false;
        for (start, window) in tokens.windows(word_tokens.len()).enumerate() {
            if window == &word_tokens[..] {
                weights[start..start + word_tokens.len()].fill(weight);
                found = true;
            }
        }
        if !found {
            return Err(UsageError::WordNotInPrompt(word.to_string()));
        }
    }

    Ok(weights)
}

fn strip_specials(tokens: Vec<u32>) -> Vec<u32> {
    tokens
        .into_iter()
        .filter(|&t| t != START_OF_TEXT && t != END_OF_TEXT)
        .collect()
}
