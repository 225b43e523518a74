//! Rarity scoring
//!
//! The scoring algorithm is a pluggable function injected at pipeline
//! construction; the state machines only know its contract: given every
//! token in the collection, produce a score and rank per token. The default
//! implementation scores by inverse trait frequency.

use crate::contract::aggregate_traits;
use crate::model::Token;
use rayon::prelude::*;
use std::sync::Arc;

/// Values injected into a token's suspended Aggregate step. Both fields must
/// be present for the step to complete.
#[derive(Debug, Clone, Copy, Default)]
pub struct RarityInjection {
    pub rarity_score: Option<f64>,
    pub rarity_rank: Option<u64>,
}

/// One token's computed rarity.
#[derive(Debug, Clone)]
pub struct RarityAssignment {
    pub token_id: String,
    pub rarity_score: f64,
    pub rarity_rank: u64,
}

/// Collection-wide rarity computation: `(tokens) -> (score, rank) per token`.
pub type RarityScorer = Arc<dyn Fn(&[Token]) -> Vec<RarityAssignment> + Send + Sync>;

/// Default scorer: a token's score is the sum of `total / freq(trait, value)`
/// over its traits, so rarer trait values weigh more. Ranks are dense from 1
/// by descending score, ties broken by token id for determinism.
pub fn trait_frequency_scorer() -> RarityScorer {
    Arc::new(|tokens: &[Token]| {
        let counts = aggregate_traits(tokens);
        let total = tokens.len() as f64;

        let mut scored: Vec<(String, f64)> = tokens
            .par_iter()
            .map(|token| {
                let score: f64 = token
                    .attributes()
                    .iter()
                    .map(|(trait_type, value)| {
                        let freq = counts
                            .get(trait_type)
                            .and_then(|values| values.get(value))
                            .copied()
                            .unwrap_or(1) as f64;
                        total / freq
                    })
                    .sum();
                (token.token_id.clone(), score)
            })
            .collect();

        scored.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| numeric_id(&a.0).cmp(&numeric_id(&b.0)))
                .then_with(|| a.0.cmp(&b.0))
        });

        scored
            .into_iter()
            .enumerate()
            .map(|(i, (token_id, rarity_score))| RarityAssignment {
                token_id,
                rarity_score,
                rarity_rank: (i + 1) as u64,
            })
            .collect()
    })
}

fn numeric_id(id: &str) -> u128 {
    id.parse().unwrap_or(u128::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn token_with_attrs(id: &str, attrs: serde_json::Value) -> Token {
        let mut token = Token::minted(id.into(), String::new(), 0, String::new(), 0.0);
        token.metadata = Some(serde_json::json!({ "attributes": attrs }));
        token
    }

    #[test]
    fn test_rarer_traits_rank_higher() {
        let tokens = vec![
            token_with_attrs("1", serde_json::json!([{ "trait_type": "Fur", "value": "Common" }])),
            token_with_attrs("2", serde_json::json!([{ "trait_type": "Fur", "value": "Common" }])),
            token_with_attrs("3", serde_json::json!([{ "trait_type": "Fur", "value": "Gold" }])),
        ];

        let assignments = trait_frequency_scorer()(&tokens);
        let gold = assignments.iter().find(|a| a.token_id == "3").unwrap();
        assert_eq!(gold.rarity_rank, 1);
        assert!(gold.rarity_score > assignments[1].rarity_score);
    }

    #[test]
    fn test_ranks_are_dense_and_complete() {
        let tokens: Vec<Token> = (1..=5)
            .map(|i| {
                token_with_attrs(
                    &i.to_string(),
                    serde_json::json!([{ "trait_type": "Id", "value": i.to_string() }]),
                )
            })
            .collect();

        let mut ranks: Vec<u64> = trait_frequency_scorer()(&tokens)
            .iter()
            .map(|a| a.rarity_rank)
            .collect();
        ranks.sort_unstable();
        assert_eq!(ranks, vec![1, 2, 3, 4, 5]);
    }
}
