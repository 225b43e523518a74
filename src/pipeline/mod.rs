//! Collection-creation pipeline
//!
//! Two nested resumable state machines: one per collection
//! ([`collection::CollectionRunner`]) and one per token
//! ([`token::TokenMachine`]). Both persist their current step so work
//! resumes after partial failure, and both express "yield for injected
//! data" as an explicit suspend/resume pair rather than generator magic.

pub mod collection;
pub mod rarity;
pub mod token;

pub use collection::{CollectionRunner, PipelineContext};
pub use rarity::{trait_frequency_scorer, RarityAssignment, RarityInjection, RarityScorer};
pub use token::{TokenMachine, TokenOutcome, TokenStepContext};
