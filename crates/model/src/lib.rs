pub mod block;
pub mod config;
pub mod generation;
pub mod model;
pub mod params;
pub mod seq2seq;

pub use config::ModelConfig;
pub use generation::{greedy_decode, GenerationConfig};
pub use model::Model;
pub use params::ParameterStore;
pub use seq2seq::{ModelOutput, Seq2SeqInputs, Seq2SeqModel};
