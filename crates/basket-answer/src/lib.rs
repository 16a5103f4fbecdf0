//! From ranked hits to a `RagAnswer`: context assembly, synthesis, and the
//! query lifecycle that ties retrieval and synthesis together.

pub mod context;
pub mod pipeline;
pub mod synth;

pub use context::{AssembledContext, ContextAssembler};
pub use pipeline::{QueryStage, RagPipeline};
pub use synth::AnswerSynthesizer;
