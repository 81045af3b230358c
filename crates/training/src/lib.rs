pub mod checkpoint;
pub mod config;
pub mod control;
pub mod coordination;
pub mod data;
pub mod evaluation;
pub mod logging;
pub mod loss;
pub mod metrics;
pub mod objective;
pub mod optimizer;
pub mod scheduler;
pub mod scoring;
pub mod step;
pub mod tokenizer;
pub mod trainer;

pub use checkpoint::{CheckpointStore, LoadMode, LoadReport};
pub use config::{TrainingConfig, TrainingError};
pub use control::{ControlPlane, QuitFlag};
pub use coordination::{GroupEnv, LocalGroup, ProcessGroup, SoloGroup, TcpGroup};
pub use data::{Batch, BatchSource, ParallelCorpus};
pub use evaluation::{ConvergenceTracker, EvalDecision, EvaluationController};
pub use loss::{CrossEntropyLoss, LossMetrics, LossOutput};
pub use objective::{LossTerm, ObjectiveAssembler};
pub use optimizer::{GradientScaler, OptimizerState, TrainerOptimizer, TrainerOptimizerOptions};
pub use scheduler::{LRScheduler, WarmupSchedule};
pub use scoring::Scorer;
pub use step::{StepExecutor, StepOutcome};
pub use trainer::{RunSummary, StopReason, Trainer};
