pub mod aligner;
pub mod audio_extractor;
pub mod clip_assembler;
pub mod config;
pub mod error;
pub mod keyframe_sampler;
pub mod metadata;
pub mod processor;
pub mod reconciler;
pub mod record;
pub mod scene_detector;
pub mod stats_cache;
pub mod storyboard;
pub mod transcriber;
pub mod video_processor;

pub use aligner::Aligner;
pub use audio_extractor::AudioExtractor;
pub use clip_assembler::{AssemblerSettings, ClipAssembler, ClipPlan, NarrationTrack};
pub use config::{ConfigLoader, ConfigOverrides, PipelineConfig};
pub use error::{PipelineError, PipelineResult};
pub use keyframe_sampler::KeyframeSampler;
pub use metadata::{Keyframe, Scene, SourceVideo, TimeWindow, TranscriptSegment, VideoAnalysis};
pub use processor::{PipelineOutput, PipelineRequest, StoryboardPipeline};
pub use reconciler::{list_artifacts, ArtifactReconciler, PendingArtifact, ProjectLocks};
pub use record::{ProcessingRecord, RunStatus, Stage, StepStatus};
pub use scene_detector::{DetectorMode, SceneDetector};
pub use storyboard::{AssembledClip, EntrySeed, SourceMode, StoryboardEntry};
pub use transcriber::{SpeechEngine, Transcriber, WhisperCliEngine};
pub use video_processor::VideoProcessor;
