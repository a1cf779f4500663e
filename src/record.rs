use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use uuid::Uuid;

use crate::error::PipelineResult;

/// 流水线阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Probe,
    SceneDetection,
    Transcription,
    KeyframeSampling,
    Alignment,
    ClipAssembly,
    Reconciliation,
    Composition,
}

impl Stage {
    pub const ALL: [Stage; 8] = [
        Stage::Probe,
        Stage::SceneDetection,
        Stage::Transcription,
        Stage::KeyframeSampling,
        Stage::Alignment,
        Stage::ClipAssembly,
        Stage::Reconciliation,
        Stage::Composition,
    ];
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Probe => "视频探测",
            Stage::SceneDetection => "场景检测",
            Stage::Transcription => "语音转录",
            Stage::KeyframeSampling => "关键帧",
            Stage::Alignment => "对齐",
            Stage::ClipAssembly => "剪辑合成",
            Stage::Reconciliation => "产物重建",
            Stage::Composition => "视频拼接",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Pending,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Running,
    Completed,
    /// 部分阶段或部分分镜失败，但有可用产物
    Partial,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepRecord {
    pub stage: Stage,
    pub status: StepStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<String>,
}

/// 单个分镜合成失败的记录
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntryFailure {
    pub index: usize,
    pub error: String,
}

/// 一次流水线运行的处理记录，调用方通过它观察部分失败
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessingRecord {
    pub run_id: String,
    pub source: PathBuf,
    pub status: RunStatus,
    pub steps: Vec<StepRecord>,
    #[serde(default)]
    pub entry_failures: Vec<EntryFailure>,
    /// 运行被中止（致命错误或取消）时所在的阶段
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aborted_at: Option<Stage>,
    pub started_at: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<String>,
}

fn now() -> String {
    chrono::Utc::now().to_rfc3339()
}

impl ProcessingRecord {
    pub fn new(source: impl Into<PathBuf>) -> Self {
        Self {
            run_id: Uuid::new_v4().to_string(),
            source: source.into(),
            status: RunStatus::Running,
            steps: Stage::ALL
                .iter()
                .map(|&stage| StepRecord {
                    stage,
                    status: StepStatus::Pending,
                    error: None,
                    detail: None,
                    started_at: None,
                    finished_at: None,
                })
                .collect(),
            entry_failures: Vec::new(),
            aborted_at: None,
            started_at: now(),
            finished_at: None,
        }
    }

    pub fn step(&self, stage: Stage) -> Option<&StepRecord> {
        self.steps.iter().find(|s| s.stage == stage)
    }

    fn step_mut(&mut self, stage: Stage) -> &mut StepRecord {
        let pos = match self.steps.iter().position(|s| s.stage == stage) {
            Some(pos) => pos,
            None => {
                self.steps.push(StepRecord {
                    stage,
                    status: StepStatus::Pending,
                    error: None,
                    detail: None,
                    started_at: None,
                    finished_at: None,
                });
                self.steps.len() - 1
            }
        };
        &mut self.steps[pos]
    }

    pub fn start(&mut self, stage: Stage) {
        self.step_mut(stage).started_at = Some(now());
    }

    pub fn complete(&mut self, stage: Stage, detail: impl Into<String>) {
        let step = self.step_mut(stage);
        step.status = StepStatus::Completed;
        step.detail = Some(detail.into());
        step.finished_at = Some(now());
    }

    pub fn fail(&mut self, stage: Stage, error: impl fmt::Display) {
        let step = self.step_mut(stage);
        step.status = StepStatus::Failed;
        step.error = Some(error.to_string());
        step.finished_at = Some(now());
    }

    pub fn record_entry_failure(&mut self, index: usize, error: impl fmt::Display) {
        self.entry_failures.push(EntryFailure {
            index,
            error: error.to_string(),
        });
    }

    /// 中止运行：记录失败阶段，之后的总体结果一律为失败
    pub fn abort(&mut self, stage: Stage, error: impl fmt::Display) -> RunStatus {
        self.fail(stage, error);
        self.aborted_at = Some(stage);
        self.finish()
    }

    /// 根据各阶段状态给出总体结果
    ///
    /// 运行被中止，或探测、场景检测、对齐、产物重建失败即为失败；
    /// 其余阶段失败或有分镜失败为部分成功。
    pub fn finish(&mut self) -> RunStatus {
        let failed = |stage| self.step(stage).map(|s| s.status == StepStatus::Failed).unwrap_or(false);
        let fatal = self.aborted_at.is_some()
            || [Stage::Probe, Stage::SceneDetection, Stage::Alignment, Stage::Reconciliation]
                .into_iter()
                .any(failed);
        let degraded = self.steps.iter().any(|s| s.status != StepStatus::Completed) || !self.entry_failures.is_empty();

        self.status = if fatal {
            RunStatus::Failed
        } else if degraded {
            RunStatus::Partial
        } else {
            RunStatus::Completed
        };
        self.finished_at = Some(now());
        self.status
    }

    pub fn save(&self, path: impl AsRef<Path>) -> PipelineResult<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PipelineError;

    fn complete_all(record: &mut ProcessingRecord) {
        for stage in Stage::ALL {
            record.start(stage);
            record.complete(stage, "ok");
        }
    }

    #[test]
    fn test_all_steps_start_pending() {
        let record = ProcessingRecord::new("in.mp4");
        assert_eq!(record.steps.len(), Stage::ALL.len());
        assert!(record.steps.iter().all(|s| s.status == StepStatus::Pending));
        assert_eq!(record.status, RunStatus::Running);
    }

    #[test]
    fn test_transcription_failure_is_partial() {
        let mut record = ProcessingRecord::new("in.mp4");
        complete_all(&mut record);
        record.fail(Stage::Transcription, "whisper: not found");
        assert_eq!(record.finish(), RunStatus::Partial);
        let step = record.step(Stage::Transcription).unwrap();
        assert_eq!(step.error.as_deref(), Some("whisper: not found"));
        assert!(step.finished_at.is_some());
    }

    #[test]
    fn test_entry_failure_is_partial_and_reconcile_failure_is_fatal() {
        let mut record = ProcessingRecord::new("in.mp4");
        complete_all(&mut record);
        assert_eq!(record.finish(), RunStatus::Completed);

        record.record_entry_failure(3, "分镜 3 没有可用的关键帧");
        assert_eq!(record.finish(), RunStatus::Partial);

        record.fail(Stage::Reconciliation, "disk full");
        assert_eq!(record.finish(), RunStatus::Failed);
    }

    #[test]
    fn test_cancelled_run_is_failed() {
        let mut record = ProcessingRecord::new("in.mp4");
        for stage in [
            Stage::Probe,
            Stage::SceneDetection,
            Stage::Transcription,
            Stage::KeyframeSampling,
            Stage::Alignment,
        ] {
            record.start(stage);
            record.complete(stage, "ok");
        }
        assert_eq!(record.abort(Stage::ClipAssembly, PipelineError::Cancelled), RunStatus::Failed);
        assert_eq!(record.aborted_at, Some(Stage::ClipAssembly));
        assert_eq!(record.step(Stage::Reconciliation).unwrap().status, StepStatus::Pending);
        // 再次汇总也不会退回部分成功
        assert_eq!(record.finish(), RunStatus::Failed);

        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["status"], "failed");
        assert_eq!(json["aborted_at"], "clip_assembly");
    }

    #[test]
    fn test_composition_failure_is_partial() {
        let mut record = ProcessingRecord::new("in.mp4");
        complete_all(&mut record);
        record.fail(Stage::Composition, "concat failed");
        assert_eq!(record.finish(), RunStatus::Partial);
    }

    #[test]
    fn test_serialized_status_names() {
        let mut record = ProcessingRecord::new("in.mp4");
        record.fail(Stage::SceneDetection, "boom");
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["steps"][1]["stage"], "scene_detection");
        assert_eq!(json["steps"][1]["status"], "failed");
        assert_eq!(json["steps"][0]["status"], "pending");
    }
}
