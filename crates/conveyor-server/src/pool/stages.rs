// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Stage parsers.
//!
//! Stages partition a task's output stream into coarse phases by matching
//! content the tools actually print. Each app registers an ordered parser
//! list; the batcher consults it for every flushed record. A stage closes
//! when its end predicate holds or when the next stage opens.

use conveyor_core::model::{JsonMap, TaskOutput, TaskStage, TaskStageKind, TemplateApp};
use regex::Regex;
use std::sync::LazyLock;

/// Recognizes the boundaries of one stage kind, and optionally summarizes
/// the closed stage's output.
pub trait StageParser: Send + Sync {
    /// Stage kind this parser produces.
    fn kind(&self) -> TaskStageKind;

    /// Whether `output` opens a new stage of this kind.
    fn is_start(&self, current: Option<&TaskStage>, output: &TaskOutput) -> bool;

    /// Whether `output` closes the current stage.
    fn is_end(&self, current: Option<&TaskStage>, output: &TaskOutput) -> bool;

    /// Whether a closed stage of this kind gets a parsed summary.
    fn need_parse(&self) -> bool {
        false
    }

    /// Summarize the closed stage's output lines.
    fn parse(&self, _outputs: &[TaskOutput]) -> JsonMap {
        JsonMap::new()
    }
}

/// Ordered parsers registered for an app.
pub fn parsers_for(app: TemplateApp) -> &'static [&'static dyn StageParser] {
    static CLONE: RepositoryCloneParser = RepositoryCloneParser;
    static SCRIPT: ScriptRunParser = ScriptRunParser;
    static PLAN: TerraformPlanParser = TerraformPlanParser;
    static CLONE_SCRIPT: [&dyn StageParser; 2] = [&CLONE, &SCRIPT];
    static CLONE_PLAN: [&dyn StageParser; 2] = [&CLONE, &PLAN];

    match app {
        TemplateApp::Ansible => &CLONE_SCRIPT,
        app if app.is_terraform() => &CLONE_PLAN,
        _ => &CLONE_SCRIPT,
    }
}

/// Find the parser registered for a stage kind of an app.
pub fn parser_for(app: TemplateApp, kind: TaskStageKind) -> Option<&'static dyn StageParser> {
    parsers_for(app).iter().copied().find(|p| p.kind() == kind)
}

/// Git clone / pull phase.
struct RepositoryCloneParser;

impl StageParser for RepositoryCloneParser {
    fn kind(&self) -> TaskStageKind {
        TaskStageKind::RepositoryClone
    }

    fn is_start(&self, current: Option<&TaskStage>, output: &TaskOutput) -> bool {
        if matches!(current, Some(stage) if stage.kind == TaskStageKind::RepositoryClone) {
            return false;
        }
        output.output.contains("Cloning into ")
    }

    fn is_end(&self, current: Option<&TaskStage>, output: &TaskOutput) -> bool {
        matches!(current, Some(stage) if stage.kind == TaskStageKind::RepositoryClone)
            && (output.output.contains("Resolving deltas: 100%")
                || output.output.contains("Checking out files: 100%"))
    }
}

/// Playbook / script execution phase.
struct ScriptRunParser;

impl StageParser for ScriptRunParser {
    fn kind(&self) -> TaskStageKind {
        TaskStageKind::ScriptRun
    }

    fn is_start(&self, current: Option<&TaskStage>, output: &TaskOutput) -> bool {
        if matches!(current, Some(stage) if stage.kind == TaskStageKind::ScriptRun) {
            return false;
        }
        output.output.starts_with("PLAY [")
    }

    fn is_end(&self, current: Option<&TaskStage>, output: &TaskOutput) -> bool {
        matches!(current, Some(stage) if stage.kind == TaskStageKind::ScriptRun)
            && output.output.starts_with("PLAY RECAP")
    }
}

static PLAN_SUMMARY_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"Plan: (\d+) to add, (\d+) to change, (\d+) to destroy").expect("plan pattern")
});

/// Terraform plan phase, summarized into resource counts.
struct TerraformPlanParser;

impl StageParser for TerraformPlanParser {
    fn kind(&self) -> TaskStageKind {
        TaskStageKind::TerraformPlan
    }

    fn is_start(&self, current: Option<&TaskStage>, output: &TaskOutput) -> bool {
        if matches!(current, Some(stage) if stage.kind == TaskStageKind::TerraformPlan) {
            return false;
        }
        output.output.contains("Terraform will perform the following actions")
            || output.output.contains("OpenTofu will perform the following actions")
    }

    fn is_end(&self, current: Option<&TaskStage>, output: &TaskOutput) -> bool {
        matches!(current, Some(stage) if stage.kind == TaskStageKind::TerraformPlan)
            && (PLAN_SUMMARY_RE.is_match(&output.output) || output.output.contains("No changes."))
    }

    fn need_parse(&self) -> bool {
        true
    }

    fn parse(&self, outputs: &[TaskOutput]) -> JsonMap {
        let mut result = JsonMap::new();

        for output in outputs {
            if let Some(caps) = PLAN_SUMMARY_RE.captures(&output.output) {
                let n = |i: usize| {
                    caps.get(i)
                        .and_then(|m| m.as_str().parse::<i64>().ok())
                        .unwrap_or(0)
                };
                result.insert("add".into(), n(1).into());
                result.insert("change".into(), n(2).into());
                result.insert("destroy".into(), n(3).into());
            }
            if output.output.contains("No changes.") {
                result.insert("no_changes".into(), true.into());
            }
        }

        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn output(line: &str) -> TaskOutput {
        TaskOutput {
            id: 1,
            task_id: 1,
            time: Utc::now(),
            output: line.into(),
            stage_id: None,
        }
    }

    fn open_stage(kind: TaskStageKind) -> TaskStage {
        TaskStage {
            id: 1,
            task_id: 1,
            start: Some(Utc::now()),
            end: None,
            start_output_id: Some(1),
            end_output_id: None,
            kind,
        }
    }

    #[test]
    fn clone_stage_boundaries() {
        let parser = parser_for(TemplateApp::Ansible, TaskStageKind::RepositoryClone).unwrap();

        assert!(parser.is_start(None, &output("Cloning into 'repository_1_2'...")));
        assert!(!parser.is_start(None, &output("PLAY [all] *****")));

        let stage = open_stage(TaskStageKind::RepositoryClone);
        assert!(parser.is_end(Some(&stage), &output("Resolving deltas: 100% (10/10), done.")));
        assert!(!parser.is_end(None, &output("Resolving deltas: 100% (10/10), done.")));
    }

    #[test]
    fn play_recap_closes_script_stage() {
        let parser = parser_for(TemplateApp::Ansible, TaskStageKind::ScriptRun).unwrap();

        assert!(parser.is_start(None, &output("PLAY [webservers] *****")));

        let stage = open_stage(TaskStageKind::ScriptRun);
        assert!(!parser.is_start(Some(&stage), &output("PLAY [webservers] *****")));
        assert!(parser.is_end(Some(&stage), &output("PLAY RECAP *********")));
    }

    #[test]
    fn plan_summary_is_parsed() {
        let parser = parser_for(TemplateApp::Terraform, TaskStageKind::TerraformPlan).unwrap();
        assert!(parser.need_parse());

        let lines = [
            output("Terraform will perform the following actions:"),
            output("  # aws_instance.web will be created"),
            output("Plan: 2 to add, 1 to change, 0 to destroy."),
        ];
        let result = parser.parse(&lines);
        assert_eq!(result["add"], 2);
        assert_eq!(result["change"], 1);
        assert_eq!(result["destroy"], 0);
    }

    #[test]
    fn terraform_apps_register_plan_parser() {
        for app in [
            TemplateApp::Terraform,
            TemplateApp::Tofu,
            TemplateApp::Terragrunt,
        ] {
            assert!(parser_for(app, TaskStageKind::TerraformPlan).is_some());
        }
        assert!(parser_for(TemplateApp::Ansible, TaskStageKind::TerraformPlan).is_none());
    }
}
