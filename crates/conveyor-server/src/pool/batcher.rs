// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Log batcher and stage pipeline.
//!
//! A single consumer drains the pool's log channel, which preserves per-task
//! emission order. Records are flushed when 500 have accumulated or 500 ms
//! have passed, whichever comes first. During a flush each record is
//! written tagged with the task's currently open stage, then run through
//! the stage parsers; when the record itself triggers a transition, its
//! row is re-tagged with the stage it actually belongs to, so stage
//! membership always partitions the output stream.

use std::sync::Arc;
use std::time::Duration;

use conveyor_core::model::{TaskOutput, TaskStage};
use conveyor_core::Store;

use super::runner::TaskRunner;
use super::stages::{parser_for, parsers_for};
use super::LogRecord;

/// Flush when this many records are buffered.
pub const FLUSH_RECORDS: usize = 500;

/// Flush at least this often.
pub const FLUSH_INTERVAL: Duration = Duration::from_millis(500);

pub(crate) async fn run_batcher(
    store: Arc<dyn Store>,
    mut log_rx: tokio::sync::mpsc::Receiver<LogRecord>,
) {
    let mut buffer: Vec<LogRecord> = Vec::with_capacity(FLUSH_RECORDS);
    let mut tick = tokio::time::interval(FLUSH_INTERVAL);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            record = log_rx.recv() => {
                match record {
                    Some(record) => {
                        buffer.push(record);
                        if buffer.len() >= FLUSH_RECORDS {
                            flush(store.as_ref(), &mut buffer).await;
                        }
                    }
                    None => {
                        flush(store.as_ref(), &mut buffer).await;
                        return;
                    }
                }
            }
            _ = tick.tick() => {
                flush(store.as_ref(), &mut buffer).await;
            }
        }
    }
}

async fn flush(store: &dyn Store, buffer: &mut Vec<LogRecord>) {
    for record in buffer.drain(..) {
        if let Err(e) = write_record(store, &record).await {
            tracing::error!(task_id = record.runner.task_id(), error = %e, "log flush failed");
        }
    }
}

async fn write_record(store: &dyn Store, record: &LogRecord) -> conveyor_core::Result<()> {
    let runner = &record.runner;
    let stage_id = runner
        .current_stage
        .lock()
        .unwrap()
        .as_ref()
        .map(|stage| stage.id);

    let output = store
        .create_task_output(TaskOutput {
            id: 0,
            task_id: runner.task_id(),
            time: record.time,
            output: record.message.clone(),
            stage_id,
        })
        .await?;

    // a record that opens a new stage belongs to the new stage, not to the
    // one that was open when it arrived
    let resolved = advance_stages(store, runner, &output).await?;
    if resolved != stage_id {
        store
            .set_task_output_stage(output.task_id, output.id, resolved)
            .await?;
    }

    *runner.current_output_id.lock().unwrap() = Some(output.id);
    *runner.current_output_time.lock().unwrap() = Some(output.time);

    Ok(())
}

/// Close / open stages in response to one written output line.
///
/// Returns the stage the line belongs to after the transition: the line
/// that closes a stage is its last member, the line that opens one is its
/// first.
async fn advance_stages(
    store: &dyn Store,
    runner: &Arc<TaskRunner>,
    output: &TaskOutput,
) -> conveyor_core::Result<Option<i64>> {
    let Some(template) = runner.template() else {
        return Ok(output.stage_id);
    };

    let current = runner.current_stage.lock().unwrap().clone();

    for parser in parsers_for(template.app) {
        if parser.is_end(current.as_ref(), output) {
            let Some(current_stage) = &current else {
                continue;
            };

            store
                .end_task_stage(output.task_id, current_stage.id, output.time, output.id)
                .await?;

            let mut closed = current_stage.clone();
            closed.end = Some(output.time);
            closed.end_output_id = Some(output.id);

            *runner.current_stage.lock().unwrap() = None;
            finish_stage(store, template.app, &closed).await?;
            return Ok(Some(closed.id));
        }

        if parser.is_start(current.as_ref(), output) {
            // close the open stage at the previous output before opening
            if let Some(current_stage) = &current {
                let end_id = runner.current_output_id.lock().unwrap().unwrap_or(output.id);
                let end_time = runner
                    .current_output_time
                    .lock()
                    .unwrap()
                    .unwrap_or(output.time);

                store
                    .end_task_stage(output.task_id, current_stage.id, end_time, end_id)
                    .await?;

                let mut closed = current_stage.clone();
                closed.end = Some(end_time);
                closed.end_output_id = Some(end_id);
                finish_stage(store, template.app, &closed).await?;
            }

            let stage = store
                .create_task_stage(output.task_id, parser.kind(), output.time, output.id)
                .await?;
            let stage_id = stage.id;
            *runner.current_stage.lock().unwrap() = Some(stage);
            return Ok(Some(stage_id));
        }
    }

    Ok(current.map(|stage| stage.id))
}

/// Persist the parsed summary of a closed stage, when its parser wants one.
async fn finish_stage(
    store: &dyn Store,
    app: conveyor_core::model::TemplateApp,
    closed: &TaskStage,
) -> conveyor_core::Result<()> {
    let Some(parser) = parser_for(app, closed.kind) else {
        return Ok(());
    };
    if !parser.need_parse() {
        return Ok(());
    }

    let outputs = store
        .get_task_stage_outputs(closed.task_id, closed.id)
        .await?;
    let result = parser.parse(&outputs);
    store
        .create_task_stage_result(closed.task_id, closed.id, result)
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::dispatch::RunnerRegistry;
    use crate::pool::TaskPool;
    use crate::state::MemoryPoolState;
    use chrono::Utc;
    use conveyor_core::model::{Task, TaskStageKind, Template, TemplateApp};
    use conveyor_core::store::MemoryStore;

    fn runner_with_app(store: &Arc<MemoryStore>, app: TemplateApp) -> (Arc<TaskRunner>, TaskPool) {
        let pool = TaskPool::new(
            store.clone() as Arc<dyn Store>,
            Arc::new(MemoryPoolState::new()),
            Arc::new(RunnerRegistry::new()),
            Config::default(),
        );

        let mut task = Task::new(1, 1);
        task.id = 1;
        let runner = TaskRunner::new(&pool.shared, task, "tester");
        runner.set_template(Template {
            id: 1,
            project_id: 1,
            name: "tpl".into(),
            app,
            repository_id: 1,
            playbook: "site.yml".into(),
            ..Default::default()
        });

        (runner, pool)
    }

    async fn feed(store: &Arc<MemoryStore>, runner: &Arc<TaskRunner>, lines: &[&str]) {
        for line in lines {
            let record = LogRecord {
                runner: runner.clone(),
                time: Utc::now(),
                message: line.to_string(),
            };
            write_record(store.as_ref(), &record).await.unwrap();
        }
    }

    #[tokio::test]
    async fn outputs_preserve_emission_order() {
        let store = Arc::new(MemoryStore::new());
        let (runner, _pool) = runner_with_app(&store, TemplateApp::Bash);

        let lines = ["alpha", "beta", "gamma", "delta"];
        feed(&store, &runner, &lines).await;

        let outputs = store.task_outputs(1);
        assert_eq!(outputs.len(), lines.len());
        for (expected, output) in lines.iter().zip(&outputs) {
            assert_eq!(&output.output, expected);
        }
        assert!(outputs.windows(2).all(|w| w[0].id < w[1].id));
    }

    #[tokio::test]
    async fn stage_membership_partitions_the_stream() {
        let store = Arc::new(MemoryStore::new());
        let (runner, _pool) = runner_with_app(&store, TemplateApp::Ansible);

        feed(
            &store,
            &runner,
            &[
                "Preparing: 1",
                "Cloning into 'repository_1_1'...",
                "Resolving deltas: 100% (3/3), done.",
                "PLAY [webservers] *****",
                "TASK [deploy] *****",
                "PLAY RECAP *****",
                "tail line",
            ],
        )
        .await;

        let outputs = store.task_outputs(1);
        let stages = store.task_stages(1);
        assert_eq!(stages.len(), 2);
        assert_eq!(stages[0].kind, TaskStageKind::RepositoryClone);
        assert_eq!(stages[1].kind, TaskStageKind::ScriptRun);

        // every stage-tagged output falls inside its stage's id range
        for output in &outputs {
            if let Some(stage_id) = output.stage_id {
                let stage = stages.iter().find(|s| s.id == stage_id).unwrap();
                assert!(output.id >= stage.start_output_id.unwrap());
                assert!(output.id <= stage.end_output_id.unwrap());
            }
        }

        // the opening and closing lines belong to the stage they bound
        assert_eq!(outputs[1].stage_id, Some(stages[0].id));
        assert_eq!(outputs[2].stage_id, Some(stages[0].id));
        assert_eq!(outputs[3].stage_id, Some(stages[1].id));
        assert_eq!(outputs[5].stage_id, Some(stages[1].id));

        // lines outside any stage are untagged
        assert!(outputs.first().unwrap().stage_id.is_none());
        assert!(outputs.last().unwrap().stage_id.is_none());
    }

    #[tokio::test]
    async fn terraform_plan_stage_produces_a_summary() {
        let store = Arc::new(MemoryStore::new());
        let (runner, _pool) = runner_with_app(&store, TemplateApp::Terraform);

        feed(
            &store,
            &runner,
            &[
                "Terraform will perform the following actions:",
                "  # aws_instance.web will be created",
                "Plan: 2 to add, 1 to change, 0 to destroy.",
            ],
        )
        .await;

        let stages = store.task_stages(1);
        assert_eq!(stages.len(), 1);
        assert_eq!(stages[0].kind, TaskStageKind::TerraformPlan);
        assert!(stages[0].end.is_some());

        let results = store.stage_results(1);
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].result["add"], 2);
        assert_eq!(results[0].result["change"], 1);
        assert_eq!(results[0].result["destroy"], 0);
    }

    #[tokio::test]
    async fn a_new_stage_closes_the_open_one_at_the_previous_output() {
        let store = Arc::new(MemoryStore::new());
        let (runner, _pool) = runner_with_app(&store, TemplateApp::Ansible);

        // the clone stage never sees its own end marker; the play opens next
        feed(
            &store,
            &runner,
            &[
                "Cloning into 'repository_1_1'...",
                "remote: Counting objects: 10, done.",
                "PLAY [all] *****",
            ],
        )
        .await;

        let stages = store.task_stages(1);
        assert_eq!(stages.len(), 2);

        let clone = &stages[0];
        let play = &stages[1];
        assert_eq!(clone.kind, TaskStageKind::RepositoryClone);
        assert!(clone.end_output_id.unwrap() < play.start_output_id.unwrap());

        // the line that opened the play stage is a member of it, not of the
        // clone stage it implicitly closed
        let outputs = store.task_outputs(1);
        let opener = outputs.last().unwrap();
        assert_eq!(opener.id, play.start_output_id.unwrap());
        assert_eq!(opener.stage_id, Some(play.id));
    }
}

