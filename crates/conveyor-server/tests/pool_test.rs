// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Scheduling and admission tests against the in-memory backends.
//!
//! These tests run real shell jobs through the pool: the "repository" is a
//! local directory holding a short script, so admission, claiming, status
//! mapping and teardown are exercised end to end without a database.

use std::sync::Arc;
use std::time::Duration;

use conveyor_core::model::{Project, Repository, Task, Template, TemplateApp, TemplateType};
use conveyor_core::store::MemoryStore;
use conveyor_core::{Store, TaskStatus};
use conveyor_server::dispatch::RunnerRegistry;
use conveyor_server::pool::TaskPool;
use conveyor_server::state::MemoryPoolState;
use conveyor_server::Config;

struct Fixture {
    store: Arc<MemoryStore>,
    pool: TaskPool,
    _repo_dir: tempfile::TempDir,
    _tmp_dir: tempfile::TempDir,
}

fn fixture(project_cap: i64, allow_parallel: bool) -> Fixture {
    let repo_dir = tempfile::tempdir().unwrap();
    std::fs::write(repo_dir.path().join("task.sh"), "#!/bin/sh\nsleep 1\n").unwrap();

    let tmp_dir = tempfile::tempdir().unwrap();

    let store = Arc::new(MemoryStore::new());
    store.insert_project(Project {
        id: 1,
        name: "p".into(),
        max_parallel_tasks: project_cap,
        alert: false,
    });
    store.insert_repository(Repository {
        id: 1,
        project_id: 1,
        name: "repo".into(),
        git_url: repo_dir.path().display().to_string(),
        git_branch: "main".into(),
        ssh_key_id: None,
    });
    store.insert_template(Template {
        id: 1,
        project_id: 1,
        name: "script".into(),
        app: TemplateApp::Bash,
        repository_id: 1,
        playbook: "task.sh".into(),
        allow_parallel_tasks: allow_parallel,
        ..Default::default()
    });

    let config = Config {
        tmp_path: tmp_dir.path().to_path_buf(),
        ..Default::default()
    };

    let pool = TaskPool::new(
        store.clone(),
        Arc::new(MemoryPoolState::new()),
        Arc::new(RunnerRegistry::new()),
        config,
    );

    {
        let pool = pool.clone();
        tokio::spawn(async move { pool.run().await });
    }

    Fixture {
        store,
        pool,
        _repo_dir: repo_dir,
        _tmp_dir: tmp_dir,
    }
}

async fn wait_for_status(
    store: &MemoryStore,
    task_id: i64,
    expected: TaskStatus,
    timeout: Duration,
) -> TaskStatus {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let status = store.get_task(1, task_id).await.unwrap().status;
        if status == expected || tokio::time::Instant::now() > deadline {
            return status;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn project_cap_serializes_tasks() {
    let f = fixture(1, true);

    let a = f
        .pool
        .add_task(Task::new(1, 1), None, "alice", 1, false)
        .await
        .unwrap();
    let b = f
        .pool
        .add_task(Task::new(1, 1), None, "alice", 1, false)
        .await
        .unwrap();

    // A starts; B must remain queued while A is active
    tokio::time::sleep(Duration::from_millis(500)).await;
    let a_status = f.store.get_task(1, a.id).await.unwrap().status;
    let b_status = f.store.get_task(1, b.id).await.unwrap().status;
    assert!(
        matches!(a_status, TaskStatus::Starting | TaskStatus::Running),
        "A should be active, got {a_status}"
    );
    assert_eq!(b_status, TaskStatus::Waiting, "B must wait for the cap");

    // both eventually succeed, one after the other
    assert_eq!(
        wait_for_status(&f.store, a.id, TaskStatus::Success, Duration::from_secs(15)).await,
        TaskStatus::Success
    );
    assert_eq!(
        wait_for_status(&f.store, b.id, TaskStatus::Success, Duration::from_secs(15)).await,
        TaskStatus::Success
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn same_template_blocks_regardless_of_project_cap() {
    // unlimited project cap, template forbids parallel runs
    let f = fixture(0, false);

    let a = f
        .pool
        .add_task(Task::new(1, 1), None, "alice", 1, false)
        .await
        .unwrap();
    let b = f
        .pool
        .add_task(Task::new(1, 1), None, "alice", 1, false)
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(
        f.store.get_task(1, b.id).await.unwrap().status,
        TaskStatus::Waiting
    );

    assert_eq!(
        wait_for_status(&f.store, a.id, TaskStatus::Success, Duration::from_secs(15)).await,
        TaskStatus::Success
    );
    assert_eq!(
        wait_for_status(&f.store, b.id, TaskStatus::Success, Duration::from_secs(15)).await,
        TaskStatus::Success
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stopping_a_queued_task_prevents_it_from_starting() {
    let f = fixture(0, false);

    let a = f
        .pool
        .add_task(Task::new(1, 1), None, "alice", 1, false)
        .await
        .unwrap();
    // B is queued behind A (same template, no parallel runs)
    let b = f
        .pool
        .add_task(Task::new(1, 1), None, "alice", 1, false)
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(300)).await;
    f.pool
        .stop_task(&f.store.get_task(1, b.id).await.unwrap(), false)
        .await
        .unwrap();

    assert_eq!(
        wait_for_status(&f.store, b.id, TaskStatus::Stopped, Duration::from_secs(10)).await,
        TaskStatus::Stopped
    );

    // B never produced any output: it was dequeued without a backend call
    assert!(f.store.task_outputs(b.id).iter().all(|o| !o.output.contains("task.sh")));

    // a history event recorded the stop
    let events = f.store.events();
    assert!(events
        .iter()
        .any(|e| e.object_id == Some(b.id) && e.description.contains("stopped")));

    assert_eq!(
        wait_for_status(&f.store, a.id, TaskStatus::Success, Duration::from_secs(15)).await,
        TaskStatus::Success
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn force_stop_kills_a_running_task() {
    let repo_dir = tempfile::tempdir().unwrap();
    std::fs::write(repo_dir.path().join("task.sh"), "#!/bin/sh\nsleep 30\n").unwrap();

    let f = fixture(0, true);
    // swap in the slow script
    f.store.insert_repository(Repository {
        id: 1,
        project_id: 1,
        name: "repo".into(),
        git_url: repo_dir.path().display().to_string(),
        git_branch: "main".into(),
        ssh_key_id: None,
    });

    let a = f
        .pool
        .add_task(Task::new(1, 1), None, "alice", 1, false)
        .await
        .unwrap();

    assert_eq!(
        wait_for_status(&f.store, a.id, TaskStatus::Running, Duration::from_secs(10)).await,
        TaskStatus::Running
    );

    f.pool
        .stop_task(&f.store.get_task(1, a.id).await.unwrap(), true)
        .await
        .unwrap();

    assert_eq!(
        wait_for_status(&f.store, a.id, TaskStatus::Stopped, Duration::from_secs(10)).await,
        TaskStatus::Stopped
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn build_templates_derive_versions() {
    let f = fixture(0, true);
    f.store.insert_template(Template {
        id: 2,
        project_id: 1,
        name: "build".into(),
        app: TemplateApp::Bash,
        kind: TemplateType::Build,
        repository_id: 1,
        playbook: "task.sh".into(),
        allow_parallel_tasks: true,
        start_version: Some("v1-rc".into()),
        ..Default::default()
    });

    // first build uses the start version
    let first = f
        .pool
        .add_task(Task::new(1, 2), None, "ci", 1, false)
        .await
        .unwrap();
    assert_eq!(first.version.as_deref(), Some("v1-rc"));

    // a later build increments the last version
    let mut last = Task::new(1, 2);
    last.version = Some("v4-rc".into());
    last.status = TaskStatus::Success;
    f.store.create_task(last, 0).await.unwrap();

    let next = f
        .pool
        .add_task(Task::new(1, 2), None, "ci", 1, false)
        .await
        .unwrap();
    assert_eq!(next.version.as_deref(), Some("v5-rc"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stopping_an_unmanaged_task_marks_the_row() {
    let f = fixture(0, true);

    // a task that exists in the store but is not held by the pool
    let mut orphan = Task::new(1, 1);
    orphan.status = TaskStatus::Running;
    let orphan = f.store.create_task(orphan, 0).await.unwrap();

    f.pool.stop_task(&orphan, false).await.unwrap();

    let row = f.store.get_task(1, orphan.id).await.unwrap();
    assert_eq!(row.status, TaskStatus::Stopped);
    assert!(row.end.is_some());
    assert!(f
        .store
        .events()
        .iter()
        .any(|e| e.object_id == Some(orphan.id)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn task_alias_resolves_while_active() {
    let repo_dir = tempfile::tempdir().unwrap();
    std::fs::write(repo_dir.path().join("task.sh"), "#!/bin/sh\nsleep 3\n").unwrap();

    let f = fixture(0, true);
    f.store.insert_repository(Repository {
        id: 1,
        project_id: 1,
        name: "repo".into(),
        git_url: repo_dir.path().display().to_string(),
        git_branch: "main".into(),
        ssh_key_id: None,
    });

    let task = f
        .pool
        .add_task(Task::new(1, 1), None, "alice", 1, true)
        .await
        .unwrap();

    // the scheduler picks the registration up asynchronously
    tokio::time::sleep(Duration::from_millis(300)).await;

    let active = f.pool.get_task(task.id).await.expect("task is active");
    let alias = active.alias().expect("alias assigned");
    assert_eq!(alias.len(), 32);

    let by_alias = f.pool.get_task_by_alias(&alias).await.expect("resolvable");
    assert_eq!(by_alias.task_id(), task.id);

    wait_for_status(&f.store, task.id, TaskStatus::Success, Duration::from_secs(15)).await;

    // terminal tasks release their alias
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(f.pool.get_task_by_alias(&alias).await.is_none());
}

#[tokio::test]
async fn validation_failures_surface_before_enqueue() {
    let f = fixture(0, true);

    // unknown template
    let err = f
        .pool
        .add_task(Task::new(1, 99), None, "alice", 1, false)
        .await
        .unwrap_err();
    assert!(err.is_not_found());

    // params that do not fit the app
    let mut bad = Task::new(1, 1);
    bad.params = serde_json::from_str(r#"{"limit": 42}"#).unwrap();
    // bash accepts anything; use an ansible template to reject
    f.store.insert_template(Template {
        id: 3,
        project_id: 1,
        name: "play".into(),
        app: TemplateApp::Ansible,
        repository_id: 1,
        inventory_id: Some(1),
        playbook: "site.yml".into(),
        ..Default::default()
    });
    bad.template_id = 3;
    let err = f.pool.add_task(bad, None, "alice", 1, false).await.unwrap_err();
    assert!(matches!(err, conveyor_core::Error::Validation(_)));
}
