// ABOUTME: Integration tests for command dispatch, task status, output, kill, and pruning
// ABOUTME: Runs real shell processes on the host through the host-backed provider

mod common;

use common::Harness;
use pretty_assertions::assert_eq;
use shellbox_sandbox::{
    CommandRequest, KillSignal, SandboxError, TaskState, ToolRequest, ToolResponse,
};
use std::collections::BTreeMap;
use std::time::Duration;

#[tokio::test]
async fn test_foreground_listing_succeeds() {
    let harness = Harness::new();

    let outcome = harness
        .engine
        .execute_command(CommandRequest::new("ls -ltrah /"))
        .await
        .unwrap();

    assert!(!outcome.timed_out);
    assert_eq!(outcome.status.state, TaskState::Succeeded);
    assert_eq!(outcome.status.exit_code, Some(0));
    assert!(!outcome.status.running);
    assert!(outcome.output.unwrap().starts_with("total"));
}

#[tokio::test]
async fn test_background_task_runs_to_completion() {
    let harness = Harness::new();
    let registry = harness.engine.registry();

    let outcome = harness
        .engine
        .execute_command(CommandRequest::new("sleep 5 && echo done").background())
        .await
        .unwrap();
    assert!(outcome.output.is_none());

    tokio::time::sleep(Duration::from_millis(500)).await;
    let status = registry.status(&outcome.task_id).await.unwrap();
    assert!(status.running);
    assert_eq!(status.exit_code, None);

    tokio::time::sleep(Duration::from_secs(6)).await;
    let status = registry.status(&outcome.task_id).await.unwrap();
    assert!(!status.running);
    assert_eq!(status.state, TaskState::Succeeded);
    assert_eq!(status.exit_code, Some(0));

    let output = registry.output(&outcome.task_id, None).await.unwrap();
    assert!(output.trim_end().ends_with("done"));
}

#[tokio::test]
async fn test_same_command_gets_distinct_ids() {
    let harness = Harness::new();

    let first = harness
        .engine
        .execute_command(CommandRequest::new("true"))
        .await
        .unwrap();
    let second = harness
        .engine
        .execute_command(CommandRequest::new("true"))
        .await
        .unwrap();

    assert_ne!(first.task_id, second.task_id);
    assert_eq!(harness.engine.registry().list(false).await.len(), 2);
}

#[tokio::test]
async fn test_nonzero_exit_is_failed_not_error() {
    let harness = Harness::new();

    let outcome = harness
        .engine
        .execute_command(CommandRequest::new("echo partial; exit 3"))
        .await
        .unwrap();

    assert_eq!(outcome.status.state, TaskState::Failed);
    assert_eq!(outcome.status.exit_code, Some(3));
    assert_eq!(outcome.output.as_deref(), Some("partial\n"));
}

#[tokio::test]
async fn test_retried_launch_does_not_run_the_command_twice() {
    let harness = Harness::new();
    harness.lifecycle().ensure_ready().await.unwrap();
    let runs = harness.dir.path().join("runs.txt");

    harness.provider.lose_next_replies(1);
    let outcome = harness
        .engine
        .execute_command(CommandRequest::new(format!(
            "echo run >> '{}'",
            runs.display()
        )))
        .await
        .unwrap();

    assert_eq!(outcome.status.state, TaskState::Succeeded);
    assert_eq!(std::fs::read_to_string(&runs).unwrap(), "run\n");
}

#[tokio::test]
async fn test_concurrent_dispatches_stay_independent() {
    let harness = Harness::new();
    harness.lifecycle().ensure_ready().await.unwrap();

    let outcomes = futures::future::join_all((0..6).map(|n| {
        harness
            .engine
            .execute_command(CommandRequest::new(format!("sleep 0.3; echo task-{}", n)))
    }))
    .await;

    let mut ids = Vec::new();
    for (n, outcome) in outcomes.into_iter().enumerate() {
        let outcome = outcome.unwrap();
        assert_eq!(outcome.status.state, TaskState::Succeeded);
        assert_eq!(outcome.output, Some(format!("task-{}\n", n)));
        ids.push(outcome.task_id);
    }
    ids.sort();
    ids.dedup();
    assert_eq!(ids.len(), 6);
}

#[tokio::test]
async fn test_shell_metacharacters_survive_materialization() {
    let harness = Harness::new();
    let command = r#"printf '%s\n' "it's" 'a "quoted" $HOME' | tr a-z A-Z && echo 'x && y' | wc -w"#;

    let outcome = harness
        .engine
        .execute_command(CommandRequest::new(command))
        .await
        .unwrap();

    assert_eq!(outcome.status.exit_code, Some(0));
    let output = outcome.output.unwrap();
    let lines: Vec<&str> = output.lines().map(str::trim).collect();
    assert_eq!(lines, vec!["IT'S", "A \"QUOTED\" $HOME", "3"]);
}

#[tokio::test]
async fn test_environment_file_and_request_env_reach_the_script() {
    let harness = Harness::with_config(|config| {
        std::fs::write(&config.env_file, "FOO=bar\n# a comment\nexport SHARED='from file'\n")
            .unwrap();
    });

    let mut env = BTreeMap::new();
    env.insert("SHARED".to_string(), "from request".to_string());
    let outcome = harness
        .engine
        .execute_command(CommandRequest {
            env,
            ..CommandRequest::new("echo \"$FOO/$SHARED\"")
        })
        .await
        .unwrap();

    assert_eq!(outcome.output.as_deref(), Some("bar/from request\n"));
}

#[tokio::test]
async fn test_working_dir_is_applied_and_escapes_rejected() {
    let harness = Harness::new();
    std::fs::create_dir_all(harness.engine.workspace().host_root().join("proj/src")).unwrap();

    let outcome = harness
        .engine
        .execute_command(CommandRequest {
            working_dir: Some("proj/src".to_string()),
            ..CommandRequest::new("basename \"$PWD\"")
        })
        .await
        .unwrap();
    assert_eq!(outcome.output.as_deref(), Some("src\n"));

    let err = harness
        .engine
        .execute_command(CommandRequest {
            working_dir: Some("../outside".to_string()),
            ..CommandRequest::new("pwd")
        })
        .await
        .unwrap_err();
    assert!(matches!(err, SandboxError::InvalidPath(_)));
}

#[tokio::test]
async fn test_foreground_timeout_leaves_task_running() {
    let harness = Harness::new();
    let registry = harness.engine.registry();

    let outcome = harness
        .engine
        .execute_command(
            CommandRequest::new("echo started; sleep 30").timeout(Duration::from_millis(500)),
        )
        .await
        .unwrap();

    assert!(outcome.timed_out);
    assert_eq!(outcome.status.state, TaskState::Running);
    assert_eq!(outcome.status.exit_code, None);
    assert_eq!(outcome.output.as_deref(), Some("started\n"));

    let killed = registry
        .kill(&outcome.task_id, KillSignal::Term, None)
        .await
        .unwrap();
    assert!(killed.signal_sent);

    let status = registry
        .wait(&outcome.task_id, Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(status.state, TaskState::Killed);
    assert_eq!(status.exit_code, None);
}

#[tokio::test]
async fn test_kill_terminal_task_is_idempotent() {
    let harness = Harness::new();
    let registry = harness.engine.registry();

    let outcome = harness
        .engine
        .execute_command(CommandRequest::new("exit 0"))
        .await
        .unwrap();
    assert_eq!(outcome.status.state, TaskState::Succeeded);

    for signal in [KillSignal::Term, KillSignal::Kill] {
        let killed = registry.kill(&outcome.task_id, signal, None).await.unwrap();
        assert!(!killed.signal_sent);
        assert_eq!(killed.status.state, TaskState::Succeeded);
        assert_eq!(killed.status.exit_code, Some(0));
    }
}

#[tokio::test]
async fn test_kill_escalates_when_term_is_ignored() {
    let harness = Harness::new();
    let registry = harness.engine.registry();

    let outcome = harness
        .engine
        .execute_command(
            CommandRequest::new("trap '' TERM; while true; do sleep 0.1; done").background(),
        )
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;

    let killed = registry
        .kill(
            &outcome.task_id,
            KillSignal::Term,
            Some(Duration::from_millis(500)),
        )
        .await
        .unwrap();
    assert!(killed.escalated);

    let status = registry
        .wait(&outcome.task_id, Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(status.state, TaskState::Killed);
}

#[tokio::test]
async fn test_kill_after_marks_timed_out() {
    let harness = Harness::new();

    let outcome = harness
        .engine
        .execute_command(CommandRequest {
            kill_after: Some(Duration::from_millis(300)),
            ..CommandRequest::new("sleep 30").background()
        })
        .await
        .unwrap();

    let status = harness
        .engine
        .registry()
        .wait(&outcome.task_id, Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(status.state, TaskState::TimedOut);
    assert_eq!(status.exit_code, None);
}

#[tokio::test]
async fn test_wait_reports_execution_timeout() {
    let harness = Harness::new();
    let outcome = harness
        .engine
        .execute_command(CommandRequest::new("sleep 30").background())
        .await
        .unwrap();

    let err = harness
        .engine
        .registry()
        .wait(&outcome.task_id, Duration::from_millis(100))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "ExecutionTimeout");

    harness
        .engine
        .registry()
        .kill(&outcome.task_id, KillSignal::Kill, None)
        .await
        .unwrap();
}

#[tokio::test]
async fn test_output_tail_on_running_task() {
    let harness = Harness::new();
    let registry = harness.engine.registry();

    let outcome = harness
        .engine
        .execute_command(CommandRequest::new("seq 1 5; sleep 30").background())
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(500)).await;

    assert_eq!(registry.output(&outcome.task_id, Some(2)).await.unwrap(), "4\n5\n");
    registry
        .kill(&outcome.task_id, KillSignal::Kill, None)
        .await
        .unwrap();
}

#[tokio::test]
async fn test_unknown_task_is_reported() {
    let harness = Harness::new();
    let registry = harness.engine.registry();

    let err = registry.status("no-such-task").await.unwrap_err();
    assert_eq!(err.kind(), "UnknownTask");
    assert!(registry.output("no-such-task", None).await.is_err());
    assert!(registry
        .kill("no-such-task", KillSignal::Term, None)
        .await
        .is_err());
}

#[tokio::test]
async fn test_prune_removes_read_tasks_and_their_files() {
    let harness = Harness::new();
    let registry = harness.engine.registry();
    let workspace = harness.engine.workspace();

    let finished = harness
        .engine
        .execute_command(CommandRequest::new("echo bye"))
        .await
        .unwrap();
    let running = harness
        .engine
        .execute_command(CommandRequest::new("sleep 30").background())
        .await
        .unwrap();

    let script = workspace
        .scripts_dir()
        .join(format!("task_{}.sh", finished.task_id));
    let output = workspace
        .task_logs_dir()
        .join(format!("task_{}.out", finished.task_id));
    assert!(script.exists());
    assert!(output.exists());

    assert_eq!(registry.prune().await, 1);
    assert!(!script.exists());
    assert!(!output.exists());
    assert_eq!(
        registry.status(&finished.task_id).await.unwrap_err().kind(),
        "UnknownTask"
    );
    assert!(registry.status(&running.task_id).await.unwrap().running);

    registry
        .kill(&running.task_id, KillSignal::Kill, None)
        .await
        .unwrap();
}

#[tokio::test]
async fn test_unread_background_output_is_retained() {
    let harness = Harness::new();
    let registry = harness.engine.registry();

    let outcome = harness
        .engine
        .execute_command(CommandRequest::new("echo later").background())
        .await
        .unwrap();
    registry
        .wait(&outcome.task_id, Duration::from_secs(5))
        .await
        .unwrap();

    assert_eq!(registry.prune().await, 0);
    assert_eq!(registry.output(&outcome.task_id, None).await.unwrap(), "later\n");
    assert_eq!(registry.prune().await, 1);
}

#[tokio::test]
async fn test_tool_calls_are_dispatched_and_counted() {
    let harness = Harness::new();

    let response = harness
        .engine
        .handle(ToolRequest::ExecuteCommand {
            command: "echo via tool".to_string(),
            working_dir: None,
            env: BTreeMap::new(),
            timeout_seconds: None,
            background: false,
            kill_after_seconds: None,
        })
        .await
        .unwrap();
    let task_id = match response {
        ToolResponse::Execution(outcome) => {
            assert_eq!(outcome.output.as_deref(), Some("via tool\n"));
            outcome.task_id
        }
        other => panic!("unexpected response {:?}", other),
    };

    let response = harness
        .engine
        .handle(ToolRequest::TaskList {
            include_status: true,
        })
        .await
        .unwrap();
    match response {
        ToolResponse::TaskList { tasks } => {
            assert_eq!(tasks.len(), 1);
            assert_eq!(tasks[0].task_id, task_id);
            assert!(tasks[0].status.is_some());
        }
        other => panic!("unexpected response {:?}", other),
    }

    let err = harness
        .engine
        .handle(ToolRequest::TaskKill {
            task_id,
            signal: Some("SIGBOGUS".to_string()),
            escalate_after_seconds: None,
        })
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "InvalidRequest");

    let snapshot = harness.engine.metrics().snapshot();
    assert_eq!(snapshot.requests, 3);
    assert_eq!(snapshot.tools["execute_command"].calls, 1);
    assert_eq!(snapshot.tools["task_list"].calls, 1);
    assert_eq!(snapshot.tools["task_kill"].calls, 1);
}

#[tokio::test]
async fn test_reload_keeps_previous_environment_on_error() {
    let harness = Harness::with_config(|config| {
        std::fs::write(&config.env_file, "FOO=bar\n").unwrap();
    });
    let env_file = harness.dir.path().join("local.env");

    std::fs::write(&env_file, "FOO=baz\nBAR=1\n").unwrap();
    let summary = harness.engine.reload_environment().await.unwrap();
    assert_eq!(summary.variables, vec!["BAR".to_string(), "FOO".to_string()]);
    assert_eq!(harness.engine.environment().await.get("FOO"), Some("baz"));

    std::fs::write(&env_file, "echo hi\n").unwrap();
    let err = harness.engine.reload_environment().await.unwrap_err();
    assert_eq!(err.kind(), "MalformedEnvironmentFile");
    assert_eq!(harness.engine.environment().await.get("FOO"), Some("baz"));
}
