use std::path::PathBuf;

fn fixture() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures/mock-playwright.sh")
}

#[test]
fn fixture_script_exists() {
    assert!(fixture().exists());
}

#[cfg(unix)]
mod unix {
    use super::fixture;
    use local_test_dashboard_lib::config::DashboardConfig;
    use local_test_dashboard_lib::controller::{RunController, Subscription};
    use local_test_dashboard_lib::errors::AppError;
    use local_test_dashboard_lib::models::{
        DashboardEvent, LogLevel, RunDetail, RunStatus, SearchFilters, StartRunPayload,
    };
    use std::collections::BTreeMap;
    use tokio::time::{sleep, timeout, Duration};

    fn mock_run(extra_args: &[&str], env: &[(&str, &str)]) -> StartRunPayload {
        let mut args = vec![fixture().to_string_lossy().to_string()];
        args.extend(extra_args.iter().map(|arg| arg.to_string()));
        StartRunPayload {
            subject_name: "proj1".to_string(),
            command: "sh".to_string(),
            args,
            env: env
                .iter()
                .map(|(key, value)| (key.to_string(), value.to_string()))
                .collect::<BTreeMap<_, _>>(),
            context: Some("staging".to_string()),
            cwd: None,
        }
    }

    fn shell_run(script: &str) -> StartRunPayload {
        StartRunPayload {
            subject_name: "proj1".to_string(),
            command: "sh".to_string(),
            args: vec!["-c".to_string(), script.to_string()],
            ..StartRunPayload::default()
        }
    }

    async fn wait_until_finished(controller: &RunController, run_id: &str) -> RunDetail {
        timeout(Duration::from_secs(15), async {
            loop {
                let detail = controller.query(run_id).expect("run");
                if detail.status != RunStatus::Running {
                    return detail;
                }
                sleep(Duration::from_millis(25)).await;
            }
        })
        .await
        .expect("run finished in time")
    }

    async fn wait_for_pid(controller: &RunController, run_id: &str) {
        timeout(Duration::from_secs(10), async {
            while controller.query(run_id).expect("run").pid.is_none() {
                sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .expect("pid attached");
    }

    async fn events_until_done(subscription: &mut Subscription, run_id: &str) -> Vec<DashboardEvent> {
        timeout(Duration::from_secs(15), async {
            let mut events = Vec::new();
            while let Some(envelope) = subscription.events.recv().await {
                let done = matches!(
                    &envelope.event,
                    DashboardEvent::RunCompleted { run_id: id, .. }
                        | DashboardEvent::RunCancelled { run_id: id, .. } if id == run_id
                );
                events.push(envelope.event);
                if done {
                    break;
                }
            }
            events
        })
        .await
        .expect("terminal event in time")
    }

    #[tokio::test]
    async fn successful_run_streams_in_order() {
        let controller = RunController::new(&DashboardConfig::default());
        let mut subscription = controller.subscribe();
        let run = controller.start_run(mock_run(&[], &[("BASE_URL", "https://staging.example.test")]));
        assert_eq!(run.status, RunStatus::Running);
        assert!(run.exit_code.is_none());
        assert!(run.ended_at.is_none());

        let events = events_until_done(&mut subscription, &run.id).await;
        assert_eq!(events[0].kind(), "active_runs_snapshot");
        assert_eq!(events[1].kind(), "run_started");
        assert_eq!(events.last().map(DashboardEvent::kind), Some("run_completed"));
        let completions = events
            .iter()
            .filter(|event| event.kind() == "run_completed")
            .count();
        assert_eq!(completions, 1);

        let detail = controller.query(&run.id).expect("run");
        assert_eq!(detail.status, RunStatus::Completed);
        assert_eq!(detail.exit_code, Some(0));
        assert!(detail.ended_at.is_some());
        assert!(detail.pid.is_some());
        assert_eq!(detail.context.as_deref(), Some("staging"));

        let stdout: Vec<_> = detail.stdout.iter().map(|event| event.data.as_str()).collect();
        assert_eq!(
            stdout,
            vec![
                "Running 2 tests using 1 worker",
                "  Running test A",
                "  Running test A \u{2713}",
                "target: https://staging.example.test",
            ]
        );
        assert_eq!(detail.stderr[0].data, "progress: done");
        assert!(detail
            .logs
            .iter()
            .any(|entry| entry.level == LogLevel::Success && entry.message == "Running test A \u{2713}"));

        let streamed: Vec<_> = events
            .iter()
            .filter_map(|event| match event {
                DashboardEvent::OutputAppended { event, .. } => Some(event.data.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(streamed.len(), 5);
    }

    #[tokio::test]
    async fn nonzero_exit_marks_failed() {
        let controller = RunController::new(&DashboardConfig::default());
        let run = controller.start_run(mock_run(&[], &[("MOCK_EXIT", "1")]));
        let detail = wait_until_finished(&controller, &run.id).await;
        assert_eq!(detail.status, RunStatus::Failed);
        assert_eq!(detail.exit_code, Some(1));
    }

    #[tokio::test]
    async fn missing_working_directory_fails_without_pid() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut payload = mock_run(&[], &[]);
        payload.cwd = Some(dir.path().join("missing").to_string_lossy().to_string());

        let controller = RunController::new(&DashboardConfig::default());
        let run = controller.start_run(payload);
        let detail = wait_until_finished(&controller, &run.id).await;
        assert_eq!(detail.status, RunStatus::Failed);
        assert_eq!(detail.exit_code, Some(-1));
        assert!(detail.pid.is_none());
        assert!(detail
            .logs
            .iter()
            .any(|entry| entry.level == LogLevel::Error && entry.message.starts_with("Working directory not found")));
    }

    #[tokio::test]
    async fn cancel_is_immediate_and_final() {
        let config = DashboardConfig {
            cancel_grace_ms: 200,
            ..DashboardConfig::default()
        };
        let controller = RunController::new(&config);
        let mut subscription = controller.subscribe();
        let run = controller.start_run(mock_run(&["--slow"], &[]));
        wait_for_pid(&controller, &run.id).await;

        let cancelled = controller.cancel(&run.id).expect("cancel");
        assert_eq!(cancelled.status, RunStatus::Cancelled);
        assert!(cancelled.ended_at.is_some());
        assert!(cancelled.exit_code.is_some());
        assert!(matches!(controller.cancel(&run.id), Err(AppError::NotRunning(_))));

        let events = events_until_done(&mut subscription, &run.id).await;
        assert_eq!(events.last().map(DashboardEvent::kind), Some("run_cancelled"));

        sleep(Duration::from_millis(600)).await;
        let later = controller.query(&run.id).expect("run");
        assert_eq!(later.status, RunStatus::Cancelled);
        assert_eq!(later.ended_at, cancelled.ended_at);
        assert_eq!(later.stdout.len(), cancelled.stdout.len());
        assert!(controller.list_active().is_empty());
    }

    #[tokio::test]
    async fn late_subscriber_gets_snapshot_without_duplicate_start() {
        let controller = RunController::new(&DashboardConfig {
            cancel_grace_ms: 200,
            ..DashboardConfig::default()
        });
        let run = controller.start_run(mock_run(&["--slow"], &[]));
        wait_for_pid(&controller, &run.id).await;

        let mut subscription = controller.subscribe();
        controller.cancel(&run.id).expect("cancel");
        let events = events_until_done(&mut subscription, &run.id).await;

        match &events[0] {
            DashboardEvent::ActiveRunsSnapshot { runs } => {
                assert!(runs.iter().any(|snapshot| snapshot.id == run.id));
            }
            other => panic!("expected snapshot first, got {}", other.kind()),
        }
        assert!(!events.iter().any(|event| event.kind() == "run_started"));
    }

    #[tokio::test]
    async fn skipped_tests_are_annotated() {
        let controller = RunController::new(&DashboardConfig::default());
        let run = controller.start_run(mock_run(&[], &[("MOCK_SKIP", "1")]));
        let detail = wait_until_finished(&controller, &run.id).await;
        assert_eq!(detail.status, RunStatus::Completed);
        assert!(detail
            .logs
            .iter()
            .any(|entry| entry.level == LogLevel::Skip && entry.message == "1 skipped"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn cancel_right_after_start_stops_the_process() {
        let dir = tempfile::tempdir().expect("tempdir");
        let controller = RunController::new(&DashboardConfig::default());
        let markers: Vec<_> = (0..10).map(|index| dir.path().join(format!("ran-{}", index))).collect();

        for marker in &markers {
            let run = controller.start_run(shell_run(&format!("sleep 1; touch '{}'", marker.display())));
            let cancelled = controller.cancel(&run.id).expect("cancel");
            assert_eq!(cancelled.status, RunStatus::Cancelled);
        }

        sleep(Duration::from_millis(1_800)).await;
        let finished = markers.iter().filter(|marker| marker.exists()).count();
        assert_eq!(finished, 0);
    }

    #[tokio::test]
    async fn clearing_a_running_run_ends_it_and_stops_the_process() {
        let dir = tempfile::tempdir().expect("tempdir");
        let marker = dir.path().join("ran");
        let controller = RunController::new(&DashboardConfig::default());
        let mut subscription = controller.subscribe();
        let run = controller.start_run(shell_run(&format!("sleep 1; touch '{}'", marker.display())));
        wait_for_pid(&controller, &run.id).await;

        assert_eq!(controller.clear(None), 1);
        let events = events_until_done(&mut subscription, &run.id).await;
        assert_eq!(events.last().map(DashboardEvent::kind), Some("run_cancelled"));
        assert!(matches!(controller.cancel(&run.id), Err(AppError::NotFound(_))));

        sleep(Duration::from_millis(1_800)).await;
        assert!(!marker.exists());
    }

    #[tokio::test]
    async fn evicting_a_running_run_ends_it_and_stops_the_process() {
        let dir = tempfile::tempdir().expect("tempdir");
        let marker = dir.path().join("ran");
        let controller = RunController::new(&DashboardConfig {
            history_limit: 1,
            ..DashboardConfig::default()
        });
        let mut subscription = controller.subscribe();
        let oldest = controller.start_run(shell_run(&format!("sleep 1; touch '{}'", marker.display())));
        wait_for_pid(&controller, &oldest.id).await;

        let newest = controller.start_run(shell_run("echo newest"));
        let events = events_until_done(&mut subscription, &oldest.id).await;
        assert_eq!(events.last().map(DashboardEvent::kind), Some("run_cancelled"));
        assert!(controller.query(&oldest.id).is_err());
        wait_until_finished(&controller, &newest.id).await;

        sleep(Duration::from_millis(1_800)).await;
        assert!(!marker.exists());
    }

    #[tokio::test]
    async fn rerun_repeats_the_launch() {
        let controller = RunController::new(&DashboardConfig::default());
        let first = controller.start_run(mock_run(&[], &[("BASE_URL", "http://localhost:3000")]));
        wait_until_finished(&controller, &first.id).await;

        let second = controller.rerun(&first.id).expect("rerun");
        assert_ne!(second.id, first.id);
        assert_eq!(second.args, first.args);
        let detail = wait_until_finished(&controller, &second.id).await;
        assert_eq!(detail.status, RunStatus::Completed);
        assert!(detail
            .stdout
            .iter()
            .any(|event| event.data == "target: http://localhost:3000"));
    }

    #[tokio::test]
    async fn concurrent_runs_are_independent_and_bounded() {
        let controller = RunController::new(&DashboardConfig {
            history_limit: 3,
            ..DashboardConfig::default()
        });
        let runs: Vec<_> = (0..4)
            .map(|index| {
                let exit = if index % 2 == 0 { "0" } else { "1" };
                controller.start_run(mock_run(&[], &[("MOCK_EXIT", exit)]))
            })
            .collect();

        assert_eq!(controller.list_all().len(), 3);
        assert!(controller.query(&runs[0].id).is_err());

        for run in &runs[1..] {
            wait_until_finished(&controller, &run.id).await;
        }

        let failed = controller.search(&SearchFilters {
            q: Some("PROJ1".to_string()),
            status: Some(RunStatus::Failed),
            ..SearchFilters::default()
        });
        let failed_ids: Vec<_> = failed.iter().map(|run| run.id.clone()).collect();
        assert_eq!(failed_ids, vec![runs[3].id.clone(), runs[1].id.clone()]);

        assert_eq!(controller.clear(None), 3);
        assert!(controller.list_all().is_empty());
    }
}
