use std::sync::Arc;

use bytes::Bytes;
use rexec_workertool::{
    Error, LaunchCommand, WorkerTool, WorkerToolExecutor, WorkerToolState, WorkerToolStep,
    ERROR_EXIT_CODE,
};
use rstest::rstest;

fn echo_worker() -> Arc<LaunchCommand> {
    Arc::new(
        LaunchCommand::custom(vec![env!("CARGO_BIN_EXE_rexec-echo-worker").to_string()])
            .expect("must succeed"),
    )
}

#[tokio::test]
async fn persistent_worker() {
    let mut tool = WorkerTool::new(echo_worker());
    tool.launch().await.expect("must launch");

    for i in 0..3 {
        let action_id = format!("action-{}", i);
        let result = tool
            .execute_command(&action_id, Bytes::from(format!("payload {}", i)))
            .await
            .expect("must succeed");

        assert_eq!(action_id, result.action_id);
        assert_eq!(0, result.exit_code);
        assert_eq!(format!("payload {}", i), result.message);
    }

    tool.shutdown().await;
    assert_eq!(WorkerToolState::ShutDown, tool.state());
}

#[rstest]
#[case::success("hello", 0)]
#[case::failure("exit 42", 42)]
#[tokio::test]
async fn step(#[case] payload: &'static str, #[case] exit_code: i32) {
    let step = WorkerToolStep::new(echo_worker(), Bytes::from_static(payload.as_bytes()));

    let result = step.execute("action-1").await.expect("must succeed");

    assert_eq!(exit_code, result.exit_code);
    assert!(result.cause.is_none());
    assert_eq!(
        vec![env!("CARGO_BIN_EXE_rexec-echo-worker")],
        result.executed_command
    );
}

/// A worker dying mid-command fails the step, not the caller.
#[tokio::test]
async fn worker_crash() {
    let step = WorkerToolStep::new(echo_worker(), Bytes::from_static(b"crash"));

    let result = step.execute("action-1").await.expect("must succeed");

    assert_eq!(ERROR_EXIT_CODE, result.exit_code);
    assert_eq!(Some("ActionId: action-1".to_string()), result.stderr);
    assert!(matches!(result.cause, Some(Error::WorkerExited)));
}

#[tokio::test]
async fn crash_shuts_the_tool_down() {
    let mut tool = WorkerTool::new(echo_worker());
    tool.launch().await.expect("must launch");

    assert!(tool
        .execute_command("action-1", Bytes::from_static(b"crash"))
        .await
        .is_err());
    assert_eq!(WorkerToolState::ShutDown, tool.state());
}
