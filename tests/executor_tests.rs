use std::time::Duration;

use tokio_util::sync::CancellationToken;

use rexec_lite::event::{AsyncEvent, JobSpec};
use rexec_lite::worker::{ExecutionResult, JobExecutor, LineSink, Registry, StreamEvent, StreamKind};

/// Create a test executor with the builtin procedures
fn test_executor() -> JobExecutor {
    JobExecutor::new(Registry::builtin(), Duration::from_secs(10))
}

fn shell_event(script: &str) -> AsyncEvent {
    AsyncEvent {
        auth_name: "tester:0000".to_string(),
        uid: "1700000000.0001".to_string(),
        push_urls: None,
        job: JobSpec::Subprocess {
            argv: vec!["sh".to_string(), "-c".to_string(), script.to_string()],
        },
    }
}

struct Captured {
    result: ExecutionResult,
    lines: Vec<String>,
    closed: Vec<StreamKind>,
}

/// Execute while draining the sink concurrently, as the shipper does.
async fn execute(executor: &JobExecutor, event: AsyncEvent) -> Captured {
    let (sink, mut rx) = LineSink::channel();
    let collector = tokio::spawn(async move {
        let mut lines = Vec::new();
        let mut closed = Vec::new();
        while let Some(event) = rx.recv().await {
            match event {
                StreamEvent::Line(line) => lines.push(line),
                StreamEvent::Closed(kind) => closed.push(kind),
            }
        }
        (lines, closed)
    });
    let result = executor.execute(&event, sink, CancellationToken::new()).await;
    let (lines, closed) = collector.await.unwrap();
    Captured {
        result,
        lines,
        closed,
    }
}

#[tokio::test]
async fn test_execute_simple_command() {
    let executor = test_executor();
    let event = shell_event("echo hello");

    let captured = execute(&executor, event.clone()).await;

    assert_eq!(captured.result.uid, event.uid);
    assert_eq!(captured.result.exit_code, 0);
    assert!(!captured.result.timed_out);
    assert_eq!(captured.lines, vec!["hello"]);
}

#[tokio::test]
async fn test_execute_empty_output() {
    let executor = test_executor();

    let captured = execute(&executor, shell_event("true")).await;

    assert_eq!(captured.result.exit_code, 0);
    assert!(captured.lines.is_empty());
    assert_eq!(captured.closed.len(), 2);
}

#[tokio::test]
async fn test_execute_large_output() {
    let executor = test_executor();

    // More lines than the queue holds, so the reader must keep up
    let captured = execute(&executor, shell_event("seq 1 1000")).await;

    assert_eq!(captured.result.exit_code, 0);
    assert_eq!(captured.lines.len(), 1000);
    assert_eq!(captured.lines.first().map(String::as_str), Some("1"));
    assert_eq!(captured.lines.last().map(String::as_str), Some("1000"));
}

#[tokio::test]
async fn test_execute_command_failure() {
    let executor = test_executor();

    let captured = execute(&executor, shell_event("exit 7")).await;

    assert_eq!(captured.result.exit_code, 1);
    assert!(!captured.result.timed_out);
}

#[tokio::test]
async fn test_execute_command_with_stderr() {
    let executor = test_executor();

    let captured = execute(&executor, shell_event("echo 'error message' >&2 && exit 1")).await;

    assert_eq!(captured.result.exit_code, 1);
    assert_eq!(captured.lines, vec!["error message"]);
    assert!(captured.closed.contains(&StreamKind::Stdout));
    assert!(captured.closed.contains(&StreamKind::Stderr));
}

#[tokio::test]
async fn test_execute_timeout() {
    let executor = JobExecutor::new(Registry::builtin(), Duration::from_millis(200));

    let captured = execute(&executor, shell_event("echo started; sleep 30")).await;

    assert_eq!(captured.result.exit_code, 1);
    assert!(captured.result.timed_out);
    assert_eq!(captured.lines, vec!["started", "timeout after 200ms"]);
}

#[tokio::test]
async fn test_execute_unknown_rpc() {
    let executor = test_executor();
    let event = AsyncEvent {
        job: JobSpec::Rpc {
            name: "missing".to_string(),
            args: "{}".to_string(),
        },
        ..shell_event("")
    };

    let captured = execute(&executor, event).await;

    assert_eq!(captured.result.exit_code, 1);
    assert_eq!(captured.lines, vec!["error: rpc not found: missing"]);
    assert_eq!(captured.closed.len(), 3);
}
