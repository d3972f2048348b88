//! Integration coverage for the stdio wrapper's child-process lifecycle.
//!
//! `forward_and_scan_stdin` reads the test process's own stdin, which EOFs
//! almost immediately under `cargo test`, so these tests exercise the
//! process-management path (exit codes, shutdown) with short-lived real
//! children rather than trying to drive synthetic stdin traffic through it.

mod common;

use common::open_test_store;
use mcphawk::broadcast::BroadcastHub;
use mcphawk::wrapper::StdioWrapper;
use std::sync::Arc;

#[tokio::test]
async fn test_run_returns_child_exit_code_on_normal_completion() {
    let harness = open_test_store();
    let wrapper = StdioWrapper::new(Arc::new(harness.store), BroadcastHub::new(), "true".to_string());
    let (_tx, rx) = tokio::sync::oneshot::channel();

    let code = wrapper.run("true", &[], rx).await.unwrap();
    assert_eq!(code, 0);
    drop(_tx);
}

#[tokio::test]
async fn test_run_propagates_nonzero_exit_code() {
    let harness = open_test_store();
    let wrapper = StdioWrapper::new(
        Arc::new(harness.store),
        BroadcastHub::new(),
        "sh -c 'exit 7'".to_string(),
    );
    let (_tx, rx) = tokio::sync::oneshot::channel();

    let code = wrapper
        .run("sh", &["-c".to_string(), "exit 7".to_string()], rx)
        .await
        .unwrap();
    assert_eq!(code, 7);
    drop(_tx);
}

#[tokio::test]
async fn test_shutdown_signal_terminates_long_running_child() {
    let harness = open_test_store();
    let wrapper = StdioWrapper::new(Arc::new(harness.store), BroadcastHub::new(), "sleep 30".to_string());
    let (tx, rx) = tokio::sync::oneshot::channel();

    let args = ["30".to_string()];
    let run_fut = wrapper.run("sleep", &args, rx);
    tokio::spawn(async move {
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        let _ = tx.send(());
    });

    let code = tokio::time::timeout(std::time::Duration::from_secs(10), run_fut)
        .await
        .expect("wrapper should shut down promptly after the signal")
        .unwrap();
    assert_eq!(code, 130);
}
