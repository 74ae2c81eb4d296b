//! Pipe plumbing: concurrent capture, limits, streaming, redirection.

use std::io::Read;

use tokio::io::AsyncWriteExt;

use offshoot::{run, run_collected, Input, Output, SpawnRequest};

fn sh(script: &str) -> SpawnRequest {
    SpawnRequest::builder()
        .program("/bin/sh")
        .arg("-c")
        .arg(script)
        .build()
}

// =============================================================================
// Concurrent draining
// =============================================================================

/// A child interleaving far more than one pipe buffer on each stream must
/// be fully captured on both sides; draining one stream at a time would
/// deadlock here.
#[tokio::test]
async fn large_interleaved_output_does_not_deadlock() {
    // 4000 lines x 41 bytes on each side, well past the 64 KiB pipe buffer.
    let script = r"
        i=0
        while [ $i -lt 4000 ]; do
            echo oooooooooooooooooooooooooooooooooooooooo
            echo eeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeee 1>&2
            i=$((i+1))
        done
    ";
    let result = run_collected(sh(script), Input::null()).await.unwrap();

    assert!(result.status.success());
    assert_eq!(result.stdout.len(), 4000 * 41);
    assert_eq!(result.stderr.len(), 4000 * 41);
}

#[tokio::test]
async fn collect_limit_caps_retention_but_drains_fully() {
    // The child writes ~200 KiB; retaining 1 KiB must not stall it.
    let script = r"
        i=0
        while [ $i -lt 5000 ]; do
            echo oooooooooooooooooooooooooooooooooooooooo
            i=$((i+1))
        done
    ";
    let ((stdout, stderr), status) = run(
        sh(script),
        Input::null(),
        Output::collect_limited(1024),
        Output::collect(),
        |mut execution| async move { execution.capture_both().await.unwrap() },
    )
    .await
    .unwrap();

    assert!(status.success());
    assert_eq!(stdout.len(), 1024);
    assert!(stderr.is_empty());
}

// =============================================================================
// Streaming view
// =============================================================================

#[tokio::test]
async fn streamed_stdout_concatenates_to_full_output() {
    let ((collected, chunks), status) = run(
        sh("echo one; echo two; echo three"),
        Input::null(),
        Output::stream(),
        Output::discard(),
        |mut execution| async move {
            let mut stdout = execution.stdout_reader();
            let mut collected = Vec::new();
            let mut chunks = 0usize;
            while let Some(chunk) = stdout.next_chunk().await.unwrap() {
                collected.extend_from_slice(&chunk);
                chunks += 1;
            }
            (collected, chunks)
        },
    )
    .await
    .unwrap();

    assert!(status.success());
    assert!(chunks >= 1);
    assert_eq!(collected, b"one\ntwo\nthree\n");
}

// =============================================================================
// Standard input
// =============================================================================

#[tokio::test]
async fn piped_stdin_reaches_the_child() {
    let request = SpawnRequest::new("/bin/cat");
    let (capture, status) = run(
        request,
        Input::piped(),
        Output::collect(),
        Output::collect(),
        |mut execution| async move {
            let mut stdin = execution.stdin_writer().expect("stdin was piped");
            stdin.write_all(b"hello from stdin").await.unwrap();
            // EOF lets cat finish.
            stdin.finish();
            execution.capture_both().await.unwrap()
        },
    )
    .await
    .unwrap();

    assert!(status.success());
    assert_eq!(capture.0, b"hello from stdin");
}

#[tokio::test]
async fn stdin_from_fd_reaches_the_child() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("input.txt");
    std::fs::write(&path, b"file-backed input").unwrap();

    let source = std::fs::File::open(&path).unwrap();
    let result_status = run(
        SpawnRequest::new("/bin/cat"),
        Input::from_fd(source.into()),
        Output::collect(),
        Output::discard(),
        |mut execution| async move { execution.capture_both().await.unwrap() },
    )
    .await
    .unwrap();

    let ((stdout, _stderr), status) = result_status;
    assert!(status.success());
    assert_eq!(stdout, b"file-backed input");
}

// =============================================================================
// Redirection to descriptors
// =============================================================================

#[tokio::test]
async fn stdout_redirected_to_file_descriptor() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("out.txt");
    let sink = std::fs::File::create(&path).unwrap();

    let ((), status) = run(
        SpawnRequest::builder()
            .program("/bin/echo")
            .arg("to a file")
            .build(),
        Input::null(),
        Output::to_fd(sink.into()),
        Output::discard(),
        |_execution| async {},
    )
    .await
    .unwrap();
    assert!(status.success());

    let mut contents = String::new();
    std::fs::File::open(&path)
        .unwrap()
        .read_to_string(&mut contents)
        .unwrap();
    assert_eq!(contents, "to a file\n");
}
