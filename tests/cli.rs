//! Subcommand behavior of the service binary.
use assert_cmd::Command;

#[test]
fn build_doc_lists_every_variable() {
    let output = Command::cargo_bin("icc-service")
        .expect("binary")
        .arg("build-doc")
        .output()
        .expect("run build-doc");
    assert!(output.status.success());

    let doc = String::from_utf8_lossy(&output.stdout);
    for name in [
        "ICC_PORT",
        "ICC_REDIS_HOST",
        "ICC_REDIS_PORT",
        "OPENSLIDES_DEVELOPMENT",
        "DATASTORE_READER_HOST",
    ] {
        assert!(doc.contains(name), "{name} missing from doc:\n{doc}");
    }
}

#[test]
fn health_succeeds_against_a_healthy_service() {
    // Multi-thread runtime so the stub keeps serving while this thread
    // blocks on the subprocess.
    let rt = tokio::runtime::Runtime::new().expect("rt");
    let addr = rt.block_on(async {
        let app = axum::Router::new().route(
            "/system/icc/health",
            axum::routing::get(|| async { "{\"healthy\": true}\n" }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind stub");
        let addr = listener.local_addr().expect("local addr");
        tokio::spawn(async move {
            let _ = axum::serve(listener, app.into_make_service()).await;
        });
        addr
    });

    Command::cargo_bin("icc-service")
        .expect("binary")
        .args([
            "health",
            "--host",
            "127.0.0.1",
            "--port",
            &addr.port().to_string(),
        ])
        .assert()
        .success();
}

#[test]
fn health_fails_without_a_service() {
    // Grab a port nothing listens on.
    let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
    let port = listener.local_addr().expect("local addr").port();
    drop(listener);

    Command::cargo_bin("icc-service")
        .expect("binary")
        .args(["health", "--host", "127.0.0.1", "--port", &port.to_string()])
        .assert()
        .failure();
}
