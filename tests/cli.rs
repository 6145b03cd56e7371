use std::{
    ffi::OsStr,
    fs,
    path::Path,
    process::{Command, Output},
};

use httpdvr::{
    archive::ArchiveWriter,
    exchange::{Exchange, RecordedError, RecordedRequest, RecordedResponse, RequestUrl},
    transport::TransportErrorKind,
};
use tempfile::tempdir;

const MODE_ENV: [&str; 5] = [
    "HTTPDVR_RECORD",
    "HTTPDVR_REPLAY",
    "HTTPDVR_PASSTHROUGH",
    "HTTPDVR_DEFAULT_REPLAY",
    "HTTPDVR_FILE",
];

fn run_httpdvr<I, S>(args: I, cwd: &Path, env: &[(&str, &str)]) -> Output
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let mut command = Command::new(env!("CARGO_BIN_EXE_httpdvr"));
    command.args(args).current_dir(cwd);
    for name in MODE_ENV {
        command.env_remove(name);
    }
    for (name, value) in env {
        command.env(name, value);
    }
    command.output().expect("httpdvr command should execute")
}

fn assert_success(output: &Output) {
    assert!(
        output.status.success(),
        "command failed\nstdout:\n{}\nstderr:\n{}",
        String::from_utf8_lossy(&output.stdout),
        String::from_utf8_lossy(&output.stderr)
    );
}

fn request(path: &str) -> RecordedRequest {
    RecordedRequest {
        method: "GET".to_owned(),
        url: RequestUrl {
            scheme: "http".to_owned(),
            host: "127.0.0.1:8080".to_owned(),
            path: path.to_owned(),
            ..RequestUrl::default()
        },
        headers: Default::default(),
        trailers: Default::default(),
        body: Vec::new(),
        body_error: None,
    }
}

fn write_sample_archive(path: &Path) {
    let mut writer = ArchiveWriter::create(path).expect("archive should be created");
    writer
        .append_exchange(&Exchange {
            request: request("/201"),
            response: Some(RecordedResponse {
                status: 201,
                headers: Default::default(),
                trailers: Default::default(),
                body: Vec::new(),
                body_error: None,
            }),
            error: None,
        })
        .expect("first record should be appended");
    writer
        .append_exchange(&Exchange {
            request: request("/close"),
            response: None,
            error: Some(RecordedError {
                kind: TransportErrorKind::Closed,
                message: "connection closed before message completed".to_owned(),
            }),
        })
        .expect("second record should be appended");
    writer.finish().expect("archive should be finalized");
}

#[test]
fn inspect_lists_records_in_order() {
    let dir = tempdir().expect("tempdir should be created");
    let archive = dir.path().join("api.dvr");
    write_sample_archive(&archive);

    let output = run_httpdvr(
        [OsStr::new("inspect"), OsStr::new("--archive"), archive.as_os_str()],
        dir.path(),
        &[],
    );
    assert_success(&output);

    let stdout = String::from_utf8(output.stdout).expect("stdout should be UTF-8");
    let lines: Vec<&str> = stdout.lines().collect();
    assert_eq!(
        lines,
        vec![
            "0\tGET\thttp://127.0.0.1:8080/201\t201 (0 bytes)",
            "1\tGET\thttp://127.0.0.1:8080/close\terror closed: connection closed before message completed",
        ]
    );
}

#[test]
fn inspect_uses_archive_from_project_config() {
    let dir = tempdir().expect("tempdir should be created");
    write_sample_archive(&dir.path().join("fixtures.dvr"));
    fs::write(
        dir.path().join("httpdvr.toml"),
        "[archive]\npath = \"fixtures.dvr\"\n",
    )
    .expect("config should be written");

    let output = run_httpdvr(["inspect"], dir.path(), &[]);
    assert_success(&output);
    assert_eq!(String::from_utf8_lossy(&output.stdout).lines().count(), 2);
}

#[test]
fn inspect_rejects_unknown_archive_version() {
    let dir = tempdir().expect("tempdir should be created");
    let archive = dir.path().join("future.dvr");
    fs::write(&archive, [0, 0, 0, 9]).expect("archive should be written");

    let output = run_httpdvr(
        [OsStr::new("inspect"), OsStr::new("--archive"), archive.as_os_str()],
        dir.path(),
        &[],
    );
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("unsupported archive version 9"), "{stderr}");
}

#[test]
fn mode_follows_environment_overrides() {
    let dir = tempdir().expect("tempdir should be created");

    let output = run_httpdvr(["mode"], dir.path(), &[]);
    assert_success(&output);
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.starts_with("mode: passthrough\n"), "{stdout}");
    assert!(stdout.contains("archive: testdata/archive.dvr"), "{stdout}");

    let output = run_httpdvr(
        ["mode"],
        dir.path(),
        &[("HTTPDVR_REPLAY", "true"), ("HTTPDVR_FILE", "other.dvr")],
    );
    assert_success(&output);
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.starts_with("mode: replay\n"), "{stdout}");
    assert!(stdout.contains("archive: other.dvr"), "{stdout}");

    let output = run_httpdvr(
        ["mode"],
        dir.path(),
        &[("HTTPDVR_REPLAY", "true"), ("HTTPDVR_RECORD", "1")],
    );
    assert_success(&output);
    assert!(String::from_utf8_lossy(&output.stdout).starts_with("mode: record\n"));
}

#[test]
fn invalid_environment_boolean_fails() {
    let dir = tempdir().expect("tempdir should be created");
    let output = run_httpdvr(["mode"], dir.path(), &[("HTTPDVR_RECORD", "maybe")]);
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("HTTPDVR_RECORD"), "{stderr}");
}
