mod common;

use std::fs;
use std::path::Path;

use dpf_net::mock::MockEngine;
use dpf_net::Error;

use common::{local, on_both_transports};

fn binary_payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 31 % 251) as u8).collect()
}

fn write(path: &Path, data: &[u8]) {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).unwrap();
    }
    fs::write(path, data).unwrap();
}

#[test]
fn upload_then_download_reproduces_bytes() {
    on_both_transports(MockEngine::new, |engine, session| {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("result.rst");
        let data = binary_payload(1_300_000);
        write(&source, &data);

        let remote = session.upload_file(&source, "/data/result.rst", false).unwrap();
        assert_eq!(remote, "/data/result.rst");
        assert_eq!(engine.file(&remote).unwrap(), data);

        let back = dir.path().join("back.rst");
        session.download_file(&remote, &back).unwrap();
        assert_eq!(fs::read(&back).unwrap(), data);
    });
}

#[test]
fn upload_to_tmp_dir() {
    on_both_transports(MockEngine::new, |engine, session| {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("model.bin");
        write(&source, b"model");
        let tmp = session.make_tmp_dir().unwrap();
        assert_eq!(session.make_tmp_dir().unwrap(), tmp);
        let remote = session.upload_file(&source, "model.bin", true).unwrap();
        assert_eq!(remote, format!("{}/model.bin", tmp));
        assert_eq!(engine.file(&remote).unwrap(), b"model".to_vec());
    });
}

#[test]
fn empty_file_is_refused_before_sending() {
    let (engine, session) = local(MockEngine::new());
    let dir = tempfile::tempdir().unwrap();
    let source = dir.path().join("empty.txt");
    write(&source, b"");
    let before = session.stats();
    match session.upload_file(&source, "/data/empty.txt", false) {
        Err(Error::EmptyFile(path)) => assert!(path.ends_with("empty.txt")),
        other => panic!("unexpected: {:?}", other),
    }
    assert_eq!(session.stats(), before);
    assert!(engine.file_paths().is_empty());
}

#[test]
fn failed_download_leaves_nothing_behind() {
    let (_, session) = local(MockEngine::new());
    let dir = tempfile::tempdir().unwrap();
    let target = dir.path().join("missing.bin");
    assert!(matches!(
        session.download_file("/data/missing.bin", &target),
        Err(Error::ServerError(_))
    ));
    assert!(!target.exists());
}

#[test]
fn folder_round_trip_with_extension_filter() {
    on_both_transports(MockEngine::new, |engine, session| {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src");
        write(&src.join("a.txt"), b"alpha");
        write(&src.join("b.bin"), &binary_payload(2048));
        write(&src.join("sub").join("c.txt"), b"gamma");
        write(&src.join("skipped.txt"), b"");

        let uploaded = session.upload_files_in_folder("/data/in", &src, None).unwrap();
        assert_eq!(
            uploaded,
            vec![
                "/data/in/a.txt".to_string(),
                "/data/in/b.bin".to_string(),
                "/data/in/sub/c.txt".to_string(),
            ]
        );
        assert!(engine.file("/data/in/skipped.txt").is_none());

        let out = dir.path().join("out");
        let written = session
            .download_files_in_folder("/data/in", &out, Some("txt"))
            .unwrap();
        assert_eq!(written, vec![out.join("a.txt"), out.join("sub").join("c.txt")]);
        assert_eq!(fs::read(out.join("a.txt")).unwrap(), b"alpha".to_vec());
        assert_eq!(fs::read(out.join("sub").join("c.txt")).unwrap(), b"gamma".to_vec());
        assert!(!out.join("b.bin").exists());

        let all = dir.path().join("all");
        let written = session.download_files_in_folder("/data/in", &all, None).unwrap();
        assert_eq!(written.len(), 3);
        assert_eq!(fs::read(all.join("b.bin")).unwrap(), binary_payload(2048));
    });
}

#[test]
fn folder_download_is_version_gated() {
    let (_, session) = local(MockEngine::new().with_version("1.5"));
    let dir = tempfile::tempdir().unwrap();
    assert!(matches!(
        session.download_files_in_folder("/data", dir.path(), None),
        Err(Error::VersionUnsupported { .. })
    ));
}

#[test]
fn plugin_code_generation() {
    on_both_transports(MockEngine::new, |_, session| {
        let dir = tempfile::tempdir().unwrap();
        let files = session
            .load_library_and_generate("/plugins/libmech.so", "mech", None, dir.path())
            .unwrap();
        assert_eq!(
            files,
            vec![
                dir.path().join("__init__.txt"),
                dir.path().join("operators").join("mech_op.txt"),
            ]
        );
        let generated = fs::read_to_string(&files[1]).unwrap();
        assert!(generated.contains("/plugins/libmech.so"));
    });
}

#[test]
fn plugin_without_path_fails_to_load() {
    let (_, session) = local(MockEngine::new());
    let dir = tempfile::tempdir().unwrap();
    assert!(matches!(
        session.load_library_and_generate("", "mech", None, dir.path()),
        Err(Error::ServerError(_))
    ));
}
