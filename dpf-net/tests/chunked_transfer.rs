//! Runs in its own test binary since it changes the process-wide chunk size.

mod common;

use std::fs;

use dpf_core::update_runtime_config;
use dpf_net::mock::MockEngine;

use common::on_both_transports;

const MIB: usize = 1 << 20;
const CHUNK: usize = 1024;

#[test]
fn one_mib_in_1024_byte_frames() {
    update_runtime_config(|c| c.default_file_chunk_size = CHUNK as u64).unwrap();

    on_both_transports(MockEngine::new, |engine, session| {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("payload.bin");
        let data = (0..MIB).map(|i| (i % 253) as u8).collect::<Vec<_>>();
        fs::write(&source, &data).unwrap();

        let before = session.stats();
        let remote = session.upload_file(&source, "/data/payload.bin", false).unwrap();
        let after_upload = session.stats();
        assert_eq!(
            after_upload.outbound_chunks - before.outbound_chunks,
            (MIB / CHUNK) as u64
        );
        assert_eq!(engine.file(&remote).unwrap().len(), MIB);

        let back = dir.path().join("back.bin");
        session.download_file(&remote, &back).unwrap();
        let after_download = session.stats();
        assert_eq!(
            after_download.inbound_chunks - after_upload.inbound_chunks,
            (MIB / CHUNK) as u64
        );
        assert_eq!(fs::read(&back).unwrap(), data);
    });
}
