// bw-test-utils: shared test scaffolding for the control-plane suites.
//
// Provides a scripted fleet client (poses as a client runtime against a real
// server) and a scripted controller (poses as a server against a real client
// link), both speaking the line protocol over TLS.

pub mod mock_client;
pub mod mock_server;

pub use mock_client::MockFleetClient;
pub use mock_server::MockController;

use std::path::Path;

/// Drop a fake WAV file of `len` bytes into `dir`.
pub fn write_wav(dir: &Path, name: &str, len: usize) {
    let mut bytes = b"RIFF".to_vec();
    bytes.resize(len.max(4), 0x11);
    std::fs::write(dir.join(name), bytes).expect("write test wav");
}
