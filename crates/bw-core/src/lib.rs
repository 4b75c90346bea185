// bw-core: runtime pieces shared by the server and client services.
//
// Everything here is transport-free: filename hygiene, WAV bookkeeping,
// lifecycle handler scripts, the queue state machine, log fan-out, and TLS
// material generation.

pub mod files;
pub mod handlers;
pub mod logfan;
pub mod paths;
pub mod queue;
pub mod tlsgen;

pub use logfan::LogFan;
pub use paths::SecurityError;
